use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Orchestrator configuration
    #[serde(default)]
    pub engine: EngineConfig,

    /// Default retry/backoff policy
    #[serde(default)]
    pub retry: RetryDefaults,

    /// Approval gate configuration
    #[serde(default)]
    pub approval: ApprovalConfig,

    /// Execution record persistence
    #[serde(default)]
    pub state: StateConfig,

    /// Live-mode connector endpoints
    #[serde(default)]
    pub connectors: ConnectorsConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Test harness configuration
    #[serde(default)]
    pub harness: HarnessConfig,
}

impl Config {
    /// Load configuration from the embedded defaults, an optional file and the environment
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("SOAR_CONFIG").unwrap_or_else(|_| "config/soar.toml".to_string());
        Self::load_from(&config_path)
    }

    /// Same layering as [`Config::load`] with an explicit file path
    pub fn load_from(config_path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            // Start with default values
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            // Override with config file if it exists
            .add_source(config::File::with_name(config_path).required(false))
            // Override with environment variables (SOAR_SECTION__KEY)
            .add_source(
                config::Environment::with_prefix("SOAR")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Per-action timeout used when the action does not set one (seconds)
    #[serde(default = "default_action_timeout")]
    pub default_action_timeout_secs: u64,

    /// Upper bound for a single `wait` action (seconds)
    #[serde(default = "default_max_wait")]
    pub max_wait_secs: u64,

    /// Capacity of the execution event bus
    #[serde(default = "default_event_capacity")]
    pub event_bus_capacity: usize,
}

impl EngineConfig {
    pub fn default_action_timeout(&self) -> Duration {
        Duration::from_secs(self.default_action_timeout_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_action_timeout_secs: default_action_timeout(),
            max_wait_secs: default_max_wait(),
            event_bus_capacity: default_event_capacity(),
        }
    }
}

/// Defaults applied to actions whose retry block leaves fields unset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDefaults {
    /// Attempts (including the first) when retry is enabled
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry (milliseconds)
    #[serde(default = "default_backoff_base")]
    pub backoff_base_ms: u64,

    /// Growth factor between consecutive retries
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Cap on a single backoff delay (milliseconds)
    #[serde(default = "default_backoff_max")]
    pub max_backoff_ms: u64,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_backoff_max(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    /// Auto-reject deadline for unresolved gates (seconds); `None` waits indefinitely
    #[serde(default = "default_approval_timeout")]
    pub timeout_secs: Option<u64>,

    /// How often the sweeper looks for expired gates (seconds); 0 disables it
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Principal -> roles map used by the static authorizer
    #[serde(default)]
    pub principals: HashMap<String, Vec<String>>,
}

impl ApprovalConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_approval_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            principals: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StateConfig {
    /// State backend type
    #[serde(default)]
    pub backend: StateBackend,

    /// Path for the embedded database (sled)
    pub path: Option<PathBuf>,
}

impl StateConfig {
    /// Whether executions outlive the process that created them
    pub fn is_persistent(&self) -> bool {
        self.backend != StateBackend::Memory
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StateBackend {
    #[default]
    Memory,
    Sled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorsConfig {
    /// Base URL per connector category (e.g. `firewall = "https://fw-gateway/api"`)
    #[serde(default)]
    pub endpoints: HashMap<String, String>,

    /// Bearer token environment variable sent with every connector call
    pub auth_token_env: Option<String>,

    /// Request timeout (seconds)
    #[serde(default = "default_connector_timeout")]
    pub timeout_secs: u64,
}

impl Default for ConnectorsConfig {
    fn default() -> Self {
        Self {
            endpoints: HashMap::new(),
            auth_token_env: None,
            timeout_secs: default_connector_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log filter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// Enable Prometheus metrics
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            prometheus_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Principal used to auto-resolve approval gates during simulation runs
    #[serde(default = "default_harness_approver")]
    pub approver: String,

    /// An action is a bottleneck when it takes this many times the mean action duration
    #[serde(default = "default_bottleneck_factor")]
    pub bottleneck_factor: f64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            approver: default_harness_approver(),
            bottleneck_factor: default_bottleneck_factor(),
        }
    }
}

// Default value functions
fn default_action_timeout() -> u64 {
    300
}

fn default_max_wait() -> u64 {
    3600
}

fn default_event_capacity() -> usize {
    1024
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_max() -> u64 {
    60_000
}

fn default_approval_timeout() -> Option<u64> {
    Some(3600)
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_connector_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "soar_engine=info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_harness_approver() -> String {
    "playbook-test-harness".to_string()
}

fn default_bottleneck_factor() -> f64 {
    2.0
}
