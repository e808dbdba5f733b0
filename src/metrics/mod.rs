//! Prometheus metrics for the playbook execution engine.
//!
//! Metrics live in a process-wide registry and are exported in the Prometheus text format by
//! [`gather_metrics`].
//!
//! ```no_run
//! use soar_engine::metrics;
//!
//! metrics::init_metrics().unwrap();
//! println!("{}", metrics::gather_metrics());
//! ```

use lazy_static::lazy_static;
use once_cell::sync::OnceCell;
use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, IntGauge, Opts, Registry};

const NAMESPACE: &str = "soar_engine";

lazy_static! {
    /// Global Prometheus registry for all metrics
    pub static ref PROMETHEUS_REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Execution Metrics
    // ============================================================================

    /// Executions that reached a terminal state
    ///
    /// Labels: mode, status
    pub static ref EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("executions_total", "Total number of finished playbook executions")
            .namespace(NAMESPACE),
        &["mode", "status"]
    ).expect("Failed to create EXECUTIONS_TOTAL metric");

    /// Wall-clock duration of finished executions, approval waits included
    ///
    /// Labels: mode
    pub static ref EXECUTION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "execution_duration_seconds",
            "Playbook execution duration in seconds"
        )
        .namespace(NAMESPACE)
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]),
        &["mode"]
    ).expect("Failed to create EXECUTION_DURATION_SECONDS metric");

    /// Executions currently owned by a worker
    pub static ref EXECUTIONS_ACTIVE: IntGauge = IntGauge::with_opts(
        Opts::new("executions_active", "Executions currently driven by a worker")
            .namespace(NAMESPACE)
    ).expect("Failed to create EXECUTIONS_ACTIVE metric");

    // ============================================================================
    // Action Metrics
    // ============================================================================

    /// Resolved actions
    ///
    /// Labels: action_type, status
    pub static ref ACTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("actions_total", "Total number of resolved actions")
            .namespace(NAMESPACE),
        &["action_type", "status"]
    ).expect("Failed to create ACTIONS_TOTAL metric");

    /// Dispatch duration including retries
    ///
    /// Labels: action_type
    pub static ref ACTION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("action_duration_seconds", "Action dispatch duration in seconds")
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]),
        &["action_type"]
    ).expect("Failed to create ACTION_DURATION_SECONDS metric");

    /// Retries performed after a failed attempt
    ///
    /// Labels: action_type
    pub static ref ACTION_RETRIES_TOTAL: CounterVec = CounterVec::new(
        Opts::new("action_retries_total", "Total number of action retries")
            .namespace(NAMESPACE),
        &["action_type"]
    ).expect("Failed to create ACTION_RETRIES_TOTAL metric");

    // ============================================================================
    // Approval Metrics
    // ============================================================================

    /// Gates awaiting a decision
    pub static ref APPROVALS_PENDING: IntGauge = IntGauge::with_opts(
        Opts::new("approvals_pending", "Approval gates awaiting a decision")
            .namespace(NAMESPACE)
    ).expect("Failed to create APPROVALS_PENDING metric");

    /// Resolved gates
    ///
    /// Labels: outcome (approved, rejected, expired)
    pub static ref APPROVALS_RESOLVED_TOTAL: CounterVec = CounterVec::new(
        Opts::new("approvals_resolved_total", "Total number of resolved approval gates")
            .namespace(NAMESPACE),
        &["outcome"]
    ).expect("Failed to create APPROVALS_RESOLVED_TOTAL metric");

    // ============================================================================
    // Error & System Metrics
    // ============================================================================

    /// Errors by type and component
    ///
    /// Labels: error_type, component
    pub static ref ERRORS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("errors_total", "Total number of errors").namespace(NAMESPACE),
        &["error_type", "component"]
    ).expect("Failed to create ERRORS_TOTAL metric");

    /// Build information
    ///
    /// Labels: version
    pub static ref BUILD_INFO: GaugeVec = GaugeVec::new(
        Opts::new("build_info", "Build information").namespace(NAMESPACE),
        &["version"]
    ).expect("Failed to create BUILD_INFO metric");
}

static INITIALIZED: OnceCell<()> = OnceCell::new();

/// Register every metric with the global registry.
///
/// Safe to call more than once; only the first call registers.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    INITIALIZED.get_or_try_init(|| -> Result<(), prometheus::Error> {
        PROMETHEUS_REGISTRY.register(Box::new(EXECUTIONS_TOTAL.clone()))?;
        PROMETHEUS_REGISTRY.register(Box::new(EXECUTION_DURATION_SECONDS.clone()))?;
        PROMETHEUS_REGISTRY.register(Box::new(EXECUTIONS_ACTIVE.clone()))?;

        PROMETHEUS_REGISTRY.register(Box::new(ACTIONS_TOTAL.clone()))?;
        PROMETHEUS_REGISTRY.register(Box::new(ACTION_DURATION_SECONDS.clone()))?;
        PROMETHEUS_REGISTRY.register(Box::new(ACTION_RETRIES_TOTAL.clone()))?;

        PROMETHEUS_REGISTRY.register(Box::new(APPROVALS_PENDING.clone()))?;
        PROMETHEUS_REGISTRY.register(Box::new(APPROVALS_RESOLVED_TOTAL.clone()))?;

        PROMETHEUS_REGISTRY.register(Box::new(ERRORS_TOTAL.clone()))?;
        PROMETHEUS_REGISTRY.register(Box::new(BUILD_INFO.clone()))?;

        BUILD_INFO
            .with_label_values(&[env!("CARGO_PKG_VERSION")])
            .set(1.0);

        tracing::info!("Prometheus metrics initialized successfully");
        Ok(())
    })?;
    Ok(())
}

/// Generate Prometheus text format metrics
pub fn gather_metrics() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = PROMETHEUS_REGISTRY.gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|e| {
        tracing::error!("Failed to convert metrics to string: {}", e);
        String::from("# Error converting metrics\n")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_metrics().unwrap();
        init_metrics().unwrap();
    }

    #[test]
    fn test_action_metrics() {
        ACTIONS_TOTAL
            .with_label_values(&["block_ip", "completed"])
            .inc();

        let value = ACTIONS_TOTAL
            .with_label_values(&["block_ip", "completed"])
            .get();
        assert!(value >= 1.0);
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().unwrap();
        EXECUTIONS_TOTAL
            .with_label_values(&["simulation", "completed"])
            .inc();

        let metrics = gather_metrics();
        assert!(metrics.contains("soar_engine_executions_total"));
        assert!(metrics.contains("soar_engine_build_info"));
    }
}
