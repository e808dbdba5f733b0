use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::Value as JsonValue;
use soar_engine::{
    config::Config,
    connectors::{ConnectorRegistry, HttpConnectorRegistry, NoopConnectorRegistry},
    models::{ExecutionMode, ExecutionStatus},
    playbooks::{
        collect_issues, load_playbook_file, trigger_from_payload, HarnessMode, PlaybookService,
        TestHarness,
    },
};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "soar-engine")]
#[command(about = "Automated response playbook execution engine", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file layered over the embedded defaults
    #[arg(short, long, env = "SOAR_CONFIG", default_value = "config/soar.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Live,
    Test,
    Simulation,
}

impl From<ModeArg> for ExecutionMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Live => ExecutionMode::Live,
            ModeArg::Test => ExecutionMode::Test,
            ModeArg::Simulation => ExecutionMode::Simulation,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum HarnessArg {
    DryRun,
    Validation,
    Simulation,
    Performance,
}

impl From<HarnessArg> for HarnessMode {
    fn from(mode: HarnessArg) -> Self {
        match mode {
            HarnessArg::DryRun => HarnessMode::DryRun,
            HarnessArg::Validation => HarnessMode::Validation,
            HarnessArg::Simulation => HarnessMode::Simulation,
            HarnessArg::Performance => HarnessMode::Performance,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Register a playbook file and execute it
    Run {
        #[arg(short, long)]
        playbook: PathBuf,

        /// Trigger payload as inline JSON
        #[arg(short = 'd', long, default_value = "{}")]
        payload: String,

        #[arg(short, long, value_enum, default_value = "simulation")]
        mode: ModeArg,
    },

    /// Exercise a playbook through the test harness
    Test {
        #[arg(short, long)]
        playbook: PathBuf,

        #[arg(short = 'd', long, default_value = "{}")]
        payload: String,

        #[arg(short, long, value_enum, default_value = "simulation")]
        mode: HarnessArg,
    },

    /// Report structural problems in a playbook file
    Validate {
        #[arg(value_name = "PLAYBOOK")]
        playbook: PathBuf,
    },

    /// Show an execution record
    Status {
        #[arg(value_name = "EXECUTION_ID")]
        id: Uuid,
    },

    /// Resolve the approval gate of a suspended execution
    Approve {
        #[arg(value_name = "EXECUTION_ID")]
        id: Uuid,

        #[arg(short, long)]
        approver: String,

        /// Reject instead of approving
        #[arg(long)]
        reject: bool,

        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Cancel an execution
    Cancel {
        #[arg(value_name = "EXECUTION_ID")]
        id: Uuid,
    },

    /// Resume unfinished executions and expire overdue approval gates
    Recover,

    /// Print Prometheus metrics
    Metrics,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let config = Config::load_from(&cli.config).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        eprintln!("Using default configuration");
        Config::default()
    });

    init_tracing(&config);

    if config.observability.prometheus_enabled {
        if let Err(e) = soar_engine::metrics::init_metrics() {
            tracing::warn!("Failed to initialize metrics: {}", e);
        }
    }

    match cli.command {
        Commands::Run {
            playbook,
            payload,
            mode,
        } => {
            let mode = ExecutionMode::from(mode);
            let service = build_service(&config, mode)?;
            let playbook = load_playbook_file(&playbook)?;
            let playbook_id = playbook.id;
            service.register_playbook(playbook).await?;

            let trigger = trigger_from_payload(parse_payload(&payload)?);
            let execution = service
                .run_execution(playbook_id, None, trigger, mode)
                .await?;
            print_json(&execution)?;
            exit_for(execution.status);
        }

        Commands::Test {
            playbook,
            payload,
            mode,
        } => {
            let harness = TestHarness::in_memory(&config);
            let playbook = load_playbook_file(&playbook)?;
            let trigger = trigger_from_payload(parse_payload(&payload)?);

            let report = harness.run(&playbook, trigger, mode.into()).await?;
            print_json(&report)?;
            if !report.passed {
                std::process::exit(1);
            }
        }

        Commands::Validate { playbook } => {
            let harness = TestHarness::in_memory(&config);
            let playbook = load_playbook_file(&playbook)?;
            let registry = harness.orchestrator().dispatcher().registry();

            let issues = collect_issues(&playbook, Some(registry));
            for issue in &issues {
                println!("{:?}: {}", issue.severity, issue);
            }
            if issues.iter().any(|i| i.is_error()) {
                std::process::exit(1);
            }
            println!("Playbook '{}' is valid", playbook.name);
        }

        Commands::Status { id } => {
            let service = build_stateful_service(&config, ExecutionMode::Simulation)?;
            print_json(&service.get_execution(id).await?)?;
        }

        Commands::Approve {
            id,
            approver,
            reject,
            reason,
        } => {
            let service = build_stateful_service(&config, ExecutionMode::Live)?;
            service.resolve_approval(id, !reject, approver, reason).await?;
            let execution = service.wait_for_execution(id).await?;
            print_json(&execution)?;
            exit_for(execution.status);
        }

        Commands::Cancel { id } => {
            let service = build_stateful_service(&config, ExecutionMode::Simulation)?;
            service.cancel_execution(id).await?;
            print_json(&service.wait_for_execution(id).await?)?;
        }

        Commands::Recover => {
            let service = build_stateful_service(&config, ExecutionMode::Live)?;
            let orchestrator = service.orchestrator();

            let report = orchestrator.recover().await?;
            let expired = orchestrator.sweep_approval_timeouts().await;
            for id in &report.resumed {
                service.wait_for_execution(*id).await?;
            }

            #[derive(Serialize)]
            struct RecoverOutput<'a> {
                #[serde(flatten)]
                report: &'a soar_engine::playbooks::RecoveryReport,
                expired_approvals: Vec<Uuid>,
            }
            print_json(&RecoverOutput {
                report: &report,
                expired_approvals: expired,
            })?;
        }

        Commands::Metrics => {
            print!("{}", soar_engine::metrics::gather_metrics());
        }
    }

    Ok(())
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    // stdout carries command output
    if config.observability.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn build_service(config: &Config, mode: ExecutionMode) -> Result<PlaybookService, Box<dyn Error>> {
    let connectors: Arc<dyn ConnectorRegistry> = if mode == ExecutionMode::Live {
        Arc::new(HttpConnectorRegistry::from_config(&config.connectors)?)
    } else {
        Arc::new(NoopConnectorRegistry)
    };
    Ok(PlaybookService::from_config(config, connectors)?)
}

/// Service for commands that act on executions created by earlier invocations
fn build_stateful_service(
    config: &Config,
    mode: ExecutionMode,
) -> Result<PlaybookService, Box<dyn Error>> {
    if !config.state.is_persistent() {
        tracing::warn!(
            "State backend is in-memory; executions from earlier invocations are not visible"
        );
    }
    build_service(config, mode)
}

fn parse_payload(raw: &str) -> Result<JsonValue, Box<dyn Error>> {
    Ok(serde_json::from_str(raw)?)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn exit_for(status: ExecutionStatus) {
    match status {
        ExecutionStatus::Completed | ExecutionStatus::AwaitingApproval => {}
        _ => std::process::exit(1),
    }
}
