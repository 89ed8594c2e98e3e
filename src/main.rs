//! LUCID agent daemon entry point

use lucid_agent_core::agent::{SessionClock, ShutdownSignals};
use lucid_agent_core::commands::{CoreServices, RuntimeSettings};
use lucid_agent_core::components::ComponentFactoryRegistry;
use lucid_agent_core::config::BootstrapConfig;
use lucid_agent_core::lifecycle::{PipPackageManager, RestartCoordinator, SigtermSignaller};
use lucid_agent_core::observability::{init_default_logging, LoggingHandles};
use lucid_agent_core::protocol::snapshots::MetricsSampler;
use lucid_agent_core::storage::{ConfigStore, Registry};
use lucid_agent_core::{AgentError, AgentResult, MqttClient, Runtime, TopicSchema};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// LUCID device agent
#[derive(Parser)]
#[command(name = "lucid-agent-core")]
#[command(about = "LUCID device agent: MQTT session, snapshots, telemetry and component lifecycle")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "LUCID_AGENT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the broker and serve commands until SIGINT or SIGTERM
    Run,
    /// Validate the bootstrap configuration
    Config {
        /// Print the parsed configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let logging = match init_default_logging() {
        Ok(handles) => handles,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            process::exit(1);
        }
    };

    info!(version = env!("CARGO_PKG_VERSION"), "Starting LUCID agent");

    let config = match load_configuration(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run => run_agent(config, logging).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: &Option<PathBuf>) -> AgentResult<BootstrapConfig> {
    match config_path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(BootstrapConfig::load_from_file(path)?)
        }
        None => {
            let default_paths = ["agent.toml", "config/agent.toml", "/etc/lucid/agent.toml"];
            for path_str in default_paths {
                let path = PathBuf::from(path_str);
                if path.exists() {
                    info!("Loading configuration from: {}", path.display());
                    return Ok(BootstrapConfig::load_from_file(&path)?);
                }
            }
            Err(AgentError::invalid_input(
                "no configuration file found; pass -c/--config or create agent.toml",
            ))
        }
    }
}

/// Wire every collaborator from the bootstrap config
fn build_services(config: &BootstrapConfig, logging: &LoggingHandles) -> AgentResult<CoreServices> {
    let paths = config.resolve_paths();
    paths
        .ensure_dirs()
        .map_err(|e| AgentError::internal_error(format!("cannot create agent directories: {e}")))?;
    info!(base_dir = %paths.base_dir().display(), "Agent directories ready");

    let config_store = Arc::new(ConfigStore::new(paths.config_path()));
    let cfg = config_store.load()?;
    if let Some(level) = config_store.log_level() {
        if let Err(e) = logging.log_level.apply(&level) {
            warn!(level = %level, error = %e, "Ignoring stored log level");
        }
    }
    logging
        .logs_enabled
        .store(config_store.logs_enabled(), Ordering::Relaxed);
    info!(keys = cfg.len(), "Runtime config loaded");

    let restart = RestartCoordinator::from_env(
        paths.restart_sentinel_path(),
        Duration::from_secs(config.runtime.restart_debounce_secs),
        config.runtime.assume_supervised,
        Arc::new(SigtermSignaller),
    );
    if !restart.is_supervised() {
        warn!("No service supervisor detected, restart requests will be refused");
    }

    Ok(CoreServices {
        topics: TopicSchema::new(&config.agent.id)?,
        version: config.version(),
        config_store,
        registry: Registry::new(paths.registry_path()),
        lifecycle_settings: config.lifecycle_settings(),
        factories: Arc::new(ComponentFactoryRegistry::builtin()),
        package_manager: Arc::new(PipPackageManager::new(config.package_manager_path(&paths))),
        restart: Arc::new(restart),
        session: Arc::new(SessionClock::new()),
        sampler: Arc::new(MetricsSampler::new()),
        log_level: Some(logging.log_level.clone()),
        logs_enabled: logging.logs_enabled.clone(),
        settings: RuntimeSettings {
            worker_pool_size: config.runtime.worker_pool_size,
            telemetry_tick: Duration::from_millis(config.runtime.telemetry_tick_ms),
            bootstrap_heartbeat_s: config.mqtt.heartbeat_interval_secs,
        },
    })
}

async fn run_agent(config: BootstrapConfig, logging: LoggingHandles) -> AgentResult<()> {
    info!(agent_id = %config.agent.id, "Application starting");

    let services = build_services(&config, &logging)?;
    let transport = MqttClient::new(
        services.topics.clone(),
        config.mqtt.clone(),
        services.session.clone(),
    )
    .map_err(|e| AgentError::TransportError(Box::new(e)))?;

    // registered before start so a signal during connect is buffered
    let mut signals = ShutdownSignals::install()
        .map_err(|e| AgentError::internal_error(format!("cannot install signal handlers: {e}")))?;

    let mut runtime = Runtime::new(transport, services).with_log_stream(logging.log_stream);
    runtime.start().await?;

    info!("Agent is running and waiting for commands on MQTT...");

    let received = signals.recv().await;
    info!(signal = received, "Shutting down gracefully...");

    runtime.shutdown().await?;
    Ok(())
}

fn handle_config_command(config: &BootstrapConfig, show: bool) -> AgentResult<()> {
    if show {
        let rendered = toml::to_string_pretty(config)
            .map_err(|e| AgentError::internal_error(format!("cannot render configuration: {e}")))?;
        println!("{rendered}");
    }
    info!(agent_id = %config.agent.id, "Configuration is valid");
    Ok(())
}
