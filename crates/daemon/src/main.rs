//! RemoCLI Daemon
//!
//! Headless service exposing sandboxed file operations to remote clients.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use daemon::config::{default_config_path, Config};
use daemon::orchestrator::{DaemonOrchestrator, OrchestratorEvent};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// RemoCLI Daemon - RPC and file transfer service for remote CLI clients.
#[derive(Parser, Debug)]
#[command(name = "remocli-daemon")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the daemon.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the RemoCLI daemon
    Start {
        /// Override the storage root directory
        #[arg(long, value_name = "DIR")]
        storage_root: Option<PathBuf>,

        /// Override the RPC listen address
        #[arg(long, value_name = "ADDR")]
        rpc_listen: Option<String>,

        /// Override the transfer listen address
        #[arg(long, value_name = "ADDR")]
        transfer_listen: Option<String>,
    },

    /// Validate the configuration and print the effective values
    CheckConfig,

    /// Write a default configuration file with a generated auth token
    InitConfig {
        /// Overwrite an existing file
        #[arg(long, short)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Start {
            storage_root,
            rpc_listen,
            transfer_listen,
        } => {
            let mut config = load_config(&config_path)?;
            if let Some(root) = storage_root {
                config.transfer.storage_root_path = root;
            }
            if let Some(addr) = rpc_listen {
                config.network.rpc_listen = addr;
            }
            if let Some(addr) = transfer_listen {
                config.network.transfer_listen = addr;
            }
            config.validate()?;

            let _guard = init_tracing(&config, cli.verbose)?;
            tracing::info!(config = %config_path.display(), "RemoCLI daemon starting...");

            let mut orchestrator = DaemonOrchestrator::new(config)?;
            run_headless(&mut orchestrator).await?;
        }
        Commands::CheckConfig => {
            let config = load_config(&config_path)?;
            config.validate()?;
            println!("Configuration OK: {}", config_path.display());
            println!();
            print!("{}", redact_tokens(&config).to_toml()?);
        }
        Commands::InitConfig { force } => init_config(&config_path, force)?,
    }

    Ok(())
}

/// Load the file (defaults if missing) and apply environment overrides.
fn load_config(path: &Path) -> anyhow::Result<Config> {
    let mut config = Config::load(path)?;
    config.apply_env_overrides();
    Ok(config)
}

/// Install the global subscriber: stderr always, plus a daily rolling file when
/// `log_file` is set. The returned guard flushes the file writer on drop.
fn init_tracing(config: &Config, verbose: bool) -> anyhow::Result<Option<WorkerGuard>> {
    let level = if verbose {
        "debug".to_string()
    } else {
        config.daemon.log_level.to_lowercase()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let (file_layer, guard) = match &config.daemon.log_file {
        Some(path) => {
            let directory = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .with_context(|| format!("Invalid log file path: {}", path.display()))?;
            std::fs::create_dir_all(directory)
                .with_context(|| format!("Failed to create log directory: {}", directory.display()))?;

            let appender = tracing_appender::rolling::daily(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(guard)
}

/// Write a default configuration with one freshly generated token.
fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    let mut config = Config::default();
    let token = uuid::Uuid::new_v4().simple().to_string();
    config.security.auth_tokens = vec![token.clone()];
    config.save(path)?;

    println!("Wrote {}", path.display());
    println!("Auth token: {token}");
    Ok(())
}

/// Copy of `config` safe to print.
fn redact_tokens(config: &Config) -> Config {
    let mut redacted = config.clone();
    redacted.security.auth_tokens = redacted
        .security
        .auth_tokens
        .iter()
        .map(|_| "<redacted>".to_string())
        .collect();
    redacted
}

/// Run the daemon in headless mode (no UI, just logging).
async fn run_headless(orchestrator: &mut DaemonOrchestrator) -> anyhow::Result<()> {
    // Subscribe before starting so the bind events are seen
    let mut events = orchestrator.subscribe();

    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                OrchestratorEvent::StateChanged(state) => {
                    tracing::info!("Orchestrator state: {:?}", state);
                }
                OrchestratorEvent::ListenerBound { listener, addr } => {
                    tracing::debug!(?listener, %addr, "Listener ready");
                }
            }
        }
    });

    orchestrator.start().await?;

    // Wait for shutdown signal (SIGTERM or SIGINT)
    wait_for_shutdown_signal().await?;
    tracing::info!("Received shutdown signal");

    orchestrator.stop().await?;

    Ok(())
}

/// Wait for a shutdown signal (SIGTERM or SIGINT).
#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT");
        }
    }
    Ok(())
}

/// Wait for a shutdown signal (Ctrl-C).
#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")
}
