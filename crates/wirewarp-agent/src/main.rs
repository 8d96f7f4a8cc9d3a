//! wirewarp-agent: remotely controlled WireGuard server or gateway.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use wirewarp_agent::backend::{SharedBackend, SystemBackend};
use wirewarp_agent::channel::ControlChannel;
use wirewarp_agent::config::{AgentConfig, AgentMode, StateStore, DEFAULT_CONFIG_PATH};
use wirewarp_agent::executor::CommandExecutor;
use wirewarp_agent::handlers::{self, Role};

#[derive(Parser, Debug)]
#[command(name = "wirewarp-agent", version, about = "WireWarp tunnel agent")]
struct Cli {
    /// Agent mode: server or client (required on first run)
    #[arg(long)]
    mode: Option<AgentMode>,

    /// Path to the agent config file
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Control server URL, e.g. https://wirewarp.example.com
    #[arg(long)]
    url: Option<String>,

    /// Registration token (first run only)
    #[arg(long)]
    token: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let store = Arc::new(open_store(&cli)?);
    let mode = store.read(|cfg| cfg.mode);
    info!(version = env!("CARGO_PKG_VERSION"), %mode, "starting wirewarp-agent");

    let backend: SharedBackend = Arc::new(SystemBackend);
    let role = Role::new(mode, store.clone(), backend);
    role.restore_blocking().await;

    let mut exec = CommandExecutor::new();
    role.register(&mut exec);
    handlers::register_update(&mut exec, store.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    ControlChannel::new(store, Arc::new(exec))
        .run(shutdown_rx)
        .await;

    role.shutdown_blocking().await;
    info!("wirewarp-agent stopped");
    Ok(())
}

/// Load the persisted record, or write the first one from flags.
fn open_store(cli: &Cli) -> anyhow::Result<StateStore> {
    if cli.config.exists() {
        return StateStore::open(&cli.config)
            .with_context(|| format!("failed to load config {}", cli.config.display()));
    }

    let (Some(mode), Some(url), Some(token)) = (cli.mode, cli.url.as_deref(), cli.token.as_deref())
    else {
        bail!("first run requires --mode, --url and --token");
    };
    let cfg = AgentConfig::bootstrap(mode, url, token);
    cfg.save(&cli.config)
        .with_context(|| format!("failed to save initial config {}", cli.config.display()))?;
    info!(path = %cli.config.display(), "config saved");
    Ok(StateStore::new(&cli.config, cfg))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
