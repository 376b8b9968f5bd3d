use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use pushgate::{config, AllowAll, AppState, AuthorizedKeys, PushAuthorizer, StaticResponse};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "pushgate", about = "SSH push gateway")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/pushgate/config.yaml")]
    config: PathBuf,

    /// Override `repos.root`.
    #[arg(long)]
    repo_root: Option<PathBuf>,

    /// Override `ssh.port`.
    #[arg(long)]
    ssh_port: Option<u16>,

    /// Override `api.port`.
    #[arg(long)]
    api_port: Option<u16>,

    /// Emit JSON log lines instead of human-readable ones.
    #[arg(long)]
    log_json: bool,
}

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    init_tracing(cli.log_json);

    // ---- Config ----
    let overrides = config::Overrides {
        repo_root: cli.repo_root.clone(),
        ssh_port: cli.ssh_port,
        api_port: cli.api_port,
    };
    let config = config::load_config(&cli.config, &overrides)?;

    tracing::info!(config_path = %cli.config.display(), "starting pushgate");

    // ---- Authorizer ----
    let authorizer: Arc<dyn PushAuthorizer> = match &config.auth.authorized_keys {
        Some(path) => Arc::new(AuthorizedKeys::load(path)?),
        None => {
            tracing::warn!("no auth.authorized_keys configured; every key may push");
            Arc::new(AllowAll)
        }
    };

    // ---- Revision handler ----
    let revision_handler = Arc::new(StaticResponse(config.revision.response.clone()));

    // ---- App state ----
    let state = Arc::new(AppState::new(config, authorizer, revision_handler));

    tokio::spawn({
        let shutdown = state.shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    pushgate::start(state).await?;

    tracing::info!("pushgate shut down cleanly");
    Ok(())
}
