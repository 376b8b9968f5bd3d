//! SSH push gateway.
//!
//! Clients push over SSH (`git-receive-pack` through `git-shell`) into bare
//! repositories under a configured root.  Each repository carries a
//! post-receive hook that reports new revisions to the HTTP control plane,
//! which checks the revision out and hands the directory to a
//! [`RevisionHandler`].
//!
//! Embedders build an [`AppState`] with their own [`PushAuthorizer`] and
//! [`RevisionHandler`] and call [`start`].

pub mod auth;
pub mod config;
pub mod git;
pub mod health;
pub mod http;
pub mod metrics;
pub mod revision;
pub mod ssh;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

pub use crate::auth::{AllowAll, AuthorizedKeys, ConnectionIdentity, PushAuthorizer};
pub use crate::config::Config;
pub use crate::revision::{RevisionHandler, StaticResponse};

use crate::git::RepoStore;
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// State shared by both listeners and every connection.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repos: RepoStore,
    pub authorizer: Arc<dyn PushAuthorizer>,
    pub revision_handler: Arc<dyn RevisionHandler>,
    pub metrics: MetricsRegistry,
    /// SSH and HTTP connections plus hook work; [`start`] waits on these
    /// before returning.
    pub tasks: TaskTracker,
    /// Cancelled to stop both listeners.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: Config,
        authorizer: Arc<dyn PushAuthorizer>,
        revision_handler: Arc<dyn RevisionHandler>,
    ) -> Self {
        let repos = RepoStore::new(&config.repos.root, &config.repos.checkout_root);
        Self {
            config: Arc::new(config),
            repos,
            authorizer,
            revision_handler,
            metrics: MetricsRegistry::new(),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Verify existing repositories, then serve SSH and HTTP until
/// [`AppState::shutdown`] is cancelled or either listener fails.
///
/// In-flight pushes are allowed to finish before this returns.
pub async fn start(state: Arc<AppState>) -> Result<()> {
    info!(root = %state.config.repos.root.display(), "repository root");

    tokio::fs::create_dir_all(&state.config.repos.root)
        .await
        .with_context(|| {
            format!(
                "failed to create repository root {}",
                state.config.repos.root.display()
            )
        })?;

    git::prepare_repos(
        &state.repos,
        &state.config.api.address,
        state.config.api.port,
        state.config.repos.overwrite_post_receive,
    )
    .await?;

    let served = tokio::try_join!(
        http::serve(Arc::clone(&state)),
        ssh::start_ssh_server(Arc::clone(&state)),
    );

    state.shutdown.cancel();
    state.tasks.close();
    info!(connections = state.tasks.len(), "waiting for open connections to finish");
    state.tasks.wait().await;

    served.map(|_| ())
}
