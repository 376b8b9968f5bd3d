//! Control-plane router and request handlers.
//!
//! Routes:
//! - `POST /hook/{*path}`   - Post-receive notification; body is the new revision
//! - `POST /create/{*path}` - Initialize a bare repository
//! - `GET  /healthz`        - Health check
//! - `GET  /metrics`        - Prometheus metrics

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use tower_http::timeout::RequestBodyTimeoutLayer;
use tracing::{error, info, instrument, warn};

use crate::git::normalize_repo_path;
use crate::metrics::CheckoutOutcome;
use crate::AppState;

/// Deadline for reading a request (headers and body).  Handlers themselves
/// run to completion.
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest accepted request body.
pub const MAX_BODY_BYTES: usize = 1 << 20;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the axum [`Router`] with all control-plane routes and shared state.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/hook/{*path}", post(handle_hook))
        .route("/create/{*path}", post(handle_create))
        .route("/healthz", get(crate::health::health_handler))
        .route("/metrics", get(handle_metrics))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(RequestBodyTimeoutLayer::new(READ_TIMEOUT))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `POST /hook/{path}`
///
/// Checks out the revision named in the body and returns whatever the
/// revision handler says about it.  The handler is not called when the
/// checkout fails.  The work runs on [`AppState::tasks`], so a client that
/// hangs up does not interrupt a checkout half way.
#[instrument(skip(state, body), fields(%path))]
async fn handle_hook(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
    body: Bytes,
) -> Result<Response, AppError> {
    let repo_path = normalize_repo_path(&path)
        .map_err(|e| AppError::BadRequest(format!("invalid repository path {path:?}: {e}")))?;
    let revision = String::from_utf8_lossy(&body).into_owned();

    let work = state.tasks.spawn({
        let state = Arc::clone(&state);
        async move { notify_revision(&state, &repo_path, &revision).await }
    });
    let message = work
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("hook task failed: {e}")))??;

    Ok((StatusCode::OK, message).into_response())
}

async fn notify_revision(
    state: &AppState,
    repo_path: &str,
    revision: &str,
) -> Result<String, AppError> {
    let repo = state.repos.open(repo_path);
    let dir = match repo.checkout(revision).await {
        Ok(dir) => {
            state.metrics.metrics.record_checkout(CheckoutOutcome::Success);
            dir
        }
        Err(e) => {
            state.metrics.metrics.record_checkout(CheckoutOutcome::Failure);
            return Err(AppError::BadRequest(format!(
                "failed to check out {:?} in {repo_path}: {e:#}",
                revision.trim()
            )));
        }
    };

    Ok(state.revision_handler.on_revision(&dir).await)
}

/// `POST /create/{path}`
///
/// 200 when a repository was created, 409 when one is already there.
#[instrument(skip(state), fields(%path))]
async fn handle_create(
    State(state): State<Arc<AppState>>,
    Path(path): Path<String>,
) -> Result<StatusCode, AppError> {
    let repo_path = normalize_repo_path(&path)
        .map_err(|e| AppError::BadRequest(format!("invalid repository path {path:?}: {e}")))?;

    let repo = state.repos.open(&repo_path);
    if repo.ready().await {
        info!(repo = %repo_path, "repository already exists");
        return Ok(StatusCode::CONFLICT);
    }

    repo.init(&state.config.api.address, state.config.api.port)
        .await
        .map_err(AppError::Internal)?;
    state.metrics.metrics.repositories_created_total.inc();

    Ok(StatusCode::OK)
}

/// `GET /metrics`
async fn handle_metrics(State(state): State<Arc<AppState>>) -> Result<Response, AppError> {
    let buf = state
        .metrics
        .encode()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("metrics encoding failed: {e}")))?;

    Ok((
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        buf,
    )
        .into_response())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Handler failures.  Details go to the log; responses carry only a status.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Internal(anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => {
                warn!(error = %msg, "bad request");
                StatusCode::BAD_REQUEST.into_response()
            }
            AppError::Internal(err) => {
                error!(error = %format!("{err:#}"), "internal server error");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
