//! HTTP control plane.
//!
//! Receives post-receive notifications from the repositories' hooks and
//! repository-creation requests from operators.

pub mod handler;

use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::AppState;

/// Largest accepted request head (request line plus headers).
pub const MAX_HEADER_BYTES: usize = 1 << 20;

/// Serve the control plane until [`AppState::shutdown`] is cancelled.
pub async fn serve(state: Arc<AppState>) -> Result<()> {
    let api = &state.config.api;
    let listener = TcpListener::bind((api.address.as_str(), api.port))
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}:{}", api.address, api.port))?;
    info!(address = %listener.local_addr()?, "starting HTTP control plane");

    serve_on(listener, state).await;

    info!("HTTP control plane stopped");
    Ok(())
}

/// Accept connections on `listener` until shutdown.
///
/// Each connection runs on [`AppState::tasks`]; on shutdown it finishes the
/// request in progress and then closes.
pub async fn serve_on(listener: TcpListener, state: Arc<AppState>) {
    let app = handler::create_router(Arc::clone(&state));

    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "failed to accept HTTP connection");
                    continue;
                }
            },
            () = state.shutdown.cancelled() => break,
        };

        let service = TowerToHyperService::new(app.clone());
        let shutdown = state.shutdown.clone();

        state.tasks.spawn(async move {
            let conn = http1::Builder::new()
                .timer(TokioTimer::new())
                .header_read_timeout(handler::READ_TIMEOUT)
                .max_buf_size(MAX_HEADER_BYTES)
                .serve_connection(TokioIo::new(stream), service);
            tokio::pin!(conn);

            let result = tokio::select! {
                result = conn.as_mut() => result,
                () = shutdown.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            };

            if let Err(e) = result {
                debug!(%peer, error = %e, "HTTP connection ended with error");
            }
        });
    }
}
