//! Bridges a running push to its SSH channel.
//!
//! Client data arrives through the session handler's `data` callback and is
//! written into an in-memory duplex pipe; the push reads the other end.  The
//! receive process's output goes into two more pipes whose read halves are
//! forwarded to the channel through a [`ChannelSink`].

use std::future::Future;
use std::time::Instant;

use russh::server::Handle;
use russh::{ChannelId, CryptoVec};
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::push::{PreparedPush, PushError};
use crate::metrics::{MetricsRegistry, PushOutcome};

/// Capacity of each in-memory pipe between the channel and the process.
pub(crate) const PIPE_CAPACITY: usize = 256 * 1024;

/// SSH extended data type for stderr (RFC 4254 section 5.2).
const EXTENDED_DATA_STDERR: u32 = 1;

/// The channel no longer accepts messages.
#[derive(Debug)]
pub(crate) struct ChannelGone;

/// The outbound half of one SSH channel.
#[async_trait::async_trait]
pub(crate) trait ChannelSink: Send + Sync {
    async fn data(&self, data: CryptoVec) -> Result<(), ChannelGone>;
    async fn extended_data(&self, code: u32, data: CryptoVec) -> Result<(), ChannelGone>;
    async fn exit_status(&self, status: u32) -> Result<(), ChannelGone>;
    async fn eof(&self) -> Result<(), ChannelGone>;
    async fn close(&self) -> Result<(), ChannelGone>;
}

/// A session [`Handle`] bound to one of its channels.
pub(crate) struct ChannelOutput {
    handle: Handle,
    channel: ChannelId,
}

impl ChannelOutput {
    pub(crate) fn new(handle: Handle, channel: ChannelId) -> Self {
        Self { handle, channel }
    }
}

#[async_trait::async_trait]
impl ChannelSink for ChannelOutput {
    async fn data(&self, data: CryptoVec) -> Result<(), ChannelGone> {
        self.handle
            .data(self.channel, data)
            .await
            .map_err(|_| ChannelGone)
    }

    async fn extended_data(&self, code: u32, data: CryptoVec) -> Result<(), ChannelGone> {
        self.handle
            .extended_data(self.channel, code, data)
            .await
            .map_err(|_| ChannelGone)
    }

    async fn exit_status(&self, status: u32) -> Result<(), ChannelGone> {
        self.handle
            .exit_status_request(self.channel, status)
            .await
            .map_err(|_| ChannelGone)
    }

    async fn eof(&self) -> Result<(), ChannelGone> {
        self.handle.eof(self.channel).await.map_err(|_| ChannelGone)
    }

    async fn close(&self) -> Result<(), ChannelGone> {
        self.handle.close(self.channel).await.map_err(|_| ChannelGone)
    }
}

/// Run `push` in the background and close the channel when it finishes.
pub(crate) fn spawn_push<S>(
    tracker: &TaskTracker,
    metrics: MetricsRegistry,
    sink: S,
    push: PreparedPush,
    stdin: DuplexStream,
) where
    S: ChannelSink + 'static,
{
    tracker.spawn(async move {
        let repo = push.repo().path().to_string();
        let started = Instant::now();

        let result = drive(&sink, |stdout, stderr| push.run(stdin, stdout, stderr)).await;

        metrics
            .metrics
            .push_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                metrics.metrics.record_push(PushOutcome::Success);
                info!(repo = %repo, "push complete");
            }
            Err(e) => {
                metrics.metrics.record_push(e.outcome());
                warn!(repo = %repo, error = %e, "push failed");
            }
        }
    });
}

/// Run a process body against the channel behind `sink` and finish it.
///
/// `run` gets the write halves of the stdout and stderr pipes.  Both are
/// forwarded to the end before anything else is sent.  A successful run
/// reports exit status 0 before EOF and close; a failed one closes the
/// channel without an exit status.
async fn drive<S, F, Fut>(sink: &S, run: F) -> Result<(), PushError>
where
    S: ChannelSink,
    F: FnOnce(DuplexStream, DuplexStream) -> Fut,
    Fut: Future<Output = Result<(), PushError>>,
{
    let (stdout, stdout_rx) = tokio::io::duplex(PIPE_CAPACITY);
    let (stderr, stderr_rx) = tokio::io::duplex(PIPE_CAPACITY);

    let (result, (), ()) = tokio::join!(
        run(stdout, stderr),
        forward(sink, None, stdout_rx),
        forward(sink, Some(EXTENDED_DATA_STDERR), stderr_rx),
    );

    if result.is_ok() && sink.exit_status(0).await.is_err() {
        debug!("channel gone before exit status");
    }
    let _ = sink.eof().await;
    let _ = sink.close().await;

    result
}

/// Copy `reader` to the channel until EOF.
///
/// Once the channel refuses data the rest is read and discarded so the
/// process never blocks on a full pipe.
async fn forward<S: ChannelSink>(
    sink: &S,
    extended: Option<u32>,
    mut reader: DuplexStream,
) {
    let mut buf = vec![0u8; 32 * 1024];
    let mut open = true;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "output pipe read failed");
                break;
            }
        };
        if !open {
            continue;
        }

        let data = CryptoVec::from_slice(&buf[..n]);
        let sent = match extended {
            Some(code) => sink.extended_data(code, data).await,
            None => sink.data(data).await,
        };
        if sent.is_err() {
            debug!(?extended, "channel closed; discarding remaining output");
            open = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
