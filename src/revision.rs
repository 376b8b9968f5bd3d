//! Callback invoked after a pushed revision has been checked out.

use std::path::Path;

/// Reacts to a freshly materialized checkout.
///
/// The returned text becomes the body of the hook endpoint's response, which
/// the post-receive script prints back to the pusher.
#[async_trait::async_trait]
pub trait RevisionHandler: Send + Sync {
    async fn on_revision(&self, checkout_dir: &Path) -> String;
}

/// Answers every revision with the same text.
#[derive(Debug, Clone)]
pub struct StaticResponse(pub String);

#[async_trait::async_trait]
impl RevisionHandler for StaticResponse {
    async fn on_revision(&self, checkout_dir: &Path) -> String {
        tracing::info!(dir = %checkout_dir.display(), "revision checked out");
        self.0.clone()
    }
}
