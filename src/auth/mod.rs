//! Push authorization.
//!
//! The transport accepts any offered public key; whether that key may push
//! to a given repository is decided later by a [`PushAuthorizer`] supplied
//! by the embedding application.  The key offered during the handshake is
//! held per connection in a [`CredentialSlot`] until the first push on that
//! connection consumes it.

pub mod authorized_keys;

use std::net::SocketAddr;

use base64::Engine as _;
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use sha2::{Digest, Sha256};
use tracing::info;

pub use authorized_keys::AuthorizedKeys;

// ---------------------------------------------------------------------------
// Connection identity
// ---------------------------------------------------------------------------

/// Who is on the other end of one transport connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionIdentity {
    /// User name requested during authentication.
    pub user: String,
    pub peer: Option<SocketAddr>,
}

// ---------------------------------------------------------------------------
// Credential slot
// ---------------------------------------------------------------------------

/// The public key captured during one connection's handshake.
///
/// Read-once: [`consume`](Self::consume) hands the key out and leaves the
/// slot empty, so a later request on the same connection cannot reuse it.
#[derive(Default)]
pub struct CredentialSlot(Option<PublicKey>);

impl CredentialSlot {
    /// Record an offered key, replacing any earlier offer.
    pub fn capture(&mut self, key: PublicKey) {
        self.0 = Some(key);
    }

    pub fn consume(&mut self) -> Option<PublicKey> {
        self.0.take()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }
}

// ---------------------------------------------------------------------------
// Authorizer
// ---------------------------------------------------------------------------

/// Decides whether a connection may push to a repository.
#[async_trait::async_trait]
pub trait PushAuthorizer: Send + Sync {
    /// `repo` is the normalized, rooted repository path (e.g. `/team/app`).
    /// `key` is `None` when the connection's key was already consumed or
    /// none was offered.
    async fn authorize(
        &self,
        identity: &ConnectionIdentity,
        key: Option<&PublicKey>,
        repo: &str,
    ) -> bool;
}

/// Admits every push; logs who pushed where.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait::async_trait]
impl PushAuthorizer for AllowAll {
    async fn authorize(
        &self,
        identity: &ConnectionIdentity,
        key: Option<&PublicKey>,
        repo: &str,
    ) -> bool {
        let fingerprint = key.map(fingerprint_of).unwrap_or_else(|| "-".to_string());
        info!(
            user = %identity.user,
            peer = ?identity.peer,
            %fingerprint,
            repo,
            "admitting push"
        );
        true
    }
}

// ---------------------------------------------------------------------------
// Fingerprint helper
// ---------------------------------------------------------------------------

/// SHA-256 fingerprint of a public key in `ssh-keygen -l` form
/// (`SHA256:<base64, unpadded>`).
pub fn fingerprint_of(key: &PublicKey) -> String {
    let blob = base64::engine::general_purpose::STANDARD
        .decode(key.public_key_base64().as_bytes())
        .unwrap_or_default();
    let hash = Sha256::digest(&blob);
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{encoded}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
