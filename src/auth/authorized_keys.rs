//! OpenSSH `authorized_keys` backed [`PushAuthorizer`].

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;
use tracing::{debug, info, warn};

use super::{fingerprint_of, ConnectionIdentity, PushAuthorizer};

/// Admits a push only if the connection offered one of a fixed set of keys.
/// Every listed key may push to every repository.
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeys {
    keys: HashSet<String>,
}

impl AuthorizedKeys {
    /// Load an `authorized_keys` file.  Lines that do not hold a parsable key
    /// are skipped with a warning.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read authorized keys: {}", path.display()))?;
        let keys = Self::parse(&contents);
        info!(path = %path.display(), keys = keys.len(), "loaded authorized keys");
        Ok(keys)
    }

    pub fn parse(contents: &str) -> Self {
        let mut keys = HashSet::new();

        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            match parse_line(line) {
                Some(key) => {
                    keys.insert(key.public_key_base64());
                }
                None => warn!(line = lineno + 1, "skipping unparsable authorized key"),
            }
        }

        Self { keys }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.keys.contains(&key.public_key_base64())
    }
}

/// Find the `<type> <base64>` pair in a line, skipping any leading options.
fn parse_line(line: &str) -> Option<PublicKey> {
    let mut tokens = line.split_whitespace();
    while let Some(token) = tokens.next() {
        if is_key_type(token) {
            return russh_keys::parse_public_key_base64(tokens.next()?).ok();
        }
    }
    None
}

fn is_key_type(token: &str) -> bool {
    token.starts_with("ssh-") || token.starts_with("ecdsa-sha2-") || token.starts_with("sk-")
}

#[async_trait::async_trait]
impl PushAuthorizer for AuthorizedKeys {
    async fn authorize(
        &self,
        identity: &ConnectionIdentity,
        key: Option<&PublicKey>,
        repo: &str,
    ) -> bool {
        let Some(key) = key else {
            debug!(user = %identity.user, repo, "no key offered on this connection");
            return false;
        };

        let allowed = self.contains(key);
        info!(
            user = %identity.user,
            peer = ?identity.peer,
            fingerprint = %fingerprint_of(key),
            repo,
            allowed,
            "push authorization"
        );
        allowed
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
