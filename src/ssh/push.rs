//! From an SSH exec payload to a running `git-receive-pack`.
//!
//! [`PushExecutor::prepare`] does every check that can refuse a push before
//! a process exists: payload shape, path normalization, authorization and
//! repository readiness.  [`PreparedPush::run`] then pumps the channel
//! streams through `git-shell`.

use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tracing::{info, instrument};

use crate::auth::{ConnectionIdentity, CredentialSlot, PushAuthorizer};
use crate::git::{normalize_repo_path, pump, PumpError, RepoPathError, RepoStore, Repository};
use crate::metrics::PushOutcome;

/// The only command accepted in an exec request.
pub const RECEIVE_PACK: &str = "git-receive-pack";

/// Environment variables exported to the receive process (and so to the
/// repository's hooks).
pub const ENV_RECEIVE_USER: &str = "RECEIVE_USER";
pub const ENV_RECEIVE_REPO: &str = "RECEIVE_REPO";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PushError {
    #[error("malformed exec request: {0:?}")]
    Malformed(String),

    #[error("invalid repository path {path:?}: {source}")]
    InvalidPath {
        path: String,
        #[source]
        source: RepoPathError,
    },

    #[error("{user} may not push to {repo}")]
    Unauthorized { user: String, repo: String },

    #[error("repository {0} is not initialized")]
    Uninitialized(String),

    #[error(transparent)]
    Pump(#[from] PumpError),
}

impl PushError {
    pub fn outcome(&self) -> PushOutcome {
        match self {
            Self::Malformed(_) | Self::InvalidPath { .. } => PushOutcome::Malformed,
            Self::Unauthorized { .. } => PushOutcome::Unauthorized,
            Self::Uninitialized(_) => PushOutcome::Uninitialized,
            Self::Pump(_) => PushOutcome::Failed,
        }
    }
}

// ---------------------------------------------------------------------------
// Payload parsing
// ---------------------------------------------------------------------------

/// Split an exec payload with shell quoting rules and return the requested
/// repository path.
///
/// Exactly two tokens are accepted, the first being [`RECEIVE_PACK`].
pub fn parse_exec_payload(payload: &[u8]) -> Result<String, PushError> {
    let malformed = || PushError::Malformed(String::from_utf8_lossy(payload).into_owned());

    let command = std::str::from_utf8(payload).map_err(|_| malformed())?;
    let tokens = shlex::split(command).ok_or_else(malformed)?;

    match <[String; 2]>::try_from(tokens) {
        Ok([op, path]) if op == RECEIVE_PACK => Ok(path),
        _ => Err(malformed()),
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Validates exec requests against the repository store and the authorizer.
#[derive(Clone)]
pub struct PushExecutor {
    repos: RepoStore,
    authorizer: Arc<dyn PushAuthorizer>,
}

impl PushExecutor {
    pub fn new(repos: RepoStore, authorizer: Arc<dyn PushAuthorizer>) -> Self {
        Self { repos, authorizer }
    }

    /// Run every pre-spawn check for one exec request.
    ///
    /// The connection's credential is consumed once the payload has parsed,
    /// whether or not the push is then authorized.
    #[instrument(skip_all, fields(user = %identity.user))]
    pub async fn prepare(
        &self,
        identity: &ConnectionIdentity,
        credential: &mut CredentialSlot,
        payload: &[u8],
    ) -> Result<PreparedPush, PushError> {
        let requested = parse_exec_payload(payload)?;
        let path = normalize_repo_path(&requested).map_err(|source| PushError::InvalidPath {
            path: requested.clone(),
            source,
        })?;

        let key = credential.consume();
        if !self.authorizer.authorize(identity, key.as_ref(), &path).await {
            return Err(PushError::Unauthorized {
                user: identity.user.clone(),
                repo: path,
            });
        }

        let repo = self.repos.open(&path);
        if !repo.ready().await {
            return Err(PushError::Uninitialized(path));
        }

        Ok(PreparedPush {
            repo,
            user: identity.user.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Prepared push
// ---------------------------------------------------------------------------

/// An authorized push into a ready repository, not yet started.
#[derive(Debug)]
pub struct PreparedPush {
    repo: Repository,
    user: String,
}

impl PreparedPush {
    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    /// `git-shell -c "git-receive-pack '<full path>'"`, run inside the
    /// repository.
    pub fn command(&self) -> Command {
        let full = self.repo.full_path();
        let quoted = full.to_string_lossy().replace('\'', r"'\''");

        let mut cmd = Command::new("git-shell");
        cmd.arg("-c")
            .arg(format!("{RECEIVE_PACK} '{quoted}'"))
            .current_dir(&full)
            .env(ENV_RECEIVE_USER, &self.user)
            .env(ENV_RECEIVE_REPO, &full);
        cmd
    }

    /// Pump `stdin` into the receive process and its output into `stdout`
    /// and `stderr` until it exits.
    #[instrument(skip_all, fields(repo = %self.repo.path(), user = %self.user))]
    pub async fn run<R, W, E>(self, stdin: R, stdout: W, stderr: E) -> Result<(), PushError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
        E: AsyncWrite + Unpin,
    {
        info!("starting git-receive-pack");
        pump(self.command(), stdin, stdout, stderr).await?;
        info!("git-receive-pack finished");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::ffi::OsStr;
    use std::sync::Mutex;

    use russh_keys::key::PublicKey;
    use russh_keys::PublicKeyBase64;

    use super::*;
    use crate::auth::tests::test_key;
    use crate::auth::AllowAll;
    use crate::git::repo::tests::git_available;

    /// Records every call and answers with a fixed verdict.
    struct Recording {
        allow: bool,
        seen: Mutex<Vec<(String, Option<String>)>>,
    }

    impl Recording {
        fn new(allow: bool) -> Arc<Self> {
            Arc::new(Self {
                allow,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl PushAuthorizer for Recording {
        async fn authorize(
            &self,
            _identity: &ConnectionIdentity,
            key: Option<&PublicKey>,
            repo: &str,
        ) -> bool {
            self.seen
                .lock()
                .unwrap()
                .push((repo.to_string(), key.map(|k| k.public_key_base64())));
            self.allow
        }
    }

    fn identity() -> ConnectionIdentity {
        ConnectionIdentity {
            user: "git".into(),
            peer: None,
        }
    }

    #[test]
    fn parses_quoted_path() {
        assert_eq!(
            parse_exec_payload(b"git-receive-pack '/team/app'").unwrap(),
            "/team/app"
        );
        assert_eq!(
            parse_exec_payload(b"git-receive-pack \"my repo\"").unwrap(),
            "my repo"
        );
        assert_eq!(parse_exec_payload(b"git-receive-pack app").unwrap(), "app");
    }

    #[test]
    fn rejects_malformed_payloads() {
        for payload in [
            &b""[..],
            &b"git-receive-pack"[..],
            &b"git-upload-pack '/a'"[..],
            &b"git-receive-pack '/a' extra"[..],
            &b"git-receive-pack '/a"[..],
            &b"sh -c 'rm -rf /'"[..],
            &b"git-receive-pack \xff\xfe"[..],
        ] {
            let err = parse_exec_payload(payload).unwrap_err();
            assert!(
                matches!(err, PushError::Malformed(_)),
                "{:?} gave {err:?}",
                String::from_utf8_lossy(payload)
            );
        }
    }

    #[tokio::test]
    async fn malformed_request_leaves_credential_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let authorizer = Recording::new(true);
        let executor = PushExecutor::new(RepoStore::new(tmp.path(), tmp.path()), authorizer.clone());
        let mut slot = CredentialSlot::default();
        slot.capture(test_key());

        let err = executor
            .prepare(&identity(), &mut slot, b"git-upload-pack '/a'")
            .await
            .unwrap_err();

        assert_eq!(err.outcome(), PushOutcome::Malformed);
        assert!(!slot.is_empty());
        assert!(authorizer.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unauthorized_push_still_consumes_credential() {
        let tmp = tempfile::tempdir().unwrap();
        let authorizer = Recording::new(false);
        let executor = PushExecutor::new(RepoStore::new(tmp.path(), tmp.path()), authorizer.clone());
        let key = test_key();
        let mut slot = CredentialSlot::default();
        slot.capture(key.clone());

        let err = executor
            .prepare(&identity(), &mut slot, b"git-receive-pack 'team/app/'")
            .await
            .unwrap_err();

        assert!(matches!(err, PushError::Unauthorized { ref repo, .. } if repo == "/team/app"));
        assert!(slot.is_empty());

        // A second request on the same connection sees no key.
        let _ = executor
            .prepare(&identity(), &mut slot, b"git-receive-pack '/team/app'")
            .await;
        let seen = authorizer.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].1.as_deref(), Some(key.public_key_base64().as_str()));
        assert_eq!(seen[1].1, None);
    }

    #[tokio::test]
    async fn missing_repository_is_uninitialized() {
        let tmp = tempfile::tempdir().unwrap();
        let executor = PushExecutor::new(RepoStore::new(tmp.path(), tmp.path()), Arc::new(AllowAll));
        let mut slot = CredentialSlot::default();

        let err = executor
            .prepare(&identity(), &mut slot, b"git-receive-pack '/nope'")
            .await
            .unwrap_err();

        assert!(matches!(err, PushError::Uninitialized(ref p) if p == "/nope"));
        assert_eq!(err.outcome(), PushOutcome::Uninitialized);
    }

    #[tokio::test]
    async fn ready_repository_yields_receive_command() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let store = RepoStore::new(tmp.path().join("repos"), tmp.path().join("co"));
        store.open("/a").init("127.0.0.1", 3776).await.unwrap();
        let executor = PushExecutor::new(store, Arc::new(AllowAll));
        let mut slot = CredentialSlot::default();

        let push = executor
            .prepare(&identity(), &mut slot, b"git-receive-pack '/a'")
            .await
            .unwrap();
        let cmd = push.command();
        let inner = cmd.as_std();

        let full = tmp.path().join("repos").join("a");
        assert_eq!(inner.get_program(), "git-shell");
        let args: Vec<&OsStr> = inner.get_args().collect();
        assert_eq!(args[0], "-c");
        assert_eq!(
            args[1].to_string_lossy(),
            format!("git-receive-pack '{}'", full.display())
        );
        assert_eq!(inner.get_current_dir(), Some(full.as_path()));

        let envs: Vec<_> = inner.get_envs().collect();
        assert!(envs.contains(&(OsStr::new(ENV_RECEIVE_USER), Some(OsStr::new("git")))));
        assert!(envs.contains(&(OsStr::new(ENV_RECEIVE_REPO), Some(full.as_os_str()))));
    }
}
