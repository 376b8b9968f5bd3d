//! Bare repositories under the configured root.
//!
//! A [`Repository`] is a value object: a rooted relative path joined onto the
//! process-wide root held by a [`RepoStore`].  Nothing about it is cached;
//! readiness is asked of `git` every time.

use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use super::hook::{post_receive_script, POST_RECEIVE};

// ---------------------------------------------------------------------------
// Path normalization
// ---------------------------------------------------------------------------

/// Why a client-supplied repository path was refused.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RepoPathError {
    #[error("repository path is empty")]
    Empty,
    #[error("repository path contains a NUL byte")]
    Nul,
}

/// Normalize a client-supplied repository path into rooted form.
///
/// The path is anchored at the repository root rather than the process
/// working directory: `a/b`, `/a/b/` and `/x/../a/./b` all become `/a/b`.
/// `..` never climbs above the root.
pub fn normalize_repo_path(raw: &str) -> Result<String, RepoPathError> {
    if raw.contains('\0') {
        return Err(RepoPathError::Nul);
    }

    let mut parts: Vec<&str> = Vec::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().unwrap_or_default()),
            Component::ParentDir => {
                parts.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }

    if parts.is_empty() {
        return Err(RepoPathError::Empty);
    }

    Ok(format!("/{}", parts.join("/")))
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Hands out [`Repository`] values that all share one root.
#[derive(Debug, Clone)]
pub struct RepoStore {
    root: Arc<Path>,
    checkout_root: Arc<Path>,
}

impl RepoStore {
    /// `root` holds the bare repositories; `checkout_root` is where
    /// [`Repository::checkout`] materializes revisions.
    pub fn new(root: impl Into<PathBuf>, checkout_root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::from(root.into()),
            checkout_root: Arc::from(checkout_root.into()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The repository at `path`, which must already be normalized (see
    /// [`normalize_repo_path`]).
    pub fn open(&self, path: &str) -> Repository {
        Repository {
            root: Arc::clone(&self.root),
            checkout_root: Arc::clone(&self.checkout_root),
            path: path.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Repository {
    root: Arc<Path>,
    checkout_root: Arc<Path>,
    path: String,
}

impl Repository {
    /// Rooted relative path, e.g. `/team/app`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Root and relative path concatenated.
    pub fn full_path(&self) -> PathBuf {
        let mut full = self.root.as_os_str().to_os_string();
        full.push(&self.path);
        PathBuf::from(full)
    }

    fn hook_path(&self) -> PathBuf {
        self.full_path().join("hooks").join(POST_RECEIVE)
    }

    /// Deterministic checkout directory for `revision`.
    pub fn checkout_dir(&self, revision: &str) -> PathBuf {
        let mut dir = self.checkout_root.as_os_str().to_os_string();
        dir.push(&self.path);
        PathBuf::from(dir).join(revision)
    }

    /// Whether the path is a directory that `git` recognizes as a bare
    /// repository.  Any failure along the way means "not ready".
    #[instrument(skip(self), fields(repo = %self.path))]
    pub async fn ready(&self) -> bool {
        let full = self.full_path();

        match tokio::fs::metadata(&full).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                debug!(path = %full.display(), "not a directory");
                return false;
            }
            Err(e) => {
                debug!(path = %full.display(), error = %e, "stat failed");
                return false;
            }
        }

        let output = Command::new("git")
            .arg("rev-parse")
            .arg("--is-bare-repository")
            .current_dir(&full)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await;

        match output {
            Ok(output) if output.status.success() => output.stdout.starts_with(b"true"),
            Ok(output) => {
                debug!(status = %output.status, "git rev-parse failed");
                false
            }
            Err(e) => {
                debug!(error = %e, "failed to spawn git rev-parse");
                false
            }
        }
    }

    /// Create the directory, run `git init --bare` in it and install the
    /// post-receive hook.
    ///
    /// Does not check [`ready`](Self::ready) first.
    #[instrument(skip(self), fields(repo = %self.path))]
    pub async fn init(&self, advertise_address: &str, advertise_port: u16) -> Result<()> {
        let full = self.full_path();

        tokio::fs::create_dir_all(&full)
            .await
            .with_context(|| format!("failed to create repository dir: {}", full.display()))?;

        let output = Command::new("git")
            .arg("init")
            .arg("--bare")
            .current_dir(&full)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .context("failed to spawn git init --bare")?;

        if !output.status.success() {
            bail!(
                "git init --bare in {} failed (status {}): {}",
                full.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim(),
            );
        }

        info!(path = %full.display(), "created repository");

        self.install_hook(advertise_address, advertise_port).await
    }

    /// Write the derived post-receive script with mode 0755.
    pub async fn install_hook(&self, advertise_address: &str, advertise_port: u16) -> Result<()> {
        let hook = self.hook_path();
        if let Some(dir) = hook.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("failed to create hooks dir: {}", dir.display()))?;
        }

        tokio::fs::write(&hook, self.derived_hook_script(advertise_address, advertise_port))
            .await
            .with_context(|| format!("failed to write hook: {}", hook.display()))?;
        tokio::fs::set_permissions(&hook, std::fs::Permissions::from_mode(0o755))
            .await
            .with_context(|| format!("failed to chmod hook: {}", hook.display()))?;

        Ok(())
    }

    /// The hook script this repository should have for `address:port`.
    pub fn derived_hook_script(&self, address: &str, port: u16) -> Vec<u8> {
        post_receive_script(address, port, &self.path)
    }

    /// The installed hook script, or `None` if there is none.
    pub async fn current_hook_script(&self) -> Option<Vec<u8>> {
        tokio::fs::read(self.hook_path()).await.ok()
    }

    /// Export `revision` with `git archive` and unpack it with `tar` into
    /// [`checkout_dir`](Self::checkout_dir).
    ///
    /// The archive streams straight from one process into the other.  The
    /// directory is left in place for whoever consumes it.
    #[instrument(skip(self), fields(repo = %self.path))]
    pub async fn checkout(&self, revision: &str) -> Result<PathBuf> {
        let revision = validate_revision(revision)?;
        let full = self.full_path();
        let dest = self.checkout_dir(revision);

        tokio::fs::create_dir_all(&dest)
            .await
            .with_context(|| format!("failed to create checkout dir: {}", dest.display()))?;
        info!(dest = %dest.display(), "checking out revision");

        let mut archive = Command::new("git")
            .arg("archive")
            .arg(revision)
            .current_dir(&full)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start git archive in {}", full.display()))?;

        let archive_out: Stdio = archive
            .stdout
            .take()
            .context("git archive stdout was not piped")?
            .try_into()
            .context("failed to hand git archive stdout to tar")?;

        let tar = Command::new("tar")
            .arg("-xf")
            .arg("-")
            .current_dir(&dest)
            .stdin(archive_out)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start tar in {}", dest.display()))?;

        let (archive_res, tar_res) = tokio::join!(archive.wait_with_output(), tar.wait_with_output());

        let archive_res = archive_res.context("failed to wait for git archive")?;
        let tar_res = tar_res.context("failed to wait for tar")?;

        // A failing archive usually fails tar too; both stderr texts are kept.
        if !archive_res.status.success() || !tar_res.status.success() {
            bail!(
                "checkout of {revision} into {} failed: git archive {revision} in {} ({}): {}; tar ({}): {}",
                dest.display(),
                full.display(),
                archive_res.status,
                String::from_utf8_lossy(&archive_res.stderr).trim(),
                tar_res.status,
                String::from_utf8_lossy(&tar_res.stderr).trim(),
            );
        }

        Ok(dest)
    }
}

/// Reduce a revision token to the single line git will be asked to resolve.
///
/// The token becomes a directory name, so separators and dot-names are
/// refused outright.
fn validate_revision(raw: &str) -> Result<&str> {
    let rev = raw.trim();
    if rev.is_empty() {
        bail!("empty revision");
    }
    if rev.contains(['/', '\\', '\0', '\n', '\r']) || rev == "." || rev == ".." {
        bail!("invalid revision {rev:?}");
    }
    if rev.starts_with('-') {
        bail!("revision {rev:?} looks like an option");
    }
    Ok(rev)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Whether a usable `git` binary is on PATH.
    pub(crate) fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    /// Run `git` synchronously in `dir`, panicking on failure.
    pub(crate) fn git(dir: &Path, args: &[&str]) -> String {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "test")
            .env("GIT_AUTHOR_EMAIL", "test@example.com")
            .env("GIT_COMMITTER_NAME", "test")
            .env("GIT_COMMITTER_EMAIL", "test@example.com")
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8(output.stdout).unwrap().trim().to_string()
    }

    /// Push one commit containing `README` into the bare repo `repo` and
    /// return its id.
    pub(crate) fn seed_commit(repo: &Repository, scratch: &Path) -> String {
        let work = scratch.join("work");
        std::fs::create_dir_all(&work).unwrap();
        git(&work, &["init", "-q"]);
        std::fs::write(work.join("README"), "hello\n").unwrap();
        git(&work, &["add", "README"]);
        git(&work, &["commit", "-q", "-m", "seed"]);
        let rev = git(&work, &["rev-parse", "HEAD"]);
        let target = repo.full_path();
        git(
            &work,
            &["push", "-q", target.to_str().unwrap(), "HEAD:refs/heads/main"],
        );
        rev
    }

    #[test]
    fn normalize_anchors_at_root() {
        assert_eq!(normalize_repo_path("a").unwrap(), "/a");
        assert_eq!(normalize_repo_path("/a/b/").unwrap(), "/a/b");
        assert_eq!(normalize_repo_path("/x/../a/./b").unwrap(), "/a/b");
        assert_eq!(normalize_repo_path("../../etc").unwrap(), "/etc");
        assert_eq!(normalize_repo_path("//a//b").unwrap(), "/a/b");
    }

    #[test]
    fn normalize_rejects_empty_and_nul() {
        assert_eq!(normalize_repo_path(""), Err(RepoPathError::Empty));
        assert_eq!(normalize_repo_path("/"), Err(RepoPathError::Empty));
        assert_eq!(normalize_repo_path("/a/.."), Err(RepoPathError::Empty));
        assert_eq!(normalize_repo_path("a\0b"), Err(RepoPathError::Nul));
    }

    #[test]
    fn full_path_is_concatenation() {
        let store = RepoStore::new("/repos", "/tmp");
        let repo = store.open("/team/app");
        assert_eq!(repo.full_path(), PathBuf::from("/repos/team/app"));
        assert_eq!(
            repo.checkout_dir("abc123"),
            PathBuf::from("/tmp/team/app/abc123")
        );
    }

    #[test]
    fn revision_validation() {
        assert_eq!(validate_revision("abc123\n").unwrap(), "abc123");
        assert!(validate_revision("").is_err());
        assert!(validate_revision("  \n").is_err());
        assert!(validate_revision("..").is_err());
        assert!(validate_revision("a/../../b").is_err());
        assert!(validate_revision("--output=/etc/passwd").is_err());
        assert!(validate_revision("one\ntwo").is_err());
    }

    #[tokio::test]
    async fn ready_is_false_for_missing_file_and_plain_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RepoStore::new(tmp.path(), tmp.path());

        assert!(!store.open("/missing").ready().await);

        std::fs::write(tmp.path().join("file"), "x").unwrap();
        assert!(!store.open("/file").ready().await);

        std::fs::create_dir(tmp.path().join("plain")).unwrap();
        assert!(!store.open("/plain").ready().await);
    }

    #[tokio::test]
    async fn ready_is_false_for_non_bare_repo() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let work = tmp.path().join("work");
        std::fs::create_dir(&work).unwrap();
        git(&work, &["init", "-q"]);

        let store = RepoStore::new(tmp.path(), tmp.path());
        assert!(!store.open("/work").ready().await);
    }

    #[tokio::test]
    async fn init_then_ready() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let store = RepoStore::new(tmp.path().join("repos"), tmp.path().join("co"));
        let repo = store.open("/team/app");

        assert!(!repo.ready().await);
        repo.init("0.0.0.0", 3776).await.unwrap();
        assert!(repo.ready().await);

        let installed = repo.current_hook_script().await.unwrap();
        assert_eq!(installed, repo.derived_hook_script("0.0.0.0", 3776));

        let mode = std::fs::metadata(repo.hook_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[tokio::test]
    async fn current_hook_absent_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RepoStore::new(tmp.path(), tmp.path());
        assert!(store.open("/nothing").current_hook_script().await.is_none());
    }

    #[tokio::test]
    async fn checkout_extracts_tree() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let store = RepoStore::new(tmp.path().join("repos"), tmp.path().join("co"));
        let repo = store.open("/a");
        repo.init("127.0.0.1", 3776).await.unwrap();
        let rev = seed_commit(&repo, tmp.path());

        let dir = repo.checkout(&rev).await.unwrap();

        assert_eq!(dir, tmp.path().join("co").join("a").join(&rev));
        assert_eq!(std::fs::read_to_string(dir.join("README")).unwrap(), "hello\n");
    }

    #[tokio::test]
    async fn checkout_of_unknown_revision_reports_both_error_streams() {
        if !git_available() {
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let store = RepoStore::new(tmp.path().join("repos"), tmp.path().join("co"));
        let repo = store.open("/a");
        repo.init("127.0.0.1", 3776).await.unwrap();

        let err = repo.checkout("deadbeef").await.unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("git archive deadbeef"), "{msg}");
        assert!(msg.contains("fatal:"), "{msg}");
        // tar sees an empty archive and fails too; its complaint is kept.
        let tar_part = msg.split("; tar (").nth(1).unwrap();
        assert!(tar_part.contains("tar:"), "{msg}");
    }
}
