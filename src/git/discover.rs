//! Startup discovery of existing repositories and hook drift detection.
//!
//! The walk treats every ready bare repository as a leaf: its directory is
//! never descended into, so nothing inside a repository (`objects/`,
//! `refs/`, ...) can be mistaken for a nested repository.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use super::repo::{RepoStore, Repository};

/// An installed post-receive hook that no longer matches the configuration.
#[derive(Debug, Error)]
#[error(
    "post-receive hook mismatch in {path}\ninstalled:\n{installed}\nexpected:\n{expected}"
)]
pub struct DriftError {
    pub path: PathBuf,
    pub installed: String,
    pub expected: String,
}

/// Outcome of [`prepare_repos`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Discovery {
    /// Rooted paths of every repository found, in walk order.
    pub repos: Vec<String>,
    /// Repositories whose hook was rewritten.
    pub rewritten: Vec<String>,
}

/// Walk the store root, compare every repository's hook with the one derived
/// for `address:port`, and either fail on the first mismatch or rewrite it
/// when `overwrite` is set.
#[instrument(skip(store), fields(root = %store.root().display()))]
pub async fn prepare_repos(
    store: &RepoStore,
    address: &str,
    port: u16,
    overwrite: bool,
) -> Result<Discovery> {
    let mut discovery = Discovery::default();

    for repo in find_repos(store).await? {
        let expected = repo.derived_hook_script(address, port);
        let installed = repo.current_hook_script().await;

        if installed.as_deref() != Some(expected.as_slice()) {
            if !overwrite {
                return Err(DriftError {
                    path: repo.full_path(),
                    installed: String::from_utf8_lossy(installed.as_deref().unwrap_or_default())
                        .into_owned(),
                    expected: String::from_utf8_lossy(&expected).into_owned(),
                }
                .into());
            }
            warn!(repo = %repo.path(), "rewriting stale post-receive hook");
            repo.install_hook(address, port).await?;
            discovery.rewritten.push(repo.path().to_string());
        }

        discovery.repos.push(repo.path().to_string());
    }

    info!(
        repos = discovery.repos.len(),
        rewritten = discovery.rewritten.len(),
        "repository discovery complete"
    );
    Ok(discovery)
}

/// Every ready repository under the store root, depth-first in name order.
pub async fn find_repos(store: &RepoStore) -> Result<Vec<Repository>> {
    let root = store.root().to_path_buf();
    let mut found = Vec::new();
    let mut stack = children(&root).await?;
    stack.reverse();

    while let Some(dir) = stack.pop() {
        let Some(rel) = relative(&root, &dir) else {
            continue;
        };
        let repo = store.open(&rel);

        if repo.ready().await {
            debug!(repo = %rel, "found repository");
            found.push(repo);
            continue;
        }

        let mut sub = match children(&dir).await {
            Ok(sub) => sub,
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "skipping unreadable directory");
                continue;
            }
        };
        sub.reverse();
        stack.extend(sub);
    }

    Ok(found)
}

/// Subdirectories of `dir`, sorted by name.  Symlinks are not followed.
async fn children(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read directory: {}", dir.display()))?;

    let mut dirs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed to read entry in: {}", dir.display()))?
    {
        match entry.file_type().await {
            Ok(ft) if ft.is_dir() => dirs.push(entry.path()),
            _ => {}
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// `dir` relative to `root`, in rooted form (`/a/b`).
fn relative(root: &Path, dir: &Path) -> Option<String> {
    let rel = dir.strip_prefix(root).ok()?;
    let rel = rel.to_str()?;
    if rel.is_empty() {
        return None;
    }
    Some(format!("/{rel}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
