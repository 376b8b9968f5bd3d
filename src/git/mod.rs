//! Repository storage plumbing.
//!
//! Every operation shells out to the `git` binary (and `tar` for checkouts)
//! through `tokio::process::Command`; nothing here parses repository objects
//! itself.

pub mod discover;
pub mod hook;
pub mod pump;
pub mod repo;

pub use discover::{prepare_repos, DriftError};
pub use pump::{pump, PumpError};
pub use repo::{normalize_repo_path, RepoPathError, RepoStore, Repository};
