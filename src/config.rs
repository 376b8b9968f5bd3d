use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_yaml::{Mapping, Value};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub api: ApiConfig,
    pub repos: RepoConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub revision: RevisionConfig,
}

// ---------------------------------------------------------------------------
// SSH listener
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// Bind address for the SSH listener.
    #[serde(default = "default_ssh_address")]
    pub address: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Host key file.  Generated (Ed25519) on first start if absent.
    #[serde(default = "default_host_key_path")]
    pub host_key_path: PathBuf,
    /// Idle connections are dropped after this many seconds.
    #[serde(default = "default_inactivity_timeout")]
    pub inactivity_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            address: default_ssh_address(),
            port: default_ssh_port(),
            host_key_path: default_host_key_path(),
            inactivity_timeout_secs: default_inactivity_timeout(),
        }
    }
}

fn default_ssh_address() -> String {
    "0.0.0.0".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_host_key_path() -> PathBuf {
    PathBuf::from("id_ed25519")
}

fn default_inactivity_timeout() -> u64 {
    600
}

// ---------------------------------------------------------------------------
// HTTP control plane
// ---------------------------------------------------------------------------

/// Bind address of the HTTP control plane.  The same address and port are
/// written into every repository's post-receive hook.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_address")]
    pub address: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            address: default_api_address(),
            port: default_api_port(),
        }
    }
}

fn default_api_address() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    3776
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RepoConfig {
    /// Directory holding one bare repository per logical repository.
    pub root: PathBuf,
    /// Where pushed revisions are checked out.  Defaults to the OS temp dir.
    #[serde(default = "std::env::temp_dir")]
    pub checkout_root: PathBuf,
    /// Rewrite drifted post-receive hooks at startup instead of refusing to
    /// start.
    #[serde(default)]
    pub overwrite_post_receive: bool,
}

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// OpenSSH `authorized_keys` file.  When unset every key may push.
    pub authorized_keys: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Revision callback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RevisionConfig {
    /// Text returned to the post-receive hook for every checked-out revision.
    #[serde(default = "default_revision_response")]
    pub response: String,
}

impl Default for RevisionConfig {
    fn default() -> Self {
        Self {
            response: default_revision_response(),
        }
    }
}

fn default_revision_response() -> String {
    "OK".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub repo_root: Option<PathBuf>,
    pub ssh_port: Option<u16>,
    pub api_port: Option<u16>,
}

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P, overrides: &Overrides) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config_with(&contents, overrides)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(config)
}

/// Parse and validate YAML config text.
pub fn parse_config(contents: &str) -> Result<Config> {
    parse_config_with(contents, &Overrides::default())
}

/// Parse YAML config text, apply `overrides`, then validate.
///
/// Overrides are applied before deserializing so that a required field
/// (`repos.root`) may come from the command line alone.
pub fn parse_config_with(contents: &str, overrides: &Overrides) -> Result<Config> {
    let mut doc: Value = serde_yaml::from_str(contents)?;
    if doc.is_null() {
        doc = Value::Mapping(Mapping::new());
    }
    if let Some(root) = &overrides.repo_root {
        set(&mut doc, "repos", "root", root.to_string_lossy().into_owned().into())?;
    }

    let mut config: Config = serde_yaml::from_value(doc)?;
    if let Some(port) = overrides.ssh_port {
        config.ssh.port = port;
    }
    if let Some(port) = overrides.api_port {
        config.api.port = port;
    }

    config.repos.root = absolute(&config.repos.root)?;
    config.repos.checkout_root = absolute(&config.repos.checkout_root)?;
    validate_config(&config)?;
    Ok(config)
}

/// Set `doc[section][key] = value`, creating the section if needed.
fn set(doc: &mut Value, section: &str, key: &str, value: Value) -> Result<()> {
    let root = doc
        .as_mapping_mut()
        .context("config file must be a YAML mapping")?;
    if root.get(section).map_or(true, Value::is_null) {
        root.insert(section.into(), Value::Mapping(Mapping::new()));
    }
    root.get_mut(section)
        .and_then(Value::as_mapping_mut)
        .with_context(|| format!("config section `{section}` must be a mapping"))?
        .insert(key.into(), value);
    Ok(())
}

/// Resolve against the working directory and drop any trailing separator.
fn absolute(path: &Path) -> Result<PathBuf> {
    let abs = std::path::absolute(path)
        .with_context(|| format!("failed to resolve path: {}", path.display()))?;
    Ok(abs.components().collect())
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        config.repos.root.parent().is_some(),
        "repos.root must not be the filesystem root"
    );
    anyhow::ensure!(config.ssh.port != 0, "ssh.port must be non-zero");
    anyhow::ensure!(config.api.port != 0, "api.port must be non-zero");
    anyhow::ensure!(
        !config.api.address.is_empty(),
        "api.address must not be empty"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse_config("repos:\n  root: /srv/repos\n").unwrap();

        assert_eq!(config.ssh.address, "0.0.0.0");
        assert_eq!(config.ssh.port, 22);
        assert_eq!(config.api.address, "127.0.0.1");
        assert_eq!(config.api.port, 3776);
        assert_eq!(config.repos.root, PathBuf::from("/srv/repos"));
        assert!(!config.repos.overwrite_post_receive);
        assert!(config.auth.authorized_keys.is_none());
        assert_eq!(config.revision.response, "OK");
    }

    #[test]
    fn full_config_round_trips_fields() {
        let yaml = "\
ssh:
  address: 127.0.0.1
  port: 2222
  host_key_path: /etc/pushgate/host_key
api:
  address: 0.0.0.0
  port: 8080
repos:
  root: /srv/repos/
  checkout_root: /var/cache/pushgate
  overwrite_post_receive: true
auth:
  authorized_keys: /etc/pushgate/authorized_keys
revision:
  response: deployed
";
        let config = parse_config(yaml).unwrap();

        assert_eq!(config.ssh.port, 2222);
        assert_eq!(config.ssh.host_key_path, PathBuf::from("/etc/pushgate/host_key"));
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.repos.root, PathBuf::from("/srv/repos"));
        assert_eq!(config.repos.checkout_root, PathBuf::from("/var/cache/pushgate"));
        assert!(config.repos.overwrite_post_receive);
        assert_eq!(config.revision.response, "deployed");
    }

    #[test]
    fn relative_root_is_made_absolute() {
        let config = parse_config("repos:\n  root: data/repos\n").unwrap();
        assert!(config.repos.root.is_absolute());
        assert!(config.repos.root.ends_with("data/repos"));
    }

    #[test]
    fn missing_root_is_rejected() {
        assert!(parse_config("ssh:\n  port: 22\n").is_err());
    }

    #[test]
    fn zero_port_is_rejected() {
        assert!(parse_config("repos:\n  root: /srv\napi:\n  port: 0\n").is_err());
    }

    #[test]
    fn filesystem_root_is_rejected() {
        assert!(parse_config("repos:\n  root: /\n").is_err());
    }

    #[test]
    fn overrides_take_precedence() {
        let overrides = Overrides {
            repo_root: Some(PathBuf::from("/data/git")),
            ssh_port: Some(2222),
            api_port: None,
        };

        let config = parse_config_with("repos:\n  root: /srv\napi:\n  port: 9000\n", &overrides).unwrap();
        assert_eq!(config.repos.root, PathBuf::from("/data/git"));
        assert_eq!(config.ssh.port, 2222);
        assert_eq!(config.api.port, 9000);

        // The root may come from the command line alone.
        let config = parse_config_with("", &overrides).unwrap();
        assert_eq!(config.repos.root, PathBuf::from("/data/git"));
    }

    #[test]
    fn load_config_names_the_file() {
        let err = load_config("/nonexistent/pushgate.yaml", &Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/pushgate.yaml"));
    }
}
