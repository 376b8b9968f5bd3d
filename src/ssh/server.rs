//! SSH server bootstrap and the [`russh::server::Server`] implementation.

use std::io::Write;
use std::net::SocketAddr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use russh::server::{self, Server};
use russh::{Disconnect, MethodSet};
use russh_keys::key::KeyPair;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::session::SshSession;
use crate::AppState;

// ---------------------------------------------------------------------------
// Server type
// ---------------------------------------------------------------------------

/// Top-level SSH server that hands off each incoming connection to an
/// [`SshSession`] handler.
pub struct SshServer {
    state: Arc<AppState>,
}

impl SshServer {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

impl server::Server for SshServer {
    type Handler = SshSession;

    fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> Self::Handler {
        info!(peer = ?peer_addr, "new SSH client connection");
        SshSession::new(Arc::clone(&self.state), peer_addr)
    }
}

// ---------------------------------------------------------------------------
// Host key
// ---------------------------------------------------------------------------

/// Load the host key at `path`, or generate an Ed25519 key and write it
/// there (PKCS#8 PEM, mode 0600) if the file does not exist.
///
/// A file that exists but cannot be decoded is an error; it is never
/// overwritten.
pub fn load_or_generate_host_key(path: &Path) -> Result<KeyPair> {
    if path.exists() {
        let key = russh_keys::load_secret_key(path, None)
            .with_context(|| format!("failed to load SSH host key: {}", path.display()))?;
        info!(path = %path.display(), "loaded SSH host key");
        return Ok(key);
    }

    warn!(path = %path.display(), "no SSH host key found; generating Ed25519 key");
    let key = KeyPair::generate_ed25519();

    let mut pem = Vec::new();
    russh_keys::encode_pkcs8_pem(&key, &mut pem).context("failed to encode SSH host key")?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create host key dir: {}", dir.display()))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("failed to create SSH host key: {}", path.display()))?;
    file.write_all(&pem)
        .with_context(|| format!("failed to write SSH host key: {}", path.display()))?;

    Ok(key)
}

fn server_config(host_key: KeyPair, inactivity_timeout: Duration) -> server::Config {
    server::Config {
        keys: vec![host_key],
        methods: MethodSet::PUBLICKEY,
        inactivity_timeout: Some(inactivity_timeout),
        auth_rejection_time: Duration::from_secs(1),
        auth_rejection_time_initial: Some(Duration::from_secs(0)),
        ..Default::default()
    }
}

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Start the SSH listener.  Runs until [`AppState::shutdown`] is cancelled;
/// only a host key or bind failure is returned as an error.
pub async fn start_ssh_server(state: Arc<AppState>) -> Result<()> {
    let ssh = &state.config.ssh;

    // -- Build russh server config ----------------------------------------

    let host_key = load_or_generate_host_key(&ssh.host_key_path)?;
    let config = Arc::new(server_config(
        host_key,
        Duration::from_secs(ssh.inactivity_timeout_secs),
    ));

    // -- Start serving ----------------------------------------------------

    let listener = TcpListener::bind((ssh.address.as_str(), ssh.port))
        .await
        .with_context(|| format!("failed to bind SSH listener on {}:{}", ssh.address, ssh.port))?;
    info!(address = %listener.local_addr()?, "starting SSH server");

    let mut ssh_server = SshServer::new(Arc::clone(&state));

    loop {
        let (socket, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    info!(error = %e, "failed to accept SSH connection");
                    continue;
                }
            },
            () = state.shutdown.cancelled() => break,
        };

        let handler = ssh_server.new_client(Some(peer));
        state
            .tasks
            .spawn(serve_connection(Arc::clone(&state), Arc::clone(&config), socket, peer, handler));
    }

    info!("SSH listener stopped");
    Ok(())
}

/// Drive one connection to completion.
///
/// On shutdown the connection is allowed to finish its running pushes and
/// is then disconnected.
async fn serve_connection(
    state: Arc<AppState>,
    config: Arc<server::Config>,
    socket: TcpStream,
    peer: SocketAddr,
    handler: SshSession,
) {
    let pushes = handler.pushes().clone();

    let session = match server::run_stream(config, socket, handler).await {
        Ok(session) => session,
        Err(e) => {
            info!(%peer, error = %e, "SSH handshake failed");
            return;
        }
    };
    let handle = session.handle();
    tokio::pin!(session);

    let finished = tokio::select! {
        result = &mut session => Some(result),
        () = state.shutdown.cancelled() => None,
    };

    let result = match finished {
        Some(result) => result,
        None => {
            pushes.close();
            pushes.wait().await;
            let _ = handle
                .disconnect(
                    Disconnect::ByApplication,
                    "server shutting down".to_string(),
                    String::new(),
                )
                .await;
            session.await
        }
    };

    if let Err(e) = result {
        debug!(%peer, error = %e, "SSH session ended with error");
    }

    // A client may drop the connection with a push still running.
    pushes.close();
    pushes.wait().await;
    debug!(%peer, "SSH connection closed");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
