//! SSH session handler implementing the `russh` 0.46 [`Handler`] trait.
//!
//! Every offered public key is accepted during the handshake and kept in the
//! connection's [`CredentialSlot`]; the push authorizer decides later, per
//! repository.  Session channels accept one `exec` request each, which must
//! be a `git-receive-pack`.  `env` requests are acknowledged and otherwise
//! ignored; shells, subsystems and ptys are refused.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, Pty};
use russh_keys::key::PublicKey;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::channel::{spawn_push, ChannelOutput, PIPE_CAPACITY};
use super::push::PushExecutor;
use crate::auth::{fingerprint_of, ConnectionIdentity, CredentialSlot};
use crate::AppState;

// ---------------------------------------------------------------------------
// Channel state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    #[default]
    Open,
    PushInFlight,
    Closed,
}

/// Channel requests, reduced to what decides the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Exec,
    Env,
    Other,
}

/// What to do with one channel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Run the push executor.
    StartPush,
    /// Reply success and do nothing else.
    Acknowledge,
    /// Reply failure.
    Refuse,
}

/// Per-channel state.  Holds the write half of the push's stdin while a
/// push is in flight.
#[derive(Debug, Default)]
pub struct ChannelState {
    phase: ChannelPhase,
    stdin: Option<DuplexStream>,
}

impl ChannelState {
    pub fn phase(&self) -> ChannelPhase {
        self.phase
    }

    /// Decide the reply for `kind`.  Only the first `exec` on an open channel
    /// starts a push.
    pub fn dispatch(&mut self, kind: RequestKind) -> Dispatch {
        match (self.phase, kind) {
            (ChannelPhase::Closed, _) => Dispatch::Refuse,
            (ChannelPhase::Open, RequestKind::Exec) => {
                self.phase = ChannelPhase::PushInFlight;
                Dispatch::StartPush
            }
            (ChannelPhase::PushInFlight, RequestKind::Exec) => Dispatch::Refuse,
            (_, RequestKind::Env) => Dispatch::Acknowledge,
            (_, RequestKind::Other) => Dispatch::Refuse,
        }
    }

    fn attach_stdin(&mut self, stdin: DuplexStream) {
        self.stdin = Some(stdin);
    }

    /// Signal EOF to the push, if one is reading.
    fn close_stdin(&mut self) {
        self.stdin = None;
    }

    fn close(&mut self) {
        self.phase = ChannelPhase::Closed;
        self.stdin = None;
    }
}

// ---------------------------------------------------------------------------
// Session state
// ---------------------------------------------------------------------------

/// Per-connection SSH session state.
pub struct SshSession {
    state: Arc<AppState>,
    executor: PushExecutor,
    identity: ConnectionIdentity,
    credential: CredentialSlot,
    channels: HashMap<ChannelId, ChannelState>,
    /// Pushes started on this connection.
    pushes: TaskTracker,
}

impl SshSession {
    /// Create a new session for an incoming connection.
    pub fn new(state: Arc<AppState>, peer_addr: Option<SocketAddr>) -> Self {
        state.metrics.metrics.active_connections.inc();
        let executor = PushExecutor::new(state.repos.clone(), Arc::clone(&state.authorizer));
        Self {
            state,
            executor,
            identity: ConnectionIdentity {
                user: String::new(),
                peer: peer_addr,
            },
            credential: CredentialSlot::default(),
            channels: HashMap::new(),
            pushes: TaskTracker::new(),
        }
    }

    pub fn pushes(&self) -> &TaskTracker {
        &self.pushes
    }

    fn dispatch(&mut self, channel: ChannelId, kind: RequestKind) -> Dispatch {
        match self.channels.get_mut(&channel) {
            Some(state) => state.dispatch(kind),
            None => Dispatch::Refuse,
        }
    }

    fn refuse(&self, channel: ChannelId, session: &mut Session, what: &str) {
        debug!(peer = ?self.identity.peer, request = what, "refusing channel request");
        session.channel_failure(channel);
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        self.state.metrics.metrics.active_connections.dec();
    }
}

// ---------------------------------------------------------------------------
// Handler implementation
// ---------------------------------------------------------------------------

#[async_trait::async_trait]
impl Handler for SshSession {
    type Error = anyhow::Error;

    /// Accept any key and remember it for the first push on this connection.
    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        info!(
            peer = ?self.identity.peer,
            user = %user,
            fingerprint = %fingerprint_of(key),
            "SSH public-key auth"
        );
        self.identity.user = user.to_string();
        self.credential.capture(key.clone());
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), ChannelState::default());
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        warn!(
            peer = ?self.identity.peer,
            target = %format!("{host_to_connect}:{port_to_connect}"),
            "refusing port forward"
        );
        Ok(false)
    }

    /// The variable is discarded.  russh only puts the reply on the wire
    /// when the client asked for one.
    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let dispatch = self.dispatch(channel, RequestKind::Env);
        debug!(name = %variable_name, ?dispatch, "env request");
        match dispatch {
            Dispatch::Acknowledge => session.channel_success(channel),
            _ => session.channel_failure(channel),
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.dispatch(channel, RequestKind::Other);
        self.refuse(channel, session, "shell");
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.dispatch(channel, RequestKind::Other);
        self.refuse(channel, session, name);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.dispatch(channel, RequestKind::Other);
        self.refuse(channel, session, "pty-req");
        Ok(())
    }

    /// Forward client data to the running push.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(state) = self.channels.get_mut(&channel) else {
            return Ok(());
        };
        if let Some(stdin) = state.stdin.as_mut() {
            if let Err(e) = stdin.write_all(data).await {
                debug!(error = %e, "push no longer reading stdin");
                state.close_stdin();
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.close_stdin();
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }

    /// Validate the request, reply, and run the push in the background.
    ///
    /// The handler returns as soon as the process is scheduled so the
    /// connection keeps delivering client data to it.
    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        info!(
            peer = ?self.identity.peer,
            user = %self.identity.user,
            command = %String::from_utf8_lossy(data),
            "SSH exec request"
        );

        if self.dispatch(channel, RequestKind::Exec) != Dispatch::StartPush {
            self.refuse(channel, session, "exec");
            return Ok(());
        }

        match self
            .executor
            .prepare(&self.identity, &mut self.credential, data)
            .await
        {
            Ok(push) => {
                session.channel_success(channel);

                let (stdin, feed) = tokio::io::duplex(PIPE_CAPACITY);
                if let Some(state) = self.channels.get_mut(&channel) {
                    state.attach_stdin(feed);
                }

                spawn_push(
                    &self.pushes,
                    self.state.metrics.clone(),
                    ChannelOutput::new(session.handle(), channel),
                    push,
                    stdin,
                );
            }
            Err(e) => {
                warn!(peer = ?self.identity.peer, error = %e, "push refused");
                self.state.metrics.metrics.record_push(e.outcome());
                if let Some(state) = self.channels.get_mut(&channel) {
                    state.close();
                }
                session.channel_failure(channel);
                session.close(channel);
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_exec_starts_push() {
        let mut state = ChannelState::default();
        assert_eq!(state.phase(), ChannelPhase::Open);

        assert_eq!(state.dispatch(RequestKind::Exec), Dispatch::StartPush);
        assert_eq!(state.phase(), ChannelPhase::PushInFlight);
    }

    #[test]
    fn second_exec_is_refused() {
        let mut state = ChannelState::default();
        state.dispatch(RequestKind::Exec);

        assert_eq!(state.dispatch(RequestKind::Exec), Dispatch::Refuse);
        assert_eq!(state.phase(), ChannelPhase::PushInFlight);
    }

    #[test]
    fn env_is_acknowledged() {
        let mut state = ChannelState::default();
        assert_eq!(state.dispatch(RequestKind::Env), Dispatch::Acknowledge);
        assert_eq!(state.dispatch(RequestKind::Env), Dispatch::Acknowledge);
        // Env does not use up the channel's exec.
        assert_eq!(state.dispatch(RequestKind::Exec), Dispatch::StartPush);
    }

    #[test]
    fn other_requests_are_refused() {
        let mut state = ChannelState::default();
        assert_eq!(state.dispatch(RequestKind::Other), Dispatch::Refuse);
        assert_eq!(state.phase(), ChannelPhase::Open);
    }

    #[test]
    fn closed_channel_refuses_everything() {
        let mut state = ChannelState::default();
        state.dispatch(RequestKind::Exec);
        state.close();

        assert_eq!(state.phase(), ChannelPhase::Closed);
        for kind in [
            RequestKind::Exec,
            RequestKind::Env,
            RequestKind::Other,
        ] {
            assert_eq!(state.dispatch(kind), Dispatch::Refuse);
        }
    }

    #[tokio::test]
    async fn closing_stdin_signals_eof() {
        use tokio::io::AsyncReadExt;

        let mut state = ChannelState::default();
        let (mut reader, writer) = tokio::io::duplex(64);
        state.attach_stdin(writer);

        state.stdin.as_mut().unwrap().write_all(b"pack").await.unwrap();
        state.close_stdin();

        let mut got = Vec::new();
        reader.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"pack");
    }
}
