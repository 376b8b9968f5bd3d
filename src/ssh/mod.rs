//! SSH transport.
//!
//! Accepts connections from Git clients, captures the public key offered
//! during the handshake, and runs `git-receive-pack` for each authorized
//! push through `git-shell`.  Nothing else is served: fetches, shells and
//! port forwards are refused.

pub mod channel;
pub mod push;
pub mod server;
pub mod session;

pub use push::{PushError, PushExecutor};
pub use server::start_ssh_server;
