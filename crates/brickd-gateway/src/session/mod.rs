//! Gateway session lifecycle
//!
//! This module owns the single authenticated broker connection: connecting
//! with a freshly issued credential, watching for connection loss,
//! reconnecting with backoff, and renewing the credential before it lapses.

mod manager;
mod retry;

pub use manager::GatewaySession;
pub use retry::{ExponentialBackoff, RetryPolicy};

use std::fmt;

/// Connection state of the gateway session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected; also the terminal state after `disconnect`
    #[default]
    Disconnected,
    /// A connection attempt is in progress
    Connecting,
    /// The broker accepted the connection
    Connected,
    /// The connection dropped and the session is trying to get it back
    LostConnection,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::LostConnection => "lost_connection",
        };
        f.write_str(name)
    }
}
