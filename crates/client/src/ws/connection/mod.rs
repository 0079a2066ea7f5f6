//! Connection state, reconnect policy and the seams the manager drives.
//!
//! The manager never performs I/O itself. It talks to a [`Transport`] and a
//! [`Scheduler`], and learns about the outside world through
//! [`TransportEvent`]s and timer expirations fed back into it.

use std::fmt;
use std::time::Duration;

use grantline_shared::{ClientCommand, ServerEvent, SyncError, WsEnvelope};

/// Connection state for a sync session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
    Reconnecting { attempt: u32 },
    Failed { reason: String },
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Authenticating
                | ConnectionState::Reconnecting { .. }
        )
    }

    /// Live or trying to become live.
    pub fn is_active(&self) -> bool {
        self.is_connected() || self.is_connecting()
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Authenticating => write!(f, "authenticating"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
            ConnectionState::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Auto-reconnect behavior.
///
/// The delay is fixed between attempts. There is no backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub auto_reconnect: bool,
    pub delay: Duration,
    /// Maximum number of reconnect attempts (0 = infinite)
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            delay: Duration::from_millis(1000),
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// Whether reconnect attempt number `attempt` (1-based) is allowed.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt <= self.max_attempts
    }
}

/// Events a transport reports back to the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected(String),
    Error(String),
    Message(ServerEvent),
}

/// Identifies one connection attempt of a [`Transport`]. Every `connect`
/// returns a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub u64);

/// A single bidirectional, message-oriented connection.
///
/// `connect` only starts the attempt; its outcome arrives later as a
/// [`TransportEvent`] tagged with the returned [`ConnectionId`].
pub trait Transport {
    fn connect(&mut self) -> ConnectionId;
    fn disconnect(&mut self);
    fn send(&mut self, frame: WsEnvelope<ClientCommand>) -> Result<(), SyncError>;
}

/// Opaque handle for a scheduled single-shot timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Single-shot timers. Expiry is reported through
/// `ConnectionManager::timer_fired`.
pub trait Scheduler {
    fn schedule(&mut self, delay: Duration) -> TimerId;
    fn cancel(&mut self, id: TimerId);
}

#[cfg(not(target_arch = "wasm32"))]
mod connection_native;
#[cfg(not(target_arch = "wasm32"))]
pub use connection_native::{TokioScheduler, WsTransport};
