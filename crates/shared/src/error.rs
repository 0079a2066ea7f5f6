//! Error taxonomy for the synchronization client.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Connect failure or abrupt disconnect. Recovered by reconnection.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server refused the session identity. Fatal for the session.
    #[error("authentication rejected: {0}")]
    AuthenticationRejected(String),

    /// The server refused a channel subscription. Scoped to that channel.
    #[error("subscription to '{channel}' rejected: {reason}")]
    SubscriptionRejected { channel: String, reason: String },

    /// A consumer callback failed while handling a delivery.
    #[error("consumer callback on '{channel}' failed: {message}")]
    Callback { channel: String, message: String },

    #[error("not connected")]
    NotConnected,

    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;
