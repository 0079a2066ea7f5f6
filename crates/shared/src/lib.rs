//! Shared types for the grantline real-time synchronization protocol.

pub mod error;
pub mod models;
pub mod protocol;

pub use error::*;
pub use models::*;
pub use protocol::*;
