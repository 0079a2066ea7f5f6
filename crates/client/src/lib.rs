//! Grantline Client - real-time synchronization core
//!
//! Keeps the management views (KPIs, relationships, grants, activities) in
//! sync with the server over one authenticated WebSocket.

pub mod config;
pub mod ws;

pub use config::{IdentityConfig, SyncConfig};
pub use ws::{ChannelFacade, ConnectionManager, ConnectionState, Topic};
