//! Real-time synchronization over a single multiplexed WebSocket.
//!
//! This module provides:
//! - Connection management with authentication and fixed-delay reconnect
//! - A subscription registry sharing one channel subscription among many consumers
//! - Message routing from inbound updates to channel consumers
//! - Per-topic facades holding the latest payload
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐ ┌─────────────┐ ┌─────────────┐
//! │ChannelFacade│ │ChannelFacade│ │ChannelFacade│
//! │   (kpis)    │ │  (grants)   │ │  (grants)   │
//! └─────────────┘ └─────────────┘ └─────────────┘
//!        │ register      │               │
//!        └───────────────┼───────────────┘
//!                        ▼
//!          ┌───────────────────────────┐
//!          │     ConnectionManager     │
//!          │  state machine + registry │◀── router (inbound updates)
//!          └───────────────────────────┘
//!                        │ send
//!                        ▼
//!          ┌───────────────────────────┐      ┌────────────┐
//!          │   Transport (WsTransport) │─────▶│ SyncDriver │
//!          └───────────────────────────┘events└────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let (events, receiver) = event_loop();
//! let manager = ConnectionManager::new(
//!     config.reconnect.clone(),
//!     WsTransport::new(config.url.clone(), events.clone()),
//!     TokioScheduler::new(events),
//! );
//! let grants = ChannelFacade::topic(&manager, Topic::Grants);
//! manager.start(identity);
//! SyncDriver::new(manager.clone(), receiver).run().await;
//! ```

mod connection;
mod driver;
mod facade;
mod manager;
mod registry;
pub mod router;

#[cfg(test)]
mod test_support;

// Re-export connection types
pub use connection::{
    ConnectionId, ConnectionState, ReconnectConfig, Scheduler, TimerId, Transport, TransportEvent,
};
#[cfg(not(target_arch = "wasm32"))]
pub use connection::{TokioScheduler, WsTransport};

pub use driver::{event_loop, LoopEvent, LoopReceiver, LoopSender, SyncDriver};
pub use facade::{ChannelFacade, DataCache, Topic};
pub use manager::{ConnectionManager, IdentityProvider, Registration, StateSubscription};
pub use registry::{
    callback, AckOutcome, Callback, ChannelEvent, ChannelSubscription, RegistrationId, RegistryAction,
    ServerAck, SubscriptionRegistry,
};
