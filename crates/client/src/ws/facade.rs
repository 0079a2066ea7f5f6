//! Per-topic consumer facades.
//!
//! A [`ChannelFacade`] registers itself with the manager on creation and
//! keeps only the most recent payload for its channel. Dropping it (or
//! calling [`ChannelFacade::close`]) deregisters.
//!
//! ```rust,ignore
//! let grants = ChannelFacade::topic(&manager, Topic::Grants);
//! // ... later, on the event loop
//! if let Some(latest) = grants.latest() {
//!     render(latest);
//! }
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use grantline_shared::{SyncResult, UpdateEnvelope};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use super::manager::{ConnectionManager, Registration};
use super::registry::{callback, ChannelEvent};
use super::router::WILDCARD_CHANNEL;

/// The data topics the management views consume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Kpis,
    Relationships,
    Grants,
    Activities,
    All,
}

impl Topic {
    pub fn channel(&self) -> &'static str {
        match self {
            Topic::Kpis => "kpis",
            Topic::Relationships => "relationships",
            Topic::Grants => "grants",
            Topic::Activities => "activities",
            Topic::All => WILDCARD_CHANNEL,
        }
    }
}

/// Sink for merged updates, owned by the data cache layer.
pub trait DataCache {
    fn merge(&self, channel: &str, update: &UpdateEnvelope);
}

#[derive(Debug, Default, Clone)]
struct Snapshot {
    latest: Option<Value>,
    last_update_time: Option<DateTime<Utc>>,
    applied_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

pub struct ChannelFacade {
    channel: String,
    snapshot: Rc<RefCell<Snapshot>>,
    registration: Registration,
    manager: ConnectionManager,
}

impl ChannelFacade {
    pub fn subscribe(manager: &ConnectionManager, channel: &str) -> Self {
        Self::build(manager, channel, None)
    }

    pub fn topic(manager: &ConnectionManager, topic: Topic) -> Self {
        Self::build(manager, topic.channel(), None)
    }

    /// Like [`ChannelFacade::subscribe`], also forwarding every applied
    /// update to `cache`.
    pub fn with_cache(manager: &ConnectionManager, channel: &str, cache: Rc<dyn DataCache>) -> Self {
        Self::build(manager, channel, Some(cache))
    }

    fn build(manager: &ConnectionManager, channel: &str, cache: Option<Rc<dyn DataCache>>) -> Self {
        let snapshot = Rc::new(RefCell::new(Snapshot::default()));
        let target = snapshot.clone();
        let registration = manager.register(
            channel,
            callback(move |event| {
                match event {
                    ChannelEvent::Update { channel, envelope } => {
                        {
                            let mut snapshot = target.borrow_mut();
                            snapshot.latest = Some(envelope.payload.clone());
                            snapshot.last_update_time = Some(envelope.timestamp);
                            snapshot.applied_at = Some(Utc::now());
                            snapshot.last_error = None;
                        }
                        if let Some(cache) = &cache {
                            cache.merge(channel, envelope);
                        }
                    }
                    ChannelEvent::Rejected { reason, .. } => {
                        target.borrow_mut().last_error = Some(reason.clone());
                    }
                }
                Ok(())
            }),
        );
        Self {
            channel: channel.to_string(),
            snapshot,
            registration,
            manager: manager.clone(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn latest(&self) -> Option<Value> {
        self.snapshot.borrow().latest.clone()
    }

    /// Decode the latest payload into a typed value.
    pub fn latest_as<T: DeserializeOwned>(&self) -> SyncResult<Option<T>> {
        match &self.snapshot.borrow().latest {
            Some(value) => Ok(Some(T::deserialize(value)?)),
            None => Ok(None),
        }
    }

    /// Server timestamp of the latest applied update.
    pub fn last_update_time(&self) -> Option<DateTime<Utc>> {
        self.snapshot.borrow().last_update_time
    }

    /// Local wall-clock time the latest update was applied.
    pub fn applied_at(&self) -> Option<DateTime<Utc>> {
        self.snapshot.borrow().applied_at
    }

    /// Reason the server gave for refusing this channel, cleared by the
    /// next applied update.
    pub fn last_error(&self) -> Option<String> {
        self.snapshot.borrow().last_error.clone()
    }

    /// Connected and confirmed by the server.
    pub fn is_live(&self) -> bool {
        self.manager.is_connected() && self.manager.is_subscribed(&self.channel)
    }

    /// Send `{channel}_update`. Returns `Ok(false)` without queueing when
    /// the session is not connected.
    pub fn publish(&self, data: impl Serialize) -> SyncResult<bool> {
        let payload = serde_json::to_value(data)?;
        Ok(self.manager.publish(&self.channel, payload))
    }

    pub fn close(self) {
        tracing::debug!(channel = %self.channel, id = ?self.registration.id(), "closing facade");
    }
}
