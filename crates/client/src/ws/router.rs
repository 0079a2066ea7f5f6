//! Message router: resolves an inbound update to channels and fans it out.
//!
//! Routing is a pure function of the envelope and the registry contents.
//! An envelope targets channel `C` when:
//!
//! - it names `C` explicitly in its `channel` field, or
//! - its `messageType` equals `C`, or
//! - its `messageType` is `{C}_update`, `{C}_change` or `{C}_milestone`,
//!   where `{C}` may also be the singular form of the channel name
//!   (`kpi_update` targets `kpis`, `activity_change` targets `activities`).
//!
//! The `all` channel receives every envelope.

use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use grantline_shared::{SyncError, UpdateEnvelope};

use super::registry::{Callback, ChannelEvent, SubscriptionRegistry};

pub const WILDCARD_CHANNEL: &str = "all";

/// Fixed suffix vocabulary for derived message types.
pub const MESSAGE_SUFFIXES: [&str; 3] = ["update", "change", "milestone"];

/// A callback paired with the event it should receive.
pub struct Delivery {
    callback: Callback,
    event: Rc<ChannelEvent>,
}

impl Delivery {
    pub fn event(&self) -> &ChannelEvent {
        &self.event
    }
}

fn singular(channel: &str) -> Option<String> {
    if let Some(stem) = channel.strip_suffix("ies") {
        Some(format!("{stem}y"))
    } else {
        channel.strip_suffix('s').map(str::to_string)
    }
}

/// Whether `message_type` addresses `channel` by name.
pub fn channel_matches(channel: &str, message_type: &str) -> bool {
    if message_type == channel {
        return true;
    }
    let Some((stem, suffix)) = message_type.rsplit_once('_') else {
        return false;
    };
    if !MESSAGE_SUFFIXES.contains(&suffix) {
        return false;
    }
    stem == channel || singular(channel).is_some_and(|s| s == stem)
}

/// Channels in `registry` targeted by `envelope`.
pub fn resolve<'r>(registry: &'r SubscriptionRegistry, envelope: &UpdateEnvelope) -> Vec<&'r str> {
    registry
        .channels()
        .map(|s| s.name())
        .filter(|name| {
            *name == WILDCARD_CHANNEL
                || match envelope.channel.as_deref() {
                    Some(explicit) => explicit == *name,
                    None => channel_matches(name, &envelope.message_type),
                }
        })
        .collect()
}

/// Build the deliveries for one inbound update. Callbacks of each matched
/// channel appear in registration order.
pub fn route(registry: &SubscriptionRegistry, envelope: UpdateEnvelope) -> Vec<Delivery> {
    let envelope = Rc::new(envelope);
    let mut deliveries = Vec::new();
    for channel in resolve(registry, &envelope) {
        let event = Rc::new(ChannelEvent::Update {
            channel: channel.to_string(),
            envelope: envelope.clone(),
        });
        deliveries.extend(registry.callbacks(channel).into_iter().map(|callback| Delivery {
            callback,
            event: event.clone(),
        }));
    }
    if deliveries.is_empty() {
        tracing::debug!(message_type = %envelope.message_type, "update matched no consumers");
    }
    deliveries
}

/// Deliveries telling every consumer of `channel` its subscription failed.
pub fn route_rejection(registry: &SubscriptionRegistry, channel: &str, reason: &str) -> Vec<Delivery> {
    let event = Rc::new(ChannelEvent::Rejected {
        channel: channel.to_string(),
        reason: reason.to_string(),
    });
    registry
        .callbacks(channel)
        .into_iter()
        .map(|callback| Delivery {
            callback,
            event: event.clone(),
        })
        .collect()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panicked: {message}")
    } else {
        "panicked".to_string()
    }
}

/// Invoke every delivery in order. A failing or panicking callback is
/// logged and skipped. Returns one [`SyncError::Callback`] per failure.
pub fn deliver(deliveries: Vec<Delivery>) -> Vec<SyncError> {
    let mut failures = Vec::new();
    for delivery in deliveries {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (delivery.callback)(delivery.event.as_ref())));
        let message = match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => format!("{e:#}"),
            Err(payload) => panic_message(payload.as_ref()),
        };
        let error = SyncError::Callback {
            channel: delivery.event.channel().to_string(),
            message,
        };
        tracing::error!(%error, "consumer callback failed");
        failures.push(error);
    }
    failures
}
