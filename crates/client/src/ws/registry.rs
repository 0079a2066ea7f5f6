//! Channel subscription registry.
//!
//! Multiplexes any number of consumer registrations onto one subscription
//! per channel. The registry never touches the transport: it returns
//! [`RegistryAction`]s and the manager sends them.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::Rc;

use grantline_shared::{AckStatus, UpdateEnvelope};

/// What a consumer callback is handed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Update {
        channel: String,
        envelope: Rc<UpdateEnvelope>,
    },
    /// The server refused the channel subscription.
    Rejected { channel: String, reason: String },
}

impl ChannelEvent {
    pub fn channel(&self) -> &str {
        match self {
            ChannelEvent::Update { channel, .. } | ChannelEvent::Rejected { channel, .. } => channel,
        }
    }
}

pub type Callback = Rc<dyn Fn(&ChannelEvent) -> anyhow::Result<()>>;

pub fn callback<F>(f: F) -> Callback
where
    F: Fn(&ChannelEvent) -> anyhow::Result<()> + 'static,
{
    Rc::new(f)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAck {
    Pending,
    Confirmed,
    Rejected(String),
}

/// How a `subscribed` verdict applied to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    Confirmed,
    Rejected(String),
    /// The verdict answered a request made before the channel was
    /// dropped. Carries the subscribe to re-issue when consumers came back.
    Superseded(Option<RegistryAction>),
    Unknown,
}

/// Transport work the registry needs done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryAction {
    Subscribe(String),
    Unsubscribe(String),
}

struct Consumer {
    id: RegistrationId,
    callback: Callback,
}

pub struct ChannelSubscription {
    name: String,
    consumers: Vec<Consumer>,
    server_ack: ServerAck,
    /// A subscribe request is on the wire and unanswered.
    in_flight: bool,
}

impl ChannelSubscription {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            consumers: Vec::new(),
            server_ack: ServerAck::Pending,
            in_flight: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn consumer_count(&self) -> u32 {
        self.consumers.len() as u32
    }

    pub fn server_ack(&self) -> &ServerAck {
        &self.server_ack
    }

    fn mark_requested(&mut self) {
        self.server_ack = ServerAck::Pending;
        self.in_flight = true;
    }
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    channels: BTreeMap<String, ChannelSubscription>,
    owners: HashMap<RegistrationId, String>,
    /// Channels dropped while their subscribe was still unanswered.
    orphaned: HashSet<String>,
    next_id: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a consumer. The first consumer of a channel creates its record
    /// and, when `connected`, asks for a subscribe request. Otherwise the
    /// request waits for the next connect. A channel whose earlier
    /// subscribe is still unanswered waits for that answer instead.
    pub fn register(
        &mut self,
        channel: &str,
        callback: Callback,
        connected: bool,
    ) -> (RegistrationId, Option<RegistryAction>) {
        self.next_id += 1;
        let id = RegistrationId(self.next_id);
        self.owners.insert(id, channel.to_string());

        let mut action = None;
        let orphaned = self.orphaned.contains(channel);
        let subscription = self.channels.entry(channel.to_string()).or_insert_with(|| {
            let mut created = ChannelSubscription::new(channel);
            if orphaned {
                created.in_flight = true;
            } else if connected {
                created.mark_requested();
                action = Some(RegistryAction::Subscribe(channel.to_string()));
            }
            created
        });
        subscription.consumers.push(Consumer { id, callback });

        tracing::debug!(
            channel,
            consumers = subscription.consumer_count(),
            "registered consumer"
        );
        (id, action)
    }

    /// Remove a consumer. Unknown ids are ignored. The removed callback is
    /// handed back so the caller can drop it outside any borrow.
    pub fn deregister(
        &mut self,
        id: RegistrationId,
        connected: bool,
    ) -> Option<(Callback, Option<RegistryAction>)> {
        let channel = self.owners.remove(&id)?;
        let subscription = self.channels.get_mut(&channel)?;
        let position = subscription.consumers.iter().position(|c| c.id == id)?;
        let removed = subscription.consumers.remove(position);

        let mut action = None;
        if subscription.consumers.is_empty() {
            if subscription.in_flight {
                self.orphaned.insert(channel.clone());
            }
            self.channels.remove(&channel);
            if connected {
                action = Some(RegistryAction::Unsubscribe(channel.clone()));
            }
            tracing::debug!(channel = %channel, "last consumer gone, dropping subscription");
        }
        Some((removed.callback, action))
    }

    /// Channels to subscribe after entering `Connected`. Each is marked
    /// in flight so it cannot be requested twice.
    pub fn take_resubscriptions(&mut self) -> Vec<String> {
        self.channels
            .values_mut()
            .filter(|s| !s.consumers.is_empty() && !s.in_flight)
            .map(|s| {
                s.mark_requested();
                s.name.clone()
            })
            .collect()
    }

    /// Forget in-flight requests and server confirmations. Called whenever
    /// the connection goes away; the records and consumers stay.
    pub fn reset_server_state(&mut self) {
        for subscription in self.channels.values_mut() {
            subscription.server_ack = ServerAck::Pending;
            subscription.in_flight = false;
        }
        self.orphaned.clear();
    }

    /// Apply a `subscribed` verdict.
    pub fn acknowledge(
        &mut self,
        channel: &str,
        status: AckStatus,
        message: Option<String>,
        connected: bool,
    ) -> AckOutcome {
        if self.orphaned.remove(channel) {
            // The server has since seen our unsubscribe, so the verdict says
            // nothing about the current record.
            let Some(subscription) = self.channels.get_mut(channel) else {
                tracing::debug!(channel, "late ack for dropped channel ignored");
                return AckOutcome::Superseded(None);
            };
            if !connected {
                subscription.in_flight = false;
                return AckOutcome::Superseded(None);
            }
            subscription.mark_requested();
            tracing::debug!(channel, "late ack for dropped channel, subscribing again");
            return AckOutcome::Superseded(Some(RegistryAction::Subscribe(channel.to_string())));
        }

        let Some(subscription) = self.channels.get_mut(channel) else {
            tracing::debug!(channel, "ack for unknown channel ignored");
            return AckOutcome::Unknown;
        };
        subscription.in_flight = false;
        if status.is_success() {
            subscription.server_ack = ServerAck::Confirmed;
            AckOutcome::Confirmed
        } else {
            let reason = message.unwrap_or_else(|| "subscription rejected".to_string());
            subscription.server_ack = ServerAck::Rejected(reason.clone());
            AckOutcome::Rejected(reason)
        }
    }

    /// Manual re-subscribe, typically after a rejection.
    pub fn resubscribe(&mut self, channel: &str, connected: bool) -> Option<RegistryAction> {
        let subscription = self.channels.get_mut(channel)?;
        if !connected || subscription.in_flight {
            return None;
        }
        subscription.mark_requested();
        Some(RegistryAction::Subscribe(channel.to_string()))
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|s| s.server_ack == ServerAck::Confirmed)
    }

    pub fn consumer_count(&self, channel: &str) -> u32 {
        self.channels.get(channel).map_or(0, |s| s.consumer_count())
    }

    pub fn subscription(&self, channel: &str) -> Option<&ChannelSubscription> {
        self.channels.get(channel)
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelSubscription> {
        self.channels.values()
    }

    /// Callbacks for `channel` in registration order.
    pub fn callbacks(&self, channel: &str) -> Vec<Callback> {
        self.channels
            .get(channel)
            .map(|s| s.consumers.iter().map(|c| c.callback.clone()).collect())
            .unwrap_or_default()
    }
}
