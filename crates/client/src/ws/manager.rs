//! Connection manager for the real-time sync session.
//!
//! Owns the transport, the reconnect timer, the connection state and the
//! subscription registry. Everything runs on one thread: the manager is
//! driven by [`ConnectionManager::handle_transport_event`] and
//! [`ConnectionManager::timer_fired`], and consumer callbacks are only ever
//! invoked after the internal borrow has been released, so callbacks may
//! call back into the manager.
//!
//! ```text
//! Disconnected ──start──▶ Connecting ──connect──▶ Authenticating ──ack ok──▶ Connected
//!                            │  ▲                      │ ack failure           │
//!                       error│  │timer                 ▼                       │disconnect
//!                            ▼  │                    Failed ◀── cap exceeded ──┤
//!                        Reconnecting(n) ◀─────────────────────────────────────┘
//! ```

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use grantline_shared::{ClientCommand, ServerEvent, SessionIdentity, SyncError, WsEnvelope};
use serde_json::Value;

use super::connection::{
    ConnectionId, ConnectionState, ReconnectConfig, Scheduler, TimerId, Transport, TransportEvent,
};
use super::registry::{AckOutcome, Callback, RegistrationId, RegistryAction, SubscriptionRegistry};
use super::router::{self, Delivery};

/// Supplies the identity the session should run as. `None` means signed
/// out.
pub trait IdentityProvider {
    fn current_identity(&self) -> Option<SessionIdentity>;
}

impl IdentityProvider for Option<SessionIdentity> {
    fn current_identity(&self) -> Option<SessionIdentity> {
        self.clone()
    }
}

type StateCallback = Rc<dyn Fn(&ConnectionState)>;

/// Work deferred until the borrow on `Inner` is released.
enum Effect {
    StateChanged(ConnectionState),
    Deliver(Vec<Delivery>),
}

/// A handle asking to be removed.
#[derive(Debug, Clone, Copy)]
enum Removal {
    Consumer(RegistrationId),
    Listener(u64),
}

struct Shared {
    inner: RefCell<Inner>,
    /// Removals requested while `inner` was borrowed, applied on the next
    /// flush.
    deferred: RefCell<Vec<Removal>>,
}

struct Inner {
    config: ReconnectConfig,
    state: ConnectionState,
    identity: Option<SessionIdentity>,
    transport: Box<dyn Transport>,
    scheduler: Box<dyn Scheduler>,
    reconnect_timer: Option<TimerId>,
    /// The transport connection whose events are current.
    connection: Option<ConnectionId>,
    attempt: u32,
    registry: SubscriptionRegistry,
    listeners: Vec<(u64, StateCallback)>,
    next_listener: u64,
    effects: Vec<Effect>,
}

impl Inner {
    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        tracing::info!(from = %self.state, to = %state, "connection state changed");
        self.state = state.clone();
        self.effects.push(Effect::StateChanged(state));
    }

    fn tenant_id(&self) -> String {
        self.identity
            .as_ref()
            .map(|i| i.tenant_id.clone())
            .unwrap_or_default()
    }

    fn send(&mut self, command: ClientCommand) -> bool {
        tracing::debug!(?command, "sending");
        match self.transport.send(WsEnvelope::new(command)) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "send failed");
                false
            }
        }
    }

    fn apply(&mut self, action: RegistryAction) {
        let tenant_id = self.tenant_id();
        let command = match action {
            RegistryAction::Subscribe(channel) => ClientCommand::Subscribe { channel, tenant_id },
            RegistryAction::Unsubscribe(channel) => ClientCommand::Unsubscribe { channel, tenant_id },
        };
        self.send(command);
    }

    fn cancel_timer(&mut self) {
        if let Some(id) = self.reconnect_timer.take() {
            self.scheduler.cancel(id);
        }
    }

    fn begin_connect(&mut self) {
        self.cancel_timer();
        self.set_state(ConnectionState::Connecting);
        self.connection = Some(self.transport.connect());
    }

    /// Close the transport and forget everything the server knew.
    fn teardown(&mut self) {
        self.cancel_timer();
        self.connection = None;
        self.transport.disconnect();
        self.registry.reset_server_state();
    }

    /// React to a transport failure. `fallback` is the state to settle in
    /// when auto-reconnect is off.
    fn connection_lost(&mut self, reason: String, fallback: ConnectionState) {
        self.cancel_timer();
        self.connection = None;
        self.registry.reset_server_state();

        if !self.config.auto_reconnect {
            tracing::warn!(%reason, "connection lost, auto-reconnect disabled");
            self.set_state(fallback);
            return;
        }

        self.attempt += 1;
        if !self.config.allows_attempt(self.attempt) {
            tracing::error!(%reason, attempts = self.config.max_attempts, "giving up on reconnect");
            self.set_state(ConnectionState::Failed {
                reason: format!(
                    "Max reconnect attempts ({}) exceeded: {}",
                    self.config.max_attempts, reason
                ),
            });
            return;
        }

        tracing::info!(
            %reason,
            attempt = self.attempt,
            delay_ms = self.config.delay.as_millis() as u64,
            "scheduling reconnect"
        );
        self.set_state(ConnectionState::Reconnecting {
            attempt: self.attempt,
        });
        self.reconnect_timer = Some(self.scheduler.schedule(self.config.delay));
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                if self.state != ConnectionState::Connecting {
                    tracing::debug!(state = %self.state, "ignoring stray connect event");
                    return;
                }
                let Some(identity) = self.identity.clone() else {
                    tracing::warn!("connected without an identity, closing");
                    self.connection = None;
                    self.transport.disconnect();
                    self.set_state(ConnectionState::Disconnected);
                    return;
                };
                self.set_state(ConnectionState::Authenticating);
                self.send(ClientCommand::authenticate(&identity));
            }
            TransportEvent::Error(reason) | TransportEvent::Disconnected(reason) => {
                match self.state {
                    ConnectionState::Connecting => {
                        let fallback = ConnectionState::Failed {
                            reason: reason.clone(),
                        };
                        self.connection_lost(reason, fallback);
                    }
                    ConnectionState::Authenticating | ConnectionState::Connected => {
                        self.connection_lost(reason, ConnectionState::Disconnected);
                    }
                    _ => tracing::debug!(state = %self.state, %reason, "ignoring transport loss"),
                }
            }
            TransportEvent::Message(event) => self.on_server_event(event),
        }
    }

    fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Authenticated {
                status,
                room,
                message,
            } => {
                if self.state != ConnectionState::Authenticating {
                    tracing::debug!(state = %self.state, "ignoring unexpected authenticated event");
                    return;
                }
                if status.is_success() {
                    tracing::info!(room = room.as_deref().unwrap_or(""), "authenticated");
                    self.attempt = 0;
                    self.set_state(ConnectionState::Connected);
                    for channel in self.registry.take_resubscriptions() {
                        self.apply(RegistryAction::Subscribe(channel));
                    }
                } else {
                    let reason = message.unwrap_or_else(|| "authentication rejected".to_string());
                    let error = SyncError::AuthenticationRejected(reason.clone());
                    tracing::error!(%error, "session is not authorized");
                    self.teardown();
                    self.set_state(ConnectionState::Failed { reason });
                }
            }
            ServerEvent::Subscribed {
                channel,
                status,
                message,
            } => {
                let connected = self.state.is_connected();
                match self.registry.acknowledge(&channel, status, message, connected) {
                    AckOutcome::Confirmed => tracing::debug!(%channel, "subscription confirmed"),
                    AckOutcome::Rejected(reason) => {
                        let error = SyncError::SubscriptionRejected {
                            channel: channel.clone(),
                            reason: reason.clone(),
                        };
                        tracing::warn!(%error, "subscription rejected");
                        let deliveries = router::route_rejection(&self.registry, &channel, &reason);
                        self.effects.push(Effect::Deliver(deliveries));
                    }
                    AckOutcome::Superseded(action) => {
                        if let Some(action) = action {
                            self.apply(action);
                        }
                    }
                    AckOutcome::Unknown => {}
                }
            }
            ServerEvent::Unsubscribed { channel } => {
                tracing::debug!(%channel, "unsubscribe confirmed");
            }
            ServerEvent::Update(envelope) => {
                if let Some(identity) = &self.identity {
                    if envelope.tenant_id != identity.tenant_id {
                        tracing::warn!(
                            tenant = %envelope.tenant_id,
                            expected = %identity.tenant_id,
                            "dropping update for another tenant"
                        );
                        return;
                    }
                }
                let deliveries = router::route(&self.registry, envelope);
                self.effects.push(Effect::Deliver(deliveries));
            }
            ServerEvent::Error { code, message } => {
                tracing::warn!(%code, %message, "server reported an error");
            }
        }
    }
}

impl Inner {
    fn remove_consumer(&mut self, id: RegistrationId) -> Option<Callback> {
        let connected = self.state.is_connected();
        let (callback, action) = self.registry.deregister(id, connected)?;
        if let Some(action) = action {
            self.apply(action);
        }
        Some(callback)
    }

    fn remove_listener(&mut self, id: u64) -> Option<StateCallback> {
        let position = self.listeners.iter().position(|(listener, _)| *listener == id)?;
        Some(self.listeners.remove(position).1)
    }
}

/// Handle to a sync session. Clones share the same session.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Rc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        config: ReconnectConfig,
        transport: impl Transport + 'static,
        scheduler: impl Scheduler + 'static,
    ) -> Self {
        let inner = Inner {
            config,
            state: ConnectionState::Disconnected,
            identity: None,
            transport: Box::new(transport),
            scheduler: Box::new(scheduler),
            reconnect_timer: None,
            connection: None,
            attempt: 0,
            registry: SubscriptionRegistry::new(),
            listeners: Vec::new(),
            next_listener: 0,
            effects: Vec::new(),
        };
        Self {
            shared: Rc::new(Shared {
                inner: RefCell::new(inner),
                deferred: RefCell::new(Vec::new()),
            }),
        }
    }

    /// Run deferred removals, state notifications and deliveries with no
    /// borrow held.
    fn flush(&self) {
        loop {
            let deferred = std::mem::take(&mut *self.shared.deferred.borrow_mut());
            for removal in deferred {
                self.remove(removal);
            }
            let effects = std::mem::take(&mut self.shared.inner.borrow_mut().effects);
            if effects.is_empty() {
                return;
            }
            for effect in effects {
                match effect {
                    Effect::StateChanged(state) => {
                        let listeners: Vec<StateCallback> = self
                            .shared
                            .inner
                            .borrow()
                            .listeners
                            .iter()
                            .map(|(_, cb)| cb.clone())
                            .collect();
                        for listener in listeners {
                            listener(&state);
                        }
                    }
                    Effect::Deliver(deliveries) => {
                        router::deliver(deliveries);
                    }
                }
            }
        }
    }

    /// Begin a session. A no-op while already active for the same
    /// identity. A different identity tears the current connection down
    /// first.
    pub fn start(&self, identity: SessionIdentity) {
        {
            let mut inner = self.shared.inner.borrow_mut();
            let same = inner
                .identity
                .as_ref()
                .is_some_and(|current| current.same_session(&identity));
            if same && inner.state.is_active() {
                tracing::debug!(user = %identity.user_id, "start ignored, session already active");
                return;
            }
            if inner.state.is_active() {
                tracing::info!(user = %identity.user_id, tenant = %identity.tenant_id, "identity changed, reconnecting");
                inner.teardown();
                inner.set_state(ConnectionState::Disconnected);
            }
            tracing::info!(user = %identity.user_id, tenant = %identity.tenant_id, "starting session");
            inner.identity = Some(identity);
            inner.attempt = 0;
            inner.begin_connect();
        }
        self.flush();
    }

    /// Close the session from any state. Registrations are kept for a later
    /// `start`.
    pub fn stop(&self) {
        {
            let mut inner = self.shared.inner.borrow_mut();
            tracing::info!(state = %inner.state, "stopping session");
            inner.teardown();
            inner.attempt = 0;
            inner.set_state(ConnectionState::Disconnected);
        }
        self.flush();
    }

    /// Follow the identity collaborator: signed out stops the session, a
    /// new identity restarts it.
    pub fn sync_identity(&self, provider: &dyn IdentityProvider) {
        match provider.current_identity() {
            Some(identity) => self.start(identity),
            None => self.stop(),
        }
    }

    pub fn current_state(&self) -> ConnectionState {
        self.shared.inner.borrow().state.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.inner.borrow().state.is_connected()
    }

    pub fn identity(&self) -> Option<SessionIdentity> {
        self.shared.inner.borrow().identity.clone()
    }

    pub fn on_state_change(&self, callback: impl Fn(&ConnectionState) + 'static) -> StateSubscription {
        let mut inner = self.shared.inner.borrow_mut();
        inner.next_listener += 1;
        let id = inner.next_listener;
        inner.listeners.push((id, Rc::new(callback)));
        StateSubscription {
            id,
            manager: Rc::downgrade(&self.shared),
        }
    }

    /// Apply an event from the current transport connection.
    pub fn handle_transport_event(&self, event: TransportEvent) {
        self.shared.inner.borrow_mut().on_transport_event(event);
        self.flush();
    }

    /// Apply an event tagged with the connection it came from. Events from
    /// a connection that has since been closed or replaced are dropped.
    pub fn handle_connection_event(&self, connection: ConnectionId, event: TransportEvent) {
        let current = self.shared.inner.borrow().connection;
        if current != Some(connection) {
            tracing::debug!(?connection, ?current, ?event, "dropping event from a stale connection");
            return;
        }
        self.handle_transport_event(event);
    }

    pub fn timer_fired(&self, id: TimerId) {
        {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.reconnect_timer != Some(id) {
                tracing::debug!(?id, "stale timer ignored");
                return;
            }
            inner.reconnect_timer = None;
            if matches!(inner.state, ConnectionState::Reconnecting { .. }) {
                inner.begin_connect();
            }
        }
        self.flush();
    }

    /// Send a command over the live connection.
    pub fn send(&self, command: ClientCommand) -> Result<(), SyncError> {
        let mut inner = self.shared.inner.borrow_mut();
        if !inner.state.is_connected() {
            return Err(SyncError::NotConnected);
        }
        inner.transport.send(WsEnvelope::new(command))
    }

    /// Add a consumer for `channel`. The returned handle removes it when
    /// closed or dropped.
    pub fn register(&self, channel: &str, callback: Callback) -> Registration {
        let id = {
            let mut inner = self.shared.inner.borrow_mut();
            let connected = inner.state.is_connected();
            let (id, action) = inner.registry.register(channel, callback, connected);
            if let Some(action) = action {
                inner.apply(action);
            }
            id
        };
        Registration {
            id,
            channel: channel.to_string(),
            manager: Rc::downgrade(&self.shared),
        }
    }

    /// Remove a consumer. Unknown or already removed ids are ignored.
    pub fn deregister(&self, id: RegistrationId) {
        self.remove(Removal::Consumer(id));
    }

    /// Apply a removal now, or queue it for the next flush when the manager
    /// is borrowed further up the stack. Removed callbacks are dropped after
    /// the borrow is released.
    fn remove(&self, removal: Removal) {
        let mut consumer = None;
        let mut listener = None;
        {
            let Ok(mut inner) = self.shared.inner.try_borrow_mut() else {
                tracing::debug!(?removal, "manager busy, deferring removal");
                self.shared.deferred.borrow_mut().push(removal);
                return;
            };
            match removal {
                Removal::Consumer(id) => consumer = inner.remove_consumer(id),
                Removal::Listener(id) => listener = inner.remove_listener(id),
            }
        }
        drop(consumer);
        drop(listener);
    }

    /// Ask the server again for a channel, typically after a rejection.
    pub fn resubscribe(&self, channel: &str) -> bool {
        let mut inner = self.shared.inner.borrow_mut();
        let connected = inner.state.is_connected();
        match inner.registry.resubscribe(channel, connected) {
            Some(action) => {
                inner.apply(action);
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.shared.inner.borrow().registry.is_subscribed(channel)
    }

    pub fn consumer_count(&self, channel: &str) -> u32 {
        self.shared.inner.borrow().registry.consumer_count(channel)
    }

    /// Send `{channel}_update` with `payload`. Returns whether the frame was
    /// handed to the transport; nothing is queued while offline.
    pub fn publish(&self, channel: &str, payload: Value) -> bool {
        let mut inner = self.shared.inner.borrow_mut();
        if !inner.state.is_connected() {
            tracing::debug!(%channel, state = %inner.state, "publish skipped, not connected");
            return false;
        }
        inner.send(ClientCommand::Update {
            message_type: format!("{channel}_update"),
            payload,
        })
    }
}

/// A consumer registration. Deregisters on [`Registration::close`] or drop.
pub struct Registration {
    id: RegistrationId,
    channel: String,
    manager: Weak<Shared>,
}

impl Registration {
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn close(self) {}
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(shared) = self.manager.upgrade() {
            ConnectionManager { shared }.deregister(self.id);
        }
    }
}

/// A state-change listener. Unregisters on [`StateSubscription::close`] or
/// drop.
pub struct StateSubscription {
    id: u64,
    manager: Weak<Shared>,
}

impl StateSubscription {
    pub fn close(self) {}
}

impl Drop for StateSubscription {
    fn drop(&mut self) {
        if let Some(shared) = self.manager.upgrade() {
            ConnectionManager { shared }.remove(Removal::Listener(self.id));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::time::Duration;

    use grantline_shared::AckStatus;
    use serde_json::json;

    use super::*;
    use crate::ws::registry::callback;
    use crate::ws::test_support::{
        authenticated, connected_harness, harness, subscribed, update, ManualScheduler, MockTransport,
    };

    fn identity() -> SessionIdentity {
        SessionIdentity::new("u1", "t1").with_email("u1@example.org")
    }

    fn fast_config(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            auto_reconnect: true,
            delay: Duration::from_millis(100),
            max_attempts,
        }
    }

    fn recorder(log: &Rc<RefCell<Vec<String>>>, name: &'static str) -> Callback {
        let log = log.clone();
        callback(move |_| {
            log.borrow_mut().push(name.to_string());
            Ok(())
        })
    }

    #[test]
    fn start_connect_and_authenticate() {
        let (manager, transport, _) = harness(ReconnectConfig::default());
        manager.start(identity());
        assert_eq!(manager.current_state(), ConnectionState::Connecting);
        assert_eq!(transport.connects(), 1);

        manager.handle_transport_event(TransportEvent::Connected);
        assert_eq!(manager.current_state(), ConnectionState::Authenticating);
        assert_eq!(
            transport.sent(),
            vec![ClientCommand::Authenticate {
                user_id: "u1".into(),
                tenant_id: "t1".into(),
                email: "u1@example.org".into(),
            }]
        );

        manager.handle_transport_event(authenticated(AckStatus::Success, None));
        assert_eq!(manager.current_state(), ConnectionState::Connected);
    }

    #[test]
    fn start_is_idempotent_for_same_identity() {
        let (manager, transport, _) = connected_harness(ReconnectConfig::default(), identity());
        manager.start(identity());
        assert_eq!(transport.connects(), 1);
        assert_eq!(transport.disconnects(), 0);
        assert!(manager.is_connected());
    }

    #[test]
    fn identity_change_reconnects() {
        let (manager, transport, _) = connected_harness(ReconnectConfig::default(), identity());
        let states = Rc::new(RefCell::new(Vec::new()));
        let seen = states.clone();
        let _sub = manager.on_state_change(move |s| seen.borrow_mut().push(s.clone()));

        manager.start(SessionIdentity::new("u1", "t2"));
        assert_eq!(transport.disconnects(), 1);
        assert_eq!(transport.connects(), 2);
        assert_eq!(
            *states.borrow(),
            vec![ConnectionState::Disconnected, ConnectionState::Connecting]
        );
    }

    #[test]
    fn auth_failure_is_fatal() {
        let (manager, transport, scheduler) = harness(ReconnectConfig::default());
        manager.start(identity());
        manager.handle_transport_event(TransportEvent::Connected);
        manager.handle_transport_event(authenticated(AckStatus::Failure, Some("unknown tenant")));

        assert_eq!(
            manager.current_state(),
            ConnectionState::Failed {
                reason: "unknown tenant".into()
            }
        );
        assert_eq!(transport.disconnects(), 1);
        assert!(scheduler.pending().is_empty());

        // The closing transport must not trigger a retry.
        manager.handle_transport_event(TransportEvent::Disconnected("closed".into()));
        assert!(scheduler.pending().is_empty());
    }

    #[test]
    fn connect_error_without_auto_reconnect_fails() {
        let config = ReconnectConfig {
            auto_reconnect: false,
            ..ReconnectConfig::default()
        };
        let (manager, _, scheduler) = harness(config);
        manager.start(identity());
        manager.handle_transport_event(TransportEvent::Error("refused".into()));
        assert_eq!(
            manager.current_state(),
            ConnectionState::Failed {
                reason: "refused".into()
            }
        );
        assert!(scheduler.pending().is_empty());
    }

    #[test]
    fn disconnect_without_auto_reconnect_settles_disconnected() {
        let config = ReconnectConfig {
            auto_reconnect: false,
            ..ReconnectConfig::default()
        };
        let (manager, _, _) = connected_harness(config, identity());
        manager.handle_transport_event(TransportEvent::Disconnected("reset".into()));
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
    }

    #[test]
    fn bounded_retry_with_fixed_delay() {
        let (manager, transport, scheduler) = harness(fast_config(3));
        let states = Rc::new(RefCell::new(Vec::new()));
        let seen = states.clone();
        let _sub = manager.on_state_change(move |s| seen.borrow_mut().push(s.clone()));

        manager.start(identity());
        for attempt in 1..=3 {
            manager.handle_transport_event(TransportEvent::Error("refused".into()));
            assert_eq!(manager.current_state(), ConnectionState::Reconnecting { attempt });
            let (timer, delay) = scheduler.pending()[0];
            assert_eq!(delay, Duration::from_millis(100));
            scheduler.fire(&manager, timer);
            assert_eq!(manager.current_state(), ConnectionState::Connecting);
        }
        manager.handle_transport_event(TransportEvent::Error("refused".into()));

        assert!(matches!(manager.current_state(), ConnectionState::Failed { .. }));
        assert!(scheduler.pending().is_empty());
        assert_eq!(transport.connects(), 4);

        let reconnecting: Vec<_> = states
            .borrow()
            .iter()
            .filter(|s| matches!(s, ConnectionState::Reconnecting { .. } | ConnectionState::Failed { .. }))
            .cloned()
            .collect();
        assert_eq!(reconnecting.len(), 4);
        assert_eq!(reconnecting[0], ConnectionState::Reconnecting { attempt: 1 });
        assert_eq!(reconnecting[2], ConnectionState::Reconnecting { attempt: 3 });
    }

    #[test]
    fn successful_reconnect_resets_attempts() {
        let (manager, _, scheduler) = connected_harness(fast_config(2), identity());
        for _ in 0..3 {
            manager.handle_transport_event(TransportEvent::Disconnected("reset".into()));
            assert_eq!(manager.current_state(), ConnectionState::Reconnecting { attempt: 1 });
            let (timer, _) = scheduler.pending()[0];
            scheduler.fire(&manager, timer);
            manager.handle_transport_event(TransportEvent::Connected);
            manager.handle_transport_event(authenticated(AckStatus::Success, None));
            assert!(manager.is_connected());
        }
    }

    #[test]
    fn stop_cancels_pending_reconnect() {
        let (manager, transport, scheduler) = connected_harness(fast_config(3), identity());
        manager.handle_transport_event(TransportEvent::Disconnected("reset".into()));
        let (timer, _) = scheduler.pending()[0];

        manager.stop();
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
        assert!(scheduler.pending().is_empty());
        assert_eq!(scheduler.cancelled(), vec![timer]);

        // A late expiry does nothing.
        manager.timer_fired(timer);
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
        assert_eq!(transport.connects(), 1);
    }

    #[test]
    fn registering_twice_sends_one_subscribe() {
        let (manager, transport, _) = connected_harness(ReconnectConfig::default(), identity());
        let log = Rc::new(RefCell::new(Vec::new()));
        let first = manager.register("grants", recorder(&log, "first"));
        let _second = manager.register("grants", recorder(&log, "second"));
        assert_eq!(transport.subscribes(), vec!["grants".to_string()]);

        first.close();
        assert!(transport.unsubscribes().is_empty());
        manager.handle_transport_event(update("grant_update", json!({})));
        assert_eq!(*log.borrow(), vec!["second".to_string()]);
        assert_eq!(manager.consumer_count("grants"), 1);
    }

    #[test]
    fn last_close_unsubscribes() {
        let (manager, transport, _) = connected_harness(ReconnectConfig::default(), identity());
        let registration = manager.register("kpis", callback(|_| Ok(())));
        let id = registration.id();
        drop(registration);
        assert_eq!(transport.unsubscribes(), vec!["kpis".to_string()]);
        assert_eq!(manager.consumer_count("kpis"), 0);

        manager.deregister(id);
        assert_eq!(transport.unsubscribes().len(), 1);
    }

    #[test]
    fn registration_before_connect_is_flushed_on_connect() {
        let (manager, transport, _) = harness(ReconnectConfig::default());
        let _registration = manager.register("kpis", callback(|_| Ok(())));
        assert!(transport.subscribes().is_empty());

        manager.start(identity());
        manager.handle_transport_event(TransportEvent::Connected);
        assert!(transport.subscribes().is_empty());
        manager.handle_transport_event(authenticated(AckStatus::Success, None));
        assert_eq!(transport.subscribes(), vec!["kpis".to_string()]);
    }

    #[test]
    fn reconnect_resubscribes_live_channels_only() {
        let (manager, transport, scheduler) = connected_harness(fast_config(3), identity());
        let _kpis = manager.register("kpis", callback(|_| Ok(())));
        let _grants = manager.register("grants", callback(|_| Ok(())));
        let gone = manager.register("activities", callback(|_| Ok(())));
        manager.handle_transport_event(subscribed("kpis", AckStatus::Success));
        gone.close();
        transport.clear_sent();

        manager.handle_transport_event(TransportEvent::Disconnected("reset".into()));
        assert!(!manager.is_subscribed("kpis"));
        let (timer, _) = scheduler.pending()[0];
        scheduler.fire(&manager, timer);
        manager.handle_transport_event(TransportEvent::Connected);
        manager.handle_transport_event(authenticated(AckStatus::Success, None));

        let mut resent = transport.subscribes();
        resent.sort();
        assert_eq!(resent, vec!["grants".to_string(), "kpis".to_string()]);
    }

    #[test]
    fn registrations_survive_stop_and_start() {
        let (manager, transport, _) = connected_harness(ReconnectConfig::default(), identity());
        let _kpis = manager.register("kpis", callback(|_| Ok(())));
        manager.stop();
        transport.clear_sent();

        manager.start(identity());
        manager.handle_transport_event(TransportEvent::Connected);
        manager.handle_transport_event(authenticated(AckStatus::Success, None));
        assert_eq!(transport.subscribes(), vec!["kpis".to_string()]);
    }

    #[test]
    fn rejection_reaches_channel_callbacks_and_keeps_registration() {
        let (manager, transport, _) = connected_harness(ReconnectConfig::default(), identity());
        let rejected = Rc::new(RefCell::new(Vec::new()));
        let seen = rejected.clone();
        let _grants = manager.register(
            "grants",
            callback(move |event| {
                if let crate::ws::ChannelEvent::Rejected { reason, .. } = event {
                    seen.borrow_mut().push(reason.clone());
                }
                Ok(())
            }),
        );
        let kpi_log = Rc::new(RefCell::new(Vec::new()));
        let _kpis = manager.register("kpis", recorder(&kpi_log, "kpis"));

        manager.handle_transport_event(TransportEvent::Message(ServerEvent::Subscribed {
            channel: "grants".into(),
            status: AckStatus::Failure,
            message: Some("forbidden".into()),
        }));
        assert_eq!(*rejected.borrow(), vec!["forbidden".to_string()]);
        assert!(kpi_log.borrow().is_empty());
        assert_eq!(manager.consumer_count("grants"), 1);

        transport.clear_sent();
        assert!(manager.resubscribe("grants"));
        assert_eq!(transport.subscribes(), vec!["grants".to_string()]);
    }

    #[test]
    fn updates_for_other_tenants_are_dropped() {
        let (manager, _, _) = connected_harness(ReconnectConfig::default(), identity());
        let log = Rc::new(RefCell::new(Vec::new()));
        let _kpis = manager.register("kpis", recorder(&log, "kpis"));

        let mut event = update("kpi_update", json!({}));
        if let TransportEvent::Message(ServerEvent::Update(envelope)) = &mut event {
            envelope.tenant_id = "t2".into();
        }
        manager.handle_transport_event(event);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn publish_is_gated_on_connection() {
        let (manager, transport, _) = harness(ReconnectConfig::default());
        assert!(!manager.publish("grants", json!({"id": 1})));
        manager.start(identity());
        manager.handle_transport_event(TransportEvent::Connected);
        transport.clear_sent();
        assert!(!manager.publish("grants", json!({"id": 1})));
        assert!(transport.sent().is_empty());
        assert!(matches!(
            manager.send(ClientCommand::Unsubscribe {
                channel: "grants".into(),
                tenant_id: "t1".into()
            }),
            Err(SyncError::NotConnected)
        ));

        manager.handle_transport_event(authenticated(AckStatus::Success, None));
        assert!(manager.publish("grants", json!({"id": 1})));
        assert_eq!(
            transport.sent(),
            vec![ClientCommand::Update {
                message_type: "grants_update".into(),
                payload: json!({"id": 1}),
            }]
        );
    }

    #[test]
    fn callbacks_may_reenter_the_manager() {
        let (manager, _, _) = connected_harness(ReconnectConfig::default(), identity());
        let handle = manager.clone();
        let published = Rc::new(RefCell::new(false));
        let flag = published.clone();
        let _grants = manager.register(
            "grants",
            callback(move |_| {
                *flag.borrow_mut() = handle.publish("grants", json!({"echo": true}));
                Ok(())
            }),
        );
        manager.handle_transport_event(update("grants_change", json!({})));
        assert!(*published.borrow());
    }

    #[test]
    fn state_listener_can_be_closed() {
        let (manager, _, _) = harness(ReconnectConfig::default());
        let count = Rc::new(RefCell::new(0));
        let seen = count.clone();
        let sub = manager.on_state_change(move |_| *seen.borrow_mut() += 1);
        manager.start(identity());
        sub.close();
        manager.stop();
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn sync_identity_follows_provider() {
        let (manager, transport, _) = connected_harness(ReconnectConfig::default(), identity());
        manager.sync_identity(&None::<SessionIdentity>);
        assert_eq!(manager.current_state(), ConnectionState::Disconnected);
        manager.sync_identity(&Some(identity()));
        assert_eq!(manager.current_state(), ConnectionState::Connecting);
        assert_eq!(transport.connects(), 2);
    }

    #[test]
    fn returning_consumer_does_not_duplicate_an_unanswered_subscribe() {
        let (manager, transport, _) = connected_harness(ReconnectConfig::default(), identity());
        drop(manager.register("kpis", callback(|_| Ok(()))));
        let _kpis = manager.register("kpis", callback(|_| Ok(())));
        assert_eq!(transport.subscribes(), vec!["kpis".to_string()]);
        assert_eq!(transport.unsubscribes(), vec!["kpis".to_string()]);

        // Answers the first subscribe, which the unsubscribe has overtaken.
        manager.handle_transport_event(subscribed("kpis", AckStatus::Success));
        assert!(!manager.is_subscribed("kpis"));
        assert_eq!(transport.subscribes().len(), 2);

        manager.handle_transport_event(subscribed("kpis", AckStatus::Success));
        assert!(manager.is_subscribed("kpis"));
    }

    #[test]
    fn events_from_a_replaced_connection_are_ignored() {
        let (manager, _, scheduler) = connected_harness(fast_config(3), identity());
        manager.start(SessionIdentity::new("u2", "t1"));

        manager.handle_connection_event(ConnectionId(1), TransportEvent::Disconnected("closed".into()));
        assert_eq!(manager.current_state(), ConnectionState::Connecting);
        assert!(scheduler.pending().is_empty());

        manager.handle_connection_event(ConnectionId(2), TransportEvent::Connected);
        assert_eq!(manager.current_state(), ConnectionState::Authenticating);
    }

    #[test]
    fn identity_change_while_reconnecting_cancels_the_timer() {
        let (manager, transport, scheduler) = connected_harness(fast_config(3), identity());
        manager.handle_transport_event(TransportEvent::Disconnected("reset".into()));
        assert_eq!(manager.current_state(), ConnectionState::Reconnecting { attempt: 1 });
        let (timer, _) = scheduler.pending()[0];

        manager.start(SessionIdentity::new("u2", "t2"));
        assert_eq!(manager.current_state(), ConnectionState::Connecting);
        assert!(scheduler.pending().is_empty());
        assert_eq!(scheduler.cancelled(), vec![timer]);

        manager.timer_fired(timer);
        assert_eq!(manager.current_state(), ConnectionState::Connecting);
        assert_eq!(transport.connects(), 2);

        // The new session starts its own retry count.
        manager.handle_transport_event(TransportEvent::Error("refused".into()));
        assert_eq!(manager.current_state(), ConnectionState::Reconnecting { attempt: 1 });
    }

    #[test]
    fn identity_change_resubscribes_under_the_new_tenant() {
        let (manager, transport, _) = connected_harness(ReconnectConfig::default(), identity());
        let _kpis = manager.register("kpis", callback(|_| Ok(())));
        manager.handle_transport_event(subscribed("kpis", AckStatus::Success));
        transport.clear_sent();

        manager.start(SessionIdentity::new("u1", "t2"));
        assert!(!manager.is_subscribed("kpis"));
        manager.handle_transport_event(TransportEvent::Connected);
        manager.handle_transport_event(authenticated(AckStatus::Success, None));

        assert_eq!(
            transport.sent(),
            vec![
                ClientCommand::Authenticate {
                    user_id: "u1".into(),
                    tenant_id: "t2".into(),
                    email: String::new(),
                },
                ClientCommand::Subscribe {
                    channel: "kpis".into(),
                    tenant_id: "t2".into(),
                },
            ]
        );
    }

    /// Drops the handles it holds from inside `connect`, while the manager
    /// is mid-update.
    #[derive(Clone, Default)]
    struct DroppingTransport {
        held: Rc<RefCell<Vec<Box<dyn std::any::Any>>>>,
    }

    impl Transport for DroppingTransport {
        fn connect(&mut self) -> ConnectionId {
            self.held.borrow_mut().clear();
            ConnectionId(1)
        }

        fn disconnect(&mut self) {}

        fn send(&mut self, _frame: WsEnvelope<ClientCommand>) -> Result<(), SyncError> {
            Ok(())
        }
    }

    #[test]
    fn handles_dropped_while_busy_are_still_removed() {
        let transport = DroppingTransport::default();
        let manager = ConnectionManager::new(
            ReconnectConfig::default(),
            transport.clone(),
            ManualScheduler::default(),
        );
        let calls = Rc::new(RefCell::new(0));
        let seen = calls.clone();
        let registration = manager.register("kpis", callback(|_| Ok(())));
        let listener = manager.on_state_change(move |_| *seen.borrow_mut() += 1);
        transport.held.borrow_mut().push(Box::new(registration));
        transport.held.borrow_mut().push(Box::new(listener));

        manager.start(identity());
        assert_eq!(manager.current_state(), ConnectionState::Connecting);
        assert_eq!(manager.consumer_count("kpis"), 0);
        assert_eq!(*calls.borrow(), 0);
    }

    #[test]
    fn isolated_managers_do_not_share_state() {
        let (a, transport_a, _) = connected_harness(ReconnectConfig::default(), identity());
        let b = ConnectionManager::new(
            ReconnectConfig::default(),
            MockTransport::default(),
            ManualScheduler::default(),
        );
        let _reg = b.register("kpis", callback(|_| Ok(())));
        assert!(a.is_connected());
        assert_eq!(b.current_state(), ConnectionState::Disconnected);
        assert!(transport_a.subscribes().is_empty());
    }
}
