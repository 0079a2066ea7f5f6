//! Recording transport and hand-driven scheduler for tests.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use chrono::Utc;
use grantline_shared::{
    AckStatus, ClientCommand, ServerEvent, SessionIdentity, SyncError, UpdateEnvelope, WsEnvelope,
};
use serde_json::Value;

use super::connection::{
    ConnectionId, ReconnectConfig, Scheduler, TimerId, Transport, TransportEvent,
};
use super::manager::ConnectionManager;

#[derive(Default)]
struct TransportLog {
    connects: u32,
    disconnects: u32,
    sent: Vec<ClientCommand>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    log: Rc<RefCell<TransportLog>>,
}

impl MockTransport {
    pub fn connects(&self) -> u32 {
        self.log.borrow().connects
    }

    pub fn disconnects(&self) -> u32 {
        self.log.borrow().disconnects
    }

    pub fn sent(&self) -> Vec<ClientCommand> {
        self.log.borrow().sent.clone()
    }

    pub fn clear_sent(&self) {
        self.log.borrow_mut().sent.clear();
    }

    pub fn subscribes(&self) -> Vec<String> {
        self.channels_of(|c| matches!(c, ClientCommand::Subscribe { .. }))
    }

    pub fn unsubscribes(&self) -> Vec<String> {
        self.channels_of(|c| matches!(c, ClientCommand::Unsubscribe { .. }))
    }

    fn channels_of(&self, keep: impl Fn(&ClientCommand) -> bool) -> Vec<String> {
        self.log
            .borrow()
            .sent
            .iter()
            .filter(|c| keep(c))
            .filter_map(|c| c.channel().map(str::to_string))
            .collect()
    }
}

impl Transport for MockTransport {
    fn connect(&mut self) -> ConnectionId {
        let mut log = self.log.borrow_mut();
        log.connects += 1;
        ConnectionId(log.connects as u64)
    }

    fn disconnect(&mut self) {
        self.log.borrow_mut().disconnects += 1;
    }

    fn send(&mut self, frame: WsEnvelope<ClientCommand>) -> Result<(), SyncError> {
        self.log.borrow_mut().sent.push(frame.payload);
        Ok(())
    }
}

#[derive(Default)]
struct Timers {
    next: u64,
    pending: Vec<(TimerId, Duration)>,
    cancelled: Vec<TimerId>,
}

#[derive(Clone, Default)]
pub struct ManualScheduler {
    timers: Rc<RefCell<Timers>>,
}

impl ManualScheduler {
    pub fn pending(&self) -> Vec<(TimerId, Duration)> {
        self.timers.borrow().pending.clone()
    }

    pub fn cancelled(&self) -> Vec<TimerId> {
        self.timers.borrow().cancelled.clone()
    }

    /// Expire `id` now.
    pub fn fire(&self, manager: &ConnectionManager, id: TimerId) {
        self.timers.borrow_mut().pending.retain(|(t, _)| *t != id);
        manager.timer_fired(id);
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&mut self, delay: Duration) -> TimerId {
        let mut timers = self.timers.borrow_mut();
        timers.next += 1;
        let id = TimerId(timers.next);
        timers.pending.push((id, delay));
        id
    }

    fn cancel(&mut self, id: TimerId) {
        let mut timers = self.timers.borrow_mut();
        timers.pending.retain(|(t, _)| *t != id);
        timers.cancelled.push(id);
    }
}

pub fn harness(config: ReconnectConfig) -> (ConnectionManager, MockTransport, ManualScheduler) {
    let transport = MockTransport::default();
    let scheduler = ManualScheduler::default();
    let manager = ConnectionManager::new(config, transport.clone(), scheduler.clone());
    (manager, transport, scheduler)
}

/// A harness already in `Connected`, with the authenticate frame cleared.
pub fn connected_harness(
    config: ReconnectConfig,
    identity: SessionIdentity,
) -> (ConnectionManager, MockTransport, ManualScheduler) {
    let (manager, transport, scheduler) = harness(config);
    manager.start(identity);
    manager.handle_transport_event(TransportEvent::Connected);
    manager.handle_transport_event(authenticated(AckStatus::Success, None));
    transport.clear_sent();
    (manager, transport, scheduler)
}

pub fn authenticated(status: AckStatus, message: Option<&str>) -> TransportEvent {
    TransportEvent::Message(ServerEvent::Authenticated {
        status,
        room: Some("t1".into()),
        message: message.map(str::to_string),
    })
}

pub fn subscribed(channel: &str, status: AckStatus) -> TransportEvent {
    TransportEvent::Message(ServerEvent::Subscribed {
        channel: channel.to_string(),
        status,
        message: None,
    })
}

pub fn update(message_type: &str, payload: Value) -> TransportEvent {
    TransportEvent::Message(ServerEvent::Update(UpdateEnvelope {
        message_type: message_type.to_string(),
        tenant_id: "t1".into(),
        payload,
        timestamp: Utc::now(),
        channel: None,
    }))
}
