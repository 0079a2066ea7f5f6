//! Single-task event loop feeding transport events and timer expirations
//! into a [`ConnectionManager`].

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::StreamExt;

use super::connection::{ConnectionId, TimerId, TransportEvent};
use super::manager::ConnectionManager;

#[derive(Debug, Clone, PartialEq)]
pub enum LoopEvent {
    Transport {
        connection: ConnectionId,
        event: TransportEvent,
    },
    TimerFired(TimerId),
}

pub type LoopSender = UnboundedSender<LoopEvent>;
pub type LoopReceiver = UnboundedReceiver<LoopEvent>;

/// Channel shared by the transport and scheduler to reach the driver.
pub fn event_loop() -> (LoopSender, LoopReceiver) {
    unbounded()
}

pub struct SyncDriver {
    manager: ConnectionManager,
    events: LoopReceiver,
}

impl SyncDriver {
    pub fn new(manager: ConnectionManager, events: LoopReceiver) -> Self {
        Self { manager, events }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    /// Apply one event to the manager.
    pub fn pump(&self, event: LoopEvent) {
        match event {
            LoopEvent::Transport { connection, event } => {
                self.manager.handle_connection_event(connection, event)
            }
            LoopEvent::TimerFired(id) => self.manager.timer_fired(id),
        }
    }

    /// Run until every sender is gone.
    pub async fn run(mut self) {
        while let Some(event) = self.events.next().await {
            self.pump(event);
        }
        tracing::debug!("sync driver stopped, no more event sources");
    }
}
