//! Native transport using tokio-tungstenite, plus tokio-backed timers.
//!
//! Both report back through the driver's [`LoopEvent`] channel; neither
//! touches the manager directly.

use std::collections::HashMap;
use std::time::Duration;

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use grantline_shared::{decode_frame, encode_frame, ClientCommand, ServerEvent, SyncError, WsEnvelope};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::{ConnectionId, Scheduler, TimerId, Transport, TransportEvent};
use crate::ws::driver::{LoopEvent, LoopSender};

/// A WebSocket connection to the sync server (native implementation).
///
/// Each `connect` starts a fresh connection task whose events carry its
/// [`ConnectionId`], so the manager can drop whatever an earlier task left
/// in the queue.
pub struct WsTransport {
    url: String,
    events: LoopSender,
    outbound: Option<UnboundedSender<WsEnvelope<ClientCommand>>>,
    task: Option<JoinHandle<()>>,
    generation: u64,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, events: LoopSender) -> Self {
        Self {
            url: url.into(),
            events,
            outbound: None,
            task: None,
            generation: 0,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WsTransport {
    fn connect(&mut self) -> ConnectionId {
        self.disconnect();
        self.generation += 1;
        let connection = ConnectionId(self.generation);
        let (sender, receiver) = unbounded();
        self.outbound = Some(sender);

        let link = EventLink {
            events: self.events.clone(),
            connection,
        };
        tracing::info!(url = %self.url, ?connection, "opening sync connection");
        self.task = Some(tokio::spawn(run_connection(self.url.clone(), receiver, link)));
        connection
    }

    fn disconnect(&mut self) {
        self.outbound = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    fn send(&mut self, frame: WsEnvelope<ClientCommand>) -> Result<(), SyncError> {
        let Some(sender) = &self.outbound else {
            return Err(SyncError::NotConnected);
        };
        sender
            .unbounded_send(frame)
            .map_err(|e| SyncError::Transport(format!("Failed to send: {}", e)))
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Sends transport events tagged with one connection's id.
struct EventLink {
    events: LoopSender,
    connection: ConnectionId,
}

impl EventLink {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.unbounded_send(LoopEvent::Transport {
            connection: self.connection,
            event,
        });
    }
}

async fn run_connection(
    url: String,
    mut outbound: UnboundedReceiver<WsEnvelope<ClientCommand>>,
    link: EventLink,
) {
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws_stream, _response)) => ws_stream,
        Err(e) => {
            tracing::error!("WebSocket connect to {} failed: {}", url, e);
            link.emit(TransportEvent::Error(e.to_string()));
            return;
        }
    };
    tracing::info!("WebSocket connected to {}", url);
    link.emit(TransportEvent::Connected);

    let (mut write, mut read) = ws_stream.split();
    let reason = loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("WebSocket received: {}", text);
                    match decode_frame::<ServerEvent>(&text) {
                        Ok(frame) => link.emit(TransportEvent::Message(frame.payload)),
                        Err(e) => tracing::error!("Failed to parse message: {}", e),
                    }
                }
                Some(Ok(Message::Close(_))) => break "server closed the connection".to_string(),
                Some(Ok(_)) => {
                    // Pings are answered by tungstenite; binary frames are not part of the protocol.
                }
                Some(Err(e)) => break e.to_string(),
                None => break "connection ended".to_string(),
            },
            command = outbound.next() => match command {
                Some(frame) => match encode_frame(&frame) {
                    Ok(json) => {
                        tracing::debug!("Sending: {}", json);
                        if let Err(e) = write.send(Message::text(json)).await {
                            break format!("send failed: {}", e);
                        }
                    }
                    Err(e) => tracing::error!("Serialize failed: {}", e),
                },
                None => {
                    // Transport handle dropped the sender: a local close.
                    let _ = write.close().await;
                    return;
                }
            },
        }
    };

    tracing::info!(%reason, "WebSocket to {} closed", url);
    link.emit(TransportEvent::Disconnected(reason));
}

/// Single-shot timers on the tokio runtime.
pub struct TokioScheduler {
    events: LoopSender,
    next: u64,
    timers: HashMap<TimerId, JoinHandle<()>>,
}

impl TokioScheduler {
    pub fn new(events: LoopSender) -> Self {
        Self {
            events,
            next: 0,
            timers: HashMap::new(),
        }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&mut self, delay: Duration) -> TimerId {
        self.timers.retain(|_, task| !task.is_finished());
        self.next += 1;
        let id = TimerId(self.next);
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.unbounded_send(LoopEvent::TimerFired(id));
        });
        self.timers.insert(id, task);
        id
    }

    fn cancel(&mut self, id: TimerId) {
        if let Some(task) = self.timers.remove(&id) {
            task.abort();
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, task) in self.timers.drain() {
            task.abort();
        }
    }
}
