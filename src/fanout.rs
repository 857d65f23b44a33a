//! ==============================================================================
//! fanout.rs - push snapshot and insight changes to live clients
//! ==============================================================================
//!
//! purpose:
//!     every connected live client gets every `sensor_update` and every
//!     changed `ai_insight`. a client that joins mid-stream first receives
//!     the current snapshot and insight, then only events newer than that
//!     replay, so its first view is never partial and never goes backwards.
//!
//! delivery:
//!     best effort per client. one slow or broken client cannot block the
//!     others or the ingestion path: the broadcast channel never waits on a
//!     receiver, a lagging receiver is resynchronised from current state, a
//!     failed socket write only ends that client's task.
//!
//! relationships:
//!     - used by: relay.rs (broadcast + websocket route)
//!     - uses: store.rs, insight.rs (replay sources), axum websockets
//!
//! ==============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::Fault;
use crate::insight::{Insight, InsightCell};
use crate::reading::Snapshot;
use crate::store::LatestStateStore;

const CHANNEL_CAPACITY: usize = 256;

/// Events pushed to live clients, serialized as `{"event": ..., "data": ...}`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum LiveEvent {
    SensorUpdate(Snapshot),
    AiInsight(Insight),
}

impl LiveEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LiveEvent::SensorUpdate(_) => "sensor_update",
            LiveEvent::AiInsight(_) => "ai_insight",
        }
    }
}

#[derive(Clone)]
pub struct FanoutHub {
    tx: broadcast::Sender<LiveEvent>,
    store: Arc<LatestStateStore>,
    insight: InsightCell,
    next_client: Arc<AtomicU64>,
}

impl FanoutHub {
    pub fn new(store: Arc<LatestStateStore>, insight: InsightCell) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx, store, insight, next_client: Arc::new(AtomicU64::new(1)) }
    }

    /// Send to everyone connected right now; returns how many receivers got it.
    pub fn broadcast(&self, event: LiveEvent) -> usize {
        let name = event.name();
        // no receivers is not an error for the producer
        let delivered = self.tx.send(event).unwrap_or(0);
        tracing::debug!(event = name, clients = delivered, "broadcast");
        delivered
    }

    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Register a client and queue its initial view.
    ///
    /// Subscribing happens before the replay is read, so nothing published
    /// in between is lost; anything older than the replay is filtered later.
    pub async fn on_client_connect(&self) -> LiveClient {
        let rx = self.tx.subscribe();
        let id = self.next_client.fetch_add(1, Ordering::Relaxed);
        let mut client = LiveClient {
            id,
            rx,
            pending: VecDeque::new(),
            snapshot_seq: 0,
            insight_seq: 0,
            hub: self.clone(),
        };
        client.replay().await;
        tracing::info!(client = id, clients = self.client_count(), "live client connected");
        client
    }
}

/// One connected subscriber. Dropping it unsubscribes.
pub struct LiveClient {
    id: u64,
    rx: broadcast::Receiver<LiveEvent>,
    pending: VecDeque<LiveEvent>,
    snapshot_seq: u64,
    insight_seq: u64,
    hub: FanoutHub,
}

impl LiveClient {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event for this client; `None` once the hub is gone.
    pub async fn next_event(&mut self) -> Option<LiveEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            match self.rx.recv().await {
                Ok(event) => {
                    if self.is_newer(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(client = self.id, missed, "live client lagged, resending current state");
                    self.replay().await;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    async fn replay(&mut self) {
        let snapshot = self.hub.store.get().await;
        let insight = self.hub.insight.get().await;
        self.snapshot_seq = self.snapshot_seq.max(snapshot.seq);
        self.insight_seq = self.insight_seq.max(insight.seq);
        self.pending.push_back(LiveEvent::SensorUpdate(snapshot));
        self.pending.push_back(LiveEvent::AiInsight(insight));
    }

    fn is_newer(&mut self, event: &LiveEvent) -> bool {
        let (seen, seq) = match event {
            LiveEvent::SensorUpdate(s) => (&mut self.snapshot_seq, s.seq),
            LiveEvent::AiInsight(i) => (&mut self.insight_seq, i.seq),
        };
        if seq <= *seen {
            return false;
        }
        *seen = seq;
        true
    }
}

impl Drop for LiveClient {
    fn drop(&mut self) {
        // our receiver is still counted until this returns
        let remaining = self.hub.client_count().saturating_sub(1);
        tracing::info!(client = self.id, clients = remaining, "live client disconnected");
    }
}

// ==============================================================================
// websocket transport
// ==============================================================================

/// Pump events into one websocket until either side goes away.
pub async fn serve_socket(mut socket: WebSocket, mut client: LiveClient) {
    loop {
        tokio::select! {
            event = client.next_event() => {
                let Some(event) = event else { break };
                if let Err(fault) = send_event(&mut socket, &event).await {
                    tracing::warn!(client = client.id(), error = %fault, "dropping live client");
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(client = client.id(), error = %e, "websocket receive error");
                        break;
                    }
                    // clients only listen; pings are answered by axum
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &LiveEvent) -> Result<(), Fault> {
    let frame = serde_json::to_string(event).map_err(|e| Fault::Delivery(format!("encode {}: {}", event.name(), e)))?;
    socket
        .send(Message::Text(frame))
        .await
        .map_err(|e| Fault::Delivery(e.to_string()))
}
