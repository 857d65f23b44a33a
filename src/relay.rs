//! ==============================================================================
//! relay.rs - broker ingestion, insight scheduling and the live-client server
//! ==============================================================================
//!
//! purpose:
//!     glues the relay side together:
//!
//!     broker ──▶ [mpsc, broker order] ──▶ ingest ──▶ store.update
//!                                              ├──▶ hub.broadcast(sensor_update)
//!                                              └──▶ insight (inline or spawned)
//!                                                        └──▶ hub.broadcast(ai_insight) if changed
//!
//!     one ingestion task consumes the channel, so updates are applied in the
//!     order the broker delivered them. the broker supervisor reconnects on
//!     its own cadence and feeds the same channel across sessions.
//!
//! insight scheduling:
//!     an incomplete snapshot only yields the fixed "not enough data" text,
//!     which is cheap and evaluated inline. a complete snapshot needs the
//!     external generation call, which is spawned so ingestion keeps going;
//!     results land in completion order (last finished wins).
//!
//! ==============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{State, WebSocketUpgrade},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use chrono::Local;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use crate::broker::{BrokerConnection, BrokerOptions, InboundMessage};
use crate::fanout::{self, FanoutHub, LiveEvent};
use crate::insight::{Insight, InsightCell, InsightEngine, InsightGenerator};
use crate::reading::{Reading, SensorKind, Snapshot, TOPIC_FILTER};
use crate::store::LatestStateStore;

/// inbound queue between the broker session and the ingestion task
pub const INBOUND_CAPACITY: usize = 256;

pub struct Relay<G> {
    store: Arc<LatestStateStore>,
    engine: Arc<InsightEngine<G>>,
    hub: FanoutHub,
}

impl<G> Clone for Relay<G> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store), engine: Arc::clone(&self.engine), hub: self.hub.clone() }
    }
}

impl<G: InsightGenerator> Relay<G> {
    pub fn new(generator: G, generation_timeout: Duration) -> Self {
        let store = Arc::new(LatestStateStore::new());
        let cell = InsightCell::default();
        let engine = Arc::new(InsightEngine::new(generator, cell.clone(), generation_timeout));
        let hub = FanoutHub::new(Arc::clone(&store), cell);
        Self { store, engine, hub }
    }

    pub fn hub(&self) -> &FanoutHub {
        &self.hub
    }

    pub fn store(&self) -> &LatestStateStore {
        &self.store
    }

    /// Apply one broker message. Returns the generation task when one was spawned.
    pub async fn ingest(&self, message: InboundMessage) -> Option<JoinHandle<()>> {
        let Some(kind) = SensorKind::from_topic(&message.topic) else {
            tracing::warn!(topic = %message.topic, "message outside the reading namespace, ignored");
            return None;
        };
        let reading = Reading::from_payload(&message.payload);
        tracing::info!(%kind, %reading, "sensor update");

        let snapshot = self.store.update(kind, reading, Local::now()).await;
        self.hub.broadcast(LiveEvent::SensorUpdate(snapshot.clone()));
        self.schedule_insight(snapshot).await
    }

    /// Consume the inbound channel until every sender is gone.
    pub async fn run_ingestion(self, mut inbound: mpsc::Receiver<InboundMessage>) {
        while let Some(message) = inbound.recv().await {
            self.ingest(message).await;
        }
        tracing::info!("inbound channel closed, ingestion stopped");
    }

    async fn schedule_insight(&self, snapshot: Snapshot) -> Option<JoinHandle<()>> {
        if !snapshot.is_complete() {
            surface(&self.engine, &self.hub, &snapshot).await;
            return None;
        }

        let engine = Arc::clone(&self.engine);
        let hub = self.hub.clone();
        Some(tokio::spawn(async move {
            surface(&engine, &hub, &snapshot).await;
        }))
    }
}

async fn surface<G: InsightGenerator>(engine: &InsightEngine<G>, hub: &FanoutHub, snapshot: &Snapshot) {
    let (insight, changed) = engine.maybe_regenerate(snapshot).await;
    if changed {
        hub.broadcast(LiveEvent::AiInsight(insight));
    }
}

// ==============================================================================
// broker supervision
// ==============================================================================

/// Keep one subscribing session alive forever, reconnecting every `retry`.
pub async fn supervise_broker(options: BrokerOptions, retry: Duration, inbound: mpsc::Sender<InboundMessage>) {
    loop {
        match BrokerConnection::connect(&options, Some(inbound.clone())).await {
            Ok(connection) => match connection.subscribe(TOPIC_FILTER).await {
                Ok(()) => {
                    connection.on_disconnected(|| tracing::warn!("broker session ended"));
                    connection.disconnected().await;
                }
                Err(fault) => tracing::warn!(error = %fault, "subscribe failed"),
            },
            Err(fault) => tracing::warn!(error = %fault, "broker connect failed"),
        }
        if inbound.is_closed() {
            return;
        }
        tracing::info!(retry_in = ?retry, "reconnecting to broker");
        tokio::time::sleep(retry).await;
    }
}

// ==============================================================================
// live-client server
// ==============================================================================

#[derive(Serialize)]
struct StateView {
    snapshot: Snapshot,
    #[serde(flatten)]
    insight: Insight,
}

pub fn router<G: InsightGenerator>(relay: Relay<G>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler::<G>))
        .route("/api/state", get(state_handler::<G>))
        .layer(CorsLayer::permissive())
        .with_state(relay)
}

pub async fn serve<G: InsightGenerator>(relay: Relay<G>, listen: SocketAddr) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(%listen, "live clients on ws://{}/ws", listen);
    axum::serve(listener, router(relay)).await?;
    Ok(())
}

async fn ws_handler<G: InsightGenerator>(
    State(relay): State<Relay<G>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| async move {
        // queue the replay before the socket pump starts
        let client = relay.hub.on_client_connect().await;
        fanout::serve_socket(socket, client).await;
    })
}

/// json api endpoint for programmatic access
async fn state_handler<G: InsightGenerator>(State(relay): State<Relay<G>>) -> Json<serde_json::Value> {
    let view = StateView { snapshot: relay.store.get().await, insight: relay.engine.cell().get().await };
    Json(serde_json::to_value(view).unwrap_or_default())
}
