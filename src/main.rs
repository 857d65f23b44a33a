//! ==============================================================================
//! main.rs - turbine telemetry entry point
//! ==============================================================================
//!
//! purpose:
//!     one binary, two roles. the edge role runs on the Raspberry Pi in the
//!     turbine nacelle and publishes sensor readings; the relay role
//!     subscribes to them, keeps the latest snapshot, derives insights and
//!     pushes both to live clients.
//!
//! usage:
//!     turbine-telemetry [edge|relay]
//!     (no argument: `[node] role` from telemetry.toml)
//!
//! architecture:
//!
//!     ┌──────────────── edge ────────────────┐          ┌──────────────── relay ────────────────┐
//!     │  link ─▶ bus scan ─▶ broker ─▶ loop  │  pub/sub │  supervisor ─▶ ingest ─▶ store        │
//!     │   (LED)   (0x44,0x40)    (5 topics)  │ ───────▶ │                  ├─▶ insight engine   │
//!     │  restart button ─▶ back to link      │  broker  │                  └─▶ fanout ─▶ /ws     │
//!     └──────────────────────────────────────┘          └───────────────────────────────────────┘
//!
//! relationships:
//!     - edge: hal.rs, link.rs, sensors.rs, broker.rs, edge.rs
//!     - relay: broker.rs, store.rs, insight.rs, fanout.rs, relay.rs
//!     - both: config.rs (telemetry.toml), error.rs
//!
//! ==============================================================================

use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use turbine_telemetry::config::{Role, TelemetryConfig};
use turbine_telemetry::edge::{AcquisitionLoop, BrokerConnector, Exit, LoopSettings, RestartSignal};
use turbine_telemetry::hal::Hal;
use turbine_telemetry::insight::GeminiGenerator;
use turbine_telemetry::link::{LinkManager, SystemLink};
use turbine_telemetry::relay::{self, Relay, INBOUND_CAPACITY};
use turbine_telemetry::sensors::BusSensorDriver;

#[tokio::main]
async fn main() -> Result<()> {
    println!();
    println!("╔═══════════════════════════════════════════════════════════╗");
    println!("║              Turbine Telemetry - Edge / Relay             ║");
    println!("╚═══════════════════════════════════════════════════════════╝");
    println!();

    let mut config = TelemetryConfig::load_or_default();
    if let Some(role) = std::env::args().nth(1) {
        config.node.role = role.parse()?;
    }
    config.print_summary();

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match config.node.role {
        Role::Edge => run_edge(&config).await,
        Role::Relay => run_relay(&config).await,
    }
}

// ==============================================================================
// edge role
// ==============================================================================

async fn run_edge(config: &TelemetryConfig) -> Result<()> {
    let edge = &config.edge;
    let hal = Hal::new()?;
    let restart = RestartSignal::default();
    let _button = hal.arm_restart_button(edge.pins.restart_button, edge.pins.debounce_ms, restart.clone())?;

    let client_id = edge.client_id();
    tracing::info!(client_id = %client_id, "edge node starting");

    let settings = LoopSettings {
        ssid: edge.wifi.ssid.clone(),
        credential: edge.wifi.credential.clone(),
        period: Duration::from_millis(edge.poll_interval_ms),
        broker_retry: Duration::from_millis(edge.broker_retry_ms),
    };

    loop {
        // every pass starts from Init with fresh handles
        let link = LinkManager::new(
            SystemLink::new(&edge.wifi.interface),
            hal.indicator(edge.pins.indicator)?,
            edge.wifi.policy(),
        );
        let driver = BusSensorDriver::new(hal.i2c(edge.bus.i2c_bus)?, Duration::from_millis(edge.bus.settle_ms));
        let connector = BrokerConnector { options: config.broker.options(&client_id) };

        let mut acquisition = AcquisitionLoop::new(settings.clone(), link, driver, connector, restart.clone());
        match acquisition.run().await {
            Ok(Exit::Restart) => {
                tracing::warn!("restart button pressed, starting over");
            }
            Err(fault) if fault.is_fatal() => {
                tracing::error!(error = %fault, "edge startup failed");
                return Err(fault.into());
            }
            Err(fault) => {
                tracing::warn!(error = %fault, stage = ?acquisition.stage(), "edge startup interrupted, starting over");
                tokio::time::sleep(settings.broker_retry).await;
            }
        }
    }
}

// ==============================================================================
// relay role
// ==============================================================================

async fn run_relay(config: &TelemetryConfig) -> Result<()> {
    let generation = &config.relay.generation;
    if generation.api_key.is_empty() {
        tracing::warn!("no generation API key configured, insights will report the upstream error");
    }
    let timeout = Duration::from_secs(generation.timeout_secs);
    let generator = GeminiGenerator::new(&generation.api_url, &generation.api_key, timeout)?;
    let relay = Relay::new(generator, timeout);

    // the channel outlives individual broker sessions
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    tokio::spawn(relay.clone().run_ingestion(inbound_rx));
    tokio::spawn(relay::supervise_broker(
        config.broker.options(&config.relay.client_id),
        Duration::from_secs(config.relay.reconnect_secs),
        inbound_tx,
    ));

    relay::serve(relay, config.relay.listen).await
}
