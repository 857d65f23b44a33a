//! ==============================================================================
//! broker.rs - one publish/subscribe connection to the MQTT broker
//! ==============================================================================
//!
//! purpose:
//!     wraps exactly one broker session. `connect` is a single bounded attempt;
//!     looping on failure is the owner's job (the edge loop every 5s, the
//!     relay supervisor on its own cadence).
//!
//!     once connected, a driver task polls the rumqttc event loop, forwards
//!     incoming publishes (in broker order) into the owner's channel and flips
//!     the state to Disconnected on the first transport error. it does not
//!     reconnect: a dead connection stays dead and the owner builds a new one.
//!
//! relationships:
//!     - used by: edge.rs (publisher), relay.rs (wildcard subscriber)
//!     - uses: rumqttc
//!
//! ==============================================================================

use std::future::Future;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::Fault;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Clone, Debug)]
pub struct BrokerOptions {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

/// A publish received from the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: String,
}

pub struct BrokerConnection {
    client: AsyncClient,
    state: watch::Receiver<ConnectionState>,
    state_tx: watch::Sender<ConnectionState>,
    driver: JoinHandle<()>,
}

impl BrokerConnection {
    /// One connection attempt, bounded by `connect_timeout`.
    ///
    /// Incoming publishes go to `inbound` when given; a publisher-only
    /// connection passes `None`.
    pub async fn connect(options: &BrokerOptions, inbound: Option<mpsc::Sender<InboundMessage>>) -> Result<Self, Fault> {
        tracing::info!(host = %options.host, port = options.port, client_id = %options.client_id, "connecting to broker");

        let mut mqtt = MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);
        mqtt.set_keep_alive(options.keep_alive);
        mqtt.set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(mqtt, 32);
        let (state_tx, state) = watch::channel(ConnectionState::Connecting);

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => return Ok(ack),
                    Ok(_) => continue,
                    Err(e) => return Err(Fault::from(e)),
                }
            }
        };

        match tokio::time::timeout(options.connect_timeout, handshake).await {
            Ok(Ok(ack)) => tracing::info!(session_present = ack.session_present, "connected to broker"),
            Ok(Err(fault)) => {
                tracing::warn!(error = %fault, "failed to connect to broker");
                return Err(fault);
            }
            Err(_) => {
                tracing::warn!(timeout = ?options.connect_timeout, "broker connect timed out");
                return Err(Fault::TransientIo(format!(
                    "broker connect timed out after {:?}",
                    options.connect_timeout
                )));
            }
        }

        state_tx.send_replace(ConnectionState::Connected);
        let driver = tokio::spawn(drive(eventloop, inbound, state_tx.clone()));

        Ok(Self { client, state, state_tx, driver })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Fire-and-forget publish. Any failure marks this connection dead.
    pub async fn publish(&self, topic: &str, payload: &str) -> Result<(), Fault> {
        if self.state() != ConnectionState::Connected {
            return Err(Fault::TransientIo("broker connection lost".to_string()));
        }
        if let Err(e) = self
            .client
            .publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())
            .await
        {
            self.invalidate();
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn subscribe(&self, filter: &str) -> Result<(), Fault> {
        if let Err(e) = self.client.subscribe(filter, QoS::AtMostOnce).await {
            self.invalidate();
            return Err(e.into());
        }
        tracing::info!(filter, "subscribed");
        Ok(())
    }

    /// Resolves once the connection is gone (immediately if it already is).
    pub fn disconnected(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut state = self.state.clone();
        async move {
            // a closed channel also means the driver is gone
            let _ = state.wait_for(|s| *s == ConnectionState::Disconnected).await;
        }
    }

    /// Run `callback` once, when the connection is lost.
    pub fn on_disconnected<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let lost = self.disconnected();
        tokio::spawn(async move {
            lost.await;
            callback();
        });
    }

    fn invalidate(&self) {
        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.driver.abort();
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.driver.abort();
    }
}

async fn drive(
    mut eventloop: EventLoop,
    inbound: Option<mpsc::Sender<InboundMessage>>,
    state: watch::Sender<ConnectionState>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                let Some(tx) = inbound.as_ref() else { continue };
                let message = InboundMessage {
                    topic: p.topic.clone(),
                    payload: String::from_utf8_lossy(&p.payload).into_owned(),
                };
                tracing::debug!(topic = %message.topic, payload = %message.payload, "received");
                if tx.send(message).await.is_err() {
                    tracing::debug!("inbound channel closed, dropping message");
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                tracing::warn!("broker closed the session");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "broker connection lost");
                break;
            }
        }
    }
    state.send_replace(ConnectionState::Disconnected);
}
