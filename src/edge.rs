//! ==============================================================================
//! edge.rs - acquisition loop for the edge device
//! ==============================================================================
//!
//! purpose:
//!     the whole edge process is one sequential state machine:
//!
//!         Init ──link──▶ LinkUp ──scan──▶ SensorsVerified ──broker──▶ Running
//!
//!     Init and SensorsVerified failures are configuration faults and end the
//!     process. the broker connect before Running is retried every
//!     `broker_retry` forever. Running repeats: read both chips, publish the
//!     five values as five messages, sleep. a missing connection means
//!     "reconnect and skip this cycle"; a failed publish drops the connection
//!     and the rest of the cycle's messages (at-most-once, no queueing).
//!
//!     the restart button raises a RestartSignal from interrupt context.
//!     the loop only looks at it at iteration boundaries and then hands
//!     control back to main.rs, which starts over at Init.
//!
//! relationships:
//!     - used by: main.rs (edge role)
//!     - uses: link.rs, sensors.rs, broker.rs, hal.rs
//!
//! ==============================================================================

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::broker::{BrokerConnection, BrokerOptions};
use crate::error::Fault;
use crate::hal::{I2cBus, Indicator};
use crate::link::{LinkManager, WirelessLink};
use crate::reading::{Reading, SensorKind};
use crate::sensors::BusSensorDriver;

// ==============================================================================
// restart signal
// ==============================================================================

/// Raised from the button interrupt, consumed by the loop. Lock-free.
#[derive(Clone, Default, Debug)]
pub struct RestartSignal(Arc<AtomicBool>);

impl RestartSignal {
    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// true once per raise
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

// ==============================================================================
// uplink seam (broker in production, fakes in tests)
// ==============================================================================

pub trait Uplink: Send {
    fn publish(&self, topic: &str, payload: &str) -> impl Future<Output = Result<(), Fault>> + Send;
}

pub trait UplinkConnector: Send + Sync {
    type Link: Uplink;
    fn connect(&self) -> impl Future<Output = Result<Self::Link, Fault>> + Send;
}

impl Uplink for BrokerConnection {
    fn publish(&self, topic: &str, payload: &str) -> impl Future<Output = Result<(), Fault>> + Send {
        BrokerConnection::publish(self, topic, payload)
    }
}

/// Publisher-only broker sessions built from fixed options.
pub struct BrokerConnector {
    pub options: BrokerOptions,
}

impl UplinkConnector for BrokerConnector {
    type Link = BrokerConnection;

    fn connect(&self) -> impl Future<Output = Result<BrokerConnection, Fault>> + Send {
        BrokerConnection::connect(&self.options, None)
    }
}

// ==============================================================================
// acquisition loop
// ==============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Init,
    LinkUp,
    SensorsVerified,
    Running,
}

/// Why `run` handed control back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exit {
    Restart,
}

#[derive(Clone, Debug)]
pub struct LoopSettings {
    pub ssid: String,
    pub credential: String,
    pub period: Duration,
    pub broker_retry: Duration,
}

/// What one Running iteration did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    Published,
    /// no connection at the start of the cycle; a reconnect was attempted
    Skipped { reconnected: bool },
    /// a publish failed part-way; the connection was dropped
    PublishFailed { sent: usize },
}

pub struct AcquisitionLoop<B, L, I, C: UplinkConnector> {
    settings: LoopSettings,
    link: LinkManager<L, I>,
    driver: Arc<Mutex<BusSensorDriver<B>>>,
    connector: C,
    uplink: Option<C::Link>,
    restart: RestartSignal,
    stage: Stage,
}

impl<B, L, I, C> AcquisitionLoop<B, L, I, C>
where
    B: I2cBus,
    L: WirelessLink,
    I: Indicator,
    C: UplinkConnector,
{
    pub fn new(
        settings: LoopSettings,
        link: LinkManager<L, I>,
        driver: BusSensorDriver<B>,
        connector: C,
        restart: RestartSignal,
    ) -> Self {
        Self {
            settings,
            link,
            driver: Arc::new(Mutex::new(driver)),
            connector,
            uplink: None,
            restart,
            stage: Stage::Init,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Startup, then cycle until a restart is requested.
    pub async fn run(&mut self) -> Result<Exit, Fault> {
        if let Some(exit) = self.startup().await? {
            return Ok(exit);
        }
        Ok(self.run_cycles().await)
    }

    /// The Running stage. Cycle faults are logged and retried next period.
    pub async fn run_cycles(&mut self) -> Exit {
        loop {
            if self.restart.take() {
                tracing::warn!("restart requested, leaving acquisition loop");
                return Exit::Restart;
            }
            if let Err(fault) = self.run_cycle().await {
                tracing::warn!(error = %fault, "acquisition cycle failed, retrying next cycle");
            }
            tokio::time::sleep(self.settings.period).await;
        }
    }

    /// Init -> Running. `Some(exit)` if a restart arrived while waiting for the broker.
    pub async fn startup(&mut self) -> Result<Option<Exit>, Fault> {
        self.stage = Stage::Init;
        self.uplink = None;

        self.link.connect(&self.settings.ssid, &self.settings.credential).await?;
        self.stage = Stage::LinkUp;

        self.with_driver(|d| d.verify()).await??;
        self.stage = Stage::SensorsVerified;

        loop {
            match self.connector.connect().await {
                Ok(link) => {
                    self.uplink = Some(link);
                    break;
                }
                Err(fault) => {
                    tracing::warn!(error = %fault, retry_in = ?self.settings.broker_retry, "broker unavailable, retrying");
                    tokio::time::sleep(self.settings.broker_retry).await;
                    if self.restart.take() {
                        return Ok(Some(Exit::Restart));
                    }
                }
            }
        }

        self.stage = Stage::Running;
        tracing::info!("executing the main data collection loop");
        Ok(None)
    }

    /// One Running iteration: read, then publish or reconnect.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome, Fault> {
        let readings = self.read_all().await?;

        let Some(uplink) = self.uplink.as_ref() else {
            tracing::warn!("broker not connected, reconnecting and skipping this cycle");
            let reconnected = match self.connector.connect().await {
                Ok(link) => {
                    self.uplink = Some(link);
                    true
                }
                Err(fault) => {
                    tracing::warn!(error = %fault, "broker reconnect failed");
                    false
                }
            };
            return Ok(CycleOutcome::Skipped { reconnected });
        };

        let mut sent = 0;
        for (kind, reading) in &readings {
            let result = uplink.publish(&kind.topic(), reading.as_str()).await;
            if let Err(fault) = result {
                tracing::warn!(error = %fault, %kind, "publish failed, dropping broker connection");
                self.uplink = None;
                return Ok(CycleOutcome::PublishFailed { sent });
            }
            sent += 1;
        }

        let summary: Vec<String> = readings.iter().map(|(k, r)| format!("{}={}", k, r)).collect();
        tracing::info!(readings = %summary.join(" "), "data publication successful");
        Ok(CycleOutcome::Published)
    }

    async fn read_all(&self) -> Result<Vec<(SensorKind, Reading)>, Fault> {
        let (climate, power) = self
            .with_driver(|d| (d.read_humidity_sensor(), d.read_power_sensor()))
            .await?;
        Ok(vec![
            (SensorKind::Temperature, climate.temperature),
            (SensorKind::Humidity, climate.humidity),
            (SensorKind::Voltage, power.voltage),
            (SensorKind::Current, power.current),
            (SensorKind::Power, power.power),
        ])
    }

    // bus transfers block (settle sleeps included), keep them off the runtime threads
    async fn with_driver<T, F>(&self, f: F) -> Result<T, Fault>
    where
        T: Send + 'static,
        F: FnOnce(&mut BusSensorDriver<B>) -> T + Send + 'static,
    {
        let driver = Arc::clone(&self.driver);
        tokio::task::spawn_blocking(move || {
            let mut guard = driver
                .lock()
                .map_err(|_| Fault::TransientIo("sensor driver lock poisoned".to_string()))?;
            Ok(f(&mut guard))
        })
        .await
        .map_err(|e| Fault::TransientIo(format!("sensor task join error: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::tests::{CountingIndicator, FakeLink};
    use crate::link::LinkPolicy;
    use crate::sensors::tests::ScriptedBus;
    use crate::sensors::CLIMATE_SENSOR_ADDR;
    use std::sync::atomic::AtomicUsize;

    type Published = Arc<Mutex<Vec<(String, String)>>>;

    struct FakeUplink {
        published: Published,
        fail_after: Option<usize>,
        sent: AtomicUsize,
    }

    impl Uplink for FakeUplink {
        fn publish(&self, topic: &str, payload: &str) -> impl Future<Output = Result<(), Fault>> + Send {
            let n = self.sent.fetch_add(1, Ordering::SeqCst);
            let result = match self.fail_after {
                Some(limit) if n >= limit => Err(Fault::TransientIo("socket closed".into())),
                _ => {
                    self.published.lock().unwrap().push((topic.to_string(), payload.to_string()));
                    Ok(())
                }
            };
            async move { result }
        }
    }

    /// Hands out connections; each entry of `script` is one connect attempt.
    struct FakeConnector {
        published: Published,
        script: Mutex<Vec<Result<Option<usize>, Fault>>>,
        attempts: AtomicUsize,
    }

    impl FakeConnector {
        fn new(script: Vec<Result<Option<usize>, Fault>>) -> Self {
            Self { published: Published::default(), script: Mutex::new(script), attempts: AtomicUsize::new(0) }
        }
    }

    impl UplinkConnector for FakeConnector {
        type Link = FakeUplink;

        fn connect(&self) -> impl Future<Output = Result<FakeUplink, Fault>> + Send {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() { Ok(None) } else { script.remove(0) }
            };
            let published = Arc::clone(&self.published);
            async move {
                next.map(|fail_after| FakeUplink { published, fail_after, sent: AtomicUsize::new(0) })
            }
        }
    }

    fn settings() -> LoopSettings {
        LoopSettings {
            ssid: "nacelle".into(),
            credential: "secret".into(),
            period: Duration::from_millis(1),
            broker_retry: Duration::from_millis(1),
        }
    }

    fn acquisition(
        bus: ScriptedBus,
        link: FakeLink,
        connector: FakeConnector,
    ) -> AcquisitionLoop<ScriptedBus, FakeLink, CountingIndicator, FakeConnector> {
        let policy = LinkPolicy { max_attempts: 3, backoff: Duration::from_millis(1) };
        AcquisitionLoop::new(
            settings(),
            LinkManager::new(link, CountingIndicator::default(), policy),
            BusSensorDriver::new(bus, Duration::ZERO),
            connector,
            RestartSignal::default(),
        )
    }

    #[test]
    fn test_restart_signal_is_taken_once() {
        let signal = RestartSignal::default();
        assert!(!signal.take());
        signal.clone().raise();
        assert!(signal.take());
        assert!(!signal.take());
    }

    #[tokio::test]
    async fn test_startup_reaches_running_after_broker_retries() {
        let connector = FakeConnector::new(vec![
            Err(Fault::TransientIo("refused".into())),
            Err(Fault::TransientIo("refused".into())),
            Ok(None),
        ]);
        let mut acq = acquisition(ScriptedBus::healthy(), FakeLink::ready_after(Some(0)), connector);
        assert_eq!(acq.startup().await.unwrap(), None);
        assert_eq!(acq.stage(), Stage::Running);
        assert_eq!(acq.connector.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_link_failure_is_fatal_at_init() {
        let mut acq = acquisition(ScriptedBus::healthy(), FakeLink::ready_after(None), FakeConnector::new(vec![]));
        let err = acq.startup().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(acq.stage(), Stage::Init);
    }

    #[tokio::test]
    async fn test_missing_sensor_is_fatal_after_link_up() {
        let mut bus = ScriptedBus::healthy();
        bus.present.retain(|a| *a != CLIMATE_SENSOR_ADDR);
        let mut acq = acquisition(bus, FakeLink::ready_after(Some(0)), FakeConnector::new(vec![]));
        let err = acq.startup().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(acq.stage(), Stage::LinkUp);
        assert_eq!(acq.connector.attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cycle_publishes_five_topics_in_order() {
        let mut acq = acquisition(ScriptedBus::healthy(), FakeLink::ready_after(Some(0)), FakeConnector::new(vec![]));
        acq.startup().await.unwrap();
        assert_eq!(acq.run_cycle().await.unwrap(), CycleOutcome::Published);

        let published = acq.connector.published.lock().unwrap().clone();
        let topics: Vec<&str> = published.iter().map(|(t, _)| t.as_str()).collect();
        assert_eq!(
            topics,
            vec![
                "elle/turbine/temperature",
                "elle/turbine/humidity",
                "elle/turbine/voltage",
                "elle/turbine/current",
                "elle/turbine/power",
            ]
        );
        assert_eq!(published[0].1, "24.0°C");
        assert_eq!(published[2].1, "5.00V");
    }

    #[tokio::test]
    async fn test_unreadable_quantity_is_published_as_sentinel() {
        let mut bus = ScriptedBus::healthy();
        bus.failing_registers.insert(crate::sensors::REG_POWER);
        let mut acq = acquisition(bus, FakeLink::ready_after(Some(0)), FakeConnector::new(vec![]));
        acq.startup().await.unwrap();
        acq.run_cycle().await.unwrap();

        let published = acq.connector.published.lock().unwrap().clone();
        assert_eq!(published[4], ("elle/turbine/power".to_string(), "N/A".to_string()));
        assert_eq!(published[3].1, "-0.12A");
    }

    #[tokio::test]
    async fn test_publish_failure_drops_connection_then_reconnects() {
        // first session dies after two messages, the second is healthy
        let connector = FakeConnector::new(vec![Ok(Some(2)), Ok(None)]);
        let mut acq = acquisition(ScriptedBus::healthy(), FakeLink::ready_after(Some(0)), connector);
        acq.startup().await.unwrap();

        assert_eq!(acq.run_cycle().await.unwrap(), CycleOutcome::PublishFailed { sent: 2 });
        assert!(acq.uplink.is_none());

        // the next cycle only reconnects, nothing is published
        assert_eq!(acq.run_cycle().await.unwrap(), CycleOutcome::Skipped { reconnected: true });
        assert_eq!(acq.connector.published.lock().unwrap().len(), 2);

        assert_eq!(acq.run_cycle().await.unwrap(), CycleOutcome::Published);
        assert_eq!(acq.connector.published.lock().unwrap().len(), 7);
    }

    #[tokio::test]
    async fn test_restart_request_ends_run() {
        let mut acq = acquisition(ScriptedBus::healthy(), FakeLink::ready_after(Some(0)), FakeConnector::new(vec![]));
        acq.restart.raise();
        assert_eq!(acq.run().await.unwrap(), Exit::Restart);
        // startup completed, no cycle ran
        assert_eq!(acq.stage(), Stage::Running);
        assert!(acq.connector.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_fault_is_retried_not_escalated() {
        let mut acq = acquisition(ScriptedBus::healthy(), FakeLink::ready_after(Some(0)), FakeConnector::new(vec![]));
        acq.startup().await.unwrap();

        // a panicking bus thread leaves the driver lock poisoned
        let driver = Arc::clone(&acq.driver);
        let _ = std::thread::spawn(move || {
            let _guard = driver.lock().unwrap();
            panic!("bus thread died");
        })
        .join();
        assert!(matches!(acq.run_cycle().await, Err(Fault::TransientIo(_))));

        let restart = acq.restart.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            restart.raise();
        });
        let exit = tokio::time::timeout(Duration::from_secs(2), acq.run_cycles())
            .await
            .expect("loop keeps cycling until the restart");
        assert_eq!(exit, Exit::Restart);
        assert_eq!(acq.stage(), Stage::Running);
        assert!(acq.connector.published.lock().unwrap().is_empty());
    }
}
