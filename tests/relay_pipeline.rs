//! Relay end to end: inbound broker messages through ingestion, the store,
//! the insight engine and out to a live client.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use turbine_telemetry::broker::InboundMessage;
use turbine_telemetry::error::Fault;
use turbine_telemetry::fanout::{LiveClient, LiveEvent};
use turbine_telemetry::insight::{InsightGenerator, INITIAL_INSIGHT, INSUFFICIENT_DATA};
use turbine_telemetry::reading::SensorKind;
use turbine_telemetry::relay::Relay;

/// Always answers with the same text, counting calls.
#[derive(Clone)]
struct FixedGenerator {
    reply: &'static str,
    calls: Arc<AtomicUsize>,
}

impl InsightGenerator for FixedGenerator {
    fn generate(&self, _prompt: &str) -> impl Future<Output = Result<String, Fault>> + Send {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self.reply.to_string();
        async move { Ok(reply) }
    }
}

fn message(kind: SensorKind, payload: &str) -> InboundMessage {
    InboundMessage { topic: kind.topic(), payload: payload.to_string() }
}

async fn next(client: &mut LiveClient) -> LiveEvent {
    tokio::time::timeout(Duration::from_secs(2), client.next_event())
        .await
        .expect("event in time")
        .expect("hub alive")
}

#[tokio::test]
async fn test_out_of_order_readings_complete_snapshot_and_trigger_one_insight() {
    let calls = Arc::new(AtomicUsize::new(0));
    let generator = FixedGenerator { reply: "Humidity is high; open the vents.", calls: Arc::clone(&calls) };
    let relay = Relay::new(generator, Duration::from_secs(1));

    let mut client = relay.hub().on_client_connect().await;
    assert!(matches!(next(&mut client).await, LiveEvent::SensorUpdate(s) if s.seq == 0));
    match next(&mut client).await {
        LiveEvent::AiInsight(i) => assert_eq!(i.text, INITIAL_INSIGHT),
        other => panic!("unexpected {:?}", other),
    }

    let (tx, rx) = mpsc::channel(16);
    let ingestion = tokio::spawn(relay.clone().run_ingestion(rx));

    let order = [
        (SensorKind::Power, "2.50W"),
        (SensorKind::Humidity, "74.0%"),
        (SensorKind::Voltage, "5.00V"),
        (SensorKind::Temperature, "24.1°C"),
        (SensorKind::Current, "0.50A"),
    ];
    for (kind, payload) in order {
        tx.send(message(kind, payload)).await.unwrap();
    }

    // first update: snapshot, then the insufficient-data insight (changed from the initial text)
    assert!(matches!(next(&mut client).await, LiveEvent::SensorUpdate(s) if s.seq == 1));
    match next(&mut client).await {
        LiveEvent::AiInsight(i) => assert_eq!(i.text, INSUFFICIENT_DATA),
        other => panic!("unexpected {:?}", other),
    }

    // the next three updates leave the insight unchanged, so only snapshots arrive
    for seq in 2..=4 {
        match next(&mut client).await {
            LiveEvent::SensorUpdate(s) => {
                assert_eq!(s.seq, seq);
                assert!(!s.is_complete());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    let complete = match next(&mut client).await {
        LiveEvent::SensorUpdate(s) => s,
        other => panic!("unexpected {:?}", other),
    };
    assert!(complete.is_complete());
    assert_eq!(complete.get(SensorKind::Humidity).as_str(), "74.0%");
    assert_ne!(complete.timestamp(), "N/A");

    match next(&mut client).await {
        LiveEvent::AiInsight(i) => assert_eq!(i.text, "Humidity is high; open the vents."),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // a repeated value regenerates, but the identical text is not re-sent
    tx.send(message(SensorKind::Power, "2.50W")).await.unwrap();
    assert!(matches!(next(&mut client).await, LiveEvent::SensorUpdate(s) if s.seq == 6));
    tokio::time::timeout(Duration::from_secs(1), async {
        while calls.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("second generation");
    assert!(tokio::time::timeout(Duration::from_millis(100), client.next_event()).await.is_err());

    drop(tx);
    ingestion.await.unwrap();
}

#[tokio::test]
async fn test_late_client_sees_current_state_first() {
    let generator = FixedGenerator { reply: "unused", calls: Arc::new(AtomicUsize::new(0)) };
    let relay = Relay::new(generator, Duration::from_secs(1));

    relay.ingest(message(SensorKind::Voltage, "4.95V")).await;
    relay.ingest(message(SensorKind::Current, "N/A")).await;

    let mut client = relay.hub().on_client_connect().await;
    match next(&mut client).await {
        LiveEvent::SensorUpdate(s) => {
            assert_eq!(s.seq, 2);
            assert_eq!(s.get(SensorKind::Voltage).as_str(), "4.95V");
            assert!(!s.get(SensorKind::Current).is_available());
        }
        other => panic!("unexpected {:?}", other),
    }
    match next(&mut client).await {
        LiveEvent::AiInsight(i) => assert_eq!(i.text, INSUFFICIENT_DATA),
        other => panic!("unexpected {:?}", other),
    }
}
