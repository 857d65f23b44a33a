//! latest-state store for the relay
//!
//! One snapshot, one writer (the ingestion task), any number of readers.
//! Writers swap in a fully built snapshot under the write lock; readers get
//! an owned copy, so later updates never show through a snapshot already
//! handed out.

use chrono::{DateTime, Local};
use tokio::sync::RwLock;

use crate::reading::{Reading, SensorKind, Snapshot};

#[derive(Default)]
pub struct LatestStateStore {
    current: RwLock<Snapshot>,
}

impl LatestStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one reading and return the resulting snapshot.
    ///
    /// Replaying an identical (kind, value) is not suppressed: it still bumps
    /// `seq` and the timestamp and is broadcast downstream like any update.
    pub async fn update(&self, kind: SensorKind, reading: Reading, at: DateTime<Local>) -> Snapshot {
        let mut current = self.current.write().await;
        let mut next = current.clone();
        next.set(kind, reading);
        next.captured_at = Some(at);
        next.seq = current.seq + 1;
        *current = next.clone();
        next
    }

    pub async fn get(&self) -> Snapshot {
        self.current.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn value(s: &str) -> Reading {
        Reading::Value(s.to_string())
    }

    #[tokio::test]
    async fn test_update_then_get() {
        let store = LatestStateStore::new();
        let snap = store.update(SensorKind::Temperature, value("24.1°C"), Local::now()).await;
        assert_eq!(snap.seq, 1);
        assert_eq!(store.get().await, snap);
        assert_eq!(snap.get(SensorKind::Humidity), &Reading::Unavailable);
    }

    #[tokio::test]
    async fn test_returned_snapshot_is_independent_copy() {
        let store = LatestStateStore::new();
        store.update(SensorKind::Power, value("2.50W"), Local::now()).await;
        let before = store.get().await;

        store.update(SensorKind::Power, value("3.10W"), Local::now()).await;
        assert_eq!(before.get(SensorKind::Power), &value("2.50W"));
        assert_eq!(store.get().await.get(SensorKind::Power), &value("3.10W"));
    }

    #[tokio::test]
    async fn test_duplicate_value_still_advances() {
        let store = LatestStateStore::new();
        let a = store.update(SensorKind::Voltage, value("5.00V"), Local::now()).await;
        let b = store.update(SensorKind::Voltage, value("5.00V"), Local::now()).await;
        assert_eq!(b.seq, a.seq + 1);
        assert_eq!(a.get(SensorKind::Voltage), b.get(SensorKind::Voltage));
    }

    #[tokio::test]
    async fn test_concurrent_readers_never_see_torn_values() {
        let store = Arc::new(LatestStateStore::new());
        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for i in 0..200u32 {
                    let v = format!("{}.00V", i);
                    store.update(SensorKind::Voltage, value(&v), Local::now()).await;
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            readers.push(tokio::spawn(async move {
                let mut last_seq = 0;
                for _ in 0..200 {
                    let snap = store.get().await;
                    assert!(snap.seq >= last_seq, "sequence never goes backwards");
                    if snap.seq > 0 {
                        // the voltage written at sequence n is "(n-1).00V"
                        let expected = format!("{}.00V", snap.seq - 1);
                        assert_eq!(snap.get(SensorKind::Voltage).as_str(), expected);
                    }
                    last_seq = snap.seq;
                    tokio::task::yield_now().await;
                }
            }));
        }

        writer.await.unwrap();
        for r in readers {
            r.await.unwrap();
        }
    }
}
