use std::fmt;

use chrono::{DateTime, Local};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

/// topic prefix shared by the edge publisher and the relay subscription
pub const TOPIC_BASE: &str = "elle/turbine/";

/// single-level wildcard over every reading kind
pub const TOPIC_FILTER: &str = "elle/turbine/+";

/// placeholder for a value that was never observed or could not be read
pub const SENTINEL: &str = "N/A";

/// the five quantities the turbine nacelle reports
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SensorKind {
    Temperature,
    Humidity,
    Voltage,
    Current,
    Power,
}

impl SensorKind {
    /// publish order used by the edge loop
    pub const ALL: [SensorKind; 5] = [
        SensorKind::Temperature,
        SensorKind::Humidity,
        SensorKind::Voltage,
        SensorKind::Current,
        SensorKind::Power,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::Temperature => "temperature",
            SensorKind::Humidity => "humidity",
            SensorKind::Voltage => "voltage",
            SensorKind::Current => "current",
            SensorKind::Power => "power",
        }
    }

    pub fn topic(self) -> String {
        format!("{}{}", TOPIC_BASE, self.as_str())
    }

    /// inverse of [`SensorKind::topic`]; anything outside the namespace is `None`
    pub fn from_topic(topic: &str) -> Option<Self> {
        let suffix = topic.strip_prefix(TOPIC_BASE)?;
        SensorKind::ALL.into_iter().find(|k| k.as_str() == suffix)
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// a formatted physical quantity, or the sentinel
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Reading {
    Value(String),
    #[default]
    Unavailable,
}

impl Reading {
    /// payloads arrive as utf-8 text; the sentinel text maps back to `Unavailable`
    pub fn from_payload(payload: &str) -> Self {
        let trimmed = payload.trim();
        if trimmed.is_empty() || trimmed == SENTINEL {
            Reading::Unavailable
        } else {
            Reading::Value(trimmed.to_string())
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Reading::Value(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Reading::Value(v) => v,
            Reading::Unavailable => SENTINEL,
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// latest value per kind plus capture time
///
/// `seq` increases with every update applied by the state store; live clients
/// use it to discard broadcasts older than what they were replayed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    readings: [Reading; 5],
    pub captured_at: Option<DateTime<Local>>,
    pub seq: u64,
}

impl Snapshot {
    pub fn get(&self, kind: SensorKind) -> &Reading {
        &self.readings[kind.index()]
    }

    pub fn set(&mut self, kind: SensorKind, reading: Reading) {
        self.readings[kind.index()] = reading;
    }

    /// true iff every kind holds a real value
    pub fn is_complete(&self) -> bool {
        self.readings.iter().all(Reading::is_available)
    }

    pub fn timestamp(&self) -> String {
        self.captured_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| SENTINEL.to_string())
    }
}

// wire shape: {"temperature": "...", ..., "timestamp": "..."}
impl Serialize for Snapshot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(SensorKind::ALL.len() + 1))?;
        for kind in SensorKind::ALL {
            map.serialize_entry(kind.as_str(), self.get(kind).as_str())?;
        }
        map.serialize_entry("timestamp", &self.timestamp())?;
        map.end()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_round_trip_through_namespace() {
        assert_eq!(SensorKind::Humidity.topic(), "elle/turbine/humidity");
        assert_eq!(SensorKind::from_topic("elle/turbine/power"), Some(SensorKind::Power));
        assert_eq!(SensorKind::from_topic("elle/turbine/pressure"), None);
        assert_eq!(SensorKind::from_topic("other/turbine/power"), None);
    }

    #[test]
    fn test_sentinel_payload() {
        assert_eq!(Reading::from_payload("N/A"), Reading::Unavailable);
        assert_eq!(Reading::from_payload(""), Reading::Unavailable);
        assert_eq!(Reading::from_payload("23.4°C"), Reading::Value("23.4°C".into()));
        assert_eq!(Reading::Unavailable.as_str(), "N/A");
    }

    #[test]
    fn test_completeness_needs_all_five() {
        let mut snap = Snapshot::default();
        assert!(!snap.is_complete());
        for kind in SensorKind::ALL {
            snap.set(kind, Reading::Value("1".into()));
        }
        assert!(snap.is_complete());
        snap.set(SensorKind::Current, Reading::Unavailable);
        assert!(!snap.is_complete());
    }

    #[test]
    fn test_snapshot_wire_shape() {
        let mut snap = Snapshot::default();
        snap.set(SensorKind::Voltage, Reading::Value("5.01V".into()));
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["voltage"], "5.01V");
        assert_eq!(json["temperature"], "N/A");
        assert_eq!(json["timestamp"], "N/A");
        assert_eq!(json.as_object().unwrap().len(), 6);
    }
}
