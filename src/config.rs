//! ==============================================================================
//! config.rs - Runtime Configuration Loader
//! ==============================================================================
//!
//! purpose:
//!     defines the schema for `telemetry.toml`.
//!     loads configuration from file or falls back to defaults.
//!
//! structure:
//!     - NodeConfig: which role this process plays ("edge" or "relay").
//!     - BrokerConfig: where the pub/sub broker lives (shared by both roles).
//!     - EdgeConfig: wireless link, bus, pins and the acquisition period.
//!     - RelayConfig: live-client listener, reconnect cadence, generation API.
//!
//! lookup order:
//!     $TURBINE_CONFIG, config/telemetry.toml, ../config/telemetry.toml,
//!     then built-in defaults. GEMINI_API_KEY overrides the configured key.
//!
//! ==============================================================================

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::broker::BrokerOptions;
use crate::link::LinkPolicy;

pub const CONFIG_ENV: &str = "TURBINE_CONFIG";
pub const API_KEY_ENV: &str = "GEMINI_API_KEY";

const DEFAULT_API_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent";

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct TelemetryConfig {
    pub node: NodeConfig,
    pub logging: LoggingConfig,
    pub broker: BrokerConfig,
    pub edge: EdgeConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Edge,
    Relay,
}

impl std::str::FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "edge" => Ok(Role::Edge),
            "relay" => Ok(Role::Relay),
            other => anyhow::bail!("unknown role '{}' (expected edge or relay)", other),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct NodeConfig {
    pub role: Role,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { host: "localhost".to_string(), port: 1883, keep_alive_secs: 30, connect_timeout_secs: 10 }
    }
}

impl BrokerConfig {
    pub fn options(&self, client_id: &str) -> BrokerOptions {
        BrokerOptions {
            client_id: client_id.to_string(),
            host: self.host.clone(),
            port: self.port,
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EdgeConfig {
    /// empty means derive from the machine id
    pub client_id: String,
    pub poll_interval_ms: u64,
    pub broker_retry_ms: u64,
    pub wifi: WifiConfig,
    pub bus: BusConfig,
    pub pins: PinConfig,
}

impl Default for EdgeConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            poll_interval_ms: 5000,
            broker_retry_ms: 5000,
            wifi: WifiConfig::default(),
            bus: BusConfig::default(),
            pins: PinConfig::default(),
        }
    }
}

impl EdgeConfig {
    pub fn client_id(&self) -> String {
        if !self.client_id.is_empty() {
            return self.client_id.clone();
        }
        let host_id = std::fs::read_to_string("/etc/machine-id")
            .ok()
            .and_then(|id| host_id_from_machine_id(&id))
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| "unknown".to_string());
        format!("turbine_edge_{}", host_id)
    }
}

/// First six bytes of the machine id, re-encoded as lowercase hex.
fn host_id_from_machine_id(raw: &str) -> Option<String> {
    let bytes = hex::decode(raw.trim()).ok()?;
    if bytes.len() < 6 {
        return None;
    }
    Some(hex::encode(&bytes[..6]))
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WifiConfig {
    pub ssid: String,
    pub credential: String,
    pub max_attempts: u32,
    pub attempt_backoff_ms: u64,
    pub interface: String,
}

impl Default for WifiConfig {
    fn default() -> Self {
        let policy = LinkPolicy::default();
        Self {
            ssid: String::new(),
            credential: String::new(),
            max_attempts: policy.max_attempts,
            attempt_backoff_ms: policy.backoff.as_millis() as u64,
            interface: "wlan0".to_string(),
        }
    }
}

impl WifiConfig {
    pub fn policy(&self) -> LinkPolicy {
        LinkPolicy { max_attempts: self.max_attempts, backoff: Duration::from_millis(self.attempt_backoff_ms) }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BusConfig {
    pub i2c_bus: u8,
    pub settle_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { i2c_bus: 1, settle_ms: 20 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PinConfig {
    pub indicator: u8,
    pub restart_button: u8,
    pub debounce_ms: u64,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self { indicator: 17, restart_button: 12, debounce_ms: 50 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RelayConfig {
    pub listen: SocketAddr,
    pub reconnect_secs: u64,
    pub client_id: String,
    pub generation: GenerationConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 5000)),
            reconnect_secs: 5,
            client_id: "turbine_relay".to_string(),
            generation: GenerationConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GenerationConfig {
    pub api_url: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self { api_url: DEFAULT_API_URL.to_string(), api_key: String::new(), timeout_secs: 10 }
    }
}

impl TelemetryConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let mut config: TelemetryConfig =
            toml::from_str(content).map_err(|e| anyhow::anyhow!("Failed to parse config: {}", e))?;
        config.apply_env();
        Ok(config)
    }

    /// Load with default fallback
    pub fn load_or_default() -> Self {
        let mut paths = Vec::new();
        if let Ok(explicit) = std::env::var(CONFIG_ENV) {
            paths.push(PathBuf::from(explicit));
        }
        paths.push(PathBuf::from("config").join("telemetry.toml"));
        paths.push(PathBuf::from("..").join("config").join("telemetry.toml"));

        for path in &paths {
            if path.exists() {
                match Self::load(path) {
                    Ok(config) => {
                        println!("[CONFIG] Loaded from {}", path.display());
                        return config;
                    }
                    Err(e) => {
                        println!("[CONFIG] Warning: Failed to load {}: {}", path.display(), e);
                    }
                }
            }
        }

        println!("[CONFIG] Warning: No config file found - using defaults");
        let mut config = Self::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(API_KEY_ENV) {
            if !key.is_empty() {
                self.relay.generation.api_key = key;
            }
        }
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("┌─────────────────────────────────────────┐");
        println!("│        TELEMETRY CONFIGURATION          │");
        println!("├─────────────────────────────────────────┤");
        println!("│ Role: {:?}", self.node.role);
        println!("│ Broker: {}:{}", self.broker.host, self.broker.port);
        println!("│ Log Level: {}", self.logging.level);
        match self.node.role {
            Role::Edge => {
                println!("│ SSID: {}", self.edge.wifi.ssid);
                println!("│ Credential: {}", mask(&self.edge.wifi.credential));
                println!("│ Poll Interval: {}ms", self.edge.poll_interval_ms);
                println!("│ I2C Bus: {}", self.edge.bus.i2c_bus);
            }
            Role::Relay => {
                println!("│ Listen: {}", self.relay.listen);
                println!("│ Reconnect: {}s", self.relay.reconnect_secs);
                println!("│ API Key: {}", mask(&self.relay.generation.api_key));
            }
        }
        println!("└─────────────────────────────────────────┘");
    }
}

fn mask(secret: &str) -> String {
    if secret.is_empty() {
        "(unset)".to_string()
    } else {
        "*".repeat(8)
    }
}
