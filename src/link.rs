//! ==============================================================================
//! link.rs - wireless link manager
//! ==============================================================================
//!
//! purpose:
//!     brings the edge device onto the wireless network before anything else
//!     happens. bounded: a fixed number of attempts with a fixed backoff,
//!     then give up. a wrong credential never fixes itself, so exhausting
//!     the budget is fatal for startup rather than retried forever.
//!
//! relationships:
//!     - used by: edge.rs (Init -> LinkUp)
//!     - uses: hal.rs (Indicator, toggled once per attempt)
//!     - uses: nmcli (on feature="hardware", via subprocess like the rest of
//!       the Pi tooling)
//!
//! ==============================================================================

use std::time::Duration;

use anyhow::Result;

use crate::error::Fault;
use crate::hal::Indicator;

/// Station state as reported by the network stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    Idle,
    Connecting,
    WrongPassword,
    NoApFound,
    ConnectFailed,
    /// associated and addressed; the only status that counts as connected
    GotIp,
}

pub trait WirelessLink: Send {
    /// drop whatever association exists so the attempt starts clean
    fn reset(&mut self) -> Result<()>;
    /// kick off association; completion is observed through `status`
    fn begin(&mut self, ssid: &str, credential: &str) -> Result<()>;
    fn status(&mut self) -> LinkStatus;
    fn address(&mut self) -> Option<String>;
}

#[derive(Clone, Debug)]
pub struct LinkPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for LinkPolicy {
    fn default() -> Self {
        Self { max_attempts: 20, backoff: Duration::from_millis(500) }
    }
}

pub struct LinkManager<L, I> {
    link: L,
    indicator: I,
    policy: LinkPolicy,
}

impl<L: WirelessLink, I: Indicator> LinkManager<L, I> {
    pub fn new(link: L, indicator: I, policy: LinkPolicy) -> Self {
        Self { link, indicator, policy }
    }

    /// Associate with `ssid`, polling status between attempts.
    pub async fn connect(&mut self, ssid: &str, credential: &str) -> Result<(), Fault> {
        if let Err(e) = self.link.reset() {
            tracing::warn!(error = %e, "link reset failed, continuing");
        }

        tracing::info!(ssid, "connecting to wireless network");
        self.link
            .begin(ssid, credential)
            .map_err(|e| Fault::Config(format!("cannot start association with {}: {:#}", ssid, e)))?;

        self.indicate(|i| i.set(true));
        let mut attempts = 0;
        let mut status = self.link.status();
        while status != LinkStatus::GotIp && attempts < self.policy.max_attempts {
            self.indicate(|i| i.toggle());
            attempts += 1;
            tracing::info!(attempt = attempts, max = self.policy.max_attempts, ?status, "waiting for link");
            tokio::time::sleep(self.policy.backoff).await;
            status = self.link.status();
        }
        self.indicate(|i| i.set(false));

        if status == LinkStatus::GotIp {
            let address = self.link.address().unwrap_or_else(|| "unknown".to_string());
            tracing::info!(%address, "wireless link up");
            Ok(())
        } else {
            Err(Fault::Config(format!(
                "wireless link not up after {} attempts (last status {:?})",
                attempts, status
            )))
        }
    }

    // the indicator is cosmetic; a dead LED must not fail the link
    fn indicate(&mut self, f: impl FnOnce(&mut I) -> Result<()>) {
        if let Err(e) = f(&mut self.indicator) {
            tracing::debug!(error = %e, "indicator update failed");
        }
    }
}

// ==============================================================================================
// MOCK IMPLEMENTATION (For Non-Hardware Build)
// ==============================================================================================
#[cfg(not(feature = "hardware"))]
#[derive(Default)]
pub struct SystemLink {}

#[cfg(not(feature = "hardware"))]
impl SystemLink {
    pub fn new(_interface: &str) -> Self {
        tracing::info!("Using MOCK wireless link (assumes host networking is up)");
        Self {}
    }
}

#[cfg(not(feature = "hardware"))]
impl WirelessLink for SystemLink {
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn begin(&mut self, ssid: &str, _credential: &str) -> Result<()> {
        tracing::debug!("[MOCK LINK] Associating with {}", ssid);
        Ok(())
    }

    fn status(&mut self) -> LinkStatus {
        LinkStatus::GotIp
    }

    fn address(&mut self) -> Option<String> {
        Some("127.0.0.1".to_string())
    }
}

// ==============================================================================================
// REAL IMPLEMENTATION (NetworkManager on the Pi)
// ==============================================================================================
#[cfg(feature = "hardware")]
pub struct SystemLink {
    interface: String,
    pending: Option<std::process::Child>,
}

#[cfg(feature = "hardware")]
impl SystemLink {
    pub fn new(interface: &str) -> Self {
        Self { interface: interface.to_string(), pending: None }
    }

    fn nmcli(&self, args: &[&str]) -> Result<String> {
        use std::process::Command;

        let output = Command::new("nmcli").args(args).output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("nmcli {}: {}", args.join(" "), stderr.trim());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[cfg(feature = "hardware")]
impl WirelessLink for SystemLink {
    fn reset(&mut self) -> Result<()> {
        // "not active" is fine here, so the exit status is ignored
        let _ = self.nmcli(&["device", "disconnect", self.interface.as_str()]);
        Ok(())
    }

    fn begin(&mut self, ssid: &str, credential: &str) -> Result<()> {
        use std::process::{Command, Stdio};

        let child = Command::new("nmcli")
            .args(["device", "wifi", "connect", ssid, "password", credential, "ifname", self.interface.as_str()])
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        self.pending = Some(child);
        Ok(())
    }

    fn status(&mut self) -> LinkStatus {
        if let Some(child) = self.pending.as_mut() {
            match child.try_wait() {
                Ok(None) => return LinkStatus::Connecting,
                Ok(Some(exit)) if !exit.success() => {
                    self.pending = None;
                    // nmcli exit code 10: connection/ssid does not exist
                    return if exit.code() == Some(10) { LinkStatus::NoApFound } else { LinkStatus::ConnectFailed };
                }
                Ok(Some(_)) => self.pending = None,
                Err(_) => return LinkStatus::ConnectFailed,
            }
        }

        match self.nmcli(&["-t", "-f", "GENERAL.STATE", "device", "show", self.interface.as_str()]) {
            Ok(state) if state.contains("(connected)") => LinkStatus::GotIp,
            Ok(state) if state.contains("connecting") => LinkStatus::Connecting,
            Ok(state) if state.contains("need-auth") => LinkStatus::WrongPassword,
            Ok(_) => LinkStatus::Idle,
            Err(_) => LinkStatus::ConnectFailed,
        }
    }

    fn address(&mut self) -> Option<String> {
        self.nmcli(&["-g", "IP4.ADDRESS", "device", "show", self.interface.as_str()])
            .ok()
            .and_then(|s| s.lines().next().map(|l| l.to_string()))
    }
}
