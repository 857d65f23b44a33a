//! ==============================================================================
//! hal.rs - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     provides a unified interface for the edge device's hardware: the shared
//!     I2C bus both sensor chips sit on, the "connecting" indicator LED and the
//!     manual restart button.
//!     abstracts away the difference between running on a real Raspberry Pi
//!     (using `rppal`) and a development machine (using mocks).
//!
//! design philosophy:
//!     - "Compile Anywhere": The crate should compile and test on any host.
//!     - "Zero Cost": On the Pi, this compiles down to direct `rppal` calls.
//!     - "Quiet Interrupts": the button callback only raises a flag.
//!
//! relationships:
//!     - used by: sensors.rs (I2cBus), link.rs (Indicator), edge.rs (RestartButton)
//!     - uses: rppal (on feature="hardware")
//!
//! ==============================================================================

use anyhow::Result;

use crate::edge::RestartSignal;

/// raw access to an addressed bus shared by several chips
pub trait I2cBus: Send + 'static {
    /// addresses that acknowledge a probe
    fn scan(&mut self) -> Result<Vec<u8>>;
    fn write(&mut self, addr: u8, data: &[u8]) -> Result<()>;
    fn read(&mut self, addr: u8, buf: &mut [u8]) -> Result<()>;
}

/// a single on/off side-channel output (status LED)
pub trait Indicator: Send {
    fn set(&mut self, on: bool) -> Result<()>;
    fn toggle(&mut self) -> Result<()>;
}

/// 7-bit addresses outside the reserved ranges, same window as `i2cdetect`
#[cfg_attr(not(feature = "hardware"), allow(dead_code))]
const SCAN_RANGE: std::ops::RangeInclusive<u8> = 0x08..=0x77;

// ==============================================================================================
// MOCK IMPLEMENTATION (For Non-Hardware Build)
// ==============================================================================================
#[cfg(not(feature = "hardware"))]
pub struct Hal {}

#[cfg(not(feature = "hardware"))]
impl Hal {
    pub fn new() -> Result<Self> {
        tracing::info!("Using MOCK HAL (No hardware access)");
        Ok(Self {})
    }

    pub fn i2c(&self, bus: u8) -> Result<MockBus> {
        tracing::debug!("[MOCK I2C] Opening bus {}", bus);
        Ok(MockBus::default())
    }

    pub fn indicator(&self, pin: u8) -> Result<MockIndicator> {
        Ok(MockIndicator { pin, on: false })
    }

    pub fn arm_restart_button(&self, pin: u8, debounce_ms: u64, _signal: RestartSignal) -> Result<RestartButton> {
        tracing::debug!("[MOCK GPIO] Restart button on pin {} ({}ms debounce) is inert", pin, debounce_ms);
        Ok(RestartButton {})
    }
}

/// Answers like a healthy board: both chips present, plausible register values.
#[cfg(not(feature = "hardware"))]
#[derive(Default)]
pub struct MockBus {
    last_register: u8,
}

#[cfg(not(feature = "hardware"))]
impl I2cBus for MockBus {
    fn scan(&mut self) -> Result<Vec<u8>> {
        Ok(vec![crate::sensors::POWER_MONITOR_ADDR, crate::sensors::CLIMATE_SENSOR_ADDR])
    }

    fn write(&mut self, addr: u8, data: &[u8]) -> Result<()> {
        tracing::trace!("[MOCK I2C] Addr: 0x{:02X}, Write: {}", addr, hex::encode(data));
        if let Some(reg) = data.first() {
            self.last_register = *reg;
        }
        Ok(())
    }

    fn read(&mut self, addr: u8, buf: &mut [u8]) -> Result<()> {
        let frame: &[u8] = match (addr, self.last_register) {
            // 24.0°C, 55.0%RH
            (crate::sensors::CLIMATE_SENSOR_ADDR, _) => &[0x64, 0xF0, 0x00, 0x8C, 0xCC, 0x00],
            (_, crate::sensors::REG_BUS_VOLTAGE) => &[0x0F, 0xA0], // 5.00V
            (_, crate::sensors::REG_CURRENT) => &[0x01, 0x90],     // 0.50A
            (_, crate::sensors::REG_POWER) => &[0x00, 0xFA],       // 2.50W
            _ => &[0x00, 0x00],
        };
        let n = buf.len().min(frame.len());
        buf[..n].copy_from_slice(&frame[..n]);
        Ok(())
    }
}

#[cfg(not(feature = "hardware"))]
pub struct MockIndicator {
    pin: u8,
    on: bool,
}

#[cfg(not(feature = "hardware"))]
impl Indicator for MockIndicator {
    fn set(&mut self, on: bool) -> Result<()> {
        self.on = on;
        tracing::trace!("[MOCK LED] Pin {} -> {}", self.pin, on);
        Ok(())
    }

    fn toggle(&mut self) -> Result<()> {
        let next = !self.on;
        self.set(next)
    }
}

/// Keeps the interrupt registration alive for as long as it is held.
#[cfg(not(feature = "hardware"))]
pub struct RestartButton {}

// ==============================================================================================
// REAL IMPLEMENTATION (For Raspberry Pi)
// ==============================================================================================
#[cfg(feature = "hardware")]
pub struct Hal {
    gpio: rppal::gpio::Gpio,
}

#[cfg(feature = "hardware")]
impl Hal {
    pub fn new() -> Result<Self> {
        tracing::info!("Using REAL HARDWARE HAL (rppal)");
        let gpio = rppal::gpio::Gpio::new()?;
        Ok(Self { gpio })
    }

    pub fn i2c(&self, bus: u8) -> Result<PiBus> {
        let i2c = rppal::i2c::I2c::with_bus(bus)?;
        Ok(PiBus { i2c })
    }

    pub fn indicator(&self, pin: u8) -> Result<PiIndicator> {
        let mut out = self.gpio.get(pin)?.into_output();
        out.set_low();
        Ok(PiIndicator { pin: out })
    }

    pub fn arm_restart_button(&self, pin: u8, debounce_ms: u64, signal: RestartSignal) -> Result<RestartButton> {
        use rppal::gpio::Trigger;
        use std::time::Duration;

        let mut input = self.gpio.get(pin)?.into_input_pullup();
        // runs on rppal's interrupt thread: flag only, no bus or network I/O
        input.set_async_interrupt(
            Trigger::FallingEdge,
            Some(Duration::from_millis(debounce_ms)),
            move |_event| signal.raise(),
        )?;
        Ok(RestartButton { _pin: input })
    }
}

#[cfg(feature = "hardware")]
pub struct PiBus {
    i2c: rppal::i2c::I2c,
}

#[cfg(feature = "hardware")]
impl I2cBus for PiBus {
    fn scan(&mut self) -> Result<Vec<u8>> {
        let mut found = Vec::new();
        let mut probe = [0u8; 1];
        for addr in SCAN_RANGE {
            self.i2c.set_slave_address(addr as u16)?;
            if self.i2c.read(&mut probe).is_ok() {
                found.push(addr);
            }
        }
        Ok(found)
    }

    fn write(&mut self, addr: u8, data: &[u8]) -> Result<()> {
        self.i2c.set_slave_address(addr as u16)?;
        let written = self.i2c.write(data)?;
        if written != data.len() {
            anyhow::bail!("short write to 0x{:02X}: {}/{} bytes", addr, written, data.len());
        }
        Ok(())
    }

    fn read(&mut self, addr: u8, buf: &mut [u8]) -> Result<()> {
        self.i2c.set_slave_address(addr as u16)?;
        let read = self.i2c.read(buf)?;
        if read != buf.len() {
            anyhow::bail!("short read from 0x{:02X}: {}/{} bytes", addr, read, buf.len());
        }
        tracing::trace!("[I2C] Addr: 0x{:02X}, Read: {}", addr, hex::encode(&buf[..]));
        Ok(())
    }
}

#[cfg(feature = "hardware")]
pub struct PiIndicator {
    pin: rppal::gpio::OutputPin,
}

#[cfg(feature = "hardware")]
impl Indicator for PiIndicator {
    fn set(&mut self, on: bool) -> Result<()> {
        if on { self.pin.set_high(); } else { self.pin.set_low(); }
        Ok(())
    }

    fn toggle(&mut self) -> Result<()> {
        self.pin.toggle();
        Ok(())
    }
}

#[cfg(feature = "hardware")]
pub struct RestartButton {
    _pin: rppal::gpio::InputPin,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_range_skips_reserved_addresses() {
        assert_eq!(*SCAN_RANGE.start(), 0x08);
        assert_eq!(*SCAN_RANGE.end(), 0x77);
        assert!(SCAN_RANGE.contains(&crate::sensors::CLIMATE_SENSOR_ADDR));
        assert!(SCAN_RANGE.contains(&crate::sensors::POWER_MONITOR_ADDR));
    }

    #[cfg(not(feature = "hardware"))]
    #[test]
    fn test_mock_bus_reports_both_chips() {
        let hal = Hal::new().unwrap();
        let mut bus = hal.i2c(1).unwrap();
        let found = bus.scan().unwrap();
        assert!(found.contains(&0x40));
        assert!(found.contains(&0x44));
    }
}
