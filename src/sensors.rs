//! ==============================================================================
//! sensors.rs - bus sensor driver for the nacelle board
//! ==============================================================================
//!
//! purpose:
//!     talks to the two chips on the shared I2C bus and turns raw register
//!     bytes into formatted readings:
//!
//!     - climate chip (0x44): temperature + relative humidity, one triggered
//!       6-byte measurement frame
//!     - power monitor (0x40): bus voltage, current, power, one 2-byte
//!       register read each
//!
//!     a failed transfer costs only the quantity it was for; the others in
//!     the same cycle are still returned. chip presence is checked once at
//!     startup and a missing chip is a configuration fault.
//!
//! relationships:
//!     - used by: edge.rs (acquisition loop)
//!     - uses: hal.rs (I2cBus)
//!
//! ==============================================================================

use std::time::Duration;

use crate::error::Fault;
use crate::hal::I2cBus;
use crate::reading::Reading;

pub const CLIMATE_SENSOR_ADDR: u8 = 0x44;
pub const POWER_MONITOR_ADDR: u8 = 0x40;

/// single-shot, high repeatability measurement
const CMD_TRIGGER_MEASUREMENT: [u8; 2] = [0x2C, 0x06];
const CLIMATE_FRAME_LEN: usize = 6;

pub const REG_CONFIG: u8 = 0x00;
pub const REG_BUS_VOLTAGE: u8 = 0x01;
pub const REG_POWER: u8 = 0x03;
pub const REG_CURRENT: u8 = 0x04;

/// continuous shunt + bus conversion, 1.1ms conversion times, 4 sample average
const POWER_MONITOR_CONFIG: [u8; 2] = [0x61, 0x80];

const VOLTAGE_LSB: f32 = 1.25 / 1000.0;
const CURRENT_LSB: f32 = 1.25 / 1000.0;
const POWER_LSB: f32 = 10.0 / 1000.0;

// ==============================================================================
// conversions
// ==============================================================================

pub fn temperature_from_raw(raw: u16) -> f32 {
    (raw as f32 / 65535.0) * 175.0 - 45.0
}

pub fn humidity_from_raw(raw: u16) -> f32 {
    (raw as f32 / 65535.0) * 100.0
}

pub fn voltage_from_raw(raw: u16) -> f32 {
    raw as f32 * VOLTAGE_LSB
}

/// the current register is two's complement over 16 bits
pub fn current_from_raw(raw: u16) -> f32 {
    (raw as i16) as f32 * CURRENT_LSB
}

pub fn power_from_raw(raw: u16) -> f32 {
    raw as f32 * POWER_LSB
}

pub fn format_temperature(c: f32) -> Reading {
    Reading::Value(format!("{:.1}°C", c))
}

pub fn format_humidity(rh: f32) -> Reading {
    Reading::Value(format!("{:.1}%", rh))
}

pub fn format_voltage(v: f32) -> Reading {
    Reading::Value(format!("{:.2}V", v))
}

pub fn format_current(a: f32) -> Reading {
    Reading::Value(format!("{:.2}A", a))
}

pub fn format_power(w: f32) -> Reading {
    Reading::Value(format!("{:.2}W", w))
}

// ==============================================================================
// driver
// ==============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClimateReadout {
    pub temperature: Reading,
    pub humidity: Reading,
    pub fault: Option<Fault>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PowerReadout {
    pub voltage: Reading,
    pub current: Reading,
    pub power: Reading,
    /// first failure of the cycle, if any
    pub fault: Option<Fault>,
}

pub struct BusSensorDriver<B> {
    bus: B,
    settle: Duration,
}

impl<B: I2cBus> BusSensorDriver<B> {
    pub fn new(bus: B, settle: Duration) -> Self {
        Self { bus, settle }
    }

    /// Scan the bus once and configure the power monitor.
    ///
    /// Either chip missing means wiring or addressing is wrong, which no
    /// amount of retrying fixes.
    pub fn verify(&mut self) -> Result<(), Fault> {
        let found = self
            .bus
            .scan()
            .map_err(|e| Fault::Config(format!("i2c scan failed: {:#}", e)))?;
        tracing::info!(devices = ?found.iter().map(|a| format!("0x{:02x}", a)).collect::<Vec<_>>(), "i2c scan");

        let mut missing = Vec::new();
        if !found.contains(&POWER_MONITOR_ADDR) {
            missing.push(POWER_MONITOR_ADDR);
        }
        if !found.contains(&CLIMATE_SENSOR_ADDR) {
            missing.push(CLIMATE_SENSOR_ADDR);
        }
        if !missing.is_empty() {
            let list: Vec<String> = missing.iter().map(|a| format!("0x{:02x}", a)).collect();
            return Err(Fault::Config(format!("required sensor(s) not on the bus: {}", list.join(", "))));
        }

        let mut frame = vec![REG_CONFIG];
        frame.extend_from_slice(&POWER_MONITOR_CONFIG);
        self.bus
            .write(POWER_MONITOR_ADDR, &frame)
            .map_err(|e| Fault::Config(format!("power monitor configuration failed: {:#}", e)))?;

        tracing::info!("all required sensors detected and initialized");
        Ok(())
    }

    pub fn read_humidity_sensor(&mut self) -> ClimateReadout {
        match self.measure_climate() {
            Ok((raw_t, raw_rh)) => {
                let temperature = format_temperature(temperature_from_raw(raw_t));
                let humidity = format_humidity(humidity_from_raw(raw_rh));
                tracing::debug!(%temperature, %humidity, "climate sensor");
                ClimateReadout { temperature, humidity, fault: None }
            }
            Err(fault) => {
                tracing::warn!(error = %fault, "climate sensor read failed");
                ClimateReadout {
                    temperature: Reading::Unavailable,
                    humidity: Reading::Unavailable,
                    fault: Some(fault),
                }
            }
        }
    }

    pub fn read_power_sensor(&mut self) -> PowerReadout {
        let mut first_fault = None;
        let mut take = |result: Result<u16, Fault>, convert: fn(u16) -> Reading| match result {
            Ok(raw) => convert(raw),
            Err(fault) => {
                tracing::warn!(error = %fault, "power monitor read failed");
                first_fault.get_or_insert(fault);
                Reading::Unavailable
            }
        };

        let voltage = take(self.read_register(REG_BUS_VOLTAGE), |r| format_voltage(voltage_from_raw(r)));
        let current = take(self.read_register(REG_CURRENT), |r| format_current(current_from_raw(r)));
        let power = take(self.read_register(REG_POWER), |r| format_power(power_from_raw(r)));

        tracing::debug!(%voltage, %current, %power, "power monitor");
        PowerReadout { voltage, current, power, fault: first_fault }
    }

    /// raw (temperature, humidity) words; the two CRC bytes are read but not checked
    fn measure_climate(&mut self) -> Result<(u16, u16), Fault> {
        self.bus
            .write(CLIMATE_SENSOR_ADDR, &CMD_TRIGGER_MEASUREMENT)
            .map_err(|e| Fault::TransientIo(format!("climate trigger: {:#}", e)))?;
        std::thread::sleep(self.settle);

        let mut frame = [0u8; CLIMATE_FRAME_LEN];
        self.bus
            .read(CLIMATE_SENSOR_ADDR, &mut frame)
            .map_err(|e| Fault::TransientIo(format!("climate frame: {:#}", e)))?;

        let raw_t = u16::from_be_bytes([frame[0], frame[1]]);
        let raw_rh = u16::from_be_bytes([frame[3], frame[4]]);
        Ok((raw_t, raw_rh))
    }

    fn read_register(&mut self, reg: u8) -> Result<u16, Fault> {
        let mut word = [0u8; 2];
        self.bus
            .write(POWER_MONITOR_ADDR, &[reg])
            .and_then(|_| self.bus.read(POWER_MONITOR_ADDR, &mut word))
            .map_err(|e| Fault::TransientIo(format!("register 0x{:02x}: {:#}", reg, e)))?;
        Ok(u16::from_be_bytes(word))
    }
}
