//! Register-level peripherals read for telemetry.
//!
//! Drivers for the buses themselves live in the daemon; this module only
//! knows register layouts. Every read can fail, and callers that only want a
//! number for a status page turn failures into [UNAVAILABLE].

use std::fmt::Display;

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};
use log::warn;
use thiserror::Error;

/// Shown in place of a reading that could not be taken.
pub const UNAVAILABLE: &str = "N/A";

#[derive(Debug, Error)]
pub enum PeripheralError {
    #[error("peripheral I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} unavailable")]
    Unavailable(String),
}

/// Byte-wide register access on a single bus device.
pub trait RegisterBus: Send + Sync {
    fn read_register(&mut self, register: u8) -> Result<u8, PeripheralError>;
    fn write_register(&mut self, register: u8, value: u8) -> Result<(), PeripheralError>;
}

impl RegisterBus for Box<dyn RegisterBus> {
    fn read_register(&mut self, register: u8) -> Result<u8, PeripheralError> {
        (**self).read_register(register)
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<(), PeripheralError> {
        (**self).write_register(register, value)
    }
}

/// Formats a telemetry reading, logging and substituting [UNAVAILABLE] on
/// failure.
pub fn reading_or_unavailable<T: Display>(what: &str, reading: Result<T, PeripheralError>) -> String {
    match reading {
        Ok(value) => value.to_string(),
        Err(e) => {
            warn!("failed to read {what}: {e}");
            UNAVAILABLE.to_string()
        }
    }
}

const VCELL_REGISTER: u8 = 0x02;
const SOC_REGISTER: u8 = 0x04;
const VCELL_VOLTS_PER_LSB: f32 = 78.125e-6;

/// A MAX17048-style single cell fuel gauge.
pub struct FuelGauge<B> {
    bus: B,
}

impl<B: RegisterBus> FuelGauge<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    fn read_word(&mut self, register: u8) -> Result<u16, PeripheralError> {
        let hi = self.bus.read_register(register)?;
        let lo = self.bus.read_register(register + 1)?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    /// Cell voltage in volts.
    pub fn voltage(&mut self) -> Result<f32, PeripheralError> {
        Ok(self.read_word(VCELL_REGISTER)? as f32 * VCELL_VOLTS_PER_LSB)
    }

    /// State of charge in percent. May briefly read above 100 on a full cell.
    pub fn state_of_charge(&mut self) -> Result<f32, PeripheralError> {
        Ok(self.read_word(SOC_REGISTER)? as f32 / 256.0)
    }
}

fn bcd_to_bin(value: u8) -> u8 {
    (value >> 4) * 10 + (value & 0x0F)
}

fn bin_to_bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

/// A BQ32002/DS1307-style real time clock keeping BCD time in registers 0..=6.
pub struct RealTimeClock<B> {
    bus: B,
}

impl<B: RegisterBus> RealTimeClock<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn now(&mut self) -> Result<NaiveDateTime, PeripheralError> {
        let mut raw = [0u8; 7];
        for (register, byte) in raw.iter_mut().enumerate() {
            *byte = self.bus.read_register(register as u8)?;
        }
        let second = bcd_to_bin(raw[0] & 0x7F);
        let minute = bcd_to_bin(raw[1] & 0x7F);
        let hour = bcd_to_bin(raw[2] & 0x3F);
        let day = bcd_to_bin(raw[4] & 0x3F);
        let month = bcd_to_bin(raw[5] & 0x1F);
        let year = 2000 + bcd_to_bin(raw[6]) as i32;

        NaiveDate::from_ymd_opt(year, month as u32, day as u32)
            .and_then(|date| date.and_hms_opt(hour as u32, minute as u32, second as u32))
            .ok_or_else(|| PeripheralError::Unavailable(format!("rtc time {raw:02x?}")))
    }

    pub fn set(&mut self, time: NaiveDateTime) -> Result<(), PeripheralError> {
        let year = (time.year() - 2000).clamp(0, 99) as u8;
        let values = [
            bin_to_bcd(time.second() as u8),
            bin_to_bcd(time.minute() as u8),
            bin_to_bcd(time.hour() as u8),
            time.weekday().number_from_monday() as u8,
            bin_to_bcd(time.day() as u8),
            bin_to_bcd(time.month() as u8),
            bin_to_bcd(year),
        ];
        for (register, value) in values.into_iter().enumerate() {
            self.bus.write_register(register as u8, value)?;
        }
        Ok(())
    }
}
