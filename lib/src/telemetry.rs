//! Readings shown by the diagnostics mode.
//!
//! Every field is optional: a reading that fails is logged and shown as
//! [UNAVAILABLE](crate::peripheral::UNAVAILABLE) instead of stopping the page.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use log::warn;

use crate::peripheral::{FuelGauge, PeripheralError, RealTimeClock, RegisterBus};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetrySnapshot {
    pub load_average: Option<f32>,
    pub mem_total_mb: Option<u64>,
    pub mem_available_mb: Option<u64>,
    pub disk_free_mb: Option<u64>,
    pub soc_temp_c: Option<f32>,
    pub uptime_secs: Option<u64>,
    pub system_time: String,
    pub rtc_time: Option<NaiveDateTime>,
    pub battery_volts: Option<f32>,
    pub battery_percent: Option<f32>,
    pub interface: String,
    pub link_up: bool,
    pub ipv4: Option<String>,
}

#[async_trait]
pub trait Telemetry: Send {
    async fn sample(&mut self) -> TelemetrySnapshot;
}

/// Reads the host's `/proc` and `/sys`, plus optional I2C peripherals.
pub struct SystemTelemetry {
    root: PathBuf,
    interface: String,
    fuel_gauge: Option<FuelGauge<Box<dyn RegisterBus>>>,
    rtc: Option<RealTimeClock<Box<dyn RegisterBus>>>,
}

impl SystemTelemetry {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            root: PathBuf::from("/"),
            interface: interface.into(),
            fuel_gauge: None,
            rtc: None,
        }
    }

    /// Reads `proc/` and `sys/` under `root` instead of `/`.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    pub fn with_fuel_gauge(mut self, bus: Box<dyn RegisterBus>) -> Self {
        self.fuel_gauge = Some(FuelGauge::new(bus));
        self
    }

    pub fn with_rtc(mut self, bus: Box<dyn RegisterBus>) -> Self {
        self.rtc = Some(RealTimeClock::new(bus));
        self
    }

    async fn read(&self, relative: &str) -> Option<String> {
        let path = self.root.join(relative);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Some(contents),
            Err(e) => {
                warn!("failed to read {}: {e}", path.display());
                None
            }
        }
    }

    async fn disk_free_mb(&self) -> Option<u64> {
        let output = tokio::process::Command::new("df")
            .args(["-Pk", "/"])
            .output()
            .await
            .inspect_err(|e| warn!("failed to run df: {e}"))
            .ok()?;
        parse_df_free_mb(&String::from_utf8_lossy(&output.stdout))
    }

    async fn ipv4(&self) -> Option<String> {
        let output = tokio::process::Command::new("ip")
            .args(["-4", "addr", "show", &self.interface])
            .output()
            .await
            .inspect_err(|e| warn!("failed to run ip: {e}"))
            .ok()?;
        parse_inet(&String::from_utf8_lossy(&output.stdout))
    }
}

fn optional<T>(what: &str, reading: Result<T, PeripheralError>) -> Option<T> {
    reading.inspect_err(|e| warn!("failed to read {what}: {e}")).ok()
}

#[async_trait]
impl Telemetry for SystemTelemetry {
    async fn sample(&mut self) -> TelemetrySnapshot {
        let meminfo = self.read("proc/meminfo").await;
        let operstate = self
            .read(&format!("sys/class/net/{}/operstate", self.interface))
            .await;
        let link_up = operstate.is_some_and(|s| s.trim() == "up");

        let mut snapshot = TelemetrySnapshot {
            load_average: self.read("proc/loadavg").await.and_then(|s| parse_loadavg(&s)),
            mem_total_mb: meminfo.as_deref().and_then(|m| parse_meminfo_mb(m, "MemTotal")),
            mem_available_mb: meminfo
                .as_deref()
                .and_then(|m| parse_meminfo_mb(m, "MemAvailable")),
            disk_free_mb: self.disk_free_mb().await,
            soc_temp_c: self
                .read("sys/class/thermal/thermal_zone0/temp")
                .await
                .and_then(|s| s.trim().parse::<f32>().ok())
                .map(|millis| millis / 1000.0),
            uptime_secs: self.read("proc/uptime").await.and_then(|s| parse_uptime(&s)),
            system_time: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            interface: self.interface.clone(),
            link_up,
            ipv4: if link_up { self.ipv4().await } else { None },
            ..Default::default()
        };

        if let Some(rtc) = self.rtc.as_mut() {
            snapshot.rtc_time = optional("rtc", rtc.now());
        }
        if let Some(gauge) = self.fuel_gauge.as_mut() {
            snapshot.battery_volts = optional("battery voltage", gauge.voltage());
            snapshot.battery_percent = optional("battery charge", gauge.state_of_charge());
        }
        snapshot
    }
}

pub fn parse_loadavg(contents: &str) -> Option<f32> {
    contents.split_whitespace().next()?.parse().ok()
}

pub fn parse_uptime(contents: &str) -> Option<u64> {
    let secs: f64 = contents.split_whitespace().next()?.parse().ok()?;
    Some(secs as u64)
}

/// Returns a `/proc/meminfo` field in megabytes.
pub fn parse_meminfo_mb(contents: &str, field: &str) -> Option<u64> {
    contents.lines().find_map(|line| {
        let rest = line.strip_prefix(field)?.strip_prefix(':')?;
        let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kb / 1024)
    })
}

/// Free space in megabytes from `df -Pk` output.
pub fn parse_df_free_mb(output: &str) -> Option<u64> {
    let line = output.lines().nth(1)?;
    let available_kb: u64 = line.split_whitespace().nth(3)?.parse().ok()?;
    Some(available_kb / 1024)
}

/// First IPv4 address in `ip addr show` output.
pub fn parse_inet(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        line.trim()
            .strip_prefix("inet ")
            .and_then(|rest| rest.split('/').next())
            .map(|s| s.to_string())
    })
}

pub fn format_uptime(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    if hours >= 24 {
        format!("{}d {}h", hours / 24, hours % 24)
    } else {
        format!("{}h {:02}m", hours, minutes)
    }
}
