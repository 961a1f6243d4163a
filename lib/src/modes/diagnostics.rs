//! Pages of hardware, power and network readings.

use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use embedded_graphics::pixelcolor::Rgb888;
use embedded_graphics::prelude::*;
use log::debug;
use tokio::time::Instant;

use crate::bus::{Address, ModeContext, ModeId, Payload};
use crate::frame::{Dimensions, Frame, Orientation};
use crate::input::{ControlId, InputEvent};
use crate::mode::Mode;
use crate::modes::ids;
use crate::overlay;
use crate::peripheral::UNAVAILABLE;
use crate::telemetry::{Telemetry, TelemetrySnapshot, format_uptime};

const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    Hardware,
    Power,
    Network,
}

impl Page {
    const ALL: [Page; 3] = [Page::Hardware, Page::Power, Page::Network];

    fn title(self) -> &'static str {
        match self {
            Page::Hardware => "Hardware",
            Page::Power => "Power",
            Page::Network => "Network",
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    fn step(self, delta: i32) -> Page {
        let len = Self::ALL.len() as i32;
        Self::ALL[(self.index() as i32 + delta).rem_euclid(len) as usize]
    }
}

fn or_unavailable<T>(reading: Option<T>, show: impl FnOnce(T) -> String) -> String {
    reading.map(show).unwrap_or_else(|| UNAVAILABLE.to_string())
}

fn row(label: &str, value: impl Display) -> String {
    format!("{label:<10}{value}")
}

/// The text rows of one page.
pub fn page_lines(page: Page, snapshot: &TelemetrySnapshot) -> Vec<String> {
    match page {
        Page::Hardware => vec![
            row("CPU load", or_unavailable(snapshot.load_average, |l| format!("{l:.2}"))),
            row(
                "Memory",
                match (snapshot.mem_available_mb, snapshot.mem_total_mb) {
                    (Some(available), Some(total)) => format!("{available}/{total} MB"),
                    _ => UNAVAILABLE.to_string(),
                },
            ),
            row("Disk free", or_unavailable(snapshot.disk_free_mb, |d| format!("{d} MB"))),
            row("SoC temp", or_unavailable(snapshot.soc_temp_c, |t| format!("{t:.1} C"))),
            row("Uptime", or_unavailable(snapshot.uptime_secs, format_uptime)),
            row("Time", &snapshot.system_time),
            row(
                "RTC",
                or_unavailable(snapshot.rtc_time, |t| t.format("%Y-%m-%d %H:%M:%S").to_string()),
            ),
        ],
        Page::Power => vec![
            row("Battery", or_unavailable(snapshot.battery_volts, |v| format!("{v:.2} V"))),
            row("Charge", or_unavailable(snapshot.battery_percent, |p| format!("{p:.0} %"))),
        ],
        Page::Network => vec![
            row("Interface", &snapshot.interface),
            row("Link", if snapshot.link_up { "up" } else { "down" }),
            row("IPv4", or_unavailable(snapshot.ipv4.clone(), |ip| ip)),
        ],
    }
}

pub struct Diagnostics {
    id: ModeId,
    telemetry: Box<dyn Telemetry>,
    page: Page,
    snapshot: Option<TelemetrySnapshot>,
    next_refresh: Instant,
    display: Dimensions,
    orientation: Orientation,
    dirty: bool,
}

impl Diagnostics {
    pub fn new(telemetry: Box<dyn Telemetry>, display: Dimensions) -> Self {
        Self {
            id: ids::DIAGNOSTICS,
            telemetry,
            page: Page::Hardware,
            snapshot: None,
            next_refresh: Instant::now(),
            display,
            orientation: Orientation::default(),
            dirty: true,
        }
    }

    pub fn page(&self) -> Page {
        self.page
    }

    fn render(&self) -> Frame {
        let mut frame = Frame::new(self.display);
        let title = format!(
            "{} {}/{}",
            self.page.title(),
            self.page.index() + 1,
            Page::ALL.len()
        );
        overlay::draw_header(&mut frame, &title);
        let lines: Vec<(String, Rgb888)> = match &self.snapshot {
            Some(snapshot) => page_lines(self.page, snapshot)
                .into_iter()
                .map(|line| {
                    let color = if line.ends_with(UNAVAILABLE) {
                        overlay::DIM_GRAY
                    } else {
                        Rgb888::WHITE
                    };
                    (line, color)
                })
                .collect(),
            None => vec![("Reading...".to_string(), overlay::MID_GRAY)],
        };
        overlay::draw_lines(&mut frame, Point::new(8, 34), &lines);
        super::orient(frame, self.orientation)
    }
}

#[async_trait]
impl Mode for Diagnostics {
    fn id(&self) -> &ModeId {
        &self.id
    }

    async fn on_input(&mut self, event: InputEvent, ctx: &mut ModeContext) {
        let delta = match event {
            InputEvent::Encoder(rotation) => rotation.delta(),
            InputEvent::Control { .. } => match event.pressed() {
                Some(ControlId::Up | ControlId::Left) => -1,
                Some(ControlId::Down | ControlId::Right) => 1,
                Some(ControlId::Cross) => {
                    ctx.request_focus(ids::VIEWFINDER);
                    return;
                }
                _ => return,
            },
            InputEvent::LongPress { .. } => return,
        };
        self.page = self.page.step(delta);
        self.dirty = true;
    }

    async fn on_focus_enter(&mut self, _previous: Option<&ModeId>, _ctx: &mut ModeContext) {
        self.next_refresh = Instant::now();
        self.dirty = true;
    }

    async fn on_focus_exit(&mut self, _ctx: &mut ModeContext) {}

    async fn next_frame(&mut self) -> Option<Frame> {
        if !self.dirty {
            tokio::time::sleep_until(self.next_refresh).await;
        }
        if Instant::now() >= self.next_refresh {
            let snapshot = self.telemetry.sample().await;
            self.snapshot = Some(snapshot);
            self.next_refresh = Instant::now() + REFRESH_INTERVAL;
        }
        self.dirty = false;
        Some(self.render())
    }

    async fn receive_message(&mut self, sender: &Address, payload: Payload, _ctx: &mut ModeContext) {
        debug!("diagnostics ignoring {payload:?} from {sender}");
    }

    fn set_orientation(&mut self, orientation: Orientation) {
        self.orientation = orientation;
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::Rotation;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTelemetry {
        samples: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Telemetry for CountingTelemetry {
        async fn sample(&mut self) -> TelemetrySnapshot {
            self.samples.fetch_add(1, Ordering::SeqCst);
            TelemetrySnapshot {
                load_average: Some(0.5),
                interface: "wlan0".to_string(),
                ..Default::default()
            }
        }
    }

    fn diagnostics() -> (Diagnostics, Arc<AtomicUsize>) {
        let samples = Arc::new(AtomicUsize::new(0));
        let telemetry = CountingTelemetry {
            samples: samples.clone(),
        };
        (
            Diagnostics::new(Box::new(telemetry), Dimensions::new(240, 240)),
            samples,
        )
    }

    #[tokio::test]
    async fn test_pages_cycle_both_ways() {
        let (mut diag, _) = diagnostics();
        let mut ctx = ModeContext::new(ids::DIAGNOSTICS);
        diag.on_input(InputEvent::press(ControlId::Up), &mut ctx).await;
        assert_eq!(diag.page(), Page::Network);
        diag.on_input(InputEvent::Encoder(Rotation::Clockwise), &mut ctx).await;
        diag.on_input(InputEvent::press(ControlId::Down), &mut ctx).await;
        assert_eq!(diag.page(), Page::Power);
        // releases don't turn pages
        diag.on_input(InputEvent::release(ControlId::Down), &mut ctx).await;
        assert_eq!(diag.page(), Page::Power);

        diag.on_input(InputEvent::press(ControlId::Cross), &mut ctx).await;
        assert_eq!(
            ctx.requests(),
            [crate::bus::Request::Focus(ids::VIEWFINDER)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshes_once_a_second() {
        let (mut diag, samples) = diagnostics();
        let mut ctx = ModeContext::new(ids::DIAGNOSTICS);
        diag.on_focus_enter(None, &mut ctx).await;

        let start = Instant::now();
        diag.next_frame().await.unwrap();
        assert_eq!(samples.load(Ordering::SeqCst), 1);
        diag.next_frame().await.unwrap();
        assert_eq!(samples.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() >= REFRESH_INTERVAL);

        // a page turn redraws without sampling again
        diag.on_input(InputEvent::press(ControlId::Down), &mut ctx).await;
        diag.next_frame().await.unwrap();
        assert_eq!(samples.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_missing_readings_show_unavailable() {
        let snapshot = TelemetrySnapshot {
            battery_volts: Some(3.912),
            ..Default::default()
        };
        let power = page_lines(Page::Power, &snapshot);
        assert_eq!(power[0], "Battery   3.91 V");
        assert_eq!(power[1], "Charge    N/A");

        let hardware = page_lines(Page::Hardware, &snapshot);
        assert!(hardware.iter().filter(|l| l.ends_with(UNAVAILABLE)).count() >= 5);
    }
}
