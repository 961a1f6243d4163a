//! Live camera preview with zoom, brightness and still capture.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use embedded_graphics::pixelcolor::Rgb888;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::{PrimitiveStyle, Rectangle};
use log::{debug, info, warn};
use tokio::time::Instant;

use crate::bus::{Address, ModeContext, ModeId, Payload};
use crate::camera::{
    CameraError, ControlValue, Controls, Metadata, ModeDescriptor, SharedCamera, StillFormat,
    scaler_crop,
};
use crate::frame::{Dimensions, Frame, Orientation};
use crate::input::{ControlId, InputEvent, Rotation};
use crate::mode::Mode;
use crate::modes::ids;
use crate::options::{OptionTree, OptionValue};
use crate::overlay::{self, Toast};
use crate::smoothing::SlidingWindowAverage;

const ZOOM_STEP: f64 = 0.2;
const ZOOM_MIN: f64 = 1.0;
const ZOOM_MAX: f64 = 8.0;
const BRIGHTNESS_STEP: f64 = 0.1;
const SMOOTHING_WINDOW: usize = 10;
const ERROR_BACKOFF: Duration = Duration::from_millis(500);
const HISTOGRAM_BINS: usize = 32;

/// Camera settings driven by the menu.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub auto_exposure: bool,
    pub exposure_comp: f64,
    pub awb: bool,
    pub format: StillFormat,
    pub resolution: Dimensions,
    pub show_info: bool,
    pub show_histogram: bool,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            auto_exposure: true,
            exposure_comp: 0.0,
            awb: true,
            format: StillFormat::Png,
            resolution: Dimensions::new(2028, 1520),
            show_info: false,
            show_histogram: false,
        }
    }
}

fn parse_resolution(value: &str) -> Option<Dimensions> {
    let (w, h) = value.split_once('x')?;
    Some(Dimensions::new(w.trim().parse().ok()?, h.trim().parse().ok()?))
}

impl CameraSettings {
    /// Applies one menu option. Returns `false` for options this mode
    /// doesn't know or values of the wrong type.
    pub fn apply(&mut self, option_id: &str, value: &OptionValue) -> bool {
        match (option_id, value) {
            ("auto_exposure", OptionValue::Bool(v)) => self.auto_exposure = *v,
            ("exposure_comp", OptionValue::Number(v)) => self.exposure_comp = *v,
            ("awb", OptionValue::Bool(v)) => self.awb = *v,
            ("show_info", OptionValue::Bool(v)) => self.show_info = *v,
            ("show_histogram", OptionValue::Bool(v)) => self.show_histogram = *v,
            ("format", OptionValue::Text(v)) => match v.as_str() {
                "png" => self.format = StillFormat::Png,
                "jpeg" | "jpg" => self.format = StillFormat::Jpeg,
                _ => return false,
            },
            ("resolution", OptionValue::Text(v)) => match parse_resolution(v) {
                Some(resolution) => self.resolution = resolution,
                None => return false,
            },
            _ => return false,
        }
        true
    }

    /// Reloads every known option from `owner`'s section of `tree`.
    pub fn load(&mut self, tree: &OptionTree, owner: &ModeId) {
        for id in [
            "auto_exposure",
            "exposure_comp",
            "awb",
            "format",
            "resolution",
            "show_info",
            "show_histogram",
        ] {
            if let Some(value) = tree.value(owner, id) {
                self.apply(id, &value);
            }
        }
    }
}

pub struct Viewfinder {
    id: ModeId,
    camera: SharedCamera,
    display: Dimensions,
    media_dir: PathBuf,
    orientation: Orientation,
    zoom: f64,
    brightness: f64,
    settings: CameraSettings,
    toast: Option<Toast>,
    focus: SlidingWindowAverage,
    frame_intervals: SlidingWindowAverage,
    last_capture: Option<Instant>,
    frame_interval: Duration,
    metadata: Metadata,
}

impl Viewfinder {
    pub fn new(camera: SharedCamera, display: Dimensions, media_dir: impl Into<PathBuf>) -> Self {
        Self {
            id: ids::VIEWFINDER,
            camera,
            display,
            media_dir: media_dir.into(),
            orientation: Orientation::default(),
            zoom: ZOOM_MIN,
            brightness: 0.0,
            settings: CameraSettings::default(),
            toast: None,
            focus: SlidingWindowAverage::new(SMOOTHING_WINDOW),
            frame_intervals: SlidingWindowAverage::new(SMOOTHING_WINDOW),
            last_capture: None,
            frame_interval: Duration::ZERO,
            metadata: Metadata::new(),
        }
    }

    /// Caps the preview rate by spacing captures at least `interval` apart.
    pub fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    pub fn settings(&self) -> &CameraSettings {
        &self.settings
    }

    pub fn zoom(&self) -> f64 {
        self.zoom
    }

    pub fn brightness(&self) -> f64 {
        self.brightness
    }

    fn controls(&self) -> Controls {
        let mut controls = Controls::new();
        controls.insert("AeEnable".to_string(), ControlValue::Bool(self.settings.auto_exposure));
        controls.insert(
            "ExposureValue".to_string(),
            ControlValue::Float(self.settings.exposure_comp),
        );
        controls.insert("AwbEnable".to_string(), ControlValue::Bool(self.settings.awb));
        controls.insert("Brightness".to_string(), ControlValue::Float(self.brightness));
        controls.insert("ScalerCrop".to_string(), ControlValue::Rect(scaler_crop(self.zoom)));
        controls
    }

    async fn apply_controls(&mut self) {
        let controls = self.controls();
        let result = self.camera.lock().await.set_controls(&controls).await;
        if let Err(e) = result {
            warn!("failed to set camera controls: {e}");
            self.toast = Some(Toast::warning("Camera error"));
        }
    }

    async fn change_zoom(&mut self, delta: f64) {
        self.zoom = (self.zoom + delta).clamp(ZOOM_MIN, ZOOM_MAX);
        self.apply_controls().await;
        self.toast = Some(Toast::info(format!("X {:.1}", self.zoom)));
    }

    async fn change_brightness(&mut self, delta: f64) {
        // round away float drift so the toast reads cleanly
        self.brightness = ((self.brightness + delta).clamp(-1.0, 1.0) * 10.0).round() / 10.0;
        self.apply_controls().await;
        self.toast = Some(Toast::info(format!("BRT {:.1}", self.brightness)));
    }

    async fn capture_still(&mut self) -> Result<PathBuf, CameraError> {
        let capture = {
            let mut camera = self.camera.lock().await;
            camera
                .switch_mode(&ModeDescriptor::still(self.settings.resolution))
                .await?;
            let capture = camera.capture_request().await;
            let restored = camera
                .switch_mode(&ModeDescriptor::preview(self.display))
                .await;
            let capture = capture?;
            restored?;
            camera.set_controls(&self.controls()).await?;
            capture
        };

        let format = self.settings.format;
        let name = crate::timestamped_name("IMG", Local::now(), format.extension());
        let path = self.media_dir.join(name);
        tokio::task::spawn_blocking(move || save_still(&capture.frame, format, &path))
            .await
            .map_err(|e| CameraError::Backend(e.to_string()))?
    }

    async fn on_shutter(&mut self) {
        match self.capture_still().await {
            Ok(path) => {
                info!("saved {}", path.display());
                self.toast = Some(Toast::info("Saved"));
            }
            Err(e) => {
                warn!("capture failed: {e}");
                self.toast = Some(Toast::warning("Capture failed"));
            }
        }
    }

    fn record(&mut self, metadata: Metadata) {
        let now = Instant::now();
        if let Some(last) = self.last_capture {
            self.frame_intervals.push(now.duration_since(last).as_secs_f64());
        }
        self.last_capture = Some(now);
        if let Some(fom) = metadata.get("FocusFoM") {
            self.focus.push(*fom);
        }
        self.metadata = metadata;
    }

    fn info_lines(&self) -> Vec<(String, Rgb888)> {
        let mut lines = Vec::new();
        let mut push = |text: String| lines.push((text, Rgb888::WHITE));
        if let Some(exposure) = self.metadata.get("ExposureTime") {
            push(format!("EXP {:.2}ms", exposure / 1000.0));
        }
        if let Some(gain) = self.metadata.get("AnalogueGain") {
            push(format!("GAIN {gain:.2}"));
        }
        if let Some(lux) = self.metadata.get("Lux") {
            push(format!("LUX {lux:.0}"));
        }
        if let Some(ct) = self.metadata.get("ColourTemperature") {
            push(format!("CT {ct:.0}K"));
        }
        if let Some(interval) = self.frame_intervals.average()
            && interval > 0.0
        {
            push(format!("FPS {:.1}", 1.0 / interval));
        }
        if let Some(focus) = self.focus.average() {
            push(format!("FOCUS {focus:.1}"));
        }
        push(format!("ZOOM {:.1}", self.zoom));
        lines
    }

    fn compose(&mut self, mut frame: Frame) -> Frame {
        if self.settings.show_info {
            overlay::draw_lines(&mut frame, Point::new(6, 6), &self.info_lines());
            if self.settings.show_histogram {
                draw_histogram(&mut frame);
            }
        }
        if let Some(toast) = &self.toast {
            if toast.is_active() {
                overlay::draw_toast(&mut frame, toast);
            } else {
                self.toast = None;
            }
        }
        super::orient(frame, self.orientation)
    }
}

fn save_still(frame: &Frame, format: StillFormat, path: &Path) -> Result<PathBuf, CameraError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let bytes = frame.encode(format.image_format())?;
    std::fs::write(path, bytes)?;
    Ok(path.to_path_buf())
}

/// Luma histogram along the bottom of the frame.
fn draw_histogram(frame: &mut Frame) {
    let mut bins = [0u32; HISTOGRAM_BINS];
    for pixel in frame.data().chunks_exact(3) {
        let luma = (pixel[0] as u32 * 299 + pixel[1] as u32 * 587 + pixel[2] as u32 * 114) / 1000;
        bins[luma as usize * HISTOGRAM_BINS / 256] += 1;
    }
    let peak = bins.iter().copied().max().unwrap_or(0).max(1);
    let height = 40u32;
    let bar_width = (frame.width() / HISTOGRAM_BINS as u32).max(1);
    let base = frame.height().saturating_sub(4) as i32;
    for (i, count) in bins.iter().enumerate() {
        let bar = count * height / peak;
        Rectangle::new(
            Point::new(i as i32 * bar_width as i32, base - bar as i32),
            Size::new(bar_width, bar),
        )
        .into_styled(PrimitiveStyle::with_fill(overlay::MID_GRAY))
        .draw(frame)
        .ok();
    }
}

#[async_trait]
impl Mode for Viewfinder {
    fn id(&self) -> &ModeId {
        &self.id
    }

    async fn on_input(&mut self, event: InputEvent, ctx: &mut ModeContext) {
        match event {
            InputEvent::Control { .. } => match event.pressed() {
                Some(ControlId::Left) => self.change_zoom(-ZOOM_STEP).await,
                Some(ControlId::Right) => self.change_zoom(ZOOM_STEP).await,
                Some(ControlId::Up) => self.change_brightness(BRIGHTNESS_STEP).await,
                Some(ControlId::Down) => self.change_brightness(-BRIGHTNESS_STEP).await,
                Some(ControlId::Shutter) => self.on_shutter().await,
                Some(ControlId::Circle) => self.settings.show_info = !self.settings.show_info,
                Some(ControlId::Triangle) => {
                    ctx.send(ids::MENU, Payload::Attach(self.id.clone()));
                    ctx.request_focus(ids::MENU);
                }
                _ => {}
            },
            InputEvent::LongPress {
                control: ControlId::Triangle,
            } => ctx.request_focus(ids::GALLERY),
            InputEvent::LongPress { .. } => {}
            InputEvent::Encoder(Rotation::Clockwise) => self.change_zoom(ZOOM_STEP).await,
            InputEvent::Encoder(Rotation::CounterClockwise) => self.change_zoom(-ZOOM_STEP).await,
        }
    }

    async fn on_focus_enter(&mut self, _previous: Option<&ModeId>, _ctx: &mut ModeContext) {
        let controls = self.controls();
        let result = {
            let mut camera = self.camera.lock().await;
            match camera.configure(&ModeDescriptor::preview(self.display)).await {
                Ok(()) => camera.set_controls(&controls).await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = result {
            warn!("failed to start preview: {e}");
            self.toast = Some(Toast::warning("Camera error"));
        }
        self.last_capture = None;
        self.frame_intervals.clear();
    }

    async fn on_focus_exit(&mut self, _ctx: &mut ModeContext) {
        self.toast = None;
    }

    async fn next_frame(&mut self) -> Option<Frame> {
        if let Some(last) = self.last_capture {
            tokio::time::sleep_until(last + self.frame_interval).await;
        }
        let result = {
            let mut camera = self.camera.lock().await;
            camera.capture_request().await
        };
        let frame = match result {
            Ok(capture) => {
                self.record(capture.metadata);
                super::fit(capture.frame, self.display)
            }
            Err(e) => {
                warn!("preview capture failed: {e}");
                tokio::time::sleep(ERROR_BACKOFF).await;
                overlay::notice(self.display, "Camera error", Some(&e.to_string()))
            }
        };
        Some(self.compose(frame))
    }

    async fn receive_message(&mut self, sender: &Address, payload: Payload, _ctx: &mut ModeContext) {
        match payload {
            Payload::Settings { tree, .. } => {
                self.settings.load(&tree, &self.id);
                self.apply_controls().await;
            }
            Payload::ApplyOption { option_id, value } => {
                if self.settings.apply(&option_id, &value) {
                    self.apply_controls().await;
                } else {
                    debug!("viewfinder ignoring option {option_id}");
                }
            }
            other => debug!("viewfinder ignoring {other:?} from {sender}"),
        }
    }

    fn set_orientation(&mut self, orientation: Orientation) {
        self.orientation = orientation;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{self, Capture, Camera};
    use std::sync::{Arc, Mutex};

    const DIMS: Dimensions = Dimensions::new(24, 24);

    #[derive(Default)]
    struct CameraLog {
        calls: Vec<String>,
        controls: Controls,
    }

    /// Records calls; optionally fails still captures.
    struct ScriptedCamera {
        log: Arc<Mutex<CameraLog>>,
        size: Dimensions,
        fail_still: bool,
    }

    #[async_trait]
    impl Camera for ScriptedCamera {
        async fn configure(&mut self, mode: &ModeDescriptor) -> Result<(), CameraError> {
            self.size = mode.size;
            self.log.lock().unwrap().calls.push(format!("configure {:?}", mode.purpose));
            Ok(())
        }

        async fn set_controls(&mut self, controls: &Controls) -> Result<(), CameraError> {
            let mut log = self.log.lock().unwrap();
            log.calls.push("controls".to_string());
            log.controls = controls.clone();
            Ok(())
        }

        async fn capture_request(&mut self) -> Result<Capture, CameraError> {
            self.log.lock().unwrap().calls.push(format!("capture {}x{}", self.size.width, self.size.height));
            if self.fail_still && self.size != DIMS {
                return Err(CameraError::Backend("sensor timeout".to_string()));
            }
            let mut metadata = Metadata::new();
            metadata.insert("FocusFoM".to_string(), 10.0);
            Ok(Capture {
                frame: Frame::new(self.size),
                metadata,
            })
        }

        async fn switch_mode(&mut self, mode: &ModeDescriptor) -> Result<(), CameraError> {
            self.size = mode.size;
            self.log.lock().unwrap().calls.push(format!("switch {:?}", mode.purpose));
            Ok(())
        }
    }

    fn viewfinder(fail_still: bool, media_dir: &Path) -> (Viewfinder, Arc<Mutex<CameraLog>>) {
        let log = Arc::new(Mutex::new(CameraLog::default()));
        let camera = camera::shared(ScriptedCamera {
            log: log.clone(),
            size: DIMS,
            fail_still,
        });
        (Viewfinder::new(camera, DIMS, media_dir), log)
    }

    #[tokio::test]
    async fn test_zoom_and_brightness_clamp() {
        let dir = tempfile::tempdir().unwrap();
        let (mut vf, log) = viewfinder(false, dir.path());
        let mut ctx = ModeContext::new(ids::VIEWFINDER);

        vf.on_input(InputEvent::press(ControlId::Left), &mut ctx).await;
        assert_eq!(vf.zoom(), 1.0);
        vf.on_input(InputEvent::press(ControlId::Right), &mut ctx).await;
        assert!((vf.zoom() - 1.2).abs() < 1e-9);
        assert_eq!(
            log.lock().unwrap().controls.get("ScalerCrop"),
            Some(&ControlValue::Rect(scaler_crop(1.2)))
        );

        for _ in 0..15 {
            vf.on_input(InputEvent::press(ControlId::Up), &mut ctx).await;
        }
        assert_eq!(vf.brightness(), 1.0);
        assert!(ctx.requests().is_empty());
    }

    #[tokio::test]
    async fn test_shutter_saves_and_restores_preview() {
        let dir = tempfile::tempdir().unwrap();
        let (mut vf, log) = viewfinder(false, dir.path());
        let mut ctx = ModeContext::new(ids::VIEWFINDER);
        vf.on_input(InputEvent::press(ControlId::Shutter), &mut ctx).await;

        let files: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(files.len(), 1);
        let calls = log.lock().unwrap().calls.clone();
        assert_eq!(
            calls[..3],
            ["switch Still", "capture 2028x1520", "switch Preview"]
        );
    }

    #[tokio::test]
    async fn test_failed_capture_still_restores_preview() {
        let dir = tempfile::tempdir().unwrap();
        let (mut vf, log) = viewfinder(true, dir.path());
        let mut ctx = ModeContext::new(ids::VIEWFINDER);
        vf.on_input(InputEvent::press(ControlId::Shutter), &mut ctx).await;

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert_eq!(log.lock().unwrap().calls.last().map(String::as_str), Some("switch Preview"));
        assert!(vf.toast.as_ref().is_some_and(|t| t.warning));
    }

    #[tokio::test]
    async fn test_triangle_opens_menu_as_owner() {
        let dir = tempfile::tempdir().unwrap();
        let (mut vf, _) = viewfinder(false, dir.path());
        let mut ctx = ModeContext::new(ids::VIEWFINDER);
        vf.on_input(InputEvent::press(ControlId::Triangle), &mut ctx).await;

        let requests = ctx.into_requests();
        assert_eq!(requests.len(), 2);
        assert!(matches!(
            &requests[0],
            crate::bus::Request::Send(m) if m.payload == Payload::Attach(ids::VIEWFINDER)
        ));
        assert_eq!(requests[1], crate::bus::Request::Focus(ids::MENU));
    }

    #[tokio::test]
    async fn test_settings_message_applies_tree() {
        let dir = tempfile::tempdir().unwrap();
        let (mut vf, log) = viewfinder(false, dir.path());
        let mut tree = OptionTree::default_tree();
        tree.set_value(&ids::VIEWFINDER, "awb", OptionValue::Bool(false)).unwrap();
        tree.set_value(&ids::VIEWFINDER, "format", OptionValue::Text("jpeg".into())).unwrap();

        let mut ctx = ModeContext::new(ids::VIEWFINDER);
        vf.receive_message(
            &Address::Mode(ids::MENU),
            Payload::Settings {
                menu_id: "0".to_string(),
                tree,
            },
            &mut ctx,
        )
        .await;
        assert!(!vf.settings().awb);
        assert_eq!(vf.settings().format, StillFormat::Jpeg);
        assert_eq!(
            log.lock().unwrap().controls.get("AwbEnable"),
            Some(&ControlValue::Bool(false))
        );
    }

    #[tokio::test]
    async fn test_frames_follow_the_camera() {
        let dir = tempfile::tempdir().unwrap();
        let (mut vf, _) = viewfinder(false, dir.path());
        let mut ctx = ModeContext::new(ids::VIEWFINDER);
        vf.on_focus_enter(None, &mut ctx).await;
        vf.on_input(InputEvent::press(ControlId::Circle), &mut ctx).await;

        for _ in 0..3 {
            let frame = vf.next_frame().await.unwrap();
            assert_eq!(frame.dimensions(), DIMS);
        }
        assert_eq!(vf.focus.average(), Some(10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_interval_paces_preview() {
        let dir = tempfile::tempdir().unwrap();
        let (vf, _) = viewfinder(false, dir.path());
        let mut vf = vf.with_frame_interval(Duration::from_millis(33));
        let mut ctx = ModeContext::new(ids::VIEWFINDER);
        vf.on_focus_enter(None, &mut ctx).await;

        let start = Instant::now();
        for _ in 0..4 {
            vf.next_frame().await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(99));
    }

    #[test]
    fn test_settings_reject_bad_values() {
        let mut settings = CameraSettings::default();
        assert!(!settings.apply("resolution", &OptionValue::Text("huge".into())));
        assert!(!settings.apply("awb", &OptionValue::Number(1.0)));
        assert!(settings.apply("resolution", &OptionValue::Text("1332x990".into())));
        assert_eq!(settings.resolution, Dimensions::new(1332, 990));
    }
}
