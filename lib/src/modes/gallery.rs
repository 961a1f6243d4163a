//! Browsing captured media. The same mode backs the stills-only gallery and
//! the media browser, which also lists and plays videos.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use embedded_graphics::pixelcolor::Rgb888;
use embedded_graphics::prelude::*;
use log::{debug, info, warn};

use crate::bus::{Address, ModeContext, ModeId, Payload};
use crate::frame::{Dimensions, Frame, Orientation};
use crate::input::{ControlId, InputEvent, Rotation};
use crate::media::cache::Step;
use crate::media::video::{Playback, VideoBackend};
use crate::media::{CachedMedia, MediaDecoder, MediaKind, MediaList, PredictiveMediaCache};
use crate::mode::Mode;
use crate::modes::ids;
use crate::overlay::{self, Toast};

pub struct Gallery {
    id: ModeId,
    media_dir: PathBuf,
    include_video: bool,
    list: MediaList,
    cache: PredictiveMediaCache,
    videos: Arc<dyn VideoBackend>,
    playback: Option<Playback>,
    video_frame: Option<Frame>,
    display: Dimensions,
    orientation: Orientation,
    show_info: bool,
    toast: Option<Toast>,
    dirty: bool,
    loading_shown: bool,
}

impl Gallery {
    pub fn new(
        id: ModeId,
        media_dir: impl Into<PathBuf>,
        include_video: bool,
        decoder: Arc<dyn MediaDecoder>,
        videos: Arc<dyn VideoBackend>,
        display: Dimensions,
    ) -> Self {
        Self {
            id,
            media_dir: media_dir.into(),
            include_video,
            list: MediaList::default(),
            cache: PredictiveMediaCache::new(decoder),
            videos,
            playback: None,
            video_frame: None,
            display,
            orientation: Orientation::default(),
            show_info: false,
            toast: None,
            dirty: true,
            loading_shown: false,
        }
    }

    /// Stills only, registered as the gallery.
    pub fn stills(
        media_dir: impl Into<PathBuf>,
        decoder: Arc<dyn MediaDecoder>,
        videos: Arc<dyn VideoBackend>,
        display: Dimensions,
    ) -> Self {
        Self::new(ids::GALLERY, media_dir, false, decoder, videos, display)
    }

    /// Stills and videos, registered as the media browser.
    pub fn browser(
        media_dir: impl Into<PathBuf>,
        decoder: Arc<dyn MediaDecoder>,
        videos: Arc<dyn VideoBackend>,
        display: Dimensions,
    ) -> Self {
        Self::new(ids::MEDIA_BROWSER, media_dir, true, decoder, videos, display)
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cache.cursor()
    }

    pub fn playback(&self) -> Option<&Playback> {
        self.playback.as_ref()
    }

    fn close_video(&mut self) {
        self.playback = None;
        self.video_frame = None;
    }

    /// Rescans the media directory, keeping the cursor on the same file if
    /// it is still there.
    async fn rescan(&mut self) {
        let current = self.cache.current_entry().map(|e| e.path.clone());
        self.list = match MediaList::scan(&self.media_dir, self.include_video).await {
            Ok(list) => list,
            Err(e) => {
                warn!("failed to scan {}: {e}", self.media_dir.display());
                MediaList::default()
            }
        };
        let cursor = current
            .and_then(|path| self.list.entries().iter().position(|e| e.path == path))
            .unwrap_or(0);
        debug!("{} lists {} files", self.id, self.list.len());
        self.reload(cursor).await;
    }

    async fn reload(&mut self, cursor: usize) {
        self.close_video();
        if let Err(e) = self.cache.refresh(self.list.snapshot(), cursor).await {
            warn!("failed to load media: {e}");
        }
        self.loading_shown = false;
        self.dirty = true;
    }

    async fn step(&mut self, step: Step) {
        if self.cache.advance(step).await {
            self.close_video();
            self.loading_shown = false;
            self.dirty = true;
        }
    }

    /// Deletes the file under the cursor. The list only loses the entry
    /// once the file is gone from disk.
    async fn delete_current(&mut self) {
        let cursor = self.cache.cursor();
        let Some(entry) = self.list.get(cursor).cloned() else {
            return;
        };
        if let Err(e) = tokio::fs::remove_file(&entry.path).await {
            warn!("failed to delete {}: {e}", entry.path.display());
            self.toast = Some(Toast::warning("Delete failed"));
            self.dirty = true;
            return;
        }
        info!("deleted {}", entry.path.display());
        self.list.remove(cursor);
        self.reload(cursor).await;
    }

    fn draw_toast(&self, frame: &mut Frame) {
        if let Some(toast) = self.toast.as_ref().filter(|t| t.is_active()) {
            overlay::draw_toast(frame, toast);
        }
    }

    async fn toggle_playback(&mut self) {
        if let Some(playback) = self.playback.as_mut() {
            playback.toggle();
            self.dirty = true;
            return;
        }
        let Some(entry) = self.cache.current_entry() else {
            return;
        };
        if entry.kind != MediaKind::Video {
            return;
        }
        let path = entry.path.clone();
        match self.videos.open(&path, self.display).await {
            Ok(stream) => {
                let mut playback = Playback::new(stream);
                playback.toggle();
                self.playback = Some(playback);
            }
            Err(e) => warn!("failed to open {}: {e}", path.display()),
        }
        self.dirty = true;
    }

    fn info_line(&self) -> String {
        let name = self
            .cache
            .current_entry()
            .map(|e| e.name())
            .unwrap_or_default();
        let mut line = format!("{} {}/{}", name, self.cache.cursor() + 1, self.cache.len());
        if let Some(playback) = &self.playback {
            line.push_str(&format!(
                " {}/{}",
                playback.position(),
                playback.total_frames()
            ));
        }
        line
    }

    fn compose(&self, frame: Frame) -> Frame {
        let mut frame = super::fit(frame, self.display);
        if self.show_info {
            let y = self.display.height as i32 - 2 * overlay::LINE_HEIGHT;
            overlay::draw_lines(
                &mut frame,
                Point::new(4, y),
                &[(self.info_line(), Rgb888::WHITE)],
            );
        }
        if let Some(playback) = &self.playback {
            overlay::draw_progress(&mut frame, playback.progress());
        }
        self.draw_toast(&mut frame);
        super::orient(frame, self.orientation)
    }

    fn notice(&self, title: &str, detail: Option<&str>) -> Frame {
        let mut frame = overlay::notice(self.display, title, detail);
        self.draw_toast(&mut frame);
        super::orient(frame, self.orientation)
    }

    async fn next_video_frame(&mut self) -> Option<Frame> {
        let playback = self.playback.as_mut()?;
        match playback.next_frame().await {
            Ok(Some(frame)) => self.video_frame = Some(frame),
            Ok(None) => {
                if !self.dirty {
                    std::future::pending::<()>().await;
                }
            }
            Err(e) => {
                warn!("video playback failed: {e}");
                self.close_video();
                self.dirty = false;
                return Some(self.notice("Playback failed", Some(&e.to_string())));
            }
        }
        self.dirty = false;
        let frame = self
            .video_frame
            .clone()
            .unwrap_or_else(|| Frame::new(self.display));
        Some(self.compose(frame))
    }
}

#[async_trait]
impl Mode for Gallery {
    fn id(&self) -> &ModeId {
        &self.id
    }

    async fn on_input(&mut self, event: InputEvent, ctx: &mut ModeContext) {
        match event {
            InputEvent::Encoder(Rotation::Clockwise) => self.step(Step::Forward).await,
            InputEvent::Encoder(Rotation::CounterClockwise) => self.step(Step::Back).await,
            InputEvent::LongPress {
                control: ControlId::Triangle,
            } => ctx.request_focus(ids::VIEWFINDER),
            InputEvent::LongPress { .. } => {}
            InputEvent::Control { .. } => match event.pressed() {
                Some(ControlId::Up | ControlId::Left) => self.step(Step::Back).await,
                Some(ControlId::Down | ControlId::Right) => self.step(Step::Forward).await,
                Some(ControlId::Center) => self.toggle_playback().await,
                Some(ControlId::Circle) => {
                    self.show_info = !self.show_info;
                    self.dirty = true;
                }
                Some(ControlId::Triangle) => {
                    ctx.send(ids::MENU, Payload::Attach(self.id.clone()));
                    ctx.request_focus(ids::MENU);
                }
                Some(ControlId::Cross) => ctx.request_focus(ids::VIEWFINDER),
                _ => {}
            },
        }
    }

    async fn on_focus_enter(&mut self, _previous: Option<&ModeId>, _ctx: &mut ModeContext) {
        self.rescan().await;
    }

    async fn on_focus_exit(&mut self, _ctx: &mut ModeContext) {
        self.close_video();
        self.cache.invalidate().await;
    }

    async fn next_frame(&mut self) -> Option<Frame> {
        if self.playback.is_some() {
            return self.next_video_frame().await;
        }
        if !self.dirty {
            // redraw once a toast runs out, otherwise wait for a change
            match self.toast.as_ref().map(Toast::expires_at) {
                Some(expiry) => {
                    tokio::time::sleep_until(expiry).await;
                    self.toast = None;
                }
                None => std::future::pending::<()>().await,
            }
        }
        if self.cache.is_empty() {
            self.dirty = false;
            return Some(self.notice("No media", Some(&self.media_dir.display().to_string())));
        }
        if !self.cache.is_current_ready() && !self.loading_shown {
            self.loading_shown = true;
            return Some(self.notice("Loading...", None));
        }

        let media = self.cache.current_media().await;
        self.dirty = false;
        self.loading_shown = false;
        let name = self
            .cache
            .current_entry()
            .map(|e| e.name())
            .unwrap_or_default();
        let frame = match media {
            Ok(Some(CachedMedia::Image(frame))) => self.compose(frame.as_ref().clone()),
            Ok(Some(CachedMedia::Video(_))) => self.notice(&name, Some("Center to play")),
            Ok(None) => self.notice("No media", None),
            Err(e) => {
                warn!("failed to show {name}: {e}");
                self.notice("Can't open", Some(&name))
            }
        };
        Some(frame)
    }

    async fn receive_message(&mut self, sender: &Address, payload: Payload, _ctx: &mut ModeContext) {
        match payload {
            Payload::Command(command) => match command.as_str() {
                "delete" => self.delete_current().await,
                "refresh" => self.rescan().await,
                other => warn!("{} got unknown command {other} from {sender}", self.id),
            },
            other => debug!("{} ignoring {other:?} from {sender}", self.id),
        }
    }

    fn set_orientation(&mut self, orientation: Orientation) {
        self.orientation = orientation;
        self.dirty = true;
    }
}
