//! Text overlays and full-screen notices drawn with embedded-graphics.

use std::time::Duration;

use embedded_graphics::mono_font::MonoTextStyle;
use embedded_graphics::mono_font::ascii::{FONT_6X10, FONT_10X20};
use embedded_graphics::pixelcolor::Rgb888;
use embedded_graphics::prelude::*;
use embedded_graphics::primitives::{PrimitiveStyle, Rectangle};
use embedded_graphics::text::{Alignment, Baseline, Text, TextStyleBuilder};
use tokio::time::Instant;

use crate::frame::{Dimensions, Frame};

pub const ACCENT: Rgb888 = Rgb888::new(0x00, 0xC8, 0x53);
pub const AMBER: Rgb888 = Rgb888::new(0xFF, 0x8F, 0x00);
pub const DARK_RED: Rgb888 = Rgb888::new(0xB7, 0x1C, 0x1C);
pub const MID_GRAY: Rgb888 = Rgb888::new(0xAA, 0xAA, 0xAA);
pub const DIM_GRAY: Rgb888 = Rgb888::new(0x77, 0x77, 0x77);
pub const PANEL: Rgb888 = Rgb888::new(0x20, 0x20, 0x20);

pub const LINE_HEIGHT: i32 = 12;

/// A short message shown over the current picture for a while.
#[derive(Debug, Clone)]
pub struct Toast {
    pub text: String,
    pub warning: bool,
    until: Instant,
}

impl Toast {
    pub const DURATION: Duration = Duration::from_millis(1500);

    pub fn info(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            warning: false,
            until: Instant::now() + Self::DURATION,
        }
    }

    pub fn warning(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            warning: true,
            until: Instant::now() + Self::DURATION * 2,
        }
    }

    pub fn is_active(&self) -> bool {
        Instant::now() < self.until
    }

    pub fn expires_at(&self) -> Instant {
        self.until
    }
}

fn centered(frame: &mut Frame, text: &str, y: i32, style: MonoTextStyle<'_, Rgb888>) {
    let cx = frame.width() as i32 / 2;
    Text::with_alignment(text, Point::new(cx, y), style, Alignment::Center)
        .draw(frame)
        .ok();
}

/// Draws `toast` as a pill near the bottom edge.
pub fn draw_toast(frame: &mut Frame, toast: &Toast) {
    let width = frame.width();
    let pill_w = (toast.text.len() as u32 * 10 + 16).min(width);
    let pill_x = (width - pill_w) / 2;
    let y = frame.height().saturating_sub(36);
    let bg = if toast.warning { DARK_RED } else { PANEL };
    Rectangle::new(Point::new(pill_x as i32, y as i32), Size::new(pill_w, 26))
        .into_styled(PrimitiveStyle::with_fill(bg))
        .draw(frame)
        .ok();
    centered(
        frame,
        &toast.text,
        y as i32 + 18,
        MonoTextStyle::new(&FONT_10X20, Rgb888::WHITE),
    );
}

/// A full screen notice, used for "No media", loading and error states.
pub fn notice(dimensions: Dimensions, title: &str, detail: Option<&str>) -> Frame {
    let mut frame = Frame::new(dimensions);
    let mid = dimensions.height as i32 / 2;
    centered(
        &mut frame,
        title,
        mid,
        MonoTextStyle::new(&FONT_10X20, Rgb888::WHITE),
    );
    if let Some(detail) = detail {
        centered(
            &mut frame,
            detail,
            mid + 20,
            MonoTextStyle::new(&FONT_6X10, MID_GRAY),
        );
    }
    frame
}

/// Writes lines of text top-down from `origin` on a translucent-looking
/// panel sized to fit them.
pub fn draw_lines(frame: &mut Frame, origin: Point, lines: &[(String, Rgb888)]) {
    if lines.is_empty() {
        return;
    }
    let longest = lines.iter().map(|(t, _)| t.len()).max().unwrap_or(0) as u32;
    Rectangle::new(
        origin - Point::new(2, 2),
        Size::new(longest * 6 + 4, lines.len() as u32 * LINE_HEIGHT as u32 + 4),
    )
    .into_styled(PrimitiveStyle::with_fill(PANEL))
    .draw(frame)
    .ok();

    let text_style = TextStyleBuilder::new().baseline(Baseline::Top).build();
    for (i, (text, color)) in lines.iter().enumerate() {
        let position = origin + Point::new(0, i as i32 * LINE_HEIGHT);
        Text::with_text_style(text, position, MonoTextStyle::new(&FONT_6X10, *color), text_style)
            .draw(frame)
            .ok();
    }
}

/// A title bar across the top of the frame.
pub fn draw_header(frame: &mut Frame, title: &str) {
    Rectangle::new(Point::zero(), Size::new(frame.width(), 24))
        .into_styled(PrimitiveStyle::with_fill(PANEL))
        .draw(frame)
        .ok();
    centered(frame, title, 17, MonoTextStyle::new(&FONT_10X20, Rgb888::WHITE));
    Rectangle::new(Point::new(0, 24), Size::new(frame.width(), 1))
        .into_styled(PrimitiveStyle::with_fill(ACCENT))
        .draw(frame)
        .ok();
}

/// A thin bar along the bottom edge filled to `fraction`.
pub fn draw_progress(frame: &mut Frame, fraction: f64) {
    let width = frame.width();
    let y = frame.height().saturating_sub(4) as i32;
    Rectangle::new(Point::new(0, y), Size::new(width, 4))
        .into_styled(PrimitiveStyle::with_fill(PANEL))
        .draw(frame)
        .ok();
    let filled = (width as f64 * fraction.clamp(0.0, 1.0)) as u32;
    Rectangle::new(Point::new(0, y), Size::new(filled, 4))
        .into_styled(PrimitiveStyle::with_fill(ACCENT))
        .draw(frame)
        .ok();
}
