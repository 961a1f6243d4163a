//! Pixel buffers passed from modes to the display.
//!
//! A [Frame] is a packed RGB888 buffer. It implements the embedded-graphics
//! [DrawTarget] trait so overlays and menus can be drawn straight into it.

use std::convert::Infallible;
use std::fmt;

use embedded_graphics::Pixel;
use embedded_graphics::pixelcolor::Rgb888;
use embedded_graphics::prelude::*;
use image::{DynamicImage, ImageFormat, RgbImage, imageops::FilterType};
use serde::{Deserialize, Serialize};

/// Width and height of a display or frame, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Physical rotation of the device, in clockwise quarter turns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Orientation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Orientation {
    /// The orientation after rotating the device a further 90 degrees.
    pub fn next(self) -> Self {
        match self {
            Orientation::Deg0 => Orientation::Deg90,
            Orientation::Deg90 => Orientation::Deg180,
            Orientation::Deg180 => Orientation::Deg270,
            Orientation::Deg270 => Orientation::Deg0,
        }
    }

    pub fn quarter_turns(self) -> u8 {
        match self {
            Orientation::Deg0 => 0,
            Orientation::Deg90 => 1,
            Orientation::Deg180 => 2,
            Orientation::Deg270 => 3,
        }
    }

    pub fn degrees(self) -> u16 {
        self.quarter_turns() as u16 * 90
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}

impl Frame {
    /// A black frame of the given size.
    pub fn new(dimensions: Dimensions) -> Self {
        Self::filled(dimensions, Rgb888::BLACK)
    }

    pub fn filled(dimensions: Dimensions, color: Rgb888) -> Self {
        let len = dimensions.width as usize * dimensions.height as usize;
        let mut pixels = Vec::with_capacity(len * 3);
        for _ in 0..len {
            pixels.extend([color.r(), color.g(), color.b()]);
        }
        Self {
            width: dimensions.width,
            height: dimensions.height,
            pixels,
        }
    }

    /// Wraps an existing RGB888 buffer. Returns `None` if the buffer length
    /// doesn't match the dimensions.
    pub fn from_rgb(dimensions: Dimensions, pixels: Vec<u8>) -> Option<Self> {
        let expected = dimensions.width as usize * dimensions.height as usize * 3;
        if pixels.len() != expected {
            return None;
        }
        Some(Self {
            width: dimensions.width,
            height: dimensions.height,
            pixels,
        })
    }

    /// Scales a decoded image to fit inside `dimensions` while keeping its
    /// aspect ratio, centering it on a black background.
    pub fn fit_image(image: &DynamicImage, dimensions: Dimensions) -> Self {
        let mut frame = Self::new(dimensions);
        if image.width() == 0 || image.height() == 0 {
            return frame;
        }
        let scaled = if image.width() == dimensions.width && image.height() == dimensions.height {
            image.to_rgb8()
        } else {
            image
                .resize(dimensions.width, dimensions.height, FilterType::Triangle)
                .to_rgb8()
        };
        let x_offset = (dimensions.width - scaled.width()) / 2;
        let y_offset = (dimensions.height - scaled.height()) / 2;
        for (x, y, pixel) in scaled.enumerate_pixels() {
            frame.set_pixel(x + x_offset, y + y_offset, Rgb888::new(pixel[0], pixel[1], pixel[2]));
        }
        frame
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw RGB888 bytes, row-major.
    pub fn data(&self) -> &[u8] {
        &self.pixels
    }

    pub fn into_data(self) -> Vec<u8> {
        self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<Rgb888> {
        let offset = self.offset(x, y)?;
        let p = &self.pixels[offset..offset + 3];
        Some(Rgb888::new(p[0], p[1], p[2]))
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, color: Rgb888) {
        if let Some(offset) = self.offset(x, y) {
            self.pixels[offset..offset + 3].copy_from_slice(&[color.r(), color.g(), color.b()]);
        }
    }

    fn offset(&self, x: u32, y: u32) -> Option<usize> {
        if x >= self.width || y >= self.height {
            return None;
        }
        Some((y as usize * self.width as usize + x as usize) * 3)
    }

    /// Returns a copy rotated clockwise to match the device orientation.
    pub fn rotated(&self, orientation: Orientation) -> Frame {
        if orientation == Orientation::Deg0 {
            return self.clone();
        }
        let (w, h) = (self.width, self.height);
        let out_dims = match orientation {
            Orientation::Deg90 | Orientation::Deg270 => Dimensions::new(h, w),
            _ => Dimensions::new(w, h),
        };
        let mut out = Frame::new(out_dims);
        for y in 0..h {
            for x in 0..w {
                let Some(color) = self.pixel(x, y) else {
                    continue;
                };
                let (nx, ny) = match orientation {
                    Orientation::Deg0 => (x, y),
                    Orientation::Deg90 => (h - 1 - y, x),
                    Orientation::Deg180 => (w - 1 - x, h - 1 - y),
                    Orientation::Deg270 => (y, w - 1 - x),
                };
                out.set_pixel(nx, ny, color);
            }
        }
        out
    }

    /// Packs the frame as little-endian RGB565, the format most SPI panels
    /// behind a Linux framebuffer expect.
    pub fn to_rgb565_le(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(self.pixels.len() / 3 * 2);
        for chunk in self.pixels.chunks_exact(3) {
            let (r, g, b) = (chunk[0], chunk[1], chunk[2]);
            let mut rgb565: u16 = (r as u16 & 0b11111000) << 8;
            rgb565 |= (g as u16 & 0b11111100) << 3;
            rgb565 |= (b as u16) >> 3;
            raw.extend(rgb565.to_le_bytes());
        }
        raw
    }

    pub fn to_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.pixels.clone())
    }

    /// Encodes the frame in the given still format.
    pub fn encode(&self, format: ImageFormat) -> Result<Vec<u8>, image::ImageError> {
        let image = RgbImage::from_raw(self.width, self.height, self.pixels.clone()).ok_or_else(
            || {
                image::ImageError::Parameter(image::error::ParameterError::from_kind(
                    image::error::ParameterErrorKind::DimensionMismatch,
                ))
            },
        )?;
        let mut out = std::io::Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image).write_to(&mut out, format)?;
        Ok(out.into_inner())
    }
}

impl OriginDimensions for Frame {
    fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }
}

impl DrawTarget for Frame {
    type Color = Rgb888;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        for Pixel(point, color) in pixels {
            if point.x >= 0 && point.y >= 0 {
                self.set_pixel(point.x as u32, point.y as u32, color);
            }
        }
        Ok(())
    }
}
