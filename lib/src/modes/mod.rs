//! The appliance's modes.

pub mod diagnostics;
pub mod gallery;
pub mod menu;
pub mod viewfinder;

pub use diagnostics::Diagnostics;
pub use gallery::Gallery;
pub use menu::Menu;
pub use viewfinder::Viewfinder;

use image::DynamicImage;

use crate::frame::{Dimensions, Frame, Orientation};

pub mod ids {
    use crate::bus::ModeId;

    pub const VIEWFINDER: ModeId = ModeId::from_static("Viewfinder");
    pub const MENU: ModeId = ModeId::from_static("Menu");
    pub const GALLERY: ModeId = ModeId::from_static("Gallery");
    pub const MEDIA_BROWSER: ModeId = ModeId::from_static("MediaBrowser");
    pub const DIAGNOSTICS: ModeId = ModeId::from_static("Diagnostics");
}

/// Rotates a finished frame for the device orientation.
pub(crate) fn orient(frame: Frame, orientation: Orientation) -> Frame {
    if orientation == Orientation::Deg0 {
        frame
    } else {
        frame.rotated(orientation)
    }
}

/// Scales `frame` to the panel if a source delivered another size.
pub(crate) fn fit(frame: Frame, dimensions: Dimensions) -> Frame {
    if frame.dimensions() == dimensions {
        return frame;
    }
    match frame.to_image() {
        Some(image) => Frame::fit_image(&DynamicImage::ImageRgb8(image), dimensions),
        None => Frame::new(dimensions),
    }
}
