pub mod camera;
pub mod config;
pub mod evdev;
pub mod framebuffer;
pub mod i2c;
pub mod power;
pub mod replay;
pub mod video;
