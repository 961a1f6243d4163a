use chrono::{DateTime, Local};

/// Initialize logging with the given default level. Respects `RUST_LOG`
/// overrides.
pub fn init_logging(default_level: log::LevelFilter) {
    env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .init();
}

pub mod bus;
pub mod camera;
pub mod frame;
pub mod input;
pub mod media;
pub mod mode;
pub mod modes;
pub mod options;
pub mod overlay;
pub mod peripheral;
pub mod pipeline;
pub mod smoothing;
pub mod supervisor;
pub mod telemetry;

pub use bus::{Address, MessageBus, ModeId, Payload};
pub use frame::{Dimensions, Frame, Orientation};
pub use input::{ControlId, InputEvent, InputEventSource};
pub use mode::Mode;
pub use pipeline::DisplayPipeline;
pub use supervisor::{Supervisor, SupervisorConfig};

/// File name for a capture taken at `time`, e.g.
/// `IMG_20240501_093015_250.png`. Millisecond precision keeps bursts apart.
pub fn timestamped_name(prefix: &str, time: DateTime<Local>, extension: &str) -> String {
    format!("{prefix}_{}.{extension}", time.format("%Y%m%d_%H%M%S_%3f"))
}
