use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use pocketcam::Dimensions;
use pocketcam::input::{ControlId, InputConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("key_map entry {code} names an unknown control: {name}")]
    UnknownControl { code: u16, name: String },
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub media_dir: PathBuf,
    pub screenshot_dir: PathBuf,
    pub video_dir: PathBuf,
    pub menu_path: PathBuf,
    pub framebuffer_path: PathBuf,
    pub backlight_path: PathBuf,
    pub input_devices: Vec<PathBuf>,
    /// Control name to the evdev key code that drives it.
    pub key_map: BTreeMap<String, u16>,
    /// `EV_REL` axis read as the rotary encoder.
    pub encoder_axis: u16,
    pub i2c_bus: PathBuf,
    pub fuel_gauge_address: u16,
    pub rtc_address: u16,
    pub network_interface: String,
    pub long_press_ms: u64,
    pub debounce_ms: u64,
    pub frame_interval_ms: u64,
    pub input_queue_depth: usize,
    pub display_width: u32,
    pub display_height: u32,
    pub camera_still_command: String,
    pub ffmpeg_command: String,
    pub ffprobe_command: String,
    pub replay_script: Option<PathBuf>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        // gpio-keys codes of the button HAT
        let key_map = [
            ("up", 103),
            ("down", 108),
            ("left", 105),
            ("right", 106),
            ("center", 28),
            ("circle", 46),
            ("triangle", 20),
            ("square", 31),
            ("cross", 45),
            ("shutter", 212),
        ]
        .into_iter()
        .map(|(name, code)| (name.to_string(), code))
        .collect();

        Self {
            media_dir: "/home/pi/Pictures".into(),
            screenshot_dir: "/home/pi/Pictures/screenshots".into(),
            video_dir: "/home/pi/Videos".into(),
            menu_path: "/home/pi/.config/pocketcam/menu.json".into(),
            framebuffer_path: "/dev/fb1".into(),
            backlight_path: "/sys/class/backlight/fb_st7789v/bl_power".into(),
            input_devices: vec!["/dev/input/event0".into(), "/dev/input/event1".into()],
            key_map,
            encoder_axis: 0x06,
            i2c_bus: "/dev/i2c-1".into(),
            fuel_gauge_address: 0x36,
            rtc_address: 0x68,
            network_interface: "wlan0".into(),
            long_press_ms: 1000,
            debounce_ms: 90,
            frame_interval_ms: 33,
            input_queue_depth: 32,
            display_width: 240,
            display_height: 240,
            camera_still_command: "rpicam-still".into(),
            ffmpeg_command: "ffmpeg".into(),
            ffprobe_command: "ffprobe".into(),
            replay_script: None,
            log_level: "info".into(),
        }
    }
}

impl Config {
    pub fn display(&self) -> Dimensions {
        Dimensions::new(self.display_width, self.display_height)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn input_config(&self) -> InputConfig {
        InputConfig {
            long_press: Duration::from_millis(self.long_press_ms),
            debounce: Duration::from_millis(self.debounce_ms),
            ..InputConfig::default()
        }
    }

    /// Resolves `key_map` into controls, rejecting names that aren't one.
    pub fn controls(&self) -> Result<BTreeMap<u16, ControlId>, ConfigError> {
        self.key_map
            .iter()
            .map(|(name, code)| {
                name.parse()
                    .map(|control| (*code, control))
                    .map_err(|_| ConfigError::UnknownControl {
                        code: *code,
                        name: name.clone(),
                    })
            })
            .collect()
    }

    pub fn log_level(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or_else(|_| {
            warn!("unknown log_level {:?}, using info", self.log_level);
            log::LevelFilter::Info
        })
    }
}

pub fn parse_config(contents: &str, path: &Path) -> Result<Config, ConfigError> {
    toml::from_str(contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Loads the config file, falling back to defaults when it doesn't exist.
pub async fn load_config(path: &Path) -> Result<Config, ConfigError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => parse_config(&contents, path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("no config file at {}, using defaults", path.display());
            Ok(Config::default())
        }
        Err(source) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = parse_config(
            "long_press_ms = 600\nreplay_script = \"/tmp/keys.txt\"\n",
            Path::new("config.toml"),
        )
        .unwrap();
        assert_eq!(config.long_press_ms, 600);
        assert_eq!(config.replay_script, Some(PathBuf::from("/tmp/keys.txt")));
        assert_eq!(config.debounce_ms, 90);
        assert_eq!(config.display(), Dimensions::new(240, 240));
        assert_eq!(config.input_config().long_press, Duration::from_millis(600));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let err = parse_config("long_press_ms = \"soon\"", Path::new("config.toml"));
        assert!(matches!(err, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_key_map_resolves_controls() {
        let config = parse_config("[key_map]\nShutter = 28\n", Path::new("c.toml")).unwrap();
        let controls = config.controls().unwrap();
        assert_eq!(controls.len(), 1);
        assert_eq!(controls[&28], ControlId::Shutter);

        let bad = parse_config("[key_map]\nzoom = 28\n", Path::new("c.toml")).unwrap();
        assert!(matches!(
            bad.controls(),
            Err(ConfigError::UnknownControl { code: 28, .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.framebuffer_path, PathBuf::from("/dev/fb1"));
        assert_eq!(config.log_level(), log::LevelFilter::Info);
    }
}
