use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use pocketcam::camera::{self, SharedCamera, TestPattern};
use pocketcam::media::video::VideoBackend;
use pocketcam::media::{ImageDecoder, MediaDecoder};
use pocketcam::modes::{Diagnostics, Gallery, Menu, Viewfinder, ids};
use pocketcam::options::OptionTree;
use pocketcam::telemetry::SystemTelemetry;
use pocketcam::{DisplayPipeline, InputEventSource, Mode, Supervisor, SupervisorConfig};
use pocketcam_daemon::camera::RpicamCamera;
use pocketcam_daemon::config::{Config, load_config};
use pocketcam_daemon::evdev::{EvdevReader, KeyMap, KeyState};
use pocketcam_daemon::framebuffer::Framebuffer;
use pocketcam_daemon::i2c::I2cDevice;
use pocketcam_daemon::power::SystemPower;
use pocketcam_daemon::replay::InputReplayDevice;
use pocketcam_daemon::video::FfmpegBackend;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Parser)]
#[command(name = "pocketcam-daemon", about = "Control plane for the pocket camera")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, default_value = "/etc/pocketcam/config.toml")]
    config: PathBuf,

    /// Draw colour bars instead of opening the sensor
    #[arg(long)]
    test_pattern: bool,
}

fn build_telemetry(config: &Config) -> SystemTelemetry {
    let mut telemetry = SystemTelemetry::new(config.network_interface.clone());
    match I2cDevice::open(&config.i2c_bus, config.fuel_gauge_address) {
        Ok(bus) => telemetry = telemetry.with_fuel_gauge(Box::new(bus)),
        Err(e) => warn!("no fuel gauge at {:#x}: {e}", config.fuel_gauge_address),
    }
    match I2cDevice::open(&config.i2c_bus, config.rtc_address) {
        Ok(bus) => telemetry = telemetry.with_rtc(Box::new(bus)),
        Err(e) => warn!("no RTC at {:#x}: {e}", config.rtc_address),
    }
    telemetry
}

fn build_modes(config: &Config, camera: SharedCamera) -> Vec<Box<dyn Mode>> {
    let display = config.display();
    let tree = OptionTree::load(&config.menu_path).unwrap_or_else(|e| {
        warn!("failed to load menu from {}: {e}", config.menu_path.display());
        OptionTree::default_tree()
    });
    let decoder: Arc<dyn MediaDecoder> = Arc::new(ImageDecoder::new(display));
    let videos: Arc<dyn VideoBackend> = Arc::new(FfmpegBackend::new(
        config.ffmpeg_command.clone(),
        config.ffprobe_command.clone(),
    ));

    vec![
        Box::new(
            Viewfinder::new(camera, display, config.media_dir.clone())
                .with_frame_interval(config.frame_interval()),
        ),
        Box::new(Menu::new(tree, display).with_store(config.menu_path.clone())),
        Box::new(Gallery::stills(
            config.media_dir.clone(),
            decoder.clone(),
            videos.clone(),
            display,
        )),
        Box::new(Gallery::browser(config.video_dir.clone(), decoder, videos, display)),
        Box::new(Diagnostics::new(Box::new(build_telemetry(config)), display)),
    ]
}

/// Starts the readers that feed `source`: the replay script if one is
/// configured, otherwise every evdev device.
async fn spawn_input(
    task_tracker: &TaskTracker,
    config: &Config,
    source: &InputEventSource,
    state: KeyState,
    shutdown_token: &CancellationToken,
) -> Result<()> {
    if let Some(script) = &config.replay_script {
        let device = InputReplayDevice::open(script)
            .await
            .context("failed to load replay script")?;
        task_tracker.spawn(device.run(source.clone(), shutdown_token.clone()));
        return Ok(());
    }

    let keys = KeyMap {
        controls: config.controls()?,
        encoder_axis: config.encoder_axis,
    };
    for path in &config.input_devices {
        let reader = EvdevReader::new(path.clone(), keys.clone(), state.clone());
        task_tracker.spawn(reader.run(source.clone(), shutdown_token.clone()));
    }
    Ok(())
}

fn run_shutdown_thread(task_tracker: &TaskTracker, shutdown_token: CancellationToken) {
    task_tracker.spawn(async move {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                if let Err(e) = res {
                    error!("failed to listen for shutdown signal: {e}");
                }
                info!("received shutdown signal");
                shutdown_token.cancel();
            }
            _ = shutdown_token.cancelled() => {}
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config).await;
    pocketcam::init_logging(
        config
            .as_ref()
            .map(Config::log_level)
            .unwrap_or(log::LevelFilter::Info),
    );
    let config = config.context("failed to load config")?;
    info!("pocketcam daemon starting");

    let task_tracker = TaskTracker::new();
    let shutdown_token = CancellationToken::new();
    run_shutdown_thread(&task_tracker, shutdown_token.clone());

    let framebuffer = Framebuffer::new(
        config.framebuffer_path.clone(),
        config.backlight_path.clone(),
        config.display(),
    );
    let (pipeline, display_task) =
        DisplayPipeline::spawn(&task_tracker, Box::new(framebuffer), shutdown_token.clone());

    let state = KeyState::default();
    let (source, events) = InputEventSource::channel(
        &task_tracker,
        Arc::new(state.clone()),
        config.input_config(),
        config.input_queue_depth,
    );
    spawn_input(&task_tracker, &config, &source, state, &shutdown_token).await?;

    let camera = if cli.test_pattern {
        camera::shared(TestPattern::new())
    } else {
        camera::shared(RpicamCamera::new(config.camera_still_command.clone()))
    };
    let supervisor = Supervisor::new(
        build_modes(&config, camera),
        SupervisorConfig {
            initial_mode: ids::VIEWFINDER,
            screenshot_dir: Some(config.screenshot_dir.clone()),
        },
        events,
        pipeline,
        Box::new(SystemPower::new(shutdown_token.clone())),
        shutdown_token.clone(),
    )
    .context("failed to wire up modes")?;

    let result = supervisor.run().await;
    info!("shutting down");
    shutdown_token.cancel();
    // readers hold clones; ours goes last so the queue stays open until now
    drop(source);
    task_tracker.close();
    task_tracker.wait().await;

    match display_task.await {
        Ok(Err(e)) => error!("display stopped: {e}"),
        Err(e) => error!("display task panicked: {e}"),
        Ok(Ok(())) => {}
    }
    result.context("supervisor failed")
}
