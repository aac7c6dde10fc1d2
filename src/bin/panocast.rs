//! panocast - dual-fisheye to equirectangular live streamer
//!
//! This daemon:
//! 1. Loads configuration (file, environment, flags) and the lens calibration
//! 2. Builds the remap table for camera resolution → stream resolution
//! 3. Captures, stitches and streams until Ctrl-C or a fatal error
//! 4. Optionally runs an interactive calibration session alongside the stream
//!
//! Exit status: 0 clean shutdown, 2 capture device unavailable, 3 invalid
//! calibration, 4 frame shape mismatch, 5 stream lost, 1 anything else.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use panocast::calibration::OverlapWidth;
use panocast::config::{AppConfig, RestartPolicy};
use panocast::pipeline::{Pipeline, PipelineSettings};
use panocast::session::{CalibrationSession, KeyBindings, SessionOutcome, StdinInput};
use panocast::ui::{Ui, UiMode};
use panocast::{BlendCurve, BrightnessMode, CalibrationStore, PipelineError};

const DEFAULT_CONFIG_PATH: &str = "panocast.json";

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON configuration file (defaults to PANOCAST_CONFIG when set).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Capture device: index, device path, or stub://name.
    #[arg(long)]
    camera: Option<String>,
    #[arg(long)]
    camera_width: Option<u32>,
    #[arg(long)]
    camera_height: Option<u32>,
    #[arg(long)]
    camera_fps: Option<u32>,
    /// Stream destination, e.g. rtmp://host/live/key.
    #[arg(long)]
    url: Option<String>,
    /// Output panorama width.
    #[arg(long)]
    width: Option<u32>,
    /// Output panorama height.
    #[arg(long)]
    height: Option<u32>,
    #[arg(long)]
    fps: Option<u32>,
    /// Encoder bitrate, e.g. 4000k.
    #[arg(long)]
    bitrate: Option<String>,
    /// Write a downscaled JPEG of the panorama here once per second.
    #[arg(long)]
    preview: Option<PathBuf>,
    /// Adjust lens parameters interactively while streaming.
    #[arg(long)]
    calibrate: bool,
    #[arg(long)]
    no_brightness_eq: bool,
    #[arg(long)]
    no_color_balance: bool,
    /// Seam overlap width in output pixels.
    #[arg(long, conflicts_with = "overlap_percent")]
    overlap: Option<u32>,
    /// Seam overlap width in percent of the output width.
    #[arg(long)]
    overlap_percent: Option<f64>,
    /// Seam feather curve: linear or smoothstep.
    #[arg(long)]
    feather: Option<BlendCurve>,
    /// per-frame, smoothed, or smoothed:<alpha>.
    #[arg(long)]
    brightness_mode: Option<BrightnessMode>,
    /// Lens calibration file.
    #[arg(long)]
    calibration: Option<PathBuf>,
    /// Encoder program (ffmpeg-compatible).
    #[arg(long)]
    encoder: Option<String>,
    /// fatal or restart-once.
    #[arg(long)]
    restart_policy: Option<RestartPolicy>,
    /// Write the effective configuration to the config path and exit.
    #[arg(long)]
    save_config: bool,
    /// Terminal output: auto, plain or pretty.
    #[arg(long, default_value = "auto")]
    ui: UiMode,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let code = match run(args) {
        Ok(()) => 0,
        Err(err) => {
            log::error!("{:#}", err);
            exit_code(&err)
        }
    };
    std::process::exit(code);
}

fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
        .map(PipelineError::exit_code)
        .unwrap_or(1)
}

fn run(args: Args) -> Result<()> {
    let ui = Ui::new(args.ui, std::io::stderr().is_terminal());

    let cfg = {
        let stage = ui.stage("Load configuration");
        let mut cfg = AppConfig::load(args.config.as_deref())?;
        apply_args(&mut cfg, &args);
        cfg.validate()?;
        stage.done();
        cfg
    };

    if args.save_config {
        let path = args
            .config
            .clone()
            .or_else(|| std::env::var("PANOCAST_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        cfg.save(&path)?;
        log::info!("configuration saved to {}", path.display());
        return Ok(());
    }

    let store = CalibrationStore::new(cfg.calibration_path.clone());
    let calibration = {
        let stage = ui.stage("Load calibration");
        let calibration = store.load_or_default(cfg.camera.resolution(), cfg.processing.overlap);
        stage.done();
        calibration
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("install Ctrl-C handler")?;
    }

    let settings = PipelineSettings::from_config(&cfg, args.preview.clone());
    let pipeline = {
        let stage = ui.stage("Build remap table");
        let pipeline = Pipeline::new(settings, calibration, Arc::clone(&shutdown))?;
        stage.done();
        pipeline
    };

    log::info!(
        "streaming {} @ {} fps to {} (camera {} {})",
        cfg.stream.resolution(),
        cfg.stream.fps,
        cfg.stream.url,
        cfg.camera.device,
        cfg.camera.resolution()
    );

    if !args.calibrate {
        return pipeline.run();
    }

    let mut session = {
        let status_ui = ui.clone();
        CalibrationSession::new(calibration, store, pipeline.table(), cfg.processing.feather)
            .on_change(move |working| status_ui.calibration_status(working))
    };
    let streaming = std::thread::Builder::new()
        .name("pipeline".to_string())
        .spawn(move || pipeline.run())
        .context("spawn pipeline thread")?;

    let bindings = KeyBindings::default();
    ui.calibration_help(&bindings.help());
    ui.calibration_status(&calibration);
    let mut input = StdinInput::spawn(bindings);
    match session.run(&mut input, &shutdown)? {
        SessionOutcome::Committed(_) => {
            log::info!("calibration committed; still streaming (Ctrl-C to stop)")
        }
        SessionOutcome::Cancelled => {
            log::info!("calibration cancelled; still streaming (Ctrl-C to stop)")
        }
        SessionOutcome::Interrupted => {}
    }

    streaming
        .join()
        .map_err(|_| anyhow!("pipeline thread panicked"))?
}

fn apply_args(cfg: &mut AppConfig, args: &Args) {
    if let Some(camera) = &args.camera {
        cfg.camera.device = camera.clone();
    }
    if let Some(width) = args.camera_width {
        cfg.camera.width = width;
    }
    if let Some(height) = args.camera_height {
        cfg.camera.height = height;
    }
    if let Some(fps) = args.camera_fps {
        cfg.camera.fps = fps;
    }
    if let Some(url) = &args.url {
        cfg.stream.url = url.clone();
    }
    if let Some(width) = args.width {
        cfg.stream.width = width;
    }
    if let Some(height) = args.height {
        cfg.stream.height = height;
    }
    if let Some(fps) = args.fps {
        cfg.stream.fps = fps;
    }
    if let Some(bitrate) = &args.bitrate {
        cfg.stream.bitrate = bitrate.clone();
    }
    if let Some(encoder) = &args.encoder {
        cfg.stream.encoder = encoder.clone();
    }
    if args.no_brightness_eq {
        cfg.processing.brightness_equalization = false;
    }
    if args.no_color_balance {
        cfg.processing.color_balance = false;
    }
    if let Some(px) = args.overlap {
        cfg.processing.overlap = OverlapWidth::Pixels(px);
    }
    if let Some(pct) = args.overlap_percent {
        cfg.processing.overlap = OverlapWidth::Percent(pct);
    }
    if let Some(feather) = args.feather {
        cfg.processing.feather = feather;
    }
    if let Some(mode) = args.brightness_mode {
        cfg.processing.brightness_mode = mode;
    }
    if let Some(path) = &args.calibration {
        cfg.calibration_path = path.clone();
    }
    if let Some(policy) = args.restart_policy {
        cfg.restart_policy = policy;
    }
}
