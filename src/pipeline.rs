//! Pipeline controller.
//!
//! Stages:
//! 1. capture + stitch (own thread): camera → `Stitcher` with the current table
//!    snapshot → optional preview → `FrameChannel`
//! 2. sink (caller's thread): `FrameChannel` → `StreamSink`
//!
//! A shared shutdown flag stops both stages. Capture stops producing, the
//! channel is closed, and the sink closes the encoder pipe with a bounded wait.
//! Fatal errors raise the flag too, so one failing stage takes the other down.

use anyhow::{anyhow, Context, Result};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::calibration::CalibrationConfig;
use crate::channel::FrameChannel;
use crate::config::{AppConfig, RestartPolicy};
use crate::error::PipelineError;
use crate::frame::PixelFormat;
use crate::ingest::{CameraConfig, CameraSource};
use crate::preview::{PreviewWorker, PreviewWriter};
use crate::remap::{BlendCurve, RemapTable, SharedTable};
use crate::sink::{Delivery, EncoderSettings, StreamConfig, StreamSink};
use crate::stitch::{StitchOptions, Stitcher};

pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);
const POP_TIMEOUT: Duration = Duration::from_millis(100);
/// Consecutive failed reads before the camera is declared gone.
const MAX_CAPTURE_FAILURES: u32 = 30;

#[derive(Clone, Debug)]
pub struct PipelineSettings {
    pub camera: CameraConfig,
    pub stream: StreamConfig,
    pub encoder: EncoderSettings,
    pub stitch: StitchOptions,
    pub feather: BlendCurve,
    pub channel_capacity: usize,
    pub restart_policy: RestartPolicy,
    pub preview: Option<PathBuf>,
    pub health_interval: Duration,
}

impl PipelineSettings {
    pub fn from_config(cfg: &AppConfig, preview: Option<PathBuf>) -> Self {
        Self {
            camera: CameraConfig {
                device: cfg.camera.device.clone(),
                resolution: cfg.camera.resolution(),
                fps: cfg.camera.fps,
            },
            stream: StreamConfig {
                url: cfg.stream.url.clone(),
                resolution: cfg.stream.resolution(),
                fps: cfg.stream.fps,
                bitrate: cfg.stream.bitrate.clone(),
                format: PixelFormat::Bgr24,
            },
            encoder: EncoderSettings {
                program: cfg.stream.encoder.clone(),
                ..EncoderSettings::default()
            },
            stitch: cfg.processing.stitch_options(),
            feather: cfg.processing.feather,
            channel_capacity: cfg.channel_capacity,
            restart_policy: cfg.restart_policy,
            preview,
            health_interval: DEFAULT_HEALTH_INTERVAL,
        }
    }
}

/// Counters shared by the stages.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub captured: AtomicU64,
    pub capture_errors: AtomicU64,
    pub stitched: AtomicU64,
    pub sent: AtomicU64,
    pub send_timeouts: AtomicU64,
    pub restarts: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub captured: u64,
    pub capture_errors: u64,
    pub stitched: u64,
    pub sent: u64,
    pub send_timeouts: u64,
    pub restarts: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            captured: self.captured.load(Ordering::Relaxed),
            capture_errors: self.capture_errors.load(Ordering::Relaxed),
            stitched: self.stitched.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            send_timeouts: self.send_timeouts.load(Ordering::Relaxed),
            restarts: self.restarts.load(Ordering::Relaxed),
        }
    }
}

pub struct Pipeline {
    settings: PipelineSettings,
    calibration: CalibrationConfig,
    table: Arc<SharedTable>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    /// Validate the calibration and build the initial table. Any failure here
    /// is a startup failure.
    pub fn new(
        settings: PipelineSettings,
        calibration: CalibrationConfig,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let start = Instant::now();
        let table = RemapTable::build(
            &calibration,
            settings.camera.resolution,
            settings.stream.resolution,
            settings.feather,
        )?;
        log::info!(
            "remap table {} -> {} built in {:?} (band {:.1}px, {} undefined pixels)",
            table.source(),
            table.output(),
            start.elapsed(),
            table.band_width_px(),
            table.undefined_count()
        );
        if table.band_clamped() {
            log::warn!(
                "configured overlap {:?} is wider than the lenses overlap, seam band clamped to {:.1}px",
                calibration.overlap,
                table.band_width_px()
            );
        }
        Ok(Self {
            settings,
            calibration,
            table: Arc::new(SharedTable::new(table)),
            shutdown,
            stats: Arc::new(PipelineStats::default()),
        })
    }

    /// Live table handle, for the calibration session.
    pub fn table(&self) -> Arc<SharedTable> {
        Arc::clone(&self.table)
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    /// Run until shutdown or a fatal error.
    pub fn run(self) -> Result<()> {
        let mut camera = CameraSource::new(self.settings.camera.clone(), &self.calibration)?;
        camera.connect()?;

        let mut sink =
            StreamSink::start(self.settings.stream.clone(), self.settings.encoder.clone())?;
        let channel = Arc::new(FrameChannel::new(self.settings.channel_capacity));

        let capture = {
            let channel = Arc::clone(&channel);
            let table = Arc::clone(&self.table);
            let shutdown = Arc::clone(&self.shutdown);
            let stats = Arc::clone(&self.stats);
            let stitch = self.settings.stitch;
            let preview = match &self.settings.preview {
                Some(path) => Some(PreviewWorker::spawn(PreviewWriter::new(path))?),
                None => None,
            };
            std::thread::Builder::new()
                .name("capture".to_string())
                .spawn(move || {
                    let stitcher = Stitcher::new(stitch);
                    let result =
                        capture_loop(camera, stitcher, preview, &table, &channel, &shutdown, &stats);
                    if result.is_err() {
                        shutdown.store(true, Ordering::SeqCst);
                    }
                    channel.close();
                    result
                })
                .context("spawn capture thread")?
        };

        let sink_result = self.sink_loop(&mut sink, &channel);
        self.shutdown.store(true, Ordering::SeqCst);
        channel.close();

        let capture_result = capture
            .join()
            .map_err(|_| anyhow!("capture thread panicked"))?;
        if let Err(err) = sink.stop() {
            log::warn!("encoder shutdown: {}", err);
        }

        let totals = self.stats.snapshot();
        let channel_stats = channel.stats();
        log::info!(
            "pipeline stopped: captured={} stitched={} sent={} dropped={} restarts={}",
            totals.captured,
            totals.stitched,
            totals.sent,
            channel_stats.dropped,
            totals.restarts
        );

        // The capture failure is the root cause when both stages failed.
        capture_result?;
        sink_result
    }

    fn sink_loop(&self, sink: &mut StreamSink, channel: &FrameChannel) -> Result<()> {
        let mut last_health = Instant::now();
        let mut restarts_left = match self.settings.restart_policy {
            RestartPolicy::Fatal => 0,
            RestartPolicy::RestartOnce => 1,
        };

        loop {
            if last_health.elapsed() >= self.settings.health_interval {
                last_health = Instant::now();
                self.log_health(channel);
            }

            let Some(frame) = channel.pop(POP_TIMEOUT) else {
                if self.shutdown.load(Ordering::SeqCst) || channel.is_closed() {
                    return Ok(());
                }
                continue;
            };

            match sink.send(frame) {
                Ok(Delivery::Queued) => {
                    self.stats.sent.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Delivery::TimedOut) => {
                    self.stats.send_timeouts.fetch_add(1, Ordering::Relaxed);
                }
                Err(err @ PipelineError::StreamDisconnected(_)) if restarts_left > 0 => {
                    restarts_left -= 1;
                    log::warn!("{}; restarting encoder", err);
                    if let Err(stop_err) = sink.stop() {
                        log::debug!("stopping dead encoder: {}", stop_err);
                    }
                    *sink = StreamSink::start(
                        self.settings.stream.clone(),
                        self.settings.encoder.clone(),
                    )?;
                    self.stats.restarts.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    log::error!("stream sink: {}", err);
                    return Err(err.into());
                }
            }
        }
    }

    fn log_health(&self, channel: &FrameChannel) {
        let s = self.stats.snapshot();
        let c = channel.stats();
        log::info!(
            "health: captured={} stitched={} sent={} timeouts={} dropped={} queued={} table=v{}",
            s.captured,
            s.stitched,
            s.sent,
            s.send_timeouts,
            c.dropped,
            channel.len(),
            self.table.version()
        );
    }
}

fn capture_loop(
    mut camera: CameraSource,
    mut stitcher: Stitcher,
    mut preview: Option<PreviewWorker>,
    table: &SharedTable,
    channel: &FrameChannel,
    shutdown: &AtomicBool,
    stats: &PipelineStats,
) -> Result<()> {
    let mut failures = 0u32;
    let mut healthy = true;
    while !shutdown.load(Ordering::SeqCst) {
        let result = camera.next_frame();
        if camera.is_healthy() != healthy {
            healthy = !healthy;
            if healthy {
                log::info!("camera {} recovered", camera.stats().device);
            } else {
                log::warn!("camera {} unhealthy", camera.stats().device);
            }
        }
        let frame = match result {
            Ok(frame) => {
                failures = 0;
                frame
            }
            Err(err) => {
                failures += 1;
                stats.capture_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("capture failed ({} in a row): {:#}", failures, err);
                if failures >= MAX_CAPTURE_FAILURES {
                    return Err(PipelineError::DeviceUnavailable {
                        device: camera.stats().device,
                        reason: format!("{} consecutive capture failures, last: {:#}", failures, err),
                    }
                    .into());
                }
                continue;
            }
        };
        stats.captured.fetch_add(1, Ordering::Relaxed);

        // One snapshot per frame: a concurrent swap never tears a frame.
        let snapshot = table.load();
        let panorama = stitcher.stitch(&frame, &snapshot)?;
        stats.stitched.fetch_add(1, Ordering::Relaxed);

        if let Some(worker) = preview.as_mut() {
            worker.offer(&panorama);
        }
        if !channel.push(panorama) {
            break;
        }
    }
    log::debug!("capture stopped after {} frames", camera.stats().frames_captured);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Resolution;

    fn settings() -> PipelineSettings {
        let mut cfg = AppConfig::default();
        cfg.camera.device = "stub://test".to_string();
        cfg.camera.width = 320;
        cfg.camera.height = 160;
        cfg.stream.width = 160;
        cfg.stream.height = 80;
        PipelineSettings::from_config(&cfg, None)
    }

    #[test]
    fn settings_follow_config() {
        let s = settings();
        assert_eq!(s.camera.resolution, Resolution::new(320, 160));
        assert_eq!(s.stream.resolution, Resolution::new(160, 80));
        assert_eq!(s.encoder.program, "ffmpeg");
        assert_eq!(s.restart_policy, RestartPolicy::RestartOnce);
    }

    #[test]
    fn invalid_calibration_fails_startup() {
        let s = settings();
        let mut calibration = CalibrationConfig::default_for(s.camera.resolution);
        calibration.left.radius = 0.0;
        let err = Pipeline::new(s, calibration, Arc::new(AtomicBool::new(false)))
            .err()
            .expect("startup must fail");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::CalibrationInvalid(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn stub_pipeline_streams_until_shutdown() -> Result<()> {
        let mut s = settings();
        s.camera.fps = 200;
        s.encoder = EncoderSettings {
            program: "cat".to_string(),
            args: Some(Vec::new()),
            pace: false,
            ..EncoderSettings::default()
        };
        let calibration = CalibrationConfig::default_for(s.camera.resolution);
        let shutdown = Arc::new(AtomicBool::new(false));
        let pipeline = Pipeline::new(s, calibration, Arc::clone(&shutdown))?;
        let stats = pipeline.stats();

        let stopper = {
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(500));
                shutdown.store(true, Ordering::SeqCst);
            })
        };
        pipeline.run()?;
        stopper.join().unwrap();

        let totals = stats.snapshot();
        assert!(totals.stitched > 0);
        assert!(totals.sent > 0);
        assert_eq!(totals.restarts, 0);
        Ok(())
    }

    /// Run against an encoder that exits at once; returns the error and the
    /// restart count.
    #[cfg(unix)]
    fn run_with_dead_encoder(policy: RestartPolicy) -> Result<(anyhow::Error, u64)> {
        let mut s = settings();
        s.camera.fps = 200;
        s.restart_policy = policy;
        s.encoder = EncoderSettings {
            program: "true".to_string(),
            args: Some(Vec::new()),
            pace: false,
            ..EncoderSettings::default()
        };
        let calibration = CalibrationConfig::default_for(s.camera.resolution);
        let shutdown = Arc::new(AtomicBool::new(false));
        let pipeline = Pipeline::new(s, calibration, Arc::clone(&shutdown))?;
        let stats = pipeline.stats();

        // Only a safety net; the run is expected to fail long before this.
        let watchdog = {
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_secs(20));
                shutdown.store(true, Ordering::SeqCst);
            })
        };
        let err = pipeline
            .run()
            .err()
            .expect("a dead encoder must end the run with an error");
        drop(watchdog);
        Ok((err, stats.snapshot().restarts))
    }

    #[cfg(unix)]
    #[test]
    fn restart_once_retries_a_single_time() -> Result<()> {
        let (err, restarts) = run_with_dead_encoder(RestartPolicy::RestartOnce)?;
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::StreamDisconnected(_))
        ));
        assert_eq!(restarts, 1);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn fatal_policy_never_restarts() -> Result<()> {
        let (err, restarts) = run_with_dead_encoder(RestartPolicy::Fatal)?;
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::StreamDisconnected(_))
        ));
        assert_eq!(restarts, 0);
        Ok(())
    }

    #[cfg(not(feature = "capture-v4l2"))]
    #[test]
    fn default_camera_is_a_device_not_a_stub() -> Result<()> {
        let mut s = settings();
        s.camera.device = AppConfig::default().camera.device;
        assert_eq!(s.camera.device, "0");
        let calibration = CalibrationConfig::default_for(s.camera.resolution);
        let pipeline = Pipeline::new(s, calibration, Arc::new(AtomicBool::new(false)))?;
        let err = pipeline.run().err().expect("no capture device in this build");
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::DeviceUnavailable { .. })
        ));
        Ok(())
    }
}
