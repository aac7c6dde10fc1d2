//! Local preview: a downscaled JPEG of the live panorama, rewritten periodically.
//!
//! `PreviewWorker` keeps the resize and JPEG encode off the stitch thread. The
//! stitch thread only copies a due frame into a one-slot queue; a frame offered
//! while the worker is still busy is skipped.

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Sender, TrySendError};
use image::imageops::FilterType;
use image::{ImageFormat, RgbImage};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::{PanoramaFrame, PixelFormat, Resolution, CHANNELS};

pub const PREVIEW_SIZE: Resolution = Resolution::new(1280, 640);
pub const PREVIEW_INTERVAL: Duration = Duration::from_secs(1);

pub struct PreviewWriter {
    path: PathBuf,
    size: Resolution,
    interval: Duration,
    last_written: Option<Instant>,
}

impl PreviewWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            size: PREVIEW_SIZE,
            interval: PREVIEW_INTERVAL,
            last_written: None,
        }
    }

    pub fn with_size(mut self, size: Resolution) -> Self {
        self.size = size;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a snapshot is due; marks it taken when it is.
    fn claim(&mut self) -> bool {
        let due = self
            .last_written
            .map_or(true, |last| last.elapsed() >= self.interval);
        if due {
            self.last_written = Some(Instant::now());
        }
        due
    }

    /// Write `frame` if the interval has elapsed. Returns whether a snapshot was written.
    pub fn offer(&mut self, frame: &PanoramaFrame) -> Result<bool> {
        if !self.claim() {
            return Ok(false);
        }
        self.write(frame)?;
        Ok(true)
    }

    /// Unconditionally write a snapshot of `frame`.
    pub fn write(&self, frame: &PanoramaFrame) -> Result<()> {
        let rgb = to_rgb_image(frame)?;
        let scaled = if rgb.dimensions() == (self.size.width, self.size.height) {
            rgb
        } else {
            image::imageops::resize(&rgb, self.size.width, self.size.height, FilterType::Triangle)
        };

        let tmp = self.path.with_extension("jpg.tmp");
        scaled
            .save_with_format(&tmp, ImageFormat::Jpeg)
            .with_context(|| format!("write preview {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace preview {}", self.path.display()))?;
        Ok(())
    }
}

/// Runs a `PreviewWriter` on its own thread.
pub struct PreviewWorker {
    writer: PreviewWriter,
    frames: Option<Sender<PanoramaFrame>>,
    handle: Option<JoinHandle<()>>,
}

impl PreviewWorker {
    pub fn spawn(writer: PreviewWriter) -> Result<Self> {
        let (tx, rx) = bounded::<PanoramaFrame>(1);
        let target = PreviewWriter::new(writer.path.clone()).with_size(writer.size);
        let handle = std::thread::Builder::new()
            .name("preview".to_string())
            .spawn(move || {
                for frame in rx.iter() {
                    if let Err(err) = target.write(&frame) {
                        log::warn!("preview {}: {:#}", target.path().display(), err);
                    }
                }
            })
            .context("spawn preview thread")?;
        Ok(Self {
            writer,
            frames: Some(tx),
            handle: Some(handle),
        })
    }

    /// Queue a copy of `frame` if a snapshot is due and the worker is idle.
    /// Returns whether the frame was queued.
    pub fn offer(&mut self, frame: &PanoramaFrame) -> bool {
        let Some(tx) = self.frames.as_ref() else {
            return false;
        };
        if tx.is_full() || !self.writer.claim() {
            return false;
        }
        let copy = match PanoramaFrame::with_capture_time(
            frame.pixels().to_vec(),
            frame.width,
            frame.height,
            frame.format,
            frame.seq,
            frame.captured_at,
        ) {
            Ok(copy) => copy,
            Err(err) => {
                log::warn!("preview copy: {:#}", err);
                return false;
            }
        };
        match tx.try_send(copy) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => {
                log::warn!("preview worker exited; preview disabled");
                self.frames = None;
                false
            }
        }
    }

    /// Write any queued snapshot and stop the thread.
    pub fn finish(&mut self) {
        self.frames = None;
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PreviewWorker {
    fn drop(&mut self) {
        self.finish();
    }
}

fn to_rgb_image(frame: &PanoramaFrame) -> Result<RgbImage> {
    let data = match frame.format {
        PixelFormat::Rgb24 => frame.pixels().to_vec(),
        PixelFormat::Bgr24 => frame
            .pixels()
            .chunks_exact(CHANNELS)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect(),
    };
    RgbImage::from_raw(frame.width, frame.height, data)
        .ok_or_else(|| anyhow!("preview buffer does not match {}", frame.resolution()))
}
