//! V4L2 capture of a dual-fisheye camera exposed as a UVC device.
//!
//! The device is asked for BGR at the configured size; whatever layout it
//! settles on (BGR3, RGB3, YUYV, NV12) is normalized to BGR per frame. A
//! negotiated size that differs from the configured one is refused, since the
//! remap table is built for exactly one source shape.

use anyhow::{Context, Result};
use ouroboros::self_referencing;
use std::time::{Duration, Instant};
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;

use super::normalize::{normalize_to_bgr, CaptureFormat};
use super::{CameraConfig, CaptureStats};
use crate::error::PipelineError;
use crate::frame::{DualFisheyeFrame, PixelFormat};

const MMAP_BUFFERS: u32 = 4;
/// Never call a device stalled sooner than this.
const MIN_STALL: Duration = Duration::from_secs(2);
/// Missed frame intervals before a device counts as stalled.
const STALL_FRAMES: u32 = 6;

#[self_referencing]
struct MappedDevice {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: MmapStream<'this, v4l::Device>,
}

pub(super) struct DeviceSource {
    config: CameraConfig,
    mapped: Option<MappedDevice>,
    layout: CaptureFormat,
    stall_after: Duration,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    failed: bool,
}

impl DeviceSource {
    pub(super) fn new(config: CameraConfig) -> Self {
        let stall_after = stall_timeout(config.fps);
        Self {
            config,
            mapped: None,
            layout: CaptureFormat::Bgr24,
            stall_after,
            frame_count: 0,
            last_frame_at: None,
            failed: false,
        }
    }

    fn unavailable(&self, reason: impl std::fmt::Display) -> PipelineError {
        PipelineError::DeviceUnavailable {
            device: self.config.device_path(),
            reason: reason.to_string(),
        }
    }

    /// Open the node, negotiate format and rate, and map the capture buffers.
    pub(super) fn connect(&mut self) -> Result<(), PipelineError> {
        let path = self.config.device_path();
        let wanted = self.config.resolution;
        let mut device = v4l::Device::with_path(&path).map_err(|err| self.unavailable(err))?;

        let mut request = device.format().map_err(|err| self.unavailable(err))?;
        request.width = wanted.width;
        request.height = wanted.height;
        request.fourcc = v4l::FourCC::new(b"BGR3");
        let negotiated = device.set_format(&request).or_else(|err| {
            log::warn!("CameraSource: {} refused BGR3 {}: {}", path, wanted, err);
            device.format()
        });
        let negotiated = negotiated.map_err(|err| self.unavailable(err))?;

        if (negotiated.width, negotiated.height) != (wanted.width, wanted.height) {
            return Err(PipelineError::ShapeMismatch {
                expected_width: wanted.width,
                expected_height: wanted.height,
                width: negotiated.width,
                height: negotiated.height,
            });
        }
        self.layout = CaptureFormat::from_fourcc(&negotiated.fourcc.repr).ok_or_else(|| {
            self.unavailable(format!("unsupported pixel format {}", negotiated.fourcc))
        })?;

        if self.config.fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!("CameraSource: {} ignored {} fps: {}", path, self.config.fps, err);
            }
        }

        let mapped = MappedDevice::try_new(device, |device| {
            MmapStream::with_buffers(device, Type::VideoCapture, MMAP_BUFFERS)
        })
        .map_err(|err| self.unavailable(format!("map capture buffers: {}", err)))?;
        self.mapped = Some(mapped);
        self.failed = false;

        log::info!(
            "CameraSource: connected to {} ({}, {:?})",
            path,
            wanted,
            self.layout
        );
        Ok(())
    }

    pub(super) fn next_frame(&mut self) -> Result<DualFisheyeFrame> {
        let (width, height) = (self.config.resolution.width, self.config.resolution.height);
        let image_len = self
            .layout
            .expected_len(width, height)
            .context("capture dimensions overflow")?;

        let mapped = self.mapped.as_mut().context("v4l2 device not connected")?;
        let captured = mapped.with_stream_mut(|stream| {
            stream
                .next()
                .map(|(buf, _meta)| buf.get(..image_len).map(<[u8]>::to_vec))
        });
        let image = match captured {
            Ok(Some(image)) => image,
            Ok(None) => anyhow::bail!("short v4l2 buffer (need {} bytes)", image_len),
            Err(err) => {
                self.failed = true;
                return Err(anyhow::Error::new(err).context("dequeue v4l2 buffer"));
            }
        };

        let bgr = normalize_to_bgr(&image, width, height, self.layout)?;
        let seq = self.frame_count;
        self.frame_count += 1;
        self.failed = false;
        self.last_frame_at = Some(Instant::now());
        DualFisheyeFrame::new(bgr, width, height, PixelFormat::Bgr24, seq)
    }

    /// Unhealthy after a dequeue error, or when the last frame is older than
    /// the stall timeout.
    pub(super) fn is_healthy(&self) -> bool {
        !self.failed
            && self
                .last_frame_at
                .map_or(true, |at| at.elapsed() <= self.stall_after)
    }

    pub(super) fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.frame_count,
            device: self.config.device_path(),
        }
    }
}

/// How long without a frame before the device counts as stalled.
fn stall_timeout(fps: u32) -> Duration {
    match fps {
        0 => MIN_STALL,
        fps => (Duration::from_secs(1) / fps * STALL_FRAMES).max(MIN_STALL),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Resolution;

    #[test]
    fn stall_timeout_scales_with_slow_rates_only() {
        assert_eq!(stall_timeout(0), MIN_STALL);
        assert_eq!(stall_timeout(30), MIN_STALL);
        assert_eq!(stall_timeout(1), Duration::from_secs(6));
    }

    #[test]
    fn dequeue_failure_and_silence_are_unhealthy() {
        let mut source = DeviceSource::new(CameraConfig {
            device: "0".to_string(),
            resolution: Resolution::new(1920, 960),
            fps: 30,
        });
        assert!(source.is_healthy());

        source.last_frame_at = Some(Instant::now());
        assert!(source.is_healthy());
        source.failed = true;
        assert!(!source.is_healthy());

        source.failed = false;
        source.last_frame_at = Instant::now().checked_sub(Duration::from_secs(10));
        assert!(source.last_frame_at.is_none() || !source.is_healthy());
    }
}
