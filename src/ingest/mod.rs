//! Dual-fisheye capture sources.
//!
//! - Synthetic checkerboard (`stub://` devices), for tests and demos
//! - Local V4L2 devices (feature: capture-v4l2), addressed by index or path
//!
//! Every source yields `DualFisheyeFrame`s in BGR at the configured resolution.
//! A device that cannot be opened, or that negotiates a different resolution,
//! is a startup failure: there is no fallback.

pub mod normalize;
pub mod synthetic;
#[cfg(feature = "capture-v4l2")]
mod v4l2;

use anyhow::Result;

use crate::calibration::CalibrationConfig;
use crate::error::PipelineError;
use crate::frame::{DualFisheyeFrame, Resolution};

pub use normalize::{normalize_to_bgr, CaptureFormat};
pub use synthetic::{render_checkerboard, Checkerboard};

const STUB_SCHEME: &str = "stub://";

#[derive(Clone, Debug, PartialEq)]
pub struct CameraConfig {
    /// `stub://name`, a device index such as `0`, or a device path.
    pub device: String,
    pub resolution: Resolution,
    pub fps: u32,
}

impl CameraConfig {
    pub fn is_synthetic(&self) -> bool {
        self.device.starts_with(STUB_SCHEME)
    }

    /// Device node for index-style names; other names pass through.
    pub fn device_path(&self) -> String {
        if !self.device.is_empty() && self.device.chars().all(|c| c.is_ascii_digit()) {
            format!("/dev/video{}", self.device)
        } else {
            self.device.clone()
        }
    }
}

#[derive(Clone, Debug)]
pub struct CaptureStats {
    pub frames_captured: u64,
    pub device: String,
}

pub struct CameraSource {
    backend: Backend,
}

enum Backend {
    Synthetic(synthetic::SyntheticSource),
    #[cfg(feature = "capture-v4l2")]
    Device(v4l2::DeviceSource),
}

impl CameraSource {
    /// Pick a backend for `config.device`. The synthetic backend draws its lenses
    /// with `calibration`.
    pub fn new(config: CameraConfig, calibration: &CalibrationConfig) -> Result<Self, PipelineError> {
        if config.resolution.is_empty() {
            return Err(PipelineError::DeviceUnavailable {
                device: config.device,
                reason: "capture resolution must be non-zero".to_string(),
            });
        }
        if config.is_synthetic() {
            return Ok(Self {
                backend: Backend::Synthetic(synthetic::SyntheticSource::new(config, calibration)),
            });
        }
        Self::device(config)
    }

    #[cfg(feature = "capture-v4l2")]
    fn device(config: CameraConfig) -> Result<Self, PipelineError> {
        Ok(Self {
            backend: Backend::Device(v4l2::DeviceSource::new(config)),
        })
    }

    #[cfg(not(feature = "capture-v4l2"))]
    fn device(config: CameraConfig) -> Result<Self, PipelineError> {
        Err(PipelineError::DeviceUnavailable {
            device: config.device,
            reason: "built without the capture-v4l2 feature".to_string(),
        })
    }

    pub fn connect(&mut self) -> Result<(), PipelineError> {
        match &mut self.backend {
            Backend::Synthetic(source) => {
                source
                    .connect()
                    .map_err(|err| PipelineError::DeviceUnavailable {
                        device: source.stats().device,
                        reason: err.to_string(),
                    })
            }
            #[cfg(feature = "capture-v4l2")]
            Backend::Device(source) => source.connect(),
        }
    }

    pub fn next_frame(&mut self) -> Result<DualFisheyeFrame> {
        match &mut self.backend {
            Backend::Synthetic(source) => source.next_frame(),
            #[cfg(feature = "capture-v4l2")]
            Backend::Device(source) => source.next_frame(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        match &self.backend {
            Backend::Synthetic(_) => true,
            #[cfg(feature = "capture-v4l2")]
            Backend::Device(source) => source.is_healthy(),
        }
    }

    pub fn stats(&self) -> CaptureStats {
        match &self.backend {
            Backend::Synthetic(source) => source.stats(),
            #[cfg(feature = "capture-v4l2")]
            Backend::Device(source) => source.stats(),
        }
    }
}
