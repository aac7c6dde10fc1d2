use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::calibration::{OverlapWidth, DEFAULT_CALIBRATION_PATH, DEFAULT_OVERLAP_PERCENT};
use crate::channel::DEFAULT_CAPACITY;
use crate::frame::Resolution;
use crate::remap::BlendCurve;
use crate::stitch::{BrightnessMode, StitchOptions};

const DEFAULT_CAMERA: &str = "0";
const DEFAULT_CAMERA_WIDTH: u32 = 1920;
const DEFAULT_CAMERA_HEIGHT: u32 = 960;
const DEFAULT_CAMERA_FPS: u32 = 30;
const DEFAULT_STREAM_URL: &str = "rtmp://127.0.0.1:1935/live/livestream";
const DEFAULT_STREAM_WIDTH: u32 = 3840;
const DEFAULT_STREAM_HEIGHT: u32 = 1920;
const DEFAULT_STREAM_FPS: u32 = 30;
const DEFAULT_BITRATE: &str = "4000k";
const DEFAULT_ENCODER: &str = "ffmpeg";
const MAX_OVERLAP_PERCENT: f64 = 50.0;

#[derive(Debug, Deserialize, Serialize, Default)]
struct AppConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    camera: Option<CameraConfigFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<StreamConfigFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    processing: Option<ProcessingConfigFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    calibration_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel_capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    restart_policy: Option<RestartPolicy>,
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct StreamConfigFile {
    url: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    bitrate: Option<String>,
    encoder: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Default)]
struct ProcessingConfigFile {
    brightness_equalization: Option<bool>,
    color_balance: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    overlap_width_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    overlap_width_px: Option<u32>,
    feather: Option<BlendCurve>,
    brightness_mode: Option<BrightnessMode>,
}

/// What the controller does when the encoder goes away.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    /// Shut down on the first disconnect.
    Fatal,
    /// Restart the encoder once; a second disconnect is fatal.
    #[default]
    RestartOnce,
}

impl std::str::FromStr for RestartPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fatal" => Ok(Self::Fatal),
            "restart-once" => Ok(Self::RestartOnce),
            other => Err(anyhow!("unknown restart policy {other:?} (fatal|restart-once)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub camera: CameraSettings,
    pub stream: StreamSettings,
    pub processing: ProcessingSettings,
    pub calibration_path: PathBuf,
    pub channel_capacity: usize,
    pub restart_policy: RestartPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamSettings {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub bitrate: String,
    pub encoder: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingSettings {
    pub brightness_equalization: bool,
    pub color_balance: bool,
    pub overlap: OverlapWidth,
    pub feather: BlendCurve,
    pub brightness_mode: BrightnessMode,
}

impl CameraSettings {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

impl StreamSettings {
    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }
}

impl ProcessingSettings {
    pub fn stitch_options(&self) -> StitchOptions {
        StitchOptions {
            brightness_equalization: self.brightness_equalization,
            color_balance: self.color_balance,
            brightness_mode: self.brightness_mode,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        // Every file field is optional, so the empty file yields the defaults.
        Self::from_file(AppConfigFile::default())
    }
}

impl AppConfig {
    /// Load from `path`, or `PANOCAST_CONFIG` when no path is given, then apply
    /// environment overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var("PANOCAST_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);
        let file_cfg = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => Some(read_config_file(&path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AppConfigFile) -> Self {
        let camera = file.camera.unwrap_or_default();
        let stream = file.stream.unwrap_or_default();
        let processing = file.processing.unwrap_or_default();

        let overlap = match (processing.overlap_width_px, processing.overlap_width_percent) {
            (Some(px), _) => OverlapWidth::Pixels(px),
            (None, Some(pct)) => OverlapWidth::Percent(pct),
            (None, None) => OverlapWidth::Percent(DEFAULT_OVERLAP_PERCENT),
        };

        Self {
            camera: CameraSettings {
                device: camera.device.unwrap_or_else(|| DEFAULT_CAMERA.to_string()),
                width: camera.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
                height: camera.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
                fps: camera.fps.unwrap_or(DEFAULT_CAMERA_FPS),
            },
            stream: StreamSettings {
                url: stream.url.unwrap_or_else(|| DEFAULT_STREAM_URL.to_string()),
                width: stream.width.unwrap_or(DEFAULT_STREAM_WIDTH),
                height: stream.height.unwrap_or(DEFAULT_STREAM_HEIGHT),
                fps: stream.fps.unwrap_or(DEFAULT_STREAM_FPS),
                bitrate: stream.bitrate.unwrap_or_else(|| DEFAULT_BITRATE.to_string()),
                encoder: stream.encoder.unwrap_or_else(|| DEFAULT_ENCODER.to_string()),
            },
            processing: ProcessingSettings {
                brightness_equalization: processing.brightness_equalization.unwrap_or(true),
                color_balance: processing.color_balance.unwrap_or(true),
                overlap,
                feather: processing.feather.unwrap_or_default(),
                brightness_mode: processing.brightness_mode.unwrap_or_default(),
            },
            calibration_path: file
                .calibration_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CALIBRATION_PATH)),
            channel_capacity: file.channel_capacity.unwrap_or(DEFAULT_CAPACITY),
            restart_policy: file.restart_policy.unwrap_or_default(),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(camera) = std::env::var("PANOCAST_CAMERA") {
            if !camera.trim().is_empty() {
                self.camera.device = camera;
            }
        }
        if let Ok(url) = std::env::var("PANOCAST_STREAM_URL") {
            if !url.trim().is_empty() {
                self.stream.url = url;
            }
        }
        if let Ok(bitrate) = std::env::var("PANOCAST_BITRATE") {
            if !bitrate.trim().is_empty() {
                self.stream.bitrate = bitrate.trim().to_string();
            }
        }
        if let Ok(encoder) = std::env::var("PANOCAST_ENCODER") {
            if !encoder.trim().is_empty() {
                self.stream.encoder = encoder;
            }
        }
        if let Ok(path) = std::env::var("PANOCAST_CALIBRATION") {
            if !path.trim().is_empty() {
                self.calibration_path = PathBuf::from(path);
            }
        }
        Ok(())
    }

    /// Check the record for values the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let camera = &self.camera;
        if camera.width == 0 || camera.height == 0 || camera.fps == 0 {
            return Err(anyhow!(
                "camera resolution and fps must be non-zero (got {}x{} @ {})",
                camera.width,
                camera.height,
                camera.fps
            ));
        }
        let stream = &self.stream;
        if stream.width == 0 || stream.height == 0 || stream.fps == 0 {
            return Err(anyhow!(
                "stream resolution and fps must be non-zero (got {}x{} @ {})",
                stream.width,
                stream.height,
                stream.fps
            ));
        }
        if stream.width % 2 != 0 || stream.height % 2 != 0 {
            return Err(anyhow!(
                "stream resolution must be even for yuv420p (got {}x{})",
                stream.width,
                stream.height
            ));
        }
        parse_bitrate(&stream.bitrate)?;
        url::Url::parse(&stream.url)
            .with_context(|| format!("invalid stream url {:?}", stream.url))?;
        if stream.encoder.trim().is_empty() {
            return Err(anyhow!("encoder program must not be empty"));
        }
        if let OverlapWidth::Percent(pct) = self.processing.overlap {
            if !(0.0..=MAX_OVERLAP_PERCENT).contains(&pct) {
                return Err(anyhow!(
                    "overlap width must be within 0..={} percent, got {}",
                    MAX_OVERLAP_PERCENT,
                    pct
                ));
            }
        }
        if let BrightnessMode::Smoothed { alpha } = self.processing.brightness_mode {
            if !(alpha > 0.0 && alpha <= 1.0) {
                return Err(anyhow!("smoothing alpha must be in (0, 1], got {}", alpha));
            }
        }
        if self.channel_capacity == 0 {
            return Err(anyhow!("channel capacity must be at least 1"));
        }
        Ok(())
    }

    /// Write the record as pretty JSON, loadable by `load`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let (overlap_width_percent, overlap_width_px) = match self.processing.overlap {
            OverlapWidth::Percent(pct) => (Some(pct), None),
            OverlapWidth::Pixels(px) => (None, Some(px)),
        };
        let file = AppConfigFile {
            camera: Some(CameraConfigFile {
                device: Some(self.camera.device.clone()),
                width: Some(self.camera.width),
                height: Some(self.camera.height),
                fps: Some(self.camera.fps),
            }),
            stream: Some(StreamConfigFile {
                url: Some(self.stream.url.clone()),
                width: Some(self.stream.width),
                height: Some(self.stream.height),
                fps: Some(self.stream.fps),
                bitrate: Some(self.stream.bitrate.clone()),
                encoder: Some(self.stream.encoder.clone()),
            }),
            processing: Some(ProcessingConfigFile {
                brightness_equalization: Some(self.processing.brightness_equalization),
                color_balance: Some(self.processing.color_balance),
                overlap_width_percent,
                overlap_width_px,
                feather: Some(self.processing.feather),
                brightness_mode: Some(self.processing.brightness_mode),
            }),
            calibration_path: Some(self.calibration_path.clone()),
            channel_capacity: Some(self.channel_capacity),
            restart_policy: Some(self.restart_policy),
        };
        let json = serde_json::to_string_pretty(&file)?;
        std::fs::write(path, json + "\n")
            .map_err(|e| anyhow!("failed to write config file {}: {}", path.display(), e))?;
        Ok(())
    }
}

/// Bits per second for `4000k`, `4M`, or a plain integer.
pub fn parse_bitrate(value: &str) -> Result<u64> {
    let value = value.trim();
    let (digits, scale) = match value.char_indices().last() {
        Some((i, 'k' | 'K')) => (&value[..i], 1_000),
        Some((i, 'm' | 'M')) => (&value[..i], 1_000_000),
        _ => (value, 1),
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| anyhow!("bitrate must look like 4000k, 4M or 4000000 (got {value:?})"))?;
    if n == 0 {
        return Err(anyhow!("bitrate must be greater than zero"));
    }
    n.checked_mul(scale)
        .ok_or_else(|| anyhow!("bitrate {value:?} is too large"))
}

fn read_config_file(path: &Path) -> Result<AppConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitrate_forms() -> Result<()> {
        assert_eq!(parse_bitrate("4000k")?, 4_000_000);
        assert_eq!(parse_bitrate("4M")?, 4_000_000);
        assert_eq!(parse_bitrate("4000000")?, 4_000_000);
        assert!(parse_bitrate("fast").is_err());
        assert!(parse_bitrate("0k").is_err());
        assert!(parse_bitrate("k").is_err());
        Ok(())
    }

    #[test]
    fn defaults_are_valid() -> Result<()> {
        let cfg = AppConfig::default();
        cfg.validate()?;
        assert_eq!(cfg.camera.device, "0");
        assert_eq!(cfg.stream.resolution(), Resolution::new(3840, 1920));
        assert_eq!(cfg.processing.overlap, OverlapWidth::Percent(10.0));
        assert_eq!(cfg.restart_policy, RestartPolicy::RestartOnce);
        Ok(())
    }

    #[test]
    fn odd_output_and_wide_overlap_are_rejected() {
        let mut cfg = AppConfig::default();
        cfg.stream.width = 3841;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.processing.overlap = OverlapWidth::Percent(60.0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pixel_overlap_wins_over_percent() {
        let file: AppConfigFile = serde_json::from_str(
            r#"{"processing": {"overlap_width_percent": 5.0, "overlap_width_px": 96}}"#,
        )
        .unwrap();
        let cfg = AppConfig::from_file(file);
        assert_eq!(cfg.processing.overlap, OverlapWidth::Pixels(96));
    }
}
