//! Synthetic dual-fisheye source (`stub://` devices).
//!
//! Renders a longitude/latitude checkerboard as the two lenses of the given
//! calibration would see it, so the stitched output is a regular grid whenever
//! the calibration matches. Each lens can carry its own exposure gain to
//! exercise brightness equalization.

use anyhow::Result;
use rayon::prelude::*;
use std::time::{Duration, Instant};

use super::{CameraConfig, CaptureStats};
use crate::calibration::{CalibrationConfig, Lens};
use crate::frame::{DualFisheyeFrame, PixelFormat, Resolution, CHANNELS};
use crate::remap::{direction_lonlat, EquidistantLens};

pub const DEFAULT_SQUARE_DEG: f64 = 10.0;
const LIGHT: [f32; CHANNELS] = [200.0, 190.0, 180.0];
const DARK: [f32; CHANNELS] = [40.0, 50.0, 60.0];

/// Scene parameters for `render_checkerboard`.
#[derive(Clone, Copy, Debug)]
pub struct Checkerboard {
    /// Square edge in degrees of longitude/latitude.
    pub square_deg: f64,
    /// Per-lens exposure multiplier, indexed by `Lens::index()`.
    pub exposure: [f32; 2],
}

impl Default for Checkerboard {
    fn default() -> Self {
        Self {
            square_deg: DEFAULT_SQUARE_DEG,
            exposure: [1.0, 1.0],
        }
    }
}

/// Render one BGR dual-fisheye image. Pixels outside both image circles are black.
pub fn render_checkerboard(
    calibration: &CalibrationConfig,
    source: Resolution,
    scene: &Checkerboard,
) -> Vec<u8> {
    let lenses = Lens::ALL.map(|lens| EquidistantLens::new(lens, *calibration.lens(lens)));
    let square = scene.square_deg.to_radians().max(1e-6);
    let width = source.width as usize;
    let half = source.width as f64 / 2.0;
    let mut data = vec![0u8; source.pixel_count() * CHANNELS];

    data.par_chunks_mut(width * CHANNELS)
        .enumerate()
        .for_each(|(y, row)| {
            for (x, px) in row.chunks_exact_mut(CHANNELS).enumerate() {
                // Integer pixel coordinates, the convention remap sample points use.
                let (fx, fy) = (x as f64, y as f64);
                let lens = if fx < half { &lenses[0] } else { &lenses[1] };
                let Some(dir) = lens.unproject(fx, fy) else {
                    continue;
                };
                let (lon, lat) = direction_lonlat(dir);
                let cell = (lon / square).floor() as i64 + (lat / square).floor() as i64;
                let base = if cell.rem_euclid(2) == 0 { LIGHT } else { DARK };
                let gain = scene.exposure[if fx < half { 0 } else { 1 }];
                for (dst, value) in px.iter_mut().zip(base) {
                    *dst = (value * gain).round().clamp(0.0, 255.0) as u8;
                }
            }
        });
    data
}

pub(super) struct SyntheticSource {
    config: CameraConfig,
    image: Vec<u8>,
    frame_count: u64,
    next_due: Option<Instant>,
}

impl SyntheticSource {
    pub(super) fn new(config: CameraConfig, calibration: &CalibrationConfig) -> Self {
        // Lens circles drawn with this calibration, so a stitched stub is seamless.
        let image = render_checkerboard(calibration, config.resolution, &Checkerboard::default());
        Self {
            config,
            image,
            frame_count: 0,
            next_due: None,
        }
    }

    pub(super) fn connect(&mut self) -> Result<()> {
        log::info!(
            "CameraSource: connected to {} ({}, synthetic)",
            self.config.device,
            self.config.resolution
        );
        Ok(())
    }

    pub(super) fn next_frame(&mut self) -> Result<DualFisheyeFrame> {
        if self.config.fps > 0 {
            let interval = Duration::from_secs_f64(1.0 / self.config.fps as f64);
            let now = Instant::now();
            let due = self.next_due.unwrap_or(now);
            if due > now {
                std::thread::sleep(due - now);
            }
            self.next_due = Some(Instant::now().max(due + interval));
        }

        let seq = self.frame_count;
        self.frame_count += 1;
        DualFisheyeFrame::new(
            self.image.clone(),
            self.config.resolution.width,
            self.config.resolution.height,
            PixelFormat::Bgr24,
            seq,
        )
    }

    pub(super) fn stats(&self) -> CaptureStats {
        CaptureStats {
            frames_captured: self.frame_count,
            device: self.config.device.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: Resolution = Resolution::new(320, 160);

    #[test]
    fn lens_centers_are_lit_and_corners_black() {
        let cfg = CalibrationConfig::default_for(SOURCE);
        let data = render_checkerboard(&cfg, SOURCE, &Checkerboard::default());
        let at = |x: usize, y: usize| &data[(y * 320 + x) * 3..(y * 320 + x) * 3 + 3];
        assert_eq!(at(0, 0), &[0, 0, 0]);
        assert_ne!(at(80, 80), &[0, 0, 0]);
        assert_ne!(at(240, 80), &[0, 0, 0]);
    }

    #[test]
    fn exposure_scales_one_lens() {
        let cfg = CalibrationConfig::default_for(SOURCE);
        let scene = Checkerboard {
            exposure: [0.5, 1.0],
            ..Checkerboard::default()
        };
        let dim = render_checkerboard(&cfg, SOURCE, &scene);
        let full = render_checkerboard(&cfg, SOURCE, &Checkerboard::default());
        let left = (80 * 320 + 80) * 3;
        let right = (80 * 320 + 240) * 3;
        assert_eq!(dim[left] as u32, (full[left] as f32 * 0.5).round() as u32);
        assert_eq!(dim[right], full[right]);
    }
}
