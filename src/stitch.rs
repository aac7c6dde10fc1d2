//! Per-frame stitching: apply a `RemapTable` to a dual-fisheye capture.
//!
//! Each output pixel is a weighted sum of bilinear samples from its contributing
//! lenses. Photometric correction is expressed as per-lens, per-channel gains
//! applied to the samples before blending:
//!
//! - Brightness equalization scales each lens so both views share the same mean
//!   luminance, measured in the seam bands when they are populated.
//! - Color balance is a gray-world gain per channel per lens.
//!
//! Gains never move pixels, so toggling either correction leaves the geometry
//! untouched.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::calibration::Lens;
use crate::error::PipelineError;
use crate::frame::{DualFisheyeFrame, PanoramaFrame, CHANNELS};
use crate::remap::{RemapTable, SourcePoint};

const MIN_GAIN: f32 = 0.5;
const MAX_GAIN: f32 = 2.0;
/// Stats are gathered from every Nth table entry.
const STATS_STRIDE: usize = 7;
/// Below this many band samples, stats fall back to each lens's whole region.
const MIN_BAND_SAMPLES: usize = 64;

/// How brightness gains evolve from frame to frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BrightnessMode {
    /// Recomputed from scratch on every frame.
    #[default]
    PerFrame,
    /// Exponential moving average; `alpha` is the weight of the newest frame.
    Smoothed { alpha: f32 },
}

pub const DEFAULT_SMOOTHING_ALPHA: f32 = 0.2;

/// `per-frame`, `smoothed`, or `smoothed:<alpha>`.
impl std::str::FromStr for BrightnessMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.split_once(':') {
            None if s == "per-frame" => Ok(BrightnessMode::PerFrame),
            None if s == "smoothed" => Ok(BrightnessMode::Smoothed {
                alpha: DEFAULT_SMOOTHING_ALPHA,
            }),
            Some(("smoothed", alpha)) => {
                let alpha: f32 = alpha
                    .parse()
                    .map_err(|_| anyhow::anyhow!("invalid smoothing alpha '{}'", alpha))?;
                if !(alpha > 0.0 && alpha <= 1.0) {
                    return Err(anyhow::anyhow!("smoothing alpha must be in (0, 1], got {}", alpha));
                }
                Ok(BrightnessMode::Smoothed { alpha })
            }
            _ => Err(anyhow::anyhow!(
                "unknown brightness mode '{}' (expected per-frame or smoothed[:alpha])",
                s
            )),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StitchOptions {
    pub brightness_equalization: bool,
    pub color_balance: bool,
    pub brightness_mode: BrightnessMode,
}

impl Default for StitchOptions {
    fn default() -> Self {
        Self {
            brightness_equalization: true,
            color_balance: true,
            brightness_mode: BrightnessMode::PerFrame,
        }
    }
}

/// Channel gains per lens, indexed by `Lens::index()`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LensGains(pub [[f32; CHANNELS]; 2]);

impl LensGains {
    pub const UNITY: LensGains = LensGains([[1.0; CHANNELS]; 2]);

    pub fn for_lens(&self, lens: Lens) -> [f32; CHANNELS] {
        self.0[lens.index()]
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct ChannelMeans {
    sum: [f64; CHANNELS],
    count: usize,
}

impl ChannelMeans {
    fn add(&mut self, px: [f32; CHANNELS]) {
        for c in 0..CHANNELS {
            self.sum[c] += px[c] as f64;
        }
        self.count += 1;
    }

    fn mean(&self) -> Option<[f64; CHANNELS]> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        Some([self.sum[0] / n, self.sum[1] / n, self.sum[2] / n])
    }
}

/// Stateful only for smoothed brightness; the table is never mutated.
#[derive(Debug)]
pub struct Stitcher {
    options: StitchOptions,
    smoothed_brightness: Option<[f32; 2]>,
    last_gains: LensGains,
    frames_stitched: u64,
}

impl Stitcher {
    pub fn new(options: StitchOptions) -> Self {
        Self {
            options,
            smoothed_brightness: None,
            last_gains: LensGains::UNITY,
            frames_stitched: 0,
        }
    }

    pub fn options(&self) -> StitchOptions {
        self.options
    }

    pub fn set_options(&mut self, options: StitchOptions) {
        if options.brightness_mode != self.options.brightness_mode {
            self.smoothed_brightness = None;
        }
        self.options = options;
    }

    /// Gains applied to the most recent frame.
    pub fn last_gains(&self) -> LensGains {
        self.last_gains
    }

    pub fn frames_stitched(&self) -> u64 {
        self.frames_stitched
    }

    /// Produce the panorama for `frame`. Fails with `ShapeMismatch` when the
    /// frame is not the size the table was built for.
    pub fn stitch(
        &mut self,
        frame: &DualFisheyeFrame,
        table: &RemapTable,
    ) -> Result<PanoramaFrame, PipelineError> {
        let expected = table.source();
        if frame.resolution() != expected {
            return Err(PipelineError::ShapeMismatch {
                expected_width: expected.width,
                expected_height: expected.height,
                width: frame.width,
                height: frame.height,
            });
        }

        let gains = self.compute_gains(frame, table);
        let output = table.output();
        let row_bytes = output.width as usize * CHANNELS;
        let mut data = vec![0u8; output.pixel_count() * CHANNELS];

        data.par_chunks_mut(row_bytes)
            .enumerate()
            .for_each(|(v, row)| {
                for (u, entry) in table.row(v as u32).iter().enumerate() {
                    let mut acc = [0.0f32; CHANNELS];
                    for (lens, pt, weight) in entry.contributions() {
                        let sample = bilinear_sample(frame, pt);
                        let gain = gains.for_lens(lens);
                        for c in 0..CHANNELS {
                            acc[c] += weight * sample[c] * gain[c];
                        }
                    }
                    let px = &mut row[u * CHANNELS..(u + 1) * CHANNELS];
                    for c in 0..CHANNELS {
                        px[c] = acc[c].round().clamp(0.0, 255.0) as u8;
                    }
                }
            });

        self.last_gains = gains;
        self.frames_stitched += 1;

        Ok(PanoramaFrame::assemble(
            data,
            output,
            frame.format,
            frame.seq,
            frame.captured_at,
        ))
    }

    fn compute_gains(&mut self, frame: &DualFisheyeFrame, table: &RemapTable) -> LensGains {
        let opts = self.options;
        if !opts.brightness_equalization && !opts.color_balance {
            self.smoothed_brightness = None;
            return LensGains::UNITY;
        }

        let means = lens_means(frame, table);
        let luma_weights = frame.format.luma_weights();
        let mut gains = LensGains::UNITY;

        if opts.color_balance {
            for lens in Lens::ALL {
                if let Some(mean) = means[lens.index()] {
                    gains.0[lens.index()] = gray_world_gains(mean);
                }
            }
        }

        if opts.brightness_equalization {
            let measured = match (means[0], means[1]) {
                (Some(left), Some(right)) => {
                    // Luma after color gains, so the two corrections compose.
                    let luma = |mean: [f64; CHANNELS], gain: [f32; CHANNELS]| -> f64 {
                        (0..CHANNELS)
                            .map(|c| mean[c] * gain[c] as f64 * luma_weights[c] as f64)
                            .sum()
                    };
                    let l = luma(left, gains.0[0]);
                    let r = luma(right, gains.0[1]);
                    if l < 1.0 || r < 1.0 {
                        [1.0, 1.0]
                    } else {
                        let target = (l + r) / 2.0;
                        [clamp_gain(target / l), clamp_gain(target / r)]
                    }
                }
                _ => [1.0, 1.0],
            };
            let brightness = match opts.brightness_mode {
                BrightnessMode::PerFrame => measured,
                BrightnessMode::Smoothed { alpha } => {
                    let alpha = alpha.clamp(0.0, 1.0);
                    let next = match self.smoothed_brightness {
                        Some(prev) => [
                            prev[0] + alpha * (measured[0] - prev[0]),
                            prev[1] + alpha * (measured[1] - prev[1]),
                        ],
                        None => measured,
                    };
                    self.smoothed_brightness = Some(next);
                    next
                }
            };
            for lens in Lens::ALL {
                for gain in gains.0[lens.index()].iter_mut() {
                    *gain *= brightness[lens.index()];
                }
            }
        }

        gains
    }
}

impl Default for Stitcher {
    fn default() -> Self {
        Self::new(StitchOptions::default())
    }
}

/// Mean channel values per lens, taken from the seam bands when they are
/// populated and from each lens's whole contribution otherwise.
fn lens_means(frame: &DualFisheyeFrame, table: &RemapTable) -> [Option<[f64; CHANNELS]>; 2] {
    let mut band = [ChannelMeans::default(); 2];
    let mut whole = [ChannelMeans::default(); 2];
    for entry in table.entries().iter().step_by(STATS_STRIDE) {
        let blended = entry.is_blended();
        for (lens, pt, _) in entry.contributions() {
            let sample = bilinear_sample(frame, pt);
            whole[lens.index()].add(sample);
            if blended {
                band[lens.index()].add(sample);
            }
        }
    }
    let use_band = band.iter().all(|m| m.count >= MIN_BAND_SAMPLES);
    let pick = if use_band { &band } else { &whole };
    [pick[0].mean(), pick[1].mean()]
}

fn gray_world_gains(mean: [f64; CHANNELS]) -> [f32; CHANNELS] {
    let gray = mean.iter().sum::<f64>() / CHANNELS as f64;
    let mut gains = [1.0f32; CHANNELS];
    if gray < 1.0 {
        return gains;
    }
    for c in 0..CHANNELS {
        gains[c] = if mean[c] < 1.0 {
            MAX_GAIN
        } else {
            clamp_gain(gray / mean[c])
        };
    }
    gains
}

fn clamp_gain(gain: f64) -> f32 {
    (gain as f32).clamp(MIN_GAIN, MAX_GAIN)
}

/// Bilinear read at a fractional source coordinate; edges are clamped.
pub fn bilinear_sample(frame: &DualFisheyeFrame, pt: SourcePoint) -> [f32; CHANNELS] {
    let w = frame.width as usize;
    let h = frame.height as usize;
    let pixels = frame.pixels();

    let x = pt.x.clamp(0.0, (w - 1) as f32);
    let y = pt.y.clamp(0.0, (h - 1) as f32);
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let at = |xx: usize, yy: usize, c: usize| pixels[(yy * w + xx) * CHANNELS + c] as f32;
    let mut out = [0.0f32; CHANNELS];
    for (c, value) in out.iter_mut().enumerate() {
        let top = at(x0, y0, c) * (1.0 - fx) + at(x1, y0, c) * fx;
        let bottom = at(x0, y1, c) * (1.0 - fx) + at(x1, y1, c) * fx;
        *value = top * (1.0 - fy) + bottom * fy;
    }
    out
}
