//! Dual-fisheye → equirectangular remap table.
//!
//! The table is computed once per calibration and holds, for every output pixel,
//! the fractional source coordinate in each contributing lens and the blend
//! weight between them. It is immutable after construction; a calibration
//! change produces a brand-new table that is swapped in through `SharedTable`.
//!
//! Geometry: output column `u` maps to longitude `2π·u/W − π`, row `v` to latitude
//! `π/2 − π·v/H`. The right lens looks along longitude 0 and owns `|lon| ≤ π/2`,
//! the left lens looks along longitude π and owns the rest. Seams sit at
//! longitude ±π/2 (columns `W/4` and `3W/4`).
//!
//! Performance notes:
//! - Weights depend only on the column and are computed once per column
//! - Rows are built in parallel with rayon

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_PI_2, PI};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::calibration::{CalibrationConfig, Lens, LensParams};
use crate::error::PipelineError;
use crate::frame::Resolution;

/// Shape of the feather ramp across a seam band.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlendCurve {
    #[default]
    Linear,
    Smoothstep,
}

impl BlendCurve {
    /// Map `t` in `[0, 1]` to a weight in `[0, 1]`, monotonic, fixing both ends.
    pub fn apply(&self, t: f64) -> f64 {
        let t = t.clamp(0.0, 1.0);
        match self {
            BlendCurve::Linear => t,
            BlendCurve::Smoothstep => t * t * (3.0 - 2.0 * t),
        }
    }
}

impl std::str::FromStr for BlendCurve {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "linear" => Ok(BlendCurve::Linear),
            "smoothstep" => Ok(BlendCurve::Smoothstep),
            other => Err(anyhow::anyhow!(
                "unknown feather curve '{}' (expected linear or smoothstep)",
                other
            )),
        }
    }
}

/// Fractional pixel coordinate in the dual-fisheye source frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SourcePoint {
    pub x: f32,
    pub y: f32,
}

/// Per-output-pixel mapping.
///
/// A lens contributes when its point is `Some`. With two contributors the
/// weights are `left_weight` and `1 - left_weight`; with one, that lens has
/// weight 1. With none the pixel is undefined and rendered black.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RemapEntry {
    pub left: Option<SourcePoint>,
    pub right: Option<SourcePoint>,
    pub left_weight: f32,
}

impl RemapEntry {
    pub const UNDEFINED: RemapEntry = RemapEntry {
        left: None,
        right: None,
        left_weight: 0.0,
    };

    pub fn is_defined(&self) -> bool {
        self.left.is_some() || self.right.is_some()
    }

    pub fn is_blended(&self) -> bool {
        self.left.is_some() && self.right.is_some()
    }

    pub fn source(&self, lens: Lens) -> Option<SourcePoint> {
        match lens {
            Lens::Left => self.left,
            Lens::Right => self.right,
        }
    }

    /// Weight of `lens`, zero when it does not contribute.
    pub fn weight(&self, lens: Lens) -> f32 {
        match (lens, self.left.is_some(), self.right.is_some()) {
            (Lens::Left, true, true) => self.left_weight,
            (Lens::Right, true, true) => 1.0 - self.left_weight,
            (Lens::Left, true, false) | (Lens::Right, false, true) => 1.0,
            _ => 0.0,
        }
    }

    /// Contributing lenses with their source point and weight.
    pub fn contributions(&self) -> impl Iterator<Item = (Lens, SourcePoint, f32)> + '_ {
        Lens::ALL
            .into_iter()
            .filter_map(move |lens| self.source(lens).map(|pt| (lens, pt, self.weight(lens))))
    }
}

// ----------------------------------------------------------------------------
// Lens model
// ----------------------------------------------------------------------------

/// Equidistant fisheye: angle from the optical axis maps linearly to distance
/// from the image-circle center, `fov/2` landing on `radius`.
#[derive(Clone, Copy, Debug)]
pub struct EquidistantLens {
    lens: Lens,
    params: LensParams,
}

impl EquidistantLens {
    pub fn new(lens: Lens, params: LensParams) -> Self {
        Self { lens, params }
    }

    /// World direction → lens-local `(axis, image-right, image-up)` components.
    fn to_local(&self, dir: [f64; 3]) -> [f64; 3] {
        match self.lens {
            Lens::Right => dir,
            Lens::Left => [-dir[0], -dir[1], dir[2]],
        }
    }

    fn to_world(&self, local: [f64; 3]) -> [f64; 3] {
        // The axis flip is its own inverse.
        self.to_local(local)
    }

    /// Project a unit direction into the source frame. `None` when the direction
    /// falls outside the image circle.
    pub fn project(&self, dir: [f64; 3]) -> Option<(f64, f64)> {
        let p = &self.params;
        let [a, b, c] = self.to_local(dir);
        let theta = a.clamp(-1.0, 1.0).acos();
        let rho = p.radius * theta / p.half_fov();
        if rho > p.radius {
            return None;
        }
        let planar = b.hypot(c);
        let (dx, dy) = if planar < 1e-12 {
            (0.0, 0.0)
        } else {
            (rho * b / planar, -rho * c / planar)
        };
        let (sin_r, cos_r) = p.rotation.sin_cos();
        let rx = dx * cos_r - dy * sin_r;
        let ry = dx * sin_r + dy * cos_r;
        Some((p.center_x + rx, p.center_y + ry))
    }

    /// Inverse of `project`: source pixel → unit world direction.
    pub fn unproject(&self, x: f64, y: f64) -> Option<[f64; 3]> {
        let p = &self.params;
        let (dx, dy) = (x - p.center_x, y - p.center_y);
        let (sin_r, cos_r) = p.rotation.sin_cos();
        let ux = dx * cos_r + dy * sin_r;
        let uy = -dx * sin_r + dy * cos_r;
        let rho = ux.hypot(uy);
        if rho > p.radius {
            return None;
        }
        let theta = rho / p.radius * p.half_fov();
        let (sin_t, cos_t) = theta.sin_cos();
        let local = if rho < 1e-12 {
            [1.0, 0.0, 0.0]
        } else {
            [cos_t, sin_t * ux / rho, -sin_t * uy / rho]
        };
        Some(self.to_world(local))
    }

    /// Distance of a source point from the image-circle center.
    pub fn distance_from_center(&self, x: f64, y: f64) -> f64 {
        (x - self.params.center_x).hypot(y - self.params.center_y)
    }
}

/// Unit direction of an equirectangular output pixel.
pub fn equirect_direction(u: f64, v: f64, output: Resolution) -> [f64; 3] {
    let lon = 2.0 * PI * u / output.width as f64 - PI;
    let lat = FRAC_PI_2 - PI * v / output.height as f64;
    lonlat_direction(lon, lat)
}

pub fn lonlat_direction(lon: f64, lat: f64) -> [f64; 3] {
    let (sin_lat, cos_lat) = lat.sin_cos();
    let (sin_lon, cos_lon) = lon.sin_cos();
    [cos_lat * cos_lon, cos_lat * sin_lon, sin_lat]
}

/// `(longitude, latitude)` of a unit direction, radians.
pub fn direction_lonlat(dir: [f64; 3]) -> (f64, f64) {
    let lon = dir[1].atan2(dir[0]);
    let lat = dir[2].clamp(-1.0, 1.0).asin();
    (lon, lat)
}

// ----------------------------------------------------------------------------
// Table
// ----------------------------------------------------------------------------

/// Precomputed per-output-pixel lookup.
#[derive(Clone, Debug, PartialEq)]
pub struct RemapTable {
    source: Resolution,
    output: Resolution,
    /// Half-width of the blend band actually used, radians of longitude.
    half_band: f64,
    requested_half_band: f64,
    entries: Vec<RemapEntry>,
}

impl RemapTable {
    /// Build the table for `calibration`. Pure and deterministic.
    pub fn build(
        calibration: &CalibrationConfig,
        source: Resolution,
        output: Resolution,
        curve: BlendCurve,
    ) -> Result<Self, PipelineError> {
        if source.is_empty() || output.is_empty() {
            return Err(PipelineError::CalibrationInvalid(format!(
                "empty frame geometry: source {}, output {}",
                source, output
            )));
        }
        calibration.validate(source)?;

        let (requested_half_band, half_band) = effective_half_band(calibration, output);
        let column_weights: Vec<f64> = (0..output.width)
            .map(|u| right_weight(u, output, half_band, curve))
            .collect();

        let left = EquidistantLens::new(Lens::Left, calibration.left);
        let right = EquidistantLens::new(Lens::Right, calibration.right);
        let width = output.width as usize;
        let mut entries = vec![RemapEntry::UNDEFINED; output.pixel_count()];

        entries
            .par_chunks_mut(width)
            .enumerate()
            .for_each(|(v, row)| {
                for (u, entry) in row.iter_mut().enumerate() {
                    let dir = equirect_direction(u as f64, v as f64, output);
                    let w_right = column_weights[u];
                    let right_pt = if w_right > 0.0 {
                        sample_point(&right, dir, source)
                    } else {
                        None
                    };
                    let left_pt = if w_right < 1.0 {
                        sample_point(&left, dir, source)
                    } else {
                        None
                    };
                    let left_weight = match (left_pt, right_pt) {
                        (Some(_), Some(_)) => (1.0 - w_right) as f32,
                        (Some(_), None) => 1.0,
                        _ => 0.0,
                    };
                    *entry = RemapEntry {
                        left: left_pt,
                        right: right_pt,
                        left_weight,
                    };
                }
            });

        Ok(Self {
            source,
            output,
            half_band,
            requested_half_band,
            entries,
        })
    }

    pub fn source(&self) -> Resolution {
        self.source
    }

    pub fn output(&self) -> Resolution {
        self.output
    }

    pub fn entries(&self) -> &[RemapEntry] {
        &self.entries
    }

    /// Row `v` of the table.
    pub fn row(&self, v: u32) -> &[RemapEntry] {
        let width = self.output.width as usize;
        let start = v as usize * width;
        &self.entries[start..start + width]
    }

    pub fn entry(&self, u: u32, v: u32) -> Option<&RemapEntry> {
        if u >= self.output.width || v >= self.output.height {
            return None;
        }
        self.entries
            .get(v as usize * self.output.width as usize + u as usize)
    }

    /// Width of each blend band after clamping, in output pixels.
    pub fn band_width_px(&self) -> f64 {
        2.0 * self.half_band * self.output.width as f64 / (2.0 * PI)
    }

    /// True when the configured overlap was wider than the lenses allow.
    pub fn band_clamped(&self) -> bool {
        self.requested_half_band > self.half_band
    }

    /// Whether column `u` lies inside a seam band.
    pub fn in_band(&self, u: u32) -> bool {
        let s = seam_offset(u, self.output);
        self.half_band > 0.0 && s.abs() < self.half_band
    }

    pub fn undefined_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_defined()).count()
    }
}

/// Signed longitude distance from the nearest seam: negative on the right
/// lens's side, positive on the left lens's side.
fn seam_offset(u: u32, output: Resolution) -> f64 {
    let lon = 2.0 * PI * u as f64 / output.width as f64 - PI;
    lon.abs() - FRAC_PI_2
}

fn right_weight(u: u32, output: Resolution, half_band: f64, curve: BlendCurve) -> f64 {
    let s = seam_offset(u, output);
    if half_band <= 0.0 {
        return if s <= 0.0 { 1.0 } else { 0.0 };
    }
    curve.apply((half_band - s) / (2.0 * half_band))
}

/// Requested half band and the one actually used, clamped to what both
/// lenses can see past their hemisphere.
fn effective_half_band(calibration: &CalibrationConfig, output: Resolution) -> (f64, f64) {
    let requested = calibration.overlap.to_pixels(output.width).max(0.0) * PI / output.width as f64;
    let available = (calibration.left.half_fov().min(calibration.right.half_fov()) - FRAC_PI_2)
        .max(0.0);
    if requested > available {
        log::debug!(
            "seam band of {:.1}° exceeds lens overlap of {:.1}°, clamping",
            2.0 * requested.to_degrees(),
            2.0 * available.to_degrees()
        );
        (requested, available)
    } else {
        (requested, requested)
    }
}

/// Projected point when it lands inside both the image circle and the frame.
fn sample_point(lens: &EquidistantLens, dir: [f64; 3], source: Resolution) -> Option<SourcePoint> {
    let (x, y) = lens.project(dir)?;
    let max_x = (source.width - 1) as f64;
    let max_y = (source.height - 1) as f64;
    if !(0.0..=max_x).contains(&x) || !(0.0..=max_y).contains(&y) {
        return None;
    }
    Some(SourcePoint {
        x: x as f32,
        y: y as f32,
    })
}

// ----------------------------------------------------------------------------
// SharedTable: copy-on-write handle
// ----------------------------------------------------------------------------

/// The current table, swapped wholesale on rebuild.
///
/// Readers take an `Arc` snapshot once per frame and never observe a partial table.
#[derive(Debug)]
pub struct SharedTable {
    current: RwLock<Arc<RemapTable>>,
    version: AtomicU64,
}

impl SharedTable {
    pub fn new(table: RemapTable) -> Self {
        Self {
            current: RwLock::new(Arc::new(table)),
            version: AtomicU64::new(1),
        }
    }

    pub fn load(&self) -> Arc<RemapTable> {
        let guard = self
            .current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&guard)
    }

    /// Install a freshly built table; returns the new version.
    pub fn swap(&self, table: RemapTable) -> u64 {
        let table = Arc::new(table);
        let mut guard = self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = table;
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::OverlapWidth;

    const SOURCE: Resolution = Resolution::new(640, 320);
    const OUTPUT: Resolution = Resolution::new(720, 360);

    fn calibration() -> CalibrationConfig {
        CalibrationConfig::default_for(SOURCE)
    }

    #[test]
    fn project_unproject_round_trip() {
        let mut params = calibration().right;
        params.rotation = 0.1;
        let lens = EquidistantLens::new(Lens::Right, params);
        for &(lon, lat) in &[(0.0, 0.0), (0.5, 0.3), (-1.2, -0.4), (1.7, 0.1)] {
            let dir = lonlat_direction(lon, lat);
            let (x, y) = lens.project(dir).expect("inside image circle");
            let back = lens.unproject(x, y).expect("inside image circle");
            for i in 0..3 {
                assert!((dir[i] - back[i]).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn optical_axes_hit_lens_centers() {
        let cfg = calibration();
        let right = EquidistantLens::new(Lens::Right, cfg.right);
        let left = EquidistantLens::new(Lens::Left, cfg.left);
        let (x, y) = right.project([1.0, 0.0, 0.0]).unwrap();
        assert!((x - cfg.right.center_x).abs() < 1e-9 && (y - cfg.right.center_y).abs() < 1e-9);
        let (x, y) = left.project([-1.0, 0.0, 0.0]).unwrap();
        assert!((x - cfg.left.center_x).abs() < 1e-9 && (y - cfg.left.center_y).abs() < 1e-9);
        // Straight up lands above the center in both lenses.
        let (_, y) = right.project([0.0, 0.0, 1.0]).unwrap();
        assert!(y < cfg.right.center_y);
    }

    #[test]
    fn contributing_points_lie_inside_their_disk_and_weights_sum_to_one() -> anyhow::Result<()> {
        let cfg = calibration();
        let table = RemapTable::build(&cfg, SOURCE, OUTPUT, BlendCurve::Linear)?;
        for entry in table.entries() {
            let mut total = 0.0f32;
            for (lens, pt, weight) in entry.contributions() {
                let model = EquidistantLens::new(lens, *cfg.lens(lens));
                let dist = model.distance_from_center(pt.x as f64, pt.y as f64);
                assert!(dist <= cfg.lens(lens).radius + 1e-3, "{dist} outside disk");
                assert!((0.0..=1.0).contains(&weight));
                total += weight;
            }
            if entry.is_defined() {
                assert!((total - 1.0).abs() < 1e-6);
            }
        }
        Ok(())
    }

    #[test]
    fn rebuild_is_deterministic() -> anyhow::Result<()> {
        let cfg = calibration();
        let a = RemapTable::build(&cfg, SOURCE, OUTPUT, BlendCurve::Smoothstep)?;
        let b = RemapTable::build(&cfg, SOURCE, OUTPUT, BlendCurve::Smoothstep)?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn band_is_clamped_to_available_overlap() -> anyhow::Result<()> {
        let mut cfg = calibration();
        // 40% of the width is a 144° band; 200° lenses only overlap by 20°.
        cfg.overlap = OverlapWidth::Percent(40.0);
        let table = RemapTable::build(&cfg, SOURCE, OUTPUT, BlendCurve::Linear)?;
        let expected = 20.0 / 360.0 * OUTPUT.width as f64;
        assert!((table.band_width_px() - expected).abs() < 1e-6);
        assert!(table.band_clamped());

        cfg.overlap = OverlapWidth::Pixels(8);
        let narrow = RemapTable::build(&cfg, SOURCE, OUTPUT, BlendCurve::Linear)?;
        assert!(!narrow.band_clamped());
        assert!((narrow.band_width_px() - 8.0).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn weights_ramp_monotonically_across_seam() -> anyhow::Result<()> {
        let cfg = calibration();
        let table = RemapTable::build(&cfg, SOURCE, OUTPUT, BlendCurve::Linear)?;
        let v = OUTPUT.height / 2;
        // Seam at 3W/4: right lens on the left of it, left lens beyond.
        let seam = OUTPUT.width * 3 / 4;
        let mut last = f32::MAX;
        for u in seam - 30..seam + 30 {
            let w = table.entry(u, v).unwrap().weight(Lens::Right);
            assert!(w <= last + 1e-6);
            last = w;
        }
        assert_eq!(table.entry(seam - 30, v).unwrap().weight(Lens::Right), 1.0);
        assert_eq!(table.entry(seam + 30, v).unwrap().weight(Lens::Left), 1.0);
        Ok(())
    }

    #[test]
    fn zero_overlap_gives_hard_seam() -> anyhow::Result<()> {
        let mut cfg = calibration();
        cfg.overlap = OverlapWidth::Pixels(0);
        let table = RemapTable::build(&cfg, SOURCE, OUTPUT, BlendCurve::Linear)?;
        assert!(table.entries().iter().all(|e| !e.is_blended()));
        Ok(())
    }

    #[test]
    fn narrow_lenses_leave_undefined_pixels() -> anyhow::Result<()> {
        let mut cfg = calibration();
        cfg.left.fov_deg = 120.0;
        cfg.right.fov_deg = 120.0;
        let table = RemapTable::build(&cfg, SOURCE, OUTPUT, BlendCurve::Linear)?;
        assert!(table.undefined_count() > 0);
        Ok(())
    }

    #[test]
    fn zero_radius_is_rejected() {
        let mut cfg = calibration();
        cfg.right.radius = 0.0;
        let err = RemapTable::build(&cfg, SOURCE, OUTPUT, BlendCurve::Linear).unwrap_err();
        assert!(matches!(err, PipelineError::CalibrationInvalid(_)));
    }

    #[test]
    fn shared_table_swaps_whole_snapshots() -> anyhow::Result<()> {
        let cfg = calibration();
        let shared = SharedTable::new(RemapTable::build(&cfg, SOURCE, OUTPUT, BlendCurve::Linear)?);
        let before = shared.load();
        let mut moved = cfg;
        moved.left.center_x += 4.0;
        let version = shared.swap(RemapTable::build(&moved, SOURCE, OUTPUT, BlendCurve::Linear)?);
        assert_eq!(version, 2);
        assert_eq!(shared.version(), 2);
        assert_ne!(*before, *shared.load());
        Ok(())
    }
}
