//! Lens calibration model and its persistence.
//!
//! The on-disk record is a small JSON object:
//!
//! ```json
//! { "left":  { "cx": 480.0,  "cy": 480.0, "radius": 480.0 },
//!   "right": { "cx": 1440.0, "cy": 480.0, "radius": 480.0 } }
//! ```
//!
//! `rotation` (radians) and `fov_deg` are optional per-lens extensions with
//! defaults of `0` and `200`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::PipelineError;
use crate::frame::Resolution;

pub const DEFAULT_CALIBRATION_PATH: &str = "fisheye_params.json";
pub const DEFAULT_FOV_DEG: f64 = 200.0;
pub const DEFAULT_OVERLAP_PERCENT: f64 = 10.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lens {
    Left,
    Right,
}

impl Lens {
    pub const ALL: [Lens; 2] = [Lens::Left, Lens::Right];

    pub fn index(&self) -> usize {
        match self {
            Lens::Left => 0,
            Lens::Right => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Lens::Left => "left",
            Lens::Right => "right",
        }
    }
}

/// One fisheye lens: image-space center and radius of the image circle, in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LensParams {
    #[serde(rename = "cx")]
    pub center_x: f64,
    #[serde(rename = "cy")]
    pub center_y: f64,
    pub radius: f64,
    /// Roll of the image circle about its center, radians.
    #[serde(default)]
    pub rotation: f64,
    /// Full field of view mapped onto `radius` by the equidistant model.
    #[serde(default = "default_fov_deg")]
    pub fov_deg: f64,
}

fn default_fov_deg() -> f64 {
    DEFAULT_FOV_DEG
}

impl LensParams {
    pub fn new(center_x: f64, center_y: f64, radius: f64) -> Self {
        Self {
            center_x,
            center_y,
            radius,
            rotation: 0.0,
            fov_deg: DEFAULT_FOV_DEG,
        }
    }

    /// Half field of view in radians.
    pub fn half_fov(&self) -> f64 {
        self.fov_deg.to_radians() / 2.0
    }

    pub fn validate(&self, lens: Lens, source: Resolution) -> Result<(), PipelineError> {
        let name = lens.name();
        if !self.radius.is_finite() || self.radius <= 0.0 {
            return Err(PipelineError::CalibrationInvalid(format!(
                "{name} lens radius must be positive, got {}",
                self.radius
            )));
        }
        let inside_x = self.center_x.is_finite()
            && self.center_x >= 0.0
            && self.center_x < source.width as f64;
        let inside_y = self.center_y.is_finite()
            && self.center_y >= 0.0
            && self.center_y < source.height as f64;
        if !inside_x || !inside_y {
            return Err(PipelineError::CalibrationInvalid(format!(
                "{name} lens center ({:.1}, {:.1}) outside {} source frame",
                self.center_x, self.center_y, source
            )));
        }
        if !self.fov_deg.is_finite() || self.fov_deg <= 0.0 || self.fov_deg >= 360.0 {
            return Err(PipelineError::CalibrationInvalid(format!(
                "{name} lens field of view must be within (0, 360) degrees, got {}",
                self.fov_deg
            )));
        }
        if !self.rotation.is_finite() {
            return Err(PipelineError::CalibrationInvalid(format!(
                "{name} lens rotation is not finite"
            )));
        }
        Ok(())
    }
}

/// Seam band width, absolute or relative to the output width.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum OverlapWidth {
    Pixels(u32),
    Percent(f64),
}

impl OverlapWidth {
    pub fn to_pixels(&self, output_width: u32) -> f64 {
        match *self {
            OverlapWidth::Pixels(px) => px as f64,
            OverlapWidth::Percent(pct) => output_width as f64 * pct / 100.0,
        }
    }
}

impl Default for OverlapWidth {
    fn default() -> Self {
        OverlapWidth::Percent(DEFAULT_OVERLAP_PERCENT)
    }
}

/// Both lenses plus the seam band. Treated as an immutable snapshot once handed
/// to the table builder.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibrationConfig {
    pub left: LensParams,
    pub right: LensParams,
    pub overlap: OverlapWidth,
}

impl CalibrationConfig {
    /// Lens circles centered in each half of a side-by-side capture.
    pub fn default_for(source: Resolution) -> Self {
        let half = source.width as f64 / 2.0;
        let cy = source.height as f64 / 2.0;
        let radius = (source.height as f64 / 2.0).min(half / 2.0).max(1.0);
        Self {
            left: LensParams::new(half / 2.0, cy, radius),
            right: LensParams::new(half + half / 2.0, cy, radius),
            overlap: OverlapWidth::default(),
        }
    }

    pub fn lens(&self, lens: Lens) -> &LensParams {
        match lens {
            Lens::Left => &self.left,
            Lens::Right => &self.right,
        }
    }

    pub fn lens_mut(&mut self, lens: Lens) -> &mut LensParams {
        match lens {
            Lens::Left => &mut self.left,
            Lens::Right => &mut self.right,
        }
    }

    pub fn validate(&self, source: Resolution) -> Result<(), PipelineError> {
        self.left.validate(Lens::Left, source)?;
        self.right.validate(Lens::Right, source)?;
        match self.overlap {
            OverlapWidth::Percent(pct) if !(0.0..=100.0).contains(&pct) => {
                Err(PipelineError::CalibrationInvalid(format!(
                    "overlap width must be within 0..=100 percent, got {pct}"
                )))
            }
            _ => Ok(()),
        }
    }

    fn record(&self) -> CalibrationRecord {
        CalibrationRecord {
            left: self.left,
            right: self.right,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CalibrationRecord {
    left: LensParams,
    right: LensParams,
}

/// File-backed store for the two lens parameter sets.
#[derive(Clone, Debug)]
pub struct CalibrationStore {
    path: PathBuf,
}

impl CalibrationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load both lenses. `Ok(None)` when no record has been saved yet.
    pub fn load(&self) -> Result<Option<(LensParams, LensParams)>, PipelineError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.failure(err)),
        };
        let record: CalibrationRecord =
            serde_json::from_str(&raw).map_err(|err| self.failure(err))?;
        Ok(Some((record.left, record.right)))
    }

    /// Saved lenses merged into the defaults for `source`, keeping `overlap`.
    ///
    /// An unreadable record is reported and replaced by the defaults.
    pub fn load_or_default(&self, source: Resolution, overlap: OverlapWidth) -> CalibrationConfig {
        let mut cfg = CalibrationConfig::default_for(source);
        cfg.overlap = overlap;
        match self.load() {
            Ok(Some((left, right))) => {
                log::info!("calibration loaded from {}", self.path.display());
                cfg.left = left;
                cfg.right = right;
            }
            Ok(None) => {
                log::info!(
                    "no calibration at {}, using defaults for {}",
                    self.path.display(),
                    source
                );
            }
            Err(err) => {
                log::warn!("{}; using defaults for {}", err, source);
            }
        }
        cfg
    }

    /// Persist both lenses. Written to a sibling temp file and renamed into place.
    pub fn save(&self, cfg: &CalibrationConfig) -> Result<(), PipelineError> {
        let json = serde_json::to_string_pretty(&cfg.record()).map_err(|err| self.failure(err))?;
        let tmp = self.path.with_extension("json.tmp");
        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        write().map_err(|err| {
            let _ = fs::remove_file(&tmp);
            self.failure(err)
        })?;
        log::info!("calibration saved to {}", self.path.display());
        Ok(())
    }

    fn failure(&self, err: impl std::fmt::Display) -> PipelineError {
        PipelineError::PersistenceFailure {
            path: self.path.clone(),
            reason: err.to_string(),
        }
    }
}

impl Default for CalibrationStore {
    fn default() -> Self {
        Self::new(DEFAULT_CALIBRATION_PATH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE: Resolution = Resolution::new(1920, 960);

    #[test]
    fn save_then_load_reproduces_lenses() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CalibrationStore::new(dir.path().join("fisheye_params.json"));
        let mut cfg = CalibrationConfig::default_for(SOURCE);
        cfg.left.center_x = 481.37;
        cfg.right.radius = 470.125;
        cfg.right.rotation = 0.0125;

        store.save(&cfg)?;
        let (left, right) = store.load()?.expect("saved record");

        assert!((left.center_x - 481.37).abs() < 1e-9);
        assert!((right.radius - 470.125).abs() < 1e-9);
        assert!((right.rotation - 0.0125).abs() < 1e-12);
        assert_eq!(left, cfg.left);
        assert_eq!(right, cfg.right);
        Ok(())
    }

    #[test]
    fn loads_minimal_record_with_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("fisheye_params.json");
        std::fs::write(
            &path,
            r#"{"left": {"cx": 470.0, "cy": 480.0, "radius": 475.5},
                "right": {"cx": 1450.0, "cy": 482.0, "radius": 476.0}}"#,
        )?;
        let (left, right) = CalibrationStore::new(&path).load()?.expect("record");
        assert_eq!(left.center_x, 470.0);
        assert_eq!(right.center_y, 482.0);
        assert_eq!(left.rotation, 0.0);
        assert_eq!(right.fov_deg, DEFAULT_FOV_DEG);
        Ok(())
    }

    #[test]
    fn missing_record_is_not_an_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = CalibrationStore::new(dir.path().join("absent.json"));
        assert!(store.load()?.is_none());
        let cfg = store.load_or_default(SOURCE, OverlapWidth::Pixels(64));
        assert_eq!(cfg.overlap, OverlapWidth::Pixels(64));
        assert_eq!(cfg.left, CalibrationConfig::default_for(SOURCE).left);
        Ok(())
    }

    #[test]
    fn save_into_missing_directory_reports_persistence_failure() {
        let store = CalibrationStore::new("/nonexistent-dir/for/panocast/params.json");
        let err = store
            .save(&CalibrationConfig::default_for(SOURCE))
            .unwrap_err();
        assert!(matches!(err, PipelineError::PersistenceFailure { .. }));
    }

    #[test]
    fn validate_rejects_zero_radius_and_outside_center() {
        let mut cfg = CalibrationConfig::default_for(SOURCE);
        cfg.left.radius = 0.0;
        assert!(matches!(
            cfg.validate(SOURCE),
            Err(PipelineError::CalibrationInvalid(_))
        ));

        let mut cfg = CalibrationConfig::default_for(SOURCE);
        cfg.right.center_x = 1920.0;
        assert!(matches!(
            cfg.validate(SOURCE),
            Err(PipelineError::CalibrationInvalid(_))
        ));

        assert!(CalibrationConfig::default_for(SOURCE).validate(SOURCE).is_ok());
    }

    #[test]
    fn default_lenses_sit_in_each_half() {
        let cfg = CalibrationConfig::default_for(SOURCE);
        assert_eq!(cfg.left.center_x, 480.0);
        assert_eq!(cfg.right.center_x, 1440.0);
        assert_eq!(cfg.left.radius, 480.0);
        assert_eq!(OverlapWidth::Percent(10.0).to_pixels(3840), 384.0);
    }
}
