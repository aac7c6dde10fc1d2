//! Full-size stitch of a synthetic checkerboard: 1920x960 dual fisheye into a
//! 3840x1920 panorama with a 10% seam overlap.

use anyhow::Result;

use panocast::calibration::{CalibrationConfig, Lens, OverlapWidth};
use panocast::frame::{DualFisheyeFrame, PixelFormat, Resolution, CHANNELS};
use panocast::ingest::{render_checkerboard, Checkerboard};
use panocast::remap::{BlendCurve, EquidistantLens, RemapTable};
use panocast::stitch::{bilinear_sample, LensGains, StitchOptions, Stitcher};

const SOURCE: Resolution = Resolution::new(1920, 960);
const OUTPUT: Resolution = Resolution::new(3840, 1920);

fn calibration() -> CalibrationConfig {
    let mut cfg = CalibrationConfig::default_for(SOURCE);
    cfg.overlap = OverlapWidth::Percent(10.0);
    cfg
}

fn capture(cfg: &CalibrationConfig, exposure: [f32; 2]) -> Result<DualFisheyeFrame> {
    let scene = Checkerboard {
        exposure,
        ..Checkerboard::default()
    };
    let data = render_checkerboard(cfg, SOURCE, &scene);
    DualFisheyeFrame::new(data, SOURCE.width, SOURCE.height, PixelFormat::Bgr24, 0)
}

/// Mean absolute per-channel difference between the two gained lens samples
/// over blended pixels within +-60 degrees latitude.
fn seam_difference(table: &RemapTable, frame: &DualFisheyeFrame, gains: LensGains) -> f64 {
    let rows = (OUTPUT.height / 6)..(OUTPUT.height * 5 / 6);
    let mut total = 0.0;
    let mut count = 0usize;
    for v in rows {
        for (u, entry) in table.row(v).iter().enumerate() {
            if !table.in_band(u as u32) {
                continue;
            }
            let (Some(left), Some(right)) = (entry.source(Lens::Left), entry.source(Lens::Right))
            else {
                continue;
            };
            let l = bilinear_sample(frame, left);
            let r = bilinear_sample(frame, right);
            let gl = gains.for_lens(Lens::Left);
            let gr = gains.for_lens(Lens::Right);
            for c in 0..CHANNELS {
                total += (l[c] * gl[c] - r[c] * gr[c]).abs() as f64;
            }
            count += CHANNELS;
        }
    }
    assert!(count > 0, "no blended pixels measured");
    total / count as f64
}

#[test]
fn checkerboard_panorama_is_seamless() -> Result<()> {
    let cfg = calibration();
    let table = RemapTable::build(&cfg, SOURCE, OUTPUT, BlendCurve::Linear)?;

    // 10% of 3840 asks for 18 degrees per side; 200 degree lenses only overlap 10.
    assert!((table.band_width_px() - 3840.0 * 20.0 / 360.0).abs() < 0.5);
    assert_eq!(table.undefined_count(), 0);

    let lenses = Lens::ALL.map(|lens| EquidistantLens::new(lens, *cfg.lens(lens)));
    for v in 0..OUTPUT.height {
        for (u, entry) in table.row(v).iter().enumerate() {
            let mut weight_sum = 0.0f32;
            let mut contributors = 0;
            for (lens, pt, weight) in entry.contributions() {
                let params = cfg.lens(lens);
                let d = lenses[lens.index()].distance_from_center(pt.x as f64, pt.y as f64);
                assert!(d <= params.radius + 1e-3, "({u},{v}) outside {} disk", lens.name());
                weight_sum += weight;
                contributors += 1;
            }
            assert!((weight_sum - 1.0).abs() < 1e-5, "({u},{v}) weights sum to {weight_sum}");
            if !table.in_band(u as u32) {
                assert_eq!(contributors, 1, "({u},{v}) outside the band must have one lens");
                assert!(entry.weight(Lens::Left) == 1.0 || entry.weight(Lens::Right) == 1.0);
            }
        }
    }

    let frame = capture(&cfg, [1.0, 1.0])?;
    let diff = seam_difference(&table, &frame, LensGains::UNITY);
    assert!(diff < 20.0, "seam difference {diff:.2} too large");

    let mut stitcher = Stitcher::default();
    let panorama = stitcher.stitch(&frame, &table)?;
    assert_eq!(panorama.resolution(), OUTPUT);
    // Straight ahead of each lens is lit.
    assert_ne!(panorama.pixel(OUTPUT.width / 2, OUTPUT.height / 2), Some([0, 0, 0]));
    assert_ne!(panorama.pixel(10, OUTPUT.height / 2), Some([0, 0, 0]));
    Ok(())
}

#[test]
fn exposure_mismatch_is_equalized_at_the_seam() -> Result<()> {
    let cfg = calibration();
    let table = RemapTable::build(&cfg, SOURCE, OUTPUT, BlendCurve::Smoothstep)?;
    let frame = capture(&cfg, [0.7, 1.0])?;

    let raw = seam_difference(&table, &frame, LensGains::UNITY);

    let mut stitcher = Stitcher::new(StitchOptions::default());
    stitcher.stitch(&frame, &table)?;
    let gains = stitcher.last_gains();
    assert!(gains.for_lens(Lens::Left)[1] > gains.for_lens(Lens::Right)[1]);
    let corrected = seam_difference(&table, &frame, gains);

    assert!(
        corrected < raw / 2.0,
        "correction did not close the step: raw {raw:.2}, corrected {corrected:.2}"
    );
    Ok(())
}
