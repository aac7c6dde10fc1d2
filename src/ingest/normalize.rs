//! Conversion of device buffers to interleaved BGR.

use anyhow::{anyhow, Result};
use rayon::prelude::*;

/// Buffer layouts a capture device may hand us.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureFormat {
    Bgr24,
    Rgb24,
    /// Packed 4:2:2, `Y0 U Y1 V`.
    Yuyv,
    /// Planar Y followed by interleaved UV at quarter resolution.
    Nv12,
}

impl CaptureFormat {
    /// Map a V4L2 fourcc to a supported layout.
    pub fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
        match fourcc {
            b"BGR3" => Some(Self::Bgr24),
            b"RGB3" => Some(Self::Rgb24),
            b"YUYV" => Some(Self::Yuyv),
            b"NV12" => Some(Self::Nv12),
            _ => None,
        }
    }

    /// Bytes of image data for one frame, ignoring any driver padding.
    pub(crate) fn expected_len(&self, width: u32, height: u32) -> Option<usize> {
        let pixels = (width as usize).checked_mul(height as usize)?;
        match self {
            Self::Bgr24 | Self::Rgb24 => pixels.checked_mul(3),
            Self::Yuyv => pixels.checked_mul(2),
            Self::Nv12 => pixels.checked_add(pixels / 2),
        }
    }
}

pub fn normalize_to_bgr(
    pixels: &[u8],
    width: u32,
    height: u32,
    format: CaptureFormat,
) -> Result<Vec<u8>> {
    let subsampled = matches!(format, CaptureFormat::Yuyv | CaptureFormat::Nv12);
    if subsampled && (width % 2 != 0 || (format == CaptureFormat::Nv12 && height % 2 != 0)) {
        return Err(anyhow!("{:?} needs even dimensions, got {}x{}", format, width, height));
    }
    let expected = format
        .expected_len(width, height)
        .ok_or_else(|| anyhow!("{:?} frame dimensions overflow", format))?;
    if pixels.len() != expected {
        return Err(anyhow!(
            "{:?} frame length mismatch: expected {}, got {}",
            format,
            expected,
            pixels.len()
        ));
    }

    match format {
        CaptureFormat::Bgr24 => Ok(pixels.to_vec()),
        CaptureFormat::Rgb24 => Ok(pixels
            .chunks_exact(3)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect()),
        CaptureFormat::Yuyv => Ok(yuyv_to_bgr(pixels)),
        CaptureFormat::Nv12 => Ok(nv12_to_bgr(pixels, width as usize, height as usize)),
    }
}

fn yuyv_to_bgr(pixels: &[u8]) -> Vec<u8> {
    let mut bgr = Vec::with_capacity(pixels.len() / 2 * 3);
    for quad in pixels.chunks_exact(4) {
        let u = quad[1] as f32 - 128.0;
        let v = quad[3] as f32 - 128.0;
        bgr.extend_from_slice(&yuv_to_bgr(quad[0] as f32, u, v));
        bgr.extend_from_slice(&yuv_to_bgr(quad[2] as f32, u, v));
    }
    bgr
}

fn nv12_to_bgr(pixels: &[u8], w: usize, h: usize) -> Vec<u8> {
    let (luma, chroma) = pixels.split_at(w * h);
    let mut bgr = vec![0u8; w * h * 3];
    bgr.par_chunks_mut(w * 3).enumerate().for_each(|(j, row)| {
        let y_row = &luma[j * w..(j + 1) * w];
        // One interleaved UV row serves two luma rows.
        let uv_row = &chroma[(j / 2) * w..(j / 2 + 1) * w];
        for (i, px) in row.chunks_exact_mut(3).enumerate() {
            let u = uv_row[i & !1] as f32 - 128.0;
            let v = uv_row[i | 1] as f32 - 128.0;
            px.copy_from_slice(&yuv_to_bgr(y_row[i] as f32, u, v));
        }
    });
    bgr
}

fn yuv_to_bgr(y: f32, u: f32, v: f32) -> [u8; 3] {
    let r = y + 1.402_f32 * v;
    let g = y - 0.344_136_f32 * u - 0.714_136_f32 * v;
    let b = y + 1.772_f32 * u;
    [clamp_to_u8(b), clamp_to_u8(g), clamp_to_u8(r)]
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv12_conversion_produces_gray() -> Result<()> {
        let nv12 = [vec![128u8; 4], vec![128u8; 2]].concat();
        let bgr = normalize_to_bgr(&nv12, 2, 2, CaptureFormat::Nv12)?;
        assert_eq!(bgr, vec![128u8; 12]);
        Ok(())
    }

    #[test]
    fn yuyv_red_lands_in_last_channel() -> Result<()> {
        // Strong V pushes toward red.
        let yuyv = [100u8, 128, 100, 200];
        let bgr = normalize_to_bgr(&yuyv, 2, 1, CaptureFormat::Yuyv)?;
        assert_eq!(bgr.len(), 6);
        assert!(bgr[2] > bgr[0]);
        assert_eq!(bgr[..3], bgr[3..]);
        Ok(())
    }

    #[test]
    fn rgb_is_swapped_and_length_checked() -> Result<()> {
        let bgr = normalize_to_bgr(&[1, 2, 3], 1, 1, CaptureFormat::Rgb24)?;
        assert_eq!(bgr, vec![3, 2, 1]);
        assert!(normalize_to_bgr(&[1, 2], 1, 1, CaptureFormat::Bgr24).is_err());
        Ok(())
    }

    #[test]
    fn odd_chroma_geometry_is_rejected() {
        assert!(normalize_to_bgr(&[0u8; 9], 3, 2, CaptureFormat::Nv12).is_err());
        assert!(normalize_to_bgr(&[0u8; 6], 3, 1, CaptureFormat::Yuyv).is_err());
    }

    #[test]
    fn fourcc_lookup() {
        assert_eq!(CaptureFormat::from_fourcc(b"YUYV"), Some(CaptureFormat::Yuyv));
        assert_eq!(CaptureFormat::from_fourcc(b"MJPG"), None);
    }
}
