//! Frame types shared by every pipeline stage.
//!
//! - `DualFisheyeFrame`: raw capture from the camera, both lenses side by side.
//! - `PanoramaFrame`: stitched equirectangular output.
//!
//! Both flavors are the same container tagged with a zero-sized marker, so a
//! panorama can never be handed to the stitcher as input (and vice versa).
//! Frames are moved, never cloned: each one lives for exactly one traversal of
//! the pipeline and is dropped by the stage that consumes it.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use std::time::{Duration, Instant};

/// Every frame is interleaved 8-bit with three channels.
pub const CHANNELS: usize = 3;

/// Byte order of the three interleaved channels.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    #[default]
    Bgr24,
    Rgb24,
}

impl PixelFormat {
    /// Name of the layout in encoder `-pix_fmt` terms.
    pub fn encoder_name(&self) -> &'static str {
        match self {
            PixelFormat::Bgr24 => "bgr24",
            PixelFormat::Rgb24 => "rgb24",
        }
    }

    /// Rec.601 luma weights in this layout's byte order.
    pub fn luma_weights(&self) -> [f32; CHANNELS] {
        match self {
            PixelFormat::Bgr24 => [0.114, 0.587, 0.299],
            PixelFormat::Rgb24 => [0.299, 0.587, 0.114],
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Byte length of one interleaved frame, `None` on overflow.
    pub fn frame_bytes(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|v| v.checked_mul(CHANNELS))
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Marker for raw dual-fisheye captures.
#[derive(Debug)]
pub struct DualFisheye;

/// Marker for stitched equirectangular frames.
#[derive(Debug)]
pub struct Panorama;

/// Timestamped raw pixel buffer of fixed shape.
///
/// Deliberately not `Clone`.
pub struct Frame<K> {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Capture sequence number, monotonically increasing per source.
    pub seq: u64,
    /// Capture instant, carried through to the panorama for latency accounting.
    pub captured_at: Instant,
    _kind: PhantomData<fn() -> K>,
}

pub type DualFisheyeFrame = Frame<DualFisheye>;
pub type PanoramaFrame = Frame<Panorama>;

impl<K> Frame<K> {
    /// Wrap a pixel buffer captured now.
    pub fn new(data: Vec<u8>, width: u32, height: u32, format: PixelFormat, seq: u64) -> Result<Self> {
        Self::with_capture_time(data, width, height, format, seq, Instant::now())
    }

    pub fn with_capture_time(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        seq: u64,
        captured_at: Instant,
    ) -> Result<Self> {
        let expected = Resolution::new(width, height)
            .frame_bytes()
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if data.len() != expected {
            return Err(anyhow!(
                "frame length mismatch for {}x{}: expected {}, got {}",
                width,
                height,
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            format,
            seq,
            captured_at,
            _kind: PhantomData,
        })
    }

    /// Internal: wrap a buffer already sized for `resolution`.
    pub(crate) fn assemble(
        data: Vec<u8>,
        resolution: Resolution,
        format: PixelFormat,
        seq: u64,
        captured_at: Instant,
    ) -> Self {
        debug_assert_eq!(Some(data.len()), resolution.frame_bytes());
        Self {
            data,
            width: resolution.width,
            height: resolution.height,
            format,
            seq,
            captured_at,
            _kind: PhantomData,
        }
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(self.width, self.height)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Consume the frame and hand over its bytes (encoder pipe).
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Pixel at integer coordinates, in the frame's own byte order.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; CHANNELS]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * CHANNELS;
        let px = self.data.get(offset..offset + CHANNELS)?;
        Some([px[0], px[1], px[2]])
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }
}

impl<K> fmt::Debug for Frame<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("kind", &std::any::type_name::<K>())
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("seq", &self.seq)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_rejects_wrong_length() {
        let err = DualFisheyeFrame::new(vec![0u8; 10], 2, 2, PixelFormat::Bgr24, 0);
        assert!(err.is_err());
    }

    #[test]
    fn frame_exposes_pixels_by_coordinate() -> Result<()> {
        let data: Vec<u8> = (0..12).collect();
        let frame = PanoramaFrame::new(data, 2, 2, PixelFormat::Rgb24, 7)?;
        assert_eq!(frame.pixel(1, 1), Some([9, 10, 11]));
        assert_eq!(frame.pixel(2, 0), None);
        assert_eq!(frame.seq, 7);
        assert_eq!(frame.resolution(), Resolution::new(2, 2));
        Ok(())
    }

    #[test]
    fn luma_weights_follow_byte_order() {
        let bgr = PixelFormat::Bgr24.luma_weights();
        let rgb = PixelFormat::Rgb24.luma_weights();
        assert_eq!(bgr[0], rgb[2]);
        assert!((bgr.iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }
}
