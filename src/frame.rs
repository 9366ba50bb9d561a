//! Raw frame container.
//!
//! - `RawFrame`: RGB24 pixels plus dimensions, capture sequence and capture instant.
//! - `RawFrame::crop`: cut the outer field out of a full frame.
//!
//! Frames are produced by the ingestion layer, read by the locator and copied
//! once into the compression pipeline. Pixel data is never mutated after
//! capture.

use anyhow::{anyhow, Result};
use std::time::Instant;

use crate::region::Region;

/// Bytes per RGB24 pixel.
pub const RGB_CHANNELS: usize = 3;

/// One captured RGB24 frame.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pixels: Vec<u8>,

    pub width: u32,
    pub height: u32,

    /// Capture sequence number assigned by the source (1-based).
    pub seq: u64,

    /// Monotonic capture instant.
    pub captured_at: Instant,
}

impl RawFrame {
    /// Wrap RGB24 pixels. Fails when the buffer does not match the dimensions.
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, seq: u64) -> Result<Self> {
        Self::with_instant(pixels, width, height, seq, Instant::now())
    }

    pub fn with_instant(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        seq: u64,
        captured_at: Instant,
    ) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        Ok(Self {
            pixels,
            width,
            height,
            seq,
            captured_at,
        })
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// Copy out the half-open window `[xmin, xmax) x [ymin, ymax)` of `region`,
    /// clipped to the frame. The result keeps this frame's seq and instant.
    pub fn crop(&self, region: &Region) -> RawFrame {
        let x0 = region.xmin().min(self.width) as usize;
        let x1 = region.xmax().min(self.width) as usize;
        let y0 = region.ymin().min(self.height) as usize;
        let y1 = region.ymax().min(self.height) as usize;
        let out_w = x1.saturating_sub(x0);
        let out_h = y1.saturating_sub(y0);

        let stride = self.width as usize * RGB_CHANNELS;
        let mut pixels = Vec::with_capacity(out_w * out_h * RGB_CHANNELS);
        for y in y0..y1 {
            let row = y * stride;
            pixels.extend_from_slice(
                &self.pixels[row + x0 * RGB_CHANNELS..row + x1 * RGB_CHANNELS],
            );
        }

        RawFrame {
            pixels,
            width: out_w as u32,
            height: out_h as u32,
            seq: self.seq,
            captured_at: self.captured_at,
        }
    }
}

pub(crate) fn rgb_len(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .and_then(|v| v.checked_mul(RGB_CHANNELS))
        .ok_or_else(|| anyhow!("RGB frame dimensions overflow"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> RawFrame {
        let mut pixels = Vec::new();
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&[x as u8, y as u8, 0]);
            }
        }
        RawFrame::new(pixels, width, height, 7).unwrap()
    }

    #[test]
    fn rejects_mismatched_buffer() {
        assert!(RawFrame::new(vec![0u8; 11], 2, 2, 1).is_err());
        assert!(RawFrame::new(vec![0u8; 12], 2, 2, 1).is_ok());
    }

    #[test]
    fn crop_copies_half_open_window() {
        let frame = gradient(10, 8);
        let region = Region::new(2, 5, 1, 4).unwrap();
        let cropped = frame.crop(&region);
        assert_eq!((cropped.width, cropped.height), (3, 3));
        assert_eq!(cropped.seq, 7);
        assert_eq!(&cropped.pixels()[..3], &[2, 1, 0]);
        let last = cropped.byte_len() - 3;
        assert_eq!(&cropped.pixels()[last..], &[4, 3, 0]);
    }

    #[test]
    fn crop_is_clipped_to_frame() {
        let frame = gradient(10, 8);
        let region = Region::new(6, 40, 5, 40).unwrap();
        let cropped = frame.crop(&region);
        assert_eq!((cropped.width, cropped.height), (4, 3));
        assert_eq!(cropped.byte_len(), 4 * 3 * 3);
    }
}
