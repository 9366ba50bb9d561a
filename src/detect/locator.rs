use anyhow::{anyhow, Result};

use crate::detect::backend::LocatorBackend;
use crate::detect::contour::{binarize_inverse, outer_contours, rgb_to_luma, Moments};
use crate::detect::result::{Detection, NotFoundReason, Position};

/// Dark-target locator: inverse threshold, largest outer contour, moment
/// centroid.
///
/// The target is assumed darker than the arena floor. Pixels whose luma is
/// at or below `threshold` are foreground.
#[derive(Clone, Debug)]
pub struct ContourLocator {
    threshold: u8,
}

impl ContourLocator {
    pub fn new(threshold: u8) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> u8 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: u8) {
        self.threshold = threshold;
    }
}

impl LocatorBackend for ContourLocator {
    fn name(&self) -> &'static str {
        "contour"
    }

    fn locate(&mut self, pixels: &[u8], width: u32, height: u32) -> Result<Detection> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                pixels.len()
            ));
        }
        if width == 0 || height == 0 {
            return Ok(Detection::NotFound(NotFoundReason::InvalidFrame));
        }

        let luma = rgb_to_luma(pixels);
        let mask = binarize_inverse(&luma, self.threshold);
        let contours = outer_contours(&mask, width as usize, height as usize);

        // First contour wins ties, matching raster order.
        let mut best: Option<(f64, Moments)> = None;
        for contour in &contours {
            let m = contour.moments();
            if best.map_or(true, |(area, _)| m.area() > area) {
                best = Some((m.area(), m));
            }
        }
        let Some((_, moments)) = best else {
            return Ok(Detection::NotFound(NotFoundReason::NoContours));
        };
        let Some((cx, cy)) = moments.centroid() else {
            return Ok(Detection::NotFound(NotFoundReason::DegenerateMoment));
        };

        Ok(Detection::Found(Position {
            x: cx.round().clamp(0.0, (width - 1) as f64) as u32,
            y: cy.round().clamp(0.0, (height - 1) as f64) as u32,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BRIGHT: u8 = 200;
    const DARK: u8 = 10;

    fn canvas(width: u32, height: u32) -> Vec<u8> {
        vec![BRIGHT; (width * height * 3) as usize]
    }

    fn fill_rect(pixels: &mut [u8], width: u32, x0: u32, y0: u32, x1: u32, y1: u32) {
        for y in y0..=y1 {
            for x in x0..=x1 {
                let i = ((y * width + x) * 3) as usize;
                pixels[i..i + 3].fill(DARK);
            }
        }
    }

    fn fill_disc(pixels: &mut [u8], width: u32, height: u32, cx: i64, cy: i64, r: i64) {
        for y in 0..height as i64 {
            for x in 0..width as i64 {
                if (x - cx).pow(2) + (y - cy).pow(2) <= r * r {
                    let i = ((y as u32 * width + x as u32) * 3) as usize;
                    pixels[i..i + 3].fill(DARK);
                }
            }
        }
    }

    #[test]
    fn locates_disc_centre() -> Result<()> {
        let (w, h) = (120, 80);
        let mut px = canvas(w, h);
        fill_disc(&mut px, w, h, 70, 30, 8);
        let mut locator = ContourLocator::new(30);
        assert_eq!(
            locator.locate(&px, w, h)?,
            Detection::Found(Position { x: 70, y: 30 })
        );
        Ok(())
    }

    #[test]
    fn all_background_is_not_found() -> Result<()> {
        let (w, h) = (40, 30);
        let px = canvas(w, h);
        let mut locator = ContourLocator::new(30);
        assert_eq!(
            locator.locate(&px, w, h)?,
            Detection::NotFound(NotFoundReason::NoContours)
        );
        Ok(())
    }

    #[test]
    fn single_pixel_target_is_degenerate() -> Result<()> {
        let (w, h) = (40, 30);
        let mut px = canvas(w, h);
        fill_rect(&mut px, w, 12, 12, 12, 12);
        let mut locator = ContourLocator::new(30);
        assert_eq!(
            locator.locate(&px, w, h)?,
            Detection::NotFound(NotFoundReason::DegenerateMoment)
        );
        Ok(())
    }

    #[test]
    fn largest_blob_wins() -> Result<()> {
        let (w, h) = (100, 60);
        let mut px = canvas(w, h);
        fill_rect(&mut px, w, 2, 2, 6, 6);
        fill_rect(&mut px, w, 50, 20, 70, 40);
        let mut locator = ContourLocator::new(30);
        assert_eq!(
            locator.locate(&px, w, h)?,
            Detection::Found(Position { x: 60, y: 30 })
        );
        Ok(())
    }

    #[test]
    fn threshold_controls_foreground() -> Result<()> {
        let (w, h) = (40, 30);
        let mut px = canvas(w, h);
        fill_rect(&mut px, w, 10, 10, 20, 20);
        let mut locator = ContourLocator::new(5);
        assert!(!locator.locate(&px, w, h)?.is_found());
        locator.set_threshold(DARK);
        assert_eq!(locator.threshold(), DARK);
        assert_eq!(
            locator.locate(&px, w, h)?,
            Detection::Found(Position { x: 15, y: 15 })
        );
        Ok(())
    }

    #[test]
    fn positions_stay_inside_frame() -> Result<()> {
        let (w, h) = (30, 20);
        let mut locator = ContourLocator::new(30);
        for (x0, y0, x1, y1) in [(0, 0, 3, 3), (26, 16, 29, 19), (0, 10, 29, 19), (0, 0, 29, 19)] {
            let mut px = canvas(w, h);
            fill_rect(&mut px, w, x0, y0, x1, y1);
            let pos = locator
                .locate(&px, w, h)?
                .position()
                .expect("blob should be found");
            assert!(pos.x < w && pos.y < h, "{pos:?} outside {w}x{h}");
            assert!(pos.x >= x0 && pos.x <= x1 && pos.y >= y0 && pos.y <= y1);
        }
        Ok(())
    }

    #[test]
    fn rejects_short_buffers() {
        let mut locator = ContourLocator::new(30);
        assert!(locator.locate(&[0u8; 10], 4, 4).is_err());
    }
}
