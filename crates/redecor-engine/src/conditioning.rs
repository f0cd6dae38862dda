use anyhow::{bail, Result};
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, Rgb, RgbImage};

use redecor_contracts::config::ConditioningConfig;

use crate::raster::{CanonicalImage, ConditioningImage};

/// Maps a canonical image to its structural conditioning image.
///
/// Implementations must be pure functions of their input: the same image
/// always yields the same conditioning bytes. They are shared across
/// concurrent requests without locking.
pub trait ConditioningExtractor: Send + Sync {
    fn name(&self) -> &str;
    fn extract(&self, image: &CanonicalImage) -> Result<ConditioningImage>;
}

/// Gradient-based line detector.
///
/// The input is resized so its short side matches `detect_resolution`
/// (both sides snapped to multiples of 64, neither above `max_side`),
/// converted to luma, and run
/// through a Sobel operator with non-maximum suppression. Pixels whose
/// gradient exceeds `edge_threshold` of the strongest gradient become white.
#[derive(Debug, Clone)]
pub struct LineDetector {
    detect_resolution: u32,
    edge_threshold: f32,
    max_side: u32,
}

const DEFAULT_MAX_SIDE: u32 = 2048;

impl Default for LineDetector {
    fn default() -> Self {
        Self::from_config(&ConditioningConfig::default())
    }
}

impl LineDetector {
    pub fn new(detect_resolution: u32, edge_threshold: f32) -> Self {
        Self {
            detect_resolution,
            edge_threshold,
            max_side: DEFAULT_MAX_SIDE.max(detect_resolution),
        }
    }

    pub fn with_max_side(mut self, max_side: u32) -> Self {
        self.max_side = max_side;
        self
    }

    pub fn from_config(config: &ConditioningConfig) -> Self {
        Self::new(config.detect_resolution, config.edge_threshold)
            .with_max_side(config.max_detect_side)
    }
}

impl ConditioningExtractor for LineDetector {
    fn name(&self) -> &str {
        "line-detector"
    }

    fn extract(&self, image: &CanonicalImage) -> Result<ConditioningImage> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            bail!("line detector received an empty {width}x{height} raster");
        }
        if self.detect_resolution < 64 {
            bail!(
                "detect resolution {} is below the 64px minimum",
                self.detect_resolution
            );
        }
        if self.max_side < 64 {
            bail!("max detect side {} is below the 64px minimum", self.max_side);
        }

        let (target_w, target_h) =
            detect_dims(width, height, self.detect_resolution, self.max_side);
        let filter = if target_w.max(target_h) > width.max(height) {
            FilterType::Lanczos3
        } else {
            FilterType::Triangle
        };
        let resized = imageops::resize(image.as_rgb(), target_w, target_h, filter);
        let luma = to_luma(&resized);
        let lines = sobel_lines(&luma, self.edge_threshold);
        Ok(ConditioningImage::new(lines))
    }
}

/// Scales so the short side is `resolution` unless that would push the long
/// side past `max_side`, then snaps each side to a multiple of 64 within
/// `64..=max_side`.
fn detect_dims(width: u32, height: u32, resolution: u32, max_side: u32) -> (u32, u32) {
    let scale = (resolution as f64 / width.min(height) as f64)
        .min(max_side as f64 / width.max(height) as f64);
    let max_blocks = (max_side / 64).max(1);
    let snap = |side: u32| -> u32 {
        let blocks = (side as f64 * scale / 64.0).round() as u32;
        blocks.clamp(1, max_blocks) * 64
    };
    (snap(width), snap(height))
}

fn to_luma(image: &RgbImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let [r, g, b] = image.get_pixel(x, y).0;
        let luma = (299 * r as u32 + 587 * g as u32 + 114 * b as u32 + 500) / 1000;
        Luma([luma as u8])
    })
}

fn sobel_lines(luma: &GrayImage, threshold: f32) -> RgbImage {
    let (width, height) = luma.dimensions();
    let at = |x: i64, y: i64| -> f32 {
        let cx = x.clamp(0, width as i64 - 1) as u32;
        let cy = y.clamp(0, height as i64 - 1) as u32;
        luma.get_pixel(cx, cy).0[0] as f32
    };

    let len = (width * height) as usize;
    let mut magnitude = vec![0.0f32; len];
    let mut direction = vec![0u8; len];
    let mut strongest = 0.0f32;

    for y in 0..height as i64 {
        for x in 0..width as i64 {
            let gx = (at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2.0 * at(x - 1, y) + at(x - 1, y + 1));
            let gy = (at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1))
                - (at(x - 1, y - 1) + 2.0 * at(x, y - 1) + at(x + 1, y - 1));
            let idx = y as usize * width as usize + x as usize;
            let mag = (gx * gx + gy * gy).sqrt();
            magnitude[idx] = mag;
            direction[idx] = quantize_direction(gx, gy);
            strongest = strongest.max(mag);
        }
    }

    let mut out = RgbImage::new(width, height);
    if strongest <= f32::EPSILON {
        return out;
    }
    let cutoff = strongest * threshold;
    let mag_at = |x: i64, y: i64| -> f32 {
        if x < 0 || y < 0 || x >= width as i64 || y >= height as i64 {
            return 0.0;
        }
        magnitude[y as usize * width as usize + x as usize]
    };

    for y in 0..height as i64 {
        for x in 0..width as i64 {
            let idx = y as usize * width as usize + x as usize;
            let mag = magnitude[idx];
            if mag <= cutoff {
                continue;
            }
            let (dx, dy) = match direction[idx] {
                0 => (1, 0),
                1 => (1, 1),
                2 => (0, 1),
                _ => (1, -1),
            };
            // ridge pixels only; on a plateau the first pixel along the gradient wins
            let ahead = mag_at(x + dx, y + dy);
            let behind = mag_at(x - dx, y - dy);
            if mag < ahead || mag <= behind {
                continue;
            }
            out.put_pixel(x as u32, y as u32, Rgb([255, 255, 255]));
        }
    }
    out
}

/// Buckets the gradient angle into 0°, 45°, 90° or 135°.
fn quantize_direction(gx: f32, gy: f32) -> u8 {
    let angle = gy.atan2(gx).to_degrees();
    let angle = if angle < 0.0 { angle + 180.0 } else { angle };
    if !(22.5..157.5).contains(&angle) {
        0
    } else if angle < 67.5 {
        1
    } else if angle < 112.5 {
        2
    } else {
        3
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical(width: u32, height: u32, f: impl Fn(u32, u32) -> [u8; 3]) -> CanonicalImage {
        CanonicalImage::new(RgbImage::from_fn(width, height, |x, y| Rgb(f(x, y))))
    }

    #[test]
    fn detect_dims_snaps_short_side_to_resolution() {
        assert_eq!(detect_dims(100, 100, 512, 2048), (512, 512));
        assert_eq!(detect_dims(1920, 1080, 512, 2048), (896, 512));
    }

    #[test]
    fn detect_dims_never_exceed_max_side() {
        assert_eq!(detect_dims(10, 1000, 64, 2048), (64, 2048));
        assert_eq!(detect_dims(1, 3000, 512, 2048), (64, 2048));
        assert_eq!(detect_dims(u32::MAX, 1, 512, 1024), (1024, 64));
    }

    #[test]
    fn thin_strip_is_extracted_within_bounds() -> anyhow::Result<()> {
        let strip = canonical(1, 3000, |_, y| if y < 1500 { [255, 255, 255] } else { [0, 0, 0] });
        let conditioning = LineDetector::default().extract(&strip)?;
        assert_eq!(conditioning.dimensions(), (64, 2048));

        let capped = LineDetector::new(512, 0.1).with_max_side(256).extract(&strip)?;
        let (width, height) = capped.dimensions();
        assert!(width <= 256 && height <= 256);
        Ok(())
    }

    #[test]
    fn uniform_image_has_no_lines() -> anyhow::Result<()> {
        let white = canonical(100, 100, |_, _| [255, 255, 255]);
        let conditioning = LineDetector::default().extract(&white)?;
        assert_eq!(conditioning.dimensions(), (512, 512));
        assert!(conditioning.as_rgb().pixels().all(|px| px.0 == [0, 0, 0]));
        Ok(())
    }

    #[test]
    fn vertical_boundary_produces_a_vertical_line() -> anyhow::Result<()> {
        let split = canonical(128, 128, |x, _| if x < 64 { [0, 0, 0] } else { [255, 255, 255] });
        let conditioning = LineDetector::new(128, 0.1).extract(&split)?;
        let rgb = conditioning.as_rgb();

        let lit_columns: Vec<u32> = (0..128)
            .filter(|&x| rgb.get_pixel(x, 64).0 == [255, 255, 255])
            .collect();
        assert!(!lit_columns.is_empty());
        assert!(lit_columns.iter().all(|&x| (62..=65).contains(&x)));
        // far from the boundary everything stays dark
        assert_eq!(rgb.get_pixel(10, 64).0, [0, 0, 0]);
        assert_eq!(rgb.get_pixel(120, 64).0, [0, 0, 0]);
        Ok(())
    }

    #[test]
    fn extraction_is_deterministic() -> anyhow::Result<()> {
        let scene = canonical(97, 61, |x, y| {
            [(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x + y) % 256) as u8]
        });
        let detector = LineDetector::default();
        let first = detector.extract(&scene)?;
        let second = detector.extract(&scene)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn empty_raster_is_an_extraction_error() {
        let empty = CanonicalImage::new(RgbImage::new(0, 0));
        assert!(LineDetector::default().extract(&empty).is_err());
    }
}
