use anyhow::{bail, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use redecor_contracts::config::Device;
use sha2::{Digest, Sha256};

use super::{GenerationEngine, GenerationRequest};
use crate::raster::OutputImage;

/// Local stand-in for a diffusion model.
///
/// Starts from seeded noise and halves the distance to a target picture on
/// every step. The target paints the conditioning lines in an accent colour
/// over a shaded base colour, both derived from the prompt, negative prompt,
/// seed and step count. Output is bit-reproducible.
#[derive(Debug, Clone)]
pub struct DryrunEngine {
    device: Device,
    width: u32,
    height: u32,
}

impl DryrunEngine {
    pub fn new(device: Device, width: u32, height: u32) -> Self {
        Self {
            device,
            width,
            height,
        }
    }
}

impl GenerationEngine for DryrunEngine {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn device(&self) -> Device {
        self.device
    }

    fn generate(&mut self, request: &GenerationRequest) -> Result<OutputImage> {
        if request.steps == 0 {
            bail!("step count must be at least 1");
        }
        if self.width == 0 || self.height == 0 {
            bail!("invalid output size {}x{}", self.width, self.height);
        }

        let digest = request_digest(request);
        let base = [digest[0], digest[1], digest[2]];
        let accent = [digest[3] | 0x80, digest[4] | 0x80, digest[5] | 0x80];
        let mut noise_seed = [0u8; 8];
        noise_seed.copy_from_slice(&digest[8..16]);
        let mut rng = StdRng::seed_from_u64(request.seed ^ u64::from_be_bytes(noise_seed));

        let structure = imageops::resize(
            request.conditioning.as_rgb(),
            self.width,
            self.height,
            FilterType::Nearest,
        );
        let target = paint_target(&structure, base, accent);

        let mut canvas = vec![0u8; target.len()];
        rng.fill_bytes(&mut canvas);
        for _ in 0..request.steps {
            for (value, goal) in canvas.iter_mut().zip(target.iter()) {
                *value = ((*value as u16 + *goal as u16) / 2) as u8;
            }
        }

        let image = RgbImage::from_raw(self.width, self.height, canvas)
            .ok_or_else(|| anyhow::anyhow!("canvas size does not match output dimensions"))?;
        Ok(OutputImage::new(image))
    }
}

fn request_digest(request: &GenerationRequest) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(request.prompt.as_bytes());
    hasher.update([0u8]);
    hasher.update(request.negative_prompt.as_bytes());
    hasher.update([0u8]);
    hasher.update(request.seed.to_be_bytes());
    hasher.update(request.steps.to_be_bytes());
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

fn paint_target(structure: &RgbImage, base: [u8; 3], accent: [u8; 3]) -> Vec<u8> {
    let height = structure.height().max(1);
    let mut out = Vec::with_capacity(structure.as_raw().len());
    for (_, y, pixel) in structure.enumerate_pixels() {
        let [r, g, b] = pixel.0;
        let is_line = (r as u16 + g as u16 + b as u16) / 3 > 127;
        if is_line {
            out.extend_from_slice(&accent);
            continue;
        }
        // light from above: top rows keep full base colour, bottom rows ~60%
        let shade = 160 + 95 * (height - y) / height;
        for channel in base {
            out.push((channel as u32 * shade / 255) as u8);
        }
    }
    out
}
