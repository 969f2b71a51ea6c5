// ============================================================
// Layer 4 - Image Loading and Preprocessing
// ============================================================
// Turns an image file into a normalized CHW float buffer ready
// for the encoder:
//
//   open -> resize -> (augment) -> RGB -> scale to [0,1]
//        -> per-channel (x - mean) / std
//
// Augmentation (train transform only) is a brightness jitter and
// a coin-flip horizontal mirror. The transform description is part
// of the persisted hyperparameter record, so a resumed run applies
// the exact same pipeline.
//
// Also hosts the two-pass per-channel mean/std computation over an
// image directory, used by the `stats` subcommand to derive
// normalization constants for a new dataset.

use std::path::Path;

use anyhow::{Context, Result};
use image::imageops::FilterType;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// ImageNet RGB statistics, the usual default for pretrained backbones.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

// ─── TransformConfig ──────────────────────────────────────────────────────────
/// Serializable description of one preprocessing pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Target (height, width) after resize
    pub resize: (u32, u32),
    /// Per-channel normalization mean (RGB, on [0,1] pixels)
    pub mean: [f32; 3],
    /// Per-channel normalization std (RGB)
    pub std: [f32; 3],
    /// Brightness jitter: each image is scaled by 1 + U(-j, j).
    /// Zero disables the jitter.
    pub brightness_jitter: f32,
    /// Mirror the image horizontally with probability 0.5
    pub random_flip: bool,
}

impl TransformConfig {
    /// Training pipeline: resize + jitter + flip + normalize.
    pub fn train(resize: (u32, u32)) -> Self {
        Self {
            resize,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
            brightness_jitter: 0.1,
            random_flip: true,
        }
    }

    /// Validation/inference pipeline: resize + normalize only.
    pub fn eval(resize: (u32, u32)) -> Self {
        Self {
            resize,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
            brightness_jitter: 0.0,
            random_flip: false,
        }
    }

    /// Elements per preprocessed image: 3 * H * W.
    pub fn pixel_count(&self) -> usize {
        3 * self.resize.0 as usize * self.resize.1 as usize
    }
}

// ─── ImageTransform ───────────────────────────────────────────────────────────
/// Applies a `TransformConfig` to image files.
#[derive(Debug, Clone)]
pub struct ImageTransform {
    config: TransformConfig,
}

impl ImageTransform {
    pub fn new(config: TransformConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransformConfig {
        &self.config
    }

    /// Load and preprocess one image into a CHW float buffer.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<Vec<f32>> {
        let path = path.as_ref();
        let img = image::open(path)
            .with_context(|| format!("cannot open image '{}'", path.display()))?;

        let (h, w) = self.config.resize;
        let mut img = img.resize_exact(w, h, FilterType::Triangle).to_rgb8();

        let mut rng = rand::thread_rng();
        if self.config.random_flip && rng.gen_bool(0.5) {
            img = image::imageops::flip_horizontal(&img);
        }
        let brightness = if self.config.brightness_jitter > 0.0 {
            let j = self.config.brightness_jitter;
            1.0 + rng.gen_range(-j..=j)
        } else {
            1.0
        };

        Ok(self.normalize(img.as_raw(), brightness))
    }

    /// HWC u8 -> CHW f32 with brightness scale and per-channel
    /// normalization. Split out so the arithmetic is testable without
    /// touching the filesystem.
    pub fn normalize(&self, raw: &[u8], brightness: f32) -> Vec<f32> {
        let (h, w) = self.config.resize;
        let (h, w) = (h as usize, w as usize);
        let mut out = vec![0.0f32; 3 * h * w];
        for c in 0..3 {
            let mean = self.config.mean[c];
            let std = self.config.std[c];
            for i in 0..h * w {
                let value = f32::from(raw[i * 3 + c]) / 255.0 * brightness;
                out[c * h * w + i] = (value.clamp(0.0, 1.0) - mean) / std;
            }
        }
        out
    }
}

// ─── Channel Statistics ───────────────────────────────────────────────────────
/// Per-channel mean and standard deviation over every image in a
/// directory, computed in two passes on resized [0,1] pixels.
pub fn channel_stats(dir: impl AsRef<Path>, resize: (u32, u32)) -> Result<([f32; 3], [f32; 3])> {
    let dir = dir.as_ref();
    let (h, w) = resize;
    let pixels_per_channel = (h * w) as f64;

    let entries: Vec<_> = std::fs::read_dir(dir)
        .with_context(|| format!("cannot list image directory '{}'", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    if entries.is_empty() {
        anyhow::bail!("no images found under '{}'", dir.display());
    }

    let load = |path: &Path| -> Result<image::RgbImage> {
        Ok(image::open(path)
            .with_context(|| format!("cannot open image '{}'", path.display()))?
            .resize_exact(w, h, FilterType::Triangle)
            .to_rgb8())
    };

    // First pass: mean
    let mut sums = [0.0f64; 3];
    for (count, path) in entries.iter().enumerate() {
        let img = load(path)?;
        for pixel in img.pixels() {
            for c in 0..3 {
                sums[c] += f64::from(pixel[c]) / 255.0;
            }
        }
        if (count + 1) % 1000 == 0 {
            tracing::info!("stats pass 1: {} images", count + 1);
        }
    }
    let n = entries.len() as f64;
    let mean = sums.map(|s| s / pixels_per_channel / n);

    // Second pass: variance around the mean
    let mut accum = [0.0f64; 3];
    for (count, path) in entries.iter().enumerate() {
        let img = load(path)?;
        for pixel in img.pixels() {
            for c in 0..3 {
                let diff = f64::from(pixel[c]) / 255.0 - mean[c];
                accum[c] += diff * diff;
            }
        }
        if (count + 1) % 1000 == 0 {
            tracing::info!("stats pass 2: {} images", count + 1);
        }
    }
    let std = accum.map(|a| (a / pixels_per_channel / n).sqrt());

    Ok((mean.map(|v| v as f32), std.map(|v| v as f32)))
}
