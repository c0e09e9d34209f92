//! Canonical image transform shared by conditioning and scoring
//!
//! Both the reference image and every generated sample go through the same
//! pipeline before feature extraction: center-crop on the long edge, resize
//! to the generator resolution, ImageNet mean/std normalization, then resize
//! to the extractor's 224x224 input. Scoring is only meaningful if both sides
//! live in the same feature space, so this module is the single place these
//! constants exist.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;
use std::path::Path;

pub const EXTRACTOR_INPUT_SIZE: usize = 224;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Square crop centered on the long edge, keeping the short edge intact.
pub fn center_crop_long_edge(img: &DynamicImage) -> DynamicImage {
    let (w, h) = (img.width(), img.height());
    let side = w.min(h);
    let x = (w - side) / 2;
    let y = (h - side) / 2;
    img.crop_imm(x, y, side, side)
}

/// Load a reference image and produce the extractor input tensor
/// `[1, 3, 224, 224]`, normalized with ImageNet statistics.
pub fn load_reference_image(path: &Path, resolution: usize, device: &Device) -> Result<Tensor> {
    let img = image::open(path)
        .with_context(|| format!("Failed to open reference image: {}", path.display()))?;
    let img = center_crop_long_edge(&img);
    let img = img.resize_exact(resolution as u32, resolution as u32, FilterType::CatmullRom);
    let img = img.resize_exact(
        EXTRACTOR_INPUT_SIZE as u32,
        EXTRACTOR_INPUT_SIZE as u32,
        FilterType::CatmullRom,
    );
    let rgb = img.to_rgb8();
    let data: Vec<f32> = rgb.into_raw().iter().map(|&v| v as f32 / 255.0).collect();
    let tensor = Tensor::from_vec(
        data,
        (EXTRACTOR_INPUT_SIZE, EXTRACTOR_INPUT_SIZE, 3),
        device,
    )?
    .permute((2, 0, 1))?;
    let tensor = normalize_imagenet(&tensor)?;
    Ok(tensor.unsqueeze(0)?)
}

/// Map a generated batch `[B, 3, H, W]` in `[-1, 1]` to the extractor input
/// `[B, 3, 224, 224]`, normalized with ImageNet statistics.
pub fn prepare_generated_batch(images: &Tensor) -> Result<Tensor> {
    let x = images.affine(0.5, 0.5)?;
    let x = normalize_imagenet(&x)?;
    let (_b, _c, h, w) = x.dims4()?;
    if h == EXTRACTOR_INPUT_SIZE && w == EXTRACTOR_INPUT_SIZE {
        Ok(x)
    } else {
        Ok(x.upsample_nearest2d(EXTRACTOR_INPUT_SIZE, EXTRACTOR_INPUT_SIZE)?)
    }
}

fn normalize_imagenet(x: &Tensor) -> Result<Tensor> {
    let device = x.device();
    let mean = Tensor::from_slice(&IMAGENET_MEAN, (3, 1, 1), device)?;
    let std = Tensor::from_slice(&IMAGENET_STD, (3, 1, 1), device)?;
    Ok(x.broadcast_sub(&mean)?.broadcast_div(&std)?)
}
