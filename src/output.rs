//! Persistence of selected candidates
//!
//! Converts selected tensors from `[-1, 1]` CHW to 8-bit HWC and writes them
//! as PNG or JPEG next to a JSON sidecar describing the run.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use log::info;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::GenerateConfig;
use crate::sampler::Candidate;

/// Save a `[3, H, W]` tensor in `[-1, 1]` as an image file. Format follows
/// the extension, defaulting to PNG.
pub fn save_image<P: AsRef<Path>>(tensor: &Tensor, path: P) -> Result<()> {
    let tensor = ((tensor.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?;
    let tensor = tensor.to_dtype(DType::U8)?;

    let (channel, height, width) = tensor.dims3().context("Expected 3D tensor [C, H, W]")?;
    if channel != 3 {
        anyhow::bail!("Expected 3 channels (RGB), got {}", channel);
    }

    let tensor = tensor.permute((1, 2, 0))?;
    let data = tensor.flatten_all()?.to_vec1::<u8>()?;

    let img =
        image::ImageBuffer::<image::Rgb<u8>, Vec<u8>>::from_raw(width as u32, height as u32, data)
            .context("Failed to create image buffer")?;

    let path = path.as_ref();
    match path.extension().and_then(|s| s.to_str()) {
        Some("jpg") | Some("jpeg") => {
            img.save_with_format(path, image::ImageFormat::Jpeg)?;
        }
        _ => {
            img.save_with_format(path, image::ImageFormat::Png)?;
        }
    }

    Ok(())
}

/// File name stem identifying the run: reference stem (or "noise"), model
/// variant, class index and stored instance index.
pub fn run_stem(config: &GenerateConfig) -> String {
    let reference = config
        .input_image_instance
        .as_deref()
        .and_then(Path::file_stem)
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "noise".to_string());
    let class = config
        .effective_class_index()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string());
    let instance = config
        .input_feature_index
        .map(|i| i.to_string())
        .unwrap_or_else(|| "none".to_string());
    format!(
        "{}_{}_cls{}_inst{}",
        reference,
        config.gen_model.name(),
        class,
        instance
    )
}

#[derive(Serialize)]
struct RunMetadata<'a> {
    model: &'a str,
    experiment: String,
    seed: Option<u64>,
    truncation: f32,
    num_samples_total: usize,
    num_samples_ranked: usize,
    distances: Vec<Option<f32>>,
    files: Vec<String>,
}

/// Write the selected candidates to `output_dir` in rank order and record a
/// metadata sidecar. Returns the written image paths.
pub fn save_selection(config: &GenerateConfig, candidates: &[Candidate]) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(&config.output_dir).with_context(|| {
        format!(
            "Failed to create output directory: {}",
            config.output_dir.display()
        )
    })?;

    let stem = run_stem(config);
    let seed_tag = config.seed.map(|s| s as i64).unwrap_or(-1);

    let mut paths = Vec::with_capacity(candidates.len());
    for (rank, candidate) in candidates.iter().enumerate() {
        let path = config
            .output_dir
            .join(format!("{}_seed{}_{}.png", stem, seed_tag, rank));
        save_image(&candidate.image, &path)?;
        paths.push(path);
    }

    let metadata = RunMetadata {
        model: config.gen_model.name(),
        experiment: config.gen_model.experiment_name(config.resolution),
        seed: config.seed,
        truncation: config.truncation,
        num_samples_total: config.num_samples_total,
        num_samples_ranked: config.num_samples_ranked,
        distances: candidates.iter().map(|c| c.distance).collect(),
        files: paths
            .iter()
            .map(|p| p.file_name().unwrap_or_default().to_string_lossy().into_owned())
            .collect(),
    };
    let metadata_path = config
        .output_dir
        .join(format!("{}_seed{}.json", stem, seed_tag));
    fs::write(&metadata_path, serde_json::to_string_pretty(&metadata)?)?;

    info!(
        "saved {} images to {}",
        paths.len(),
        config.output_dir.display()
    );
    Ok(paths)
}
