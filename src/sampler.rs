//! Candidate generation and ranking loop
//!
//! Draws a pool of truncated noise vectors, runs the generator over
//! contiguous batches, scores every generated image by Euclidean distance
//! between its unit-normalized embedding and the conditioning instance, and
//! keeps the best-scoring subset. With null conditioning there is nothing to
//! score against, so selection falls back to generation order.

use anyhow::{ensure, Result};
use candle_core::{Device, Tensor};
use log::{debug, info};
use rand::rngs::StdRng;

use crate::conditioning::{unit_normalize, Conditioning};
use crate::models::{FeatureExtractor, Generator};
use crate::noise::{self, TruncationMode};
use crate::preprocess;

/// Parameters of one sampling run.
#[derive(Debug, Clone)]
pub struct SampleParams {
    pub num_total: usize,
    pub num_ranked: usize,
    pub batch_size: usize,
    pub truncation: f32,
    pub truncation_mode: TruncationMode,
    pub noise_size: usize,
}

/// A generated image paired with its distance to the conditioning instance.
/// The image lives on the host in `[-1, 1]`, shape `[3, H, W]`. Distance is
/// `None` when the run was unconditioned.
pub struct Candidate {
    pub image: Tensor,
    pub distance: Option<f32>,
}

/// The `num_ranked` best candidates, ascending distance.
pub struct RankedSelection {
    pub candidates: Vec<Candidate>,
}

/// Contiguous `(start, end)` chunks of size <= `batch_size` covering
/// `[0, total)` exactly once, in order.
pub fn contiguous_batches(total: usize, batch_size: usize) -> Vec<(usize, usize)> {
    (0..total)
        .step_by(batch_size.max(1))
        .map(|start| (start, (start + batch_size).min(total)))
        .collect()
}

/// Indices of the `k` smallest distances, ascending, ties broken by original
/// order. Full sort; pools stay in the hundreds.
pub fn top_k(distances: &[f32], k: usize) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..distances.len()).collect();
    indices.sort_by(|&a, &b| {
        distances[a]
            .partial_cmp(&distances[b])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    indices.truncate(k);
    indices
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// Generate `num_total` candidates and return the `num_ranked` closest to the
/// conditioning instance.
pub fn generate_ranked(
    generator: &dyn Generator,
    extractor: &dyn FeatureExtractor,
    conditioning: &Conditioning,
    params: &SampleParams,
    rng: &mut StdRng,
    device: &Device,
) -> Result<RankedSelection> {
    ensure!(
        params.num_ranked <= params.num_total,
        "num_ranked ({}) exceeds num_total ({})",
        params.num_ranked,
        params.num_total
    );

    let mut noise = noise::sample_truncated(params.num_total, params.noise_size, params.truncation, rng);
    let instance_rows = conditioning.instance_rows(params.num_total, device)?;
    let labels = conditioning.labels(params.num_total, device)?;

    let batches = contiguous_batches(params.num_total, params.batch_size);
    info!(
        "generating {} candidates in {} batches of <= {}",
        params.num_total,
        batches.len(),
        params.batch_size
    );

    let mut images: Vec<Tensor> = Vec::with_capacity(params.num_total);
    let mut distances: Vec<f32> = Vec::new();

    #[cfg(feature = "progress-bar")]
    let progress = indicatif::ProgressBar::new(batches.len() as u64);

    for &(start, end) in &batches {
        let n = end - start;
        let rows = &mut noise[start * params.noise_size..end * params.noise_size];
        noise::enforce_truncation(rows, params.truncation, params.truncation_mode, rng);
        let noise_batch = Tensor::from_slice(rows, (n, params.noise_size), device)?;
        let label_batch = match &labels {
            Some(labels) => Some(labels.narrow(0, start, n)?),
            None => None,
        };
        let instance_batch = match &instance_rows {
            Some(rows) => Some(rows.narrow(0, start, n)?),
            None => None,
        };

        // Scope the device-side batch so it is released before the next one.
        {
            let out = generator.generate(&noise_batch, label_batch.as_ref(), instance_batch.as_ref())?;

            if let Some(target) = &conditioning.instance {
                let prepared = preprocess::prepare_generated_batch(&out)?;
                let features = extractor.extract(&prepared)?;
                let mut feature_rows = features.to_vec2::<f32>()?;
                for row in feature_rows.iter_mut() {
                    unit_normalize(row);
                    distances.push(euclidean_distance(row, target));
                }
            }

            let out = out.to_device(&Device::Cpu)?;
            for sample in 0..n {
                images.push(out.get(sample)?);
            }
        }
        debug!("batch [{start}, {end}) done");

        #[cfg(feature = "progress-bar")]
        progress.inc(1);
    }

    #[cfg(feature = "progress-bar")]
    progress.finish_and_clear();

    let selected = if conditioning.instance.is_some() {
        top_k(&distances, params.num_ranked)
    } else {
        // Unranked pool, every candidate equally eligible.
        (0..params.num_ranked).collect()
    };

    let candidates = selected
        .into_iter()
        .map(|index| Candidate {
            image: images[index].clone(),
            distance: distances.get(index).copied(),
        })
        .collect();
    Ok(RankedSelection { candidates })
}
