//! Precomputed instance feature cache
//!
//! A matrix of embeddings extracted offline (one row per instance), stored in
//! a safetensors file under the `instance_features` key and loaded once at
//! session start. Lookups are by integer row index.

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use std::path::Path;

use crate::error::RunError;

pub const INSTANCE_TENSOR_KEY: &str = "instance_features";

#[derive(Debug)]
pub struct StoredInstanceCache {
    features: Vec<Vec<f32>>,
}

impl StoredInstanceCache {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(RunError::MissingInstanceCache(path.to_path_buf()).into());
        }
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("Failed to load instance cache: {}", path.display()))?;
        let features = tensors
            .get(INSTANCE_TENSOR_KEY)
            .with_context(|| {
                format!(
                    "tensor '{}' missing from {}",
                    INSTANCE_TENSOR_KEY,
                    path.display()
                )
            })?
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?;
        log::info!(
            "loaded {} stored instance features from {}",
            features.len(),
            path.display()
        );
        Ok(Self { features })
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn feature_dim(&self) -> Option<usize> {
        self.features.first().map(|row| row.len())
    }

    pub fn lookup(&self, index: usize) -> Result<Vec<f32>, RunError> {
        self.features
            .get(index)
            .cloned()
            .ok_or(RunError::InstanceIndexOutOfRange {
                index,
                len: self.features.len(),
            })
    }
}
