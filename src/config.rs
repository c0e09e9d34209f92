//! Run configuration
//!
//! Mirrors the parameters of a single generation run: which pretrained model
//! variant to use, what to condition on, pool and selection sizes, truncation
//! settings and output location. Loaded from YAML, validated before a run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::conditioning::ConditioningSource;
use crate::error::RunError;
use crate::noise::TruncationMode;

/// Model variant. `icgan` conditions on an instance embedding only;
/// `cc_icgan` additionally conditions on an ImageNet class index and uses the
/// classification feature extractor instead of the self-supervised one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenModel {
    Icgan,
    CcIcgan,
}

impl GenModel {
    pub fn name(&self) -> &'static str {
        match self {
            GenModel::Icgan => "icgan",
            GenModel::CcIcgan => "cc_icgan",
        }
    }

    pub fn experiment_name(&self, resolution: usize) -> String {
        format!("{}_biggan_imagenet_res{}", self.name(), resolution)
    }

    pub fn feature_extractor_name(&self) -> &'static str {
        match self {
            GenModel::Icgan => "selfsupervised",
            GenModel::CcIcgan => "classification",
        }
    }

    pub fn uses_class_label(&self) -> bool {
        matches!(self, GenModel::CcIcgan)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateConfig {
    pub gen_model: GenModel,
    #[serde(default = "default_resolution")]
    pub resolution: usize,
    /// Reference image to extract the conditioning instance from.
    pub input_image_instance: Option<PathBuf>,
    /// Row index into the stored instance cache.
    pub input_feature_index: Option<usize>,
    /// Class index, only honored for `cc_icgan`.
    pub class_index: Option<i64>,
    #[serde(default = "default_num_ranked")]
    pub num_samples_ranked: usize,
    #[serde(default = "default_num_total")]
    pub num_samples_total: usize,
    #[serde(default = "default_truncation")]
    pub truncation: f32,
    #[serde(default)]
    pub truncation_mode: TruncationMode,
    pub seed: Option<u64>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_noise_size")]
    pub noise_size: usize,
    pub instance_cache_path: Option<PathBuf>,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub postprocess: Vec<PostStageConfig>,
}

/// One optional post-processing stage, independently enable-able.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PostStageConfig {
    Upscale {
        #[serde(default = "default_outscale")]
        outscale: usize,
        #[serde(default = "default_enabled")]
        enabled: bool,
    },
}

fn default_resolution() -> usize {
    256
}
fn default_num_ranked() -> usize {
    16
}
fn default_num_total() -> usize {
    160
}
fn default_truncation() -> f32 {
    0.7
}
fn default_batch_size() -> usize {
    4
}
fn default_noise_size() -> usize {
    128
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}
fn default_outscale() -> usize {
    4
}
fn default_enabled() -> bool {
    true
}

impl GenerateConfig {
    /// Which conditioning source is active. Supplying both a reference image
    /// and a stored feature index is a configuration error.
    pub fn conditioning_source(&self) -> Result<ConditioningSource, RunError> {
        match (&self.input_image_instance, self.input_feature_index) {
            (Some(_), Some(_)) => Err(RunError::ConflictingConditioning),
            (Some(path), None) => Ok(ConditioningSource::ReferenceImage(path.clone())),
            (None, Some(index)) => Ok(ConditioningSource::StoredFeature(index)),
            (None, None) => Ok(ConditioningSource::None),
        }
    }

    /// Class label after applying model-variant policy: instance-only models
    /// ignore any configured class index.
    pub fn effective_class_index(&self) -> Option<i64> {
        if self.gen_model.uses_class_label() {
            self.class_index
        } else {
            None
        }
    }

    pub fn validate(&self) -> Result<(), RunError> {
        if self.num_samples_ranked > self.num_samples_total {
            return Err(RunError::RankedExceedsTotal {
                ranked: self.num_samples_ranked,
                total: self.num_samples_total,
            });
        }
        if !(self.truncation > 0.0 && self.truncation <= 1.0) {
            return Err(RunError::InvalidTruncation(self.truncation));
        }
        if self.batch_size == 0 {
            return Err(RunError::ZeroBatchSize);
        }
        self.conditioning_source()?;
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<GenerateConfig> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: GenerateConfig = serde_yaml::from_str(&config_str)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    config.validate()?;
    Ok(config)
}
