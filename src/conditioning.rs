//! Conditioning assembly
//!
//! Exactly one of {reference image, stored feature index, none} selects the
//! instance conditioning for a run. The resulting embedding is always
//! unit-normalized so that distance scoring and generation share the same
//! feature space.

use anyhow::Result;
use candle_core::{Device, Tensor};
use log::info;

use crate::config::GenerateConfig;
use crate::error::RunError;
use crate::instances::StoredInstanceCache;
use crate::models::FeatureExtractor;
use crate::preprocess;

/// Norm floor guarding the division during unit normalization.
pub const NORM_EPS: f32 = 1e-8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditioningSource {
    ReferenceImage(std::path::PathBuf),
    StoredFeature(usize),
    None,
}

/// Conditioning for one run: an optional unit-normalized instance embedding
/// and an optional class label, broadcast to every sample at generation time.
#[derive(Debug, Clone)]
pub struct Conditioning {
    pub instance: Option<Vec<f32>>,
    pub class_index: Option<i64>,
}

impl Conditioning {
    pub fn none() -> Self {
        Self {
            instance: None,
            class_index: None,
        }
    }

    /// Instance embedding repeated to `count` rows, `[count, feat_dim]`.
    pub fn instance_rows(&self, count: usize, device: &Device) -> Result<Option<Tensor>> {
        match &self.instance {
            Some(row) => {
                let tensor = Tensor::from_vec(row.clone(), (1, row.len()), device)?;
                Ok(Some(tensor.repeat((count, 1))?))
            }
            None => Ok(None),
        }
    }

    /// Class label broadcast to `count` entries, `[count]` of i64.
    pub fn labels(&self, count: usize, device: &Device) -> Result<Option<Tensor>> {
        match self.class_index {
            Some(class) => Ok(Some(Tensor::full(class, (count,), device)?)),
            None => Ok(None),
        }
    }
}

/// Scale `v` to unit Euclidean length in place, with an epsilon floor on the
/// norm so an all-zero embedding does not divide by zero.
pub fn unit_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(NORM_EPS);
    for x in v.iter_mut() {
        *x /= norm;
    }
}

/// Build the run conditioning from the configured source.
pub fn assemble(
    config: &GenerateConfig,
    extractor: &dyn FeatureExtractor,
    instance_cache: Option<&StoredInstanceCache>,
    device: &Device,
) -> Result<Conditioning> {
    let instance = match config.conditioning_source()? {
        ConditioningSource::ReferenceImage(path) => {
            info!("extracting instance features from {}", path.display());
            let input = preprocess::load_reference_image(&path, config.resolution, device)?;
            let features = extractor.extract(&input)?;
            let mut row = features.flatten_all()?.to_vec1::<f32>()?;
            unit_normalize(&mut row);
            Some(row)
        }
        ConditioningSource::StoredFeature(index) => {
            info!("conditioning on stored instance {}", index);
            let cache = instance_cache.ok_or(RunError::NoInstanceCache(index))?;
            let mut row = cache.lookup(index)?;
            unit_normalize(&mut row);
            Some(row)
        }
        ConditioningSource::None => None,
    };
    Ok(Conditioning {
        instance,
        class_index: config.effective_class_index(),
    })
}
