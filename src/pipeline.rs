//! End-to-end run orchestration
//!
//! A `Session` owns the memoized model handles and the loaders that produce
//! them, and drives one configured run: conditioning assembly, batched
//! generation and ranking, post-processing, persistence. Model handles
//! survive across runs and are reloaded only when the configured model
//! changes.

use anyhow::Result;
use candle_core::Device;
use log::info;
use std::path::PathBuf;

use crate::conditioning::{self, ConditioningSource};
use crate::config::{GenerateConfig, PostStageConfig};
use crate::error::RunError;
use crate::instances::StoredInstanceCache;
use crate::models::{FeatureExtractor, Generator, ModelCache, Upscaler};
use crate::noise;
use crate::output;
use crate::postprocess::{PostPipeline, UpscaleStage};
use crate::sampler::{self, Candidate, SampleParams};

pub type UpscalerLoader = Box<dyn Fn() -> Result<Box<dyn Upscaler>>>;

pub struct Session {
    device: Device,
    generators: ModelCache<dyn Generator>,
    extractors: ModelCache<dyn FeatureExtractor>,
    upscaler_loader: Option<UpscalerLoader>,
    instance_cache: Option<StoredInstanceCache>,
}

impl Session {
    pub fn new(
        device: Device,
        generator_loader: impl Fn(&str) -> Result<Box<dyn Generator>> + 'static,
        extractor_loader: impl Fn(&str) -> Result<Box<dyn FeatureExtractor>> + 'static,
    ) -> Self {
        Self {
            device,
            generators: ModelCache::new(generator_loader),
            extractors: ModelCache::new(extractor_loader),
            upscaler_loader: None,
            instance_cache: None,
        }
    }

    pub fn with_upscaler(
        mut self,
        loader: impl Fn() -> Result<Box<dyn Upscaler>> + 'static,
    ) -> Self {
        self.upscaler_loader = Some(Box::new(loader));
        self
    }

    pub fn with_instance_cache(mut self, cache: StoredInstanceCache) -> Self {
        self.instance_cache = Some(cache);
        self
    }

    /// Drop all cached model handles; the next run reloads them.
    pub fn invalidate_models(&mut self) {
        self.generators.invalidate();
        self.extractors.invalidate();
    }

    /// Execute one configured run and return the written image paths.
    pub fn run(&mut self, config: &GenerateConfig) -> Result<Vec<PathBuf>> {
        config.validate()?;

        // The stored cache is loaded lazily, on the first run that needs it.
        if let ConditioningSource::StoredFeature(index) = config.conditioning_source()? {
            if self.instance_cache.is_none() {
                let path = config
                    .instance_cache_path
                    .as_ref()
                    .ok_or(RunError::NoInstanceCache(index))?;
                self.instance_cache = Some(StoredInstanceCache::load(path)?);
            }
        }

        let postprocess = build_postprocess(&self.upscaler_loader, config)?;
        let device = self.device.clone();

        let experiment = config.gen_model.experiment_name(config.resolution);
        info!("running {} ({})", config.gen_model.name(), experiment);
        let extractor = self.extractors.get(config.gen_model.feature_extractor_name())?;
        let generator = self.generators.get(&experiment)?;

        let conditioning =
            conditioning::assemble(config, extractor, self.instance_cache.as_ref(), &device)?;

        let params = SampleParams {
            num_total: config.num_samples_total,
            num_ranked: config.num_samples_ranked,
            batch_size: config.batch_size,
            truncation: config.truncation,
            truncation_mode: config.truncation_mode,
            noise_size: config.noise_size,
        };
        let mut rng = noise::seeded_rng(config.seed);
        let selection =
            sampler::generate_ranked(generator, extractor, &conditioning, &params, &mut rng, &device)?;

        let candidates = if postprocess.is_empty() {
            selection.candidates
        } else {
            selection
                .candidates
                .into_iter()
                .map(|candidate| {
                    Ok(Candidate {
                        image: postprocess.apply(&candidate.image)?,
                        distance: candidate.distance,
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };

        output::save_selection(config, &candidates)
    }
}

fn build_postprocess(
    upscaler_loader: &Option<UpscalerLoader>,
    config: &GenerateConfig,
) -> Result<PostPipeline> {
    let mut pipeline = PostPipeline::new();
    for stage in &config.postprocess {
        match stage {
            PostStageConfig::Upscale { outscale, enabled } => {
                if !enabled {
                    continue;
                }
                let loader = upscaler_loader
                    .as_ref()
                    .ok_or_else(|| RunError::MissingPostStage("upscale".to_string()))?;
                pipeline.push(Box::new(UpscaleStage::new(loader()?, *outscale)));
            }
        }
    }
    Ok(pipeline)
}
