//! Optional post-processing stages for the final selection
//!
//! Stages run in order over each selected image, each one independently
//! enable-able from configuration. An empty pipeline is the common case.

use anyhow::Result;
use candle_core::Tensor;
use log::debug;

use crate::models::Upscaler;

pub trait PostStage {
    fn name(&self) -> &str;
    /// `image` is `[3, H, W]` in `[-1, 1]`; output keeps the same layout.
    fn apply(&self, image: &Tensor) -> Result<Tensor>;
}

/// Super-resolution stage delegating to a pretrained upscaler.
pub struct UpscaleStage {
    upscaler: Box<dyn Upscaler>,
    outscale: usize,
}

impl UpscaleStage {
    pub fn new(upscaler: Box<dyn Upscaler>, outscale: usize) -> Self {
        Self { upscaler, outscale }
    }
}

impl PostStage for UpscaleStage {
    fn name(&self) -> &str {
        "upscale"
    }

    fn apply(&self, image: &Tensor) -> Result<Tensor> {
        self.upscaler.enhance(image, self.outscale)
    }
}

#[derive(Default)]
pub struct PostPipeline {
    stages: Vec<Box<dyn PostStage>>,
}

impl PostPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: Box<dyn PostStage>) {
        self.stages.push(stage);
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn apply(&self, image: &Tensor) -> Result<Tensor> {
        let mut out = image.clone();
        for stage in &self.stages {
            debug!("applying post stage '{}'", stage.name());
            out = stage.apply(&out)?;
        }
        Ok(out)
    }
}
