//! Error taxonomy for sampling runs
//!
//! Configuration errors reject a run before any generation happens; resource
//! errors mean a model or cache file could not be loaded. Numerical edge
//! cases (empty outlier set, near-zero norms) are handled inline and never
//! surface as errors.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum RunError {
    #[error("conflicting conditioning sources: both a reference image and a stored feature index were supplied")]
    ConflictingConditioning,
    #[error("num_samples_ranked ({ranked}) exceeds num_samples_total ({total})")]
    RankedExceedsTotal { ranked: usize, total: usize },
    #[error("truncation must be in (0, 1], got {0}")]
    InvalidTruncation(f32),
    #[error("batch_size must be non-zero")]
    ZeroBatchSize,
    #[error("stored feature index {0} requested but no instance cache is configured")]
    NoInstanceCache(usize),
    #[error("stored instance index {index} out of range (cache holds {len} instances)")]
    InstanceIndexOutOfRange { index: usize, len: usize },
    #[error("instance cache file not found: {0}")]
    MissingInstanceCache(PathBuf),
    #[error("post-processing stage '{0}' enabled but no implementation was provided")]
    MissingPostStage(String),
}
