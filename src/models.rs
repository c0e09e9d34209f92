//! External model collaborators and their memoizing cache
//!
//! The generator, feature extractor and upscaler are pretrained artifacts;
//! this crate only defines the seams they are invoked through. `ModelCache`
//! replaces load-once globals with an explicit object: one entry, keyed by
//! model identifier, reloaded on key change, invalidated on demand.

use anyhow::Result;
use candle_core::Tensor;
use log::info;

/// Pretrained generator network.
pub trait Generator {
    /// `noise` is `[n, noise_dim]`, `labels` is `[n]` of i64 class indices,
    /// `instance` is `[n, feat_dim]` of unit-normalized embeddings. Returns
    /// images `[n, 3, H, W]` with values in `[-1, 1]`.
    fn generate(
        &self,
        noise: &Tensor,
        labels: Option<&Tensor>,
        instance: Option<&Tensor>,
    ) -> Result<Tensor>;

    fn noise_dim(&self) -> usize;
}

/// Pretrained feature extractor mapping preprocessed images `[n, 3, 224, 224]`
/// to embeddings `[n, feat_dim]`.
pub trait FeatureExtractor {
    fn extract(&self, images: &Tensor) -> Result<Tensor>;
    fn feature_dim(&self) -> usize;
}

/// Super-resolution network applied as an optional post-processing stage.
pub trait Upscaler {
    /// `image` is `[3, H, W]` in `[-1, 1]`; returns `[3, H*outscale, W*outscale]`.
    fn enhance(&self, image: &Tensor, outscale: usize) -> Result<Tensor>;
}

pub type ModelLoader<T> = Box<dyn Fn(&str) -> Result<Box<T>>>;

/// Single-entry memoizing cache for a loaded model handle.
pub struct ModelCache<T: ?Sized> {
    loader: ModelLoader<T>,
    entry: Option<(String, Box<T>)>,
}

impl<T: ?Sized> ModelCache<T> {
    pub fn new(loader: impl Fn(&str) -> Result<Box<T>> + 'static) -> Self {
        Self {
            loader: Box::new(loader),
            entry: None,
        }
    }

    /// Return the cached model for `key`, loading it first if the cache is
    /// empty or holds a different key.
    pub fn get(&mut self, key: &str) -> Result<&T> {
        let stale = !matches!(&self.entry, Some((cached, _)) if cached == key);
        if stale {
            info!("loading model '{}'", key);
            let model = (self.loader)(key)?;
            self.entry = Some((key.to_string(), model));
        }
        match &self.entry {
            Some((_, model)) => Ok(model.as_ref()),
            None => unreachable!("cache entry filled above"),
        }
    }

    pub fn cached_key(&self) -> Option<&str> {
        self.entry.as_ref().map(|(key, _)| key.as_str())
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}
