//! Truncated-normal noise sampling for the generator input
//!
//! Noise components live in `[-2 * truncation, 2 * truncation]`. The base
//! vectors are drawn truncated; `TruncationMode` controls how out-of-bound
//! components are brought back in range when a vector is re-checked before a
//! forward pass: `Clamp` clips them, `ResampleOutliers` redraws only the
//! offending components from the truncated distribution, which preserves the
//! tail shape better than clipping.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationMode {
    #[default]
    Clamp,
    ResampleOutliers,
}

/// RNG for one run. No seed means a fresh entropy-seeded generator.
pub fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn draw_truncated(bound: f32, rng: &mut StdRng) -> f32 {
    // Rejection sampling against the standard normal. Acceptance drops with
    // the bound but stays workable for truncation values down to ~0.05.
    loop {
        let v: f32 = rng.sample(StandardNormal);
        if v.abs() <= bound {
            return v;
        }
    }
}

/// Draw `count` independent noise vectors of `dim` components, row-major,
/// every component within `[-2 * truncation, 2 * truncation]`.
pub fn sample_truncated(count: usize, dim: usize, truncation: f32, rng: &mut StdRng) -> Vec<f32> {
    let bound = 2.0 * truncation;
    let mut out = Vec::with_capacity(count * dim);
    for _ in 0..count * dim {
        out.push(draw_truncated(bound, rng));
    }
    out
}

/// Bring every component of `noise` back within the truncation bound
/// according to `mode`. A vector with no out-of-bound components is left
/// untouched in both modes.
pub fn enforce_truncation(noise: &mut [f32], truncation: f32, mode: TruncationMode, rng: &mut StdRng) {
    let bound = 2.0 * truncation;
    match mode {
        TruncationMode::Clamp => {
            for v in noise.iter_mut() {
                *v = v.clamp(-bound, bound);
            }
        }
        TruncationMode::ResampleOutliers => {
            for v in noise.iter_mut() {
                if v.abs() > bound {
                    *v = draw_truncated(bound, rng);
                }
            }
        }
    }
}
