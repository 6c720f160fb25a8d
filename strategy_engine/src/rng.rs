//! Per-trial random number generation.
//!
//! Every trial owns a generator seeded from `(base_seed, trial_index)`, so a
//! trial's draws never depend on which worker ran it or in what order.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use xxhash_rust::xxh3::{xxh3_64, xxh3_64_with_seed};

#[derive(Debug, Clone)]
pub struct TrialRng {
    inner: ChaCha8Rng,
}

impl TrialRng {
    pub fn from_seed(seed: u64) -> Self {
        Self {
            inner: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Uniform in [0, 1).
    pub fn uniform(&mut self) -> f64 {
        self.inner.random::<f64>()
    }

    pub fn uniform_range(&mut self, min: f64, max: f64) -> f64 {
        min + (max - min) * self.uniform()
    }

    /// Bernoulli draw; `p` is clamped so NaN or out-of-range inputs never panic.
    pub fn chance(&mut self, p: f64) -> bool {
        self.uniform() < clamp_probability(p)
    }

    /// Box-Muller; always consumes two uniforms.
    pub fn standard_normal(&mut self) -> f64 {
        let u1 = self.uniform().max(f64::EPSILON);
        let u2 = self.uniform();
        (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
    }

    pub fn normal(&mut self, mean: f64, std: f64) -> f64 {
        mean + std.max(0.0) * self.standard_normal()
    }
}

/// Trial index hashed under the base seed. Neighbouring base seeds therefore
/// share no trial streams, unlike a plain `base + trial` offset.
pub fn trial_seed(base_seed: u64, trial: u32) -> u64 {
    xxh3_64_with_seed(&trial.to_le_bytes(), base_seed)
}

/// Changing the hash function changes every historical seeded optimizer run.
pub fn strategy_hash(name: &str) -> u64 {
    xxh3_64(name.as_bytes())
}

pub fn candidate_seed(base_seed: u64, trial: u32, strategy_name: &str) -> u64 {
    trial_seed(base_seed.wrapping_add(strategy_hash(strategy_name)), trial)
}

/// Seed for callers that did not ask for reproducibility.
pub fn fresh_seed() -> u64 {
    rand::rng().random()
}

pub fn clamp_probability(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 1.0)
    }
}
