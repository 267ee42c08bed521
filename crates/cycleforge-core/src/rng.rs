//! Seeded randomness for the whole run.
//!
//! One `Rng` per search, passed explicitly. The generator is wyrand via
//! `fastrand`, so a seed replays the exact mutation and acceptance sequence
//! on any platform. Child searches get hash-derived seeds so bet outcomes
//! never depend on how much entropy the parent consumed.

use crate::error::{ForgeError, ForgeResult};
use sha2::{Digest, Sha256};
use std::f64::consts::PI;

#[derive(Debug, Clone)]
pub struct Rng {
    seed: u64,
    inner: fastrand::Rng,
}

impl Rng {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            inner: fastrand::Rng::with_seed(seed),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Uniform index in `[0, n)`.
    pub fn uniform_index(&mut self, n: usize) -> usize {
        debug_assert!(n > 0);
        self.inner.usize(0..n)
    }

    /// Uniform real in `[0, 1)`.
    pub fn uniform_real(&mut self) -> f64 {
        self.inner.f64()
    }

    pub fn coin(&mut self) -> bool {
        self.inner.bool()
    }

    /// Weighted pick: cumulative sum, then binary search on the prefix table.
    pub fn pick_weighted(&mut self, weights: &[f64]) -> ForgeResult<usize> {
        if weights.is_empty() {
            return Err(ForgeError::BadConfig("pick_weighted on empty weights".into()));
        }
        let mut cumulative = Vec::with_capacity(weights.len());
        let mut sum = 0.0;
        for &w in weights {
            if w < 0.0 || !w.is_finite() {
                return Err(ForgeError::BadConfig(format!("bad weight {w}")));
            }
            sum += w;
            cumulative.push(sum);
        }
        if sum <= 0.0 {
            // All-zero weights degrade to a uniform pick.
            return Ok(self.uniform_index(weights.len()));
        }
        let target = self.uniform_real() * sum;
        let idx = cumulative.partition_point(|&c| c <= target);
        Ok(idx.min(weights.len() - 1))
    }

    /// Cauchy sample via the inverse CDF.
    pub fn cauchy(&mut self, loc: f64, scale: f64) -> ForgeResult<f64> {
        if scale <= 0.0 {
            return Err(ForgeError::BadConfig(format!(
                "cauchy scale must be positive, got {scale}"
            )));
        }
        let u = self.uniform_real();
        Ok(loc + scale * (PI * (u - 0.5)).tan())
    }

    /// Child generator `i`, seeded from a hash of (seed, i).
    pub fn derive(&self, i: u64) -> Rng {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.to_le_bytes());
        hasher.update(i.to_le_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Rng::with_seed(u64::from_le_bytes(bytes))
    }

    /// Short stable identifier of the seed. Names both the cache dir and
    /// the exported state file, so the token is always 16 hex digits.
    pub fn short_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.to_le_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..8])
    }
}
