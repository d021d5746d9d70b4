//! Deterministic random number generation for synthetic source data.
//!
//! RULE: The engine itself is deterministic and never draws randomness.
//! Only the sample-data generator uses this, so a seeded run produces
//! byte-identical collaborator tables every time.

use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

pub struct DataRng {
    inner: Pcg64Mcg,
}

impl DataRng {
    /// Derive a stream from the master seed and a stable stream index.
    /// The index must never change once assigned, so adding a new data
    /// shape never perturbs existing streams.
    pub fn new(master_seed: u64, stream_index: u64) -> Self {
        let derived = master_seed ^ (stream_index.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        Self {
            inner: Pcg64Mcg::seed_from_u64(derived),
        }
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        use rand::RngCore;
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Roll a u64 in [0, n).
    pub fn next_u64_below(&mut self, n: u64) -> u64 {
        use rand::RngCore;
        assert!(n > 0, "n must be > 0");
        self.inner.next_u64() % n
    }

    /// Bernoulli trial: returns true with probability p.
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// Uniform float in [lo, hi).
    pub fn range_f64(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }
}
