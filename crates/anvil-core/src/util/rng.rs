use rand::{RngCore, SeedableRng, rngs::StdRng};
use serde::Serialize;

/// Seedable random number generator.
///
/// Wraps StdRng to provide deterministic randomness from a seed value. Cloning
/// restarts the stream from the seed.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct Rng {
    seed: u64,
    #[serde(skip_serializing)]
    rng: StdRng,
}

impl Rng {
    /// Creates a new RNG from a seed value.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Derives an independent stream for one page of a region.
    ///
    /// The same `(seed, page)` pair always yields the same stream, which lets a
    /// scan recompute the expected contents of any page without replaying the
    /// pages before it.
    pub fn for_page(seed: u64, page: usize) -> Self {
        let mixed = seed ^ (page as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        Self::from_seed(mixed)
    }
}

impl RngCore for Rng {
    fn next_u32(&mut self) -> u32 {
        self.rng.next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.rng.next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.rng.fill_bytes(dest);
    }
}

impl Clone for Rng {
    fn clone(&self) -> Self {
        Self::from_seed(self.seed)
    }
}
