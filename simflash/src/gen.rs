//! Test data generation.
//!
//! Deterministic payloads for filesystem tests: either pseudorandom bytes
//! from a seeded PRNG, or the repeating 0x00..0xFF ramp traditionally used
//! to eyeball flash dumps.  Same seed, same bytes, every run.

use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;

pub struct PatternBuilder {
    /// Total size of the generated payload.
    size: usize,
    /// Seed for the PRNG.
    seed: u64,
}

impl Default for PatternBuilder {
    fn default() -> Self {
        PatternBuilder { size: 768, seed: 1 }
    }
}

impl PatternBuilder {
    pub fn size(&mut self, size: usize) -> &mut Self {
        self.size = size;
        self
    }

    pub fn seed(&mut self, seed: u64) -> &mut Self {
        self.seed = seed;
        self
    }

    /// Pseudorandom payload from the configured seed.
    pub fn random(&self) -> Vec<u8> {
        let mut rng = Xoshiro256Plus::seed_from_u64(self.seed);
        let mut data = vec![0u8; self.size];
        rng.fill_bytes(&mut data);
        data
    }

    /// Byte ramp 0x00, 0x01, .. 0xFF, 0x00, .. offset by the seed.
    pub fn sequence(&self) -> Vec<u8> {
        (0..self.size)
            .map(|i| (i as u64 + self.seed) as u8)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::PatternBuilder;

    #[test]
    fn deterministic() {
        let a = PatternBuilder::default().seed(7).random();
        let b = PatternBuilder::default().seed(7).random();
        assert_eq!(a, b);
        let c = PatternBuilder::default().seed(8).random();
        assert_ne!(a, c);
    }

    #[test]
    fn sequence_ramp() {
        let data = PatternBuilder::default().size(768).seed(0).sequence();
        assert_eq!(data.len(), 768);
        assert_eq!(&data[..4], &[0, 1, 2, 3]);
        assert_eq!(data[255], 0xff);
        assert_eq!(data[256], 0x00);
    }
}
