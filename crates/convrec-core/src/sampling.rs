//! Negative item sampling for history modeling.

use std::collections::HashSet;

use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use crate::error::{Error, Result};

/// Uniform rejection sampler over the item space `1..=item_size`.
#[derive(Debug, Clone)]
pub struct NegativeSampler {
    item_size: u32,
    rng: XorShiftRng,
}

impl NegativeSampler {
    pub fn new(item_size: u32, seed: u64) -> Self {
        Self {
            item_size,
            rng: XorShiftRng::seed_from_u64(seed),
        }
    }

    pub fn item_size(&self) -> u32 {
        self.item_size
    }

    /// Draw one id not contained in `exclude`.
    ///
    /// Fails instead of looping forever when `exclude` covers the whole
    /// item space.
    pub fn sample(&mut self, exclude: &HashSet<u32>) -> Result<u32> {
        let covered = exclude
            .iter()
            .filter(|&&id| id >= 1 && id <= self.item_size)
            .count();
        if covered >= self.item_size as usize {
            return Err(Error::InvalidArgument(format!(
                "cannot sample a negative: {covered} excluded ids cover all {} items",
                self.item_size
            )));
        }
        loop {
            let item = self.rng.random_range(1..=self.item_size);
            if !exclude.contains(&item) {
                return Ok(item);
            }
        }
    }

    /// One negative per position of `sequence`, none of them in the sequence.
    pub fn sample_for(&mut self, sequence: &[u32]) -> Result<Vec<u32>> {
        let seen: HashSet<u32> = sequence.iter().copied().collect();
        sequence.iter().map(|_| self.sample(&seen)).collect()
    }
}
