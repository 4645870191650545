//! Per-task batch iteration over a split.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;
use tracing::debug;

use crate::augment::{augment_policy, augment_rec};
use crate::batch::{BatchBuilder, ConvBatch, Mode, PolicyBatch, PretrainBatch, RecBatch};
use crate::error::Result;
use crate::record::ConversationRecord;
use crate::sampling::NegativeSampler;

/// Chunks the records of one split into task batches.
///
/// Augmentation runs before chunking, so `rec_batches` and
/// `policy_batches` see one record per supervised target.
#[derive(Debug, Clone)]
pub struct DataLoader {
    records: Vec<ConversationRecord>,
    builder: BatchBuilder,
    mode: Mode,
    rng: XorShiftRng,
    sampler: NegativeSampler,
    recommender_only: bool,
}

impl DataLoader {
    pub fn new(records: Vec<ConversationRecord>, builder: BatchBuilder, mode: Mode, seed: u64) -> Self {
        // negatives are drawn from 1..=n_entity-1 so they stay valid entity ids
        let item_size = builder.vocab().n_entity.saturating_sub(1) as u32;
        Self {
            records,
            builder,
            mode,
            rng: XorShiftRng::seed_from_u64(seed),
            sampler: NegativeSampler::new(item_size, seed.wrapping_add(1)),
            recommender_only: false,
        }
    }

    /// Only expand recommender turns into recommendation examples.
    pub fn with_recommender_only(mut self, enabled: bool) -> Self {
        self.recommender_only = enabled;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[ConversationRecord] {
        &self.records
    }

    pub fn builder(&self) -> &BatchBuilder {
        &self.builder
    }

    fn order(&mut self, records: Vec<ConversationRecord>, shuffle: bool) -> Vec<ConversationRecord> {
        let mut records = records;
        if shuffle {
            records.shuffle(&mut self.rng);
        }
        records
    }

    pub fn pretrain_batches(&mut self, batch_size: usize, shuffle: bool) -> Vec<PretrainBatch> {
        let records = self.order(self.records.clone(), shuffle);
        records
            .chunks(batch_size.max(1))
            .map(|chunk| self.builder.pretrain_batch(chunk))
            .collect()
    }

    pub fn rec_batches(&mut self, batch_size: usize, shuffle: bool) -> Result<Vec<RecBatch>> {
        let augmented = augment_rec(&self.records, self.recommender_only);
        debug!(
            records = self.records.len(),
            augmented = augmented.len(),
            "rec augmentation"
        );
        let records = self.order(augmented, shuffle);
        let mut batches = Vec::with_capacity(records.len().div_ceil(batch_size.max(1)));
        for chunk in records.chunks(batch_size.max(1)) {
            batches.push(self.builder.rec_batch(chunk, &mut self.sampler)?);
        }
        Ok(batches)
    }

    pub fn conv_batches(&mut self, batch_size: usize, shuffle: bool) -> Vec<ConvBatch> {
        let records = self.order(self.records.clone(), shuffle);
        records
            .chunks(batch_size.max(1))
            .map(|chunk| self.builder.conv_batch(chunk, self.mode))
            .collect()
    }

    pub fn policy_batches(&mut self, batch_size: usize, shuffle: bool) -> Result<Vec<PolicyBatch>> {
        let augmented = augment_policy(&self.records);
        let records = self.order(augmented, shuffle);
        records
            .chunks(batch_size.max(1))
            .map(|chunk| self.builder.policy_batch(chunk))
            .collect()
    }
}
