//! The batch builder.
//!
//! Converts conversation records into rectangular id matrices, one batch
//! type per task. Every field with a configured truncation length is padded
//! to exactly that width, so all batches of one task share a shape.
//!
//! | field | truncation | padding |
//! |-------|------------|---------|
//! | conversation context | drop oldest | left |
//! | recommendation context | drop oldest | right (after START/END) |
//! | entities, words, history | drop oldest | left |
//! | response | drop tail, END appended | right |
//! | policy context | drop oldest, CLS prefixed | right |

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::padding::{
    add_start_end, merge_utterances, multi_hot, pad_matrix, truncate, FloatMatrix, IdMatrix,
};
use crate::record::ConversationRecord;
use crate::sampling::NegativeSampler;
use crate::vocab::Vocab;

/// Which split a batch is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Train,
    Valid,
    Test,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Train => "train",
            Mode::Valid => "valid",
            Mode::Test => "test",
        })
    }
}

/// Per-field maximum lengths. `None` means "pad to the longest row".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TruncationConfig {
    pub context_truncate: Option<usize>,
    pub response_truncate: Option<usize>,
    pub entity_truncate: Option<usize>,
    pub word_truncate: Option<usize>,
    pub item_truncate: Option<usize>,
}

impl Default for TruncationConfig {
    fn default() -> Self {
        Self {
            context_truncate: Some(256),
            response_truncate: Some(30),
            entity_truncate: Some(32),
            word_truncate: Some(64),
            item_truncate: Some(100),
        }
    }
}

impl TruncationConfig {
    pub fn with_context(mut self, n: usize) -> Self {
        self.context_truncate = Some(n);
        self
    }

    pub fn with_response(mut self, n: usize) -> Self {
        self.response_truncate = Some(n);
        self
    }

    pub fn with_entity(mut self, n: usize) -> Self {
        self.entity_truncate = Some(n);
        self
    }

    pub fn with_word(mut self, n: usize) -> Self {
        self.word_truncate = Some(n);
        self
    }

    pub fn with_item(mut self, n: usize) -> Self {
        self.item_truncate = Some(n);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.response_truncate == Some(0) {
            return Err(Error::InvalidArgument(
                "response_truncate must leave room for the end token".into(),
            ));
        }
        if matches!(self.context_truncate, Some(n) if n < 2) {
            return Err(Error::InvalidArgument(
                "context_truncate must leave room for start and end tokens".into(),
            ));
        }
        Ok(())
    }
}

/// Entity-label pretraining batch.
#[derive(Debug, Clone)]
pub struct PretrainBatch {
    /// `(bs, word_truncate)`, left padded with `pad_word`.
    pub words: IdMatrix,
    /// `(bs, n_entity)` multi-hot of mentioned entities.
    pub entity_labels: FloatMatrix,
}

/// Interaction-history view used by sequential recommenders.
#[derive(Debug, Clone)]
pub struct HistoryBatch {
    pub input_ids: IdMatrix,
    pub target_pos: IdMatrix,
    pub input_mask: IdMatrix,
    pub sample_negs: IdMatrix,
}

/// Recommendation batch.
#[derive(Debug, Clone)]
pub struct RecBatch {
    pub context_entities: IdMatrix,
    pub context_words: IdMatrix,
    pub entity_labels: FloatMatrix,
    /// Target item of every example.
    pub items: Vec<u32>,
    /// Separator-joined tokens wrapped in START/END, right padded.
    pub context: IdMatrix,
    pub context_mask: IdMatrix,
    pub history: HistoryBatch,
}

/// Conversation-generation batch.
#[derive(Debug, Clone)]
pub struct ConvBatch {
    pub context_tokens: IdMatrix,
    /// Context with item or topic tokens injected; equal to
    /// `context_tokens` outside of training.
    pub enhanced_context_tokens: IdMatrix,
    pub context_entities: IdMatrix,
    pub context_words: IdMatrix,
    /// Target tokens ending with END, right padded. START is not included.
    pub response: IdMatrix,
}

impl ConvBatch {
    /// Context followed by response, the layout of a decoder-only model.
    pub fn input_ids(&self) -> Option<IdMatrix> {
        self.context_tokens.hcat(&self.response)
    }

    pub fn enhanced_input_ids(&self) -> Option<IdMatrix> {
        self.enhanced_context_tokens.hcat(&self.response)
    }
}

/// Topic-policy batch.
#[derive(Debug, Clone)]
pub struct PolicyBatch {
    pub context: IdMatrix,
    pub context_mask: IdMatrix,
    pub context_policy: IdMatrix,
    pub context_policy_mask: IdMatrix,
    /// One row per profile sentence across the whole batch.
    pub user_profile: IdMatrix,
    pub user_profile_mask: IdMatrix,
    pub target_topics: Vec<u32>,
}

/// Builds task batches from records.
#[derive(Debug, Clone)]
pub struct BatchBuilder {
    vocab: Arc<Vocab>,
    truncation: TruncationConfig,
    conv_separator: Option<u32>,
    enhance_context: bool,
}

impl BatchBuilder {
    pub fn new(vocab: Arc<Vocab>, truncation: TruncationConfig) -> Self {
        Self {
            vocab,
            truncation,
            conv_separator: None,
            enhance_context: false,
        }
    }

    /// Token inserted between utterances of the conversation context.
    pub fn with_conv_separator(mut self, sep: Option<u32>) -> Self {
        self.conv_separator = sep;
        self
    }

    /// Inject item or topic tokens into the training context.
    pub fn with_context_enhancement(mut self, enabled: bool) -> Self {
        self.enhance_context = enabled;
        self
    }

    pub fn vocab(&self) -> &Vocab {
        &self.vocab
    }

    pub fn truncation(&self) -> &TruncationConfig {
        &self.truncation
    }

    fn entity_row(&self, record: &ConversationRecord) -> Vec<u32> {
        truncate(&record.context_entities, self.truncation.entity_truncate, false)
    }

    fn word_row(&self, record: &ConversationRecord) -> Vec<u32> {
        truncate(&record.context_words, self.truncation.word_truncate, false)
    }

    fn entity_labels(&self, records: &[ConversationRecord]) -> FloatMatrix {
        let pad = self.vocab.pad_entity;
        let rows: Vec<Vec<u32>> = records
            .iter()
            .map(|r| r.context_entities.iter().copied().filter(|&e| e != pad).collect())
            .collect();
        multi_hot(&rows, self.vocab.n_entity)
    }

    fn entities_and_words(&self, records: &[ConversationRecord]) -> (IdMatrix, IdMatrix) {
        let entities: Vec<_> = records.iter().map(|r| self.entity_row(r)).collect();
        let words: Vec<_> = records.iter().map(|r| self.word_row(r)).collect();
        (
            pad_matrix(
                &entities,
                self.vocab.pad_entity,
                false,
                self.truncation.entity_truncate,
            ),
            pad_matrix(&words, self.vocab.pad_word, false, self.truncation.word_truncate),
        )
    }

    pub fn pretrain_batch(&self, records: &[ConversationRecord]) -> PretrainBatch {
        let words: Vec<_> = records.iter().map(|r| self.word_row(r)).collect();
        PretrainBatch {
            words: pad_matrix(&words, self.vocab.pad_word, false, self.truncation.word_truncate),
            entity_labels: self.entity_labels(records),
        }
    }

    /// Recommendation context: utterances joined by `sent_split`, oldest
    /// tokens dropped, then wrapped in START/END.
    pub fn rec_context(&self, context_tokens: &[Vec<u32>]) -> Vec<u32> {
        let merged = merge_utterances(context_tokens, Some(self.vocab.sent_split), false, None);
        let budget = self.truncation.context_truncate.map(|n| n.saturating_sub(2));
        add_start_end(
            truncate(&merged, budget, false),
            Some(self.vocab.start),
            Some(self.vocab.end),
        )
    }

    fn history_rows(
        &self,
        history: &[u32],
        item: u32,
        sampler: &mut NegativeSampler,
    ) -> Result<[Vec<u32>; 4]> {
        let input_ids = truncate(history, self.truncation.item_truncate, false);
        let mut target_pos: Vec<u32> = input_ids.iter().skip(1).copied().collect();
        target_pos.push(item);
        let input_mask = vec![1; input_ids.len()];
        let negs = sampler.sample_for(&input_ids)?;
        Ok([input_ids, target_pos, input_mask, negs])
    }

    /// Recommendation batch. Every record must carry an `item` target.
    pub fn rec_batch(
        &self,
        records: &[ConversationRecord],
        sampler: &mut NegativeSampler,
    ) -> Result<RecBatch> {
        let mut items = Vec::with_capacity(records.len());
        let mut contexts = Vec::with_capacity(records.len());
        let mut history: [Vec<Vec<u32>>; 4] = Default::default();

        for (index, record) in records.iter().enumerate() {
            let item = record.item.ok_or(Error::MissingTarget {
                index,
                field: "item",
            })?;
            items.push(item);
            contexts.push(self.rec_context(&record.context_tokens));
            let rows = self.history_rows(&record.history_items(), item, sampler)?;
            for (column, row) in history.iter_mut().zip(rows) {
                column.push(row);
            }
        }

        let pad = self.vocab.pad;
        let item_len = self.truncation.item_truncate;
        let context = pad_matrix(&contexts, pad, true, self.truncation.context_truncate);
        let context_mask = context.mask(pad);
        let [ids, pos, mask, negs] = history;
        let (context_entities, context_words) = self.entities_and_words(records);

        Ok(RecBatch {
            context_entities,
            context_words,
            entity_labels: self.entity_labels(records),
            items,
            context,
            context_mask,
            history: HistoryBatch {
                input_ids: pad_matrix(&ids, pad, false, item_len),
                target_pos: pad_matrix(&pos, pad, false, item_len),
                input_mask: pad_matrix(&mask, pad, false, item_len),
                sample_negs: pad_matrix(&negs, pad, false, item_len),
            },
        })
    }

    fn conv_context(&self, context_tokens: &[Vec<u32>]) -> Vec<u32> {
        let merged = merge_utterances(context_tokens, self.conv_separator, false, None);
        truncate(&merged, self.truncation.context_truncate, false)
    }

    /// Target response: at most `response_truncate - 1` tokens, then END.
    pub fn response_row(&self, response: &[u32]) -> Vec<u32> {
        let budget = self.truncation.response_truncate.map(|n| n.saturating_sub(1));
        add_start_end(truncate(response, budget, true), None, Some(self.vocab.end))
    }

    fn enhanced_by_item(&self, record: &ConversationRecord) -> Vec<u32> {
        let names: Vec<Vec<u32>> = record
            .items
            .iter()
            .map(|&id| self.vocab.entity_tokens(id))
            .collect();
        if names.is_empty() {
            return Vec::new();
        }
        let merged = merge_utterances(
            &names,
            Some(self.vocab.word_split),
            false,
            Some(self.vocab.sent_split),
        );
        let budget = match (self.truncation.item_truncate, self.truncation.context_truncate) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        truncate(&merged, budget, false)
    }

    fn enhanced_by_topic(&self, record: &ConversationRecord) -> Vec<u32> {
        let topics: Vec<Vec<u32>> = record
            .target_topics()
            .map(|id| self.vocab.topic_tokens(id))
            .collect();
        if topics.is_empty() {
            return Vec::new();
        }
        let merged = merge_utterances(
            &topics,
            Some(self.vocab.word_split),
            false,
            Some(self.vocab.sent_split),
        );
        truncate(&merged, self.truncation.context_truncate, false)
    }

    /// Context with the target item's name or the target topics prepended.
    ///
    /// Item enhancement wins over topic enhancement. The total length never
    /// exceeds `context_truncate`.
    pub fn enhanced_context(&self, record: &ConversationRecord, context: &[u32]) -> Vec<u32> {
        let mut prefix = self.enhanced_by_item(record);
        if prefix.is_empty() {
            prefix = self.enhanced_by_topic(record);
        }
        if prefix.is_empty() {
            return context.to_vec();
        }
        let budget = self
            .truncation
            .context_truncate
            .map(|n| n.saturating_sub(prefix.len()));
        prefix.extend(truncate(context, budget, false));
        prefix
    }

    /// Conversation batch. Context enhancement only applies in
    /// [`Mode::Train`].
    pub fn conv_batch(&self, records: &[ConversationRecord], mode: Mode) -> ConvBatch {
        let enhance = self.enhance_context && mode == Mode::Train;
        let mut contexts = Vec::with_capacity(records.len());
        let mut enhanced = Vec::with_capacity(records.len());
        let mut responses = Vec::with_capacity(records.len());
        for record in records {
            let context = self.conv_context(&record.context_tokens);
            enhanced.push(if enhance {
                self.enhanced_context(record, &context)
            } else {
                context.clone()
            });
            contexts.push(context);
            responses.push(self.response_row(&record.response));
        }

        let pad = self.vocab.pad;
        let ctx_len = self.truncation.context_truncate;
        let (context_entities, context_words) = self.entities_and_words(records);
        ConvBatch {
            context_tokens: pad_matrix(&contexts, pad, false, ctx_len),
            enhanced_context_tokens: pad_matrix(&enhanced, pad, false, ctx_len),
            context_entities,
            context_words,
            response: pad_matrix(&responses, pad, true, self.truncation.response_truncate),
        }
    }

    fn final_topic_tokens(&self, record: &ConversationRecord) -> Vec<u32> {
        let Some(final_topic) = &record.final_topic else {
            return Vec::new();
        };
        let topics: Vec<Vec<u32>> = final_topic
            .topics
            .iter()
            .map(|&id| self.vocab.topic_tokens(id))
            .collect();
        merge_utterances(&topics, Some(self.vocab.word_split), false, Some(self.vocab.end))
    }

    fn policy_context(&self, record: &ConversationRecord, final_topic: &[u32]) -> Vec<u32> {
        let mut context = merge_utterances(
            &record.context_tokens,
            Some(self.vocab.sent_split),
            false,
            Some(self.vocab.end),
        );
        context.extend_from_slice(final_topic);
        let budget = self.truncation.context_truncate.map(|n| n.saturating_sub(1));
        add_start_end(truncate(&context, budget, false), Some(self.vocab.start), None)
    }

    fn context_policy(&self, record: &ConversationRecord, final_topic: &[u32]) -> Vec<u32> {
        let pad_topic = self.vocab.pad_topic;
        let topics: Vec<Vec<u32>> = record
            .context_policy
            .iter()
            .flatten()
            .flat_map(|p| p.topics.iter().copied())
            .filter(|&t| Some(t) != pad_topic)
            .map(|t| self.vocab.topic_tokens(t))
            .collect();
        let merged = merge_utterances(&topics, Some(self.vocab.word_split), false, None);
        let mut row = add_start_end(merged, Some(self.vocab.start), Some(self.vocab.end));
        row.extend_from_slice(final_topic);
        row
    }

    /// Topic-policy batch. Every record must carry a `target_topic`.
    pub fn policy_batch(&self, records: &[ConversationRecord]) -> Result<PolicyBatch> {
        let mut contexts = Vec::with_capacity(records.len());
        let mut policies = Vec::with_capacity(records.len());
        let mut profiles = Vec::new();
        let mut target_topics = Vec::with_capacity(records.len());

        for (index, record) in records.iter().enumerate() {
            let topic = record.target_topic.ok_or(Error::MissingTarget {
                index,
                field: "target_topic",
            })?;
            let final_topic = self.final_topic_tokens(record);
            contexts.push(self.policy_context(record, &final_topic));
            policies.push(self.context_policy(record, &final_topic));
            profiles.extend(record.user_profile.iter().cloned());
            target_topics.push(topic);
        }

        let pad = self.vocab.pad;
        let context = pad_matrix(&contexts, pad, true, self.truncation.context_truncate);
        let context_policy = pad_matrix(&policies, pad, true, None);
        let user_profile = pad_matrix(&profiles, pad, true, None);
        Ok(PolicyBatch {
            context_mask: context.mask(pad),
            context,
            context_policy_mask: context_policy.mask(pad),
            context_policy,
            user_profile_mask: user_profile.mask(pad),
            user_profile,
            target_topics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::PolicyTarget;
    use crate::vocab::RawVocab;
    use std::collections::HashMap;

    // ids: 0 pad, 1 start, 2 end, 3 unk, 4 sep, 5.. content
    fn vocab() -> Arc<Vocab> {
        let tokens = ["__pad__", "__start__", "__end__", "__unk__", "__sep__", "a", "b", "c"];
        let raw = RawVocab {
            pad: Some(0),
            start: Some(1),
            end: Some(2),
            unk: Some(3),
            vocab_size: Some(tokens.len()),
            n_entity: Some(6),
            n_word: Some(6),
            pad_entity: Some(0),
            pad_word: Some(0),
            sent_split: Some(4),
            word_split: Some(4),
            tok2ind: Some(
                tokens
                    .iter()
                    .enumerate()
                    .map(|(i, t)| (t.to_string(), i as u32))
                    .collect(),
            ),
            ind2tok: Some(
                tokens
                    .iter()
                    .enumerate()
                    .map(|(i, t)| (i as u32, t.to_string()))
                    .collect(),
            ),
            id2entity: Some(HashMap::from([(5, "ab（1999）".to_string())])),
            ind2topic: Some(HashMap::from([(1, "c".to_string())])),
            pad_topic: Some(0),
            ..Default::default()
        };
        Arc::new(Vocab::from_raw(raw).unwrap())
    }

    fn record() -> ConversationRecord {
        ConversationRecord {
            context_tokens: vec![vec![5, 6], vec![7]],
            context_entities: vec![1, 2, 3],
            context_words: vec![4],
            items: vec![5],
            item: Some(5),
            response: vec![5, 6, 7, 5, 6, 7],
            interaction_history: Some(vec![1]),
            context_items: vec![2, 3],
            ..Default::default()
        }
    }

    fn builder() -> BatchBuilder {
        let t = TruncationConfig::default()
            .with_context(6)
            .with_response(4)
            .with_entity(2)
            .with_word(3)
            .with_item(2);
        BatchBuilder::new(vocab(), t)
    }

    #[test]
    fn test_rec_context_wraps_and_truncates() {
        let b = builder();
        // merged: 5 6 4 7 -> keep last 4 -> wrap
        assert_eq!(b.rec_context(&record().context_tokens), vec![1, 5, 6, 4, 7, 2]);
    }

    #[test]
    fn test_rec_batch_shapes_and_history() {
        let b = builder();
        let mut sampler = NegativeSampler::new(5, 1);
        let batch = b.rec_batch(&[record()], &mut sampler).unwrap();
        assert_eq!(batch.context_entities.row(0), &[2, 3]);
        assert_eq!(batch.context_words.row(0), &[0, 0, 4]);
        assert_eq!(batch.items, vec![5]);
        // history 1,2,3 -> keep 2,3
        assert_eq!(batch.history.input_ids.row(0), &[2, 3]);
        assert_eq!(batch.history.target_pos.row(0), &[3, 5]);
        assert_eq!(batch.history.input_mask.row(0), &[1, 1]);
        assert!(batch
            .history
            .sample_negs
            .row(0)
            .iter()
            .all(|n| *n != 2 && *n != 3));
        assert_eq!(batch.entity_labels.sum(), 3.0);
    }

    #[test]
    fn test_rec_batch_requires_item() {
        let mut r = record();
        r.item = None;
        let err = builder()
            .rec_batch(&[record(), r], &mut NegativeSampler::new(5, 0))
            .unwrap_err();
        assert!(matches!(err, Error::MissingTarget { index: 1, field: "item" }));
    }

    #[test]
    fn test_conv_response_ends_with_end_and_pads_right() {
        let b = builder();
        let batch = b.conv_batch(&[record()], Mode::Valid);
        assert_eq!(batch.response.row(0), &[5, 6, 7, 2]);

        let mut short = record();
        short.response = vec![6];
        let batch = b.conv_batch(&[short], Mode::Valid);
        assert_eq!(batch.response.row(0), &[6, 2, 0, 0]);
        assert_eq!(batch.context_tokens.row(0), &[0, 0, 0, 5, 6, 7]);
    }

    fn enhancing_builder() -> BatchBuilder {
        let b = builder();
        BatchBuilder::new(vocab(), b.truncation().with_item(4)).with_context_enhancement(true)
    }

    #[test]
    fn test_enhancement_only_in_train() {
        let b = enhancing_builder();
        let train = b.conv_batch(&[record()], Mode::Train);
        // item 5 is "ab": tokens 5 6, then sent_split, then the context
        assert_eq!(train.enhanced_context_tokens.row(0), &[5, 6, 4, 5, 6, 7]);
        let test = b.conv_batch(&[record()], Mode::Test);
        assert_eq!(test.enhanced_context_tokens, test.context_tokens);
    }

    #[test]
    fn test_enhancement_respects_item_truncate() {
        // item_truncate 2 keeps only the tail of the item prefix
        let b = builder().with_context_enhancement(true);
        assert_eq!(b.enhanced_context(&record(), &[7]), vec![6, 4, 7]);
    }

    #[test]
    fn test_item_enhancement_beats_topic() {
        let b = enhancing_builder();
        let mut r = record();
        r.target = vec![PolicyTarget::new("chat", vec![1])];
        let with_item = b.enhanced_context(&r, &[7]);
        assert_eq!(&with_item[..2], &[5, 6]);

        r.items.clear();
        let with_topic = b.enhanced_context(&r, &[7]);
        assert_eq!(with_topic, vec![7, 4, 7]);
    }

    #[test]
    fn test_policy_batch() {
        let b = builder();
        let mut r = record();
        r.target_topic = Some(1);
        r.final_topic = Some(PolicyTarget::new("goal", vec![1]));
        r.context_policy = vec![vec![PolicyTarget::new("chat", vec![0, 1])]];
        r.user_profile = vec![vec![5], vec![6, 7]];
        let batch = b.policy_batch(&[r]).unwrap();
        assert_eq!(batch.context.cols(), 6);
        assert_eq!(batch.context.row(0)[0], 1);
        // start, topic "c", end, then final topic "c" + end
        assert_eq!(batch.context_policy.row(0), &[1, 7, 2, 7, 2]);
        assert_eq!(batch.user_profile.rows(), 2);
        assert_eq!(batch.target_topics, vec![1]);
    }
}
