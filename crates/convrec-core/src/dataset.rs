//! On-disk dataset layout.
//!
//! A dataset directory contains:
//!
//! ```text
//! train_data.json  valid_data.json  test_data.json   arrays of records
//! vocab.json                                         raw vocabulary object
//! side_data.json                                     entity KG, word KG, item ids
//! copy_mask.json                                     optional, one bool per token
//! token_embedding.json                               optional, vocab_size rows
//! ```

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::batch::{BatchBuilder, Mode, TruncationConfig};
use crate::error::{Error, Result};
use crate::graph::SideData;
use crate::loader::DataLoader;
use crate::record::ConversationRecord;
use crate::vocab::{RawVocab, Vocab};

pub const TRAIN_FILE: &str = "train_data.json";
pub const VALID_FILE: &str = "valid_data.json";
pub const TEST_FILE: &str = "test_data.json";
pub const VOCAB_FILE: &str = "vocab.json";
pub const SIDE_DATA_FILE: &str = "side_data.json";
pub const COPY_MASK_FILE: &str = "copy_mask.json";
pub const EMBEDDING_FILE: &str = "token_embedding.json";

/// Everything a run needs from disk.
#[derive(Debug, Clone)]
pub struct Dataset {
    pub train: Vec<ConversationRecord>,
    pub valid: Vec<ConversationRecord>,
    pub test: Vec<ConversationRecord>,
    pub vocab: Arc<Vocab>,
    pub side_data: SideData,
    /// Tokens the decoder may copy. Absent means nothing is copyable.
    pub copy_mask: Option<Vec<bool>>,
    /// Pretrained token embedding. Absent means random initialization.
    pub token_embedding: Option<Vec<Vec<f32>>>,
}

/// Summary counts for a dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatasetStats {
    pub train: usize,
    pub valid: usize,
    pub test: usize,
    pub vocab_size: usize,
    pub n_entity: usize,
    pub n_word: usize,
    pub n_relation: usize,
    pub entity_edges: usize,
    pub word_edges: usize,
    pub items: usize,
    pub rec_examples: usize,
    pub avg_context_turns: f64,
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    debug!(path = %path.display(), "reading");
    let text = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

fn read_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if path.exists() {
        read_json(path).map(Some)
    } else {
        Ok(None)
    }
}

pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    fs::write(path, serde_json::to_string(value)?)?;
    Ok(())
}

impl Dataset {
    /// Load and validate a dataset directory.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let raw: RawVocab = read_json(&dir.join(VOCAB_FILE))?;
        let dataset = Self {
            train: read_json(&dir.join(TRAIN_FILE))?,
            valid: read_json(&dir.join(VALID_FILE))?,
            test: read_json(&dir.join(TEST_FILE))?,
            vocab: Arc::new(Vocab::from_raw(raw)?),
            side_data: read_json(&dir.join(SIDE_DATA_FILE))?,
            copy_mask: read_optional(&dir.join(COPY_MASK_FILE))?,
            token_embedding: read_optional(&dir.join(EMBEDDING_FILE))?,
        };
        dataset.validate()?;
        info!(
            train = dataset.train.len(),
            valid = dataset.valid.len(),
            test = dataset.test.len(),
            "loaded dataset from {}",
            dir.display()
        );
        Ok(dataset)
    }

    /// Cross-check vocabulary, graphs and records.
    pub fn validate(&self) -> Result<()> {
        self.side_data.validate()?;
        let vocab = &self.vocab;
        if self.side_data.entity_kg.n_entity != vocab.n_entity {
            return Err(Error::InvalidArgument(format!(
                "entity graph has {} nodes but vocabulary declares {}",
                self.side_data.entity_kg.n_entity, vocab.n_entity
            )));
        }
        if self.side_data.word_kg.n_word != vocab.n_word {
            return Err(Error::InvalidArgument(format!(
                "word graph has {} nodes but vocabulary declares {}",
                self.side_data.word_kg.n_word, vocab.n_word
            )));
        }
        if let Some(mask) = &self.copy_mask {
            if mask.len() != vocab.vocab_size {
                return Err(Error::InvalidArgument(format!(
                    "copy mask has {} entries for {} tokens",
                    mask.len(),
                    vocab.vocab_size
                )));
            }
        }
        if let Some(emb) = &self.token_embedding {
            if emb.len() != vocab.vocab_size {
                return Err(Error::InvalidArgument(format!(
                    "token embedding has {} rows for {} tokens",
                    emb.len(),
                    vocab.vocab_size
                )));
            }
        }
        for (split, records) in [("train", &self.train), ("valid", &self.valid), ("test", &self.test)] {
            for (i, r) in records.iter().enumerate() {
                let bad_entity = r
                    .context_entities
                    .iter()
                    .chain(&r.items)
                    .chain(&r.context_items)
                    .find(|&&e| e as usize >= vocab.n_entity);
                if let Some(e) = bad_entity {
                    return Err(Error::InvalidArgument(format!(
                        "{split} record {i} references entity {e} outside {}",
                        vocab.n_entity
                    )));
                }
                if let Some(w) = r.context_words.iter().find(|&&w| w as usize >= vocab.n_word) {
                    return Err(Error::InvalidArgument(format!(
                        "{split} record {i} references word {w} outside {}",
                        vocab.n_word
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn split(&self, mode: Mode) -> &[ConversationRecord] {
        match mode {
            Mode::Train => &self.train,
            Mode::Valid => &self.valid,
            Mode::Test => &self.test,
        }
    }

    /// A loader over one split with default builder options.
    pub fn loader(&self, mode: Mode, truncation: TruncationConfig) -> DataLoader {
        let builder = BatchBuilder::new(self.vocab.clone(), truncation);
        DataLoader::new(self.split(mode).to_vec(), builder, mode, 42)
    }

    pub fn stats(&self) -> DatasetStats {
        let all = || self.train.iter().chain(&self.valid).chain(&self.test);
        let n = all().count();
        let turns: usize = all().map(|r| r.context_tokens.len()).sum();
        DatasetStats {
            train: self.train.len(),
            valid: self.valid.len(),
            test: self.test.len(),
            vocab_size: self.vocab.vocab_size,
            n_entity: self.vocab.n_entity,
            n_word: self.vocab.n_word,
            n_relation: self.side_data.entity_kg.n_relation,
            entity_edges: self.side_data.entity_kg.edges.len(),
            word_edges: self.side_data.word_kg.edges.len(),
            items: self.side_data.item_entity_ids.len(),
            rec_examples: self.train.iter().map(|r| r.items.len()).sum(),
            avg_context_turns: if n == 0 { 0.0 } else { turns as f64 / n as f64 },
        }
    }
}
