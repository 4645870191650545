//! Vocabulary and index maps.
//!
//! A [`Vocab`] is loaded once per run and shared read-only by the batch
//! builder, the model and the evaluator. Construction validates that every
//! required key is present; optional keys fall back to the same defaults the
//! data loaders expect (`sent_split` and `word_split` default to `end`).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Vocabulary exactly as exported by the data-preparation step.
///
/// Every field is optional so that a missing key surfaces as
/// [`Error::MissingVocabKey`] instead of an opaque JSON error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawVocab {
    pub pad: Option<u32>,
    pub start: Option<u32>,
    pub end: Option<u32>,
    pub unk: Option<u32>,
    pub vocab_size: Option<usize>,
    pub n_entity: Option<usize>,
    pub n_word: Option<usize>,
    pub pad_entity: Option<u32>,
    pub pad_word: Option<u32>,
    pub tok2ind: Option<HashMap<String, u32>>,
    pub ind2tok: Option<HashMap<u32, String>>,
    pub id2entity: Option<HashMap<u32, String>>,
    pub sent_split: Option<u32>,
    pub word_split: Option<u32>,
    pub pad_topic: Option<u32>,
    pub ind2topic: Option<HashMap<u32, String>>,
    pub n_topic: Option<usize>,
}

/// Validated vocabulary.
#[derive(Debug, Clone)]
pub struct Vocab {
    pub pad: u32,
    pub start: u32,
    pub end: u32,
    pub unk: u32,
    pub vocab_size: usize,
    pub n_entity: usize,
    pub n_word: usize,
    pub pad_entity: u32,
    pub pad_word: u32,
    pub sent_split: u32,
    pub word_split: u32,
    pub pad_topic: Option<u32>,
    pub n_topic: Option<usize>,
    tok2ind: HashMap<String, u32>,
    ind2tok: HashMap<u32, String>,
    id2entity: HashMap<u32, String>,
    ind2topic: HashMap<u32, String>,
}

/// Token printed for ids absent from `ind2tok`.
pub const UNK_TEXT: &str = "unk";

fn required<T>(value: Option<T>, key: &'static str) -> Result<T> {
    value.ok_or(Error::MissingVocabKey(key))
}

impl Vocab {
    /// Validate a raw vocabulary.
    pub fn from_raw(raw: RawVocab) -> Result<Self> {
        let end = required(raw.end, "end")?;
        let vocab = Self {
            pad: required(raw.pad, "pad")?,
            start: required(raw.start, "start")?,
            end,
            unk: required(raw.unk, "unk")?,
            vocab_size: required(raw.vocab_size, "vocab_size")?,
            n_entity: required(raw.n_entity, "n_entity")?,
            n_word: required(raw.n_word, "n_word")?,
            pad_entity: required(raw.pad_entity, "pad_entity")?,
            pad_word: required(raw.pad_word, "pad_word")?,
            sent_split: raw.sent_split.unwrap_or(end),
            word_split: raw.word_split.unwrap_or(end),
            pad_topic: raw.pad_topic,
            n_topic: raw.n_topic,
            tok2ind: required(raw.tok2ind, "tok2ind")?,
            ind2tok: required(raw.ind2tok, "ind2tok")?,
            id2entity: required(raw.id2entity, "id2entity")?,
            ind2topic: raw.ind2topic.unwrap_or_default(),
        };

        if vocab.pad_entity as usize >= vocab.n_entity {
            return Err(Error::InvalidArgument(format!(
                "pad_entity {} outside entity range {}",
                vocab.pad_entity, vocab.n_entity
            )));
        }
        if vocab.pad_word as usize >= vocab.n_word {
            return Err(Error::InvalidArgument(format!(
                "pad_word {} outside word range {}",
                vocab.pad_word, vocab.n_word
            )));
        }
        Ok(vocab)
    }

    /// Load and validate a vocabulary from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let raw: RawVocab = serde_json::from_str(&text)?;
        Self::from_raw(raw)
    }

    /// Token id for a surface token, `unk` when absent.
    pub fn token_id(&self, token: &str) -> u32 {
        self.tok2ind.get(token).copied().unwrap_or(self.unk)
    }

    /// Surface token for an id.
    pub fn token(&self, id: u32) -> Option<&str> {
        self.ind2tok.get(&id).map(String::as_str)
    }

    /// Surface form of an entity.
    pub fn entity_name(&self, id: u32) -> Option<&str> {
        self.id2entity.get(&id).map(String::as_str)
    }

    /// Surface form of a topic.
    pub fn topic_name(&self, id: u32) -> Option<&str> {
        self.ind2topic.get(&id).map(String::as_str)
    }

    /// Character-level token ids of a surface string.
    pub fn tokenize_chars(&self, text: &str) -> Vec<u32> {
        let mut buf = [0u8; 4];
        text.chars()
            .map(|c| self.token_id(c.encode_utf8(&mut buf)))
            .collect()
    }

    /// Token ids for an entity's name, without its parenthesised suffix.
    ///
    /// Unknown entities yield a single `unk` token.
    pub fn entity_tokens(&self, id: u32) -> Vec<u32> {
        match self.entity_name(id) {
            Some(name) => {
                let head = name.split('（').next().unwrap_or(name);
                self.tokenize_chars(head)
            }
            None => vec![self.unk],
        }
    }

    /// Token ids for a topic name. Unknown topics yield a single `unk` token.
    pub fn topic_tokens(&self, id: u32) -> Vec<u32> {
        match self.topic_name(id) {
            Some(name) => self.tokenize_chars(name),
            None => vec![self.unk],
        }
    }

    /// Detokenize ids up to (excluding) the first end token.
    pub fn ind2txt(&self, ids: &[u32]) -> String {
        ids.iter()
            .take_while(|&&id| id != self.end)
            .map(|&id| self.token(id).unwrap_or(UNK_TEXT))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
