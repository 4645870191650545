//! Deterministic toy corpus.
//!
//! Items belong to genres; every conversation mentions a genre and the
//! response names an item of that genre, so both the recommender and the
//! copy decoder have something learnable. Tokens are single characters,
//! matching the character-level entity tokenization of [`Vocab`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use crate::dataset::{
    write_json, Dataset, COPY_MASK_FILE, SIDE_DATA_FILE, TEST_FILE, TRAIN_FILE, VALID_FILE,
    VOCAB_FILE,
};
use crate::error::{Error, Result};
use crate::graph::{EntityGraph, RelationEdge, SideData, WordGraph};
use crate::record::{ConversationRecord, PolicyTarget, Role};
use crate::vocab::{RawVocab, Vocab};

const SPECIALS: [&str; 4] = ["__pad__", "__start__", "__end__", "__unk__"];
const ALPHABET: &str = "abcdefghijklmnopqrstuvwxyz0123456789";

/// Relation ids of the synthetic entity graph.
pub const REL_HAS_GENRE: u32 = 0;
pub const REL_GENRE_OF: u32 = 1;

#[derive(Debug, Clone)]
pub struct SyntheticConfig {
    pub n_items: usize,
    pub n_genres: usize,
    pub n_conversations: usize,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            n_items: 12,
            n_genres: 3,
            n_conversations: 30,
            seed: 7,
        }
    }
}

/// A generated corpus, convertible to a [`Dataset`] or writable to disk.
#[derive(Debug, Clone)]
pub struct SyntheticCorpus {
    pub raw_vocab: RawVocab,
    pub side_data: SideData,
    pub train: Vec<ConversationRecord>,
    pub valid: Vec<ConversationRecord>,
    pub test: Vec<ConversationRecord>,
    pub copy_mask: Vec<bool>,
}

impl SyntheticConfig {
    pub fn with_items(mut self, n: usize) -> Self {
        self.n_items = n;
        self
    }

    pub fn with_genres(mut self, n: usize) -> Self {
        self.n_genres = n;
        self
    }

    pub fn with_conversations(mut self, n: usize) -> Self {
        self.n_conversations = n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    // entity layout: 0 pad, 1..=n_items items, then genres
    fn genre_entity(&self, g: usize) -> u32 {
        (1 + self.n_items + g) as u32
    }

    fn item_name(i: usize) -> String {
        format!("m{i}（20{:02}）", i % 100)
    }

    fn genre_name(g: usize) -> String {
        let c = ALPHABET.as_bytes()[g % 26] as char;
        format!("g{c}")
    }

    pub fn generate(&self) -> Result<SyntheticCorpus> {
        if self.n_items == 0 || self.n_genres == 0 || self.n_conversations < 3 {
            return Err(Error::InvalidArgument(
                "synthetic corpus needs items, genres and at least 3 conversations".into(),
            ));
        }
        let mut rng = XorShiftRng::seed_from_u64(self.seed);

        let tokens: Vec<String> = SPECIALS
            .iter()
            .map(|s| s.to_string())
            .chain(ALPHABET.chars().map(String::from))
            .collect();
        let tok2ind: HashMap<String, u32> = tokens
            .iter()
            .enumerate()
            .map(|(i, t)| (t.clone(), i as u32))
            .collect();
        let ind2tok: HashMap<u32, String> =
            tokens.iter().enumerate().map(|(i, t)| (i as u32, t.clone())).collect();
        let token_of = |c: char| tok2ind.get(&c.to_string()).copied().unwrap_or(3);

        let n_entity = 1 + self.n_items + self.n_genres;
        let mut id2entity = HashMap::new();
        for i in 1..=self.n_items {
            id2entity.insert(i as u32, Self::item_name(i));
        }
        for g in 0..self.n_genres {
            id2entity.insert(self.genre_entity(g), Self::genre_name(g));
        }

        // words: 0 pad, then one word per letter
        let n_word = 1 + 26;
        let word_of = |c: char| -> Option<u32> {
            c.is_ascii_lowercase().then(|| 1 + (c as u32 - 'a' as u32))
        };
        let mut word_edges = Vec::new();
        for w in 1..26u32 {
            word_edges.push((w, w + 1));
            word_edges.push((w + 1, w));
        }

        let genre_of_item = |i: usize| (i - 1) % self.n_genres;
        let mut entity_edges = Vec::new();
        for i in 1..=self.n_items {
            let g = self.genre_entity(genre_of_item(i));
            entity_edges.push(RelationEdge {
                head: i as u32,
                tail: g,
                relation: REL_HAS_GENRE,
            });
            entity_edges.push(RelationEdge {
                head: g,
                tail: i as u32,
                relation: REL_GENRE_OF,
            });
        }

        let n_topic = self.n_genres + 1;
        let ind2topic: HashMap<u32, String> = (0..self.n_genres)
            .map(|g| ((g + 1) as u32, Self::genre_name(g)))
            .collect();

        let raw_vocab = RawVocab {
            pad: Some(0),
            start: Some(1),
            end: Some(2),
            unk: Some(3),
            vocab_size: Some(tokens.len()),
            n_entity: Some(n_entity),
            n_word: Some(n_word),
            pad_entity: Some(0),
            pad_word: Some(0),
            tok2ind: Some(tok2ind.clone()),
            ind2tok: Some(ind2tok),
            id2entity: Some(id2entity),
            sent_split: None,
            word_split: None,
            pad_topic: Some(0),
            ind2topic: Some(ind2topic),
            n_topic: Some(n_topic),
        };

        let mut records = Vec::with_capacity(self.n_conversations);
        let mut history: Vec<u32> = Vec::new();
        for _ in 0..self.n_conversations {
            let item = rng.random_range(1..=self.n_items);
            let genre = genre_of_item(item);
            let genre_name = Self::genre_name(genre);
            let chatter: String = (0..rng.random_range(1..4usize))
                .map(|_| ALPHABET.as_bytes()[rng.random_range(0..26usize)] as char)
                .collect();

            let item_text = format!("m{item}");
            let context_tokens = vec![
                genre_name.chars().map(token_of).collect(),
                chatter.chars().map(token_of).collect(),
            ];
            let context_words: Vec<u32> =
                genre_name.chars().chain(chatter.chars()).filter_map(word_of).collect();
            let topic = (genre + 1) as u32;

            records.push(ConversationRecord {
                context_tokens,
                context_entities: vec![self.genre_entity(genre)],
                context_words,
                context_items: Vec::new(),
                items: vec![item as u32],
                item: None,
                response: item_text.chars().map(token_of).collect(),
                role: Some(Role::Recommender),
                interaction_history: Some(history.iter().rev().take(3).copied().collect()),
                target: vec![PolicyTarget::new("recommend", vec![topic])],
                context_policy: vec![vec![PolicyTarget::new("chat", vec![topic])]],
                final_topic: Some(PolicyTarget::new("goal", vec![topic])),
                user_profile: vec![genre_name.chars().map(token_of).collect()],
                target_topic: None,
            });
            history.push(item as u32);
        }

        let n_valid = (self.n_conversations / 10).max(1);
        let n_train = self.n_conversations - 2 * n_valid;
        let test = records.split_off(n_train + n_valid);
        let valid = records.split_off(n_train);

        let copy_mask = tokens
            .iter()
            .map(|t| t.chars().count() == 1)
            .collect();

        Ok(SyntheticCorpus {
            raw_vocab,
            side_data: SideData {
                entity_kg: EntityGraph::new(n_entity, 2, entity_edges)?,
                word_kg: WordGraph::new(n_word, word_edges)?,
                item_entity_ids: (1..=self.n_items as u32).collect(),
            },
            train: records,
            valid,
            test,
            copy_mask,
        })
    }
}

impl SyntheticCorpus {
    pub fn vocab(&self) -> Result<Vocab> {
        Vocab::from_raw(self.raw_vocab.clone())
    }

    pub fn into_dataset(self) -> Result<Dataset> {
        let dataset = Dataset {
            vocab: Arc::new(Vocab::from_raw(self.raw_vocab)?),
            train: self.train,
            valid: self.valid,
            test: self.test,
            side_data: self.side_data,
            copy_mask: Some(self.copy_mask),
            token_embedding: None,
        };
        dataset.validate()?;
        Ok(dataset)
    }

    /// Write the corpus in the layout read by [`Dataset::load`].
    pub fn write_to(&self, dir: impl AsRef<Path>) -> Result<()> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        write_json(&dir.join(TRAIN_FILE), &self.train)?;
        write_json(&dir.join(VALID_FILE), &self.valid)?;
        write_json(&dir.join(TEST_FILE), &self.test)?;
        write_json(&dir.join(VOCAB_FILE), &self.raw_vocab)?;
        write_json(&dir.join(SIDE_DATA_FILE), &self.side_data)?;
        write_json(&dir.join(COPY_MASK_FILE), &self.copy_mask)?;
        Ok(())
    }
}
