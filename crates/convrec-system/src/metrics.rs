//! Ranking and generation metrics.
//!
//! Ranking metrics take a rank list (best first) and the index of the
//! true item. Generation metrics work on whitespace tokenized strings.

use std::collections::{BTreeMap, HashMap, HashSet};

/// Running mean.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AverageMetric {
    sum: f64,
    count: usize,
}

impl AverageMetric {
    pub fn new(value: f64) -> Self {
        Self { sum: value, count: 1 }
    }

    pub fn add(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Mean of the added values, 0 when empty.
    pub fn value(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Named running means, iterated in name order.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    values: BTreeMap<String, AverageMetric>,
}

impl Metrics {
    pub fn add(&mut self, name: &str, value: f64) {
        self.values.entry(name.to_string()).or_default().add(value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).map(AverageMetric::value)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.value()))
    }
}

fn position(ranks: &[usize], label: usize, k: usize) -> Option<usize> {
    ranks.iter().take(k).position(|&r| r == label)
}

pub fn hit_at(ranks: &[usize], label: usize, k: usize) -> f64 {
    if position(ranks, label, k).is_some() {
        1.0
    } else {
        0.0
    }
}

pub fn mrr_at(ranks: &[usize], label: usize, k: usize) -> f64 {
    position(ranks, label, k).map_or(0.0, |i| 1.0 / (i + 1) as f64)
}

pub fn ndcg_at(ranks: &[usize], label: usize, k: usize) -> f64 {
    position(ranks, label, k).map_or(0.0, |i| 1.0 / ((i + 2) as f64).log2())
}

/// All contiguous `k`-grams of `tokens`.
pub fn ngrams<'a>(tokens: &[&'a str], k: usize) -> Vec<Vec<&'a str>> {
    if k == 0 || tokens.len() < k {
        return Vec::new();
    }
    tokens.windows(k).map(|w| w.to_vec()).collect()
}

fn counts<'a>(grams: Vec<Vec<&'a str>>) -> HashMap<Vec<&'a str>, usize> {
    let mut map = HashMap::new();
    for g in grams {
        *map.entry(g).or_insert(0) += 1;
    }
    map
}

/// Sentence BLEU using only the `k`-gram precision, with brevity penalty.
pub fn bleu_at(hyp: &str, refs: &[String], k: usize) -> f64 {
    let hyp: Vec<&str> = hyp.split_whitespace().collect();
    let refs: Vec<Vec<&str>> = refs.iter().map(|r| r.split_whitespace().collect()).collect();
    if hyp.is_empty() || refs.is_empty() {
        return 0.0;
    }

    let hyp_counts = counts(ngrams(&hyp, k));
    let total: usize = hyp_counts.values().sum();
    if total == 0 {
        return 0.0;
    }
    let mut max_ref: HashMap<Vec<&str>, usize> = HashMap::new();
    for r in &refs {
        for (g, c) in counts(ngrams(r, k)) {
            let slot = max_ref.entry(g).or_insert(0);
            *slot = (*slot).max(c);
        }
    }
    let clipped: usize = hyp_counts
        .iter()
        .map(|(g, &c)| c.min(max_ref.get(g).copied().unwrap_or(0)))
        .sum();
    if clipped == 0 {
        return 0.0;
    }
    let precision = clipped as f64 / total as f64;

    let c = hyp.len();
    // closest reference length, shorter wins ties
    let r = refs
        .iter()
        .map(|r| r.len())
        .min_by_key(|&len| (len.abs_diff(c), len))
        .unwrap_or(0);
    let penalty = if c > r {
        1.0
    } else {
        (1.0 - r as f64 / c as f64).exp()
    };
    penalty * precision
}

/// Token-overlap F1 against the best matching reference.
pub fn f1_score(hyp: &str, refs: &[String]) -> f64 {
    let hyp: Vec<&str> = hyp.split_whitespace().collect();
    refs.iter()
        .map(|r| {
            let r: Vec<&str> = r.split_whitespace().collect();
            token_f1(&hyp, &r)
        })
        .fold(0.0, f64::max)
}

fn token_f1(hyp: &[&str], reference: &[&str]) -> f64 {
    let h = counts(hyp.iter().map(|t| vec![*t]).collect());
    let r = counts(reference.iter().map(|t| vec![*t]).collect());
    let same: usize = h
        .iter()
        .map(|(t, &c)| c.min(r.get(t).copied().unwrap_or(0)))
        .sum();
    if same == 0 {
        return 0.0;
    }
    let precision = same as f64 / hyp.len() as f64;
    let recall = same as f64 / reference.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

/// Corpus-level distinct `k`-grams per generated sentence.
#[derive(Debug, Clone, Default)]
pub struct DistinctCounter {
    grams: HashMap<usize, HashSet<Vec<String>>>,
    sentences: usize,
}

impl DistinctCounter {
    pub fn add(&mut self, hyp: &str, orders: &[usize]) {
        let tokens: Vec<&str> = hyp.split_whitespace().collect();
        for &k in orders {
            let set = self.grams.entry(k).or_default();
            for g in ngrams(&tokens, k) {
                set.insert(g.into_iter().map(str::to_string).collect());
            }
        }
        self.sentences += 1;
    }

    pub fn value(&self, k: usize) -> f64 {
        if self.sentences == 0 {
            return 0.0;
        }
        self.grams.get(&k).map_or(0, HashSet::len) as f64 / self.sentences as f64
    }

    pub fn is_empty(&self) -> bool {
        self.sentences == 0
    }

    pub fn clear(&mut self) {
        self.grams.clear();
        self.sentences = 0;
    }
}
