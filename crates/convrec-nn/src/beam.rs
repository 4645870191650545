//! Beam bookkeeping for copy-augmented decoding.
//!
//! The search state is an array of arrays: `beams[j][n]` is hypothesis `n`
//! of batch element `j`. Each step turns the current beams plus the
//! per-hypothesis top-`k` extensions into a fresh array; nothing is updated
//! in place. Decoder rows follow the layout `n * bs + j`.

use std::cmp::Ordering;

/// One partial output sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis<L> {
    /// Generated tokens, START excluded.
    pub tokens: Vec<u32>,
    /// One entry per generated token.
    pub logits: Vec<L>,
    /// Cumulative probability.
    pub score: f64,
}

impl<L> Hypothesis<L> {
    pub fn root() -> Self {
        Self {
            tokens: Vec::new(),
            logits: Vec::new(),
            score: 1.0,
        }
    }

    pub fn last_token(&self) -> Option<u32> {
        self.tokens.last().copied()
    }

    pub fn contains(&self, token: u32) -> bool {
        self.tokens.contains(&token)
    }
}

/// A one-token extension of hypothesis `parent`.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate<L> {
    pub parent: usize,
    pub token: u32,
    pub prob: f64,
    pub logits: L,
}

/// A surviving hypothesis and the beam slot it grew from.
#[derive(Debug, Clone, PartialEq)]
pub struct Selected<L> {
    pub parent: usize,
    pub hypothesis: Hypothesis<L>,
}

/// Keep the best `width` extensions of every batch element.
///
/// `candidates[j]` must be ordered by parent, then by rank within the
/// parent. Sorting is stable, so equal scores keep that order.
pub fn select_top_k<L: Clone>(
    beams: &[Vec<Hypothesis<L>>],
    candidates: &[Vec<Candidate<L>>],
    width: usize,
) -> Vec<Vec<Selected<L>>> {
    beams
        .iter()
        .zip(candidates)
        .map(|(hyps, cands)| {
            let mut extended: Vec<Selected<L>> = cands
                .iter()
                .filter_map(|c| {
                    let parent = hyps.get(c.parent)?;
                    let mut tokens = parent.tokens.clone();
                    tokens.push(c.token);
                    let mut logits = parent.logits.clone();
                    logits.push(c.logits.clone());
                    Some(Selected {
                        parent: c.parent,
                        hypothesis: Hypothesis {
                            tokens,
                            logits,
                            score: parent.score * c.prob,
                        },
                    })
                })
                .collect();
            extended.sort_by(|a, b| {
                b.hypothesis
                    .score
                    .partial_cmp(&a.hypothesis.score)
                    .unwrap_or(Ordering::Equal)
            });
            extended.truncate(width);
            extended
        })
        .collect()
}

/// Indices of the `k` largest values, largest first, lower index on ties.
pub fn top_k_indices(row: &[f32], k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..row.len()).collect();
    idx.sort_by(|&a, &b| row[b].partial_cmp(&row[a]).unwrap_or(Ordering::Equal));
    idx.truncate(k);
    idx
}

/// Softmax of one logit row in `f64`.
pub fn softmax_row(row: &[f32]) -> Vec<f64> {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let exps: Vec<f64> = row.iter().map(|&x| (x as f64 - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// Candidate list of one batch element from its hypotheses' logit rows.
///
/// `rows[n]` holds the logits of hypothesis `n`.
pub fn expand(rows: &[&[f32]], width: usize) -> Vec<Candidate<Vec<f32>>> {
    let mut out = Vec::with_capacity(rows.len() * width);
    for (parent, row) in rows.iter().enumerate() {
        let probs = softmax_row(row);
        for token in top_k_indices(row, width) {
            out.push(Candidate {
                parent,
                token: token as u32,
                prob: probs[token],
                logits: row.to_vec(),
            });
        }
    }
    out
}

/// Whether the best hypothesis of every element has produced `end`.
pub fn all_finished<L>(beams: &[Vec<Hypothesis<L>>], end: u32) -> bool {
    beams
        .iter()
        .all(|hyps| hyps.first().is_some_and(|h| h.contains(end)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hyp(tokens: &[u32], score: f64) -> Hypothesis<()> {
        Hypothesis {
            tokens: tokens.to_vec(),
            logits: vec![(); tokens.len()],
            score,
        }
    }

    fn cand(parent: usize, token: u32, prob: f64) -> Candidate<()> {
        Candidate {
            parent,
            token,
            prob,
            logits: (),
        }
    }

    #[test]
    fn test_select_keeps_best_by_cumulative_score() {
        let beams = vec![vec![hyp(&[5], 0.6), hyp(&[6], 0.4)]];
        let cands = vec![vec![
            cand(0, 7, 0.5),
            cand(0, 8, 0.5),
            cand(1, 9, 0.9),
            cand(1, 5, 0.1),
        ]];
        let out = select_top_k(&beams, &cands, 2);
        assert_eq!(out[0].len(), 2);
        assert_eq!(out[0][0].hypothesis.tokens, vec![6, 9]);
        assert_eq!(out[0][0].parent, 1);
        assert!((out[0][0].hypothesis.score - 0.36).abs() < 1e-12);
        assert_eq!(out[0][1].hypothesis.tokens, vec![5, 7]);
    }

    #[test]
    fn test_select_ties_keep_original_order() {
        let beams = vec![vec![hyp(&[], 1.0), hyp(&[], 1.0)]];
        let cands = vec![vec![cand(0, 3, 0.5), cand(1, 4, 0.5)]];
        let out = select_top_k(&beams, &cands, 1);
        assert_eq!(out[0][0].hypothesis.tokens, vec![3]);
    }

    #[test]
    fn test_select_does_not_touch_input() {
        let beams = vec![vec![hyp(&[1], 1.0)]];
        let cands = vec![vec![cand(0, 2, 1.0)]];
        let _ = select_top_k(&beams, &cands, 1);
        assert_eq!(beams[0][0].tokens, vec![1]);
    }

    #[test]
    fn test_top_k_ties_lower_index() {
        assert_eq!(top_k_indices(&[1.0, 3.0, 3.0, 2.0], 2), vec![1, 2]);
        assert_eq!(top_k_indices(&[0.0, 0.0], 1), vec![0]);
    }

    #[test]
    fn test_softmax_row_sums_to_one() {
        let p = softmax_row(&[1.0, 2.0, 3.0]);
        assert!((p.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn test_all_finished_checks_best_only() {
        let beams = vec![vec![hyp(&[4, 2], 0.5), hyp(&[4], 0.4)], vec![hyp(&[2], 0.9)]];
        assert!(all_finished(&beams, 2));
        let beams = vec![vec![hyp(&[4], 0.5), hyp(&[2], 0.4)]];
        assert!(!all_finished(&beams, 2));
    }
}
