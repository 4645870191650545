//! Metric collection for the training loop.

use convrec_core::Mode;
use tracing::info;

use crate::metrics::{
    bleu_at, f1_score, hit_at, mrr_at, ndcg_at, AverageMetric, DistinctCounter, Metrics,
};

/// Cutoffs of the recommendation metrics.
pub const REC_CUTOFFS: [usize; 3] = [1, 10, 50];
/// Cutoffs of the topic policy metrics.
pub const POLICY_CUTOFFS: [usize; 3] = [1, 3, 5];
/// Length of the rank list handed to `rec_evaluate`.
pub const REC_TOP_K: usize = 50;

const NGRAM_ORDERS: [usize; 2] = [1, 2];

/// Receives model outputs and reports aggregated metrics at epoch
/// boundaries.
pub trait Evaluator {
    /// `ranks` holds item indices, best first.
    fn rec_evaluate(&mut self, ranks: &[usize], label: usize);

    fn gen_evaluate(&mut self, hyp: &str, refs: &[String]);

    fn policy_evaluate(&mut self, ranks: &[usize], label: usize);

    /// Record an optimisation scalar such as a loss.
    fn add_optim_metric(&mut self, name: &str, value: f64);

    /// Log and return a summary of everything collected since the last reset.
    fn report(&mut self, epoch: Option<usize>, mode: Mode) -> String;

    fn reset_metrics(&mut self);

    fn metric(&self, name: &str) -> Option<f64>;
}

/// Hit, MRR and NDCG for recommendation; BLEU, distinct n-grams, F1 and
/// perplexity for generation.
#[derive(Debug, Clone, Default)]
pub struct StandardEvaluator {
    rec: Metrics,
    gen: Metrics,
    policy: Metrics,
    optim: Metrics,
    distinct: DistinctCounter,
    gen_loss: AverageMetric,
}

impl StandardEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    fn perplexity(&self) -> Option<f64> {
        (self.gen_loss.count() > 0).then(|| self.gen_loss.value().exp())
    }

    fn summary(&self) -> Vec<(String, f64)> {
        let mut out: Vec<(String, f64)> = Vec::new();
        for metrics in [&self.rec, &self.policy, &self.gen] {
            out.extend(metrics.iter().map(|(k, v)| (k.to_string(), v)));
        }
        if !self.distinct.is_empty() {
            for k in NGRAM_ORDERS {
                out.push((format!("dist@{k}"), self.distinct.value(k)));
            }
        }
        if let Some(ppl) = self.perplexity() {
            out.push(("ppl".to_string(), ppl));
        }
        out.extend(self.optim.iter().map(|(k, v)| (k.to_string(), v)));
        out
    }
}

impl Evaluator for StandardEvaluator {
    fn rec_evaluate(&mut self, ranks: &[usize], label: usize) {
        for k in REC_CUTOFFS {
            self.rec.add(&format!("hit@{k}"), hit_at(ranks, label, k));
            self.rec.add(&format!("mrr@{k}"), mrr_at(ranks, label, k));
            self.rec.add(&format!("ndcg@{k}"), ndcg_at(ranks, label, k));
        }
    }

    fn gen_evaluate(&mut self, hyp: &str, refs: &[String]) {
        for k in NGRAM_ORDERS {
            self.gen.add(&format!("bleu@{k}"), bleu_at(hyp, refs, k));
        }
        self.gen.add("f1", f1_score(hyp, refs));
        self.distinct.add(hyp, &NGRAM_ORDERS);
    }

    fn policy_evaluate(&mut self, ranks: &[usize], label: usize) {
        for k in POLICY_CUTOFFS {
            self.policy.add(&format!("policy_hit@{k}"), hit_at(ranks, label, k));
        }
    }

    fn add_optim_metric(&mut self, name: &str, value: f64) {
        if name == "gen_loss" {
            self.gen_loss.add(value);
        }
        self.optim.add(name, value);
    }

    fn report(&mut self, epoch: Option<usize>, mode: Mode) -> String {
        let body = self
            .summary()
            .iter()
            .map(|(k, v)| format!("{k}={v:.4}"))
            .collect::<Vec<_>>()
            .join(" ");
        let head = match epoch {
            Some(e) => format!("[{mode} epoch {e}]"),
            None => format!("[{mode}]"),
        };
        let line = if body.is_empty() {
            head
        } else {
            format!("{head} {body}")
        };
        info!("{line}");
        line
    }

    fn reset_metrics(&mut self) {
        self.rec.clear();
        self.gen.clear();
        self.policy.clear();
        self.optim.clear();
        self.distinct.clear();
        self.gen_loss = AverageMetric::default();
    }

    fn metric(&self, name: &str) -> Option<f64> {
        match name {
            "ppl" => self.perplexity(),
            "dist@1" | "dist@2" if !self.distinct.is_empty() => {
                let k = if name == "dist@1" { 1 } else { 2 };
                Some(self.distinct.value(k))
            }
            _ => self
                .rec
                .get(name)
                .or_else(|| self.gen.get(name))
                .or_else(|| self.policy.get(name))
                .or_else(|| self.optim.get(name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rec_metrics_average_over_examples() {
        let mut e = StandardEvaluator::new();
        e.rec_evaluate(&[3, 1, 2], 3);
        e.rec_evaluate(&[3, 1, 2], 2);
        assert_eq!(e.metric("hit@1"), Some(0.5));
        assert_eq!(e.metric("hit@10"), Some(1.0));
        assert!((e.metric("mrr@10").unwrap() - (1.0 + 1.0 / 3.0) / 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_gen_metrics_and_ppl() {
        let mut e = StandardEvaluator::new();
        e.gen_evaluate("a b", &["a b".to_string()]);
        e.add_optim_metric("gen_loss", 0.0);
        e.add_optim_metric("gen_loss", 2.0);
        assert_eq!(e.metric("bleu@1"), Some(1.0));
        assert_eq!(e.metric("f1"), Some(1.0));
        assert_eq!(e.metric("dist@1"), Some(2.0));
        assert!((e.metric("ppl").unwrap() - 1f64.exp()).abs() < 1e-12);
        assert_eq!(e.metric("gen_loss"), Some(1.0));
    }

    #[test]
    fn test_report_and_reset() {
        let mut e = StandardEvaluator::new();
        e.policy_evaluate(&[0, 4, 2], 4);
        e.add_optim_metric("rec_loss", 1.5);
        let line = e.report(Some(2), Mode::Valid);
        assert!(line.starts_with("[valid epoch 2]"));
        assert!(line.contains("policy_hit@1=0.0000"));
        assert!(line.contains("policy_hit@3=1.0000"));
        assert!(line.contains("rec_loss=1.5000"));

        e.reset_metrics();
        assert_eq!(e.metric("rec_loss"), None);
        assert_eq!(e.metric("ppl"), None);
        assert_eq!(e.metric("dist@1"), None);
        assert_eq!(e.report(None, Mode::Test), "[test]");
    }
}
