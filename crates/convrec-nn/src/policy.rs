//! Topic policy: predict the next dialogue topic from the context.

use candle_core::{Device, Tensor};
use candle_nn::{linear, Linear, Module, VarBuilder};
use convrec_core::PolicyBatch;

use crate::error::{Error, Result};
use crate::tensor::{id_tensor, ids_1d};
use crate::transformer::{TransformerDims, TransformerEncoder};

/// Maps a padded token matrix to one vector per row.
pub trait ContextEncoder {
    fn hidden_size(&self) -> usize;

    /// `tokens`: `(bs, len)` `u32`. Returns `(bs, hidden_size)`.
    fn encode(&self, tokens: &Tensor, train: bool) -> Result<Tensor>;
}

/// Transformer encoder followed by a tanh pooler over the first position.
#[derive(Debug, Clone)]
pub struct TransformerPooler {
    encoder: TransformerEncoder,
    dense: Linear,
}

impl TransformerPooler {
    pub fn new(dims: TransformerDims, vocab_size: usize, pad: u32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            encoder: TransformerEncoder::new(dims, vocab_size, pad, vb.pp("encoder"))?,
            dense: linear(dims.dim, dims.dim, vb.pp("pooler"))?,
        })
    }
}

impl ContextEncoder for TransformerPooler {
    fn hidden_size(&self) -> usize {
        self.encoder.dim()
    }

    fn encode(&self, tokens: &Tensor, train: bool) -> Result<Tensor> {
        let (hidden, _) = self.encoder.forward(tokens, train)?;
        let first = hidden.narrow(1, 0, 1)?.squeeze(1)?;
        Ok(self.dense.forward(&first)?.tanh()?)
    }
}

/// Policy forward output.
#[derive(Debug, Clone)]
pub struct PolicyOutput {
    pub loss: Tensor,
    /// `(bs, n_topic)`
    pub scores: Tensor,
}

/// Pooled context projected onto the topic set.
pub struct TopicPolicyModel<E> {
    encoder: E,
    head: Linear,
    n_topic: usize,
    device: Device,
}

impl<E: ContextEncoder> TopicPolicyModel<E> {
    pub fn new(encoder: E, n_topic: usize, vb: VarBuilder) -> Result<Self> {
        if n_topic == 0 {
            return Err(Error::InvalidConfig("topic policy needs at least one topic".into()));
        }
        let head = linear(encoder.hidden_size(), n_topic, vb.pp("state2topic"))?;
        Ok(Self {
            encoder,
            head,
            n_topic,
            device: vb.device().clone(),
        })
    }

    pub fn n_topic(&self) -> usize {
        self.n_topic
    }

    pub fn forward(&self, batch: &PolicyBatch, train: bool) -> Result<PolicyOutput> {
        let context = id_tensor(&batch.context, &self.device)?;
        let pooled = self.encoder.encode(&context, train)?;
        let scores = self.head.forward(&pooled)?;
        if let Some(&bad) = batch.target_topics.iter().find(|&&t| t as usize >= self.n_topic) {
            return Err(Error::DimensionMismatch {
                expected: self.n_topic,
                got: bad as usize + 1,
            });
        }
        let targets = ids_1d(&batch.target_topics, &self.device)?;
        let loss = candle_nn::loss::cross_entropy(&scores, &targets)?;
        Ok(PolicyOutput { loss, scores })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;
    use convrec_core::IdMatrix;

    fn dims() -> TransformerDims {
        TransformerDims {
            n_heads: 2,
            n_layers: 1,
            dim: 8,
            ffn_size: 8,
            dropout: 0.0,
            attention_dropout: 0.0,
            relu_dropout: 0.0,
            embeddings_scale: true,
            learn_positional_embeddings: false,
            n_positions: 16,
        }
    }

    fn batch(targets: Vec<u32>) -> PolicyBatch {
        let ctx = IdMatrix::from_flat(2, 3, vec![1, 5, 6, 1, 7, 0]).unwrap();
        let mask = ctx.mask(0);
        PolicyBatch {
            context: ctx.clone(),
            context_mask: mask.clone(),
            context_policy: ctx,
            context_policy_mask: mask,
            user_profile: IdMatrix::from_flat(0, 1, vec![]).unwrap(),
            user_profile_mask: IdMatrix::from_flat(0, 1, vec![]).unwrap(),
            target_topics: targets,
        }
    }

    #[test]
    fn test_policy_scores_shape() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let pooler = TransformerPooler::new(dims(), 10, 0, vb.pp("ctx")).unwrap();
        let model = TopicPolicyModel::new(pooler, 4, vb).unwrap();
        let out = model.forward(&batch(vec![1, 3]), false).unwrap();
        assert_eq!(out.scores.dims(), &[2, 4]);
        assert!(out.loss.to_scalar::<f32>().unwrap().is_finite());
    }

    #[test]
    fn test_policy_rejects_unknown_topic() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let pooler = TransformerPooler::new(dims(), 10, 0, vb.pp("ctx")).unwrap();
        let model = TopicPolicyModel::new(pooler, 4, vb).unwrap();
        assert!(model.forward(&batch(vec![1, 4]), false).is_err());
    }
}
