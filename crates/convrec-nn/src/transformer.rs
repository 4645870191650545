//! Post-norm transformer blocks.
//!
//! The encoder reads the dialogue context. The decoder is the KG-aware
//! variant: every layer attends, in order, to its own causal prefix, the
//! context entities, the context words and the encoded context tokens.
//!
//! The decoder supports incremental decoding. [`IncrementalState`] caches
//! each layer's input sequence so a step only runs the new position through
//! the layer stack. Because every block is position-wise apart from causal
//! self-attention, a step reproduces the last row of the full forward pass.

use candle_core::{DType, Device, Tensor, D};
use candle_nn::{layer_norm, linear, ops, Dropout, LayerNorm, Linear, Module, VarBuilder};

use crate::embedding::{PaddedEmbedding, PositionEmbedding};
use crate::error::{Error, Result};
use crate::tensor::{causal_mask, masked_fill, NEAR_INF};

const LAYER_NORM_EPS: f64 = 1e-5;

/// Shared hyperparameters of the encoder and decoder stacks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformerDims {
    pub n_heads: usize,
    pub n_layers: usize,
    pub dim: usize,
    pub ffn_size: usize,
    pub dropout: f32,
    pub attention_dropout: f32,
    pub relu_dropout: f32,
    pub embeddings_scale: bool,
    pub learn_positional_embeddings: bool,
    pub n_positions: usize,
}

impl TransformerDims {
    pub fn validate(&self) -> Result<()> {
        if self.n_heads == 0 || self.dim % self.n_heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "embedding size {} is not divisible by {} heads",
                self.dim, self.n_heads
            )));
        }
        for (name, p) in [
            ("dropout", self.dropout),
            ("attention_dropout", self.attention_dropout),
            ("relu_dropout", self.relu_dropout),
        ] {
            if !(0.0..1.0).contains(&p) {
                return Err(Error::InvalidConfig(format!("{name} must lie in [0, 1), got {p}")));
            }
        }
        Ok(())
    }
}

/// Multi-head scaled dot-product attention.
#[derive(Debug, Clone)]
pub struct MultiHeadAttention {
    q_lin: Linear,
    k_lin: Linear,
    v_lin: Linear,
    out_lin: Linear,
    n_heads: usize,
    head_dim: usize,
    attn_dropout: Dropout,
}

impl MultiHeadAttention {
    pub fn new(n_heads: usize, dim: usize, attention_dropout: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            q_lin: linear(dim, dim, vb.pp("q_lin"))?,
            k_lin: linear(dim, dim, vb.pp("k_lin"))?,
            v_lin: linear(dim, dim, vb.pp("v_lin"))?,
            out_lin: linear(dim, dim, vb.pp("out_lin"))?,
            n_heads,
            head_dim: dim / n_heads,
            attn_dropout: Dropout::new(attention_dropout),
        })
    }

    fn split_heads(&self, x: &Tensor) -> Result<Tensor> {
        let (bs, len, _) = x.dims3()?;
        Ok(x
            .reshape((bs, len, self.n_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    /// `query`: `(bs, q, dim)`, `key`: `(bs, k, dim)`.
    ///
    /// `keep` is a `u8` mask broadcastable to `(bs, q, k)`; zero entries are
    /// excluded from the softmax.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        keep: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (bs, q_len, dim) = query.dims3()?;
        let scale = 1.0 / (self.head_dim as f64).sqrt();

        let q = self.split_heads(&self.q_lin.forward(query)?)?.affine(scale, 0.0)?;
        let k = self.split_heads(&self.k_lin.forward(key)?)?;
        let v = self.split_heads(&self.v_lin.forward(key)?)?;

        let mut scores = q.matmul(&k.t()?.contiguous()?)?;
        if let Some(keep) = keep {
            scores = masked_fill(&scores, &keep.unsqueeze(1)?, -NEAR_INF)?;
        }
        let weights = ops::softmax_last_dim(&scores)?;
        let weights = self.attn_dropout.forward(&weights, train)?;

        let context = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((bs, q_len, dim))?;
        Ok(self.out_lin.forward(&context)?)
    }
}

/// Two-layer position-wise feed-forward block with ReLU.
#[derive(Debug, Clone)]
pub struct TransformerFFN {
    lin1: Linear,
    lin2: Linear,
    relu_dropout: Dropout,
}

impl TransformerFFN {
    pub fn new(dim: usize, ffn_size: usize, relu_dropout: f32, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            lin1: linear(dim, ffn_size, vb.pp("lin1"))?,
            lin2: linear(ffn_size, dim, vb.pp("lin2"))?,
            relu_dropout: Dropout::new(relu_dropout),
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let h = self.lin1.forward(x)?.relu()?;
        let h = self.relu_dropout.forward(&h, train)?;
        Ok(self.lin2.forward(&h)?)
    }
}

#[derive(Debug, Clone)]
struct EncoderLayer {
    attention: MultiHeadAttention,
    norm1: LayerNorm,
    ffn: TransformerFFN,
    norm2: LayerNorm,
    dropout: Dropout,
}

impl EncoderLayer {
    fn new(dims: &TransformerDims, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            attention: MultiHeadAttention::new(
                dims.n_heads,
                dims.dim,
                dims.attention_dropout,
                vb.pp("attention"),
            )?,
            norm1: layer_norm(dims.dim, LAYER_NORM_EPS, vb.pp("norm1"))?,
            ffn: TransformerFFN::new(dims.dim, dims.ffn_size, dims.relu_dropout, vb.pp("ffn"))?,
            norm2: layer_norm(dims.dim, LAYER_NORM_EPS, vb.pp("norm2"))?,
            dropout: Dropout::new(dims.dropout),
        })
    }

    /// `keep`: `(bs, len)` `u8`.
    fn forward(&self, x: &Tensor, keep: &Tensor, train: bool) -> Result<Tensor> {
        let attended = self.attention.forward(x, x, Some(&keep.unsqueeze(1)?), train)?;
        let x = self.norm1.forward(&(x + self.dropout.forward(&attended, train)?)?)?;
        let ff = self.ffn.forward(&x, train)?;
        let x = self.norm2.forward(&(&x + self.dropout.forward(&ff, train)?)?)?;
        Ok(x.broadcast_mul(&keep.to_dtype(x.dtype())?.unsqueeze(D::Minus1)?)?)
    }
}

/// Context encoder with its own token embedding.
#[derive(Debug, Clone)]
pub struct TransformerEncoder {
    embedding: PaddedEmbedding,
    positions: PositionEmbedding,
    layers: Vec<EncoderLayer>,
    dropout: Dropout,
    dims: TransformerDims,
}

impl TransformerEncoder {
    pub fn new(
        dims: TransformerDims,
        vocab_size: usize,
        padding_idx: u32,
        vb: VarBuilder,
    ) -> Result<Self> {
        dims.validate()?;
        let std = (dims.dim as f64).powf(-0.5);
        let embedding = PaddedEmbedding::new(vocab_size, dims.dim, padding_idx, std, vb.pp("embeddings"))?;
        let positions = PositionEmbedding::new(
            dims.n_positions,
            dims.dim,
            dims.learn_positional_embeddings,
            vb.pp("position_embeddings"),
        )?;
        let layers = (0..dims.n_layers)
            .map(|i| EncoderLayer::new(&dims, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embedding,
            positions,
            layers,
            dropout: Dropout::new(dims.dropout),
            dims,
        })
    }

    pub fn dim(&self) -> usize {
        self.dims.dim
    }

    /// `tokens`: `(bs, len)` `u32`.
    ///
    /// Returns the encoding `(bs, len, dim)` and the `(bs, len)` keep mask.
    /// Positions count real tokens only, so left padding leaves the first
    /// real token at position zero.
    pub fn forward(&self, tokens: &Tensor, train: bool) -> Result<(Tensor, Tensor)> {
        let keep = tokens.ne(self.embedding.padding_idx())?;
        let keep_f = keep.to_dtype(DType::F32)?;
        let positions = keep_f
            .cumsum(1)?
            .affine(1.0, -1.0)?
            .maximum(0f32)?
            .to_dtype(DType::U32)?;
        if tokens.dim(1)? > self.dims.n_positions {
            return Err(Error::DimensionMismatch {
                expected: self.dims.n_positions,
                got: tokens.dim(1)?,
            });
        }

        let mut x = self.embedding.forward(tokens)?;
        if self.dims.embeddings_scale {
            x = x.affine((self.dims.dim as f64).sqrt(), 0.0)?;
        }
        x = (x + self.positions.forward(&positions)?)?;
        x = self.dropout.forward(&x, train)?;
        x = x.broadcast_mul(&keep_f.to_dtype(x.dtype())?.unsqueeze(D::Minus1)?)?;

        for layer in &self.layers {
            x = layer.forward(&x, &keep, train)?;
        }
        Ok((x, keep))
    }
}

/// Everything the decoder attends to besides its own prefix.
///
/// Masks are `(bs, len)` `u8` keep masks.
#[derive(Debug, Clone)]
pub struct DecoderMemory {
    pub token_encoding: Tensor,
    pub token_mask: Tensor,
    pub entity_reps: Tensor,
    pub entity_mask: Tensor,
    pub word_reps: Tensor,
    pub word_mask: Tensor,
}

impl DecoderMemory {
    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.token_encoding.dim(0)?)
    }

    /// Tile the batch `beam` times; row `n * bs + j` is a copy of row `j`.
    pub fn repeat(&self, beam: usize) -> Result<Self> {
        let rep3 = |t: &Tensor| t.repeat((beam, 1, 1));
        let rep2 = |t: &Tensor| t.repeat((beam, 1));
        Ok(Self {
            token_encoding: rep3(&self.token_encoding)?,
            token_mask: rep2(&self.token_mask)?,
            entity_reps: rep3(&self.entity_reps)?,
            entity_mask: rep2(&self.entity_mask)?,
            word_reps: rep3(&self.word_reps)?,
            word_mask: rep2(&self.word_mask)?,
        })
    }
}

/// Per-layer inputs seen so far during incremental decoding.
#[derive(Debug, Clone, Default)]
pub struct IncrementalState {
    layers: Vec<Tensor>,
    steps: usize,
}

impl IncrementalState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of decoded positions.
    pub fn len(&self) -> usize {
        self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps == 0
    }

    /// Append `x` to the cache of layer `i`, returning the full sequence.
    fn extend(&mut self, i: usize, x: &Tensor) -> Result<Tensor> {
        let seq = match self.layers.get(i) {
            Some(prev) => Tensor::cat(&[prev, x], 1)?,
            None => x.clone(),
        };
        if i < self.layers.len() {
            self.layers[i] = seq.clone();
        } else {
            self.layers.push(seq.clone());
        }
        Ok(seq)
    }

    /// Keep cache row `rows[r]` as the new row `r`.
    pub fn reorder(&mut self, rows: &Tensor) -> Result<()> {
        for layer in &mut self.layers {
            *layer = layer.index_select(rows, 0)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct DecoderLayer {
    self_attention: MultiHeadAttention,
    norm1: LayerNorm,
    entity_attention: MultiHeadAttention,
    norm_entity: LayerNorm,
    word_attention: MultiHeadAttention,
    norm_word: LayerNorm,
    encoder_attention: MultiHeadAttention,
    norm2: LayerNorm,
    ffn: TransformerFFN,
    norm3: LayerNorm,
    dropout: Dropout,
}

impl DecoderLayer {
    fn new(dims: &TransformerDims, vb: VarBuilder) -> Result<Self> {
        let mha = |name: &str| {
            MultiHeadAttention::new(dims.n_heads, dims.dim, dims.attention_dropout, vb.pp(name))
        };
        let norm = |name: &str| layer_norm(dims.dim, LAYER_NORM_EPS, vb.pp(name));
        Ok(Self {
            self_attention: mha("self_attention")?,
            norm1: norm("norm1")?,
            entity_attention: mha("entity_attention")?,
            norm_entity: norm("norm_entity")?,
            word_attention: mha("word_attention")?,
            norm_word: norm("norm_word")?,
            encoder_attention: mha("encoder_attention")?,
            norm2: norm("norm2")?,
            ffn: TransformerFFN::new(dims.dim, dims.ffn_size, dims.relu_dropout, vb.pp("ffn"))?,
            norm3: norm("norm3")?,
            dropout: Dropout::new(dims.dropout),
        })
    }

    fn residual(&self, x: &Tensor, update: &Tensor, norm: &LayerNorm, train: bool) -> Result<Tensor> {
        Ok(norm.forward(&(x + self.dropout.forward(update, train)?)?)?)
    }

    /// `x`: the query rows; `prefix`: every decoder input up to and
    /// including them.
    fn forward(
        &self,
        x: &Tensor,
        prefix: &Tensor,
        self_keep: Option<&Tensor>,
        memory: &DecoderMemory,
        train: bool,
    ) -> Result<Tensor> {
        let h = self.self_attention.forward(x, prefix, self_keep, train)?;
        let x = self.residual(x, &h, &self.norm1, train)?;

        let entity_keep = memory.entity_mask.unsqueeze(1)?;
        let h = self
            .entity_attention
            .forward(&x, &memory.entity_reps, Some(&entity_keep), train)?;
        let x = self.residual(&x, &h, &self.norm_entity, train)?;

        let word_keep = memory.word_mask.unsqueeze(1)?;
        let h = self
            .word_attention
            .forward(&x, &memory.word_reps, Some(&word_keep), train)?;
        let x = self.residual(&x, &h, &self.norm_word, train)?;

        let token_keep = memory.token_mask.unsqueeze(1)?;
        let h = self
            .encoder_attention
            .forward(&x, &memory.token_encoding, Some(&token_keep), train)?;
        let x = self.residual(&x, &h, &self.norm2, train)?;

        let h = self.ffn.forward(&x, train)?;
        self.residual(&x, &h, &self.norm3, train)
    }
}

/// KG-aware decoder sharing the token embedding with the output projection.
#[derive(Debug, Clone)]
pub struct TransformerDecoderKG {
    embedding: PaddedEmbedding,
    positions: PositionEmbedding,
    layers: Vec<DecoderLayer>,
    dropout: Dropout,
    dims: TransformerDims,
}

impl TransformerDecoderKG {
    pub fn new(dims: TransformerDims, embedding: PaddedEmbedding, vb: VarBuilder) -> Result<Self> {
        dims.validate()?;
        if embedding.dim()? != dims.dim {
            return Err(Error::DimensionMismatch {
                expected: dims.dim,
                got: embedding.dim()?,
            });
        }
        let positions = PositionEmbedding::new(
            dims.n_positions,
            dims.dim,
            dims.learn_positional_embeddings,
            vb.pp("position_embeddings"),
        )?;
        let layers = (0..dims.n_layers)
            .map(|i| DecoderLayer::new(&dims, vb.pp(format!("layers.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            embedding,
            positions,
            layers,
            dropout: Dropout::new(dims.dropout),
            dims,
        })
    }

    fn embed(&self, inputs: &Tensor, start: usize, train: bool) -> Result<Tensor> {
        let len = inputs.dim(1)?;
        let mut x = self.embedding.forward(inputs)?;
        if self.dims.embeddings_scale {
            x = x.affine((self.dims.dim as f64).sqrt(), 0.0)?;
        }
        let pos = self.positions.range(start, len)?.unsqueeze(0)?;
        let x = x.broadcast_add(&pos)?;
        Ok(self.dropout.forward(&x, train)?)
    }

    /// Full causal pass over `inputs` `(bs, len)`. Returns `(bs, len, dim)`.
    pub fn forward(&self, inputs: &Tensor, memory: &DecoderMemory, train: bool) -> Result<Tensor> {
        let len = inputs.dim(1)?;
        let causal = causal_mask(len, inputs.device())?;
        let mut x = self.embed(inputs, 0, train)?;
        for layer in &self.layers {
            x = layer.forward(&x, &x, Some(&causal), memory, train)?;
        }
        Ok(x)
    }

    /// One incremental step for `last` `(rows, 1)`. Returns `(rows, 1, dim)`.
    pub fn forward_step(
        &self,
        last: &Tensor,
        memory: &DecoderMemory,
        state: &mut IncrementalState,
    ) -> Result<Tensor> {
        let mut x = self.embed(last, state.len(), false)?;
        for (i, layer) in self.layers.iter().enumerate() {
            let prefix = state.extend(i, &x)?;
            x = layer.forward(&x, &prefix, None, memory, false)?;
        }
        state.steps += 1;
        Ok(x)
    }
}

/// `(rows, 1)` column of `token`.
pub fn token_column(token: u32, rows: usize, device: &Device) -> Result<Tensor> {
    Ok(Tensor::full(token, (rows, 1), device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn dims() -> TransformerDims {
        TransformerDims {
            n_heads: 2,
            n_layers: 2,
            dim: 8,
            ffn_size: 16,
            dropout: 0.1,
            attention_dropout: 0.0,
            relu_dropout: 0.1,
            embeddings_scale: true,
            learn_positional_embeddings: false,
            n_positions: 32,
        }
    }

    fn memory(bs: usize, device: &Device) -> DecoderMemory {
        let enc = Tensor::randn(0f32, 1f32, (bs, 5, 8), device).unwrap();
        let ent = Tensor::randn(0f32, 1f32, (bs, 3, 8), device).unwrap();
        let word = Tensor::randn(0f32, 1f32, (bs, 4, 8), device).unwrap();
        DecoderMemory {
            token_encoding: enc,
            token_mask: Tensor::new(&[[0u8, 1, 1, 1, 1], [0, 0, 0, 1, 1]], device).unwrap(),
            entity_reps: ent,
            entity_mask: Tensor::new(&[[0u8, 0, 1], [0, 0, 0]], device).unwrap(),
            word_reps: word,
            word_mask: Tensor::new(&[[1u8, 1, 1, 1], [0, 0, 1, 1]], device).unwrap(),
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn test_dims_validation() {
        assert!(dims().validate().is_ok());
        let bad = TransformerDims { n_heads: 3, ..dims() };
        assert!(bad.validate().is_err());
        let bad = TransformerDims { dropout: 1.0, ..dims() };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_encoder_zeroes_padding() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let enc = TransformerEncoder::new(dims(), 10, 0, vb).unwrap();
        let tokens = Tensor::new(&[[0u32, 0, 4, 5], [3, 4, 5, 6]], &device).unwrap();
        let (out, keep) = enc.forward(&tokens, false).unwrap();
        assert_eq!(out.dims(), &[2, 4, 8]);
        assert_eq!(keep.to_vec2::<u8>().unwrap()[0], vec![0, 0, 1, 1]);
        let v = out.to_vec3::<f32>().unwrap();
        assert!(v[0][0].iter().all(|&x| x == 0.0));
        assert!(v[0][2].iter().any(|&x| x != 0.0));
    }

    #[test]
    fn test_encoder_positions_skip_left_padding() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let enc = TransformerEncoder::new(dims(), 10, 0, vb).unwrap();
        let padded = Tensor::new(&[[0u32, 0, 4, 5]], &device).unwrap();
        let plain = Tensor::new(&[[4u32, 5]], &device).unwrap();
        let (a, _) = enc.forward(&padded, false).unwrap();
        let (b, _) = enc.forward(&plain, false).unwrap();
        let a = a.narrow(1, 2, 2).unwrap();
        assert!(max_abs_diff(&a, &b) < 1e-5);
    }

    #[test]
    fn test_incremental_matches_full_pass() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let emb = PaddedEmbedding::new(10, 8, 0, 0.35, vb.pp("tok")).unwrap();
        let dec = TransformerDecoderKG::new(dims(), emb, vb.pp("dec")).unwrap();
        let mem = memory(2, &device);

        let inputs = Tensor::new(&[[1u32, 5, 6, 7], [1, 4, 4, 2]], &device).unwrap();
        let full = dec.forward(&inputs, &mem, false).unwrap();

        let mut state = IncrementalState::new();
        let mut steps = Vec::new();
        for t in 0..4 {
            let col = inputs.narrow(1, t, 1).unwrap();
            steps.push(dec.forward_step(&col, &mem, &mut state).unwrap());
        }
        assert_eq!(state.len(), 4);
        let incr = Tensor::cat(&steps, 1).unwrap();
        assert!(max_abs_diff(&full, &incr) < 1e-4);
    }

    #[test]
    fn test_causal_prefix_independent_of_future() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let emb = PaddedEmbedding::new(10, 8, 0, 0.35, vb.pp("tok")).unwrap();
        let dec = TransformerDecoderKG::new(dims(), emb, vb.pp("dec")).unwrap();
        let mem = memory(2, &device);

        let a = Tensor::new(&[[1u32, 5, 6], [1, 4, 4]], &device).unwrap();
        let b = Tensor::new(&[[1u32, 5, 9], [1, 4, 8]], &device).unwrap();
        let oa = dec.forward(&a, &mem, false).unwrap().narrow(1, 0, 2).unwrap();
        let ob = dec.forward(&b, &mem, false).unwrap().narrow(1, 0, 2).unwrap();
        assert!(max_abs_diff(&oa, &ob) < 1e-5);
    }

    #[test]
    fn test_memory_repeat_layout() {
        let device = Device::Cpu;
        let mem = memory(2, &device).repeat(3).unwrap();
        assert_eq!(mem.batch_size().unwrap(), 6);
        let masks = mem.entity_mask.to_vec2::<u8>().unwrap();
        assert_eq!(masks[0], masks[2]);
        assert_eq!(masks[1], masks[5]);
    }

    #[test]
    fn test_reorder_selects_rows() {
        let device = Device::Cpu;
        let mut state = IncrementalState::new();
        let x = Tensor::new(&[[[1f32]], [[2f32]]], &device).unwrap();
        state.extend(0, &x).unwrap();
        let rows = Tensor::new(&[1u32, 1, 0], &device).unwrap();
        state.reorder(&rows).unwrap();
        let v = state.layers[0].flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(v, vec![2., 2., 1.]);
    }
}
