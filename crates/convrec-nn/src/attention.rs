//! Attention pooling and gated fusion.

use candle_core::{Tensor, D};
use candle_nn::{linear, ops, Init, Linear, Module, VarBuilder};

use crate::error::Result;
use crate::tensor::masked_fill;

/// Additive self-attention pooling over a padded sequence.
///
/// ```text
/// e = tanh(x A) b            (bs, len)
/// y = softmax(e) x           (bs, dim)
/// ```
///
/// Padding positions are excluded. A row that is padding everywhere falls
/// back to unmasked attention so the softmax never sees an empty support.
#[derive(Debug, Clone)]
pub struct SelfAttentionSeq {
    a: Tensor,
    b: Tensor,
}

impl SelfAttentionSeq {
    pub fn new(dim: usize, da: usize, vb: VarBuilder) -> Result<Self> {
        // xavier uniform with gain 1.414
        let gain = 1.414;
        let bound = |fan_in: usize, fan_out: usize| gain * (6.0 / (fan_in + fan_out) as f64).sqrt();
        let ba = bound(dim, da);
        let bb = bound(da, 1);
        let a = vb.get_with_hints((dim, da), "a", Init::Uniform { lo: -ba, up: ba })?;
        let b = vb.get_with_hints((da, 1), "b", Init::Uniform { lo: -bb, up: bb })?;
        Ok(Self { a, b })
    }

    /// `xs`: `(bs, len, dim)`, `pad_mask`: `(bs, len)` `u8`, 1 at padding.
    pub fn forward(&self, xs: &Tensor, pad_mask: &Tensor) -> Result<Tensor> {
        let e = xs
            .broadcast_matmul(&self.a)?
            .tanh()?
            .broadcast_matmul(&self.b)?
            .squeeze(D::Minus1)?;

        // rows with at least one real position keep their mask
        let keep = pad_mask.eq(0u8)?.to_dtype(e.dtype())?;
        let all_pad = keep.sum_keepdim(1)?.eq(0f64)?.to_dtype(e.dtype())?;
        let keep = keep.broadcast_add(&all_pad)?.gt(0f64)?;
        let e = masked_fill(&e, &keep, -1e30)?;

        let attention = ops::softmax_last_dim(&e.contiguous()?)?;
        Ok(attention.unsqueeze(1)?.matmul(xs)?.squeeze(1)?)
    }
}

/// Learned scalar gate between two vectors.
///
/// `g = sigmoid(W2 W1 [a; b])`, output `g * a + (1 - g) * b`.
#[derive(Debug, Clone)]
pub struct GateLayer {
    norm1: Linear,
    norm2: Linear,
}

impl GateLayer {
    pub fn new(dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            norm1: linear(dim * 2, dim, vb.pp("norm1"))?,
            norm2: linear(dim, 1, vb.pp("norm2"))?,
        })
    }

    /// `a`, `b`: `(bs, dim)`.
    pub fn forward(&self, a: &Tensor, b: &Tensor) -> Result<Tensor> {
        let joined = Tensor::cat(&[a, b], D::Minus1)?;
        let gate = ops::sigmoid(&self.norm2.forward(&self.norm1.forward(&joined)?)?)?;
        let one_minus = gate.affine(-1.0, 1.0)?;
        Ok((a.broadcast_mul(&gate)? + b.broadcast_mul(&one_minus)?)?)
    }
}
