//! Loss functions.

use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::error::Result;
use crate::tensor::scalar;

/// Token-level cross-entropy that ignores `pad` targets.
///
/// `logits`: `(bs, len, vocab)`, `targets`: `(bs, len)` `u32`. The loss is
/// averaged over non-pad positions. Returns `None` when every target is pad.
pub fn masked_cross_entropy(logits: &Tensor, targets: &Tensor, pad: u32) -> Result<Option<Tensor>> {
    let (bs, len, vocab) = logits.dims3()?;
    let logits = logits.reshape((bs * len, vocab))?;
    let targets = targets.reshape(bs * len)?;

    let keep = targets.ne(pad)?.to_dtype(logits.dtype())?;
    let count = scalar(&keep.sum_all()?)?;
    if count == 0.0 {
        return Ok(None);
    }

    let log_probs = ops::log_softmax(&logits, D::Minus1)?;
    let picked = log_probs
        .gather(&targets.unsqueeze(1)?.contiguous()?, 1)?
        .squeeze(1)?;
    let nll = (picked * keep)?.sum_all()?.neg()?;
    Ok(Some(nll.affine(1.0 / count as f64, 0.0)?))
}

/// Infomax regularizer: summed squared error against a multi-hot target
/// divided by the number of positive labels.
///
/// Returns `None` when the labels are all zero.
pub fn infomax_loss(predicted: &Tensor, labels: &Tensor) -> Result<Option<Tensor>> {
    let support = scalar(&labels.to_dtype(DType::F32)?.sum_all()?)?;
    if support == 0.0 {
        return Ok(None);
    }
    let err = (predicted - labels)?.sqr()?.sum_all()?;
    Ok(Some(err.affine(1.0 / support as f64, 0.0)?))
}
