//! Conversions between batch matrices and tensors, plus small masking
//! helpers shared by the layers.

use candle_core::{DType, Device, Tensor};
use convrec_core::{FloatMatrix, IdMatrix};

use crate::error::Result;

/// Additive mask value for excluded attention positions.
pub const NEAR_INF: f32 = 1e20;

/// `(rows, cols)` `u32` tensor.
pub fn id_tensor(m: &IdMatrix, device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_slice(m.as_slice(), m.shape(), device)?)
}

/// `(rows, cols)` `f32` tensor.
pub fn float_tensor(m: &FloatMatrix, device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_slice(&m.data, (m.rows, m.cols), device)?)
}

/// 1-D `u32` tensor.
pub fn ids_1d(ids: &[u32], device: &Device) -> Result<Tensor> {
    Ok(Tensor::from_slice(ids, ids.len(), device)?)
}

/// Gather rows of `table` for an id matrix of any rank.
///
/// `table` is `(n, d)`; the result has shape `ids.dims() ++ [d]`.
pub fn lookup(table: &Tensor, ids: &Tensor) -> Result<Tensor> {
    let mut dims = ids.dims().to_vec();
    dims.push(table.dim(1)?);
    let flat = ids.flatten_all()?;
    Ok(table.index_select(&flat, 0)?.reshape(dims)?)
}

/// Replace positions where `keep == 0` with `value`.
///
/// `keep` must broadcast to the shape of `xs`.
pub fn masked_fill(xs: &Tensor, keep: &Tensor, value: f32) -> Result<Tensor> {
    let shape = xs.shape();
    let keep = keep.broadcast_as(shape)?;
    let fill = Tensor::new(value, xs.device())?
        .to_dtype(xs.dtype())?
        .broadcast_as(shape)?;
    Ok(keep.where_cond(xs, &fill)?)
}

/// `1 - mask` for a `u8` mask.
pub fn invert_mask(mask: &Tensor) -> Result<Tensor> {
    Ok(mask.eq(0u8)?)
}

/// Lower-triangular `(1, len, len)` keep mask.
pub fn causal_mask(len: usize, device: &Device) -> Result<Tensor> {
    let data: Vec<u8> = (0..len)
        .flat_map(|i| (0..len).map(move |j| u8::from(j <= i)))
        .collect();
    Ok(Tensor::from_vec(data, (1, len, len), device)?)
}

/// Index of the largest value, first one on ties.
pub fn argmax_first(row: &[f32]) -> u32 {
    let mut best = 0usize;
    for (i, &v) in row.iter().enumerate() {
        if v > row[best] {
            best = i;
        }
    }
    best as u32
}

/// `(rows, cols)` `u32` tensor from host rows of equal length.
pub fn rows_tensor(rows: &[Vec<u32>], device: &Device) -> Result<Tensor> {
    let cols = rows.first().map_or(0, Vec::len);
    let flat: Vec<u32> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (rows.len(), cols), device)?)
}

/// Scalar value of a single-element tensor as `f32`.
pub fn scalar(t: &Tensor) -> Result<f32> {
    Ok(t.to_dtype(DType::F32)?.flatten_all()?.sum_all()?.to_scalar::<f32>()?)
}
