//! Embedding tables.

use candle_core::{Device, Tensor};
use candle_nn::{Init, VarBuilder};

use crate::error::{Error, Result};
use crate::tensor::lookup;

/// Embedding table whose padding row is pinned at zero.
///
/// The pad row is multiplied by zero on every access, so it stays zero and
/// never receives gradient regardless of what the optimizer does to the
/// underlying variable.
#[derive(Debug, Clone)]
pub struct PaddedEmbedding {
    weight: Tensor,
    keep: Tensor,
    padding_idx: u32,
}

impl PaddedEmbedding {
    /// Normal init with `std`, as used for both KG and token embeddings.
    pub fn new(
        num_embeddings: usize,
        dim: usize,
        padding_idx: u32,
        std: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        if padding_idx as usize >= num_embeddings {
            return Err(Error::InvalidConfig(format!(
                "padding index {padding_idx} outside {num_embeddings} embeddings"
            )));
        }
        let weight = vb.get_with_hints(
            (num_embeddings, dim),
            "weight",
            Init::Randn {
                mean: 0.0,
                stdev: std,
            },
        )?;
        let keep = pad_keep(num_embeddings, padding_idx, vb.device())?;
        Ok(Self {
            weight,
            keep,
            padding_idx,
        })
    }

    /// The table with the pad row zeroed, `(num_embeddings, dim)`.
    pub fn weight(&self) -> Result<Tensor> {
        Ok(self.weight.broadcast_mul(&self.keep)?)
    }

    pub fn padding_idx(&self) -> u32 {
        self.padding_idx
    }

    pub fn dim(&self) -> Result<usize> {
        Ok(self.weight.dim(1)?)
    }

    pub fn forward(&self, ids: &Tensor) -> Result<Tensor> {
        lookup(&self.weight()?, ids)
    }
}

fn pad_keep(n: usize, padding_idx: u32, device: &Device) -> Result<Tensor> {
    let keep: Vec<f32> = (0..n)
        .map(|i| if i == padding_idx as usize { 0.0 } else { 1.0 })
        .collect();
    Ok(Tensor::from_vec(keep, (n, 1), device)?)
}

/// Sinusoidal position codes, `(n_positions, dim)`.
///
/// Even columns hold `sin`, odd columns `cos`, of `pos / 10000^(2j/dim)`.
pub fn sinusoidal_positions(n_positions: usize, dim: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; n_positions * dim];
    for pos in 0..n_positions {
        for j in 0..dim / 2 {
            let angle = pos as f64 / 10000f64.powf(2.0 * j as f64 / dim as f64);
            data[pos * dim + 2 * j] = angle.sin() as f32;
            data[pos * dim + 2 * j + 1] = angle.cos() as f32;
        }
    }
    Ok(Tensor::from_vec(data, (n_positions, dim), device)?)
}

/// Position embedding table, fixed sinusoidal or learned.
#[derive(Debug, Clone)]
pub struct PositionEmbedding {
    table: Tensor,
}

impl PositionEmbedding {
    pub fn new(n_positions: usize, dim: usize, learned: bool, vb: VarBuilder) -> Result<Self> {
        let table = if learned {
            vb.get_with_hints(
                (n_positions, dim),
                "weight",
                Init::Randn {
                    mean: 0.0,
                    stdev: (dim as f64).powf(-0.5),
                },
            )?
        } else {
            sinusoidal_positions(n_positions, dim, vb.device())?
        };
        Ok(Self { table })
    }

    pub fn n_positions(&self) -> Result<usize> {
        Ok(self.table.dim(0)?)
    }

    /// Embeddings for an arbitrary-rank tensor of positions.
    pub fn forward(&self, positions: &Tensor) -> Result<Tensor> {
        lookup(&self.table, positions)
    }

    /// Rows `start..start + len`, `(len, dim)`.
    pub fn range(&self, start: usize, len: usize) -> Result<Tensor> {
        let n = self.n_positions()?;
        if start + len > n {
            return Err(Error::DimensionMismatch {
                expected: n,
                got: start + len,
            });
        }
        Ok(self.table.narrow(0, start, len)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;
    use candle_nn::VarMap;

    #[test]
    fn test_pad_row_is_zero() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let emb = PaddedEmbedding::new(5, 4, 2, 1.0, vb).unwrap();
        let ids = Tensor::new(&[2u32, 1], &device).unwrap();
        let out = emb.forward(&ids).unwrap().to_vec2::<f32>().unwrap();
        assert!(out[0].iter().all(|&x| x == 0.0));
        assert!(out[1].iter().any(|&x| x != 0.0));
    }

    #[test]
    fn test_sinusoidal_first_row() {
        let t = sinusoidal_positions(3, 4, &Device::Cpu).unwrap();
        let v = t.to_vec2::<f32>().unwrap();
        assert_eq!(v[0], vec![0., 1., 0., 1.]);
        assert!((v[1][0] - 1f32.sin()).abs() < 1e-6);
    }

    #[test]
    fn test_range_out_of_positions() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let pos = PositionEmbedding::new(4, 2, false, vb).unwrap();
        assert!(pos.range(2, 2).is_ok());
        assert!(pos.range(3, 2).is_err());
    }
}
