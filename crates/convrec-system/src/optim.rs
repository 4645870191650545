//! Per-stage AdamW optimizer.

use candle_core::{backprop::GradStore, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use tracing::debug;

use crate::config::OptimConfig;
use crate::error::Result;

/// AdamW over a fixed variable set, with optional global-norm clipping.
///
/// A new optimizer is built at the start of every stage from the model's
/// currently trainable variables. Frozen variables are never handed to it.
pub struct StageOptimizer {
    inner: AdamW,
    vars: Vec<Var>,
    clip: Option<f64>,
}

impl StageOptimizer {
    pub fn new(vars: Vec<Var>, config: &OptimConfig) -> Result<Self> {
        debug!(vars = vars.len(), lr = config.lr, "building AdamW");
        let params = ParamsAdamW {
            lr: config.lr,
            weight_decay: config.weight_decay,
            ..Default::default()
        };
        let inner = AdamW::new(vars.clone(), params)?;
        Ok(Self {
            inner,
            vars,
            clip: config.gradient_clip,
        })
    }

    pub fn num_vars(&self) -> usize {
        self.vars.len()
    }

    pub fn learning_rate(&self) -> f64 {
        self.inner.learning_rate()
    }

    /// Backpropagate `loss` and update the owned variables.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let mut grads = loss.backward()?;
        if let Some(max_norm) = self.clip {
            clip_grad_norm(&mut grads, &self.vars, max_norm)?;
        }
        self.inner.step(&grads)?;
        Ok(())
    }
}

/// Rescale the gradients of `vars` so their joint L2 norm is at most
/// `max_norm`. Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut total = 0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let norm = total.sqrt();
    if norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for var in vars {
            if let Some(g) = grads.get(var.as_tensor()) {
                let scaled = g.affine(scale, 0.0)?;
                grads.insert(var.as_tensor(), scaled);
            }
        }
    }
    Ok(norm)
}
