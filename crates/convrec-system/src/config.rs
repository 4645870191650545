//! Run configuration.
//!
//! Everything deserializes from JSON with defaults for missing fields:
//!
//! ```json
//! {
//!   "rec": { "epoch": 10, "batch_size": 32 },
//!   "model": { "kg_emb_dim": 64, "decode": { "beam": { "width": 4 } } },
//!   "device": "cuda:0"
//! }
//! ```

use std::path::Path;

use candle_core::Device;
use convrec_core::TruncationConfig;
use convrec_nn::KgsfConfig;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Optimizer settings of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimConfig {
    pub epoch: usize,
    pub batch_size: usize,
    pub lr: f64,
    pub weight_decay: f64,
    /// Clip the global gradient norm to this value.
    pub gradient_clip: Option<f64>,
}

impl Default for OptimConfig {
    fn default() -> Self {
        Self {
            epoch: 1,
            batch_size: 32,
            lr: 1e-3,
            weight_decay: 0.0,
            gradient_clip: None,
        }
    }
}

impl OptimConfig {
    pub fn with_epochs(mut self, epoch: usize) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_gradient_clip(mut self, clip: f64) -> Self {
        self.gradient_clip = Some(clip);
        self
    }

    fn validate(&self, stage: &str) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidConfig(format!("{stage}.batch_size must be positive")));
        }
        if !(self.lr > 0.0) {
            return Err(Error::InvalidConfig(format!("{stage}.lr must be positive")));
        }
        if let Some(clip) = self.gradient_clip {
            if !(clip > 0.0) {
                return Err(Error::InvalidConfig(format!("{stage}.gradient_clip must be positive")));
            }
        }
        Ok(())
    }
}

/// Full system configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub pretrain: OptimConfig,
    pub rec: OptimConfig,
    pub conv: OptimConfig,
    pub policy: OptimConfig,
    pub model: KgsfConfig,
    pub truncation: TruncationConfig,
    /// Stop recommendation training when validation stops improving.
    pub early_stop: bool,
    /// Validation epochs without improvement before stopping.
    pub impatience: usize,
    pub seed: u64,
    /// `cpu` or `cuda:N`.
    pub device: String,
    /// Inject target item or topic tokens into the training context.
    pub enhance_context: bool,
    /// Expand only recommender turns into recommendation examples.
    pub rec_recommender_only: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            pretrain: OptimConfig::default().with_epochs(3),
            rec: OptimConfig::default().with_epochs(9),
            conv: OptimConfig::default().with_epochs(90),
            policy: OptimConfig::default().with_epochs(10),
            model: KgsfConfig::default(),
            truncation: TruncationConfig::default(),
            early_stop: true,
            impatience: 3,
            seed: 42,
            device: "cpu".to_string(),
            enhance_context: false,
            rec_recommender_only: false,
        }
    }
}

impl SystemConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_model(mut self, model: KgsfConfig) -> Self {
        self.model = model;
        self
    }

    pub fn with_truncation(mut self, truncation: TruncationConfig) -> Self {
        self.truncation = truncation;
        self
    }

    pub fn with_epochs(mut self, pretrain: usize, rec: usize, conv: usize) -> Self {
        self.pretrain.epoch = pretrain;
        self.rec.epoch = rec;
        self.conv.epoch = conv;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        for stage in [&mut self.pretrain, &mut self.rec, &mut self.conv, &mut self.policy] {
            stage.batch_size = batch_size;
        }
        self
    }

    pub fn with_device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn with_early_stop(mut self, enabled: bool, impatience: usize) -> Self {
        self.early_stop = enabled;
        self.impatience = impatience;
        self
    }

    pub fn with_context_enhancement(mut self, enabled: bool) -> Self {
        self.enhance_context = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.pretrain.validate("pretrain")?;
        self.rec.validate("rec")?;
        self.conv.validate("conv")?;
        self.policy.validate("policy")?;
        self.model.validate()?;
        self.truncation.validate()?;
        if self.early_stop && self.impatience == 0 {
            return Err(Error::InvalidConfig("impatience must be positive".into()));
        }
        parse_device(&self.device)?;
        Ok(())
    }

    pub fn device(&self) -> Result<Device> {
        parse_device(&self.device)
    }
}

/// Resolve `cpu` or `cuda:N` (`cuda` alone means ordinal 0).
pub fn parse_device(name: &str) -> Result<Device> {
    let name = name.trim().to_ascii_lowercase();
    if name == "cpu" {
        return Ok(Device::Cpu);
    }
    let ordinal = match name.strip_prefix("cuda") {
        Some("") => 0,
        Some(rest) => rest
            .strip_prefix(':')
            .and_then(|n| n.parse::<usize>().ok())
            .ok_or_else(|| Error::InvalidConfig(format!("bad device {name:?}")))?,
        None => return Err(Error::InvalidConfig(format!("unknown device {name:?}"))),
    };
    Ok(Device::new_cuda(ordinal)?)
}
