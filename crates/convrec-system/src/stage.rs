//! Training stages and the transitions between them.
//!
//! ```text
//! PRETRAIN -> RECOMMEND -> (freeze) -> CONVERSE
//! ```
//!
//! Stages only move forward. Any stage may be skipped, but CONVERSE is
//! refused until the shared and recommendation parameters are frozen.

use std::fmt;
use std::str::FromStr;

use convrec_core::{ConvBatch, PretrainBatch, RecBatch};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// One training phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Pretrain,
    Recommend,
    Converse,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Self::Pretrain, Self::Recommend, Self::Converse];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pretrain => "pretrain",
            Self::Recommend => "rec",
            Self::Converse => "conv",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretrain" => Ok(Self::Pretrain),
            "rec" | "recommend" => Ok(Self::Recommend),
            "conv" | "converse" => Ok(Self::Converse),
            _ => Err(Error::InvalidStage(s.to_string())),
        }
    }
}

/// A batch tagged with the stage that consumes it.
#[derive(Debug, Clone, Copy)]
pub enum StageBatch<'a> {
    Pretrain(&'a PretrainBatch),
    Recommend(&'a RecBatch),
    Converse(&'a ConvBatch),
}

impl StageBatch<'_> {
    pub fn stage(&self) -> Stage {
        match self {
            Self::Pretrain(_) => Stage::Pretrain,
            Self::Recommend(_) => Stage::Recommend,
            Self::Converse(_) => Stage::Converse,
        }
    }
}

/// Tracks the furthest stage reached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageMachine {
    current: Option<Stage>,
    frozen: bool,
}

impl StageMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Stage> {
        self.current
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Record that the shared and recommendation parameters are frozen.
    pub fn mark_frozen(&mut self) {
        self.frozen = true;
    }

    /// Whether `stage` may run now.
    pub fn check(&self, stage: Stage) -> Result<()> {
        if let Some(current) = self.current {
            if stage < current {
                return Err(Error::StageOrder {
                    to: stage,
                    reason: "after a later stage",
                });
            }
        }
        match stage {
            Stage::Converse if !self.frozen => Err(Error::StageOrder {
                to: stage,
                reason: "before the recommendation parameters are frozen",
            }),
            Stage::Pretrain | Stage::Recommend if self.frozen => Err(Error::StageOrder {
                to: stage,
                reason: "on frozen parameters",
            }),
            _ => Ok(()),
        }
    }

    /// Move to `stage` if allowed. Staying in the current stage is allowed.
    pub fn enter(&mut self, stage: Stage) -> Result<()> {
        self.check(stage)?;
        if self.current != Some(stage) {
            debug!(from = ?self.current, to = %stage, "stage transition");
            self.current = Some(stage);
        }
        Ok(())
    }
}
