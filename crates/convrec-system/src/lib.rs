//! Training orchestration for the conversational recommender.
//!
//! [`KgsfSystem`] runs the three stages in order:
//!
//! 1. PRETRAIN: infomax regularizer only
//! 2. RECOMMEND: recommendation loss plus the weighted regularizer, early
//!    stopped on validation `hit@1 + hit@50`
//! 3. CONVERSE: generation loss, after the shared and recommendation
//!    parameters are frozen
//!
//! ```rust,ignore
//! use convrec_core::SyntheticConfig;
//! use convrec_system::{KgsfSystem, StandardEvaluator, SystemConfig};
//!
//! let data = SyntheticConfig::default().generate()?.into_dataset()?;
//! let mut system = KgsfSystem::new(SystemConfig::default(), &data, StandardEvaluator::new())?;
//! for phase in system.fit()? {
//!     println!("{}: {}", phase.stage, phase.report);
//! }
//! ```

pub mod config;
pub mod early_stop;
pub mod error;
pub mod evaluator;
pub mod metrics;
pub mod optim;
pub mod policy;
pub mod stage;
pub mod system;

pub use config::{parse_device, OptimConfig, SystemConfig};
pub use early_stop::EarlyStopping;
pub use error::{Error, Result};
pub use evaluator::{Evaluator, StandardEvaluator};
pub use metrics::{AverageMetric, Metrics};
pub use optim::StageOptimizer;
pub use policy::PolicyTrainer;
pub use stage::{Stage, StageBatch, StageMachine};
pub use system::{KgsfSystem, PhaseSummary};
