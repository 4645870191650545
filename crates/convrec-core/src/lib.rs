//! # convrec-core
//!
//! Data side of the conversational recommender: vocabulary, conversation
//! records, static knowledge graphs and the batch builder.
//!
//! Nothing here depends on a tensor library. Batches are plain
//! [`IdMatrix`] / [`FloatMatrix`] values that the `convrec-nn` crate turns
//! into tensors.
//!
//! ```
//! use convrec_core::{Mode, SyntheticConfig, TruncationConfig};
//!
//! let dataset = SyntheticConfig::default().generate()?.into_dataset()?;
//! let truncation = TruncationConfig::default().with_context(10).with_response(4);
//! let mut loader = dataset.loader(Mode::Train, truncation);
//! let batch = &loader.conv_batches(2, false)[0];
//! assert_eq!(batch.response.shape(), (2, 4));
//! # Ok::<(), convrec_core::Error>(())
//! ```

pub mod augment;
pub mod batch;
pub mod dataset;
pub mod error;
pub mod graph;
pub mod loader;
pub mod padding;
pub mod record;
pub mod sampling;
pub mod synthetic;
pub mod vocab;

pub use augment::{augment_policy, augment_rec};
pub use batch::{
    BatchBuilder, ConvBatch, HistoryBatch, Mode, PolicyBatch, PretrainBatch, RecBatch,
    TruncationConfig,
};
pub use dataset::{Dataset, DatasetStats};
pub use error::{Error, Result};
pub use graph::{EntityGraph, NormalizedEdges, RelationEdge, SideData, WordGraph};
pub use loader::DataLoader;
pub use padding::{FloatMatrix, IdMatrix};
pub use record::{ConversationRecord, PolicyTarget, Role};
pub use sampling::NegativeSampler;
pub use synthetic::{SyntheticConfig, SyntheticCorpus};
pub use vocab::{RawVocab, Vocab};
