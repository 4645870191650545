//! Neural side of the conversational recommender, on candle.
//!
//! `convrec-nn` turns the batches of `convrec-core` into recommendation
//! scores and generated responses. It is driven by the stage orchestrator
//! in `convrec-system`.
//!
//! # Modules
//!
//! - [`graph`]: RGCN entity encoder and GCN word encoder
//! - [`attention`]: self-attention pooling and the fusion gate
//! - [`transformer`]: context encoder and the KG-aware decoder
//! - [`kgsf`]: the fused model with forced, greedy and beam decoding
//! - [`beam`]: pure beam bookkeeping
//! - [`policy`]: topic policy model
//!
//! # Example: recommendation scores
//!
//! ```rust,ignore
//! use candle_core::Device;
//! use convrec_core::{Mode, SyntheticConfig, TruncationConfig};
//! use convrec_nn::{KgsfConfig, KgsfModel};
//!
//! let data = SyntheticConfig::default().generate()?.into_dataset()?;
//! let config = KgsfConfig::default().with_token_emb_dim(16).with_kg_emb_dim(8);
//! let mut model = KgsfModel::new(config, &data.vocab, &data.side_data, None, None, &Device::Cpu)?;
//!
//! let mut loader = data.loader(Mode::Valid, TruncationConfig::default());
//! let batch = &loader.rec_batches(4, false)?[0];
//! let out = model.recommend(batch)?;  // scores: (4, n_entity)
//! ```

pub mod attention;
pub mod beam;
pub mod embedding;
pub mod error;
pub mod graph;
pub mod kgsf;
pub mod loss;
pub mod policy;
pub mod tensor;
pub mod transformer;

pub use attention::{GateLayer, SelfAttentionSeq};
pub use beam::{select_top_k, Candidate, Hypothesis, Selected};
pub use embedding::{PaddedEmbedding, PositionEmbedding};
pub use error::{Error, Result};
pub use graph::{DeviceGraph, GCNConv, GraphEncoder, GraphRepresentations, RGCNConv};
pub use kgsf::{
    ConvOutput, ConversationEncoding, DecodeStrategy, Generation, KgsfConfig, KgsfModel,
    ParamGroup, ParameterGroups, RecOutput, SpecialIds,
};
pub use policy::{ContextEncoder, PolicyOutput, TopicPolicyModel, TransformerPooler};
pub use transformer::{
    DecoderMemory, IncrementalState, MultiHeadAttention, TransformerDecoderKG, TransformerDims,
    TransformerEncoder,
};
