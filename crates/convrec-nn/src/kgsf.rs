//! Knowledge-graph semantic fusion model.
//!
//! One model serves three forward modes:
//!
//! - [`KgsfModel::pretrain_infomax`]: word-to-entity mutual information
//!   pretraining of the graph encoders
//! - [`KgsfModel::recommend`]: gated entity/word user representation scored
//!   against every entity
//! - [`KgsfModel::converse`]: copy-augmented response generation with forced,
//!   greedy or beam decoding
//!
//! Parameters live in three [`ParamGroup`]s. After [`KgsfModel::freeze`]
//! only the conversation group is trainable and every graph-derived tensor
//! entering the decoder is detached.

use candle_core::{DType, Device, Tensor, Var, D};
use candle_nn::{linear, Init, Linear, Module, VarBuilder, VarMap};
use convrec_core::{ConvBatch, IdMatrix, Mode, PretrainBatch, RecBatch, SideData, Vocab};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::attention::{GateLayer, SelfAttentionSeq};
use crate::beam::{all_finished, expand, select_top_k, Candidate, Hypothesis};
use crate::embedding::PaddedEmbedding;
use crate::error::{Error, Result};
use crate::graph::{DeviceGraph, GraphEncoder};
use crate::loss::{infomax_loss, masked_cross_entropy};
use crate::tensor::{argmax_first, float_tensor, id_tensor, ids_1d, invert_mask, lookup, scalar};
use crate::transformer::{
    token_column, DecoderMemory, IncrementalState, TransformerDecoderKG, TransformerDims,
    TransformerEncoder,
};

/// Name of the token embedding variable in the conversation group.
pub const TOKEN_EMBEDDING: &str = "token_embedding.weight";

/// Weight of the infomax term in the recommendation loss.
pub const INFO_LOSS_WEIGHT: f64 = 0.025;

/// Test-time decoder of the conversation stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeStrategy {
    #[default]
    Greedy,
    Beam { width: usize },
}

/// Model hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KgsfConfig {
    pub token_emb_dim: usize,
    pub kg_emb_dim: usize,
    pub num_bases: usize,
    pub n_heads: usize,
    pub n_layers: usize,
    pub ffn_size: usize,
    pub dropout: f32,
    pub attention_dropout: f32,
    pub relu_dropout: f32,
    pub embeddings_scale: bool,
    pub learn_positional_embeddings: bool,
    pub n_positions: usize,
    /// Maximum number of decoding steps.
    pub response_truncate: usize,
    pub decode: DecodeStrategy,
}

impl Default for KgsfConfig {
    fn default() -> Self {
        Self {
            token_emb_dim: 300,
            kg_emb_dim: 128,
            num_bases: 8,
            n_heads: 2,
            n_layers: 2,
            ffn_size: 300,
            dropout: 0.1,
            attention_dropout: 0.0,
            relu_dropout: 0.1,
            embeddings_scale: true,
            learn_positional_embeddings: false,
            n_positions: 1024,
            response_truncate: 30,
            decode: DecodeStrategy::Greedy,
        }
    }
}

impl KgsfConfig {
    pub fn with_token_emb_dim(mut self, dim: usize) -> Self {
        self.token_emb_dim = dim;
        self
    }

    pub fn with_kg_emb_dim(mut self, dim: usize) -> Self {
        self.kg_emb_dim = dim;
        self
    }

    pub fn with_num_bases(mut self, n: usize) -> Self {
        self.num_bases = n;
        self
    }

    pub fn with_heads(mut self, n: usize) -> Self {
        self.n_heads = n;
        self
    }

    pub fn with_layers(mut self, n: usize) -> Self {
        self.n_layers = n;
        self
    }

    pub fn with_ffn_size(mut self, n: usize) -> Self {
        self.ffn_size = n;
        self
    }

    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_response_truncate(mut self, n: usize) -> Self {
        self.response_truncate = n;
        self
    }

    pub fn with_decode(mut self, decode: DecodeStrategy) -> Self {
        self.decode = decode;
        self
    }

    pub fn transformer_dims(&self) -> TransformerDims {
        TransformerDims {
            n_heads: self.n_heads,
            n_layers: self.n_layers,
            dim: self.token_emb_dim,
            ffn_size: self.ffn_size,
            dropout: self.dropout,
            attention_dropout: self.attention_dropout,
            relu_dropout: self.relu_dropout,
            embeddings_scale: self.embeddings_scale,
            learn_positional_embeddings: self.learn_positional_embeddings,
            n_positions: self.n_positions,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.transformer_dims().validate()?;
        if self.kg_emb_dim == 0 || self.token_emb_dim == 0 {
            return Err(Error::InvalidConfig("embedding sizes must be positive".into()));
        }
        if self.response_truncate == 0 || self.response_truncate > self.n_positions {
            return Err(Error::InvalidConfig(format!(
                "response_truncate must lie in 1..={}, got {}",
                self.n_positions, self.response_truncate
            )));
        }
        if let DecodeStrategy::Beam { width: 0 } = self.decode {
            return Err(Error::InvalidConfig("beam width must be positive".into()));
        }
        Ok(())
    }
}

/// Parameter partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamGroup {
    /// Embeddings, graph encoders, pooling, gate, infomax head.
    Shared,
    /// Recommendation bias.
    Recommendation,
    /// Conversation encoder, decoder, copy heads.
    Conversation,
}

impl ParamGroup {
    pub const ALL: [ParamGroup; 3] = [Self::Shared, Self::Recommendation, Self::Conversation];
}

/// One [`VarMap`] per [`ParamGroup`].
#[derive(Clone)]
pub struct ParameterGroups {
    shared: VarMap,
    recommendation: VarMap,
    conversation: VarMap,
}

impl Default for ParameterGroups {
    fn default() -> Self {
        Self::new()
    }
}

impl ParameterGroups {
    pub fn new() -> Self {
        Self {
            shared: VarMap::new(),
            recommendation: VarMap::new(),
            conversation: VarMap::new(),
        }
    }

    pub fn varmap(&self, group: ParamGroup) -> &VarMap {
        match group {
            ParamGroup::Shared => &self.shared,
            ParamGroup::Recommendation => &self.recommendation,
            ParamGroup::Conversation => &self.conversation,
        }
    }

    fn varmap_mut(&mut self, group: ParamGroup) -> &mut VarMap {
        match group {
            ParamGroup::Shared => &mut self.shared,
            ParamGroup::Recommendation => &mut self.recommendation,
            ParamGroup::Conversation => &mut self.conversation,
        }
    }

    pub fn builder(&self, group: ParamGroup, device: &Device) -> VarBuilder<'static> {
        VarBuilder::from_varmap(self.varmap(group), DType::F32, device)
    }

    /// Every variable of the given groups.
    pub fn vars(&self, groups: &[ParamGroup]) -> Vec<Var> {
        groups
            .iter()
            .flat_map(|&g| self.varmap(g).all_vars())
            .collect()
    }

    /// Overwrite one variable in place.
    pub fn set(&mut self, group: ParamGroup, name: &str, value: &Tensor) -> Result<()> {
        self.varmap_mut(group).set_one(name, value)?;
        Ok(())
    }

    pub fn num_parameters(&self, group: ParamGroup) -> usize {
        self.varmap(group)
            .all_vars()
            .iter()
            .map(|v| v.elem_count())
            .sum()
    }
}

/// Token and node ids the model needs from the vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialIds {
    pub pad: u32,
    pub start: u32,
    pub end: u32,
    pub pad_entity: u32,
    pub pad_word: u32,
    pub vocab_size: usize,
    pub n_entity: usize,
    pub n_word: usize,
}

impl From<&Vocab> for SpecialIds {
    fn from(v: &Vocab) -> Self {
        Self {
            pad: v.pad,
            start: v.start,
            end: v.end,
            pad_entity: v.pad_entity,
            pad_word: v.pad_word,
            vocab_size: v.vocab_size,
            n_entity: v.n_entity,
            n_word: v.n_word,
        }
    }
}

/// Recommendation forward output.
#[derive(Debug, Clone)]
pub struct RecOutput {
    pub rec_loss: Tensor,
    /// `None` when no context entity was mentioned.
    pub info_loss: Option<Tensor>,
    /// `(bs, n_entity)`
    pub scores: Tensor,
}

impl RecOutput {
    /// `rec_loss + 0.025 * info_loss`, the infomax term only when present.
    pub fn total_loss(&self) -> Result<Tensor> {
        match &self.info_loss {
            Some(info) => Ok((&self.rec_loss + info.affine(INFO_LOSS_WEIGHT, 0.0)?)?),
            None => Ok(self.rec_loss.clone()),
        }
    }
}

/// Generated sequences with their per-step logits.
#[derive(Debug, Clone)]
pub struct Generation {
    /// `(bs, steps, vocab_size)`
    pub logits: Tensor,
    /// Generated tokens per example, START excluded.
    pub tokens: Vec<Vec<u32>>,
}

/// Conversation forward output.
#[derive(Debug, Clone)]
pub struct ConvOutput {
    /// Generation loss in train and valid mode.
    pub loss: Option<Tensor>,
    pub generation: Generation,
}

/// Encoded conversation context, reused across decoding steps.
#[derive(Debug, Clone)]
pub struct ConversationEncoding {
    pub memory: DecoderMemory,
    /// `(bs, token_emb_dim)`
    pub entity_latent: Tensor,
    /// `(bs, token_emb_dim)`
    pub word_latent: Tensor,
}

struct Knowledge {
    entity_graph: Tensor,
    entity_reps: Tensor,
    entity_pad: Tensor,
    word_reps: Tensor,
    word_pad: Tensor,
    entity_pool: Tensor,
    word_pool: Tensor,
}

/// The fused recommendation and conversation model.
pub struct KgsfModel {
    config: KgsfConfig,
    ids: SpecialIds,
    device: Device,
    graph: DeviceGraph,
    params: ParameterGroups,
    frozen: bool,

    graph_encoder: GraphEncoder,
    entity_self_attn: SelfAttentionSeq,
    word_self_attn: SelfAttentionSeq,
    gate: GateLayer,
    infomax_norm: Linear,
    infomax_bias: Tensor,

    rec_bias: Tensor,

    token_embedding: PaddedEmbedding,
    conv_encoder: TransformerEncoder,
    conv_entity_norm: Linear,
    conv_entity_attn_norm: Linear,
    conv_word_norm: Linear,
    conv_word_attn_norm: Linear,
    copy_norm: Linear,
    copy_output: Linear,
    decoder: TransformerDecoderKG,
}

fn bias_init(fan_in: usize) -> Init {
    let bound = 1.0 / (fan_in as f64).sqrt();
    Init::Uniform {
        lo: -bound,
        up: bound,
    }
}

impl KgsfModel {
    /// Build every layer.
    ///
    /// `copy_mask` has one entry per vocabulary id; without it copy logits
    /// are zero. `pretrained` replaces the random token embedding when given.
    pub fn new(
        config: KgsfConfig,
        vocab: &Vocab,
        side_data: &SideData,
        copy_mask: Option<&[bool]>,
        pretrained: Option<&[Vec<f32>]>,
        device: &Device,
    ) -> Result<Self> {
        config.validate()?;
        let ids = SpecialIds::from(vocab);
        if side_data.entity_kg.n_entity != ids.n_entity {
            return Err(Error::DimensionMismatch {
                expected: ids.n_entity,
                got: side_data.entity_kg.n_entity,
            });
        }
        if side_data.word_kg.n_word != ids.n_word {
            return Err(Error::DimensionMismatch {
                expected: ids.n_word,
                got: side_data.word_kg.n_word,
            });
        }

        let mut params = ParameterGroups::new();
        let graph = DeviceGraph::new(side_data, copy_mask, ids.vocab_size, device)?;
        let kg = config.kg_emb_dim;
        let dim = config.token_emb_dim;

        let shared = params.builder(ParamGroup::Shared, device);
        let graph_encoder = GraphEncoder::new(
            ids.n_entity,
            side_data.entity_kg.n_relation,
            ids.n_word,
            ids.pad_word,
            kg,
            config.num_bases,
            shared.clone(),
        )?;
        let entity_self_attn = SelfAttentionSeq::new(kg, kg, shared.pp("entity_self_attn"))?;
        let word_self_attn = SelfAttentionSeq::new(kg, kg, shared.pp("word_self_attn"))?;
        let gate = GateLayer::new(kg, shared.pp("gate_layer"))?;
        debug!("[built kg layer]");

        let infomax_norm = linear(kg, kg, shared.pp("infomax_norm"))?;
        let infomax_bias = shared.get_with_hints(ids.n_entity, "infomax_bias", bias_init(kg))?;
        debug!("[built infomax layer]");

        let rec = params.builder(ParamGroup::Recommendation, device);
        let rec_bias = rec.get_with_hints(ids.n_entity, "rec_bias", bias_init(kg))?;
        debug!("[built rec layer]");

        let conv = params.builder(ParamGroup::Conversation, device);
        let token_embedding = PaddedEmbedding::new(
            ids.vocab_size,
            dim,
            ids.pad,
            (kg as f64).powf(-0.5),
            conv.pp("token_embedding"),
        )?;
        let dims = config.transformer_dims();
        let conv_encoder = TransformerEncoder::new(dims, ids.vocab_size, ids.pad, conv.pp("conv_encoder"))?;
        let conv_entity_norm = linear(kg, dim, conv.pp("conv_entity_norm"))?;
        let conv_entity_attn_norm = linear(kg, dim, conv.pp("conv_entity_attn_norm"))?;
        let conv_word_norm = linear(kg, dim, conv.pp("conv_word_norm"))?;
        let conv_word_attn_norm = linear(kg, dim, conv.pp("conv_word_attn_norm"))?;
        let copy_norm = linear(dim * 3, dim, conv.pp("copy_norm"))?;
        let copy_output = linear(dim, ids.vocab_size, conv.pp("copy_output"))?;
        let decoder = TransformerDecoderKG::new(dims, token_embedding.clone(), conv.pp("conv_decoder"))?;
        debug!("[built conv layer]");

        match pretrained {
            Some(rows) => {
                let table = pretrained_table(rows, ids.vocab_size, dim, device)?;
                params.set(ParamGroup::Conversation, TOKEN_EMBEDDING, &table)?;
                info!("loaded pretrained token embedding");
            }
            None => debug!("token embedding randomly initialized"),
        }

        info!(
            shared = params.num_parameters(ParamGroup::Shared),
            recommendation = params.num_parameters(ParamGroup::Recommendation),
            conversation = params.num_parameters(ParamGroup::Conversation),
            "built KGSF model"
        );

        Ok(Self {
            config,
            ids,
            device: device.clone(),
            graph,
            params,
            frozen: false,
            graph_encoder,
            entity_self_attn,
            word_self_attn,
            gate,
            infomax_norm,
            infomax_bias,
            rec_bias,
            token_embedding,
            conv_encoder,
            conv_entity_norm,
            conv_entity_attn_norm,
            conv_word_norm,
            conv_word_attn_norm,
            copy_norm,
            copy_output,
            decoder,
        })
    }

    pub fn config(&self) -> &KgsfConfig {
        &self.config
    }

    pub fn ids(&self) -> SpecialIds {
        self.ids
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn params(&self) -> &ParameterGroups {
        &self.params
    }

    /// Move the model's active device. Graph buffers follow on the next
    /// forward call. Parameters stay where they were created.
    pub fn set_device(&mut self, device: &Device) {
        self.device = device.clone();
    }

    /// Exclude the shared and recommendation groups from training.
    pub fn freeze(&mut self) {
        if !self.frozen {
            info!("froze shared and recommendation parameters");
        }
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Variables the next optimizer should own.
    pub fn trainable_vars(&self) -> Vec<Var> {
        if self.frozen {
            self.params.vars(&[ParamGroup::Conversation])
        } else {
            self.params.vars(&ParamGroup::ALL)
        }
    }

    fn ensure_device(&mut self) -> Result<()> {
        let device = self.device.clone();
        self.graph.ensure_on(&device)?;
        Ok(())
    }

    fn maybe_detach(&self, t: Tensor) -> Tensor {
        if self.frozen {
            t.detach()
        } else {
            t
        }
    }

    fn knowledge(&self, entities: &IdMatrix, words: &IdMatrix) -> Result<Knowledge> {
        let reps = self.graph_encoder.forward(&self.graph)?;
        let reps = if self.frozen { reps.detach() } else { reps };

        let entities = id_tensor(entities, &self.device)?;
        let words = id_tensor(words, &self.device)?;
        let entity_pad = entities.eq(self.ids.pad_entity)?;
        let word_pad = words.eq(self.ids.pad_word)?;
        let entity_reps = lookup(&reps.entity, &entities)?;
        let word_reps = lookup(&reps.word, &words)?;

        let entity_pool = self.entity_self_attn.forward(&entity_reps, &entity_pad)?;
        let word_pool = self.word_self_attn.forward(&word_reps, &word_pad)?;
        Ok(Knowledge {
            entity_graph: reps.entity,
            entity_reps,
            entity_pad,
            word_reps,
            word_pad,
            entity_pool: self.maybe_detach(entity_pool),
            word_pool: self.maybe_detach(word_pool),
        })
    }

    fn info_predict(&self, word_pool: &Tensor, entity_graph: &Tensor) -> Result<Tensor> {
        let rep = self.infomax_norm.forward(word_pool)?;
        Ok(rep
            .matmul(&entity_graph.t()?)?
            .broadcast_add(&self.infomax_bias)?)
    }

    /// Infomax pretraining loss, `None` when the batch has no entity label.
    pub fn pretrain_infomax(&mut self, batch: &PretrainBatch) -> Result<Option<Tensor>> {
        if batch.entity_labels.sum() == 0.0 {
            return Ok(None);
        }
        self.ensure_device()?;
        let reps = self.graph_encoder.forward(&self.graph)?;
        let words = id_tensor(&batch.words, &self.device)?;
        let word_pad = words.eq(self.ids.pad_word)?;
        let word_pool = self
            .word_self_attn
            .forward(&lookup(&reps.word, &words)?, &word_pad)?;
        let predicted = self.info_predict(&word_pool, &reps.entity)?;
        let labels = float_tensor(&batch.entity_labels, &self.device)?;
        infomax_loss(&predicted, &labels)
    }

    /// Scores for every entity plus the recommendation losses.
    pub fn recommend(&mut self, batch: &RecBatch) -> Result<RecOutput> {
        self.ensure_device()?;
        let k = self.knowledge(&batch.context_entities, &batch.context_words)?;
        let user = self.gate.forward(&k.entity_pool, &k.word_pool)?;
        let scores = user
            .matmul(&k.entity_graph.t()?)?
            .broadcast_add(&self.rec_bias)?;
        let targets = ids_1d(&batch.items, &self.device)?;
        let rec_loss = candle_nn::loss::cross_entropy(&scores, &targets)?;

        let info_loss = if batch.entity_labels.sum() == 0.0 {
            None
        } else {
            let predicted = self.info_predict(&k.word_pool, &k.entity_graph)?;
            let labels = float_tensor(&batch.entity_labels, &self.device)?;
            infomax_loss(&predicted, &labels)?
        };
        Ok(RecOutput {
            rec_loss,
            info_loss,
            scores,
        })
    }

    /// Encode context tokens together with the context's graph knowledge.
    pub fn encode_conversation(
        &mut self,
        batch: &ConvBatch,
        context: &IdMatrix,
        train: bool,
    ) -> Result<ConversationEncoding> {
        self.ensure_device()?;
        let k = self.knowledge(&batch.context_entities, &batch.context_words)?;
        let tokens = id_tensor(context, &self.device)?;
        let (token_encoding, token_mask) = self.conv_encoder.forward(&tokens, train)?;
        let memory = DecoderMemory {
            token_encoding,
            token_mask,
            entity_reps: self.conv_entity_norm.forward(&k.entity_reps)?,
            entity_mask: invert_mask(&k.entity_pad)?,
            word_reps: self.conv_word_norm.forward(&k.word_reps)?,
            word_mask: invert_mask(&k.word_pad)?,
        };
        Ok(ConversationEncoding {
            memory,
            entity_latent: self.conv_entity_attn_norm.forward(&k.entity_pool)?,
            word_latent: self.conv_word_attn_norm.forward(&k.word_pool)?,
        })
    }

    /// Copy logits plus generative logits for decoder states
    /// `(rows, len, dim)`.
    fn fused_logits(&self, dialog: &Tensor, entity_latent: &Tensor, word_latent: &Tensor) -> Result<Tensor> {
        let (rows, len, dim) = dialog.dims3()?;
        let expand_latent =
            |t: &Tensor| -> Result<Tensor> { Ok(t.unsqueeze(1)?.broadcast_as((rows, len, dim))?.contiguous()?) };
        let joined = Tensor::cat(&[expand_latent(entity_latent)?, expand_latent(word_latent)?, dialog.clone()], D::Minus1)?;
        let copy = self
            .copy_output
            .forward(&self.copy_norm.forward(&joined)?)?
            .broadcast_mul(&self.graph.copy_mask)?;
        let gen = dialog.broadcast_matmul(&self.token_embedding.weight()?.t()?)?;
        Ok((copy + gen)?)
    }

    /// Teacher-forced decoding. `response` is `(bs, L)`; the decoder sees
    /// START followed by the first `L - 1` targets and returns
    /// `(bs, L, vocab_size)` logits.
    pub fn decode_forced(
        &self,
        encoding: &ConversationEncoding,
        response: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let (bs, len) = response.dims2()?;
        let start = token_column(self.ids.start, bs, &self.device)?;
        let inputs = if len > 1 {
            Tensor::cat(&[&start, &response.narrow(1, 0, len - 1)?], 1)?
        } else {
            start
        };
        let dialog = self.decoder.forward(&inputs, &encoding.memory, train)?;
        self.fused_logits(&dialog, &encoding.entity_latent, &encoding.word_latent)
    }

    fn step_rows(
        &self,
        last: &Tensor,
        memory: &DecoderMemory,
        entity_latent: &Tensor,
        word_latent: &Tensor,
        state: &mut IncrementalState,
    ) -> Result<(Tensor, Vec<Vec<f32>>)> {
        let dialog = self.decoder.forward_step(last, memory, state)?;
        let logits = self.fused_logits(&dialog, entity_latent, word_latent)?;
        let rows = logits.squeeze(1)?.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        Ok((logits, rows))
    }

    /// Greedy decoding for at most `response_truncate` steps, stopping
    /// early once every example has emitted END.
    pub fn decode_greedy(&self, encoding: &ConversationEncoding) -> Result<Generation> {
        let bs = encoding.memory.batch_size()?;
        let mut state = IncrementalState::new();
        let mut last = token_column(self.ids.start, bs, &self.device)?;
        let mut tokens = vec![Vec::new(); bs];
        let mut logits = Vec::new();

        for _ in 0..self.config.response_truncate {
            let (step, rows) = self.step_rows(
                &last,
                &encoding.memory,
                &encoding.entity_latent,
                &encoding.word_latent,
                &mut state,
            )?;
            let preds: Vec<u32> = rows.iter().map(|r| argmax_first(r)).collect();
            for (seq, &p) in tokens.iter_mut().zip(&preds) {
                seq.push(p);
            }
            logits.push(step);
            last = Tensor::from_vec(preds, (bs, 1), &self.device)?;
            if tokens.iter().all(|seq| seq.contains(&self.ids.end)) {
                break;
            }
        }
        Ok(Generation {
            logits: Tensor::cat(&logits, 1)?,
            tokens,
        })
    }

    /// Beam search with `width` hypotheses per example.
    ///
    /// The encoded inputs are tiled `width` times after the first step and
    /// the incremental cache follows each surviving hypothesis' parent.
    pub fn decode_beam(&self, encoding: &ConversationEncoding, width: usize) -> Result<Generation> {
        if width == 0 || width > self.ids.vocab_size {
            return Err(Error::InvalidConfig(format!(
                "beam width must lie in 1..={}, got {width}",
                self.ids.vocab_size
            )));
        }
        let bs = encoding.memory.batch_size()?;
        let mut memory = encoding.memory.clone();
        let mut entity_latent = encoding.entity_latent.clone();
        let mut word_latent = encoding.word_latent.clone();
        let mut state = IncrementalState::new();
        let mut last = token_column(self.ids.start, bs, &self.device)?;
        let mut beams: Vec<Vec<Hypothesis<Vec<f32>>>> = vec![vec![Hypothesis::root()]; bs];

        for step in 0..self.config.response_truncate {
            if step == 1 {
                memory = memory.repeat(width)?;
                entity_latent = entity_latent.repeat((width, 1))?;
                word_latent = word_latent.repeat((width, 1))?;
            }
            let (_, rows) = self.step_rows(&last, &memory, &entity_latent, &word_latent, &mut state)?;

            let candidates: Vec<Vec<Candidate<Vec<f32>>>> = beams
                .iter()
                .enumerate()
                .map(|(j, hyps)| {
                    let own: Vec<&[f32]> = (0..hyps.len()).map(|n| rows[n * bs + j].as_slice()).collect();
                    expand(&own, width)
                })
                .collect();
            let selected = select_top_k(&beams, &candidates, width);

            let mut parents = vec![0u32; width * bs];
            let mut next = vec![self.ids.pad; width * bs];
            for (j, sel) in selected.iter().enumerate() {
                for (n, s) in sel.iter().enumerate() {
                    parents[n * bs + j] = (s.parent * bs + j) as u32;
                    next[n * bs + j] = s.hypothesis.last_token().unwrap_or(self.ids.pad);
                }
            }
            state.reorder(&ids_1d(&parents, &self.device)?)?;
            last = Tensor::from_vec(next, (width * bs, 1), &self.device)?;
            beams = selected
                .into_iter()
                .map(|sel| sel.into_iter().map(|s| s.hypothesis).collect())
                .collect();

            if all_finished(&beams, self.ids.end) {
                break;
            }
        }

        let mut tokens = Vec::with_capacity(bs);
        let mut flat = Vec::new();
        let mut steps = 0;
        for hyps in beams {
            let best = hyps.into_iter().next().unwrap_or_else(Hypothesis::root);
            steps = best.tokens.len();
            for row in &best.logits {
                flat.extend_from_slice(row);
            }
            tokens.push(best.tokens);
        }
        let logits = Tensor::from_vec(flat, (bs, steps, self.ids.vocab_size), &self.device)?;
        Ok(Generation { logits, tokens })
    }

    /// Conversation forward.
    ///
    /// Train and valid run teacher forcing on the (possibly enhanced)
    /// context and return the generation loss. Test decodes with the
    /// configured strategy from the plain context.
    pub fn converse(&mut self, batch: &ConvBatch, mode: Mode) -> Result<ConvOutput> {
        match mode {
            Mode::Train | Mode::Valid => {
                let train = mode == Mode::Train;
                let encoding = self.encode_conversation(batch, &batch.enhanced_context_tokens, train)?;
                let response = id_tensor(&batch.response, &self.device)?;
                let logits = self.decode_forced(&encoding, &response, train)?;
                let loss = masked_cross_entropy(&logits, &response, self.ids.pad)?;
                let tokens = logits
                    .to_dtype(DType::F32)?
                    .to_vec3::<f32>()?
                    .iter()
                    .map(|seq| seq.iter().map(|row| argmax_first(row)).collect())
                    .collect();
                Ok(ConvOutput {
                    loss,
                    generation: Generation { logits, tokens },
                })
            }
            Mode::Test => {
                let encoding = self.encode_conversation(batch, &batch.context_tokens, false)?;
                let generation = match self.config.decode {
                    DecodeStrategy::Greedy => self.decode_greedy(&encoding)?,
                    DecodeStrategy::Beam { width } => self.decode_beam(&encoding, width)?,
                };
                Ok(ConvOutput {
                    loss: None,
                    generation,
                })
            }
        }
    }

    /// Mean of a loss tensor as `f32`, for logging.
    pub fn loss_value(loss: &Tensor) -> Result<f32> {
        scalar(loss)
    }
}

fn pretrained_table(rows: &[Vec<f32>], vocab_size: usize, dim: usize, device: &Device) -> Result<Tensor> {
    if rows.len() != vocab_size {
        return Err(Error::DimensionMismatch {
            expected: vocab_size,
            got: rows.len(),
        });
    }
    if let Some(bad) = rows.iter().find(|r| r.len() != dim) {
        return Err(Error::DimensionMismatch {
            expected: dim,
            got: bad.len(),
        });
    }
    let flat: Vec<f32> = rows.iter().flatten().copied().collect();
    Ok(Tensor::from_vec(flat, (vocab_size, dim), device)?)
}
