//! The three-stage training loop around [`KgsfModel`].

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{DType, Tensor};
use convrec_core::{
    BatchBuilder, ConvBatch, ConversationRecord, DataLoader, Dataset, IdMatrix, Mode, PretrainBatch,
    RecBatch, Vocab,
};
use convrec_nn::beam::top_k_indices;
use convrec_nn::KgsfModel;
use tracing::{debug, info, warn};

use crate::config::{OptimConfig, SystemConfig};
use crate::early_stop::EarlyStopping;
use crate::error::Result;
use crate::evaluator::{Evaluator, StandardEvaluator, REC_TOP_K};
use crate::optim::StageOptimizer;
use crate::stage::{Stage, StageBatch, StageMachine};

/// What one phase did.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSummary {
    pub stage: Stage,
    pub epochs: usize,
    pub stopped_early: bool,
    /// Final report line, the test report for phases that test.
    pub report: String,
}

/// Owns the model, the split loaders, the evaluator and the optimizer of
/// the running stage.
pub struct KgsfSystem<E = StandardEvaluator> {
    config: SystemConfig,
    model: KgsfModel,
    vocab: Arc<Vocab>,
    item_ids: Vec<u32>,
    item_index: HashMap<u32, usize>,
    train: DataLoader,
    valid: DataLoader,
    test: DataLoader,
    evaluator: E,
    stages: StageMachine,
    optimizer: Option<(Stage, StageOptimizer)>,
}

impl<E: Evaluator> KgsfSystem<E> {
    pub fn new(config: SystemConfig, data: &Dataset, evaluator: E) -> Result<Self> {
        config.validate()?;
        let device = config.device()?;
        info!(device = %config.device, "building system");
        let model = KgsfModel::new(
            config.model.clone(),
            &data.vocab,
            &data.side_data,
            data.copy_mask.as_deref(),
            data.token_embedding.as_deref(),
            &device,
        )?;
        if data.token_embedding.is_none() {
            debug!("no pretrained token embedding, using random initialization");
        }

        let builder = BatchBuilder::new(data.vocab.clone(), config.truncation)
            .with_context_enhancement(config.enhance_context);
        let loader = |records: &[ConversationRecord], mode: Mode| {
            DataLoader::new(records.to_vec(), builder.clone(), mode, config.seed)
                .with_recommender_only(config.rec_recommender_only)
        };
        let train = loader(&data.train, Mode::Train);
        let valid = loader(&data.valid, Mode::Valid);
        let test = loader(&data.test, Mode::Test);

        let item_ids = data.side_data.item_entity_ids.clone();
        let item_index = item_ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        Ok(Self {
            config,
            model,
            vocab: data.vocab.clone(),
            item_ids,
            item_index,
            train,
            valid,
            test,
            evaluator,
            stages: StageMachine::new(),
            optimizer: None,
        })
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn model(&self) -> &KgsfModel {
        &self.model
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    pub fn stages(&self) -> &StageMachine {
        &self.stages
    }

    fn optim_config(&self, stage: Stage) -> &OptimConfig {
        match stage {
            Stage::Pretrain => &self.config.pretrain,
            Stage::Recommend => &self.config.rec,
            Stage::Converse => &self.config.conv,
        }
    }

    /// Build a fresh optimizer over the currently trainable variables.
    fn init_optim(&mut self, stage: Stage) -> Result<()> {
        let vars = self.model.trainable_vars();
        let optimizer = StageOptimizer::new(vars, self.optim_config(stage))?;
        self.optimizer = Some((stage, optimizer));
        Ok(())
    }

    fn backward(&mut self, stage: Stage, loss: &Tensor) -> Result<()> {
        if !matches!(&self.optimizer, Some((s, _)) if *s == stage) {
            self.init_optim(stage)?;
        }
        if let Some((_, optimizer)) = self.optimizer.as_mut() {
            optimizer.backward_step(loss)?;
        }
        Ok(())
    }

    /// Exclude the shared and recommendation parameters from every later
    /// optimizer. Required before CONVERSE.
    pub fn freeze(&mut self) {
        self.model.freeze();
        self.stages.mark_frozen();
        self.optimizer = None;
    }

    /// Route one batch to its stage.
    ///
    /// Training steps advance the stage machine and update parameters.
    /// Valid and test steps only evaluate.
    pub fn step(&mut self, batch: StageBatch<'_>, mode: Mode) -> Result<()> {
        let stage = batch.stage();
        if mode == Mode::Train {
            self.stages.enter(stage)?;
        } else if stage == Stage::Converse {
            self.stages.check(stage)?;
        }
        match batch {
            StageBatch::Pretrain(b) => self.pretrain_step(b, mode),
            StageBatch::Recommend(b) => self.rec_step(b, mode),
            StageBatch::Converse(b) => self.conv_step(b, mode),
        }
    }

    fn pretrain_step(&mut self, batch: &PretrainBatch, mode: Mode) -> Result<()> {
        let Some(loss) = self.model.pretrain_infomax(batch)? else {
            debug!("skipping pretrain batch without entity labels");
            return Ok(());
        };
        let value = KgsfModel::loss_value(&loss)?;
        if mode == Mode::Train {
            self.backward(Stage::Pretrain, &loss)?;
        }
        self.evaluator.add_optim_metric("info_loss", value as f64);
        Ok(())
    }

    fn rec_step(&mut self, batch: &RecBatch, mode: Mode) -> Result<()> {
        let out = self.model.recommend(batch)?;
        if mode == Mode::Train {
            let loss = out.total_loss()?;
            self.backward(Stage::Recommend, &loss)?;
        } else {
            self.rec_evaluate(&out.scores, &batch.items)?;
        }
        self.evaluator
            .add_optim_metric("rec_loss", KgsfModel::loss_value(&out.rec_loss)? as f64);
        if let Some(info) = &out.info_loss {
            self.evaluator
                .add_optim_metric("info_loss", KgsfModel::loss_value(info)? as f64);
        }
        Ok(())
    }

    fn conv_step(&mut self, batch: &ConvBatch, mode: Mode) -> Result<()> {
        let out = self.model.converse(batch, mode)?;
        if let Some(loss) = &out.loss {
            let value = KgsfModel::loss_value(loss)?;
            if mode == Mode::Train {
                self.backward(Stage::Converse, loss)?;
            }
            self.evaluator.add_optim_metric("gen_loss", value as f64);
        }
        if mode != Mode::Train {
            self.conv_evaluate(&out.generation.tokens, &batch.response);
        }
        Ok(())
    }

    /// Rank the item columns of `scores` and hand the top 50 to the
    /// evaluator, labels given as item positions.
    pub fn rec_evaluate(&mut self, scores: &Tensor, items: &[u32]) -> Result<()> {
        if self.item_ids.is_empty() {
            return Ok(());
        }
        let columns = Tensor::new(self.item_ids.as_slice(), scores.device())?;
        let item_scores = scores
            .index_select(&columns, 1)?
            .to_dtype(DType::F32)?
            .to_vec2::<f32>()?;
        for (row, item) in item_scores.iter().zip(items) {
            let Some(&label) = self.item_index.get(item) else {
                warn!(item, "recommendation target is not an item entity");
                continue;
            };
            let ranks = top_k_indices(row, REC_TOP_K);
            self.evaluator.rec_evaluate(&ranks, label);
        }
        Ok(())
    }

    /// Detokenize predictions and references up to END and score them.
    pub fn conv_evaluate(&mut self, predictions: &[Vec<u32>], response: &IdMatrix) {
        for (i, prediction) in predictions.iter().enumerate().take(response.rows()) {
            let hyp = self.vocab.ind2txt(prediction);
            let reference = self.vocab.ind2txt(response.row(i));
            self.evaluator.gen_evaluate(&hyp, &[reference]);
        }
    }

    /// PRETRAIN: infomax epochs over the training split, no validation.
    pub fn pretrain(&mut self) -> Result<PhaseSummary> {
        self.stages.check(Stage::Pretrain)?;
        self.init_optim(Stage::Pretrain)?;
        let epochs = self.config.pretrain.epoch;
        let batch_size = self.config.pretrain.batch_size;
        let mut report = String::new();
        for epoch in 0..epochs {
            self.evaluator.reset_metrics();
            info!("[Pretrain epoch {epoch}]");
            for batch in self.train.pretrain_batches(batch_size, false) {
                self.step(StageBatch::Pretrain(&batch), Mode::Train)?;
            }
            report = self.evaluator.report(Some(epoch), Mode::Train);
        }
        Ok(PhaseSummary {
            stage: Stage::Pretrain,
            epochs,
            stopped_early: false,
            report,
        })
    }

    fn run_rec_split(&mut self, mode: Mode) -> Result<()> {
        let batch_size = self.config.rec.batch_size;
        let batches = match mode {
            Mode::Train => self.train.rec_batches(batch_size, false)?,
            Mode::Valid => self.valid.rec_batches(batch_size, false)?,
            Mode::Test => self.test.rec_batches(batch_size, false)?,
        };
        for batch in &batches {
            self.step(StageBatch::Recommend(batch), mode)?;
        }
        Ok(())
    }

    fn run_conv_split(&mut self, mode: Mode) -> Result<()> {
        let batch_size = self.config.conv.batch_size;
        let batches = match mode {
            Mode::Train => self.train.conv_batches(batch_size, false),
            Mode::Valid => self.valid.conv_batches(batch_size, false),
            Mode::Test => self.test.conv_batches(batch_size, false),
        };
        for batch in &batches {
            self.step(StageBatch::Converse(batch), mode)?;
        }
        Ok(())
    }

    /// RECOMMEND: train and validate per epoch with early stopping on
    /// `hit@1 + hit@50`, then test once.
    pub fn train_recommender(&mut self) -> Result<PhaseSummary> {
        self.stages.check(Stage::Recommend)?;
        self.init_optim(Stage::Recommend)?;
        let mut early_stop = EarlyStopping::new(self.config.early_stop, self.config.impatience);
        let mut epochs = 0;
        let mut stopped_early = false;
        for epoch in 0..self.config.rec.epoch {
            epochs = epoch + 1;
            self.evaluator.reset_metrics();
            info!("[Recommendation epoch {epoch}]");
            self.run_rec_split(Mode::Train)?;
            self.evaluator.report(Some(epoch), Mode::Train);

            self.evaluator.reset_metrics();
            self.run_rec_split(Mode::Valid)?;
            self.evaluator.report(Some(epoch), Mode::Valid);
            let metric = self.evaluator.metric("hit@1").unwrap_or(0.0)
                + self.evaluator.metric("hit@50").unwrap_or(0.0);
            if early_stop.update(metric) {
                stopped_early = true;
                break;
            }
        }

        self.evaluator.reset_metrics();
        self.run_rec_split(Mode::Test)?;
        let report = self.evaluator.report(None, Mode::Test);
        Ok(PhaseSummary {
            stage: Stage::Recommend,
            epochs,
            stopped_early,
            report,
        })
    }

    /// CONVERSE: freeze, then train and validate per epoch and test once.
    pub fn train_conversation(&mut self) -> Result<PhaseSummary> {
        if !self.stages.is_frozen() {
            self.freeze();
        }
        self.stages.check(Stage::Converse)?;
        self.init_optim(Stage::Converse)?;
        let epochs = self.config.conv.epoch;
        for epoch in 0..epochs {
            self.evaluator.reset_metrics();
            info!("[Conversation epoch {epoch}]");
            self.run_conv_split(Mode::Train)?;
            self.evaluator.report(Some(epoch), Mode::Train);

            self.evaluator.reset_metrics();
            self.run_conv_split(Mode::Valid)?;
            self.evaluator.report(Some(epoch), Mode::Valid);
        }

        self.evaluator.reset_metrics();
        self.run_conv_split(Mode::Test)?;
        let report = self.evaluator.report(None, Mode::Test);
        Ok(PhaseSummary {
            stage: Stage::Converse,
            epochs,
            stopped_early: false,
            report,
        })
    }

    pub fn run_stage(&mut self, stage: Stage) -> Result<PhaseSummary> {
        match stage {
            Stage::Pretrain => self.pretrain(),
            Stage::Recommend => self.train_recommender(),
            Stage::Converse => self.train_conversation(),
        }
    }

    /// All three phases in order.
    pub fn fit(&mut self) -> Result<Vec<PhaseSummary>> {
        Stage::ALL.iter().map(|&stage| self.run_stage(stage)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convrec_core::{SyntheticConfig, TruncationConfig};
    use convrec_nn::KgsfConfig;

    fn system() -> (KgsfSystem, Dataset) {
        let data = SyntheticConfig::default()
            .with_conversations(6)
            .generate()
            .unwrap()
            .into_dataset()
            .unwrap();
        let config = SystemConfig::default()
            .with_model(
                KgsfConfig::default()
                    .with_token_emb_dim(8)
                    .with_kg_emb_dim(8)
                    .with_num_bases(2)
                    .with_layers(1)
                    .with_ffn_size(8)
                    .with_heads(2)
                    .with_response_truncate(4),
            )
            .with_truncation(
                TruncationConfig::default()
                    .with_context(12)
                    .with_response(4)
                    .with_entity(4)
                    .with_word(4),
            )
            .with_epochs(1, 1, 1)
            .with_batch_size(4);
        let sys = KgsfSystem::new(config, &data, StandardEvaluator::new()).unwrap();
        (sys, data)
    }

    #[test]
    fn test_converse_step_before_freeze_is_refused() {
        let (mut sys, _) = system();
        let batch = sys.train.conv_batches(2, false).remove(0);
        let err = sys.step(StageBatch::Converse(&batch), Mode::Train);
        assert!(matches!(err, Err(crate::Error::StageOrder { to: Stage::Converse, .. })));
        let err = sys.step(StageBatch::Converse(&batch), Mode::Valid);
        assert!(err.is_err());
    }

    #[test]
    fn test_recommend_without_pretrain() {
        let (mut sys, _) = system();
        let batch = sys.train.rec_batches(2, false).unwrap().remove(0);
        sys.step(StageBatch::Recommend(&batch), Mode::Train).unwrap();
        assert_eq!(sys.stages().current(), Some(Stage::Recommend));
        assert!(sys.evaluator().metric("rec_loss").is_some());
    }

    #[test]
    fn test_rec_eval_fills_ranking_metrics() {
        let (mut sys, _) = system();
        let batch = sys.valid.rec_batches(4, false).unwrap().remove(0);
        sys.step(StageBatch::Recommend(&batch), Mode::Valid).unwrap();
        let hit50 = sys.evaluator().metric("hit@50").unwrap();
        // every item fits in the top 50 of the toy corpus
        assert_eq!(hit50, 1.0);
        assert!(sys.evaluator().metric("hit@1").unwrap() <= hit50);
    }

    #[test]
    fn test_no_pretrain_after_recommend() {
        let (mut sys, _) = system();
        sys.train_recommender().unwrap();
        assert!(sys.pretrain().is_err());
    }
}
