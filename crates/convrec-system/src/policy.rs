//! Topic policy training: train and validate per epoch, test at the end.

use candle_core::DType;
use candle_nn::{VarBuilder, VarMap};
use convrec_core::{BatchBuilder, DataLoader, Dataset, Mode, PolicyBatch};
use convrec_nn::beam::top_k_indices;
use convrec_nn::{KgsfModel, TopicPolicyModel, TransformerPooler};
use tracing::info;

use crate::config::SystemConfig;
use crate::error::{Error, Result};
use crate::evaluator::{Evaluator, StandardEvaluator, POLICY_CUTOFFS};
use crate::optim::StageOptimizer;

/// Trains a [`TopicPolicyModel`] over a transformer context pooler.
pub struct PolicyTrainer<E = StandardEvaluator> {
    config: SystemConfig,
    varmap: VarMap,
    model: TopicPolicyModel<TransformerPooler>,
    train: DataLoader,
    valid: DataLoader,
    test: DataLoader,
    evaluator: E,
}

impl<E: Evaluator> PolicyTrainer<E> {
    pub fn new(config: SystemConfig, data: &Dataset, evaluator: E) -> Result<Self> {
        config.validate()?;
        let n_topic = data
            .vocab
            .n_topic
            .ok_or_else(|| Error::InvalidConfig("topic policy needs a topic vocabulary".into()))?;
        let device = config.device()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let pooler = TransformerPooler::new(
            config.model.transformer_dims(),
            data.vocab.vocab_size,
            data.vocab.pad,
            vb.pp("context"),
        )?;
        let model = TopicPolicyModel::new(pooler, n_topic, vb)?;
        info!(n_topic, "built topic policy model");

        let builder = BatchBuilder::new(data.vocab.clone(), config.truncation);
        let train = DataLoader::new(data.train.clone(), builder.clone(), Mode::Train, config.seed);
        let valid = DataLoader::new(data.valid.clone(), builder.clone(), Mode::Valid, config.seed);
        let test = DataLoader::new(data.test.clone(), builder, Mode::Test, config.seed);
        Ok(Self {
            config,
            varmap,
            model,
            train,
            valid,
            test,
            evaluator,
        })
    }

    pub fn evaluator(&self) -> &E {
        &self.evaluator
    }

    pub fn num_parameters(&self) -> usize {
        self.varmap.all_vars().iter().map(|v| v.elem_count()).sum()
    }

    fn batches(&mut self, mode: Mode) -> Result<Vec<PolicyBatch>> {
        let batch_size = self.config.policy.batch_size;
        let loader = match mode {
            Mode::Train => &mut self.train,
            Mode::Valid => &mut self.valid,
            Mode::Test => &mut self.test,
        };
        Ok(loader.policy_batches(batch_size, false)?)
    }

    fn evaluate(&mut self, mode: Mode) -> Result<String> {
        self.evaluator.reset_metrics();
        let k = POLICY_CUTOFFS[POLICY_CUTOFFS.len() - 1];
        for batch in self.batches(mode)? {
            let out = self.model.forward(&batch, false)?;
            self.evaluator
                .add_optim_metric("policy_loss", KgsfModel::loss_value(&out.loss)? as f64);
            let scores = out.scores.to_dtype(DType::F32)?.to_vec2::<f32>()?;
            for (row, &label) in scores.iter().zip(&batch.target_topics) {
                self.evaluator.policy_evaluate(&top_k_indices(row, k), label as usize);
            }
        }
        Ok(self.evaluator.report(None, mode))
    }

    /// Returns the test report line.
    pub fn fit(&mut self) -> Result<String> {
        let mut optimizer = StageOptimizer::new(self.varmap.all_vars(), &self.config.policy)?;
        for epoch in 0..self.config.policy.epoch {
            self.evaluator.reset_metrics();
            info!("[Policy epoch {epoch}]");
            for batch in self.batches(Mode::Train)? {
                let out = self.model.forward(&batch, true)?;
                optimizer.backward_step(&out.loss)?;
                self.evaluator
                    .add_optim_metric("policy_loss", KgsfModel::loss_value(&out.loss)? as f64);
            }
            self.evaluator.report(Some(epoch), Mode::Train);
            self.evaluate(Mode::Valid)?;
        }
        self.evaluate(Mode::Test)
    }
}
