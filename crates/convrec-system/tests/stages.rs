use convrec_core::{Dataset, Mode, SyntheticConfig, TruncationConfig};
use convrec_nn::{KgsfConfig, ParamGroup};
use convrec_system::{
    Evaluator, KgsfSystem, Stage, StageBatch, StandardEvaluator, SystemConfig,
};

fn dataset() -> Dataset {
    SyntheticConfig::default()
        .with_conversations(10)
        .generate()
        .unwrap()
        .into_dataset()
        .unwrap()
}

fn truncation() -> TruncationConfig {
    TruncationConfig::default()
        .with_context(12)
        .with_response(4)
        .with_entity(4)
        .with_word(4)
}

fn config() -> SystemConfig {
    SystemConfig::default()
        .with_model(
            KgsfConfig::default()
                .with_token_emb_dim(8)
                .with_kg_emb_dim(8)
                .with_num_bases(2)
                .with_heads(2)
                .with_layers(1)
                .with_ffn_size(8)
                .with_response_truncate(4),
        )
        .with_truncation(truncation())
        .with_epochs(1, 2, 1)
        .with_batch_size(4)
}

fn snapshot(system: &KgsfSystem, groups: &[ParamGroup]) -> Vec<Vec<f32>> {
    system
        .model()
        .params()
        .vars(groups)
        .iter()
        .map(|v| v.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap())
        .collect()
}

#[test]
fn test_full_fit_runs_every_stage_in_order() {
    let data = dataset();
    let mut system = KgsfSystem::new(config(), &data, StandardEvaluator::new()).unwrap();
    let phases = system.fit().unwrap();
    let stages: Vec<Stage> = phases.iter().map(|p| p.stage).collect();
    assert_eq!(stages, Stage::ALL.to_vec());
    assert!(phases[1].report.starts_with("[test]"));
    assert!(phases[1].report.contains("hit@50="));
    assert!(phases[2].report.contains("bleu@1="));
    assert_eq!(system.stages().current(), Some(Stage::Converse));
    assert!(system.model().is_frozen());
}

#[test]
fn test_conversation_training_leaves_frozen_groups_untouched() {
    let data = dataset();
    let mut system = KgsfSystem::new(config(), &data, StandardEvaluator::new()).unwrap();
    let batches = data.loader(Mode::Train, truncation()).conv_batches(4, false);

    system.freeze();
    let frozen = [ParamGroup::Shared, ParamGroup::Recommendation];
    let before = snapshot(&system, &frozen);
    let conv_before = snapshot(&system, &[ParamGroup::Conversation]);
    for batch in &batches {
        system.step(StageBatch::Converse(batch), Mode::Train).unwrap();
    }
    assert_eq!(snapshot(&system, &frozen), before);
    assert_ne!(snapshot(&system, &[ParamGroup::Conversation]), conv_before);
}

#[test]
fn test_recommend_training_updates_shared_parameters() {
    let data = dataset();
    let mut system = KgsfSystem::new(config(), &data, StandardEvaluator::new()).unwrap();
    let batches = data.loader(Mode::Train, truncation()).rec_batches(4, false).unwrap();
    let before = snapshot(&system, &[ParamGroup::Shared]);
    for batch in &batches {
        system.step(StageBatch::Recommend(batch), Mode::Train).unwrap();
    }
    assert_ne!(snapshot(&system, &[ParamGroup::Shared]), before);
}

#[test]
fn test_frozen_system_refuses_recommend_training() {
    let data = dataset();
    let mut system = KgsfSystem::new(config(), &data, StandardEvaluator::new()).unwrap();
    system.freeze();
    assert!(system.train_recommender().is_err());
    assert!(system.pretrain().is_err());
}

#[test]
fn test_evaluation_steps_do_not_change_parameters() {
    let data = dataset();
    let mut system = KgsfSystem::new(config(), &data, StandardEvaluator::new()).unwrap();
    let batches = data.loader(Mode::Valid, truncation()).rec_batches(4, false).unwrap();
    let before = snapshot(&system, &ParamGroup::ALL);
    for batch in &batches {
        system.step(StageBatch::Recommend(batch), Mode::Valid).unwrap();
    }
    assert_eq!(snapshot(&system, &ParamGroup::ALL), before);
    assert!(system.evaluator().metric("hit@1").is_some());
}

#[test]
fn test_recommend_phase_stops_when_validation_stalls() {
    let data = dataset();
    let config = config().with_epochs(1, 20, 1).with_early_stop(true, 1);
    let mut system = KgsfSystem::new(config, &data, StandardEvaluator::new()).unwrap();
    let summary = system.train_recommender().unwrap();
    // hit@1 + hit@50 over a handful of validation examples can only rise a few times.
    assert!(summary.stopped_early);
    assert!(summary.epochs >= 2 && summary.epochs < 20);
    assert!(summary.report.starts_with("[test]"));
}
