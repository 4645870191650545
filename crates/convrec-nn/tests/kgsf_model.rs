use candle_core::{DType, Device, Tensor};
use convrec_core::{
    ConvBatch, Dataset, FloatMatrix, IdMatrix, Mode, PretrainBatch, SyntheticConfig,
    TruncationConfig,
};
use convrec_nn::{KgsfConfig, KgsfModel, ParamGroup};

fn dataset() -> Dataset {
    SyntheticConfig::default()
        .generate()
        .unwrap()
        .into_dataset()
        .unwrap()
}

fn truncation() -> TruncationConfig {
    TruncationConfig::default()
        .with_context(10)
        .with_entity(5)
        .with_word(5)
        .with_response(4)
}

fn config() -> KgsfConfig {
    KgsfConfig::default()
        .with_token_emb_dim(16)
        .with_kg_emb_dim(8)
        .with_num_bases(2)
        .with_layers(1)
        .with_ffn_size(16)
        .with_dropout(0.0)
        .with_response_truncate(6)
}

fn model(data: &Dataset) -> KgsfModel {
    KgsfModel::new(
        config(),
        &data.vocab,
        &data.side_data,
        data.copy_mask.as_deref(),
        None,
        &Device::Cpu,
    )
    .unwrap()
}

fn conv_batch(data: &Dataset, mode: Mode) -> ConvBatch {
    data.loader(mode, truncation())
        .conv_batches(2, false)
        .into_iter()
        .next()
        .unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    (a - b)
        .unwrap()
        .abs()
        .unwrap()
        .max_all()
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

#[test]
fn test_two_example_batch_shapes() {
    let data = dataset();
    let mut model = model(&data);

    let rec = data
        .loader(Mode::Train, truncation())
        .rec_batches(2, false)
        .unwrap()
        .into_iter()
        .next()
        .unwrap();
    assert_eq!(rec.context_entities.shape(), (2, 5));
    assert_eq!(rec.context_words.shape(), (2, 5));
    let out = model.recommend(&rec).unwrap();
    assert_eq!(out.scores.dims(), &[2, data.vocab.n_entity]);
    assert!(out.total_loss().unwrap().to_scalar::<f32>().unwrap().is_finite());

    let conv = conv_batch(&data, Mode::Valid);
    assert_eq!(conv.context_tokens.shape(), (2, 10));
    assert_eq!(conv.response.shape(), (2, 4));
    let out = model.converse(&conv, Mode::Valid).unwrap();
    assert_eq!(out.generation.logits.dims(), &[2, 4, data.vocab.vocab_size]);
    assert!(out.loss.is_some());
    assert!(out.generation.tokens.iter().all(|t| t.len() == 4));
}

#[test]
fn test_forced_position_predicts_token_at_same_index() {
    let data = dataset();
    let mut model = model(&data);
    let conv = conv_batch(&data, Mode::Valid);
    let encoding = model
        .encode_conversation(&conv, &conv.context_tokens, false)
        .unwrap();

    let a = Tensor::new(&[[5u32, 6, 7, 2], [8, 9, 2, 0]], &Device::Cpu).unwrap();
    let b = Tensor::new(&[[5u32, 11, 7, 2], [8, 12, 2, 0]], &Device::Cpu).unwrap();
    let la = model.decode_forced(&encoding, &a, false).unwrap();
    let lb = model.decode_forced(&encoding, &b, false).unwrap();
    assert_eq!(la.dims(), &[2, 4, data.vocab.vocab_size]);

    // changing target 1 only changes the inputs of positions 2 and later
    let head_a = la.narrow(1, 0, 2).unwrap();
    let head_b = lb.narrow(1, 0, 2).unwrap();
    assert!(max_abs_diff(&head_a, &head_b) < 1e-5);
    let tail_a = la.narrow(1, 2, 2).unwrap();
    let tail_b = lb.narrow(1, 2, 2).unwrap();
    assert!(max_abs_diff(&tail_a, &tail_b) > 0.0);
}

#[test]
fn test_greedy_stops_at_end_or_cap() {
    let data = dataset();
    let mut model = model(&data);
    let conv = conv_batch(&data, Mode::Test);
    let out = model.converse(&conv, Mode::Test).unwrap();
    let end = data.vocab.end;
    let steps = out.generation.tokens[0].len();
    assert!(steps <= 6);
    assert!(out.generation.tokens.iter().all(|t| t.len() == steps));
    if steps < 6 {
        assert!(out.generation.tokens.iter().all(|t| t.contains(&end)));
    }
    assert_eq!(out.generation.logits.dims(), &[2, steps, data.vocab.vocab_size]);
    assert!(out.loss.is_none());
}

#[test]
fn test_beam_of_one_equals_greedy() {
    let data = dataset();
    let mut model = model(&data);
    let conv = conv_batch(&data, Mode::Test);
    let encoding = model
        .encode_conversation(&conv, &conv.context_tokens, false)
        .unwrap();
    let greedy = model.decode_greedy(&encoding).unwrap();
    let beam = model.decode_beam(&encoding, 1).unwrap();
    assert_eq!(greedy.tokens, beam.tokens);
    assert!(max_abs_diff(&greedy.logits, &beam.logits) < 1e-5);
}

#[test]
fn test_wide_beam_shapes() {
    let data = dataset();
    let mut model = model(&data);
    let conv = conv_batch(&data, Mode::Test);
    let encoding = model
        .encode_conversation(&conv, &conv.context_tokens, false)
        .unwrap();
    let out = model.decode_beam(&encoding, 3).unwrap();
    assert_eq!(out.tokens.len(), 2);
    let steps = out.tokens[0].len();
    assert!(steps >= 1 && steps <= 6);
    assert_eq!(out.logits.dims(), &[2, steps, data.vocab.vocab_size]);
    assert!(model.decode_beam(&encoding, 0).is_err());
    assert!(model.decode_beam(&encoding, data.vocab.vocab_size + 1).is_err());
}

#[test]
fn test_pretrain_skips_batches_without_labels() {
    let data = dataset();
    let mut model = model(&data);
    let n_entity = data.vocab.n_entity;
    let empty = PretrainBatch {
        words: IdMatrix::from_flat(1, 2, vec![0, 3]).unwrap(),
        entity_labels: FloatMatrix {
            rows: 1,
            cols: n_entity,
            data: vec![0.0; n_entity],
        },
    };
    assert!(model.pretrain_infomax(&empty).unwrap().is_none());

    let batch = data
        .loader(Mode::Train, truncation())
        .pretrain_batches(4, false)
        .into_iter()
        .find(|b| b.entity_labels.sum() > 0.0)
        .unwrap();
    let loss = model.pretrain_infomax(&batch).unwrap().unwrap();
    assert!(loss.to_scalar::<f32>().unwrap() >= 0.0);
}

#[test]
fn test_freeze_stops_gradients_into_shared_and_rec_groups() {
    let data = dataset();
    let mut model = model(&data);
    let conv = conv_batch(&data, Mode::Train);

    let loss = model.converse(&conv, Mode::Train).unwrap().loss.unwrap();
    let grads = loss.backward().unwrap();
    let shared = model.params().vars(&[ParamGroup::Shared]);
    assert!(shared.iter().any(|v| grads.get(v.as_tensor()).is_some()));

    model.freeze();
    assert!(model.is_frozen());
    let loss = model.converse(&conv, Mode::Train).unwrap().loss.unwrap();
    let grads = loss.backward().unwrap();
    for group in [ParamGroup::Shared, ParamGroup::Recommendation] {
        for var in model.params().vars(&[group]) {
            assert!(grads.get(var.as_tensor()).is_none());
        }
    }
    let conv_vars = model.params().vars(&[ParamGroup::Conversation]);
    assert!(conv_vars.iter().any(|v| grads.get(v.as_tensor()).is_some()));
    assert_eq!(model.trainable_vars().len(), conv_vars.len());
}

#[test]
fn test_pretrained_embedding_is_loaded() {
    let data = dataset();
    let v = data.vocab.vocab_size;
    let rows: Vec<Vec<f32>> = (0..v).map(|i| vec![i as f32; 16]).collect();
    let model = KgsfModel::new(config(), &data.vocab, &data.side_data, None, Some(&rows), &Device::Cpu)
        .unwrap();
    let weight = model
        .params()
        .varmap(ParamGroup::Conversation)
        .data()
        .lock()
        .unwrap()
        .get("token_embedding.weight")
        .unwrap()
        .as_tensor()
        .to_dtype(DType::F32)
        .unwrap()
        .to_vec2::<f32>()
        .unwrap();
    assert_eq!(weight[3][0], 3.0);

    let bad: Vec<Vec<f32>> = vec![vec![0.0; 16]; v - 1];
    assert!(KgsfModel::new(config(), &data.vocab, &data.side_data, None, Some(&bad), &Device::Cpu).is_err());
}
