//! Property-based tests for the batch builder.
//!
//! Invariants checked here hold for any record:
//! - augmentation yields one record per target, in order
//! - negatives never collide with the sequence they were drawn for
//! - configured widths are exact and pad never sits inside content

use std::collections::HashSet;
use std::sync::Arc;

use convrec_core::{
    augment_rec, BatchBuilder, ConversationRecord, Mode, NegativeSampler, SyntheticConfig,
    TruncationConfig, Vocab,
};
use proptest::prelude::*;

fn vocab() -> Arc<Vocab> {
    Arc::new(
        SyntheticConfig::default()
            .with_items(20)
            .generate()
            .unwrap()
            .vocab()
            .unwrap(),
    )
}

/// Content tokens are >= 4 so they never coincide with pad/start/end/unk.
fn arb_utterance() -> impl Strategy<Value = Vec<u32>> {
    prop::collection::vec(4u32..40, 0..12)
}

fn arb_record() -> impl Strategy<Value = ConversationRecord> {
    (
        prop::collection::vec(arb_utterance(), 0..5),
        prop::collection::vec(1u32..24, 0..10),
        prop::collection::vec(1u32..27, 0..10),
        prop::collection::vec(1u32..21, 0..6),
        prop::collection::vec(4u32..40, 0..40),
    )
        .prop_map(|(context_tokens, context_entities, context_words, items, response)| {
            ConversationRecord {
                context_tokens,
                context_entities,
                context_words,
                items,
                response,
                ..Default::default()
            }
        })
}

mod augmentation_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn one_record_per_item(record in arb_record()) {
            let out = augment_rec(std::slice::from_ref(&record), false);
            prop_assert_eq!(out.len(), record.items.len());
            for (expanded, &item) in out.iter().zip(&record.items) {
                prop_assert_eq!(expanded.item, Some(item));
                let mut restored = expanded.clone();
                restored.item = None;
                prop_assert_eq!(&restored, &record);
            }
        }
    }
}

mod sampling_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn negatives_never_in_sequence(
            seq in prop::collection::vec(1u32..50, 0..30),
            seed in any::<u64>(),
        ) {
            let mut sampler = NegativeSampler::new(50, seed);
            let negs = sampler.sample_for(&seq).unwrap();
            let set: HashSet<u32> = seq.iter().copied().collect();
            prop_assert_eq!(negs.len(), seq.len());
            for n in negs {
                prop_assert!(!set.contains(&n));
                prop_assert!((1..=50).contains(&n));
            }
        }
    }
}

mod padding_props {
    use super::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn conv_widths_are_exact(
            records in prop::collection::vec(arb_record(), 1..6),
            ctx in 2usize..20,
            resp in 1usize..10,
            ent in 1usize..8,
            word in 1usize..8,
        ) {
            let t = TruncationConfig::default()
                .with_context(ctx)
                .with_response(resp)
                .with_entity(ent)
                .with_word(word);
            let builder = BatchBuilder::new(vocab(), t).with_context_enhancement(true);
            let batch = builder.conv_batch(&records, Mode::Train);
            prop_assert_eq!(batch.context_tokens.shape(), (records.len(), ctx));
            prop_assert_eq!(batch.enhanced_context_tokens.shape(), (records.len(), ctx));
            prop_assert_eq!(batch.response.shape(), (records.len(), resp));
            prop_assert_eq!(batch.context_entities.shape(), (records.len(), ent));
            prop_assert_eq!(batch.context_words.shape(), (records.len(), word));

            // left padding: once content starts, pad never reappears
            for i in 0..records.len() {
                let row = batch.context_tokens.row(i);
                let first = row.iter().position(|&x| x != 0).unwrap_or(row.len());
                prop_assert!(row[first..].iter().all(|&x| x != 0));
                // right padding: END is the last content token of the response
                let resp_row = batch.response.row(i);
                let content = resp_row.iter().take_while(|&&x| x != 0).count();
                prop_assert!(content >= 1);
                prop_assert_eq!(resp_row[content - 1], 2);
                prop_assert!(resp_row[content..].iter().all(|&x| x == 0));
            }
        }

        #[test]
        fn rec_widths_are_exact(
            records in prop::collection::vec(arb_record(), 1..6),
            ctx in 2usize..20,
            item in 1usize..6,
        ) {
            let t = TruncationConfig::default().with_context(ctx).with_item(item);
            let builder = BatchBuilder::new(vocab(), t);
            let augmented = augment_rec(&records, false);
            prop_assume!(!augmented.is_empty());
            let mut sampler = NegativeSampler::new(20, 0);
            let batch = builder.rec_batch(&augmented, &mut sampler).unwrap();
            prop_assert_eq!(batch.context.shape(), (augmented.len(), ctx));
            prop_assert_eq!(batch.history.input_ids.cols(), item);
            prop_assert_eq!(batch.history.sample_negs.cols(), item);
            prop_assert_eq!(batch.items.len(), augmented.len());
        }
    }
}
