//! Record augmentation.
//!
//! Both expansions clone the source record and fill exactly one target slot,
//! preserving input order.

use crate::record::{ConversationRecord, Role};

/// One record per mentioned item, with `item` set to that item.
///
/// With `recommender_only`, seeker turns are dropped before expansion.
pub fn augment_rec(records: &[ConversationRecord], recommender_only: bool) -> Vec<ConversationRecord> {
    records
        .iter()
        .filter(|r| !recommender_only || r.role == Some(Role::Recommender))
        .flat_map(|r| {
            r.items.iter().map(move |&item| ConversationRecord {
                item: Some(item),
                ..r.clone()
            })
        })
        .collect()
}

/// One record per topic of every list-valued policy target.
pub fn augment_policy(records: &[ConversationRecord]) -> Vec<ConversationRecord> {
    records
        .iter()
        .flat_map(|r| {
            r.target_topics().map(move |topic| ConversationRecord {
                target_topic: Some(topic),
                ..r.clone()
            })
        })
        .collect()
}
