//! Per-turn conversation records.
//!
//! Records are immutable inputs produced by data preparation. Augmentation
//! (see [`crate::augment`]) clones a record and fills exactly one of the
//! target slots ([`ConversationRecord::item`] or
//! [`ConversationRecord::target_topic`]).

use serde::{Deserialize, Serialize};

/// Speaker role of the turn a record predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Seeker,
    Recommender,
}

/// A dialogue-policy annotation: an action name and the topics it targets.
///
/// Serialized as a two-element array `[action, topics]`. A second element
/// that is not a list of ids is kept as an empty topic list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(String, serde_json::Value)", into = "(String, serde_json::Value)")]
pub struct PolicyTarget {
    pub action: String,
    pub topics: Vec<u32>,
}

impl PolicyTarget {
    pub fn new(action: impl Into<String>, topics: Vec<u32>) -> Self {
        Self {
            action: action.into(),
            topics,
        }
    }
}

impl From<(String, serde_json::Value)> for PolicyTarget {
    fn from((action, value): (String, serde_json::Value)) -> Self {
        let topics = value
            .as_array()
            .map(|xs| {
                xs.iter()
                    .filter_map(|x| x.as_u64())
                    .map(|x| x as u32)
                    .collect()
            })
            .unwrap_or_default();
        Self { action, topics }
    }
}

impl From<PolicyTarget> for (String, serde_json::Value) {
    fn from(t: PolicyTarget) -> Self {
        (t.action, serde_json::Value::from(t.topics))
    }
}

/// One conversation turn together with its context and targets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationRecord {
    /// Previous utterances, oldest first, each a token id sequence.
    pub context_tokens: Vec<Vec<u32>>,
    /// Entity ids mentioned in the context.
    pub context_entities: Vec<u32>,
    /// Word ids mentioned in the context.
    pub context_words: Vec<u32>,
    /// Item ids mentioned in the context.
    pub context_items: Vec<u32>,
    /// Items mentioned in the response (recommendation targets).
    pub items: Vec<u32>,
    /// Supervised item for one augmented recommendation example.
    pub item: Option<u32>,
    /// Target response tokens.
    pub response: Vec<u32>,
    pub role: Option<Role>,
    /// Items the user interacted with before this conversation.
    pub interaction_history: Option<Vec<u32>>,
    /// Policy targets of the response turn.
    pub target: Vec<PolicyTarget>,
    /// Policy annotations of every previous turn.
    pub context_policy: Vec<Vec<PolicyTarget>>,
    /// Final (conversation-level) topic target.
    #[serde(rename = "final")]
    pub final_topic: Option<PolicyTarget>,
    /// User profile sentences.
    pub user_profile: Vec<Vec<u32>>,
    /// Supervised topic for one augmented policy example.
    pub target_topic: Option<u32>,
}

impl ConversationRecord {
    /// Item ids of the history view: interaction history followed by
    /// context items.
    pub fn history_items(&self) -> Vec<u32> {
        let mut items = self.interaction_history.clone().unwrap_or_default();
        items.extend_from_slice(&self.context_items);
        items
    }

    /// Topic ids of every list-valued policy target, in order.
    pub fn target_topics(&self) -> impl Iterator<Item = u32> + '_ {
        self.target.iter().flat_map(|t| t.topics.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_target_from_array() {
        let t: PolicyTarget = serde_json::from_str(r#"["chat about", [3, 4]]"#).unwrap();
        assert_eq!(t, PolicyTarget::new("chat about", vec![3, 4]));

        let t: PolicyTarget = serde_json::from_str(r#"["recommend", "movie"]"#).unwrap();
        assert!(t.topics.is_empty());
    }

    #[test]
    fn test_record_defaults_and_final_rename() {
        let r: ConversationRecord = serde_json::from_str(
            r#"{"context_tokens": [[5, 6]], "final": ["goal", [7]], "role": "Recommender"}"#,
        )
        .unwrap();
        assert_eq!(r.context_tokens, vec![vec![5, 6]]);
        assert_eq!(r.final_topic.unwrap().topics, vec![7]);
        assert_eq!(r.role, Some(Role::Recommender));
        assert!(r.items.is_empty());
    }

    #[test]
    fn test_history_items_prepends_interactions() {
        let r = ConversationRecord {
            context_items: vec![4, 5],
            interaction_history: Some(vec![1]),
            ..Default::default()
        };
        assert_eq!(r.history_items(), vec![1, 4, 5]);
    }
}
