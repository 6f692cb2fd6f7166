use std::{path::PathBuf, time::Duration};

use derivative::Derivative;
use serde::{Deserialize, Serialize};

/// How per-position embedding rows are reduced into one vector.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pooling {
    #[default]
    Mean,
    /// Row of the last prompt position.
    Last,
    /// Row of the first prompt position.
    Cls,
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of slots, i.e. requests decoded concurrently.
    #[derivative(Default(value = "4"))]
    pub n_slots: usize,
    /// Maximum tokens packed into one decode call.
    #[derivative(Default(value = "512"))]
    pub n_batch: usize,
    /// Minimum prefix similarity for an idle slot to be reused by a new prompt.
    #[derivative(Default(value = "0.1"))]
    pub slot_prompt_similarity: f32,
    /// Reuse retained slot memory and checkpoints for shared prefixes.
    #[derivative(Default(value = "true"))]
    pub cache_prompt: bool,
    /// Size budget of all checkpoints in the prompt cache.
    #[derivative(Default(value = "256 * 1024 * 1024"))]
    pub cache_budget_bytes: usize,
    /// Upper bound on the number of checkpoints.
    #[derivative(Default(value = "256"))]
    pub cache_max_items: usize,
    /// Histories shorter than this are never checkpointed.
    #[derivative(Default(value = "32"))]
    pub min_checkpoint_tokens: usize,
    /// Discard half of the context after `n_keep` instead of stopping when a slot is full.
    #[derivative(Default(value = "true"))]
    pub context_shift: bool,
    /// How long the scheduler blocks on the task queue when it has nothing to do.
    #[derivative(Default(value = "Duration::from_millis(50)"))]
    #[serde(with = "millis")]
    pub idle_wait: Duration,
    /// Poll interval of response readers between cancellation checks.
    #[derivative(Default(value = "Duration::from_millis(100)"))]
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Directory for slot save/restore files. Slot files are refused if unset.
    pub slot_save_path: Option<PathBuf>,
    /// Pooling of embedding and rerank outputs.
    pub pooling: Pooling,
    /// L2-normalize embedding vectors.
    #[derivative(Default(value = "true"))]
    pub normalize_embeddings: bool,
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = SchedulerConfig::default();
        assert_eq!(config.n_slots, 4);
        assert_eq!(config.n_batch, 512);
        assert!(config.cache_prompt);
        assert!(config.slot_prompt_similarity >= 0.0);
        assert_eq!(config.idle_wait, Duration::from_millis(50));
        assert!(config.slot_save_path.is_none());
        assert_eq!(config.pooling, Pooling::Mean);
    }
}
