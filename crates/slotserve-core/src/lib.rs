use std::{sync::Arc, time::Duration};

use derivative::Derivative;
use serde::{Deserialize, Serialize};

pub use crate::{
    config::{Pooling, SchedulerConfig},
    error::{ErrorKind, RuntimeError, ServerError},
    metrics::MetricsSnapshot,
    queue::CancelToken,
    serve::{ResponseReader, Server},
    slot::{SlotInfo, SlotState},
};
use crate::{runtime::NULL_TOKEN, sampler::SamplerParams, speculative::SpeculativeParams};

pub mod cache;
pub mod config;
pub mod dummy;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod run;
pub mod runtime;
pub mod sampler;
pub mod serve;
pub mod slot;
pub mod speculative;

pub type TaskId = u64;
/// Sequence id inside the runtime memory; equal to the id of the slot owning it.
pub type SeqId = u32;

/// Pre-computed embeddings occupying `n_tokens` prompt positions.
#[derive(Debug, Clone)]
pub struct MediaChunk {
    pub id: String,
    pub n_tokens: usize,
    /// `n_tokens * n_embd` floats, row-major.
    pub embd: Arc<[f32]>,
}

#[derive(Debug, Clone)]
pub enum PromptChunk {
    Text(Vec<u32>),
    Media(MediaChunk),
}

#[derive(Debug, Default, Clone)]
pub struct PromptInput {
    pub chunks: Vec<PromptChunk>,
}

impl From<Vec<u32>> for PromptInput {
    fn from(value: Vec<u32>) -> Self {
        Self {
            chunks: vec![PromptChunk::Text(value)],
        }
    }
}

impl PromptInput {
    pub fn n_tokens(&self) -> usize {
        self.chunks
            .iter()
            .map(|chunk| match chunk {
                PromptChunk::Text(tokens) => tokens.len(),
                PromptChunk::Media(media) => media.n_tokens,
            })
            .sum()
    }

    /// The prompt as it is recorded in slot histories: media positions become [`NULL_TOKEN`].
    pub fn tokens(&self) -> Vec<u32> {
        let mut tokens = Vec::with_capacity(self.n_tokens());
        for chunk in &self.chunks {
            match chunk {
                PromptChunk::Text(text) => tokens.extend_from_slice(text),
                PromptChunk::Media(media) => {
                    tokens.extend(std::iter::repeat(NULL_TOKEN).take(media.n_tokens))
                }
            }
        }
        tokens
    }

    pub fn media(&self) -> impl Iterator<Item = &MediaChunk> {
        self.chunks.iter().filter_map(|chunk| match chunk {
            PromptChunk::Media(media) => Some(media),
            PromptChunk::Text(_) => None,
        })
    }
}

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct TaskParams {
    pub sampler: SamplerParams,
    /// Verify n-gram drafts from the slot history alongside each generated token.
    pub speculative: Option<SpeculativeParams>,
    /// Prompt positions preserved by a context shift.
    pub n_keep: usize,
    /// Maximum number of generated tokens; unbounded if unset.
    pub n_predict: Option<usize>,
    pub stop: Vec<String>,
    #[derivative(Default(value = "true"))]
    pub stream: bool,
    pub emit_timings_per_token: bool,
    /// Attach this many most probable candidates to every generated token.
    pub n_probs: usize,
    /// Report progress after each prompt chunk decoded; streaming tasks only.
    pub return_progress: bool,
    #[derivative(Default(value = "true"))]
    pub cache_prompt: bool,
    pub seed: Option<u64>,
}

/// Target of a slot management task. `filename` is relative to the slot save directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotOp {
    pub slot: u32,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    Completion,
    /// Fill-in-the-middle; the caller has already laid out prefix and suffix in the prompt.
    Infill,
    Embedding,
    /// Score one document against a query; `index` is echoed back in the result.
    Rerank { index: usize },
    SlotSave(SlotOp),
    SlotRestore(SlotOp),
    SlotErase { slot: u32 },
    /// Read the scheduler counters; `reset_bucket` starts a new interval afterwards.
    Metrics { reset_bucket: bool },
}

impl TaskKind {
    /// Tasks that generate tokens and thus keep their memory for later prefix reuse.
    pub fn is_generation(&self) -> bool {
        matches!(self, TaskKind::Completion | TaskKind::Infill)
    }

    pub fn is_pooling(&self) -> bool {
        matches!(self, TaskKind::Embedding | TaskKind::Rerank { .. })
    }

    pub fn is_slot_op(&self) -> bool {
        matches!(
            self,
            TaskKind::SlotSave(_) | TaskKind::SlotRestore(_) | TaskKind::SlotErase { .. }
        )
    }

    /// The slot a slot management task targets.
    pub fn target_slot(&self) -> Option<u32> {
        match self {
            TaskKind::SlotSave(op) | TaskKind::SlotRestore(op) => Some(op.slot),
            TaskKind::SlotErase { slot } => Some(*slot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub params: TaskParams,
    pub input: PromptInput,
    pub(crate) cancel: CancelToken,
}

impl Task {
    pub fn new(id: TaskId, kind: TaskKind, params: TaskParams, input: PromptInput) -> Self {
        Self {
            id,
            kind,
            params,
            input,
            cancel: CancelToken::new(),
        }
    }

    pub fn completion(id: TaskId, input: impl Into<PromptInput>, params: TaskParams) -> Self {
        Self::new(id, TaskKind::Completion, params, input.into())
    }

    pub fn infill(id: TaskId, input: impl Into<PromptInput>, params: TaskParams) -> Self {
        Self::new(id, TaskKind::Infill, params, input.into())
    }

    pub fn embedding(id: TaskId, input: impl Into<PromptInput>) -> Self {
        Self::new(id, TaskKind::Embedding, Default::default(), input.into())
    }

    pub fn rerank(id: TaskId, index: usize, input: impl Into<PromptInput>) -> Self {
        Self::new(
            id,
            TaskKind::Rerank { index },
            Default::default(),
            input.into(),
        )
    }

    pub fn slot_save(id: TaskId, slot: u32, filename: impl Into<String>) -> Self {
        let op = SlotOp {
            slot,
            filename: filename.into(),
        };
        Self::new(id, TaskKind::SlotSave(op), Default::default(), Default::default())
    }

    pub fn slot_restore(id: TaskId, slot: u32, filename: impl Into<String>) -> Self {
        let op = SlotOp {
            slot,
            filename: filename.into(),
        };
        Self::new(
            id,
            TaskKind::SlotRestore(op),
            Default::default(),
            Default::default(),
        )
    }

    pub fn slot_erase(id: TaskId, slot: u32) -> Self {
        Self::new(
            id,
            TaskKind::SlotErase { slot },
            Default::default(),
            Default::default(),
        )
    }

    pub fn metrics(id: TaskId, reset_bucket: bool) -> Self {
        Self::new(
            id,
            TaskKind::Metrics { reset_bucket },
            Default::default(),
            Default::default(),
        )
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopType {
    /// The model produced an end-of-generation token.
    Eos,
    /// Generated text matched this stop string.
    Word(String),
    /// `n_predict` or the context limit was reached.
    Limit,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timings {
    /// Prompt positions reused from the slot or a checkpoint.
    pub cache_n: usize,
    /// Prompt positions actually decoded.
    pub prompt_n: usize,
    pub prompt_ms: f64,
    pub predicted_n: usize,
    pub predicted_ms: f64,
    pub draft_n: usize,
    pub draft_accepted_n: usize,
}

impl Timings {
    pub fn prompt_per_second(&self) -> f64 {
        per_second(self.prompt_n, self.prompt_ms)
    }

    pub fn predicted_per_second(&self) -> f64 {
        per_second(self.predicted_n, self.predicted_ms)
    }
}

fn per_second(n: usize, ms: f64) -> f64 {
    match ms > 0.0 {
        true => 1e3 * n as f64 / ms,
        false => 0.0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenProb {
    pub token: u32,
    pub piece: String,
    pub prob: f32,
}

/// A generated token, with the most probable candidates for its position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenProbs {
    pub token: u32,
    pub prob: f32,
    pub top: Vec<TokenProb>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Partial {
    pub task_id: TaskId,
    pub content_delta: String,
    pub token: u32,
    pub n_decoded: usize,
    /// Tokens generated since the previous partial; empty unless `n_probs` is set.
    pub probs: Vec<TokenProbs>,
    pub timings: Option<Timings>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub task_id: TaskId,
    /// Prompt positions in total.
    pub total: usize,
    /// Prompt positions reused instead of decoded.
    pub cache: usize,
    /// Prompt positions in memory so far, reused ones included.
    pub processed: usize,
    pub time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Final {
    pub task_id: TaskId,
    /// Full text if the task did not stream, otherwise only what was not yet streamed.
    pub content: String,
    pub tokens: Vec<u32>,
    /// Like `content`: every token's probabilities, or those not streamed yet.
    pub probs: Vec<TokenProbs>,
    pub stop: StopType,
    pub n_prompt: usize,
    pub timings: Timings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskError {
    pub task_id: TaskId,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Embedding {
    pub task_id: TaskId,
    pub vector: Vec<f32>,
    pub n_prompt: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rerank {
    pub task_id: TaskId,
    pub index: usize,
    pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotOpResult {
    pub task_id: TaskId,
    pub slot: u32,
    /// Tokens saved, restored or erased.
    pub n_tokens: usize,
    /// Size of the slot file; zero for erase.
    pub n_bytes: usize,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsResult {
    pub task_id: TaskId,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskResult {
    Partial(Partial),
    Progress(Progress),
    Final(Final),
    Error(TaskError),
    Embedding(Embedding),
    Rerank(Rerank),
    SlotOp(SlotOpResult),
    Metrics(MetricsResult),
}

impl TaskResult {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskResult::Partial(result) => result.task_id,
            TaskResult::Progress(result) => result.task_id,
            TaskResult::Final(result) => result.task_id,
            TaskResult::Error(result) => result.task_id,
            TaskResult::Embedding(result) => result.task_id,
            TaskResult::Rerank(result) => result.task_id,
            TaskResult::SlotOp(result) => result.task_id,
            TaskResult::Metrics(result) => result.task_id,
        }
    }

    /// Every task ends with exactly one terminal result; partials and progress reports
    /// are not.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskResult::Partial(_) | TaskResult::Progress(_))
    }

    pub fn error(task_id: TaskId, err: ServerError) -> Self {
        TaskResult::Error(TaskError {
            task_id,
            kind: err.kind,
            message: err.message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_positions_are_null_tokens() {
        let input = PromptInput {
            chunks: vec![
                PromptChunk::Text(vec![1, 2]),
                PromptChunk::Media(MediaChunk {
                    id: "img".into(),
                    n_tokens: 3,
                    embd: vec![0.0; 6].into(),
                }),
                PromptChunk::Text(vec![9]),
            ],
        };
        assert_eq!(input.n_tokens(), 6);
        assert_eq!(
            input.tokens(),
            vec![1, 2, NULL_TOKEN, NULL_TOKEN, NULL_TOKEN, 9]
        );
        assert_eq!(input.media().count(), 1);
    }

    #[test]
    fn only_partials_are_not_terminal() {
        let partial = TaskResult::Partial(Partial {
            task_id: 1,
            content_delta: "a".into(),
            token: 97,
            n_decoded: 1,
            probs: vec![],
            timings: None,
        });
        assert!(!partial.is_terminal());
        let progress = TaskResult::Progress(Progress {
            task_id: 1,
            total: 10,
            cache: 2,
            processed: 6,
            time_ms: 1.0,
        });
        assert!(!progress.is_terminal());
        let metrics = TaskResult::Metrics(MetricsResult {
            task_id: 2,
            metrics: Default::default(),
        });
        assert!(metrics.is_terminal());
        assert_eq!(metrics.task_id(), 2);
        let error = TaskResult::error(1, ServerError::not_found("slot 9"));
        assert!(error.is_terminal());
        assert_eq!(error.task_id(), 1);
    }

    #[test]
    fn timings_rates() {
        let timings = Timings {
            prompt_n: 100,
            prompt_ms: 50.0,
            predicted_n: 10,
            predicted_ms: 0.0,
            ..Default::default()
        };
        assert_eq!(timings.prompt_per_second(), 2000.0);
        assert_eq!(timings.predicted_per_second(), 0.0);
    }
}
