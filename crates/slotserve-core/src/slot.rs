use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::{
    cache::{common_prefix, CheckpointId},
    config::Pooling,
    runtime::{BatchInput, Snapshot, NULL_TOKEN},
    sampler::Sampler,
    MediaChunk, SeqId, Task, TaskId, Timings, TokenProbs,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Idle,
    /// Bound to a task whose prompt has not been looked at yet.
    Started,
    ProcessingPrompt,
    /// The whole prompt is in memory; the first token is about to be sampled.
    DonePrompt,
    Generating,
}

impl SlotState {
    pub fn can_transition(self, next: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, next),
            (Idle, Started)
                | (Started, ProcessingPrompt)
                | (ProcessingPrompt, DonePrompt)
                | (DonePrompt, Generating)
                | (Started | ProcessingPrompt | DonePrompt | Generating, Idle)
        )
    }
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SlotState::Idle => "idle",
            SlotState::Started => "started",
            SlotState::ProcessingPrompt => "processing_prompt",
            SlotState::DonePrompt => "done_prompt",
            SlotState::Generating => "generating",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotInfo {
    pub id: SeqId,
    pub state: SlotState,
    pub task_id: Option<TaskId>,
    pub n_past: usize,
    pub n_ctx: usize,
}

/// Prompt tokens of a bound task, with media rows located by position.
#[derive(Debug, Default, Clone)]
pub struct Prompt {
    pub tokens: Vec<u32>,
    media: Vec<(usize, MediaChunk)>,
}

impl Prompt {
    pub fn new(task: &Task) -> Self {
        let tokens = task.input.tokens();
        let mut media = vec![];
        let mut start = 0;
        for chunk in &task.input.chunks {
            match chunk {
                crate::PromptChunk::Text(text) => start += text.len(),
                crate::PromptChunk::Media(chunk) => {
                    media.push((start, chunk.clone()));
                    start += chunk.n_tokens;
                }
            }
        }
        Self { tokens, media }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn input(&self, pos: usize) -> BatchInput {
        let token = self.tokens[pos];
        if token != NULL_TOKEN {
            return BatchInput::Token(token);
        }
        match self.media.iter().rev().find(|(start, _)| *start <= pos) {
            Some((start, chunk)) => BatchInput::Embd {
                data: chunk.embd.clone(),
                row: pos - start,
            },
            None => BatchInput::Token(token),
        }
    }
}

/// What a newly generated piece allows to be released to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emit {
    Send(String),
    /// Everything new may still turn into a stop string or a longer code point.
    Hold,
    /// A stop string matched; the output has been cut in front of it.
    Stop(String),
}

/// Generated bytes of a task, split into what was sent and what is held back.
#[derive(Debug, Default, Clone)]
pub struct Generated {
    bytes: Vec<u8>,
    n_sent: usize,
    pub tokens: Vec<u32>,
}

impl Generated {
    pub fn push(&mut self, piece: &[u8], stop: &[String]) -> Emit {
        self.bytes.extend_from_slice(piece);
        let unsent = &self.bytes[self.n_sent..];

        let found = stop
            .iter()
            .filter(|word| !word.is_empty())
            .filter_map(|word| find(unsent, word.as_bytes()).map(|index| (index, word)))
            .min_by_key(|(index, _)| *index);
        if let Some((index, word)) = found {
            let word = word.clone();
            self.bytes.truncate(self.n_sent + index);
            return Emit::Stop(word);
        }

        let hold = stop
            .iter()
            .map(|word| partial_suffix(unsent, word.as_bytes()))
            .max()
            .unwrap_or(0);
        let mut safe = unsent.len() - hold;
        if let Err(err) = std::str::from_utf8(&unsent[..safe]) {
            if err.error_len().is_none() {
                safe = err.valid_up_to();
            }
        }
        if safe == 0 {
            return Emit::Hold;
        }

        let delta = String::from_utf8_lossy(&unsent[..safe]).into_owned();
        self.n_sent += safe;
        Emit::Send(delta)
    }

    /// Everything not yet released, including held bytes.
    pub fn flush(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.bytes[self.n_sent..]).into_owned();
        self.n_sent = self.bytes.len();
        rest
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Length of the longest proper prefix of `word` that `text` ends with.
fn partial_suffix(text: &[u8], word: &[u8]) -> usize {
    (1..word.len())
        .rev()
        .find(|&len| text.ends_with(&word[..len]))
        .unwrap_or(0)
}

/// Running reduction of embedding rows.
#[derive(Debug, Default, Clone)]
pub struct Pooled {
    sum: Vec<f32>,
    first: Vec<f32>,
    last: Vec<f32>,
    count: usize,
}

impl Pooled {
    pub fn push(&mut self, row: &[f32]) {
        if self.count == 0 {
            self.sum = vec![0.0; row.len()];
            self.first = row.to_vec();
        }
        self.sum
            .iter_mut()
            .zip(row)
            .for_each(|(sum, x)| *sum += x);
        self.last = row.to_vec();
        self.count += 1;
    }

    pub fn finish(self, pooling: Pooling, normalize: bool) -> Vec<f32> {
        let mut vector = match pooling {
            Pooling::Mean => {
                let count = self.count.max(1) as f32;
                self.sum.into_iter().map(|x| x / count).collect()
            }
            Pooling::Last => self.last,
            Pooling::Cls => self.first,
        };
        if normalize {
            let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                vector.iter_mut().for_each(|x| *x /= norm);
            }
        }
        vector
    }
}

/// A task together with everything its slot tracks while serving it.
pub struct Bound {
    pub task: Task,
    pub prompt: Prompt,
    pub sampler: Box<dyn Sampler + Send>,
    /// Prompt positions reused instead of decoded.
    pub n_cached: usize,
    /// Sampled but not yet decoded.
    pub pending: Option<u32>,
    /// Drafts decoded after `pending` in the batch in flight.
    pub drafts: Vec<u32>,
    pub generated: Generated,
    /// Probabilities of generated tokens not yet sent.
    pub probs: Vec<TokenProbs>,
    pub n_decoded: usize,
    pub n_draft: usize,
    pub n_draft_accepted: usize,
    pub pooled: Pooled,
    /// The context was shifted, so memory past `n_keep` no longer matches the prompt.
    pub shifted: bool,
    pub t_start: Instant,
    pub t_prompt_done: Option<Instant>,
}

impl Bound {
    pub fn new(task: Task) -> Self {
        let prompt = Prompt::new(&task);
        let sampler = task.params.sampler.build(task.params.seed);
        Self {
            task,
            prompt,
            sampler,
            n_cached: 0,
            pending: None,
            drafts: vec![],
            generated: Default::default(),
            probs: vec![],
            n_decoded: 0,
            n_draft: 0,
            n_draft_accepted: 0,
            pooled: Default::default(),
            shifted: false,
            t_start: Instant::now(),
            t_prompt_done: None,
        }
    }

    pub fn timings(&self) -> Timings {
        let now = Instant::now();
        let prompt_done = self.t_prompt_done.unwrap_or(now);
        Timings {
            cache_n: self.n_cached,
            prompt_n: self.prompt.len() - self.n_cached,
            prompt_ms: prompt_done.duration_since(self.t_start).as_secs_f64() * 1e3,
            predicted_n: self.n_decoded,
            predicted_ms: now.duration_since(prompt_done).as_secs_f64() * 1e3,
            draft_n: self.n_draft,
            draft_accepted_n: self.n_draft_accepted,
        }
    }
}

impl std::fmt::Debug for Bound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bound")
            .field("task", &self.task.id)
            .field("prompt", &self.prompt.len())
            .field("n_cached", &self.n_cached)
            .field("n_decoded", &self.n_decoded)
            .finish()
    }
}

/// One unit of concurrency: a sequence in the runtime memory plus the task using it.
///
/// `history` always mirrors what the runtime holds for sequence `id`.
#[derive(Debug)]
pub struct Slot {
    pub id: SeqId,
    state: SlotState,
    pub bound: Option<Box<Bound>>,
    pub history: Vec<u32>,
    /// Checkpoint the current memory was restored from, if any.
    pub checkpoint: Option<CheckpointId>,
    pub last_used: Instant,
    pub n_ctx: usize,
}

impl Slot {
    pub fn new(id: SeqId, n_ctx: usize) -> Self {
        Self {
            id,
            state: SlotState::Idle,
            bound: None,
            history: vec![],
            checkpoint: None,
            last_used: Instant::now(),
            n_ctx,
        }
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == SlotState::Idle
    }

    pub fn task_id(&self) -> Option<TaskId> {
        self.bound.as_ref().map(|bound| bound.task.id)
    }

    pub fn transition(&mut self, next: SlotState) {
        debug_assert!(
            self.state.can_transition(next),
            "slot {} cannot go from {} to {next}",
            self.id,
            self.state
        );
        log::debug!("[slot: {}][{} -> {next}]", self.id, self.state);
        self.state = next;
    }

    pub fn bind(&mut self, bound: Box<Bound>) {
        debug_assert!(self.bound.is_none());
        self.bound = Some(bound);
        self.transition(SlotState::Started);
    }

    pub fn release(&mut self) -> Option<Box<Bound>> {
        self.transition(SlotState::Idle);
        self.last_used = Instant::now();
        self.bound.take()
    }

    /// Shared prefix length with `prompt`, relative to the longer of the two.
    pub fn similarity(&self, prompt: &[u32]) -> (usize, usize) {
        let len = common_prefix(&self.history, prompt);
        (len, self.history.len().max(prompt.len()))
    }

    pub fn info(&self) -> SlotInfo {
        SlotInfo {
            id: self.id,
            state: self.state,
            task_id: self.task_id(),
            n_past: self.history.len(),
            n_ctx: self.n_ctx,
        }
    }
}

/// On-disk form of a saved slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotFile {
    pub tokens: Vec<u32>,
    pub state: Vec<u8>,
}

impl SlotFile {
    pub fn new(tokens: Vec<u32>, snapshot: Snapshot) -> Self {
        Self {
            tokens,
            state: snapshot.data,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            n_tokens: self.tokens.len(),
            data: self.state.clone(),
        }
    }

    /// Write the file and return its size in bytes.
    pub fn save(&self, path: &Path) -> Result<usize> {
        use cbor4ii::{core::enc::Write, serde::Serializer};
        use std::{fs::File, io::Write as _};

        struct FileWriter(File);
        impl Write for FileWriter {
            type Error = std::io::Error;
            fn push(&mut self, input: &[u8]) -> Result<(), Self::Error> {
                self.0.write_all(input)
            }
        }

        let file = FileWriter(File::create(path)?);
        let mut serializer = Serializer::new(file);
        self.serialize(&mut serializer)?;
        drop(serializer);

        Ok(std::fs::metadata(path)?.len() as usize)
    }

    pub fn load(path: &Path) -> Result<(Self, usize)> {
        let data = std::fs::read(path)?;
        let file: Self =
            cbor4ii::serde::from_slice(&data).map_err(|err| anyhow::anyhow!("{:?}", err))?;
        Ok((file, data.len()))
    }
}

/// Resolve a slot file name inside `path`, refusing anything that escapes it.
pub fn build_path(path: impl AsRef<Path>, name: impl AsRef<Path>) -> Result<PathBuf> {
    let name = name.as_ref();
    if name.as_os_str().is_empty() {
        bail!("empty file name");
    }
    if name.is_absolute()
        || name.components().count() != 1
        || name.components().any(|c| !matches!(c, std::path::Component::Normal(_)))
    {
        bail!("invalid file name: {}", name.to_string_lossy());
    }
    Ok(path.as_ref().join(name))
}
