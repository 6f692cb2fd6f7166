//! A deterministic stand-in model over a byte vocabulary.
//!
//! Tokens `0..256` are raw bytes and `256` is the end-of-generation token. The
//! predicted next token is a pure function of the sequence memory, so what a sequence
//! generates depends only on what was decoded into it, whether that memory was built
//! by decoding, restored from a snapshot or shifted.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use derivative::Derivative;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    error::RuntimeError,
    runtime::{Batch, BatchInput, BatchItem, BatchOutput, ModelRuntime, OutputKind, Snapshot, NULL_TOKEN},
    SeqId,
};

pub const EOS_TOKEN: u32 = 256;
pub const VOCAB_SIZE: usize = 257;

#[derive(Debug, Clone, Derivative, Serialize, Deserialize)]
#[derivative(Default)]
#[serde(default)]
pub struct DummyConfig {
    #[derivative(Default(value = "4096"))]
    pub n_ctx: usize,
    #[derivative(Default(value = "8"))]
    pub n_embd: usize,
    /// Predict the end-of-generation token once a sequence holds this many positions.
    pub eos_at: Option<usize>,
    /// Artificial latency added to every decode call.
    pub step_delay_ms: u64,
}

/// Counters and fault injection shared with whoever created the runtime.
#[derive(Debug, Default)]
pub struct DummyStats {
    decode_calls: AtomicUsize,
    tokens_decoded: AtomicUsize,
    max_batch: AtomicUsize,
    fail_next: AtomicBool,
    fail_seq: Mutex<Option<SeqId>>,
}

impl DummyStats {
    pub fn decode_calls(&self) -> usize {
        self.decode_calls.load(Ordering::Acquire)
    }

    pub fn tokens_decoded(&self) -> usize {
        self.tokens_decoded.load(Ordering::Acquire)
    }

    /// Largest number of items seen in a single batch.
    pub fn max_batch(&self) -> usize {
        self.max_batch.load(Ordering::Acquire)
    }

    /// Make the next decode call fail.
    pub fn fail_next_decode(&self) {
        self.fail_next.store(true, Ordering::Release);
    }

    /// Make the next decode call that touches `seq` fail.
    pub fn fail_seq(&self, seq: SeqId) {
        *self.fail_seq.lock() = Some(seq);
    }

    fn should_fail(&self, batch: &Batch) -> bool {
        if self.fail_next.swap(false, Ordering::AcqRel) {
            return true;
        }
        let mut fail_seq = self.fail_seq.lock();
        match *fail_seq {
            Some(seq) if batch.items.iter().any(|item| item.seq == seq) => {
                *fail_seq = None;
                true
            }
            _ => false,
        }
    }
}

#[derive(Debug)]
pub struct DummyRuntime {
    config: DummyConfig,
    memory: HashMap<SeqId, Vec<u32>>,
    stats: Arc<DummyStats>,
}

impl DummyRuntime {
    pub fn new(config: DummyConfig) -> Self {
        Self {
            config,
            memory: HashMap::new(),
            stats: Default::default(),
        }
    }

    pub fn stats(&self) -> Arc<DummyStats> {
        self.stats.clone()
    }

    pub fn tokenize(text: &str) -> Vec<u32> {
        text.bytes().map(u32::from).collect()
    }

    /// The token predicted after `memory`.
    pub fn predict(memory: &[u32], eos_at: Option<usize>) -> u32 {
        if eos_at.is_some_and(|len| memory.len() >= len) {
            return EOS_TOKEN;
        }
        let sum: u64 = memory
            .iter()
            .filter(|&&token| token != NULL_TOKEN)
            .map(|&token| token as u64)
            .sum();
        b'a' as u32 + (sum % 26) as u32
    }

    /// Greedy continuation of `prompt`, as a server decoding it from scratch would produce.
    pub fn generate(prompt: &[u32], n: usize, eos_at: Option<usize>) -> Vec<u32> {
        let mut memory = prompt.to_vec();
        let mut output = vec![];
        for _ in 0..n {
            let token = Self::predict(&memory, eos_at);
            output.push(token);
            if token == EOS_TOKEN {
                break;
            }
            memory.push(token);
        }
        output
    }

    pub fn memory(&self, seq: SeqId) -> &[u32] {
        self.memory.get(&seq).map(Vec::as_slice).unwrap_or_default()
    }

    fn check(&self, batch: &Batch) -> Result<(), RuntimeError> {
        let mut lens: HashMap<SeqId, usize> = HashMap::new();
        for item in &batch.items {
            let len = lens
                .entry(item.seq)
                .or_insert_with(|| self.memory(item.seq).len());
            if item.pos != *len {
                return Err(RuntimeError::Position {
                    seq: item.seq,
                    pos: item.pos,
                });
            }
            *len += 1;

            if let BatchInput::Embd { data, row } = &item.input {
                if (row + 1) * self.config.n_embd > data.len() {
                    return Err(RuntimeError::Decode(format!(
                        "embedding row {row} out of range"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn embed(item: &BatchItem, n_embd: usize) -> Vec<f32> {
    match &item.input {
        BatchInput::Embd { data, row } => data[row * n_embd..(row + 1) * n_embd].to_vec(),
        BatchInput::Token(token) => (0..n_embd)
            .map(|i| ((*token as usize * 31 + i * 7 + item.pos) % 17) as f32 - 8.0)
            .collect(),
    }
}

impl ModelRuntime for DummyRuntime {
    fn n_ctx(&self) -> usize {
        self.config.n_ctx
    }

    fn n_embd(&self) -> usize {
        self.config.n_embd
    }

    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }

    fn decode(&mut self, batch: &Batch) -> Result<BatchOutput, RuntimeError> {
        self.stats.decode_calls.fetch_add(1, Ordering::AcqRel);
        self.stats.max_batch.fetch_max(batch.len(), Ordering::AcqRel);
        if self.stats.should_fail(batch) {
            return Err(RuntimeError::Decode("injected failure".into()));
        }
        self.check(batch)?;

        if self.config.step_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.config.step_delay_ms));
        }

        let eos_at = self.config.eos_at;
        let n_embd = self.config.n_embd;
        let mut rows = vec![];
        for item in &batch.items {
            let memory = self.memory.entry(item.seq).or_default();
            memory.push(item.input.token());
            match item.output {
                OutputKind::None => {}
                OutputKind::Logits => {
                    let mut row = vec![0.0; VOCAB_SIZE];
                    row[Self::predict(memory, eos_at) as usize] = 100.0;
                    rows.push(row);
                }
                OutputKind::Embedding => rows.push(embed(item, n_embd)),
            }
        }

        self.stats
            .tokens_decoded
            .fetch_add(batch.len(), Ordering::AcqRel);
        Ok(BatchOutput { rows })
    }

    fn truncate(&mut self, seq: SeqId, len: usize) -> Result<(), RuntimeError> {
        if let Some(memory) = self.memory.get_mut(&seq) {
            memory.truncate(len);
        }
        Ok(())
    }

    fn shift(&mut self, seq: SeqId, keep: usize, discard: usize) -> Result<(), RuntimeError> {
        let memory = self.memory.entry(seq).or_default();
        if keep + discard > memory.len() {
            return Err(RuntimeError::Position {
                seq,
                pos: keep + discard,
            });
        }
        memory.drain(keep..keep + discard);
        Ok(())
    }

    fn snapshot(&self, seq: SeqId, len: usize) -> Result<Snapshot, RuntimeError> {
        let memory = self.memory(seq);
        if len > memory.len() {
            return Err(RuntimeError::Position { seq, pos: len });
        }
        Ok(Snapshot {
            n_tokens: len,
            data: bytemuck::cast_slice(&memory[..len]).to_vec(),
        })
    }

    fn restore(&mut self, seq: SeqId, snapshot: &Snapshot) -> Result<(), RuntimeError> {
        let size = std::mem::size_of::<u32>();
        if snapshot.data.len() != snapshot.n_tokens * size {
            return Err(RuntimeError::Snapshot(format!(
                "{} bytes cannot hold {} positions",
                snapshot.data.len(),
                snapshot.n_tokens
            )));
        }
        let memory = snapshot
            .data
            .chunks_exact(size)
            .map(bytemuck::pod_read_unaligned::<u32>)
            .collect();
        self.memory.insert(seq, memory);
        Ok(())
    }

    fn token_piece(&self, token: u32) -> Vec<u8> {
        match u8::try_from(token) {
            Ok(byte) => vec![byte],
            Err(_) => vec![],
        }
    }

    fn is_eog(&self, token: u32) -> bool {
        token == EOS_TOKEN
    }
}
