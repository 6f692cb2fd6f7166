//! The interface to the compute backend that executes decode steps.
//!
//! The scheduler owns exactly one [`ModelRuntime`] and is the only caller of it.
//! Every slot maps onto its own sequence in the runtime memory, identified by the slot id.

use std::sync::Arc;

use crate::{error::RuntimeError, SeqId};

/// Token id marking a position whose input is a media embedding rather than a token.
pub const NULL_TOKEN: u32 = u32::MAX;

#[derive(Debug, Clone)]
pub enum BatchInput {
    Token(u32),
    /// Row `row` of a pre-computed embedding block, `n_embd` floats per row.
    Embd { data: Arc<[f32]>, row: usize },
}

impl BatchInput {
    /// The token recorded in slot histories for this input.
    pub fn token(&self) -> u32 {
        match self {
            BatchInput::Token(token) => *token,
            BatchInput::Embd { .. } => NULL_TOKEN,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    #[default]
    None,
    Logits,
    Embedding,
}

#[derive(Debug, Clone)]
pub struct BatchItem {
    pub seq: SeqId,
    pub pos: usize,
    pub input: BatchInput,
    pub output: OutputKind,
}

/// Work packed for a single decode call.
#[derive(Debug, Default, Clone)]
pub struct Batch {
    pub items: Vec<BatchItem>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, seq: SeqId, pos: usize, input: BatchInput, output: OutputKind) {
        self.items.push(BatchItem {
            seq,
            pos,
            input,
            output,
        });
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn num_outputs(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.output != OutputKind::None)
            .count()
    }
}

/// One row per batch item that requested output, in item order.
#[derive(Debug, Default, Clone)]
pub struct BatchOutput {
    pub rows: Vec<Vec<f32>>,
}

/// Saved memory of the first `n_tokens` positions of a sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub n_tokens: usize,
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }
}

pub trait ModelRuntime: Send {
    /// Total context of the runtime, shared by all sequences.
    fn n_ctx(&self) -> usize;
    /// Width of embedding rows, both in inputs and outputs.
    fn n_embd(&self) -> usize;
    fn vocab_size(&self) -> usize;

    /// Run the model over the batch. Positions of a sequence must extend its memory contiguously.
    fn decode(&mut self, batch: &Batch) -> Result<BatchOutput, RuntimeError>;

    /// Drop every position at or after `len` from the memory of `seq`.
    fn truncate(&mut self, seq: SeqId, len: usize) -> Result<(), RuntimeError>;
    /// Drop `discard` positions after the first `keep` and move the rest back.
    fn shift(&mut self, seq: SeqId, keep: usize, discard: usize) -> Result<(), RuntimeError>;

    fn snapshot(&self, seq: SeqId, len: usize) -> Result<Snapshot, RuntimeError>;
    /// Replace the memory of `seq` with the snapshot.
    fn restore(&mut self, seq: SeqId, snapshot: &Snapshot) -> Result<(), RuntimeError>;

    /// The raw bytes a token renders to.
    fn token_piece(&self, token: u32) -> Vec<u8>;
    /// Whether the token ends generation.
    fn is_eog(&self, token: u32) -> bool;
}

impl<R: ModelRuntime + ?Sized> ModelRuntime for Box<R> {
    fn n_ctx(&self) -> usize {
        (**self).n_ctx()
    }

    fn n_embd(&self) -> usize {
        (**self).n_embd()
    }

    fn vocab_size(&self) -> usize {
        (**self).vocab_size()
    }

    fn decode(&mut self, batch: &Batch) -> Result<BatchOutput, RuntimeError> {
        (**self).decode(batch)
    }

    fn truncate(&mut self, seq: SeqId, len: usize) -> Result<(), RuntimeError> {
        (**self).truncate(seq, len)
    }

    fn shift(&mut self, seq: SeqId, keep: usize, discard: usize) -> Result<(), RuntimeError> {
        (**self).shift(seq, keep, discard)
    }

    fn snapshot(&self, seq: SeqId, len: usize) -> Result<Snapshot, RuntimeError> {
        (**self).snapshot(seq, len)
    }

    fn restore(&mut self, seq: SeqId, snapshot: &Snapshot) -> Result<(), RuntimeError> {
        (**self).restore(seq, snapshot)
    }

    fn token_piece(&self, token: u32) -> Vec<u8> {
        (**self).token_piece(token)
    }

    fn is_eog(&self, token: u32) -> bool {
        (**self).is_eog(token)
    }
}
