use std::time::Duration;

use serde::Serialize;

use crate::slot::{SlotInfo, SlotState};

/// Counters accumulated by the scheduler thread.
///
/// Prompt and generation counters come in two sets: totals since start, and a bucket
/// covering the interval since the last [`Metrics::reset_bucket`]. Rates are taken
/// from the bucket.
#[derive(Debug, Default, Clone)]
pub struct Metrics {
    n_prompt_tokens_processed: u64,
    t_prompt_processing: Duration,
    n_tokens_predicted: u64,
    t_tokens_generation: Duration,

    n_prompt_tokens_processed_total: u64,
    t_prompt_processing_total: Duration,
    n_tokens_predicted_total: u64,
    t_tokens_generation_total: Duration,
    n_draft_total: u64,
    n_draft_accepted_total: u64,
    n_decode_total: u64,
    n_busy_slots_total: u64,
    n_tokens_max: usize,
    n_errors_total: u64,
}

impl Metrics {
    pub fn on_prompt_eval(&mut self, n_tokens: usize, elapsed: Duration) {
        self.n_prompt_tokens_processed += n_tokens as u64;
        self.t_prompt_processing += elapsed;
        self.n_prompt_tokens_processed_total += n_tokens as u64;
        self.t_prompt_processing_total += elapsed;
    }

    pub fn on_prediction(&mut self, n_tokens: usize, elapsed: Duration, n_past: usize) {
        self.n_tokens_predicted += n_tokens as u64;
        self.t_tokens_generation += elapsed;
        self.n_tokens_predicted_total += n_tokens as u64;
        self.t_tokens_generation_total += elapsed;
        self.n_tokens_max = self.n_tokens_max.max(n_past);
    }

    pub fn on_draft(&mut self, n_draft: usize, n_accepted: usize) {
        self.n_draft_total += n_draft as u64;
        self.n_draft_accepted_total += n_accepted as u64;
    }

    pub fn on_decoded(&mut self, n_busy_slots: usize) {
        self.n_decode_total += 1;
        self.n_busy_slots_total += n_busy_slots as u64;
    }

    pub fn on_error(&mut self) {
        self.n_errors_total += 1;
    }

    pub fn reset_bucket(&mut self) {
        self.n_prompt_tokens_processed = 0;
        self.t_prompt_processing = Duration::ZERO;
        self.n_tokens_predicted = 0;
        self.t_tokens_generation = Duration::ZERO;
    }

    pub fn snapshot(&self, gauges: Gauges, slots: Vec<SlotInfo>) -> MetricsSnapshot {
        let rate = |n: u64, t: Duration| match t.is_zero() {
            true => 0.0,
            false => n as f64 / t.as_secs_f64(),
        };
        let busy_slots = slots
            .iter()
            .filter(|slot| slot.state != SlotState::Idle)
            .count();
        let n_busy_slots_per_decode = match self.n_decode_total {
            0 => 0.0,
            n => self.n_busy_slots_total as f64 / n as f64,
        };

        MetricsSnapshot {
            queue_depth: gauges.queued + gauges.deferred,
            deferred: gauges.deferred,
            busy_slots,
            tokens_per_second_prompt: rate(
                self.n_prompt_tokens_processed,
                self.t_prompt_processing,
            ),
            tokens_per_second_generation: rate(
                self.n_tokens_predicted,
                self.t_tokens_generation,
            ),
            n_prompt_tokens_processed: self.n_prompt_tokens_processed,
            prompt_seconds: self.t_prompt_processing.as_secs_f64(),
            n_tokens_predicted: self.n_tokens_predicted,
            predicted_seconds: self.t_tokens_generation.as_secs_f64(),
            n_prompt_tokens_total: self.n_prompt_tokens_processed_total,
            prompt_seconds_total: self.t_prompt_processing_total.as_secs_f64(),
            n_tokens_predicted_total: self.n_tokens_predicted_total,
            predicted_seconds_total: self.t_tokens_generation_total.as_secs_f64(),
            n_draft_total: self.n_draft_total,
            n_draft_accepted_total: self.n_draft_accepted_total,
            n_decode_total: self.n_decode_total,
            n_busy_slots_per_decode,
            n_tokens_max: self.n_tokens_max,
            n_errors_total: self.n_errors_total,
            cache_items: gauges.cache_items,
            cache_bytes: gauges.cache_bytes,
            slots,
        }
    }
}

/// Scheduler-side sizes reported next to the counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct Gauges {
    pub queued: usize,
    pub deferred: usize,
    pub cache_items: usize,
    pub cache_bytes: usize,
}

#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Tasks submitted but not bound to a slot, deferred ones included.
    pub queue_depth: usize,
    pub deferred: usize,
    pub busy_slots: usize,
    /// Rates over the current bucket.
    pub tokens_per_second_prompt: f64,
    pub tokens_per_second_generation: f64,
    pub n_prompt_tokens_processed: u64,
    pub prompt_seconds: f64,
    pub n_tokens_predicted: u64,
    pub predicted_seconds: f64,
    pub n_prompt_tokens_total: u64,
    pub prompt_seconds_total: f64,
    pub n_tokens_predicted_total: u64,
    pub predicted_seconds_total: f64,
    pub n_draft_total: u64,
    pub n_draft_accepted_total: u64,
    pub n_decode_total: u64,
    pub n_busy_slots_per_decode: f64,
    pub n_tokens_max: usize,
    pub n_errors_total: u64,
    pub cache_items: usize,
    pub cache_bytes: usize,
    pub slots: Vec<SlotInfo>,
}

impl MetricsSnapshot {
    pub fn is_idle(&self) -> bool {
        self.queue_depth == 0 && self.busy_slots == 0
    }
}
