use std::{cmp::Ordering, collections::VecDeque, sync::Arc, time::Instant};

use itertools::Itertools;

use crate::{
    cache::{common_prefix, reusable, PromptCache, Tokens},
    config::SchedulerConfig,
    metrics::{Gauges, Metrics, MetricsSnapshot},
    runtime::{Batch, BatchInput, BatchOutput, ModelRuntime, OutputKind},
    sampler::{sample_logits, softmax},
    serve::Shared,
    slot::{Bound, Emit, Slot, SlotFile, SlotState},
    speculative, Embedding, Final, MetricsResult, Partial, Progress, Rerank, SeqId, ServerError,
    SlotOpResult, StopType, Task, TaskKind, TaskResult, TokenProb, TokenProbs,
};

#[derive(Debug, Clone, Copy)]
enum SlotChoice {
    /// Reuse `len` tokens of the slot history; `max` is the longer of history and prompt.
    Continue(usize, usize, usize),
    Back(usize),
    Empty(usize),
}

impl SlotChoice {
    fn slot(&self) -> usize {
        match *self {
            SlotChoice::Continue(slot, _, _) | SlotChoice::Back(slot) | SlotChoice::Empty(slot) => {
                slot
            }
        }
    }
}

impl std::fmt::Display for SlotChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotChoice::Continue(_, len, _) => write!(f, "continue: {len}"),
            SlotChoice::Back(_) => f.write_str("back"),
            SlotChoice::Empty(_) => f.write_str("empty"),
        }
    }
}

impl std::cmp::Ord for SlotChoice {
    fn cmp(&self, other: &Self) -> Ordering {
        // priority: continue > empty > back
        use SlotChoice::{Back, Continue, Empty};
        match (self, other) {
            (Continue(_, x, a), Continue(_, y, b)) => (x * b).cmp(&(y * a)),
            (Continue(..), _) => Ordering::Greater,
            (_, Continue(..)) => Ordering::Less,
            (Empty(_), Empty(_)) => Ordering::Equal,
            (Empty(_), Back(_)) => Ordering::Greater,
            (Back(_), Empty(_)) => Ordering::Less,
            (Back(_), Back(_)) => Ordering::Equal,
        }
    }
}

impl std::cmp::PartialOrd for SlotChoice {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::cmp::PartialEq for SlotChoice {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl std::cmp::Eq for SlotChoice {}

/// What one slot contributed to the batch in flight.
#[derive(Debug, Clone, Copy)]
struct Span {
    slot: usize,
    first_item: usize,
    n_items: usize,
    first_row: usize,
    n_rows: usize,
    prompt: bool,
}

/// Owner of the slots, the runtime and the prompt cache. Runs on its own thread.
pub struct Scheduler<R> {
    config: SchedulerConfig,
    runtime: R,
    shared: Arc<Shared>,
    slots: Vec<Slot>,
    cache: PromptCache,
    deferred: VecDeque<Task>,
    metrics: Metrics,
    batch: Batch,
}

impl<R: ModelRuntime> Scheduler<R> {
    pub fn new(config: SchedulerConfig, runtime: R, shared: Arc<Shared>) -> Self {
        let n_ctx_slot = shared.limits.n_ctx_slot;
        let slots = (0..config.n_slots)
            .map(|id| Slot::new(id as SeqId, n_ctx_slot))
            .collect();
        let cache = PromptCache::new(config.cache_budget_bytes, config.cache_max_items);
        Self {
            config,
            runtime,
            shared,
            slots,
            cache,
            deferred: VecDeque::new(),
            metrics: Default::default(),
            batch: Default::default(),
        }
    }

    pub fn run(mut self) {
        log::info!(
            "[scheduler] start [slots: {}][n_ctx_slot: {}][n_batch: {}]",
            self.slots.len(),
            self.shared.limits.n_ctx_slot,
            self.config.n_batch
        );
        self.publish();

        while !self.shared.is_shutdown() {
            if self.is_idle() {
                let Some(task) = self.shared.tasks.pop_timeout(self.config.idle_wait) else {
                    continue;
                };
                self.process_task(task);
            }
            self.tick();
        }

        self.abort_all();
        log::info!("[scheduler] exit");
    }

    fn is_idle(&self) -> bool {
        self.deferred.is_empty() && self.slots.iter().all(Slot::is_idle)
    }

    /// One iteration of the loop: admit, prepare, decode one batch, distribute, publish.
    pub fn tick(&mut self) {
        self.reap_cancelled();
        self.admit();

        for index in 0..self.slots.len() {
            if self.slots[index].state() == SlotState::Started {
                if let Err(err) = self.prepare(index) {
                    self.fail(index, err);
                }
            }
        }
        for index in 0..self.slots.len() {
            if self.slots[index].state() == SlotState::Generating {
                self.make_room(index);
            }
        }

        let spans = self.build_batch();
        if !spans.is_empty() {
            self.decode(spans);
        }
        self.publish();
    }

    fn send(&self, result: TaskResult) {
        self.shared.results.push(result);
    }

    fn reap_cancelled(&mut self) {
        for index in 0..self.slots.len() {
            let cancelled = self.slots[index]
                .bound
                .as_ref()
                .is_some_and(|bound| bound.task.is_cancelled());
            if cancelled {
                log::info!(
                    "[slot: {index}][cancel][task: {:?}]",
                    self.slots[index].task_id()
                );
                if let Some(id) = self.slots[index].task_id() {
                    self.shared.results.remove_waiting(id);
                }
                self.release(index);
            }
        }

        let results = &self.shared.results;
        self.deferred.retain(|task| match task.is_cancelled() {
            true => {
                results.remove_waiting(task.id);
                false
            }
            false => true,
        });
    }

    fn admit(&mut self) {
        let deferred = std::mem::take(&mut self.deferred);
        for task in deferred {
            self.process_task(task);
        }
        while let Some(task) = self.shared.tasks.try_pop() {
            self.process_task(task);
        }
    }

    fn process_task(&mut self, task: Task) {
        if task.is_cancelled() {
            log::info!("[queue][drop][task: {}] cancelled", task.id);
            self.shared.results.remove_waiting(task.id);
            return;
        }

        if let TaskKind::Metrics { reset_bucket } = task.kind {
            let metrics = self.snapshot();
            if reset_bucket {
                self.metrics.reset_bucket();
            }
            let result = MetricsResult {
                task_id: task.id,
                metrics,
            };
            self.send(TaskResult::Metrics(result));
            return;
        }

        if let Some(slot) = task.kind.target_slot() {
            let index = slot as usize;
            match self.slots.get(index).map(Slot::is_idle) {
                Some(true) => self.slot_op(index, task),
                Some(false) => self.deferred.push_back(task),
                None => {
                    let err = ServerError::not_found(format!("slot {slot} does not exist"));
                    self.send(TaskResult::error(task.id, err));
                }
            }
            return;
        }

        match self.get_available_slot(&task) {
            Some(choice) => {
                let index = choice.slot();
                log::info!("[queue][{choice}][slot: {index}][task: {}]", task.id);
                self.slots[index].bind(Box::new(Bound::new(task)));
            }
            None => {
                log::debug!("[queue][defer][task: {}]", task.id);
                self.deferred.push_back(task);
            }
        }
    }

    fn reuses_prefix(&self, task: &Task) -> bool {
        self.config.cache_prompt && task.params.cache_prompt && task.kind.is_generation()
    }

    /// Find the best idle slot by:
    /// 1. the slot whose history shares the largest part with the prompt (continue);
    /// 2. an empty slot;
    /// 3. the least recently used non-empty slot.
    ///
    /// Ties go to the slot released longest ago, then to the lowest id.
    fn get_available_slot(&self, task: &Task) -> Option<SlotChoice> {
        let reuse = self.reuses_prefix(task);
        let prompt = task.input.tokens();
        let threshold = self.config.slot_prompt_similarity;

        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_idle())
            .map(|(index, slot)| {
                let choice = match (slot.history.is_empty(), reuse) {
                    (true, _) => SlotChoice::Empty(index),
                    (false, true) => {
                        let (len, max) = slot.similarity(&prompt);
                        match len > 0 && len as f32 >= threshold * max as f32 {
                            true => SlotChoice::Continue(index, len, max),
                            false => SlotChoice::Back(index),
                        }
                    }
                    (false, false) => SlotChoice::Back(index),
                };
                (choice, slot.last_used, index)
            })
            .max_by(|lhs, rhs| {
                lhs.0
                    .cmp(&rhs.0)
                    .then(rhs.1.cmp(&lhs.1))
                    .then(rhs.2.cmp(&lhs.2))
            })
            .map(|(choice, _, _)| choice)
    }

    /// Decide how much of the memory the bound task keeps and move it on to prompt processing.
    fn prepare(&mut self, index: usize) -> Result<(), ServerError> {
        let reuse = match &self.slots[index].bound {
            Some(bound) => self.reuses_prefix(&bound.task),
            None => return Ok(()),
        };

        let slot = &mut self.slots[index];
        let seq = slot.id;
        let Some(bound) = slot.bound.as_mut() else {
            return Ok(());
        };
        let prompt = &bound.prompt.tokens;

        let mut keep = match reuse {
            true => common_prefix(&slot.history, prompt),
            false => 0,
        };
        if reuse {
            if let Some(hit) = self.cache.lookup(prompt) {
                if hit.len > keep {
                    match self.runtime.restore(seq, &hit.checkpoint.snapshot) {
                        Ok(()) => {
                            log::info!(
                                "[slot: {index}][restore][checkpoint: {}][len: {}]",
                                hit.checkpoint.id,
                                hit.len
                            );
                            slot.history = hit.checkpoint.tokens.0.clone();
                            slot.checkpoint = Some(hit.checkpoint.id);
                            keep = hit.len;
                        }
                        Err(err) => {
                            log::warn!("[slot: {index}][restore] {err}");
                            keep = 0;
                        }
                    }
                }
            }
        }
        // at least one prompt position must be decoded to produce output
        if keep >= prompt.len() {
            keep = prompt.len().saturating_sub(1);
        }

        self.runtime.truncate(seq, keep)?;
        slot.history.truncate(keep);
        if keep == 0 {
            slot.checkpoint = None;
        }

        log::info!(
            "[slot: {index}][prompt][task: {}][cached: {keep}/{}]",
            bound.task.id,
            bound.prompt.len()
        );
        bound.n_cached = keep;
        bound.t_start = Instant::now();
        slot.transition(SlotState::ProcessingPrompt);
        Ok(())
    }

    /// Ensure a generating slot has room for its pending token, shifting or finishing it.
    fn make_room(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        let n_past = slot.history.len();
        if n_past < slot.n_ctx {
            return;
        }
        let Some(bound) = slot.bound.as_mut() else {
            return;
        };

        let n_keep = bound.task.params.n_keep.min(n_past);
        let n_discard = (n_past - n_keep) / 2;
        if self.config.context_shift && n_discard > 0 {
            log::info!("[slot: {index}][shift][keep: {n_keep}][discard: {n_discard}]");
            match self.runtime.shift(slot.id, n_keep, n_discard) {
                Ok(()) => {
                    slot.history.drain(n_keep..n_keep + n_discard);
                    slot.checkpoint = None;
                    bound.shifted = true;
                }
                Err(err) => self.fail(index, err.into()),
            }
            return;
        }

        log::info!("[slot: {index}][full][n_past: {n_past}]");
        self.finish(index, StopType::Limit);
    }

    fn build_batch(&mut self) -> Vec<Span> {
        self.batch.clear();
        let mut spans = vec![];
        let mut budget = self.config.n_batch;
        let mut n_rows = 0;

        // prompt work goes first, lowest slot id first
        for (index, slot) in self.slots.iter().enumerate() {
            if budget == 0 {
                break;
            }
            if slot.state() != SlotState::ProcessingPrompt {
                continue;
            }
            let Some(bound) = slot.bound.as_ref() else {
                continue;
            };

            let start = slot.history.len();
            let n_items = (bound.prompt.len() - start).min(budget);
            let end = start + n_items;
            let done = end == bound.prompt.len();
            let pooling = bound.task.kind.is_pooling();

            let first_item = self.batch.len();
            let first_row = n_rows;
            for pos in start..end {
                let output = match (pooling, done && pos + 1 == end) {
                    (true, _) => OutputKind::Embedding,
                    (false, true) => OutputKind::Logits,
                    (false, false) => OutputKind::None,
                };
                if output != OutputKind::None {
                    n_rows += 1;
                }
                self.batch.push(slot.id, pos, bound.prompt.input(pos), output);
            }

            budget -= n_items;
            spans.push(Span {
                slot: index,
                first_item,
                n_items,
                first_row,
                n_rows: n_rows - first_row,
                prompt: true,
            });
        }

        for (index, slot) in self.slots.iter_mut().enumerate() {
            if budget == 0 {
                break;
            }
            if slot.state() != SlotState::Generating {
                continue;
            }
            let Some(bound) = slot.bound.as_mut() else {
                continue;
            };
            let Some(pending) = bound.pending else {
                continue;
            };

            let pos = slot.history.len();
            let mut room = slot.n_ctx.saturating_sub(pos + 1).min(budget - 1);
            if let Some(n_predict) = bound.task.params.n_predict {
                room = room.min(n_predict.saturating_sub(bound.n_decoded + 1));
            }
            let drafts = match &bound.task.params.speculative {
                Some(params) if room > 0 => {
                    let mut context = slot.history.clone();
                    context.push(pending);
                    speculative::draft(&context, params, room)
                }
                _ => vec![],
            };

            let first_item = self.batch.len();
            self.batch
                .push(slot.id, pos, BatchInput::Token(pending), OutputKind::Logits);
            for (offset, &token) in drafts.iter().enumerate() {
                let pos = pos + 1 + offset;
                self.batch
                    .push(slot.id, pos, BatchInput::Token(token), OutputKind::Logits);
            }

            let n_items = 1 + drafts.len();
            spans.push(Span {
                slot: index,
                first_item,
                n_items,
                first_row: n_rows,
                n_rows: n_items,
                prompt: false,
            });
            n_rows += n_items;
            budget -= n_items;
            bound.drafts = drafts;
        }

        spans
    }

    fn decode(&mut self, spans: Vec<Span>) {
        let expected = self.batch.num_outputs();
        let result = self
            .runtime
            .decode(&self.batch)
            .map_err(ServerError::from)
            .and_then(|output| match output.rows.len() == expected {
                true => Ok(output),
                false => Err(ServerError::runtime(format!(
                    "expected {expected} output rows, got {}",
                    output.rows.len()
                ))),
            });

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                log::error!("[decode][items: {}] {err}", self.batch.len());
                for span in spans {
                    self.fail(span.slot, err.clone());
                }
                return;
            }
        };

        self.metrics.on_decoded(spans.len());
        for span in spans {
            match span.prompt {
                true => self.on_prompt(span, &output),
                false => self.on_generate(span, &output),
            }
        }
    }

    fn on_prompt(&mut self, span: Span, output: &BatchOutput) {
        let index = span.slot;
        let rows = &output.rows[span.first_row..span.first_row + span.n_rows];
        let items = &self.batch.items[span.first_item..span.first_item + span.n_items];

        let slot = &mut self.slots[index];
        slot.history
            .extend(items.iter().map(|item| item.input.token()));
        let Some(bound) = slot.bound.as_mut() else {
            return;
        };
        if bound.task.kind.is_pooling() {
            rows.iter().for_each(|row| bound.pooled.push(row));
        }
        let params = &bound.task.params;
        if params.stream && params.return_progress && !bound.task.kind.is_pooling() {
            let progress = Progress {
                task_id: bound.task.id,
                total: bound.prompt.len(),
                cache: bound.n_cached,
                processed: slot.history.len(),
                time_ms: bound.t_start.elapsed().as_secs_f64() * 1e3,
            };
            self.shared.results.push(TaskResult::Progress(progress));
        }
        if slot.history.len() < bound.prompt.len() {
            return;
        }

        bound.t_prompt_done = Some(Instant::now());
        self.metrics
            .on_prompt_eval(bound.prompt.len() - bound.n_cached, bound.t_start.elapsed());
        let pooling = bound.task.kind.is_pooling();
        slot.transition(SlotState::DonePrompt);

        if pooling {
            self.send_pooled(index);
            return;
        }

        let Some(row) = rows.last() else {
            let err = ServerError::runtime("no logits for the last prompt position");
            self.fail(index, err);
            return;
        };
        let slot = &mut self.slots[index];
        let Some(bound) = slot.bound.as_mut() else {
            return;
        };
        let token = sample_logits(bound.sampler.as_mut(), row);
        let n_probs = bound.task.params.n_probs;
        slot.transition(SlotState::Generating);

        let probs = (n_probs > 0).then(|| self.token_probs(row, token, n_probs));
        if !self.process_token(index, token, probs) {
            if let Some(bound) = self.slots[index].bound.as_mut() {
                bound.pending = Some(token);
            }
        }
    }

    fn on_generate(&mut self, span: Span, output: &BatchOutput) {
        let index = span.slot;
        let rows = &output.rows[span.first_row..span.first_row + span.n_rows];
        let decoded = self.batch.items[span.first_item].pos + span.n_items;

        let slot = &mut self.slots[index];
        let seq = slot.id;
        let Some(bound) = slot.bound.as_mut() else {
            return;
        };
        let Some(pending) = bound.pending.take() else {
            return;
        };
        let drafts = std::mem::take(&mut bound.drafts);
        bound.n_draft += drafts.len();
        slot.history.push(pending);

        let mut accepted = 0;
        for (offset, row) in rows.iter().enumerate() {
            let Some(bound) = self.slots[index].bound.as_mut() else {
                break;
            };
            let token = sample_logits(bound.sampler.as_mut(), row);
            let n_probs = bound.task.params.n_probs;
            let probs = (n_probs > 0).then(|| self.token_probs(row, token, n_probs));
            if self.process_token(index, token, probs) {
                break;
            }

            let slot = &mut self.slots[index];
            let Some(bound) = slot.bound.as_mut() else {
                break;
            };
            match drafts.get(offset) {
                Some(&draft) if draft == token => {
                    slot.history.push(draft);
                    bound.n_draft_accepted += 1;
                    accepted += 1;
                }
                _ => {
                    bound.pending = Some(token);
                    break;
                }
            }
        }
        if !drafts.is_empty() {
            log::debug!("[slot: {index}][draft][accepted: {accepted}/{}]", drafts.len());
            self.metrics.on_draft(drafts.len(), accepted);
        }

        // rejected drafts are still in memory
        let n_past = self.slots[index].history.len();
        if n_past < decoded {
            if let Err(err) = self.runtime.truncate(seq, n_past) {
                match self.slots[index].bound.is_some() {
                    true => self.fail(index, err.into()),
                    false => {
                        log::error!("[slot: {index}][truncate] {err}");
                        self.slots[index].history.clear();
                    }
                }
            }
        }
    }

    /// Probabilities of `token` and of the `n_probs` best candidates in the raw logits.
    fn token_probs(&self, logits: &[f32], token: u32, n_probs: usize) -> TokenProbs {
        let probs = softmax(logits);
        let top = probs
            .iter()
            .enumerate()
            .sorted_by(|(_, x), (_, y)| y.total_cmp(x))
            .take(n_probs)
            .map(|(id, &prob)| {
                let piece = self.runtime.token_piece(id as u32);
                TokenProb {
                    token: id as u32,
                    piece: String::from_utf8_lossy(&piece).into_owned(),
                    prob,
                }
            })
            .collect();
        TokenProbs {
            token,
            prob: probs.get(token as usize).copied().unwrap_or_default(),
            top,
        }
    }

    /// Append a sampled token to the output of the slot. Returns `true` if the task finished.
    fn process_token(&mut self, index: usize, token: u32, probs: Option<TokenProbs>) -> bool {
        let eog = self.runtime.is_eog(token);
        let piece = match eog {
            true => vec![],
            false => self.runtime.token_piece(token),
        };

        let slot = &mut self.slots[index];
        let Some(bound) = slot.bound.as_mut() else {
            return true;
        };
        bound.n_decoded += 1;
        bound.generated.tokens.push(token);
        bound.probs.extend(probs);

        let mut stop = match eog {
            true => Some(StopType::Eos),
            false => None,
        };
        if !eog {
            match bound.generated.push(&piece, &bound.task.params.stop) {
                Emit::Stop(word) => stop = Some(StopType::Word(word)),
                Emit::Send(content_delta) if bound.task.params.stream => {
                    let timings = bound
                        .task
                        .params
                        .emit_timings_per_token
                        .then(|| bound.timings());
                    let partial = Partial {
                        task_id: bound.task.id,
                        content_delta,
                        token,
                        n_decoded: bound.n_decoded,
                        probs: std::mem::take(&mut bound.probs),
                        timings,
                    };
                    self.shared.results.push(TaskResult::Partial(partial));
                }
                Emit::Send(_) | Emit::Hold => {}
            }
        }

        let limit = bound
            .task
            .params
            .n_predict
            .is_some_and(|n_predict| bound.n_decoded >= n_predict);
        if stop.is_none() && limit {
            stop = Some(StopType::Limit);
        }

        match stop {
            Some(stop) => {
                self.finish(index, stop);
                true
            }
            None => false,
        }
    }

    fn finish(&mut self, index: usize, stop: StopType) {
        let slot = &mut self.slots[index];
        let n_past = slot.history.len();
        let Some(bound) = slot.bound.as_mut() else {
            return;
        };

        let timings = bound.timings();
        let content = match bound.task.params.stream {
            true => bound.generated.flush(),
            false => bound.generated.text(),
        };
        log::info!(
            "[slot: {index}][finish][task: {}][stop: {stop:?}][prompt: {}][cached: {}][decoded: {}]",
            bound.task.id,
            bound.prompt.len(),
            timings.cache_n,
            timings.predicted_n,
        );

        let elapsed = bound
            .t_prompt_done
            .map(|instant| instant.elapsed())
            .unwrap_or_default();
        self.metrics
            .on_prediction(timings.predicted_n, elapsed, n_past);

        let result = Final {
            task_id: bound.task.id,
            content,
            tokens: std::mem::take(&mut bound.generated.tokens),
            probs: std::mem::take(&mut bound.probs),
            stop,
            n_prompt: bound.prompt.len(),
            timings,
        };
        self.shared.results.push(TaskResult::Final(result));
        self.release(index);
    }

    fn send_pooled(&mut self, index: usize) {
        let slot = &mut self.slots[index];
        let Some(bound) = slot.bound.as_mut() else {
            return;
        };

        let pooled = std::mem::take(&mut bound.pooled);
        let task_id = bound.task.id;
        let result = match bound.task.kind {
            TaskKind::Rerank { index: document } => {
                let vector = pooled.finish(self.config.pooling, false);
                let score = vector.first().copied().unwrap_or_default();
                TaskResult::Rerank(Rerank {
                    task_id,
                    index: document,
                    score,
                })
            }
            _ => {
                let vector = pooled.finish(self.config.pooling, self.config.normalize_embeddings);
                TaskResult::Embedding(Embedding {
                    task_id,
                    vector,
                    n_prompt: bound.prompt.len(),
                })
            }
        };
        self.shared.results.push(result);
        self.release(index);
    }

    /// Checkpoint the prompt part of the slot memory if it is worth keeping.
    fn save_checkpoint(&mut self, index: usize) {
        let slot = &self.slots[index];
        let Some(bound) = slot.bound.as_ref() else {
            return;
        };
        if !self.reuses_prefix(&bound.task)
            || bound.shifted
            || slot.state() == SlotState::Started
        {
            return;
        }

        let len = slot.history.len().min(bound.prompt.len());
        let tokens = &slot.history[..len];
        if len < self.config.min_checkpoint_tokens.max(1)
            || reusable(tokens).len() < len
            || self.cache.contains(tokens)
        {
            return;
        }

        match self.runtime.snapshot(slot.id, len) {
            Ok(snapshot) => {
                self.cache.save(Tokens(tokens.to_vec()), snapshot);
            }
            Err(err) => log::warn!("[slot: {index}][checkpoint] {err}"),
        }
    }

    /// Return the slot to idle, keeping its memory for later reuse where that is sound.
    fn release(&mut self, index: usize) {
        self.save_checkpoint(index);

        let slot = &mut self.slots[index];
        let keep = match slot.bound.as_ref() {
            Some(bound) if bound.task.kind.is_pooling() => Some(0),
            Some(bound) if bound.shifted => Some(bound.task.params.n_keep),
            _ => None,
        };
        if let Some(keep) = keep {
            let keep = keep.min(slot.history.len());
            slot.history.truncate(keep);
            if let Err(err) = self.runtime.truncate(slot.id, keep) {
                log::error!("[slot: {index}][truncate] {err}");
                slot.history.clear();
            }
            slot.checkpoint = None;
        }

        if let Some(bound) = slot.release() {
            log::info!(
                "[slot: {index}][release][task: {}][n_past: {}]",
                bound.task.id,
                slot.history.len()
            );
        }
    }

    /// Report an error for the task bound to the slot, then wipe and release the slot.
    fn fail(&mut self, index: usize, err: ServerError) {
        let slot = &mut self.slots[index];
        if let Some(task_id) = slot.task_id() {
            log::error!("[slot: {index}][task: {task_id}] {err}");
            self.shared.results.push(TaskResult::error(task_id, err));
        }
        self.metrics.on_error();

        if let Err(err) = self.runtime.truncate(slot.id, 0) {
            log::error!("[slot: {index}][truncate] {err}");
        }
        slot.history.clear();
        slot.checkpoint = None;
        if !slot.is_idle() {
            slot.release();
        }
    }

    fn slot_op(&mut self, index: usize, task: Task) {
        let start = Instant::now();
        let result = match &task.kind {
            TaskKind::SlotSave(op) => self.save_slot(index, &op.filename),
            TaskKind::SlotRestore(op) => self.restore_slot(index, &op.filename),
            TaskKind::SlotErase { .. } => self.erase_slot(index),
            _ => return,
        };

        let result = match result {
            Ok((n_tokens, n_bytes)) => TaskResult::SlotOp(SlotOpResult {
                task_id: task.id,
                slot: index as u32,
                n_tokens,
                n_bytes,
                elapsed: start.elapsed(),
            }),
            Err(err) => {
                log::warn!("[slot: {index}][task: {}] {err}", task.id);
                TaskResult::error(task.id, err)
            }
        };
        self.send(result);
    }

    fn save_slot(&mut self, index: usize, filename: &str) -> Result<(usize, usize), ServerError> {
        let path = self.shared.limits.slot_path(filename)?;
        let slot = &self.slots[index];
        let snapshot = self.runtime.snapshot(slot.id, slot.history.len())?;
        let file = SlotFile::new(slot.history.clone(), snapshot);
        let n_bytes = file.save(&path).map_err(|err| {
            ServerError::runtime(format!("failed to write {}: {err}", path.display()))
        })?;
        log::info!(
            "[slot: {index}][save][tokens: {}] {}",
            slot.history.len(),
            path.display()
        );
        Ok((slot.history.len(), n_bytes))
    }

    fn restore_slot(
        &mut self,
        index: usize,
        filename: &str,
    ) -> Result<(usize, usize), ServerError> {
        let path = self.shared.limits.slot_path(filename)?;
        if !path.exists() {
            return Err(ServerError::not_found(format!(
                "slot file {} does not exist",
                path.display()
            )));
        }
        let (file, n_bytes) = SlotFile::load(&path).map_err(|err| {
            ServerError::invalid(format!("failed to read {}: {err}", path.display()))
        })?;

        let slot = &mut self.slots[index];
        if file.tokens.len() > slot.n_ctx {
            return Err(ServerError::invalid(format!(
                "slot file holds {} tokens but a slot holds {}",
                file.tokens.len(),
                slot.n_ctx
            )));
        }

        slot.checkpoint = None;
        if let Err(err) = self.runtime.restore(slot.id, &file.snapshot()) {
            slot.history.clear();
            if let Err(err) = self.runtime.truncate(slot.id, 0) {
                log::warn!("[slot: {index}][truncate] {err}");
            }
            return Err(err.into());
        }
        slot.history = file.tokens;
        log::info!(
            "[slot: {index}][restore][tokens: {}] {}",
            slot.history.len(),
            path.display()
        );
        Ok((slot.history.len(), n_bytes))
    }

    fn erase_slot(&mut self, index: usize) -> Result<(usize, usize), ServerError> {
        let slot = &mut self.slots[index];
        let n_tokens = slot.history.len();
        self.runtime.truncate(slot.id, 0)?;
        slot.history.clear();
        slot.checkpoint = None;
        log::info!("[slot: {index}][erase][tokens: {n_tokens}]");
        Ok((n_tokens, 0))
    }

    fn snapshot(&self) -> MetricsSnapshot {
        let gauges = Gauges {
            queued: self.shared.tasks.len(),
            deferred: self.deferred.len(),
            cache_items: self.cache.len(),
            cache_bytes: self.cache.size_bytes(),
        };
        let slots = self.slots.iter().map(Slot::info).collect();
        self.metrics.snapshot(gauges, slots)
    }

    fn publish(&mut self) {
        *self.shared.metrics.write() = self.snapshot();
    }

    /// Fail everything still in flight when the scheduler stops.
    /// Tasks submitted from here on are refused by the closed queue.
    fn abort_all(&mut self) {
        self.shared.tasks.close();
        let err = ServerError::shutdown();
        for index in 0..self.slots.len() {
            let slot = &mut self.slots[index];
            if let Some(task_id) = slot.task_id() {
                self.shared
                    .results
                    .push(TaskResult::error(task_id, err.clone()));
                slot.release();
            }
        }
        for task in self.deferred.drain(..) {
            self.shared
                .results
                .push(TaskResult::error(task.id, err.clone()));
        }
        while let Some(task) = self.shared.tasks.try_pop() {
            self.shared
                .results
                .push(TaskResult::error(task.id, err.clone()));
        }
        self.publish();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use flume::Receiver;

    use super::*;
    use crate::{
        dummy::{DummyConfig, DummyRuntime},
        sampler::SamplerParams,
        serve::Limits,
        speculative::SpeculativeParams,
        TaskParams,
    };

    fn scheduler(config: SchedulerConfig, dummy: DummyConfig) -> Scheduler<DummyRuntime> {
        let runtime = DummyRuntime::new(dummy);
        let limits = Limits {
            n_slots: config.n_slots,
            n_ctx_slot: runtime.n_ctx() / config.n_slots,
            n_embd: runtime.n_embd(),
            vocab_size: runtime.vocab_size(),
            slot_save_path: None,
        };
        let shared = Arc::new(Shared::new(limits, Duration::from_millis(5)));
        Scheduler::new(config, runtime, shared)
    }

    fn config(n_slots: usize, n_batch: usize) -> SchedulerConfig {
        SchedulerConfig {
            n_slots,
            n_batch,
            min_checkpoint_tokens: 4,
            ..Default::default()
        }
    }

    fn greedy(n_predict: usize) -> TaskParams {
        TaskParams {
            sampler: SamplerParams::greedy(),
            n_predict: Some(n_predict),
            ..Default::default()
        }
    }

    fn post(scheduler: &Scheduler<DummyRuntime>, task: Task) -> Receiver<TaskResult> {
        let (sender, receiver) = flume::unbounded();
        scheduler
            .shared
            .results
            .add_waiting(task.id, sender, task.cancel.clone())
            .unwrap();
        scheduler.shared.submit(task);
        receiver
    }

    fn completion(
        scheduler: &Scheduler<DummyRuntime>,
        prompt: Vec<u32>,
        params: TaskParams,
    ) -> Receiver<TaskResult> {
        let id = scheduler.shared.tasks.new_id();
        post(scheduler, Task::completion(id, prompt, params))
    }

    fn run_until_idle(scheduler: &mut Scheduler<DummyRuntime>) {
        for _ in 0..10_000 {
            scheduler.tick();
            if scheduler.is_idle() && scheduler.shared.tasks.is_empty() {
                return;
            }
        }
        panic!("scheduler did not become idle");
    }

    fn final_of(receiver: &Receiver<TaskResult>) -> Final {
        let results: Vec<_> = receiver.try_iter().collect();
        match results.last() {
            Some(TaskResult::Final(result)) => result.clone(),
            other => panic!("expected a final result, got {other:?}"),
        }
    }

    #[test]
    fn slot_choice_priority() {
        assert!(SlotChoice::Continue(3, 2, 4) > SlotChoice::Continue(0, 1, 4));
        assert!(SlotChoice::Continue(3, 1, 100) > SlotChoice::Empty(0));
        assert!(SlotChoice::Empty(2) > SlotChoice::Back(0));
        assert_eq!(SlotChoice::Continue(0, 1, 2), SlotChoice::Continue(1, 2, 4));
    }

    #[test]
    fn fresh_slots_are_taken_lowest_id_first() {
        let mut scheduler = scheduler(config(4, 64), Default::default());
        let ids: Vec<_> = (0..4u32)
            .map(|n| {
                let id = scheduler.shared.tasks.new_id();
                post(&scheduler, Task::completion(id, vec![10 + n], greedy(50)));
                id
            })
            .collect();
        scheduler.tick();

        let bound: Vec<_> = scheduler.slots.iter().map(Slot::task_id).collect();
        assert_eq!(bound, ids.into_iter().map(Some).collect::<Vec<_>>());
    }

    #[test]
    fn least_recently_used_slot_is_reused() {
        let mut scheduler = scheduler(config(2, 64), Default::default());
        let slot_of = |scheduler: &Scheduler<DummyRuntime>| {
            scheduler.slots.iter().position(|slot| !slot.is_idle())
        };

        let _a = completion(&scheduler, vec![1, 2, 3], greedy(2));
        scheduler.tick();
        assert_eq!(slot_of(&scheduler), Some(0));
        run_until_idle(&mut scheduler);

        // an empty slot beats a used one
        let _b = completion(&scheduler, vec![4, 5, 6], greedy(2));
        scheduler.tick();
        assert_eq!(slot_of(&scheduler), Some(1));
        run_until_idle(&mut scheduler);

        // neither history matches, so the slot released first goes
        let _c = completion(&scheduler, vec![7, 8, 9], greedy(2));
        scheduler.tick();
        assert_eq!(slot_of(&scheduler), Some(0));
        run_until_idle(&mut scheduler);

        let _d = completion(&scheduler, vec![200, 201], greedy(2));
        scheduler.tick();
        assert_eq!(slot_of(&scheduler), Some(1));
    }

    #[test]
    fn prompts_share_the_batch_in_slot_order() {
        let mut scheduler = scheduler(config(2, 6), Default::default());
        let stats = scheduler.runtime.stats();
        let _a = completion(&scheduler, vec![1, 2, 3, 4, 5], greedy(10));
        let _b = completion(&scheduler, vec![21, 22, 23, 24, 25], greedy(10));

        scheduler.tick();
        assert_eq!(scheduler.slots[0].state(), SlotState::Generating);
        assert_eq!(scheduler.slots[0].history.len(), 5);
        assert_eq!(scheduler.slots[1].state(), SlotState::ProcessingPrompt);
        assert_eq!(scheduler.slots[1].history.len(), 1);
        assert_eq!(stats.max_batch(), 6);

        scheduler.tick();
        assert_eq!(scheduler.slots[1].history.len(), 5);
        assert_eq!(scheduler.slots[0].history.len(), 6);
        assert_eq!(stats.decode_calls(), 2);
    }

    #[test]
    fn prompt_is_split_by_batch_budget() {
        let mut scheduler = scheduler(config(1, 4), Default::default());
        let receiver = completion(&scheduler, (1..=10).collect(), greedy(1));
        let stats = scheduler.runtime.stats();

        scheduler.tick();
        assert_eq!(scheduler.slots[0].state(), SlotState::ProcessingPrompt);
        assert_eq!(scheduler.slots[0].history.len(), 4);
        scheduler.tick();
        assert_eq!(scheduler.slots[0].history.len(), 8);
        scheduler.tick();
        assert!(scheduler.slots[0].is_idle());
        assert_eq!(stats.decode_calls(), 3);
        assert!(stats.max_batch() <= 4);

        let result = final_of(&receiver);
        assert_eq!(result.stop, StopType::Limit);
        assert_eq!(result.tokens.len(), 1);
    }

    #[test]
    fn prompt_work_goes_before_generation() {
        let mut scheduler = scheduler(config(2, 6), Default::default());
        let _a = completion(&scheduler, vec![1, 2, 3], greedy(10));
        scheduler.tick();
        assert_eq!(scheduler.slots[0].state(), SlotState::Generating);
        assert_eq!(scheduler.slots[0].history.len(), 3);

        let _b = completion(&scheduler, (1..=8).map(|x| x + 20).collect(), greedy(10));
        scheduler.tick();
        assert_eq!(scheduler.slots[1].history.len(), 6);
        assert_eq!(scheduler.slots[0].history.len(), 3);

        scheduler.tick();
        assert_eq!(scheduler.slots[1].history.len(), 8);
        assert_eq!(scheduler.slots[0].history.len(), 4);
    }

    #[test]
    fn cancelled_task_frees_its_slot() {
        let mut scheduler = scheduler(config(1, 16), Default::default());
        let receiver = completion(&scheduler, vec![1, 2, 3], greedy(100));
        scheduler.tick();
        scheduler.tick();
        let id = scheduler.slots[0].task_id().unwrap();
        let _ = receiver.try_iter().count();

        assert!(scheduler.shared.results.cancel(id));
        scheduler.tick();
        assert!(scheduler.slots[0].is_idle());
        assert!(receiver.try_iter().all(|result| !result.is_terminal()));
    }

    #[test]
    fn deferred_tasks_run_in_order() {
        let mut scheduler = scheduler(config(1, 64), Default::default());
        let a = completion(&scheduler, vec![1, 2, 3], greedy(3));
        let b = completion(&scheduler, vec![4, 5, 6], greedy(3));
        scheduler.tick();
        assert_eq!(scheduler.deferred.len(), 1);

        run_until_idle(&mut scheduler);
        let a = final_of(&a);
        let b = final_of(&b);
        assert_eq!(a.tokens, DummyRuntime::generate(&[1, 2, 3], 3, None));
        assert_eq!(b.tokens, DummyRuntime::generate(&[4, 5, 6], 3, None));
        assert_eq!(scheduler.shared.results.num_waiting(), 0);
    }

    #[test]
    fn cancelled_routes_are_released_with_their_tasks() {
        let mut scheduler = scheduler(config(1, 64), Default::default());
        let a = completion(&scheduler, vec![1, 2, 3], greedy(100));
        let b = completion(&scheduler, vec![4, 5, 6], greedy(100));
        scheduler.tick();
        let a_id = scheduler.slots[0].task_id().unwrap();
        let b_id = scheduler.deferred[0].id;

        scheduler.shared.results.cancel(a_id);
        scheduler.shared.results.cancel(b_id);
        assert_eq!(scheduler.shared.results.num_waiting(), 2);
        scheduler.tick();
        assert!(scheduler.is_idle());
        assert_eq!(scheduler.shared.results.num_waiting(), 0);
        assert!(a.try_iter().chain(b.try_iter()).all(|result| !result.is_terminal()));
    }

    #[test]
    fn progress_is_reported_per_prompt_chunk() {
        let mut scheduler = scheduler(config(1, 4), Default::default());
        let params = TaskParams {
            return_progress: true,
            ..greedy(1)
        };
        let receiver = completion(&scheduler, (1..=10).collect(), params);
        run_until_idle(&mut scheduler);

        let results: Vec<_> = receiver.try_iter().collect();
        assert_eq!(results.len(), 5);
        let processed: Vec<_> = results[..3]
            .iter()
            .map(|result| match result {
                TaskResult::Progress(progress) => {
                    assert_eq!(progress.total, 10);
                    assert_eq!(progress.cache, 0);
                    progress.processed
                }
                other => panic!("expected progress, got {other:?}"),
            })
            .collect();
        assert_eq!(processed, vec![4, 8, 10]);
        assert!(matches!(results[3], TaskResult::Partial(_)));
        assert!(matches!(results[4], TaskResult::Final(_)));
    }

    #[test]
    fn token_probabilities_follow_each_token() {
        let mut scheduler = scheduler(config(1, 64), Default::default());
        let params = TaskParams {
            n_probs: 2,
            ..greedy(3)
        };
        let receiver = completion(&scheduler, vec![1, 2, 3], params);
        run_until_idle(&mut scheduler);

        let results: Vec<_> = receiver.try_iter().collect();
        assert_eq!(results.len(), 4);
        for result in &results[..3] {
            let TaskResult::Partial(partial) = result else {
                panic!("expected a partial, got {result:?}");
            };
            let [probs] = &partial.probs[..] else {
                panic!("expected one token, got {:?}", partial.probs);
            };
            assert_eq!(probs.token, partial.token);
            assert!(probs.prob > 0.99);
            assert_eq!(probs.top.len(), 2);
            assert_eq!(probs.top[0].token, partial.token);
            assert_eq!(probs.top[0].piece, partial.content_delta);
            assert!(probs.top[1].prob < 1e-3);
        }
        assert!(final_of(&receiver).probs.is_empty());

        let params = TaskParams {
            n_probs: 1,
            stream: false,
            ..greedy(3)
        };
        let receiver = completion(&scheduler, vec![7, 8, 9], params);
        run_until_idle(&mut scheduler);
        let result = final_of(&receiver);
        let tokens: Vec<_> = result.probs.iter().map(|probs| probs.token).collect();
        assert_eq!(tokens, result.tokens);
        assert!(result.probs.iter().all(|probs| probs.top.len() == 1));
    }

    #[test]
    fn metrics_task_resets_the_bucket() {
        let mut scheduler = scheduler(config(1, 64), Default::default());
        let a = completion(&scheduler, vec![1, 2, 3, 4], greedy(5));
        run_until_idle(&mut scheduler);
        final_of(&a);

        let read = |scheduler: &mut Scheduler<DummyRuntime>, reset| {
            let id = scheduler.shared.tasks.new_id();
            let receiver = post(scheduler, Task::metrics(id, reset));
            scheduler.tick();
            match receiver.try_iter().collect::<Vec<_>>().as_slice() {
                [TaskResult::Metrics(result)] => result.metrics.clone(),
                other => panic!("expected metrics, got {other:?}"),
            }
        };
        let first = read(&mut scheduler, true);
        assert_eq!(first.n_prompt_tokens_processed, 4);
        assert_eq!(first.n_tokens_predicted, 5);

        let second = read(&mut scheduler, false);
        assert_eq!(second.n_prompt_tokens_processed, 0);
        assert_eq!(second.n_tokens_predicted, 0);
        assert_eq!(second.n_prompt_tokens_total, 4);
        assert_eq!(second.n_tokens_predicted_total, 5);
    }

    #[test]
    fn speculative_decoding_matches_plain_decoding() {
        let prompt = DummyRuntime::tokenize("abcabcabcabc");
        let mut plain = scheduler(config(1, 64), Default::default());
        let receiver = completion(&plain, prompt.clone(), greedy(40));
        run_until_idle(&mut plain);
        let expected = final_of(&receiver);

        let mut fast = scheduler(config(1, 64), Default::default());
        let params = TaskParams {
            speculative: Some(SpeculativeParams {
                n_max: 4,
                n_min: 1,
                ngram: 2,
            }),
            ..greedy(40)
        };
        let receiver = completion(&fast, prompt.clone(), params);
        run_until_idle(&mut fast);
        let result = final_of(&receiver);

        assert_eq!(result.tokens, expected.tokens);
        assert_eq!(result.tokens, DummyRuntime::generate(&prompt, 40, None));
        assert!(result.timings.draft_accepted_n <= result.timings.draft_n);
        assert_eq!(
            fast.runtime.memory(0).len(),
            fast.slots[0].history.len()
        );
    }

    #[test]
    fn checkpoint_survives_an_unrelated_task() {
        let mut scheduler = scheduler(config(1, 64), Default::default());
        let shared: Vec<u32> = (10..18).collect();

        let a = completion(&scheduler, [shared.clone(), vec![1]].concat(), greedy(4));
        run_until_idle(&mut scheduler);
        final_of(&a);
        assert_eq!(scheduler.cache.len(), 1);

        let c = completion(&scheduler, vec![200; 6], greedy(4));
        run_until_idle(&mut scheduler);
        assert_eq!(final_of(&c).timings.cache_n, 0);

        let prompt = [shared.clone(), vec![2]].concat();
        let b = completion(&scheduler, prompt.clone(), greedy(4));
        run_until_idle(&mut scheduler);
        let b = final_of(&b);
        assert_eq!(b.timings.cache_n, shared.len());
        assert_eq!(b.timings.prompt_n, 1);
        assert_eq!(b.tokens, DummyRuntime::generate(&prompt, 4, None));
    }

    #[test]
    fn context_shift_keeps_generating() {
        let dummy = DummyConfig {
            n_ctx: 32,
            ..Default::default()
        };
        let mut scheduler = scheduler(config(1, 64), dummy);
        let params = TaskParams {
            n_keep: 4,
            ..greedy(60)
        };
        let receiver = completion(&scheduler, (1..=10).collect(), params);
        run_until_idle(&mut scheduler);

        let result = final_of(&receiver);
        assert_eq!(result.stop, StopType::Limit);
        assert_eq!(result.tokens.len(), 60);
        assert!(scheduler.slots[0].history.len() <= 4);
        assert!(scheduler.cache.is_empty());
    }

    #[test]
    fn full_slot_without_shift_stops_at_limit() {
        let dummy = DummyConfig {
            n_ctx: 32,
            ..Default::default()
        };
        let config = SchedulerConfig {
            context_shift: false,
            ..config(1, 64)
        };
        let mut scheduler = scheduler(config, dummy);
        let receiver = completion(&scheduler, (1..=10).collect(), greedy(60));
        run_until_idle(&mut scheduler);

        let result = final_of(&receiver);
        assert_eq!(result.stop, StopType::Limit);
        assert_eq!(result.tokens.len(), 32 - 10 + 1);
    }
}
