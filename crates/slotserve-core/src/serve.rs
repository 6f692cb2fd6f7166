use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use anyhow::{bail, Result};
use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;

use crate::{
    config::SchedulerConfig,
    metrics::MetricsSnapshot,
    queue::{ResultQueue, TaskQueue},
    run::Scheduler,
    runtime::{ModelRuntime, NULL_TOKEN},
    slot::build_path,
    ServerError, Task, TaskId, TaskKind, TaskResult,
};

/// Static facts about the runtime used to validate tasks before they are queued.
#[derive(Debug, Clone)]
pub struct Limits {
    pub n_slots: usize,
    pub n_ctx_slot: usize,
    pub n_embd: usize,
    pub vocab_size: usize,
    pub slot_save_path: Option<PathBuf>,
}

impl Limits {
    pub fn validate(&self, task: &Task) -> Result<(), ServerError> {
        if let TaskKind::Metrics { .. } = task.kind {
            return Ok(());
        }
        if let Some(slot) = task.kind.target_slot() {
            if slot as usize >= self.n_slots {
                return Err(ServerError::not_found(format!("slot {slot} does not exist")));
            }
            if let TaskKind::SlotSave(op) | TaskKind::SlotRestore(op) = &task.kind {
                self.slot_path(&op.filename)?;
            }
            return Ok(());
        }

        let n_tokens = task.input.n_tokens();
        if n_tokens == 0 {
            return Err(ServerError::invalid("prompt is empty"));
        }
        if n_tokens > self.n_ctx_slot {
            return Err(ServerError::invalid(format!(
                "prompt has {n_tokens} tokens but a slot holds {}",
                self.n_ctx_slot
            )));
        }

        for chunk in &task.input.chunks {
            match chunk {
                crate::PromptChunk::Text(tokens) => {
                    let invalid = tokens
                        .iter()
                        .find(|&&token| token == NULL_TOKEN || token as usize >= self.vocab_size);
                    if let Some(token) = invalid {
                        return Err(ServerError::invalid(format!("token {token} out of vocabulary")));
                    }
                }
                crate::PromptChunk::Media(media) => {
                    if media.embd.len() != media.n_tokens * self.n_embd {
                        return Err(ServerError::invalid(format!(
                            "media {} has {} floats, expected {} x {}",
                            media.id,
                            media.embd.len(),
                            media.n_tokens,
                            self.n_embd
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn slot_path(&self, filename: &str) -> Result<PathBuf, ServerError> {
        let Some(dir) = &self.slot_save_path else {
            return Err(ServerError::invalid("slot save path is not configured"));
        };
        build_path(dir, filename).map_err(|err| ServerError::invalid(err.to_string()))
    }
}

/// State shared between the scheduler thread and its clients.
#[derive(Debug)]
pub struct Shared {
    pub tasks: TaskQueue,
    pub results: ResultQueue,
    pub metrics: RwLock<MetricsSnapshot>,
    pub limits: Limits,
    pub poll_interval: Duration,
    shutdown: AtomicBool,
}

impl Shared {
    pub fn new(limits: Limits, poll_interval: Duration) -> Self {
        Self {
            tasks: TaskQueue::new(),
            results: ResultQueue::new(poll_interval),
            metrics: Default::default(),
            limits,
            poll_interval,
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Validate and enqueue. The route for `task.id` must already be registered,
    /// since rejections are delivered through it.
    pub(crate) fn submit(&self, task: Task) {
        let id = task.id;
        if let Err(err) = self.limits.validate(&task) {
            log::warn!("[submit][reject][task: {id}] {err}");
            self.results.push(TaskResult::error(id, err));
            return;
        }
        if let Err(task) = self.tasks.post(task) {
            log::warn!("[submit][reject][task: {}] queue closed", task.id);
            self.results.push(TaskResult::error(task.id, ServerError::shutdown()));
        }
    }
}

/// Handle to a running scheduler. Dropping it stops the scheduler thread.
#[derive(Debug)]
pub struct Server {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Server {
    pub fn spawn<R: ModelRuntime + 'static>(config: SchedulerConfig, runtime: R) -> Result<Self> {
        if config.n_slots == 0 {
            bail!("at least one slot is required");
        }
        if config.n_batch == 0 {
            bail!("batch size must not be zero");
        }
        let n_ctx_slot = runtime.n_ctx() / config.n_slots;
        if n_ctx_slot == 0 {
            bail!(
                "context of {} cannot be split into {} slots",
                runtime.n_ctx(),
                config.n_slots
            );
        }

        let limits = Limits {
            n_slots: config.n_slots,
            n_ctx_slot,
            n_embd: runtime.n_embd(),
            vocab_size: runtime.vocab_size(),
            slot_save_path: config.slot_save_path.clone(),
        };
        let shared = Arc::new(Shared::new(limits, config.poll_interval));

        let scheduler = Scheduler::new(config, runtime, shared.clone());
        let handle = std::thread::Builder::new()
            .name("slotserve-scheduler".into())
            .spawn(move || scheduler.run())?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    pub fn new_id(&self) -> TaskId {
        self.shared.tasks.new_id()
    }

    pub fn limits(&self) -> &Limits {
        &self.shared.limits
    }

    /// Submit a task with its own result route; retrieve results with [`Server::poll`].
    ///
    /// Fails if `task.id` is still pending or its results have not been polled yet.
    /// Every other rejection arrives as the terminal result of the task.
    pub fn submit(&self, task: Task) -> Result<TaskId, ServerError> {
        let id = task.id;
        self.shared.results.add_inbox(id, task.cancel.clone())?;
        self.shared.submit(task);
        Ok(id)
    }

    pub fn poll(
        &self,
        id: TaskId,
        timeout: Duration,
        should_stop: impl Fn() -> bool,
    ) -> Option<TaskResult> {
        self.shared.results.poll(id, timeout, should_stop)
    }

    /// Cancel a task; its slot is released within one tick and no further results arrive.
    pub fn cancel(&self, id: TaskId) -> Result<(), ServerError> {
        match self.shared.results.cancel(id) {
            true => Ok(()),
            false => Err(ServerError::not_found(format!("task {id} is not pending"))),
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.read().clone()
    }

    pub fn reader(&self) -> ResponseReader {
        ResponseReader::new(self.shared.clone())
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("[server] scheduler thread panicked");
            }
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Collects the results of a group of tasks on one channel.
///
/// Dropping the reader cancels every task it posted that has not finished yet.
#[derive(Debug)]
pub struct ResponseReader {
    shared: Arc<Shared>,
    sender: Sender<TaskResult>,
    receiver: Receiver<TaskResult>,
    pending: Vec<TaskId>,
}

impl ResponseReader {
    fn new(shared: Arc<Shared>) -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            shared,
            sender,
            receiver,
            pending: vec![],
        }
    }

    pub fn new_id(&self) -> TaskId {
        self.shared.tasks.new_id()
    }

    /// Fails if `task.id` is already pending anywhere on the server.
    pub fn post_task(&mut self, task: Task) -> Result<TaskId, ServerError> {
        let id = task.id;
        self.shared
            .results
            .add_waiting(id, self.sender.clone(), task.cancel.clone())?;
        self.pending.push(id);
        self.shared.submit(task);
        Ok(id)
    }

    /// Post tasks in order, stopping at the first one refused.
    pub fn post_tasks(
        &mut self,
        tasks: impl IntoIterator<Item = Task>,
    ) -> Result<Vec<TaskId>, ServerError> {
        tasks.into_iter().map(|task| self.post_task(task)).collect()
    }

    /// Tasks posted through this reader that have not produced a terminal result.
    pub fn pending(&self) -> &[TaskId] {
        &self.pending
    }

    pub fn is_pending(&self, id: TaskId) -> bool {
        self.pending.contains(&id)
    }

    /// Block for the next result of any pending task. Returns `None` once every task has
    /// finished or `should_stop` returns true.
    pub fn next(&mut self, should_stop: impl Fn() -> bool) -> Option<TaskResult> {
        loop {
            if self.pending.is_empty() || should_stop() {
                return None;
            }
            match self.receiver.recv_timeout(self.shared.poll_interval) {
                Ok(result) => {
                    if let Some(result) = self.observe(result) {
                        return Some(result);
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    pub async fn next_async(&mut self) -> Option<TaskResult> {
        loop {
            if self.pending.is_empty() {
                return None;
            }
            let result = self.receiver.recv_async().await.ok()?;
            if let Some(result) = self.observe(result) {
                return Some(result);
            }
        }
    }

    /// Wait until every pending task is finished and return their terminal results in
    /// completion order. Partial results are discarded.
    pub fn wait_all(&mut self, should_stop: impl Fn() -> bool) -> Vec<TaskResult> {
        let mut results = vec![];
        while let Some(result) = self.next(&should_stop) {
            if result.is_terminal() {
                results.push(result);
            }
        }
        results
    }

    pub fn cancel(&mut self, id: TaskId) -> Result<(), ServerError> {
        let Some(index) = self.pending.iter().position(|&x| x == id) else {
            return Err(ServerError::not_found(format!("task {id} is not pending")));
        };
        self.pending.swap_remove(index);
        self.shared.results.cancel(id);
        Ok(())
    }

    pub fn cancel_all(&mut self) {
        for id in self.pending.drain(..) {
            self.shared.results.cancel(id);
        }
    }

    fn observe(&mut self, result: TaskResult) -> Option<TaskResult> {
        let id = result.task_id();
        if !self.pending.contains(&id) {
            log::debug!("[reader][stale][task: {id}]");
            return None;
        }
        if result.is_terminal() {
            self.pending.retain(|&x| x != id);
        }
        Some(result)
    }
}

impl Drop for ResponseReader {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
