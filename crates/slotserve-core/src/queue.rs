use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use flume::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::{Mutex, RwLock};

use crate::{ServerError, Task, TaskId, TaskResult};

/// Per-task cancellation flag shared by the task and whoever waits on it.
#[derive(Debug, Default, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Multi-producer queue of tasks consumed by the scheduler thread.
#[derive(Debug)]
pub struct TaskQueue {
    sender: Sender<Task>,
    receiver: Receiver<Task>,
    next_id: AtomicU64,
    closed: RwLock<bool>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        let (sender, receiver) = flume::unbounded();
        Self {
            sender,
            receiver,
            next_id: AtomicU64::new(0),
            closed: RwLock::new(false),
        }
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_id(&self) -> TaskId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Enqueue a task. Once the queue is closed the task is handed back instead.
    pub fn post(&self, task: Task) -> Result<(), Task> {
        let closed = self.closed.read();
        if *closed {
            return Err(task);
        }
        log::debug!("[queue][post][task: {}]", task.id);
        // the receiver lives as long as the queue, so this never fails
        let _ = self.sender.send(task);
        Ok(())
    }

    /// Refuse every later [`TaskQueue::post`]. Tasks posted before stay poppable.
    pub fn close(&self) {
        *self.closed.write() = true;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.read()
    }

    pub fn try_pop(&self) -> Option<Task> {
        match self.receiver.try_recv() {
            Ok(task) => Some(task),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Block for at most `timeout` waiting for a task.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<Task> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

#[derive(Debug, Clone)]
struct Route {
    sender: Sender<TaskResult>,
    cancel: CancelToken,
}

/// Routes results from the scheduler to whoever waits on each task id.
///
/// A route lives until the terminal result of its task is pushed, or until the
/// scheduler drops the cancelled task. While it lives, its id cannot be routed again.
/// Several ids may share one channel; a waiter on that channel sees all of them.
#[derive(Debug)]
pub struct ResultQueue {
    routes: Mutex<HashMap<TaskId, Route>>,
    /// Channels of tasks that are waited on by id, see [`ResultQueue::poll`].
    inboxes: Mutex<HashMap<TaskId, Receiver<TaskResult>>>,
    wake_interval: Duration,
}

impl ResultQueue {
    pub fn new(wake_interval: Duration) -> Self {
        Self {
            routes: Default::default(),
            inboxes: Default::default(),
            wake_interval,
        }
    }

    /// Register a waiter for `id`. Results pushed for `id` are sent into `sender`.
    pub fn add_waiting(
        &self,
        id: TaskId,
        sender: Sender<TaskResult>,
        cancel: CancelToken,
    ) -> Result<(), ServerError> {
        let mut routes = self.routes.lock();
        let inboxes = self.inboxes.lock();
        if routes.contains_key(&id) || inboxes.contains_key(&id) {
            return Err(ServerError::invalid(format!("task {id} is already pending")));
        }
        routes.insert(id, Route { sender, cancel });
        Ok(())
    }

    /// Register `id` with a channel of its own, drained with [`ResultQueue::poll`].
    pub fn add_inbox(&self, id: TaskId, cancel: CancelToken) -> Result<(), ServerError> {
        let (sender, receiver) = flume::unbounded();
        let mut routes = self.routes.lock();
        let mut inboxes = self.inboxes.lock();
        if routes.contains_key(&id) || inboxes.contains_key(&id) {
            return Err(ServerError::invalid(format!("task {id} is already pending")));
        }
        routes.insert(id, Route { sender, cancel });
        inboxes.insert(id, receiver);
        Ok(())
    }

    pub fn remove_waiting(&self, id: TaskId) {
        self.routes.lock().remove(&id);
    }

    pub fn is_waiting(&self, id: TaskId) -> bool {
        self.routes.lock().contains_key(&id)
    }

    pub fn num_waiting(&self) -> usize {
        self.routes.lock().len()
    }

    /// Deliver a result. Results of unknown or cancelled tasks are dropped.
    /// A terminal result closes the route of its task.
    pub fn push(&self, result: TaskResult) {
        let id = result.task_id();
        let terminal = result.is_terminal();
        let mut routes = self.routes.lock();
        match routes.get(&id) {
            Some(route) if !route.cancel.is_cancelled() => {
                let _ = route.sender.send(result);
            }
            _ => log::debug!("[result][drop][task: {id}]"),
        }
        if terminal {
            routes.remove(&id);
        }
    }

    /// Wait up to `timeout` for the next result of `id`, which must have been
    /// registered with [`ResultQueue::add_inbox`].
    /// `should_stop` is checked every time the waiter wakes up.
    pub fn poll(
        &self,
        id: TaskId,
        timeout: Duration,
        should_stop: impl Fn() -> bool,
    ) -> Option<TaskResult> {
        let receiver = self.inboxes.lock().get(&id)?.clone();
        let deadline = Instant::now() + timeout;

        loop {
            if should_stop() {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let wait = (deadline - now).min(self.wake_interval);
            match receiver.recv_timeout(wait) {
                Ok(result) => {
                    if result.is_terminal() {
                        self.inboxes.lock().remove(&id);
                    }
                    return Some(result);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Flag the task as cancelled and stop routing its results.
    /// Returns `false` if nobody was waiting on `id`.
    ///
    /// The route stays reserved until the scheduler lets go of the task.
    pub fn cancel(&self, id: TaskId) -> bool {
        let routes = self.routes.lock();
        self.inboxes.lock().remove(&id);
        match routes.get(&id) {
            Some(route) if !route.cancel.is_cancelled() => {
                route.cancel.cancel();
                log::info!("[result][cancel][task: {id}]");
                true
            }
            _ => false,
        }
    }
}
