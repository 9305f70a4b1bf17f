//! Task - スケジュール可能・キャンセル可能・待機可能な作業単位
//!
//! A `Task<T>` is a shared handle (`Arc`) to one unit of work. The caller and
//! the executor each hold a clone; the task is freed when both let go.
//!
//! Two flavours share the state machine:
//! - body tasks run a closure on a worker;
//! - pending tasks have no body; a completion source (RPC reply, disk
//!   completion) delivers the result and the executor then runs the callback.
//!
//! Invariants:
//! - every transition happens under the per-task mutex and follows
//!   `TaskState::can_transition_to`;
//! - the callback sits in an `Option` that is `take()`n exactly once, so it
//!   cannot fire twice;
//! - the callback runs before the terminal state is published, so a
//!   successful `wait()` implies the callback has returned.

use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::executor::is_worker_thread;
use crate::domain::{TaskCode, TaskId, TaskState};
use crate::error::{SpindleError, SpindleResult};

pub type TaskResult<T> = Result<T, SpindleError>;

type Body<T> = Box<dyn FnOnce(&TaskContext<'_>) -> TaskResult<T> + Send>;
type Callback<T> = Box<dyn FnOnce(&TaskResult<T>) + Send>;

thread_local! {
    static CURRENT_TASK: Cell<Option<TaskId>> = const { Cell::new(None) };
}

/// Id of the task whose body or callback is running on this thread.
pub fn current_task_id() -> Option<TaskId> {
    CURRENT_TASK.with(Cell::get)
}

/// Result of a cancel request.
///
/// A bare bool cannot tell "too late" from "nothing to cancel", so callers get
/// the full picture; `tasking::cancel` folds it back into a bool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The task will not run (or gave up cooperatively).
    Intercepted,
    /// The task was already running and ran to completion.
    InFlight,
    /// The task was already terminal; nothing changed.
    AlreadyFinished,
    /// The task was never enqueued; nothing changed.
    NotEnqueued,
}

impl CancelOutcome {
    pub fn is_canceled(self) -> bool {
        matches!(self, CancelOutcome::Intercepted)
    }
}

/// What a running body can see of its own task.
pub struct TaskContext<'a> {
    id: TaskId,
    cancel_requested: &'a AtomicBool,
}

impl TaskContext<'_> {
    pub fn task_id(&self) -> TaskId {
        self.id
    }

    /// Set when someone called `cancel(wait_until_finished = true)` on this
    /// task while it was running. Returning `Err(SpindleError::Canceled)`
    /// afterwards ends the task as CANCELED instead of FAILED.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }
}

struct TaskCore<T> {
    state: TaskState,
    delay: Duration,
    affinity: Option<u64>,
    body: Option<Body<T>>,
    callback: Option<Callback<T>>,
    /// Result handed over by a completion source, consumed when run.
    delivered: Option<TaskResult<T>>,
    result: Option<TaskResult<T>>,
}

pub(crate) struct TaskInner<T> {
    id: TaskId,
    code: TaskCode,
    cancel_requested: AtomicBool,
    core: Mutex<TaskCore<T>>,
    terminal: Condvar,
}

impl<T> TaskInner<T> {
    fn lock(&self) -> MutexGuard<'_, TaskCore<T>> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: TaskState, result: TaskResult<T>) {
        let mut core = self.lock();
        debug_assert!(core.state.can_transition_to(state));
        core.state = state;
        core.result = Some(result);
        drop(core);
        self.terminal.notify_all();
    }

    fn cancel(&self, wait_until_finished: bool) -> CancelOutcome {
        let mut core = self.lock();
        let state = core.state;
        match state {
            TaskState::Created => CancelOutcome::NotEnqueued,
            TaskState::Ready => {
                core.state = TaskState::Canceled;
                core.result = Some(Err(SpindleError::Canceled));
                let dropped = (core.body.take(), core.callback.take(), core.delivered.take());
                drop(core);
                // captured state is released outside the lock
                drop(dropped);
                self.terminal.notify_all();
                debug!(task_id = %self.id, code = %self.code, "task canceled before start");
                CancelOutcome::Intercepted
            }
            TaskState::Running => {
                if !wait_until_finished || current_task_id() == Some(self.id) {
                    return CancelOutcome::InFlight;
                }
                self.cancel_requested.store(true, Ordering::SeqCst);
                while !core.state.is_terminal() {
                    core = self
                        .terminal
                        .wait(core)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                if core.state == TaskState::Canceled {
                    CancelOutcome::Intercepted
                } else {
                    CancelOutcome::InFlight
                }
            }
            TaskState::Completed | TaskState::Failed | TaskState::Canceled => {
                CancelOutcome::AlreadyFinished
            }
        }
    }
}

/// Type-erased view the executor queues hold.
pub(crate) trait Runnable: Send + Sync {
    fn id(&self) -> TaskId;

    fn code(&self) -> &TaskCode;

    /// Drive the task to a terminal state. No-op unless it is READY.
    fn run(&self);

    /// Cancel a task that will never be run (executor shutting down).
    fn abandon(&self);
}

impl<T: Send + 'static> Runnable for TaskInner<T> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn code(&self) -> &TaskCode {
        &self.code
    }

    fn run(&self) {
        let (body, delivered, callback) = {
            let mut core = self.lock();
            if core.state != TaskState::Ready {
                // canceled while it sat in the queue
                return;
            }
            core.state = TaskState::Running;
            (core.body.take(), core.delivered.take(), core.callback.take())
        };

        let previous = CURRENT_TASK.with(|c| c.replace(Some(self.id)));

        let result = match body {
            Some(body) => {
                let ctx = TaskContext {
                    id: self.id,
                    cancel_requested: &self.cancel_requested,
                };
                panic::catch_unwind(AssertUnwindSafe(|| body(&ctx))).unwrap_or_else(|_| {
                    warn!(task_id = %self.id, code = %self.code, "task body panicked");
                    Err(SpindleError::state(format!("task {} panicked", self.id)))
                })
            }
            None => delivered.unwrap_or_else(|| {
                Err(SpindleError::state("pending task ran without a delivered result"))
            }),
        };

        let canceled = matches!(result, Err(SpindleError::Canceled))
            && self.cancel_requested.load(Ordering::SeqCst);

        if !canceled
            && let Some(callback) = callback
            && panic::catch_unwind(AssertUnwindSafe(|| callback(&result))).is_err()
        {
            warn!(task_id = %self.id, code = %self.code, "task callback panicked");
        }

        CURRENT_TASK.with(|c| c.set(previous));

        let state = if canceled {
            TaskState::Canceled
        } else if result.is_ok() {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        self.publish(state, result);
    }

    fn abandon(&self) {
        self.cancel(false);
    }
}

/// Shared handle to a task producing a `T`.
pub struct Task<T> {
    inner: Arc<TaskInner<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("code", &self.inner.code)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

impl<T: Send + 'static> Task<T> {
    /// Task that runs `body` on a worker.
    pub fn new<F>(code: impl Into<TaskCode>, body: F) -> Self
    where
        F: FnOnce(&TaskContext<'_>) -> TaskResult<T> + Send + 'static,
    {
        Self::build(code.into(), Some(Box::new(body)))
    }

    /// Task whose result comes from a completion source.
    pub fn pending(code: impl Into<TaskCode>) -> Self {
        Self::build(code.into(), None)
    }

    fn build(code: TaskCode, body: Option<Body<T>>) -> Self {
        Self {
            inner: Arc::new(TaskInner {
                id: TaskId::generate(),
                code,
                cancel_requested: AtomicBool::new(false),
                core: Mutex::new(TaskCore {
                    state: TaskState::Created,
                    delay: Duration::ZERO,
                    affinity: None,
                    body,
                    callback: None,
                    delivered: None,
                    result: None,
                }),
                terminal: Condvar::new(),
            }),
        }
    }

    /// Completion callback, run on a worker once the task finishes
    /// (successfully or not). Not run for canceled tasks.
    pub fn on_complete<F>(self, callback: F) -> Self
    where
        F: FnOnce(&TaskResult<T>) + Send + 'static,
    {
        self.set_callback(Box::new(callback));
        self
    }

    pub(crate) fn set_callback(&self, callback: Callback<T>) {
        let mut core = self.inner.lock();
        if core.state == TaskState::Created {
            core.callback = Some(callback);
        } else {
            warn!(task_id = %self.inner.id, "callback ignored: task already enqueued");
        }
    }

    /// Bind the task to a worker queue. Tasks with the same key run in FIFO
    /// order.
    pub fn with_affinity(self, key: u64) -> Self {
        self.inner.lock().affinity = Some(key);
        self
    }

    /// Delay applied when the task is enqueued.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.inner.lock().delay = delay;
        self
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn code(&self) -> &TaskCode {
        &self.inner.code
    }

    pub fn state(&self) -> TaskState {
        self.inner.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Move the result out. `None` until the task is terminal, and after
    /// the first call.
    pub fn take_result(&self) -> Option<TaskResult<T>> {
        let mut core = self.inner.lock();
        if core.state.is_terminal() {
            core.result.take()
        } else {
            None
        }
    }

    /// See [`CancelOutcome`]. Never interrupts a running body.
    pub fn cancel(&self, wait_until_finished: bool) -> CancelOutcome {
        self.inner.cancel(wait_until_finished)
    }

    /// Block until the task is terminal or `timeout` elapses (`None` waits
    /// forever). Returns whether it is terminal. Timing out leaves the task
    /// untouched.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut core = self.inner.lock();
        if core.state.is_terminal() {
            return true;
        }
        if current_task_id() == Some(self.inner.id) {
            warn!(task_id = %self.inner.id, "task waiting on itself");
            return false;
        }
        if is_worker_thread() {
            warn!(task_id = %self.inner.id, "blocking wait on a worker thread");
        }

        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        loop {
            if core.state.is_terminal() {
                return true;
            }
            match deadline {
                None => {
                    core = self
                        .inner
                        .terminal
                        .wait(core)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    core = self
                        .inner
                        .terminal
                        .wait_timeout(core, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|e| e.into_inner().0);
                }
            }
        }
    }

    /// CREATED -> READY. Returns the effective delay and the affinity key.
    pub(crate) fn mark_ready(&self, delay: Duration) -> SpindleResult<(Duration, Option<u64>)> {
        let mut core = self.inner.lock();
        if core.state != TaskState::Created {
            return Err(SpindleError::state(format!(
                "task {} cannot be enqueued from {:?}",
                self.inner.id, core.state
            )));
        }
        core.state = TaskState::Ready;
        if !delay.is_zero() {
            core.delay = delay;
        }
        Ok((core.delay, core.affinity))
    }

    /// Hand a result to a READY pending task. Refused (false) if the task was
    /// canceled, has a body, or already got its result.
    pub(crate) fn deliver(&self, result: TaskResult<T>) -> bool {
        let mut core = self.inner.lock();
        if core.state != TaskState::Ready || core.body.is_some() || core.delivered.is_some() {
            return false;
        }
        core.delivered = Some(result);
        true
    }

    pub(crate) fn affinity(&self) -> Option<u64> {
        self.inner.lock().affinity
    }

    pub(crate) fn as_runnable(&self) -> Arc<dyn Runnable> {
        self.inner.clone()
    }
}

impl<T: Clone + Send + 'static> Task<T> {
    /// Copy of the result once terminal.
    pub fn result(&self) -> Option<TaskResult<T>> {
        let core = self.inner.lock();
        if core.state.is_terminal() {
            core.result.clone()
        } else {
            None
        }
    }
}
