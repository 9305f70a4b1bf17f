//! Executor - ワーカースレッドと FIFO キュー
//!
//! # 構成
//! - worker ごとに 1 本の FIFO キュー（Mutex + Condvar）
//! - 遅延タスク用のタイマースレッド（BinaryHeap、締め切りが早い順）
//!
//! A task's affinity key picks its queue, so tasks sharing a key run in the
//! order they became eligible. Tasks without a key are spread round-robin.
//! Each worker drains one task to a terminal state before taking the next.
//!
//! Workers never block on disk or network: those complete elsewhere and come
//! back through `complete`, which puts the pending task on a queue.

use std::cell::RefCell;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace};

use super::handle::{Runnable, Task, TaskContext, TaskResult};
use crate::domain::TaskCode;
use crate::env::Environment;
use crate::error::{SpindleError, SpindleResult};

/// Upper bound on how long the timer thread sleeps before re-reading the
/// clock.
const MAX_TIMER_PARK: Duration = Duration::from_millis(100);

#[derive(Clone)]
struct WorkerInfo {
    name: Arc<str>,
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<WorkerInfo>> = const { RefCell::new(None) };
}

/// Is the calling thread a worker of some executor?
pub(crate) fn is_worker_thread() -> bool {
    CURRENT_WORKER.with(|w| w.borrow().is_some())
}

/// Name of the executor owning the calling worker thread.
pub fn current_executor_name() -> Option<String> {
    CURRENT_WORKER.with(|w| w.borrow().as_ref().map(|info| info.name.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Names the worker threads; the system uses the app name.
    pub name: String,
    pub worker_count: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "spindle".to_string(),
            worker_count: 4,
        }
    }
}

/// Point-in-time queue depths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorStats {
    /// Ready tasks per worker queue.
    pub queued: Vec<usize>,
    /// Tasks waiting for their delay to expire.
    pub delayed: usize,
    /// Tasks taken off a queue so far (including ones found canceled).
    pub executed: u64,
}

struct WorkerQueue {
    tasks: Mutex<VecDeque<Arc<dyn Runnable>>>,
    available: Condvar,
}

/// Delayed task entry. Ordered so `BinaryHeap` pops the earliest deadline
/// first, ties broken by scheduling order.
struct Scheduled {
    deadline_ns: u64,
    seq: u64,
    queue: usize,
    task: Arc<dyn Runnable>,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline_ns == other.deadline_ns && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering: earlier deadlines have higher priority
        (other.deadline_ns, other.seq).cmp(&(self.deadline_ns, self.seq))
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Scheduled>,
    next_seq: u64,
}

struct Shared {
    name: Arc<str>,
    env: Arc<Environment>,
    queues: Vec<WorkerQueue>,
    timer: Mutex<TimerState>,
    timer_changed: Condvar,
    next_queue: AtomicUsize,
    shutdown: AtomicBool,
    executed: AtomicU64,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn pick_queue(&self, affinity: Option<u64>) -> usize {
        let n = self.queues.len();
        match affinity {
            Some(key) => (key % n as u64) as usize,
            None => self.next_queue.fetch_add(1, Ordering::Relaxed) % n,
        }
    }

    fn push(&self, queue: usize, task: Arc<dyn Runnable>) {
        let queue = &self.queues[queue];
        let mut tasks = relock(&queue.tasks);
        if self.shutdown.load(Ordering::SeqCst) {
            drop(tasks);
            task.abandon();
            return;
        }
        tasks.push_back(task);
        drop(tasks);
        queue.available.notify_one();
    }

    fn schedule(&self, deadline_ns: u64, queue: usize, task: Arc<dyn Runnable>) {
        let mut timer = relock(&self.timer);
        let seq = timer.next_seq;
        timer.next_seq += 1;
        timer.heap.push(Scheduled {
            deadline_ns,
            seq,
            queue,
            task,
        });
        drop(timer);
        self.timer_changed.notify_one();
    }
}

/// Pool of worker threads plus a timer thread.
pub struct Executor {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    pub fn new(config: ExecutorConfig, env: Arc<Environment>) -> SpindleResult<Self> {
        if config.worker_count == 0 {
            return Err(SpindleError::argument("executor needs at least one worker"));
        }
        let shared = Arc::new(Shared {
            name: Arc::from(config.name.as_str()),
            env,
            queues: (0..config.worker_count)
                .map(|_| WorkerQueue {
                    tasks: Mutex::new(VecDeque::new()),
                    available: Condvar::new(),
                })
                .collect(),
            timer: Mutex::new(TimerState::default()),
            timer_changed: Condvar::new(),
            next_queue: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            executed: AtomicU64::new(0),
        });
        let executor = Self {
            shared,
            threads: Mutex::new(Vec::with_capacity(config.worker_count + 1)),
        };

        // a failed spawn drops `executor`, which stops the threads already started
        for index in 0..config.worker_count {
            let shared = Arc::clone(&executor.shared);
            let handle = thread::Builder::new()
                .name(format!("{}-worker-{index}", config.name))
                .spawn(move || worker_loop(shared, index))?;
            relock(&executor.threads).push(handle);
        }
        let shared = Arc::clone(&executor.shared);
        let handle = thread::Builder::new()
            .name(format!("{}-timer", config.name))
            .spawn(move || timer_loop(shared))?;
        relock(&executor.threads).push(handle);

        info!(
            executor = %config.name,
            workers = config.worker_count,
            "executor started"
        );
        Ok(executor)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.shared.env
    }

    pub fn worker_count(&self) -> usize {
        self.shared.queues.len()
    }

    pub fn is_running(&self) -> bool {
        !self.shared.shutdown.load(Ordering::SeqCst)
    }

    /// CREATED -> READY and hand the task to a queue. A non-zero `delay`
    /// overrides the task's own delay; a delayed task is not dispatched
    /// before `now_ns() + delay`.
    pub fn enqueue<T: Send + 'static>(&self, task: &Task<T>, delay: Duration) -> SpindleResult<()> {
        if !self.is_running() {
            return Err(SpindleError::state(format!(
                "executor {} is shut down",
                self.shared.name
            )));
        }
        let (delay, affinity) = task.mark_ready(delay)?;
        let queue = self.shared.pick_queue(affinity);
        if delay.is_zero() {
            self.shared.push(queue, task.as_runnable());
        } else {
            let deadline_ns = self.shared.env.deadline_after(delay);
            self.shared.schedule(deadline_ns, queue, task.as_runnable());
        }
        trace!(
            task_id = %task.id(),
            code = %task.code(),
            queue,
            delay_ms = delay.as_millis() as u64,
            "task enqueued"
        );
        Ok(())
    }

    /// Build a body task and enqueue it right away.
    pub fn spawn<T, F>(&self, code: impl Into<TaskCode>, body: F) -> SpindleResult<Task<T>>
    where
        T: Send + 'static,
        F: FnOnce(&TaskContext<'_>) -> TaskResult<T> + Send + 'static,
    {
        let task = Task::new(code, body);
        self.enqueue(&task, Duration::ZERO)?;
        Ok(task)
    }

    /// CREATED -> READY for a pending task. It is not queued; the completion
    /// source hands it over through `complete`.
    pub(crate) fn arm<T: Send + 'static>(&self, task: &Task<T>) -> SpindleResult<()> {
        if !self.is_running() {
            return Err(SpindleError::state(format!(
                "executor {} is shut down",
                self.shared.name
            )));
        }
        task.mark_ready(Duration::ZERO).map(|_| ())
    }

    /// Deliver the result of a READY pending task and queue it so its
    /// callback runs on a worker. False if the task would not take it
    /// (canceled, or already completed by someone else).
    pub(crate) fn complete<T: Send + 'static>(&self, task: &Task<T>, result: TaskResult<T>) -> bool {
        if !task.deliver(result) {
            return false;
        }
        let queue = self.shared.pick_queue(task.affinity());
        self.shared.push(queue, task.as_runnable());
        true
    }

    pub fn stats(&self) -> ExecutorStats {
        ExecutorStats {
            queued: self
                .shared
                .queues
                .iter()
                .map(|q| relock(&q.tasks).len())
                .collect(),
            delayed: relock(&self.shared.timer).heap.len(),
            executed: self.shared.executed.load(Ordering::Relaxed),
        }
    }

    /// Stop taking work and join the threads. Running tasks finish; queued
    /// and delayed ones are canceled so nobody waits on them forever.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        for queue in &self.shared.queues {
            let _tasks = relock(&queue.tasks);
            queue.available.notify_all();
        }
        {
            let _timer = relock(&self.shared.timer);
            self.shared.timer_changed.notify_all();
        }

        let threads = std::mem::take(&mut *relock(&self.threads));
        let me = thread::current().id();
        for handle in threads {
            // shutdown may be triggered from one of our own workers
            if handle.thread().id() == me {
                continue;
            }
            let _ = handle.join();
        }
        info!(executor = %self.shared.name, "executor stopped");
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: Arc<Shared>, index: usize) {
    CURRENT_WORKER.with(|w| {
        *w.borrow_mut() = Some(WorkerInfo {
            name: Arc::clone(&shared.name),
        })
    });
    let queue = &shared.queues[index];

    loop {
        let next = {
            let mut tasks = relock(&queue.tasks);
            loop {
                if shared.shutdown.load(Ordering::SeqCst) {
                    break None;
                }
                if let Some(task) = tasks.pop_front() {
                    break Some(task);
                }
                tasks = queue
                    .available
                    .wait(tasks)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };
        let Some(task) = next else {
            break;
        };

        shared.executed.fetch_add(1, Ordering::Relaxed);
        trace!(task_id = %task.id(), code = %task.code(), worker = index, "task picked");
        task.run();
    }

    let leftover: Vec<_> = relock(&queue.tasks).drain(..).collect();
    if !leftover.is_empty() {
        debug!(worker = index, count = leftover.len(), "canceling queued tasks on shutdown");
    }
    for task in leftover {
        task.abandon();
    }
}

fn timer_loop(shared: Arc<Shared>) {
    let mut timer = relock(&shared.timer);
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        let now = shared.env.now_ns();
        let park = match timer.heap.peek() {
            Some(next) if next.deadline_ns <= now => {
                if let Some(due) = timer.heap.pop() {
                    shared.push(due.queue, due.task);
                }
                continue;
            }
            Some(next) => Some(Duration::from_nanos(next.deadline_ns - now).min(MAX_TIMER_PARK)),
            None => None,
        };
        timer = match park {
            Some(park) => shared
                .timer_changed
                .wait_timeout(timer, park)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0),
            None => shared
                .timer_changed
                .wait(timer)
                .unwrap_or_else(PoisonError::into_inner),
        };
    }

    let leftover: Vec<_> = timer.heap.drain().map(|s| s.task).collect();
    drop(timer);
    for task in leftover {
        task.abandon();
    }
}
