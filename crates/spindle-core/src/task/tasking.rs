//! Free-function surface over tasks: `enqueue`, `cancel`, `wait`.
//!
//! Thin wrappers with millisecond arguments and boolean results, for callers
//! that do not need [`CancelOutcome`](super::CancelOutcome).

use std::time::Duration;

use super::handle::Task;
use super::executor::Executor;
use crate::error::SpindleResult;

/// `timeout_ms` sentinel meaning "wait forever".
pub const WAIT_INFINITE: u64 = u64::MAX;

pub fn enqueue<T: Send + 'static>(
    executor: &Executor,
    task: &Task<T>,
    delay_ms: u64,
) -> SpindleResult<()> {
    executor.enqueue(task, Duration::from_millis(delay_ms))
}

/// True only if the task was intercepted before (or cooperatively during)
/// execution.
pub fn cancel<T: Send + 'static>(task: &Task<T>, wait_until_finished: bool) -> bool {
    task.cancel(wait_until_finished).is_canceled()
}

/// True iff the task reached a terminal state within `timeout_ms`.
pub fn wait<T: Send + 'static>(task: &Task<T>, timeout_ms: u64) -> bool {
    let timeout = (timeout_ms != WAIT_INFINITE).then(|| Duration::from_millis(timeout_ms));
    task.wait(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskState;
    use crate::env::Environment;
    use crate::task::ExecutorConfig;
    use std::sync::Arc;

    #[test]
    fn enqueue_wait_cancel_through_the_free_functions() {
        let exec = Executor::new(ExecutorConfig::default(), Arc::new(Environment::system())).unwrap();

        let quick = Task::new("quick", |_| Ok(1u8));
        enqueue(&exec, &quick, 0).unwrap();
        assert!(wait(&quick, WAIT_INFINITE));
        assert!(!cancel(&quick, false));
        assert_eq!(quick.state(), TaskState::Completed);

        let slow: Task<()> = Task::new("slow", |_| Ok(()));
        enqueue(&exec, &slow, 60_000).unwrap();
        assert!(!wait(&slow, 10));
        assert!(cancel(&slow, false));
        assert!(wait(&slow, 0));
        assert_eq!(slow.state(), TaskState::Canceled);
    }
}
