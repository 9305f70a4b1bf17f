//! Task & Executor.
//!
//! - **handle**: `Task<T>` の状態機械、キャンセル、待機、コールバック
//! - **executor**: ワーカープールとタイマー
//! - **tasking**: `enqueue` / `cancel` / `wait` の関数 API

pub mod handle;
pub mod executor;
pub mod tasking;

pub use self::handle::{CancelOutcome, Task, TaskContext, TaskResult, current_task_id};
pub use self::executor::{Executor, ExecutorConfig, ExecutorStats, current_executor_name};
pub use self::tasking::WAIT_INFINITE;
