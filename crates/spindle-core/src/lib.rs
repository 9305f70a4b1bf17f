//! spindle-core
//!
//! Task, RPC and async I/O nucleus for the Spindle runtime.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task code, state, end point, message）
//! - **ports**: 外部コラボレータの抽象化（Clock, Transport, DiskProvider）
//! - **impls**: ports の実装（IoRuntime, LocalNetwork, StdDisk）
//! - **env**: 時刻と乱数
//! - **task**: Task と Executor（enqueue / cancel / wait）
//! - **rpc**: Dispatcher（call / call_one_way / reply / ハンドラ表）
//! - **aio**: FileEngine（open / read / write / close）とリモートコピー
//! - **app**: Config, ServiceRegistry, System
//! - **error**: SpindleError
//!
//! Every asynchronous surface returns a `Task<T>`: wait on it, or pass a
//! callback that runs on a worker when it settles.

pub mod aio;
pub mod app;
pub mod domain;
pub mod env;
pub mod error;
pub mod impls;
pub mod ports;
pub mod rpc;
pub mod task;

pub use crate::aio::{AioResult, CopyReport, CopyRequest, FileEngine, OpenFlags};
pub use crate::app::{AppConfig, Config, ServiceApp, ServiceNode, ServiceRegistry, System};
pub use crate::domain::{EndPoint, Message, TaskCode, TaskState};
pub use crate::env::Environment;
pub use crate::error::{SpindleError, SpindleResult};
pub use crate::rpc::{Dispatcher, LateReplyPolicy, RpcContext, RpcHandler};
pub use crate::task::{CancelOutcome, Executor, Task, TaskResult, WAIT_INFINITE};
