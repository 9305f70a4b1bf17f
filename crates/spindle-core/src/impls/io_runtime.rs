//! IoRuntime - 非同期 I/O 用の tokio ランタイム
//!
//! Network delivery and disk completions run here, never on executor
//! workers. Completions re-enter the task world through
//! `Executor::complete`.

use tokio::runtime::{Builder, Handle, Runtime};

use crate::error::{SpindleError, SpindleResult};

pub struct IoRuntime {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl IoRuntime {
    pub fn new(threads: usize) -> SpindleResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("spindle-io")
            .enable_time()
            .build()
            .map_err(|e| SpindleError::state(format!("failed to start io runtime: {e}")))?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }
}

impl Drop for IoRuntime {
    fn drop(&mut self) {
        // 最後の参照が io スレッド上で落ちることがあるので、ブロックしない
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn runs_spawned_futures() {
        let io = IoRuntime::new(1).unwrap();
        let (tx, rx) = mpsc::channel();
        io.handle().spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            tx.send(7).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 7);
    }

    #[test]
    fn zero_threads_is_clamped() {
        assert!(IoRuntime::new(0).is_ok());
    }
}
