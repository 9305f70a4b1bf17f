//! ServiceNode - 1 アプリ分の実行環境
//!
//! Each configured app gets its own executor (threads named after the app),
//! dispatcher bound to its primary address, and file engine. Nodes share the
//! environment, the io runtime and the network.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::config::AppConfig;
use crate::aio::{CopyCallback, CopyRequest, CopyTask, FileEngine, FileService, copy_remote_files};
use crate::domain::{EndPoint, Message};
use crate::env::Environment;
use crate::error::SpindleResult;
use crate::impls::IoRuntime;
use crate::ports::{DiskProvider, Transport};
use crate::rpc::{Dispatcher, ResponseCallback, RpcConfig, RpcResponseTask};
use crate::task::{Executor, ExecutorConfig, Task};

/// Shared pieces every node is built from.
pub(crate) struct NodeParts {
    pub host: String,
    pub env: Arc<Environment>,
    pub io: Arc<IoRuntime>,
    pub transport: Arc<dyn Transport>,
    pub disk: Arc<dyn DiskProvider>,
    pub rpc: RpcConfig,
}

pub struct ServiceNode {
    name: String,
    service: String,
    executor: Arc<Executor>,
    dispatcher: Arc<Dispatcher>,
    files: Arc<FileEngine>,
}

impl ServiceNode {
    pub(crate) fn new(app: &AppConfig, parts: &NodeParts) -> SpindleResult<Arc<Self>> {
        let executor = Arc::new(Executor::new(
            ExecutorConfig {
                name: app.name.clone(),
                worker_count: app.worker_count,
            },
            Arc::clone(&parts.env),
        )?);
        let dispatcher = Dispatcher::new(
            EndPoint::new(parts.host.clone(), app.port),
            Arc::clone(&executor),
            Arc::clone(&parts.transport),
            parts.rpc.clone(),
        )?;
        let files = Arc::new(FileEngine::new(
            Arc::clone(&executor),
            Arc::clone(&parts.disk),
            Arc::clone(&parts.io),
        ));
        FileService::install(&dispatcher, Arc::clone(&files))?;

        info!(
            app = %app.name,
            service = %app.service,
            address = %dispatcher.primary_address(),
            "node up"
        );
        Ok(Arc::new(Self {
            name: app.name.clone(),
            service: app.service.clone(),
            executor,
            dispatcher,
            files,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn primary_address(&self) -> &EndPoint {
        self.dispatcher.primary_address()
    }

    pub fn env(&self) -> &Arc<Environment> {
        self.executor.env()
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn files(&self) -> &Arc<FileEngine> {
        &self.files
    }

    pub fn enqueue<T: Send + 'static>(&self, task: &Task<T>, delay: Duration) -> SpindleResult<()> {
        self.executor.enqueue(task, delay)
    }

    pub fn call(
        &self,
        server: &EndPoint,
        request: Message,
        callback: Option<ResponseCallback>,
    ) -> SpindleResult<RpcResponseTask> {
        self.dispatcher.call(server, request, callback)
    }

    pub fn copy_remote_files(
        &self,
        request: CopyRequest,
        callback: Option<CopyCallback>,
    ) -> SpindleResult<CopyTask> {
        copy_remote_files(&self.dispatcher, &self.files, request, callback)
    }

    pub(crate) fn shutdown(&self) {
        self.dispatcher.close();
        self.executor.shutdown();
        info!(app = %self.name, "node down");
    }
}
