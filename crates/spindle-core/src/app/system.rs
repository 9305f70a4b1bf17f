//! System - プロセスの起動と全体ビュー
//!
//! `System::run` builds the shared runtime and network, one node per
//! configured app, then instantiates and starts every app. Dropping the
//! system stops them in reverse order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use super::config::Config;
use super::node::{NodeParts, ServiceNode};
use super::registry::{ServiceApp, ServiceRegistry};
use crate::domain::EndPoint;
use crate::env::Environment;
use crate::error::SpindleResult;
use crate::impls::{IoRuntime, LocalNetwork, StdDisk};
use crate::ports::SystemClock;
use crate::task::current_executor_name;

/// Read-only view of a running app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppInfo {
    pub name: String,
    pub service: String,
    pub address: EndPoint,
}

struct RunningApp {
    node: Arc<ServiceNode>,
    app: Box<dyn ServiceApp>,
}

pub struct System {
    config: Config,
    env: Arc<Environment>,
    network: Arc<LocalNetwork>,
    nodes: Vec<Arc<ServiceNode>>,
    running: Mutex<Vec<RunningApp>>,
    ready: AtomicBool,
    stopped: AtomicBool,
}

impl System {
    pub fn run(registry: &ServiceRegistry, config: Config) -> SpindleResult<Self> {
        config.validate()?;

        let env = Arc::new(Environment::new(Arc::new(SystemClock::new()), config.seed));
        let io = Arc::new(IoRuntime::new(config.io_threads)?);
        let network = Arc::new(LocalNetwork::with_latency(
            Arc::clone(&io),
            Duration::from_millis(config.network.latency_ms),
        ));
        let parts = NodeParts {
            host: config.host.clone(),
            env: Arc::clone(&env),
            io: Arc::clone(&io),
            transport: network.clone(),
            disk: Arc::new(StdDisk::new(Arc::clone(&io))),
            rpc: config.rpc.clone(),
        };

        let mut system = Self {
            config,
            env,
            network,
            nodes: Vec::new(),
            running: Mutex::new(Vec::new()),
            ready: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        };
        // 途中で失敗しても Drop で起動済みのノードは止まる
        for app in &system.config.apps {
            system.nodes.push(ServiceNode::new(app, &parts)?);
        }
        for (app_config, node) in system.config.apps.iter().zip(&system.nodes) {
            let app = registry.create(app_config)?;
            app.start(node)?;
            system
                .running
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(RunningApp {
                    node: Arc::clone(node),
                    app,
                });
        }

        system.ready.store(true, Ordering::SeqCst);
        info!(apps = system.nodes.len(), host = %system.config.host, "system ready");
        Ok(system)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn env(&self) -> &Arc<Environment> {
        &self.env
    }

    /// True once every app started, until shutdown.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn get_all_apps(&self) -> Vec<AppInfo> {
        self.nodes
            .iter()
            .map(|node| AppInfo {
                name: node.name().to_string(),
                service: node.service().to_string(),
                address: node.primary_address().clone(),
            })
            .collect()
    }

    /// The app whose worker thread is calling, if any.
    pub fn get_current_app(&self) -> Option<&Arc<ServiceNode>> {
        let name = current_executor_name()?;
        self.node(&name)
    }

    pub fn node(&self, name: &str) -> Option<&Arc<ServiceNode>> {
        self.nodes.iter().find(|node| node.name() == name)
    }

    /// Addresses currently bound on the network.
    pub fn bound_addresses(&self) -> Vec<EndPoint> {
        self.network.bound_addresses()
    }

    /// Stop apps (reverse start order), then their nodes. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ready.store(false, Ordering::SeqCst);
        if current_executor_name().is_some_and(|name| self.node(&name).is_some()) {
            warn!("system shut down from one of its own workers");
        }

        let running = {
            let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *running)
        };
        for entry in running.iter().rev() {
            entry.app.stop(&entry.node);
        }
        drop(running);
        for node in self.nodes.iter().rev() {
            node.shutdown();
        }
        info!("system stopped");
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.shutdown();
    }
}
