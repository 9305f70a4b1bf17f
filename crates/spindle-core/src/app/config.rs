//! Config - 起動パラメータ
//!
//! Loaded from JSON. Every field has a default, so `{}` is a valid (if
//! app-less) config.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{SpindleError, SpindleResult};
use crate::rpc::RpcConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host part of every app's primary address.
    pub host: String,
    /// Threads of the runtime that carries network delivery and disk I/O.
    pub io_threads: usize,
    pub network: NetworkConfig,
    pub rpc: RpcConfig,
    /// Fixed RNG seed; `None` seeds from entropy.
    pub seed: Option<u64>,
    pub apps: Vec<AppConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            io_threads: 2,
            network: NetworkConfig::default(),
            rpc: RpcConfig::default(),
            seed: None,
            apps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Simulated one-way delivery latency.
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Unique per process; also names the app's worker threads.
    pub name: String,
    /// Key into the service registry.
    pub service: String,
    pub port: u16,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Free-form parameters handed to the service factory.
    #[serde(default)]
    pub params: serde_json::Value,
}

fn default_worker_count() -> usize {
    4
}

impl AppConfig {
    pub fn new(name: impl Into<String>, service: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            service: service.into(),
            port,
            worker_count: default_worker_count(),
            params: serde_json::Value::Null,
        }
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }
}

impl Config {
    pub fn from_json_str(json: &str) -> SpindleResult<Self> {
        serde_json::from_str(json).map_err(|e| SpindleError::Config(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> SpindleResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SpindleError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json_str(&json)
    }

    pub fn with_app(mut self, app: AppConfig) -> Self {
        self.apps.push(app);
        self
    }

    /// Checked by `System::run` before anything starts.
    pub fn validate(&self) -> SpindleResult<()> {
        if self.host.is_empty() {
            return Err(SpindleError::Config("host must not be empty".to_string()));
        }
        if self.io_threads == 0 {
            return Err(SpindleError::Config("io_threads must be positive".to_string()));
        }
        let mut names = HashSet::new();
        let mut ports = HashSet::new();
        for app in &self.apps {
            if app.name.is_empty() {
                return Err(SpindleError::Config("app name must not be empty".to_string()));
            }
            if !names.insert(app.name.as_str()) {
                return Err(SpindleError::Config(format!("duplicate app name {}", app.name)));
            }
            if !ports.insert(app.port) {
                return Err(SpindleError::Config(format!(
                    "app {} reuses port {}",
                    app.name, app.port
                )));
            }
            if app.worker_count == 0 {
                return Err(SpindleError::Config(format!(
                    "app {} needs at least one worker",
                    app.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::LateReplyPolicy;
    use rstest::rstest;

    #[test]
    fn empty_document_takes_defaults() {
        let config = Config::from_json_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn full_document_parses() {
        let config = Config::from_json_str(
            r#"{
                "host": "node-a",
                "io_threads": 3,
                "network": { "latency_ms": 5 },
                "rpc": { "default_timeout_ms": 1000, "late_reply": "retain" },
                "seed": 42,
                "apps": [
                    { "name": "server", "service": "ping", "port": 34801, "worker_count": 2 },
                    { "name": "client", "service": "idle", "port": 34802,
                      "params": { "target": "server" } }
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.host, "node-a");
        assert_eq!(config.network.latency_ms, 5);
        assert_eq!(config.rpc.late_reply, LateReplyPolicy::Retain);
        assert_eq!(config.rpc.late_reply_capacity, RpcConfig::default().late_reply_capacity);
        assert_eq!(config.seed, Some(42));
        assert_eq!(config.apps[1].worker_count, 4);
        assert_eq!(config.apps[1].params["target"], "server");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn malformed_json_is_config_error() {
        assert!(matches!(
            Config::from_json_str("{ nope"),
            Err(SpindleError::Config(_))
        ));
    }

    #[rstest]
    #[case::duplicate_name(
        Config::default()
            .with_app(AppConfig::new("a", "s", 1))
            .with_app(AppConfig::new("a", "s", 2))
    )]
    #[case::duplicate_port(
        Config::default()
            .with_app(AppConfig::new("a", "s", 1))
            .with_app(AppConfig::new("b", "s", 1))
    )]
    #[case::no_workers(Config::default().with_app(AppConfig::new("a", "s", 1).with_worker_count(0)))]
    #[case::no_io_threads(Config { io_threads: 0, ..Config::default() })]
    fn invalid_configs_are_rejected(#[case] config: Config) {
        assert!(matches!(config.validate(), Err(SpindleError::Config(_))));
    }
}
