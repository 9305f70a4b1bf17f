use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Deserialize;
use spindle_core::aio::CopyRequest;
use spindle_core::app::{AppConfig, Config, ServiceApp, ServiceNode, ServiceRegistry, System};
use spindle_core::domain::Message;
use spindle_core::rpc::RpcContext;
use spindle_core::task::{WAIT_INFINITE, tasking};
use spindle_core::{SpindleError, SpindleResult};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "spindle", about = "Boot spindle apps from a config and exercise them")]
struct Cli {
    /// JSON config file. Without it a two-app setup (server, client) is used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the configured apps and list them.
    Apps,
    /// Send PING from one app to another and print the replies.
    Ping {
        #[arg(long, default_value = "client")]
        from: String,
        #[arg(long, default_value = "server")]
        to: String,
        #[arg(long, default_value_t = 3)]
        count: u32,
    },
    /// Copy files served by one app into a local directory via another app.
    Copy {
        /// App that receives the files.
        #[arg(long, default_value = "client")]
        from: String,
        /// App that serves them.
        #[arg(long, default_value = "server")]
        to: String,
        /// Directory on the serving side.
        #[arg(long)]
        source: PathBuf,
        #[arg(long)]
        dest: PathBuf,
        /// Files relative to the source; all of them when omitted.
        #[arg(long = "file")]
        files: Vec<String>,
        #[arg(long)]
        overwrite: bool,
    },
}

/// Answers PING with "pong", or with the `reply` param if set.
struct PingService {
    reply: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PingParams {
    reply: Option<String>,
}

impl ServiceApp for PingService {
    fn start(&self, node: &Arc<ServiceNode>) -> SpindleResult<()> {
        let reply = self.reply.clone().into_bytes();
        node.dispatcher()
            .register_rpc_handler("PING", "ping", move |ctx: &RpcContext, request: Message| {
                ctx.reply(request.create_response().with_payload(reply.clone()));
            })
    }
}

/// Only the built-in file service.
struct IdleService;

impl ServiceApp for IdleService {
    fn start(&self, _node: &Arc<ServiceNode>) -> SpindleResult<()> {
        Ok(())
    }
}

fn registry() -> SpindleResult<ServiceRegistry> {
    let registry = ServiceRegistry::new();
    registry.register_service("ping", |app: &AppConfig| {
        let params: PingParams = if app.params.is_null() {
            PingParams::default()
        } else {
            serde_json::from_value(app.params.clone())
                .map_err(|e| SpindleError::Config(format!("app {}: {e}", app.name)))?
        };
        Ok(Box::new(PingService {
            reply: params.reply.unwrap_or_else(|| "pong".to_string()),
        }) as Box<dyn ServiceApp>)
    })?;
    registry.register_service("idle", |_: &AppConfig| {
        Ok(Box::new(IdleService) as Box<dyn ServiceApp>)
    })?;
    Ok(registry)
}

fn load_config(path: Option<&PathBuf>) -> SpindleResult<Config> {
    match path {
        Some(path) => Config::load(path),
        None => Ok(Config::default()
            .with_app(AppConfig::new("server", "ping", 34_801).with_worker_count(2))
            .with_app(AppConfig::new("client", "idle", 34_802).with_worker_count(2))),
    }
}

fn node<'a>(system: &'a System, name: &str) -> SpindleResult<&'a Arc<ServiceNode>> {
    system
        .node(name)
        .ok_or_else(|| SpindleError::argument(format!("no app named {name}")))
}

fn run(cli: Cli) -> SpindleResult<()> {
    let config = load_config(cli.config.as_ref())?;
    let system = System::run(&registry()?, config)?;

    match cli.command {
        Command::Apps => {
            let apps = serde_json::to_string_pretty(&system.get_all_apps())?;
            println!("{apps}");
        }
        Command::Ping { from, to, count } => {
            let client = node(&system, &from)?;
            let server = node(&system, &to)?.primary_address().clone();
            for seq in 0..count {
                let started = system.env().now_us();
                let task = client.call(&server, Message::request("PING", Vec::<u8>::new()), None)?;
                tasking::wait(&task, WAIT_INFINITE);
                let elapsed_us = system.env().now_us().saturating_sub(started);
                match task.take_result() {
                    Some(Ok(reply)) => println!(
                        "{seq}: {} from {server} in {elapsed_us} us",
                        String::from_utf8_lossy(reply.payload())
                    ),
                    Some(Err(err)) => println!("{seq}: failed: {err}"),
                    None => println!("{seq}: no result"),
                }
            }
        }
        Command::Copy {
            from,
            to,
            source,
            dest,
            files,
            overwrite,
        } => {
            let client = node(&system, &from)?;
            let remote = node(&system, &to)?.primary_address().clone();
            let task = client.copy_remote_files(
                CopyRequest {
                    remote,
                    source_dir: source.to_string_lossy().into_owned(),
                    files,
                    dest_dir: dest,
                    overwrite,
                },
                None,
            )?;
            tasking::wait(&task, WAIT_INFINITE);
            let report = task
                .take_result()
                .unwrap_or_else(|| Err(SpindleError::state("copy did not finish")))?;
            for file in &report.copied {
                println!("copied {file}");
            }
            for (file, err) in &report.failed {
                println!("failed {file}: {err}");
            }
            info!(
                copied = report.copied.len(),
                failed = report.failed.len(),
                "copy done"
            );
        }
    }

    system.shutdown();
    Ok(())
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "spindle failed");
            ExitCode::FAILURE
        }
    }
}
