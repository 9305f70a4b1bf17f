use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use spindle_core::aio::{AioResult, CopyReport, CopyRequest, OpenFlags};
use spindle_core::app::{AppConfig, Config, ServiceApp, ServiceNode, ServiceRegistry, System};
use spindle_core::domain::{Message, TaskState};
use spindle_core::rpc::RpcContext;
use spindle_core::task::{Task, TaskResult, tasking};
use spindle_core::{SpindleError, SpindleResult};
use tempfile::tempdir;

const FIVE_SECONDS_MS: u64 = 5_000;

struct PingService;

impl ServiceApp for PingService {
    fn start(&self, node: &Arc<ServiceNode>) -> SpindleResult<()> {
        node.dispatcher()
            .register_rpc_handler("PING", "ping", |ctx: &RpcContext, request: Message| {
                ctx.reply(request.create_response().with_payload(b"pong".to_vec()));
            })
    }
}

struct IdleService;

impl ServiceApp for IdleService {
    fn start(&self, _node: &Arc<ServiceNode>) -> SpindleResult<()> {
        Ok(())
    }
}

fn registry() -> ServiceRegistry {
    let registry = ServiceRegistry::new();
    registry
        .register_service("ping", |_: &AppConfig| Ok(Box::new(PingService) as Box<dyn ServiceApp>))
        .unwrap();
    registry
        .register_service("idle", |_: &AppConfig| Ok(Box::new(IdleService) as Box<dyn ServiceApp>))
        .unwrap();
    registry
}

fn two_node_system(base_port: u16) -> System {
    let config = Config::default()
        .with_app(AppConfig::new("server", "ping", base_port).with_worker_count(2))
        .with_app(AppConfig::new("client", "idle", base_port + 1).with_worker_count(2));
    System::run(&registry(), config).unwrap()
}

#[test]
fn ping_is_answered_with_pong() {
    let system = two_node_system(34_100);
    assert!(system.is_ready());
    let server = system.node("server").unwrap().primary_address().clone();
    let client = system.node("client").unwrap();
    let (tx, rx) = mpsc::channel();

    let response = client
        .call(
            &server,
            Message::request("PING", b"ping".to_vec()),
            Some(Box::new(move |result: &TaskResult<Message>| {
                tx.send(result.clone()).unwrap();
            })),
        )
        .unwrap();

    assert!(tasking::wait(&response, FIVE_SECONDS_MS));
    assert_eq!(response.state(), TaskState::Completed);
    let reply = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(reply.payload(), b"pong");
}

#[test]
fn one_way_call_produces_no_response_task() {
    let system = two_node_system(34_110);
    let server = system.node("server").unwrap();
    let client = system.node("client").unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let seen = hits.clone();
    server
        .dispatcher()
        .register_rpc_handler("TICK", "tick", move |_: &RpcContext, _: Message| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    client
        .dispatcher()
        .call_one_way(server.primary_address(), Message::request("TICK", Vec::<u8>::new()));

    for _ in 0..500 {
        if hits.load(Ordering::SeqCst) == 1 {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(client.dispatcher().pending_calls(), 0);
}

#[test]
fn write_then_read_through_the_file_engine() {
    let dir = tempdir().unwrap();
    let system = two_node_system(34_120);
    let files = system.node("client").unwrap().files();
    let handle = files.open(dir.path().join("x.dat"), OpenFlags::CREATE, 0o644).unwrap();

    let write = files.write(handle, b"abc".to_vec(), 3, 0, None).unwrap();
    assert!(tasking::wait(&write, FIVE_SECONDS_MS));

    let (tx, rx) = mpsc::channel();
    let read = files
        .read(
            handle,
            vec![0; 3],
            3,
            0,
            Some(Box::new(move |result: &TaskResult<AioResult>| {
                tx.send(result.as_ref().map(|done| done.bytes().to_vec()).ok())
                    .unwrap();
            })),
        )
        .unwrap();
    assert!(tasking::wait(&read, FIVE_SECONDS_MS));

    assert_eq!(rx.recv().unwrap().as_deref(), Some(&b"abc"[..]));
    files.close(handle).unwrap();
}

#[test]
fn cancel_while_running_is_refused_and_callback_fires_once() {
    let system = two_node_system(34_130);
    let executor = system.node("client").unwrap().executor();
    let (started_tx, started_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let fired = Arc::new(AtomicUsize::new(0));
    let count = fired.clone();

    let task = Task::new("work", move |_| {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        Ok(42)
    })
    .on_complete(move |_| {
        count.fetch_add(1, Ordering::SeqCst);
    });
    tasking::enqueue(executor, &task, 0).unwrap();
    started_rx.recv().unwrap();

    assert!(!tasking::cancel(&task, false));
    release_tx.send(()).unwrap();

    assert!(tasking::wait(&task, FIVE_SECONDS_MS));
    assert_eq!(task.result(), Some(Ok(42)));
    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!tasking::cancel(&task, true));
    assert_eq!(task.state(), TaskState::Completed);
}

#[test]
fn current_app_is_resolved_from_the_worker_thread() {
    let system = Arc::new(two_node_system(34_140));
    let view = Arc::clone(&system);
    let executor = Arc::clone(system.node("server").unwrap().executor());

    let task = executor
        .spawn("whoami", move |_| {
            Ok(view.get_current_app().map(|node| node.name().to_string()))
        })
        .unwrap();

    assert!(tasking::wait(&task, FIVE_SECONDS_MS));
    assert_eq!(task.result(), Some(Ok(Some("server".to_string()))));
    assert!(system.get_current_app().is_none());

    let names: Vec<String> = system.get_all_apps().into_iter().map(|a| a.name).collect();
    assert_eq!(names, vec!["server", "client"]);
    assert_eq!(system.bound_addresses().len(), 2);
}

fn copy_and_wait(system: &System, request: CopyRequest) -> CopyReport {
    let client = system.node("client").unwrap();
    let reported = Arc::new(Mutex::new(None));
    let slot = reported.clone();
    let task = client
        .copy_remote_files(
            request,
            Some(Box::new(move |result: &TaskResult<CopyReport>| {
                *slot.lock().unwrap() = Some(result.clone());
            })),
        )
        .unwrap();

    assert!(tasking::wait(&task, FIVE_SECONDS_MS));
    let from_callback = reported.lock().unwrap().take().unwrap().unwrap();
    assert_eq!(task.result(), Some(Ok(from_callback.clone())));
    from_callback
}

#[test]
fn copy_with_one_collision_copies_the_other_four() {
    let source = tempdir().unwrap();
    let dest = tempdir().unwrap();
    let names: Vec<String> = (1..=5).map(|i| format!("f{i}.txt")).collect();
    for name in &names {
        fs::write(source.path().join(name), format!("content of {name}")).unwrap();
    }
    fs::write(dest.path().join("f3.txt"), "already here").unwrap();

    let system = two_node_system(34_150);
    let report = copy_and_wait(
        &system,
        CopyRequest {
            remote: system.node("server").unwrap().primary_address().clone(),
            source_dir: source.path().to_string_lossy().into_owned(),
            files: names.clone(),
            dest_dir: dest.path().to_path_buf(),
            overwrite: false,
        },
    );

    assert_eq!(report.copied.len(), 4);
    assert_eq!(report.failed.len(), 1);
    let (failed_file, err) = report.first_error().unwrap();
    assert_eq!(failed_file, "f3.txt");
    assert_eq!(err.io_kind(), Some(std::io::ErrorKind::AlreadyExists));
    assert_eq!(fs::read_to_string(dest.path().join("f3.txt")).unwrap(), "already here");
    for name in names.iter().filter(|n| n.as_str() != "f3.txt") {
        assert_eq!(
            fs::read_to_string(dest.path().join(name)).unwrap(),
            format!("content of {name}")
        );
    }
}

#[test]
fn empty_file_list_copies_the_whole_directory() {
    let source = tempdir().unwrap();
    let dest = tempdir().unwrap();
    fs::create_dir(source.path().join("nested")).unwrap();
    fs::write(source.path().join("top.bin"), [1u8, 2, 3]).unwrap();
    fs::write(source.path().join("nested/inner.bin"), [4u8]).unwrap();
    fs::write(dest.path().join("top.bin"), [9u8]).unwrap();

    let system = two_node_system(34_160);
    let mut report = copy_and_wait(
        &system,
        CopyRequest {
            remote: system.node("server").unwrap().primary_address().clone(),
            source_dir: source.path().to_string_lossy().into_owned(),
            files: Vec::new(),
            dest_dir: dest.path().to_path_buf(),
            overwrite: true,
        },
    );

    report.copied.sort();
    assert!(report.is_success());
    assert_eq!(report.copied, vec!["nested/inner.bin", "top.bin"]);
    assert_eq!(fs::read(dest.path().join("top.bin")).unwrap(), [1u8, 2, 3]);
    assert_eq!(fs::read(dest.path().join("nested/inner.bin")).unwrap(), [4u8]);
}

#[test]
fn missing_remote_file_fails_only_that_file() {
    let source = tempdir().unwrap();
    let dest = tempdir().unwrap();
    fs::write(source.path().join("present"), "x").unwrap();

    let system = two_node_system(34_170);
    let report = copy_and_wait(
        &system,
        CopyRequest {
            remote: system.node("server").unwrap().primary_address().clone(),
            source_dir: source.path().to_string_lossy().into_owned(),
            files: vec!["present".to_string(), "absent".to_string()],
            dest_dir: dest.path().to_path_buf(),
            overwrite: false,
        },
    );

    assert_eq!(report.copied, vec!["present"]);
    assert_eq!(report.first_error().map(|(f, _)| f.as_str()), Some("absent"));
    assert!(!dest.path().join("absent").exists());
}

#[test]
fn unknown_service_fails_startup() {
    let config = Config::default().with_app(AppConfig::new("lost", "ghost", 34_180));
    let err = System::run(&registry(), config).err().unwrap();
    assert!(matches!(err, SpindleError::Argument(_)));
}

#[test]
fn shutdown_unbinds_every_node() {
    let system = two_node_system(34_190);
    system.shutdown();
    assert!(!system.is_ready());
    assert!(system.bound_addresses().is_empty());
    system.shutdown();
}
