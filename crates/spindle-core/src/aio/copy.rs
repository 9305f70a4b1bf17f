//! Remote file copy
//!
//! Every node installs a `FileService` answering two RPC codes: list a
//! directory and read a whole file. `copy_remote_files` drives them from the
//! receiving side: one remote read plus one local write per file, all in
//! flight at once, folded into a single `CopyReport` task.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::engine::{AioKind, AioResult, FileEngine, OpenFlags};
use crate::domain::{EndPoint, Message};
use crate::error::{SpindleError, SpindleResult};
use crate::rpc::{Dispatcher, RpcContext};
use crate::task::{Task, TaskResult};

pub const LIST_CODE: &str = "spindle.file.list";
pub const READ_CODE: &str = "spindle.file.read";

const CREATED_FILE_MODE: u32 = 0o644;

#[derive(Debug, Serialize, Deserialize)]
struct ListRequest {
    dir: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReadRequest {
    dir: String,
    file: String,
}

/// Remote side failures travel as text.
type Remote<T> = Result<T, String>;

fn remote_failure(message: String) -> SpindleError {
    SpindleError::io(std::io::ErrorKind::Other, format!("remote: {message}"))
}

/// `file` must stay inside the directory it is resolved against.
fn contained(dir: &Path, file: &str) -> SpindleResult<PathBuf> {
    let relative = Path::new(file);
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(SpindleError::argument(format!(
            "file {file:?} escapes {}",
            dir.display()
        )));
    }
    Ok(dir.join(relative))
}

/// Serves list/read requests against the local file system.
pub struct FileService;

impl FileService {
    pub fn install(dispatcher: &Dispatcher, engine: Arc<FileEngine>) -> SpindleResult<()> {
        let lister = Arc::clone(&engine);
        dispatcher.register_rpc_handler(
            LIST_CODE,
            "file.list",
            move |ctx: &RpcContext, request: Message| serve_list(&lister, ctx, request),
        )?;
        dispatcher.register_rpc_handler(
            READ_CODE,
            "file.read",
            move |ctx: &RpcContext, request: Message| serve_read(&engine, ctx, request),
        )
    }
}

fn respond<T: Serialize>(ctx: &RpcContext, response: Message, body: &Remote<T>) {
    match response.with_json(body) {
        Ok(response) => ctx.reply(response),
        Err(err) => debug!(error = %err, "file service reply not encodable"),
    }
}

fn serve_list(engine: &FileEngine, ctx: &RpcContext, request: Message) {
    let response = request.create_response();
    let dir = match request.decode_json::<ListRequest>() {
        Ok(req) => req.dir,
        Err(err) => return respond::<Vec<String>>(ctx, response, &Err(err.to_string())),
    };

    let replier = ctx.clone();
    let listed = engine.list(
        dir,
        Some(Box::new(move |result: &TaskResult<Vec<String>>| {
            let body = result.clone().map_err(|e| e.to_string());
            respond(&replier, response, &body);
        })),
    );
    if let Err(err) = listed {
        debug!(error = %err, "list not started");
    }
}

fn serve_read(engine: &Arc<FileEngine>, ctx: &RpcContext, request: Message) {
    let response = request.create_response();
    let opened = request
        .decode_json::<ReadRequest>()
        .and_then(|req| contained(Path::new(&req.dir), &req.file))
        .and_then(|path| {
            let handle = engine.open(&path, OpenFlags::READ, 0)?;
            match engine.file_size(handle) {
                Ok(size) => Ok((handle, size as usize)),
                Err(err) => {
                    let _ = engine.close(handle);
                    Err(err)
                }
            }
        });
    let (handle, size) = match opened {
        Ok(opened) => opened,
        Err(err) => return respond::<Vec<u8>>(ctx, response, &Err(err.to_string())),
    };

    let replier = ctx.clone();
    let closer = Arc::clone(engine);
    let read = engine.read(
        handle,
        vec![0; size],
        size,
        0,
        Some(Box::new(move |result: &TaskResult<AioResult>| {
            let body = result
                .as_ref()
                .map(|done| done.bytes().to_vec())
                .map_err(|e| e.to_string());
            respond(&replier, response, &body);
            if let Err(err) = closer.close(handle) {
                debug!(%handle, error = %err, "close after read failed");
            }
        })),
    );
    if let Err(err) = read {
        debug!(%handle, error = %err, "read not started");
        let _ = engine.close(handle);
    }
}

/// Parameters of one copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyRequest {
    pub remote: EndPoint,
    /// Directory on the remote node.
    pub source_dir: String,
    /// Paths relative to `source_dir`. Empty copies the whole directory.
    pub files: Vec<String>,
    pub dest_dir: PathBuf,
    /// Replace existing destination files. When false a collision fails
    /// that file only.
    pub overwrite: bool,
}

/// Outcome of a copy. Files appear in the order they finished.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyReport {
    pub copied: Vec<String>,
    pub failed: Vec<(String, SpindleError)>,
}

impl CopyReport {
    /// First failure encountered, if any.
    pub fn first_error(&self) -> Option<&(String, SpindleError)> {
        self.failed.first()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub type CopyTask = Task<CopyReport>;
pub type CopyCallback = Box<dyn FnOnce(&TaskResult<CopyReport>) + Send>;

/// Copy files from `request.remote` into `request.dest_dir`.
///
/// The returned task fails only if the remote listing fails; per-file
/// failures land in the report. Fails itself only if the executor is shut
/// down.
pub fn copy_remote_files(
    dispatcher: &Arc<Dispatcher>,
    engine: &Arc<FileEngine>,
    request: CopyRequest,
    callback: Option<CopyCallback>,
) -> SpindleResult<CopyTask> {
    let task = CopyTask::pending(AioKind::Copy.code());
    if let Some(callback) = callback {
        task.set_callback(callback);
    }
    engine.executor().arm(&task)?;

    let files = request.files.clone();
    let batch = Arc::new(CopyBatch {
        dispatcher: Arc::clone(dispatcher),
        engine: Arc::clone(engine),
        request,
        report: Mutex::new(CopyReport::default()),
        remaining: AtomicUsize::new(0),
        task: task.clone(),
    });

    if !files.is_empty() {
        batch.start(files);
        return Ok(task);
    }

    let listing = Message::json_request(
        LIST_CODE,
        &ListRequest {
            dir: batch.request.source_dir.clone(),
        },
    );
    let lister = Arc::clone(&batch);
    let called = listing.and_then(|message| {
        dispatcher.call(
            &batch.request.remote,
            message,
            Some(Box::new(move |result: &TaskResult<Message>| {
                let files = result.clone().and_then(|reply| {
                    reply
                        .decode_json::<Remote<Vec<String>>>()?
                        .map_err(remote_failure)
                });
                match files {
                    Ok(files) => lister.start(files),
                    Err(err) => lister.abort(err),
                }
            })),
        )
    });
    if let Err(err) = called {
        batch.abort(err);
    }
    Ok(task)
}

struct CopyBatch {
    dispatcher: Arc<Dispatcher>,
    engine: Arc<FileEngine>,
    request: CopyRequest,
    report: Mutex<CopyReport>,
    remaining: AtomicUsize,
    task: CopyTask,
}

impl CopyBatch {
    fn start(self: &Arc<Self>, files: Vec<String>) {
        debug!(
            remote = %self.request.remote,
            source = %self.request.source_dir,
            count = files.len(),
            "copy started"
        );
        if files.is_empty() {
            self.finish();
            return;
        }
        self.remaining.store(files.len(), Ordering::SeqCst);
        for file in files {
            self.fetch(file);
        }
    }

    fn abort(&self, err: SpindleError) {
        debug!(remote = %self.request.remote, error = %err, "copy aborted");
        self.engine.executor().complete(&self.task, Err(err));
    }

    /// Collision check (unless overwriting), then the remote read.
    fn fetch(self: &Arc<Self>, file: String) {
        let dest = match contained(&self.request.dest_dir, &file) {
            Ok(dest) => dest,
            Err(err) => return self.record(file, Err(err)),
        };
        if self.request.overwrite {
            return self.request_content(file, dest);
        }

        let batch = Arc::clone(self);
        let name = file.clone();
        let target = dest.clone();
        let checked = self.engine.exists(
            &dest,
            Some(Box::new(move |result: &TaskResult<bool>| match result {
                Ok(false) => batch.request_content(name, target),
                Ok(true) => {
                    let err = SpindleError::io(
                        std::io::ErrorKind::AlreadyExists,
                        format!("{} already exists", target.display()),
                    );
                    batch.record(name, Err(err));
                }
                Err(err) => batch.record(name, Err(err.clone())),
            })),
        );
        if let Err(err) = checked {
            self.record(file, Err(err));
        }
    }

    fn request_content(self: &Arc<Self>, file: String, dest: PathBuf) {
        let message = Message::json_request(
            READ_CODE,
            &ReadRequest {
                dir: self.request.source_dir.clone(),
                file: file.clone(),
            },
        );
        let batch = Arc::clone(self);
        let name = file.clone();
        let called = message.and_then(|message| {
            self.dispatcher.call(
                &self.request.remote,
                message,
                Some(Box::new(move |result: &TaskResult<Message>| {
                    let content = result.clone().and_then(|reply| {
                        reply.decode_json::<Remote<Vec<u8>>>()?.map_err(remote_failure)
                    });
                    match content {
                        Ok(content) => batch.store(name, dest, content),
                        Err(err) => batch.record(name, Err(err)),
                    }
                })),
            )
        });
        if let Err(err) = called {
            self.record(file, Err(err));
        }
    }

    /// Make the parent directory, then write the content.
    fn store(self: &Arc<Self>, file: String, dest: PathBuf, content: Vec<u8>) {
        let Some(parent) = dest.parent().map(Path::to_path_buf) else {
            return self.write_local(file, dest, content);
        };
        let batch = Arc::clone(self);
        let name = file.clone();
        let made = self.engine.create_dir_all(
            parent,
            Some(Box::new(move |result: &TaskResult<()>| match result {
                Ok(()) => batch.write_local(name, dest, content),
                Err(err) => batch.record(name, Err(err.clone())),
            })),
        );
        if let Err(err) = made {
            self.record(file, Err(err));
        }
    }

    fn write_local(self: &Arc<Self>, file: String, dest: PathBuf, content: Vec<u8>) {
        let flags = if self.request.overwrite {
            OpenFlags::CREATE.truncate()
        } else {
            OpenFlags::CREATE_NEW
        };
        let opened = self.engine.open(&dest, flags, CREATED_FILE_MODE);
        let handle = match opened {
            Ok(handle) => handle,
            Err(err) => return self.record(file, Err(err)),
        };

        let batch = Arc::clone(self);
        let name = file.clone();
        let len = content.len();
        let written = self.engine.write(
            handle,
            content,
            len,
            0,
            Some(Box::new(move |result: &TaskResult<AioResult>| {
                let _ = batch.engine.close(handle);
                batch.record(name, result.as_ref().map(|_| ()).map_err(Clone::clone));
            })),
        );
        if let Err(err) = written {
            let _ = self.engine.close(handle);
            self.record(file, Err(err));
        }
    }

    fn record(&self, file: String, outcome: SpindleResult<()>) {
        {
            let mut report = self.report.lock().unwrap_or_else(PoisonError::into_inner);
            match outcome {
                Ok(()) => report.copied.push(file),
                Err(err) => {
                    debug!(file = %file, error = %err, "file not copied");
                    report.failed.push((file, err));
                }
            }
        }
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        let report = {
            let mut report = self.report.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *report)
        };
        info!(
            remote = %self.request.remote,
            copied = report.copied.len(),
            failed = report.failed.len(),
            "copy finished"
        );
        self.engine.executor().complete(&self.task, Ok(report));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("a.txt", true)]
    #[case("sub/b.txt", true)]
    #[case("./c.txt", true)]
    #[case("../etc/passwd", false)]
    #[case("/etc/passwd", false)]
    #[case("sub/../../x", false)]
    fn only_contained_paths_resolve(#[case] file: &str, #[case] ok: bool) {
        assert_eq!(contained(Path::new("/data"), file).is_ok(), ok);
    }

    #[test]
    fn report_exposes_first_failure() {
        let mut report = CopyReport::default();
        assert!(report.is_success());
        assert!(report.first_error().is_none());

        report.copied.push("a".to_string());
        report.failed.push(("b".to_string(), SpindleError::Canceled));
        report.failed.push(("c".to_string(), SpindleError::Timeout(5)));

        assert!(!report.is_success());
        assert_eq!(report.first_error().map(|(f, _)| f.as_str()), Some("b"));
    }

    #[test]
    fn remote_failures_are_io_errors() {
        let err = remote_failure("boom".to_string());
        assert_eq!(err.io_kind(), Some(std::io::ErrorKind::Other));
    }
}
