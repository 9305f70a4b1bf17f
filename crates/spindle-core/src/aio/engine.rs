//! FileEngine - ハンドル単位の非同期ファイル I/O
//!
//! `open`/`close`/`file_size` are synchronous administrative calls.
//! `read`/`write`/`list`/`exists`/`create_dir_all` return pending tasks:
//! the disk provider does the work on the io runtime and the completion
//! comes back through `Executor::complete`, so callbacks always run on a
//! worker.
//!
//! Buffers are owned and moved into the operation. A successful operation
//! hands the buffer back in its `AioResult`.
//!
//! `close` is the only barrier on a handle: operations whose disk work has
//! not started are canceled, the rest are drained before it returns.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::domain::{FileHandle, TaskCode, TaskState};
use crate::error::{SpindleError, SpindleResult};
use crate::impls::IoRuntime;
use crate::ports::DiskProvider;
use crate::task::{Executor, Task, TaskResult, current_task_id};

/// How `open` treats the target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    /// Create if missing.
    pub create: bool,
    /// Create, failing with `AlreadyExists` if the file is there.
    pub create_new: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub const READ: Self = Self {
        read: true,
        write: false,
        create: false,
        create_new: false,
        truncate: false,
    };

    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
        create: false,
        create_new: false,
        truncate: false,
    };

    /// Read-write, created if missing.
    pub const CREATE: Self = Self {
        create: true,
        ..Self::READ_WRITE
    };

    pub const CREATE_NEW: Self = Self {
        create_new: true,
        ..Self::READ_WRITE
    };

    pub fn truncate(self) -> Self {
        Self {
            truncate: true,
            ..self
        }
    }

    fn options(self, pmode: u32) -> OpenOptions {
        let mut options = OpenOptions::new();
        options
            .read(self.read)
            .write(self.write)
            .create(self.create)
            .create_new(self.create_new)
            .truncate(self.truncate);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(pmode);
        }
        #[cfg(not(unix))]
        let _ = pmode;
        options
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AioKind {
    Read,
    Write,
    List,
    Stat,
    MakeDir,
    Copy,
}

impl AioKind {
    pub fn code(self) -> TaskCode {
        TaskCode::new(match self {
            AioKind::Read => "aio.read",
            AioKind::Write => "aio.write",
            AioKind::List => "aio.list",
            AioKind::Stat => "aio.stat",
            AioKind::MakeDir => "aio.mkdir",
            AioKind::Copy => "aio.copy",
        })
    }
}

/// Buffer handed back by a finished read or write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AioResult {
    pub buffer: Vec<u8>,
    /// Bytes read or written. A read shorter than requested hit end of file.
    pub transferred: usize,
}

impl AioResult {
    /// The transferred prefix of the buffer.
    pub fn bytes(&self) -> &[u8] {
        &self.buffer[..self.transferred.min(self.buffer.len())]
    }
}

pub type AioTask = Task<AioResult>;
pub type AioCallback = Box<dyn FnOnce(&TaskResult<AioResult>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiskPhase {
    Queued,
    Started,
    Done,
    /// Closed before the disk work began; it never will.
    Abandoned,
}

/// Disk-side progress of one operation, independent of its task state.
struct DiskGate {
    phase: Mutex<DiskPhase>,
    changed: Condvar,
}

impl DiskGate {
    fn new() -> Self {
        Self {
            phase: Mutex::new(DiskPhase::Queued),
            changed: Condvar::new(),
        }
    }

    /// Queued -> Started. False if `close` got there first.
    fn begin(&self) -> bool {
        let mut phase = relock(&self.phase);
        if *phase != DiskPhase::Queued {
            return false;
        }
        *phase = DiskPhase::Started;
        true
    }

    fn finish(&self) {
        *relock(&self.phase) = DiskPhase::Done;
        self.changed.notify_all();
    }

    /// Queued -> Abandoned. False if the disk work already began.
    fn abandon(&self) -> bool {
        let mut phase = relock(&self.phase);
        if *phase != DiskPhase::Queued {
            return false;
        }
        *phase = DiskPhase::Abandoned;
        true
    }

    fn is_settled(&self) -> bool {
        matches!(*relock(&self.phase), DiskPhase::Done | DiskPhase::Abandoned)
    }

    fn wait_settled(&self) {
        let mut phase = relock(&self.phase);
        while !matches!(*phase, DiskPhase::Done | DiskPhase::Abandoned) {
            phase = self
                .changed
                .wait(phase)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

struct Outstanding {
    task: AioTask,
    gate: Arc<DiskGate>,
}

struct OpenFile {
    file: Arc<File>,
    path: PathBuf,
    outstanding: Vec<Outstanding>,
}

fn relock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct FileEngine {
    executor: Arc<Executor>,
    disk: Arc<dyn DiskProvider>,
    io: Arc<IoRuntime>,
    handles: Mutex<HashMap<FileHandle, OpenFile>>,
}

impl FileEngine {
    pub fn new(executor: Arc<Executor>, disk: Arc<dyn DiskProvider>, io: Arc<IoRuntime>) -> Self {
        Self {
            executor,
            disk,
            io,
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Open `path`; `pmode` sets the permission bits of a created file
    /// (ignored off unix). Fails with `SpindleError::Io` (not found,
    /// permission denied, already exists for `CREATE_NEW`).
    pub fn open(
        &self,
        path: impl AsRef<Path>,
        flags: OpenFlags,
        pmode: u32,
    ) -> SpindleResult<FileHandle> {
        let path = path.as_ref();
        let file = flags.options(pmode).open(path)?;
        let handle = FileHandle::generate();
        relock(&self.handles).insert(
            handle,
            OpenFile {
                file: Arc::new(file),
                path: path.to_path_buf(),
                outstanding: Vec::new(),
            },
        );
        debug!(%handle, path = %path.display(), "file opened");
        Ok(handle)
    }

    pub fn file_size(&self, handle: FileHandle) -> SpindleResult<u64> {
        let file = self.file(handle)?;
        Ok(file.metadata()?.len())
    }

    pub fn path(&self, handle: FileHandle) -> SpindleResult<PathBuf> {
        relock(&self.handles)
            .get(&handle)
            .map(|open| open.path.clone())
            .ok_or_else(|| unknown_handle(handle))
    }

    pub fn open_handles(&self) -> usize {
        relock(&self.handles).len()
    }

    /// Read `count` bytes at `offset` into the front of `buffer`.
    ///
    /// Fails only if the executor is shut down. An unknown handle or a
    /// `count` larger than the buffer fails the returned task.
    pub fn read(
        &self,
        handle: FileHandle,
        buffer: Vec<u8>,
        count: usize,
        offset: u64,
        callback: Option<AioCallback>,
    ) -> SpindleResult<AioTask> {
        self.submit(AioKind::Read, handle, buffer, count, offset, callback)
    }

    /// Write the first `count` bytes of `buffer` at `offset`.
    pub fn write(
        &self,
        handle: FileHandle,
        buffer: Vec<u8>,
        count: usize,
        offset: u64,
        callback: Option<AioCallback>,
    ) -> SpindleResult<AioTask> {
        self.submit(AioKind::Write, handle, buffer, count, offset, callback)
    }

    /// Files under `dir`, recursively, as sorted `/`-separated relative
    /// paths.
    pub fn list(
        &self,
        dir: impl Into<PathBuf>,
        callback: Option<Box<dyn FnOnce(&TaskResult<Vec<String>>) + Send>>,
    ) -> SpindleResult<Task<Vec<String>>> {
        let dir = dir.into();
        self.on_disk(AioKind::List, callback, |disk| async move {
            disk.list_files(dir).await
        })
    }

    /// Whether `path` exists, checked off the worker threads.
    pub fn exists(
        &self,
        path: impl Into<PathBuf>,
        callback: Option<Box<dyn FnOnce(&TaskResult<bool>) + Send>>,
    ) -> SpindleResult<Task<bool>> {
        let path = path.into();
        self.on_disk(AioKind::Stat, callback, |disk| async move {
            disk.exists(path).await
        })
    }

    /// Create `dir` and any missing parents.
    pub fn create_dir_all(
        &self,
        dir: impl Into<PathBuf>,
        callback: Option<Box<dyn FnOnce(&TaskResult<()>) + Send>>,
    ) -> SpindleResult<Task<()>> {
        let dir = dir.into();
        self.on_disk(AioKind::MakeDir, callback, |disk| async move {
            disk.create_dir_all(dir).await
        })
    }

    /// Pending task completed by a handle-less disk operation.
    fn on_disk<T, F, Fut>(
        &self,
        kind: AioKind,
        callback: Option<Box<dyn FnOnce(&TaskResult<T>) + Send>>,
        op: F,
    ) -> SpindleResult<Task<T>>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn DiskProvider>) -> Fut,
        Fut: Future<Output = SpindleResult<T>> + Send + 'static,
    {
        let task = Task::pending(kind.code());
        if let Some(callback) = callback {
            task.set_callback(callback);
        }
        self.executor.arm(&task)?;

        let work = op(Arc::clone(&self.disk));
        let executor = Arc::clone(&self.executor);
        let done = task.clone();
        self.io.handle().spawn(async move {
            let outcome = work.await;
            executor.complete(&done, outcome);
        });
        Ok(task)
    }

    /// Release `handle`. Operations whose disk work has not started are
    /// canceled. The others are drained: `close` returns only after their
    /// disk work finished, and after any of their callbacks already running
    /// returned (unless that callback is the caller).
    pub fn close(&self, handle: FileHandle) -> SpindleResult<()> {
        let open = relock(&self.handles)
            .remove(&handle)
            .ok_or_else(|| unknown_handle(handle))?;

        let mut intercepted = 0;
        let mut drained = 0;
        for op in &open.outstanding {
            if op.gate.abandon() {
                op.task.cancel(false);
                intercepted += 1;
                continue;
            }
            op.gate.wait_settled();
            drained += 1;
            if op.task.state() == TaskState::Running && current_task_id() != Some(op.task.id()) {
                op.task.wait(None);
            }
        }
        debug!(
            %handle,
            path = %open.path.display(),
            intercepted,
            drained,
            "file closed"
        );
        Ok(())
    }

    fn file(&self, handle: FileHandle) -> SpindleResult<Arc<File>> {
        relock(&self.handles)
            .get(&handle)
            .map(|open| Arc::clone(&open.file))
            .ok_or_else(|| unknown_handle(handle))
    }

    fn submit(
        &self,
        kind: AioKind,
        handle: FileHandle,
        buffer: Vec<u8>,
        count: usize,
        offset: u64,
        callback: Option<AioCallback>,
    ) -> SpindleResult<AioTask> {
        let task = AioTask::pending(kind.code());
        if let Some(callback) = callback {
            task.set_callback(callback);
        }
        self.executor.arm(&task)?;

        if count > buffer.len() {
            self.executor.complete(
                &task,
                Err(SpindleError::argument(format!(
                    "count {count} exceeds buffer of {} bytes",
                    buffer.len()
                ))),
            );
            return Ok(task);
        }

        let gate = Arc::new(DiskGate::new());
        let file = relock(&self.handles).get_mut(&handle).map(|open| {
            open.outstanding.retain(|op| !op.gate.is_settled());
            open.outstanding.push(Outstanding {
                task: task.clone(),
                gate: Arc::clone(&gate),
            });
            Arc::clone(&open.file)
        });
        let Some(file) = file else {
            self.executor.complete(&task, Err(unknown_handle(handle)));
            return Ok(task);
        };

        trace!(%handle, ?kind, count, offset, "aio submitted");
        let disk = Arc::clone(&self.disk);
        let executor = Arc::clone(&self.executor);
        let done = task.clone();
        self.io.handle().spawn(async move {
            if !gate.begin() {
                return;
            }
            // canceled by its owner before the disk saw it
            if done.is_terminal() {
                gate.finish();
                return;
            }
            let (buffer, outcome) = match kind {
                AioKind::Write => disk.write_at(file, buffer, count, offset).await,
                _ => disk.read_at(file, buffer, count, offset).await,
            };
            let result = outcome.map(|transferred| AioResult {
                buffer,
                transferred,
            });
            executor.complete(&done, result);
            gate.finish();
        });
        Ok(task)
    }
}

fn unknown_handle(handle: FileHandle) -> SpindleError {
    SpindleError::argument(format!("unknown file handle {handle}"))
}
