//! StdDisk - std::fs による DiskProvider
//!
//! Each operation runs on the blocking pool of the io runtime with
//! positioned I/O, so concurrent operations on one handle never share a
//! cursor.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{SpindleError, SpindleResult};
use crate::impls::IoRuntime;
use crate::ports::{DiskCompletion, DiskProvider};

pub struct StdDisk {
    io: Arc<IoRuntime>,
}

impl StdDisk {
    pub fn new(io: Arc<IoRuntime>) -> Self {
        Self { io }
    }
}

fn join_failure(err: tokio::task::JoinError) -> SpindleError {
    SpindleError::io(io::ErrorKind::Other, format!("disk operation aborted: {err}"))
}

#[async_trait]
impl DiskProvider for StdDisk {
    async fn read_at(
        &self,
        file: Arc<File>,
        mut buffer: Vec<u8>,
        count: usize,
        offset: u64,
    ) -> DiskCompletion {
        let joined = self
            .io
            .handle()
            .spawn_blocking(move || {
                let count = count.min(buffer.len());
                let outcome =
                    read_full_at(&file, &mut buffer[..count], offset).map_err(SpindleError::from);
                (buffer, outcome)
            })
            .await;
        joined.unwrap_or_else(|e| (Vec::new(), Err(join_failure(e))))
    }

    async fn write_at(
        &self,
        file: Arc<File>,
        buffer: Vec<u8>,
        count: usize,
        offset: u64,
    ) -> DiskCompletion {
        let joined = self
            .io
            .handle()
            .spawn_blocking(move || {
                let count = count.min(buffer.len());
                let outcome = write_full_at(&file, &buffer[..count], offset)
                    .map(|()| count)
                    .map_err(SpindleError::from);
                (buffer, outcome)
            })
            .await;
        joined.unwrap_or_else(|e| (Vec::new(), Err(join_failure(e))))
    }

    async fn list_files(&self, dir: PathBuf) -> SpindleResult<Vec<String>> {
        self.io
            .handle()
            .spawn_blocking(move || -> SpindleResult<Vec<String>> {
                let mut files = Vec::new();
                walk(&dir, &dir, &mut files)?;
                files.sort();
                Ok(files)
            })
            .await
            .map_err(join_failure)?
    }

    async fn exists(&self, path: PathBuf) -> SpindleResult<bool> {
        self.io
            .handle()
            .spawn_blocking(move || path.try_exists().map_err(SpindleError::from))
            .await
            .map_err(join_failure)?
    }

    async fn create_dir_all(&self, dir: PathBuf) -> SpindleResult<()> {
        self.io
            .handle()
            .spawn_blocking(move || fs::create_dir_all(&dir).map_err(SpindleError::from))
            .await
            .map_err(join_failure)?
    }
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk(root, &path, out)?;
        } else if file_type.is_file()
            && let Ok(relative) = path.strip_prefix(root)
        {
            let parts: Vec<String> = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            out.push(parts.join("/"));
        }
    }
    Ok(())
}

/// 短い読み込みは EOF のときだけ
#[cfg(unix)]
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;

    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

#[cfg(unix)]
fn write_full_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;

    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;

    let mut done = 0;
    while done < buf.len() {
        match file.seek_read(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

#[cfg(windows)]
fn write_full_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;

    let mut done = 0;
    while done < buf.len() {
        match file.seek_write(&buf[done..], offset + done as u64) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
