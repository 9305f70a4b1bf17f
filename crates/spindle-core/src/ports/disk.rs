//! DiskProvider port - 低レベルのディスク I/O
//!
//! Positioned reads and writes complete asynchronously; the file engine turns
//! each completion into a task delivery. Buffers are moved in and handed back
//! with the outcome so the caller gets them back on failure too.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::SpindleResult;

/// Buffer returned by a disk operation together with its outcome
/// (bytes transferred, or the error).
pub type DiskCompletion = (Vec<u8>, SpindleResult<usize>);

#[async_trait]
pub trait DiskProvider: Send + Sync {
    /// Read up to `count` bytes at `offset` into the front of `buffer`.
    /// Fewer bytes than requested means end of file.
    async fn read_at(
        &self,
        file: Arc<File>,
        buffer: Vec<u8>,
        count: usize,
        offset: u64,
    ) -> DiskCompletion;

    /// Write the first `count` bytes of `buffer` at `offset`.
    async fn write_at(
        &self,
        file: Arc<File>,
        buffer: Vec<u8>,
        count: usize,
        offset: u64,
    ) -> DiskCompletion;

    /// Regular files under `dir`, recursively, as `/`-separated paths
    /// relative to `dir`, sorted.
    async fn list_files(&self, dir: PathBuf) -> SpindleResult<Vec<String>>;

    async fn exists(&self, path: PathBuf) -> SpindleResult<bool>;

    /// `dir` and any missing parents.
    async fn create_dir_all(&self, dir: PathBuf) -> SpindleResult<()>;
}
