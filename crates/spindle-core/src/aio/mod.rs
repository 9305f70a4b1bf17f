//! AIO - 非同期ファイル I/O とリモートコピー

pub mod copy;
pub mod engine;

pub use self::copy::{
    CopyCallback, CopyReport, CopyRequest, CopyTask, FileService, copy_remote_files,
};
pub use self::engine::{AioCallback, AioKind, AioResult, AioTask, FileEngine, OpenFlags};
