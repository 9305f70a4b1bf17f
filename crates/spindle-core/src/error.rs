use std::io;

use thiserror::Error;

/// Error taxonomy shared by every surface of the core.
///
/// Administrative calls (register/unregister/open/close) return it directly.
/// Asynchronous operations only ever surface it through the terminal state of
/// their task, so it has to be `Clone`: the same failure is handed to the
/// callback and kept for later `wait()` callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpindleError {
    /// Invalid handle, duplicate or missing registration, bad input.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// Operation not valid for the current task state.
    #[error("invalid state: {0}")]
    State(String),

    /// Failure surfaced from storage.
    #[error("io error ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },

    /// Unreachable end point or transport failure.
    #[error("network error: {0}")]
    Network(String),

    /// A wait or an RPC exceeded its budget. The task itself is untouched.
    #[error("timed out after {0} ms")]
    Timeout(u64),

    #[error("canceled")]
    Canceled,

    /// Message envelope or payload could not be (de)serialized.
    #[error("codec error: {0}")]
    Codec(String),

    #[error("config error: {0}")]
    Config(String),
}

impl SpindleError {
    pub fn argument(message: impl Into<String>) -> Self {
        Self::Argument(message.into())
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::State(message.into())
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    pub fn io(kind: io::ErrorKind, message: impl Into<String>) -> Self {
        Self::Io {
            kind,
            message: message.into(),
        }
    }

    /// `io::ErrorKind` of an I/O failure, if this is one.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Io { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<io::Error> for SpindleError {
    fn from(err: io::Error) -> Self {
        Self::Io {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for SpindleError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

pub type SpindleResult<T> = Result<T, SpindleError>;
