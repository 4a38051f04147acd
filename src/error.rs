//! Error taxonomy for the storage engine.
//!
//! Read-path "end of data" conditions (e.g. `Index::get` past the end) are
//! modeled as `Option`/`bool` returns and never surface here; `StoreError`
//! covers everything the spec calls out as a thrown error.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("optimistic concurrency violation on stream {stream:?}: expected version {expected}, found {actual}")]
    OptimisticConcurrency {
        stream: String,
        expected: u64,
        actual: u64,
    },

    #[error("corrupt file {path:?}: {reason}")]
    CorruptFile { path: PathBuf, reason: String },

    #[error("invalid data size at position {position} in {path:?}: expected {expected}, found {actual}")]
    InvalidDataSize {
        path: PathBuf,
        position: u64,
        expected: u64,
        actual: u64,
    },

    #[error("metadata mismatch reopening {path:?}")]
    MetadataMismatch { path: PathBuf },

    #[error("invalid header in {path:?}: {reason}")]
    InvalidHeader { path: PathBuf, reason: String },

    #[error("version mismatch in {path:?}: expected {expected}, found {actual}")]
    VersionMismatch {
        path: PathBuf,
        expected: u8,
        actual: u8,
    },

    #[error("stream {name:?} already exists")]
    StreamExists { name: String },

    #[error("lock held on {path:?}")]
    LockHeld { path: PathBuf },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;
