//! Custom error types for the backup engine.

use std::path::PathBuf;
use thiserror::Error;

use crate::device::DeviceError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("path does not exist: {0}")]
    PathMissing(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device I/O error: {0}")]
    DeviceIo(#[from] DeviceError),

    /// The current medium is full and no replacement medium is available.
    #[error("end of medium, no further media available")]
    EndOfMedium,

    #[error("checksum mismatch for {name}: computed {computed:#010x}, stored {stored:#010x}")]
    ChecksumMismatch {
        name: String,
        computed: u32,
        stored: u32,
    },

    #[error("unknown chunk format version {0:#010x}")]
    UnknownFormatVersion(u32),

    #[error("malformed chunk image: {0}")]
    Format(String),

    /// The file can never be placed, not even in an empty chunk (for example
    /// because its metadata entry alone exceeds the reserved header area).
    #[error("file does not fit in an empty chunk: {0}")]
    Unpackable(PathBuf),

    #[error("pipeline stage failed: {0}")]
    Pipeline(String),

    #[error("backup job cancelled")]
    Cancelled,
}

impl EngineError {
    /// Whether this outcome is a user-requested cancellation rather than a
    /// genuine failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
