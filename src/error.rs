use crate::common::TxId;
use thiserror::Error;

/// Crate-wide error type for heap, cache, WAL and pool operations.
#[derive(Error, Debug)]
pub enum HeapError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("out of space: {0}")]
    OutOfSpace(String),

    #[error("heap header corrupted: {0}")]
    CorruptHeader(String),

    #[error("checkpoint in progress on page {0}")]
    CheckpointBusy(u32),

    #[error("operation lost a race, retry: {0}")]
    Retry(String),

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("allocation class id out of range: {0}")]
    ClassIdRange(u16),

    #[error("WAL submit failed for tx {tx_id}: {reason}")]
    WalSubmit { tx_id: TxId, reason: String },

    #[error("WAL replay failed: {0}")]
    WalReplay(String),

    #[error("store flush failed: {0}")]
    FlushFailed(String),

    #[error("transaction aborted: {0}")]
    TxAborted(String),

    #[error("transaction stage violation: {0}")]
    TxStage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl HeapError {
    /// Whether the caller may retry the operation at the next quiescent
    /// point without treating the pool as faulted.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HeapError::CheckpointBusy(_) | HeapError::Retry(_) | HeapError::Busy(_)
        )
    }

    /// POSIX-style error number, for the transaction errno interface.
    pub fn errno(&self) -> i32 {
        match self {
            HeapError::Io(_) => 5,                 // EIO
            HeapError::InvalidArgument(_) => 22,   // EINVAL
            HeapError::OutOfSpace(_) => 12,        // ENOMEM
            HeapError::CorruptHeader(_) => 22,     // EINVAL
            HeapError::CheckpointBusy(_) => 16,    // EBUSY
            HeapError::Retry(_) => 11,             // EAGAIN
            HeapError::Busy(_) => 16,              // EBUSY
            HeapError::AlreadyExists(_) => 17,     // EEXIST
            HeapError::NotFound(_) => 2,           // ENOENT
            HeapError::ClassIdRange(_) => 34,      // ERANGE
            HeapError::WalSubmit { .. } => 5,      // EIO
            HeapError::WalReplay(_) => 5,          // EIO
            HeapError::FlushFailed(_) => 5,        // EIO
            HeapError::TxAborted(_) => 125,        // ECANCELED
            HeapError::TxStage(_) => 22,           // EINVAL
            HeapError::Serialization(_) => 22,     // EINVAL
            HeapError::Internal(_) => 5,           // EIO
        }
    }
}

pub type Result<T> = std::result::Result<T, HeapError>;
