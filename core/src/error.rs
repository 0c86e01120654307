use std::path::PathBuf;

use thiserror::Error;

use crate::storage::{Uid, Xid};

pub type KeelResult<T> = Result<T, KeelError>;

#[derive(Error, Debug)]
pub enum KeelError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File already exists: {}", .0.display())]
    FileExists(PathBuf),

    #[error("File does not exist: {}", .0.display())]
    FileNotExists(PathBuf),

    #[error("File cannot be read or written: {}", .0.display())]
    FileCannotReadWrite(PathBuf),

    #[error("Corrupt transaction ledger: {0}")]
    CorruptLedger(String),

    #[error("Corrupt log: {0}")]
    CorruptLog(String),

    #[error("Corrupt data item: {0}")]
    CorruptData(String),

    #[error("Page cache is full")]
    CacheFull,

    #[error("Memory too small: {pages} pages fit, at least {minimum} required")]
    MemoryTooSmall { pages: usize, minimum: usize },

    #[error("Deadlock detected: transaction {xid} waiting on {uid:#x}")]
    Deadlock { xid: Xid, uid: Uid },

    #[error("Invalid memory spec: {0}")]
    InvalidMemorySpec(String),

    #[error("Data too large: {size} bytes, at most {max} fit in a page")]
    DataTooLarge { size: usize, max: usize },

    #[error("Database busy: no page with free space could be obtained")]
    DatabaseBusy,

    #[error("Concurrent update: transaction {0} cannot update a version it never saw")]
    ConcurrentUpdate(Xid),

    #[error("Transaction {0} was aborted by the engine")]
    TransactionAborted(Xid),

    #[error("No such transaction: {0}")]
    NoSuchTransaction(Xid),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl KeelError {
    /// Get a short error kind name
    pub fn kind(&self) -> &'static str {
        match self {
            KeelError::Io(_) => "io_error",
            KeelError::FileExists(_) => "file_exists",
            KeelError::FileNotExists(_) => "file_not_exists",
            KeelError::FileCannotReadWrite(_) => "file_cannot_read_write",
            KeelError::CorruptLedger(_) => "corrupt_ledger",
            KeelError::CorruptLog(_) => "corrupt_log",
            KeelError::CorruptData(_) => "corrupt_data",
            KeelError::CacheFull => "cache_full",
            KeelError::MemoryTooSmall { .. } => "memory_too_small",
            KeelError::Deadlock { .. } => "deadlock",
            KeelError::InvalidMemorySpec(_) => "invalid_memory_spec",
            KeelError::DataTooLarge { .. } => "data_too_large",
            KeelError::DatabaseBusy => "database_busy",
            KeelError::ConcurrentUpdate(_) => "concurrent_update",
            KeelError::TransactionAborted(_) => "transaction_aborted",
            KeelError::NoSuchTransaction(_) => "no_such_transaction",
            KeelError::Config(_) => "config_error",
        }
    }

    /// Whether the caller may retry the operation (or a new transaction).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KeelError::CacheFull
                | KeelError::Deadlock { .. }
                | KeelError::ConcurrentUpdate(_)
                | KeelError::DatabaseBusy
        )
    }
}

impl From<serde_json::Error> for KeelError {
    fn from(err: serde_json::Error) -> Self {
        KeelError::Config(err.to_string())
    }
}

/// Storage failure past startup. Durability can no longer be reasoned about,
/// so the process stops here.
#[track_caller]
pub fn fatal(context: &str, err: impl std::fmt::Display) -> ! {
    tracing::error!("fatal storage failure ({}): {}", context, err);
    panic!("fatal storage failure ({context}): {err}");
}
