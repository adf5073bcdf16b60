use rusqlite::{Error as RusqliteError, ErrorCode};
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FormShiftError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),

    #[error("Column '{column}' already exists on table '{table}'")]
    DuplicateColumn { table: String, column: String },

    #[error("Column '{column}' does not exist on table '{table}'")]
    ColumnNotFound { table: String, column: String },

    #[error(
        "Cannot convert '{column}' on '{table}' from {from} to {to}: {} row(s) hold unconvertible values",
        row_ids.len()
    )]
    UnsafeConversion {
        table: String,
        column: String,
        from: String,
        to: String,
        row_ids: Vec<i64>,
    },

    #[error("Migration {history_id} cannot be rolled back: {reason}")]
    NotRollbackable { history_id: i64, reason: String },

    #[error("Backup failed: {0}")]
    BackupFailed(String),

    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("Job {job_id} exceeded its {timeout_secs}s operation timeout")]
    QueueJobTimeout { job_id: i64, timeout_secs: u64 },

    #[error("Form '{0}' has migrations in flight")]
    FormBusy(String),

    #[error("Job {0} is already running and cannot be cancelled")]
    JobNotCancellable(i64),

    #[error("Restore conflict: {0}")]
    RestoreConflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Shutting down")]
    ShuttingDown,

    #[error("Error: {0}")]
    Error(String),
}

impl FormShiftError {
    /// Stable, machine-readable name for the error, surfaced to API callers.
    pub fn kind(&self) -> &'static str {
        match self {
            FormShiftError::IoError(_) => "IoError",
            FormShiftError::DatabaseError(_) => "DatabaseError",
            FormShiftError::PoolError(_) => "DatabaseError",
            FormShiftError::DuplicateColumn { .. } => "DuplicateColumnError",
            FormShiftError::ColumnNotFound { .. } => "ColumnNotFoundError",
            FormShiftError::UnsafeConversion { .. } => "UnsafeConversionError",
            FormShiftError::NotRollbackable { .. } => "NotRollbackableError",
            FormShiftError::BackupFailed(_) => "BackupFailedError",
            FormShiftError::TransactionAborted(_) => "TransactionAbortedError",
            FormShiftError::QueueJobTimeout { .. } => "QueueJobTimeoutError",
            FormShiftError::FormBusy(_) => "FormBusyError",
            FormShiftError::JobNotCancellable(_) => "JobNotCancellableError",
            FormShiftError::RestoreConflict(_) => "RestoreConflictError",
            FormShiftError::NotFound(_) => "NotFoundError",
            FormShiftError::InvalidInput(_) => "InvalidInputError",
            FormShiftError::ShuttingDown => "ShuttingDownError",
            FormShiftError::Error(_) => "Error",
        }
    }

    /// Whether a queued job that failed with this error should be attempted again.
    ///
    /// Schema conflicts and unconvertible data fail the same way every time, so they
    /// go straight to the dead-letter area.
    pub fn is_retryable(&self) -> bool {
        match self {
            FormShiftError::TransactionAborted(_)
            | FormShiftError::QueueJobTimeout { .. }
            | FormShiftError::BackupFailed(_)
            | FormShiftError::PoolError(_)
            | FormShiftError::IoError(_) => true,
            FormShiftError::DatabaseError(e) => matches!(
                e.sqlite_error_code(),
                Some(ErrorCode::DatabaseBusy)
                    | Some(ErrorCode::DatabaseLocked)
                    | Some(ErrorCode::OperationInterrupted)
            ),
            _ => false,
        }
    }

    /// Row ids blocking a conversion, if this is an `UnsafeConversion`.
    pub fn offending_rows(&self) -> Option<&[i64]> {
        match self {
            FormShiftError::UnsafeConversion { row_ids, .. } => Some(row_ids),
            _ => None,
        }
    }

    pub fn is_interrupt(&self) -> bool {
        matches!(
            self,
            FormShiftError::DatabaseError(e)
                if e.sqlite_error_code() == Some(ErrorCode::OperationInterrupted)
        )
    }
}
