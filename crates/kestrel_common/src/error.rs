use thiserror::Error;

use crate::types::{TableRef, Timestamp};

/// Convenience alias for `Result<T, KestrelError>`.
pub type KestrelResult<T> = Result<T, KestrelError>;

/// Top-level error type that all crate-specific errors convert into.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("KVS error: {0}")]
    Kvs(#[from] KvsError),

    #[error("Transaction error: {0}")]
    Txn(#[from] TxnError),

    #[error("Sweep error: {0}")]
    Sweep(#[from] SweepError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

/// Key-value-service layer errors.
#[derive(Error, Debug)]
pub enum KvsError {
    /// A conditional put found a different stored value than expected.
    /// `actual` is the value found (None when the cell was absent).
    #[error("Check-and-set conflict: stored value did not match the expectation")]
    CheckAndSetConflict { actual: Option<Vec<u8>> },

    /// A retriable backend failure. The caller retries the whole batch; the
    /// sweep read path is restartable by design.
    #[error("Transient KVS failure: {0}")]
    Transient(String),
}

/// Transaction-table errors.
#[derive(Error, Debug)]
pub enum TxnError {
    #[error("Commit entry for start timestamp {start_ts} already exists")]
    AlreadyDecided { start_ts: Timestamp },

    #[error("Corrupt commit entry for start timestamp {start_ts}: {reason}")]
    CorruptCommitEntry { start_ts: Timestamp, reason: String },
}

/// Sweep-queue errors.
#[derive(Error, Debug)]
pub enum SweepError {
    /// The requested window is not contained in the requested fine
    /// partition. Checked synchronously, before any KVS call.
    #[error(
        "fine partition {fine_partition} does not cover the window \
         ({min_ts_exclusive}, {max_ts_exclusive})"
    )]
    InvalidArgument {
        fine_partition: i64,
        min_ts_exclusive: Timestamp,
        max_ts_exclusive: Timestamp,
    },

    /// A queue row key failed to decode. Never skipped silently.
    #[error("corrupt sweep queue row {row_hex}: {reason}")]
    CorruptRow { row_hex: String, reason: String },

    /// A queue entry value failed to decode.
    #[error("corrupt sweep queue value: {reason}")]
    CorruptValue { reason: String },

    /// A reference row points at a dedicated chain row that does not exist.
    #[error(
        "dangling dedicated-row pointer in {table}: start timestamp {start_ts}, \
         dedicated row {dedicated_row_number} is missing"
    )]
    PointerDangling {
        table: TableRef,
        start_ts: Timestamp,
        dedicated_row_number: u64,
    },
}

/// Rejected sweep queue configuration.
#[derive(Error, Debug)]
#[error("invalid sweep queue configuration: {0}")]
pub struct ConfigError(pub String);
