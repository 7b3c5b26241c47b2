//! The key–value-service seam the sweep queue is written against.
//!
//! The production backend lives elsewhere; this crate fixes the operations
//! the queue consumes (versioned point reads, ordered row scans, version-
//! precise deletes, row-range deletes, and conditional puts) and ships an
//! in-memory implementation for embedding and tests.

use std::collections::BTreeMap;

use kestrel_common::error::KvsError;
use kestrel_common::types::{Cell, TableRef, Timestamp};

pub type KvsResult<T> = Result<T, KvsError>;

/// A stored value together with the timestamp it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredValue {
    pub contents: Vec<u8>,
    pub timestamp: Timestamp,
}

/// A row-range scan request: rows in `[start_row_inclusive,
/// end_row_exclusive)` in lexicographic row-key order. An empty end bound
/// means "to the end of the table".
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RangeRequest {
    pub start_row_inclusive: Vec<u8>,
    pub end_row_exclusive: Vec<u8>,
}

impl RangeRequest {
    pub fn of(start_row_inclusive: impl Into<Vec<u8>>, end_row_exclusive: impl Into<Vec<u8>>) -> Self {
        Self {
            start_row_inclusive: start_row_inclusive.into(),
            end_row_exclusive: end_row_exclusive.into(),
        }
    }

    /// The range covering exactly one row.
    pub fn single_row(row: &[u8]) -> Self {
        Self::of(row.to_vec(), next_lexicographic_name(row))
    }
}

/// One row of a range scan. Columns are in ascending column-key order, each
/// carrying its latest visible version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowResult {
    pub row: Vec<u8>,
    pub columns: BTreeMap<Vec<u8>, StoredValue>,
}

/// A conditional put. `expected = None` asserts the cell is absent.
#[derive(Debug, Clone)]
pub struct CheckAndSetRequest {
    pub table: TableRef,
    pub cell: Cell,
    pub expected: Option<Vec<u8>>,
    pub new_value: Vec<u8>,
}

impl CheckAndSetRequest {
    /// Create the cell, failing if any value is already present.
    pub fn new_cell(table: TableRef, cell: Cell, new_value: Vec<u8>) -> Self {
        Self {
            table,
            cell,
            expected: None,
            new_value,
        }
    }

    /// Replace the current value, failing unless it equals `expected`.
    pub fn single_cell(table: TableRef, cell: Cell, expected: Vec<u8>, new_value: Vec<u8>) -> Self {
        Self {
            table,
            cell,
            expected: Some(expected),
            new_value,
        }
    }
}

/// The operations the sweep queue consumes. Implementations are expected to
/// provide read-your-writes: a put that completes before a read starts is
/// visible to that read.
pub trait KeyValueService: Send + Sync {
    /// Point-read each requested cell, returning the latest version written
    /// strictly below that cell's read timestamp. Absent cells are omitted
    /// from the result.
    fn get(
        &self,
        table: &TableRef,
        cells: &[(Cell, Timestamp)],
    ) -> KvsResult<BTreeMap<Cell, StoredValue>>;

    /// Scan rows in lexicographic order over the requested range. Within a
    /// row, columns ascend by column key; each cell carries its latest
    /// version written strictly below `read_ts`. Rows with no visible cells
    /// are omitted.
    fn get_range(
        &self,
        table: &TableRef,
        range: &RangeRequest,
        read_ts: Timestamp,
    ) -> KvsResult<Vec<RowResult>>;

    /// Write every cell at the given timestamp. Overwriting an existing
    /// (cell, timestamp) pair replaces its value.
    fn put(&self, table: &TableRef, values: &BTreeMap<Cell, Vec<u8>>, ts: Timestamp)
        -> KvsResult<()>;

    /// Delete exactly the named (cell, timestamp) versions. Other versions
    /// of the same cells are untouched.
    fn delete(&self, table: &TableRef, cells: &[(Cell, Timestamp)]) -> KvsResult<()>;

    /// Delete every version of every cell in the row range. A no-op on an
    /// empty range.
    fn delete_range(&self, table: &TableRef, range: &RangeRequest) -> KvsResult<()>;

    /// Atomic conditional put. Fails with `KvsError::CheckAndSetConflict`
    /// (carrying the value actually found) when the stored value does not
    /// match the expectation.
    fn check_and_set(&self, request: &CheckAndSetRequest) -> KvsResult<()>;
}

/// The shortest byte string strictly greater than `name` in lexicographic
/// order: `name` with a zero byte appended. Used to turn a row key into the
/// exclusive end bound of a single-row range.
pub fn next_lexicographic_name(name: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(name.len() + 1);
    next.extend_from_slice(name);
    next.push(0x00);
    next
}
