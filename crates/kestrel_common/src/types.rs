//! Core value types shared by the sweep queue crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A transaction timestamp.
///
/// Signed so that the sentinel `INITIAL` (-1) sorts below every real
/// timestamp; all timestamps handed out by the timestamp service are
/// non-negative.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Sentinel below any real timestamp. Persisted shard progress starts
    /// here so that the first real update is always an increase.
    pub const INITIAL: Timestamp = Timestamp(-1);

    pub const MAX: Timestamp = Timestamp(i64::MAX);
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to a user or system table.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TableRef(String);

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cell address: row name plus column name, both opaque byte strings.
/// Ordering is lexicographic on the row, then the column — the same order
/// the KVS stores them in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Cell {
    pub row: Vec<u8>,
    pub col: Vec<u8>,
}

impl Cell {
    pub fn new(row: impl Into<Vec<u8>>, col: impl Into<Vec<u8>>) -> Self {
        Self {
            row: row.into(),
            col: col.into(),
        }
    }
}

/// The queue identity of a write: which cell of which table it touched.
/// Timestamps are versions of this identity, not part of it; the read path
/// reduces entries to the latest write per `CellReference`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CellReference {
    pub table: TableRef,
    pub cell: Cell,
}

/// One enqueued transactional write: a cell, the transaction's start
/// timestamp, and whether the write was a deletion.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WriteInfo {
    pub table: TableRef,
    pub cell: Cell,
    pub timestamp: Timestamp,
    pub is_tombstone: bool,
}

impl WriteInfo {
    pub fn write(table: TableRef, cell: Cell, timestamp: Timestamp) -> Self {
        Self {
            table,
            cell,
            timestamp,
            is_tombstone: false,
        }
    }

    pub fn tombstone(table: TableRef, cell: Cell, timestamp: Timestamp) -> Self {
        Self {
            table,
            cell,
            timestamp,
            is_tombstone: true,
        }
    }

    pub fn cell_reference(&self) -> CellReference {
        CellReference {
            table: self.table.clone(),
            cell: self.cell.clone(),
        }
    }
}

/// How aggressively swept values may be reclaimed for a table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SweepStrategy {
    /// Keep deletion tombstones readable: a reader holding an old snapshot
    /// may still need to observe that the cell was deleted.
    Conservative,
    /// Tombstones themselves may be removed once swept.
    Thorough,
}

impl SweepStrategy {
    pub fn is_conservative(self) -> bool {
        matches!(self, SweepStrategy::Conservative)
    }

    /// Whether the downstream deleter must leave a readable deletion marker
    /// in place of swept values.
    pub fn retains_tombstones(self) -> bool {
        self.is_conservative()
    }

    /// Stable label for metrics and logs.
    pub fn label(self) -> &'static str {
        match self {
            SweepStrategy::Conservative => "conservative",
            SweepStrategy::Thorough => "thorough",
        }
    }
}

impl fmt::Display for SweepStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One sweep isolation domain: a shard paired with a strategy. At most one
/// sweep consumer operates per domain; enqueues may touch any number of
/// domains concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardAndStrategy {
    pub shard: u32,
    pub strategy: SweepStrategy,
}

impl ShardAndStrategy {
    pub fn of(shard: u32, strategy: SweepStrategy) -> Self {
        Self { shard, strategy }
    }

    pub fn conservative(shard: u32) -> Self {
        Self::of(shard, SweepStrategy::Conservative)
    }

    pub fn thorough(shard: u32) -> Self {
        Self::of(shard, SweepStrategy::Thorough)
    }
}

impl fmt::Display for ShardAndStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard {} ({})", self.shard, self.strategy)
    }
}
