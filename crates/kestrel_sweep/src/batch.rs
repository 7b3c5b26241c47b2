//! Sweep batch value type and its accumulator.

use std::collections::{BTreeMap, HashMap};

use kestrel_common::types::{Cell, CellReference, TableRef, Timestamp, WriteInfo};

/// A batch for the sweeper: a possibly empty set of writes and the highest
/// timestamp guaranteed to have been swept once the batch is processed.
/// Order within `writes` is not significant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepBatch {
    pub writes: Vec<WriteInfo>,
    pub last_swept_timestamp: Timestamp,
}

/// Accumulates the outcome of one partition read, then freezes into an
/// immutable `SweepBatch`.
///
/// Committed writes are reduced to the latest per cell as they arrive;
/// aborted writes are collected per table for the version-precise deletes
/// the read path issues before returning.
#[derive(Debug, Default)]
pub(crate) struct SweepBatchAccumulator {
    latest_writes: HashMap<CellReference, WriteInfo>,
    aborted_deletes: BTreeMap<TableRef, Vec<(Cell, Timestamp)>>,
    aborted_count: u64,
}

impl SweepBatchAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a committed, in-window write. Keeps the greatest timestamp per
    /// cell; `(cell, start_ts)` is unique in the queue, so ties cannot occur.
    pub fn add_committed_write(&mut self, write: WriteInfo) {
        match self.latest_writes.entry(write.cell_reference()) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                if write.timestamp > entry.get().timestamp {
                    entry.insert(write);
                }
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(write);
            }
        }
    }

    /// Record an aborted write whose user-table version must be deleted.
    pub fn add_aborted_write(&mut self, write: WriteInfo) {
        self.aborted_deletes
            .entry(write.table)
            .or_default()
            .push((write.cell, write.timestamp));
        self.aborted_count += 1;
    }

    pub fn aborted_deletes(&self) -> &BTreeMap<TableRef, Vec<(Cell, Timestamp)>> {
        &self.aborted_deletes
    }

    pub fn aborted_count(&self) -> u64 {
        self.aborted_count
    }

    pub fn freeze(self, last_swept_timestamp: Timestamp) -> SweepBatch {
        SweepBatch {
            writes: self.latest_writes.into_values().collect(),
            last_swept_timestamp,
        }
    }
}
