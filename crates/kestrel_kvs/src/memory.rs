//! In-memory multi-version key–value store.
//!
//! Tables are created on first write. Each table is a row tree behind its
//! own lock: row key → column key → (timestamp → value). No lock is held
//! across tables, so concurrent writers to different tables never contend.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use kestrel_common::error::KvsError;
use kestrel_common::types::{Cell, TableRef, Timestamp};

use crate::api::{
    CheckAndSetRequest, KeyValueService, KvsResult, RangeRequest, RowResult, StoredValue,
};

type ColumnVersions = BTreeMap<i64, Vec<u8>>;
type RowColumns = BTreeMap<Vec<u8>, ColumnVersions>;
type RowMap = BTreeMap<Vec<u8>, RowColumns>;

/// Hex-encode a byte slice for diagnostic output.
fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[derive(Default)]
pub struct InMemoryKvs {
    tables: DashMap<TableRef, Arc<RwLock<RowMap>>>,
}

impl InMemoryKvs {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, table: &TableRef) -> Option<Arc<RwLock<RowMap>>> {
        self.tables.get(table).map(|t| Arc::clone(t.value()))
    }

    fn table_or_create(&self, table: &TableRef) -> Arc<RwLock<RowMap>> {
        Arc::clone(
            self.tables
                .entry(table.clone())
                .or_default()
                .value(),
        )
    }

    /// Latest version of a column strictly below `read_ts`.
    fn latest_below(versions: &ColumnVersions, read_ts: Timestamp) -> Option<StoredValue> {
        versions
            .range((Bound::Unbounded, Bound::Excluded(read_ts.0)))
            .next_back()
            .map(|(ts, contents)| StoredValue {
                contents: contents.clone(),
                timestamp: Timestamp(*ts),
            })
    }

    fn row_bounds(range: &RangeRequest) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
        let start = Bound::Included(range.start_row_inclusive.clone());
        let end = if range.end_row_exclusive.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(range.end_row_exclusive.clone())
        };
        (start, end)
    }
}

impl KeyValueService for InMemoryKvs {
    fn get(
        &self,
        table: &TableRef,
        cells: &[(Cell, Timestamp)],
    ) -> KvsResult<BTreeMap<Cell, StoredValue>> {
        let mut result = BTreeMap::new();
        let Some(rows) = self.table(table) else {
            return Ok(result);
        };
        let rows = rows.read();
        for (cell, read_ts) in cells {
            if let Some(value) = rows
                .get(&cell.row)
                .and_then(|columns| columns.get(&cell.col))
                .and_then(|versions| Self::latest_below(versions, *read_ts))
            {
                result.insert(cell.clone(), value);
            }
        }
        Ok(result)
    }

    fn get_range(
        &self,
        table: &TableRef,
        range: &RangeRequest,
        read_ts: Timestamp,
    ) -> KvsResult<Vec<RowResult>> {
        let Some(rows) = self.table(table) else {
            return Ok(Vec::new());
        };
        let rows = rows.read();
        let mut results = Vec::new();
        for (row, columns) in rows.range(Self::row_bounds(range)) {
            let visible: BTreeMap<Vec<u8>, StoredValue> = columns
                .iter()
                .filter_map(|(col, versions)| {
                    Self::latest_below(versions, read_ts).map(|v| (col.clone(), v))
                })
                .collect();
            if !visible.is_empty() {
                results.push(RowResult {
                    row: row.clone(),
                    columns: visible,
                });
            }
        }
        Ok(results)
    }

    fn put(
        &self,
        table: &TableRef,
        values: &BTreeMap<Cell, Vec<u8>>,
        ts: Timestamp,
    ) -> KvsResult<()> {
        let rows = self.table_or_create(table);
        let mut rows = rows.write();
        for (cell, value) in values {
            rows.entry(cell.row.clone())
                .or_default()
                .entry(cell.col.clone())
                .or_default()
                .insert(ts.0, value.clone());
        }
        Ok(())
    }

    fn delete(&self, table: &TableRef, cells: &[(Cell, Timestamp)]) -> KvsResult<()> {
        let Some(rows) = self.table(table) else {
            return Ok(());
        };
        let mut rows = rows.write();
        for (cell, ts) in cells {
            let Some(columns) = rows.get_mut(&cell.row) else {
                continue;
            };
            if let Some(versions) = columns.get_mut(&cell.col) {
                versions.remove(&ts.0);
                if versions.is_empty() {
                    columns.remove(&cell.col);
                }
            }
            if columns.is_empty() {
                rows.remove(&cell.row);
            }
        }
        Ok(())
    }

    fn delete_range(&self, table: &TableRef, range: &RangeRequest) -> KvsResult<()> {
        let Some(rows) = self.table(table) else {
            return Ok(());
        };
        let mut rows = rows.write();
        let doomed: Vec<Vec<u8>> = rows
            .range(Self::row_bounds(range))
            .map(|(row, _)| row.clone())
            .collect();
        tracing::trace!(
            table = %table,
            start = %hex_encode(&range.start_row_inclusive),
            rows = doomed.len(),
            "delete_range"
        );
        for row in doomed {
            rows.remove(&row);
        }
        Ok(())
    }

    fn check_and_set(&self, request: &CheckAndSetRequest) -> KvsResult<()> {
        let rows = self.table_or_create(&request.table);
        let mut rows = rows.write();
        let current = rows
            .get(&request.cell.row)
            .and_then(|columns| columns.get(&request.cell.col))
            .and_then(|versions| versions.values().next_back().cloned());
        if current != request.expected {
            return Err(KvsError::CheckAndSetConflict { actual: current });
        }
        // Conditional cells are single-version: the new value replaces the
        // old at the fixed timestamp 0.
        rows.entry(request.cell.row.clone())
            .or_default()
            .entry(request.cell.col.clone())
            .or_default()
            .insert(0, request.new_value.clone());
        Ok(())
    }
}
