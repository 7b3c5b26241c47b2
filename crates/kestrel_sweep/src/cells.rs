//! The sweep-queue cell table.
//!
//! Enqueue groups a batch of writes by (shard, strategy, start timestamp)
//! and appends them to the reference row of the covering fine partition,
//! spilling oversized transactions into dedicated row chains. The read path
//! drains one (shard, strategy, partition, window) at a time: it streams the
//! reference row, follows dedicated chains, resolves commit state per
//! transaction, aborts dormant uncommitted transactions in place, deletes
//! the user-table versions of aborted writes, and reduces the survivors to
//! the latest write per cell.
//!
//! No lock is held across KVS calls; the only cross-table writes the read
//! path performs are the in-band abort (a conditional put on the
//! transaction table) and the version-precise user-table deletes.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use kestrel_common::config::SweepQueueConfig;
use kestrel_common::error::{KestrelResult, SweepError};
use kestrel_common::types::{Cell, ShardAndStrategy, TableRef, Timestamp, WriteInfo};
use kestrel_kvs::{KeyValueService, RangeRequest};
use kestrel_txn::{CommitState, TransactionTable};

use crate::batch::{SweepBatch, SweepBatchAccumulator};
use crate::keys::{
    DedicatedRowPointer, SweepableCellsColumn, SweepableCellsRow, SweepableCellsValue,
    WriteReference,
};
use crate::metrics::SweepMetrics;
use crate::partitioner::{PartitionInfo, WriteInfoPartitioner};
use crate::{READ_TS, SWEEPABLE_CELLS_TABLE_NAME, WRITE_TS};

pub struct SweepableCells<K> {
    kvs: Arc<K>,
    partitioner: WriteInfoPartitioner<K>,
    txn_table: Arc<TransactionTable<K>>,
    metrics: Arc<SweepMetrics>,
    config: Arc<SweepQueueConfig>,
    table: TableRef,
}

impl<K: KeyValueService> SweepableCells<K> {
    pub fn new(
        kvs: Arc<K>,
        partitioner: WriteInfoPartitioner<K>,
        txn_table: Arc<TransactionTable<K>>,
        metrics: Arc<SweepMetrics>,
        config: Arc<SweepQueueConfig>,
    ) -> Self {
        Self {
            kvs,
            partitioner,
            txn_table,
            metrics,
            config,
            table: TableRef::new(SWEEPABLE_CELLS_TABLE_NAME),
        }
    }

    /// Enqueue a batch of transactional writes. Returns the set of sweep
    /// domains the batch touched, for downstream coordination.
    ///
    /// The shard count is read once per call, so a concurrent shard resize
    /// cannot split a single batch across shard counts. Writes to unswept
    /// tables are dropped.
    pub fn enqueue(&self, writes: &[WriteInfo]) -> KestrelResult<HashSet<ShardAndStrategy>> {
        let num_shards = self.partitioner.num_shards()?;
        let partitions = self.partitioner.filter_and_partition(writes, num_shards);

        let mut touched = HashSet::new();
        let mut queue_puts: BTreeMap<Cell, Vec<u8>> = BTreeMap::new();
        let mut enqueued: BTreeMap<ShardAndStrategy, u64> = BTreeMap::new();
        for (info, group) in &partitions {
            touched.insert(info.shard_and_strategy);
            *enqueued.entry(info.shard_and_strategy).or_default() += group.len() as u64;
            self.populate_cells(info, group, &mut queue_puts);
        }

        if !queue_puts.is_empty() {
            self.kvs.put(&self.table, &queue_puts, WRITE_TS)?;
        }
        for (shard_and_strategy, count) in enqueued {
            self.metrics
                .record_enqueued_writes(shard_and_strategy.strategy, count);
        }
        tracing::debug!(
            writes = writes.len(),
            cells = queue_puts.len(),
            domains = touched.len(),
            "enqueued sweep queue batch"
        );
        Ok(touched)
    }

    /// Compute the sweep batch for one shard, strategy, fine partition, and
    /// timestamp window `(min_ts_exclusive, max_ts_exclusive)`.
    pub fn get_batch_for_partition(
        &self,
        shard_and_strategy: ShardAndStrategy,
        fine_partition: i64,
        min_ts_exclusive: Timestamp,
        max_ts_exclusive: Timestamp,
    ) -> KestrelResult<SweepBatch> {
        self.validate_partition_and_range(fine_partition, min_ts_exclusive, max_ts_exclusive)?;

        let by_ts = self.read_reference_entries(
            shard_and_strategy,
            fine_partition,
            min_ts_exclusive,
            max_ts_exclusive,
        )?;

        // Consume transactions in start-timestamp order, expanding dedicated
        // chains as they are encountered. The transaction that pushes the
        // entry count past the batch size is consumed in full, then the scan
        // stops.
        let mut consumed: BTreeMap<Timestamp, Vec<WriteReference>> = BTreeMap::new();
        let mut entries_read: u64 = 0;
        let mut cutoff_at: Option<Timestamp> = None;
        for (start_ts, entries) in by_ts {
            let mut txn_entries = Vec::new();
            for (column, value) in entries {
                match value {
                    SweepableCellsValue::Entry(write_ref) => txn_entries.push(write_ref),
                    SweepableCellsValue::Pointer(pointer) => {
                        txn_entries.extend(self.read_dedicated_row(
                            shard_and_strategy,
                            start_ts,
                            column,
                            pointer,
                        )?);
                    }
                }
            }
            entries_read += txn_entries.len() as u64;
            consumed.insert(start_ts, txn_entries);
            if entries_read > self.config.sweep_batch_size as u64 {
                cutoff_at = Some(start_ts);
                break;
            }
        }

        // One batched lookup over exactly the transactions consumed;
        // transactions past the cutoff are neither resolved nor aborted.
        let start_tss: BTreeSet<Timestamp> = consumed.keys().copied().collect();
        let commit_states = self.txn_table.get_commit_states(&start_tss)?;

        let mut accumulator = SweepBatchAccumulator::new();
        for (start_ts, entries) in consumed {
            let mut state = commit_states
                .get(&start_ts)
                .copied()
                .unwrap_or(CommitState::InProgress);
            if state == CommitState::InProgress {
                state = self.txn_table.try_abort(start_ts)?;
            }
            match state {
                CommitState::Committed(commit_ts) if commit_ts < max_ts_exclusive => {
                    for write_ref in entries {
                        accumulator.add_committed_write(write_ref.into_write_info(start_ts));
                    }
                }
                CommitState::Committed(commit_ts) => {
                    // Committed past the sweep horizon: not visible to this
                    // batch. The entries stay queued, untouched.
                    tracing::trace!(
                        start_ts = start_ts.0,
                        commit_ts = commit_ts.0,
                        "skipping transaction committed past the sweep horizon"
                    );
                }
                CommitState::Aborted => {
                    for write_ref in entries {
                        accumulator.add_aborted_write(write_ref.into_write_info(start_ts));
                    }
                }
                CommitState::InProgress => {
                    // The abort lost its race yet no outcome was readable.
                    // Leave the entries queued; a later batch resolves them.
                    tracing::warn!(
                        start_ts = start_ts.0,
                        "transaction state unresolved after in-band abort"
                    );
                }
            }
        }

        for (table, cells) in accumulator.aborted_deletes() {
            self.kvs.delete(table, cells)?;
        }
        self.metrics
            .record_aborted_writes_deleted(shard_and_strategy.strategy, accumulator.aborted_count());
        self.metrics
            .record_entries_read(shard_and_strategy.strategy, entries_read);

        let last_swept = match cutoff_at {
            Some(progress_ts) => progress_ts,
            None => Timestamp(std::cmp::min(
                max_ts_exclusive.0 - 1,
                self.config.max_ts_for_fine_partition(fine_partition),
            )),
        };
        let batch = accumulator.freeze(last_swept);
        tracing::debug!(
            shard = shard_and_strategy.shard,
            strategy = %shard_and_strategy.strategy,
            fine_partition,
            entries_read,
            writes = batch.writes.len(),
            last_swept = last_swept.0,
            "assembled sweep batch"
        );
        Ok(batch)
    }

    /// Delete the reference row of a fully swept partition. Idempotent.
    pub fn delete_non_dedicated_row(
        &self,
        shard_and_strategy: ShardAndStrategy,
        fine_partition: i64,
    ) -> KestrelResult<()> {
        let row = SweepableCellsRow::reference(
            fine_partition,
            shard_and_strategy.strategy,
            shard_and_strategy.shard,
        );
        tracing::debug!(
            shard = shard_and_strategy.shard,
            strategy = %shard_and_strategy.strategy,
            fine_partition,
            "deleting sweep queue reference row"
        );
        self.delete_row(&row.persist_to_bytes())
    }

    /// Delete every dedicated chain row referenced from a fully swept
    /// partition's reference row. Idempotent: missing rows are no-ops.
    pub fn delete_dedicated_rows(
        &self,
        shard_and_strategy: ShardAndStrategy,
        fine_partition: i64,
    ) -> KestrelResult<()> {
        let pointers = self.scan_pointer_entries(shard_and_strategy, fine_partition)?;
        tracing::debug!(
            shard = shard_and_strategy.shard,
            strategy = %shard_and_strategy.strategy,
            fine_partition,
            dedicated_rows = pointers.len(),
            "deleting sweep queue dedicated rows"
        );
        for (start_ts, pointer) in pointers {
            let row = SweepableCellsRow::dedicated(
                start_ts,
                shard_and_strategy.strategy,
                shard_and_strategy.shard,
                pointer.dedicated_row_number,
            );
            self.delete_row(&row.persist_to_bytes())?;
        }
        Ok(())
    }

    fn validate_partition_and_range(
        &self,
        fine_partition: i64,
        min_ts_exclusive: Timestamp,
        max_ts_exclusive: Timestamp,
    ) -> Result<(), SweepError> {
        let invalid = SweepError::InvalidArgument {
            fine_partition,
            min_ts_exclusive,
            max_ts_exclusive,
        };
        if min_ts_exclusive >= max_ts_exclusive {
            return Err(invalid);
        }
        let lowest = self.config.ts_partition_fine(min_ts_exclusive.0 + 1);
        let highest = self.config.ts_partition_fine(max_ts_exclusive.0 - 1);
        if fine_partition < lowest || fine_partition > highest {
            return Err(invalid);
        }
        Ok(())
    }

    /// Scan the reference row, decode its cells, and group the in-window
    /// entries by start timestamp. Pointer entries are kept alongside value
    /// entries; expansion happens during consumption.
    #[allow(clippy::type_complexity)]
    fn read_reference_entries(
        &self,
        shard_and_strategy: ShardAndStrategy,
        fine_partition: i64,
        min_ts_exclusive: Timestamp,
        max_ts_exclusive: Timestamp,
    ) -> KestrelResult<BTreeMap<Timestamp, Vec<(SweepableCellsColumn, SweepableCellsValue)>>> {
        let row = SweepableCellsRow::reference(
            fine_partition,
            shard_and_strategy.strategy,
            shard_and_strategy.shard,
        );
        let results = self.kvs.get_range(
            &self.table,
            &RangeRequest::single_row(&row.persist_to_bytes()),
            READ_TS,
        )?;
        let partition_start = self.config.min_ts_for_fine_partition(fine_partition);

        let mut by_ts: BTreeMap<Timestamp, Vec<(SweepableCellsColumn, SweepableCellsValue)>> =
            BTreeMap::new();
        for row_result in results {
            for (column_bytes, stored) in &row_result.columns {
                let column = SweepableCellsColumn::hydrate_from_bytes(column_bytes)?;
                let start_ts = Timestamp(partition_start + column.timestamp_offset);
                if start_ts <= min_ts_exclusive || start_ts >= max_ts_exclusive {
                    continue;
                }
                let value = SweepableCellsValue::hydrate_from_bytes(&stored.contents)?;
                match &value {
                    SweepableCellsValue::Entry(_) if column.is_pointer() => {
                        return Err(SweepError::CorruptValue {
                            reason: format!(
                                "write entry stored under pointer column at start_ts {start_ts}"
                            ),
                        }
                        .into());
                    }
                    SweepableCellsValue::Pointer(pointer) if !column.is_pointer() => {
                        return Err(SweepError::CorruptValue {
                            reason: format!(
                                "pointer to dedicated row {} stored under write column at \
                                 start_ts {start_ts}",
                                pointer.dedicated_row_number
                            ),
                        }
                        .into());
                    }
                    _ => {}
                }
                by_ts.entry(start_ts).or_default().push((column, value));
            }
        }
        Ok(by_ts)
    }

    /// Read one dedicated chain row in full, in column order. A pointer
    /// whose row is missing is corruption, not silence.
    fn read_dedicated_row(
        &self,
        shard_and_strategy: ShardAndStrategy,
        start_ts: Timestamp,
        column: SweepableCellsColumn,
        pointer: DedicatedRowPointer,
    ) -> KestrelResult<Vec<WriteReference>> {
        debug_assert!(column.is_pointer());
        let row = SweepableCellsRow::dedicated(
            start_ts,
            shard_and_strategy.strategy,
            shard_and_strategy.shard,
            pointer.dedicated_row_number,
        );
        let results = self.kvs.get_range(
            &self.table,
            &RangeRequest::single_row(&row.persist_to_bytes()),
            READ_TS,
        )?;

        let mut entries = Vec::new();
        for row_result in results {
            for (column_bytes, stored) in &row_result.columns {
                let column = SweepableCellsColumn::hydrate_from_bytes(column_bytes)?;
                match SweepableCellsValue::hydrate_from_bytes(&stored.contents)? {
                    SweepableCellsValue::Entry(write_ref) => entries.push(write_ref),
                    SweepableCellsValue::Pointer(_) => {
                        return Err(SweepError::CorruptValue {
                            reason: format!(
                                "pointer entry inside dedicated row {} at start_ts {start_ts} \
                                 (column offset {})",
                                pointer.dedicated_row_number, column.timestamp_offset
                            ),
                        }
                        .into());
                    }
                }
            }
        }
        if entries.is_empty() {
            return Err(SweepError::PointerDangling {
                table: self.table.clone(),
                start_ts,
                dedicated_row_number: pointer.dedicated_row_number,
            }
            .into());
        }
        Ok(entries)
    }

    /// Pointer entries of a partition's reference row, with the anchor start
    /// timestamp of each. No window filter: cleanup covers the whole
    /// partition.
    fn scan_pointer_entries(
        &self,
        shard_and_strategy: ShardAndStrategy,
        fine_partition: i64,
    ) -> KestrelResult<Vec<(Timestamp, DedicatedRowPointer)>> {
        let row = SweepableCellsRow::reference(
            fine_partition,
            shard_and_strategy.strategy,
            shard_and_strategy.shard,
        );
        let results = self.kvs.get_range(
            &self.table,
            &RangeRequest::single_row(&row.persist_to_bytes()),
            READ_TS,
        )?;
        let partition_start = self.config.min_ts_for_fine_partition(fine_partition);

        let mut pointers = Vec::new();
        for row_result in results {
            for (column_bytes, stored) in &row_result.columns {
                let column = SweepableCellsColumn::hydrate_from_bytes(column_bytes)?;
                if !column.is_pointer() {
                    continue;
                }
                match SweepableCellsValue::hydrate_from_bytes(&stored.contents)? {
                    SweepableCellsValue::Pointer(pointer) => {
                        let start_ts = Timestamp(partition_start + column.timestamp_offset);
                        pointers.push((start_ts, pointer));
                    }
                    SweepableCellsValue::Entry(_) => {
                        return Err(SweepError::CorruptValue {
                            reason: "write entry stored under pointer column".to_string(),
                        }
                        .into());
                    }
                }
            }
        }
        Ok(pointers)
    }

    /// Stage the queue cells for one (shard, strategy, start timestamp)
    /// group: inline entries in the reference row for small transactions, a
    /// dedicated chain plus pointer entries for large ones.
    fn populate_cells(
        &self,
        info: &PartitionInfo,
        writes: &[WriteInfo],
        out: &mut BTreeMap<Cell, Vec<u8>>,
    ) {
        let strategy = info.shard_and_strategy.strategy;
        let shard = info.shard_and_strategy.shard;
        let fine_partition = self.config.ts_partition_fine(info.timestamp.0);
        let offset = info.timestamp.0 - self.config.min_ts_for_fine_partition(fine_partition);
        let reference_row = SweepableCellsRow::reference(fine_partition, strategy, shard)
            .persist_to_bytes();

        if writes.len() <= self.config.max_cells_generic {
            for (index, write) in writes.iter().enumerate() {
                let column = SweepableCellsColumn::new(offset, index as u32);
                out.insert(
                    Cell::new(reference_row.clone(), column.persist_to_bytes()),
                    SweepableCellsValue::entry(write).persist_to_bytes(),
                );
            }
            return;
        }

        let num_dedicated_rows = writes.len().div_ceil(self.config.max_cells_dedicated) as u64;
        for (row_number, chunk) in writes.chunks(self.config.max_cells_dedicated).enumerate() {
            let row_number = row_number as u64;
            let dedicated_row =
                SweepableCellsRow::dedicated(info.timestamp, strategy, shard, row_number)
                    .persist_to_bytes();
            for (index, write) in chunk.iter().enumerate() {
                let column = SweepableCellsColumn::new(0, index as u32);
                out.insert(
                    Cell::new(dedicated_row.clone(), column.persist_to_bytes()),
                    SweepableCellsValue::entry(write).persist_to_bytes(),
                );
            }
            let pointer_column = SweepableCellsColumn::pointer(offset, row_number);
            out.insert(
                Cell::new(reference_row.clone(), pointer_column.persist_to_bytes()),
                SweepableCellsValue::pointer(row_number, num_dedicated_rows).persist_to_bytes(),
            );
        }
    }

    fn delete_row(&self, row_key: &[u8]) -> KestrelResult<()> {
        self.kvs
            .delete_range(&self.table, &RangeRequest::single_row(row_key))?;
        Ok(())
    }
}
