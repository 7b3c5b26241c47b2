//! Routing of enqueued writes to (shard, strategy, timestamp) groups.
//!
//! Shard assignment hashes the write's identity — table plus cell — with
//! xxHash3-64 and reduces modulo the shard count in force at enqueue time.
//! Rows already enqueued are never relocated when the shard count grows;
//! the sweeper keeps draining them from the shard they were routed to.

use std::collections::BTreeMap;
use std::sync::Arc;

use xxhash_rust::xxh3::xxh3_64;

use kestrel_common::config::SweepQueueConfig;
use kestrel_common::error::KestrelResult;
use kestrel_common::types::{
    Cell, ShardAndStrategy, SweepStrategy, TableRef, Timestamp, WriteInfo,
};
use kestrel_kvs::KeyValueService;

use crate::progress::ShardProgress;

/// Supplies the sweep strategy configured for a table, or `None` for tables
/// that are not swept at all (their writes never enter the queue).
pub trait SweepStrategyResolver: Send + Sync {
    fn strategy_for_table(&self, table: &TableRef) -> Option<SweepStrategy>;
}

/// One enqueue group: every write of one transaction routed to one shard
/// under one strategy. The fine partition is implied by the timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionInfo {
    pub shard_and_strategy: ShardAndStrategy,
    pub timestamp: Timestamp,
}

pub struct WriteInfoPartitioner<K> {
    resolver: Arc<dyn SweepStrategyResolver>,
    progress: Arc<ShardProgress<K>>,
    config: Arc<SweepQueueConfig>,
}

impl<K: KeyValueService> WriteInfoPartitioner<K> {
    pub fn new(
        resolver: Arc<dyn SweepStrategyResolver>,
        progress: Arc<ShardProgress<K>>,
        config: Arc<SweepQueueConfig>,
    ) -> Self {
        Self {
            resolver,
            progress,
            config,
        }
    }

    /// The shard count currently in force. Read once per enqueue call so a
    /// concurrent resize cannot split one call across shard counts.
    pub fn num_shards(&self) -> KestrelResult<u32> {
        self.progress.get_number_of_shards()
    }

    pub fn fine_partition(&self, ts: Timestamp) -> i64 {
        self.config.ts_partition_fine(ts.0)
    }

    pub fn coarse_partition(&self, ts: Timestamp) -> i64 {
        self.config.ts_partition_coarse(ts.0)
    }

    /// Drop writes to unswept tables and group the rest by shard, strategy,
    /// and start timestamp.
    pub fn filter_and_partition(
        &self,
        writes: &[WriteInfo],
        num_shards: u32,
    ) -> BTreeMap<PartitionInfo, Vec<WriteInfo>> {
        let mut partitions: BTreeMap<PartitionInfo, Vec<WriteInfo>> = BTreeMap::new();
        for write in writes {
            let Some(strategy) = self.resolver.strategy_for_table(&write.table) else {
                continue;
            };
            let shard = shard_of(&write.table, &write.cell, num_shards);
            let info = PartitionInfo {
                shard_and_strategy: ShardAndStrategy::of(shard, strategy),
                timestamp: write.timestamp,
            };
            partitions.entry(info).or_default().push(write.clone());
        }
        partitions
    }
}

/// Deterministic shard for a write identity: xxh3 over the length-delimited
/// concatenation of table name, row, and column, mod the shard count.
pub fn shard_of(table: &TableRef, cell: &Cell, num_shards: u32) -> u32 {
    let mut buf =
        Vec::with_capacity(12 + table.as_bytes().len() + cell.row.len() + cell.col.len());
    for part in [table.as_bytes(), cell.row.as_slice(), cell.col.as_slice()] {
        buf.extend_from_slice(&(part.len() as u32).to_be_bytes());
        buf.extend_from_slice(part);
    }
    (xxh3_64(&buf) % num_shards as u64) as u32
}
