//! Targeted sweep queue.
//!
//! A multi-version store retains every write at its commit timestamp; this
//! queue records each transactional write so the background sweeper can
//! reclaim overwritten and aborted versions without scanning user tables.
//! Writes are routed by shard and sweep strategy into timestamp-partitioned
//! rows; the sweeper pulls batches scoped to one shard and one fine
//! partition, and deletes the queue rows once a partition is fully swept.
//!
//! Layout of the cell table:
//! - A *reference row* per (shard, strategy, fine partition) holds the
//!   entries of every small transaction routed there.
//! - A transaction writing more cells than fit inline spills into a chain of
//!   *dedicated rows* anchored at its start timestamp; the reference row
//!   keeps one pointer entry per chain row.

pub mod batch;
pub mod cells;
pub mod keys;
pub mod metrics;
pub mod partitioner;
pub mod progress;


pub use batch::SweepBatch;
pub use cells::SweepableCells;
pub use metrics::{SweepMetrics, SweepMetricsSnapshot};
pub use partitioner::{SweepStrategyResolver, WriteInfoPartitioner};
pub use progress::ShardProgress;

use kestrel_common::types::Timestamp;

/// Name of the sweep-queue cell table.
pub const SWEEPABLE_CELLS_TABLE_NAME: &str = "_sweep_cells";

/// Name of the shard-progress table.
pub const SHARD_PROGRESS_TABLE_NAME: &str = "_sweep_shard_progress";

/// Timestamp queue rows are written at. The queue table is logically
/// unversioned; entries carry their transaction timestamps in column keys.
pub(crate) const WRITE_TS: Timestamp = Timestamp(0);

/// Timestamp queue rows are read at: everything is visible.
pub(crate) const READ_TS: Timestamp = Timestamp::MAX;
