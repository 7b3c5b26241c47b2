use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Sweep queue configuration. All values are fixed at process start; the
/// number of shards actually in use is persisted separately and may only
/// grow (up to `max_shards`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepQueueConfig {
    /// Upper bound on the persisted shard count.
    pub max_shards: u32,
    /// Shard count assumed until one has been persisted.
    pub default_shards: u32,
    /// Width of a fine timestamp partition — the scan unit of one read batch.
    pub fine_partition_size: i64,
    /// Width of a coarse partition. Must be a multiple of the fine width.
    pub coarse_partition_size: i64,
    /// Largest transaction (cell count) stored inline in a reference row.
    /// Anything bigger spills into a dedicated row chain.
    pub max_cells_generic: usize,
    /// Cell capacity of a single dedicated row.
    pub max_cells_dedicated: usize,
    /// Entry-count cutoff for one sweep batch. The transaction that pushes
    /// the count past this limit is still consumed in full.
    pub sweep_batch_size: usize,
}

impl Default for SweepQueueConfig {
    fn default() -> Self {
        Self {
            max_shards: 256,
            default_shards: 1,
            fine_partition_size: 50_000,
            coarse_partition_size: 10_000_000,
            max_cells_generic: 50,
            max_cells_dedicated: 100_000,
            sweep_batch_size: 1000,
        }
    }
}

impl SweepQueueConfig {
    /// Validate the invariants the row layout depends on. Call once at
    /// construction; the codec assumes a validated config.
    pub fn validate(self) -> Result<Self, ConfigError> {
        if self.fine_partition_size <= 0 {
            return Err(ConfigError("fine_partition_size must be positive".into()));
        }
        if self.coarse_partition_size % self.fine_partition_size != 0 {
            return Err(ConfigError(format!(
                "coarse_partition_size {} is not a multiple of fine_partition_size {}",
                self.coarse_partition_size, self.fine_partition_size
            )));
        }
        // Timestamp offsets within a fine partition are persisted as u40.
        if self.fine_partition_size > (1 << 40) {
            return Err(ConfigError(format!(
                "fine_partition_size {} exceeds the 40-bit offset encoding",
                self.fine_partition_size
            )));
        }
        if self.max_cells_generic > self.max_cells_dedicated {
            return Err(ConfigError(format!(
                "max_cells_generic {} exceeds max_cells_dedicated {}",
                self.max_cells_generic, self.max_cells_dedicated
            )));
        }
        // Write indices are persisted as u24, with the top of the range
        // reserved for dedicated-row pointer entries.
        if self.max_cells_dedicated >= 0xF0_0000 {
            return Err(ConfigError(format!(
                "max_cells_dedicated {} collides with the reserved write-index range",
                self.max_cells_dedicated
            )));
        }
        if self.sweep_batch_size == 0 {
            return Err(ConfigError("sweep_batch_size must be positive".into()));
        }
        if self.max_shards > (1 << 24) {
            return Err(ConfigError(format!(
                "max_shards {} exceeds the 24-bit shard encoding",
                self.max_shards
            )));
        }
        if self.default_shards == 0 || self.default_shards > self.max_shards {
            return Err(ConfigError(format!(
                "default_shards {} must be in 1..={}",
                self.default_shards, self.max_shards
            )));
        }
        Ok(self)
    }

    /// The fine partition containing `ts`.
    pub fn ts_partition_fine(&self, ts: i64) -> i64 {
        ts / self.fine_partition_size
    }

    /// The coarse partition containing `ts`.
    pub fn ts_partition_coarse(&self, ts: i64) -> i64 {
        ts / self.coarse_partition_size
    }

    /// First timestamp of a fine partition.
    pub fn min_ts_for_fine_partition(&self, fine_partition: i64) -> i64 {
        fine_partition * self.fine_partition_size
    }

    /// Last timestamp of a fine partition.
    pub fn max_ts_for_fine_partition(&self, fine_partition: i64) -> i64 {
        (fine_partition + 1) * self.fine_partition_size - 1
    }
}
