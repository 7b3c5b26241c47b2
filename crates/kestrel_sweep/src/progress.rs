//! Persisted sweep progress per (shard, strategy).
//!
//! One cell per shard and strategy holds the last swept timestamp; the
//! sentinel shard index `-1` under the conservative strategy holds the
//! persisted shard count. Every update is increase-to-at-least via
//! check-and-set: a concurrent advance to a higher value counts as success.

use std::sync::Arc;

use kestrel_common::config::SweepQueueConfig;
use kestrel_common::error::{ConfigError, KestrelResult, KvsError, SweepError};
use kestrel_common::types::{Cell, ShardAndStrategy, SweepStrategy, TableRef, Timestamp};
use kestrel_kvs::{CheckAndSetRequest, KeyValueService};

use crate::{READ_TS, SHARD_PROGRESS_TABLE_NAME};

/// Sentinel shard index storing the persisted shard count.
const SHARD_COUNT_INDEX: i64 = -1;

const PROGRESS_COLUMN: &[u8] = b"v";

pub struct ShardProgress<K> {
    kvs: Arc<K>,
    table: TableRef,
    config: Arc<SweepQueueConfig>,
}

impl<K: KeyValueService> ShardProgress<K> {
    pub fn new(kvs: Arc<K>, config: Arc<SweepQueueConfig>) -> Self {
        Self {
            kvs,
            table: TableRef::new(SHARD_PROGRESS_TABLE_NAME),
            config,
        }
    }

    /// The persisted shard count, or the configured default if none has
    /// been persisted yet.
    pub fn get_number_of_shards(&self) -> KestrelResult<u32> {
        let persisted = self.get_or_initial(
            shard_count_cell(),
            self.config.default_shards as i64,
        )?;
        Ok(persisted as u32)
    }

    /// Raise the persisted shard count to at least `new_number`. Returns the
    /// latest known persisted count, which may exceed `new_number`.
    pub fn update_number_of_shards(&self, new_number: u32) -> KestrelResult<u32> {
        if new_number > self.config.max_shards {
            return Err(ConfigError(format!(
                "shard count {new_number} exceeds max_shards {}",
                self.config.max_shards
            ))
            .into());
        }
        let persisted = self.increase_value_to_at_least(shard_count_cell(), new_number as i64)?;
        Ok(persisted as u32)
    }

    /// The last swept timestamp for a shard and strategy, or the initial
    /// sentinel if the shard has never been swept.
    pub fn get_last_swept_timestamp(
        &self,
        shard_and_strategy: ShardAndStrategy,
    ) -> KestrelResult<Timestamp> {
        let value = self.get_or_initial(
            progress_cell(shard_and_strategy.shard as i64, shard_and_strategy.strategy),
            Timestamp::INITIAL.0,
        )?;
        Ok(Timestamp(value))
    }

    /// Raise the persisted last swept timestamp to at least `timestamp`.
    /// Returns the latest known persisted value.
    pub fn update_last_swept_timestamp(
        &self,
        shard_and_strategy: ShardAndStrategy,
        timestamp: Timestamp,
    ) -> KestrelResult<Timestamp> {
        let cell = progress_cell(shard_and_strategy.shard as i64, shard_and_strategy.strategy);
        let persisted = self.increase_value_to_at_least(cell, timestamp.0)?;
        Ok(Timestamp(persisted))
    }

    fn get_or_initial(&self, cell: Cell, initial: i64) -> KestrelResult<i64> {
        match self.read_value(&cell)? {
            Some(value) => Ok(value),
            None => Ok(initial),
        }
    }

    fn read_value(&self, cell: &Cell) -> KestrelResult<Option<i64>> {
        let found = self.kvs.get(&self.table, &[(cell.clone(), READ_TS)])?;
        found
            .get(cell)
            .map(|value| decode_value(&value.contents))
            .transpose()
    }

    /// CAS loop raising the stored value to at least `new_val`. An absent
    /// cell counts as the initial sentinel, below every real value. When a
    /// conflict reveals the value advanced under us, the loop continues from
    /// the advanced value (or finishes, if it already reached `new_val`);
    /// a conflict with an unchanged value is surfaced.
    fn increase_value_to_at_least(&self, cell: Cell, new_val: i64) -> KestrelResult<i64> {
        let mut old_val = self.get_or_initial(cell.clone(), Timestamp::INITIAL.0)?;
        while old_val < new_val {
            let request = if old_val == Timestamp::INITIAL.0 {
                CheckAndSetRequest::new_cell(
                    self.table.clone(),
                    cell.clone(),
                    encode_value(new_val),
                )
            } else {
                CheckAndSetRequest::single_cell(
                    self.table.clone(),
                    cell.clone(),
                    encode_value(old_val),
                    encode_value(new_val),
                )
            };
            match self.kvs.check_and_set(&request) {
                Ok(()) => return Ok(new_val),
                Err(KvsError::CheckAndSetConflict { .. }) => {
                    tracing::info!(
                        old_val,
                        new_val,
                        "shard progress check-and-set conflict, retrying if the value moved"
                    );
                    let updated = self
                        .read_value(&cell)?
                        .unwrap_or(Timestamp::INITIAL.0);
                    if updated == old_val {
                        return Err(KvsError::CheckAndSetConflict {
                            actual: Some(encode_value(updated)),
                        }
                        .into());
                    }
                    old_val = updated;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(old_val)
    }
}

fn shard_count_cell() -> Cell {
    progress_cell(SHARD_COUNT_INDEX, SweepStrategy::Conservative)
}

/// Row key: strategy flag byte, then the shard index as big-endian i64 so
/// the sentinel `-1` gets a key of its own.
fn progress_cell(shard_index: i64, strategy: SweepStrategy) -> Cell {
    let mut row = Vec::with_capacity(9);
    row.push(if strategy.is_conservative() { 1 } else { 0 });
    row.extend_from_slice(&shard_index.to_be_bytes());
    Cell::new(row, PROGRESS_COLUMN)
}

fn encode_value(value: i64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

fn decode_value(contents: &[u8]) -> KestrelResult<i64> {
    let bytes: [u8; 8] = contents.try_into().map_err(|_| SweepError::CorruptValue {
        reason: format!(
            "shard progress value must be 8 bytes, found {}",
            contents.len()
        ),
    })?;
    Ok(i64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_kvs::InMemoryKvs;

    fn progress_with_defaults(default_shards: u32) -> ShardProgress<InMemoryKvs> {
        let config = Arc::new(
            SweepQueueConfig {
                default_shards,
                ..Default::default()
            }
            .validate()
            .unwrap(),
        );
        ShardProgress::new(Arc::new(InMemoryKvs::new()), config)
    }

    #[test]
    fn test_shard_count_defaults_until_persisted() {
        let progress = progress_with_defaults(8);
        assert_eq!(progress.get_number_of_shards().unwrap(), 8);

        assert_eq!(progress.update_number_of_shards(32).unwrap(), 32);
        assert_eq!(progress.get_number_of_shards().unwrap(), 32);
    }

    #[test]
    fn test_shard_count_never_decreases() {
        let progress = progress_with_defaults(1);
        progress.update_number_of_shards(64).unwrap();
        assert_eq!(progress.update_number_of_shards(16).unwrap(), 64);
        assert_eq!(progress.get_number_of_shards().unwrap(), 64);
    }

    #[test]
    fn test_shard_count_bounded_by_max() {
        let progress = progress_with_defaults(1);
        assert!(progress.update_number_of_shards(100_000).is_err());
    }

    #[test]
    fn test_last_swept_starts_at_initial_sentinel() {
        let progress = progress_with_defaults(1);
        assert_eq!(
            progress
                .get_last_swept_timestamp(ShardAndStrategy::conservative(0))
                .unwrap(),
            Timestamp::INITIAL
        );
    }

    #[test]
    fn test_last_swept_update_and_monotonicity() {
        let progress = progress_with_defaults(1);
        let shard = ShardAndStrategy::conservative(0);

        assert_eq!(
            progress
                .update_last_swept_timestamp(shard, Timestamp(100))
                .unwrap(),
            Timestamp(100)
        );
        // A lower update is a no-op returning the persisted value.
        assert_eq!(
            progress
                .update_last_swept_timestamp(shard, Timestamp(50))
                .unwrap(),
            Timestamp(100)
        );
        assert_eq!(
            progress
                .update_last_swept_timestamp(shard, Timestamp(200))
                .unwrap(),
            Timestamp(200)
        );
        assert_eq!(
            progress.get_last_swept_timestamp(shard).unwrap(),
            Timestamp(200)
        );
    }

    #[test]
    fn test_progress_is_per_shard_and_strategy() {
        let progress = progress_with_defaults(1);
        progress
            .update_last_swept_timestamp(ShardAndStrategy::conservative(0), Timestamp(10))
            .unwrap();

        assert_eq!(
            progress
                .get_last_swept_timestamp(ShardAndStrategy::thorough(0))
                .unwrap(),
            Timestamp::INITIAL
        );
        assert_eq!(
            progress
                .get_last_swept_timestamp(ShardAndStrategy::conservative(1))
                .unwrap(),
            Timestamp::INITIAL
        );
    }

    #[test]
    fn test_concurrent_advance_counts_as_success() {
        // Two handles over the same KVS: one advances past the other.
        let config = Arc::new(SweepQueueConfig::default().validate().unwrap());
        let kvs = Arc::new(InMemoryKvs::new());
        let a = ShardProgress::new(Arc::clone(&kvs), Arc::clone(&config));
        let b = ShardProgress::new(kvs, config);
        let shard = ShardAndStrategy::thorough(3);

        b.update_last_swept_timestamp(shard, Timestamp(500)).unwrap();
        // `a` read nothing yet; its update discovers the persisted 500 and
        // treats the advance as success.
        assert_eq!(
            a.update_last_swept_timestamp(shard, Timestamp(100)).unwrap(),
            Timestamp(500)
        );
    }

    #[test]
    fn test_shard_count_and_progress_do_not_collide() {
        let progress = progress_with_defaults(4);
        progress.update_number_of_shards(16).unwrap();
        // Writing progress for conservative shard 0 must not disturb the
        // shard-count cell at index -1.
        progress
            .update_last_swept_timestamp(ShardAndStrategy::conservative(0), Timestamp(9))
            .unwrap();
        assert_eq!(progress.get_number_of_shards().unwrap(), 16);
    }
}
