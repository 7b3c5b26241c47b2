use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use kestrel_common::error::{KestrelResult, KvsError, TxnError};
use kestrel_common::types::{Cell, TableRef, Timestamp};
use kestrel_kvs::{CheckAndSetRequest, KeyValueService};

pub const TRANSACTIONS_TABLE_NAME: &str = "_transactions";

/// Commit timestamp recorded for an aborted transaction.
const ABORTED_COMMIT_TS: i64 = -1;

const COMMIT_TS_COLUMN: &[u8] = b"t";

/// Outcome of a transaction as recorded in the transaction table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Committed(Timestamp),
    Aborted,
    /// No entry: the transaction has not committed or aborted yet. It may
    /// be in flight, or its coordinator may be gone for good.
    InProgress,
}

/// Accessor for the transaction table.
pub struct TransactionTable<K> {
    kvs: Arc<K>,
    table: TableRef,
}

impl<K: KeyValueService> TransactionTable<K> {
    pub fn new(kvs: Arc<K>) -> Self {
        Self {
            kvs,
            table: TableRef::new(TRANSACTIONS_TABLE_NAME),
        }
    }

    /// Record a commit, failing if the transaction's fate is already sealed.
    pub fn put_committed(&self, start_ts: Timestamp, commit_ts: Timestamp) -> KestrelResult<()> {
        let request = CheckAndSetRequest::new_cell(
            self.table.clone(),
            cell_for(start_ts),
            encode_commit_ts(commit_ts.0),
        );
        match self.kvs.check_and_set(&request) {
            Ok(()) => Ok(()),
            Err(KvsError::CheckAndSetConflict { .. }) => {
                Err(TxnError::AlreadyDecided { start_ts }.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn get_commit_state(&self, start_ts: Timestamp) -> KestrelResult<CommitState> {
        let mut states = self.get_commit_states(&BTreeSet::from([start_ts]))?;
        Ok(states
            .remove(&start_ts)
            .unwrap_or(CommitState::InProgress))
    }

    /// Batch commit-state lookup. Every requested timestamp is present in
    /// the result; absent entries resolve to `InProgress`.
    pub fn get_commit_states(
        &self,
        start_tss: &BTreeSet<Timestamp>,
    ) -> KestrelResult<BTreeMap<Timestamp, CommitState>> {
        let request: Vec<(Cell, Timestamp)> = start_tss
            .iter()
            .map(|ts| (cell_for(*ts), Timestamp::MAX))
            .collect();
        let found = self.kvs.get(&self.table, &request)?;

        let mut states = BTreeMap::new();
        for start_ts in start_tss {
            let state = match found.get(&cell_for(*start_ts)) {
                None => CommitState::InProgress,
                Some(value) => decode_commit_state(*start_ts, &value.contents)?,
            };
            states.insert(*start_ts, state);
        }
        Ok(states)
    }

    /// Try to abort an apparently-uncommitted transaction with a conditional
    /// put of the aborted sentinel. On losing the race, re-reads and returns
    /// the winner's outcome.
    pub fn try_abort(&self, start_ts: Timestamp) -> KestrelResult<CommitState> {
        let request = CheckAndSetRequest::new_cell(
            self.table.clone(),
            cell_for(start_ts),
            encode_commit_ts(ABORTED_COMMIT_TS),
        );
        match self.kvs.check_and_set(&request) {
            Ok(()) => {
                tracing::debug!(start_ts = start_ts.0, "aborted uncommitted transaction");
                Ok(CommitState::Aborted)
            }
            Err(KvsError::CheckAndSetConflict { .. }) => {
                // Someone decided this transaction concurrently; their
                // outcome stands.
                let state = self.get_commit_state(start_ts)?;
                tracing::info!(
                    start_ts = start_ts.0,
                    outcome = ?state,
                    "lost in-band abort race"
                );
                Ok(state)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn cell_for(start_ts: Timestamp) -> Cell {
    Cell::new((start_ts.0 as u64).to_be_bytes(), COMMIT_TS_COLUMN)
}

fn encode_commit_ts(commit_ts: i64) -> Vec<u8> {
    commit_ts.to_be_bytes().to_vec()
}

fn decode_commit_state(start_ts: Timestamp, contents: &[u8]) -> Result<CommitState, TxnError> {
    let bytes: [u8; 8] = contents
        .try_into()
        .map_err(|_| TxnError::CorruptCommitEntry {
            start_ts,
            reason: format!("expected 8 bytes, found {}", contents.len()),
        })?;
    let commit_ts = i64::from_be_bytes(bytes);
    if commit_ts == ABORTED_COMMIT_TS {
        Ok(CommitState::Aborted)
    } else {
        Ok(CommitState::Committed(Timestamp(commit_ts)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_kvs::InMemoryKvs;

    fn txn_table() -> TransactionTable<InMemoryKvs> {
        TransactionTable::new(Arc::new(InMemoryKvs::new()))
    }

    #[test]
    fn test_unknown_transaction_is_in_progress() {
        let txn = txn_table();
        assert_eq!(
            txn.get_commit_state(Timestamp(100)).unwrap(),
            CommitState::InProgress
        );
    }

    #[test]
    fn test_committed_round_trip() {
        let txn = txn_table();
        txn.put_committed(Timestamp(100), Timestamp(105)).unwrap();
        assert_eq!(
            txn.get_commit_state(Timestamp(100)).unwrap(),
            CommitState::Committed(Timestamp(105))
        );
    }

    #[test]
    fn test_double_commit_rejected() {
        let txn = txn_table();
        txn.put_committed(Timestamp(100), Timestamp(105)).unwrap();
        assert!(txn.put_committed(Timestamp(100), Timestamp(106)).is_err());
    }

    #[test]
    fn test_try_abort_wins_on_unknown() {
        let txn = txn_table();
        assert_eq!(txn.try_abort(Timestamp(100)).unwrap(), CommitState::Aborted);
        assert_eq!(
            txn.get_commit_state(Timestamp(100)).unwrap(),
            CommitState::Aborted
        );
    }

    #[test]
    fn test_try_abort_loses_to_commit() {
        let txn = txn_table();
        txn.put_committed(Timestamp(100), Timestamp(105)).unwrap();
        assert_eq!(
            txn.try_abort(Timestamp(100)).unwrap(),
            CommitState::Committed(Timestamp(105))
        );
    }

    #[test]
    fn test_try_abort_is_idempotent() {
        let txn = txn_table();
        txn.try_abort(Timestamp(100)).unwrap();
        assert_eq!(txn.try_abort(Timestamp(100)).unwrap(), CommitState::Aborted);
    }

    #[test]
    fn test_batch_lookup_covers_every_requested_ts() {
        let txn = txn_table();
        txn.put_committed(Timestamp(1), Timestamp(2)).unwrap();
        txn.try_abort(Timestamp(3)).unwrap();

        let states = txn
            .get_commit_states(&BTreeSet::from([Timestamp(1), Timestamp(3), Timestamp(5)]))
            .unwrap();
        assert_eq!(states[&Timestamp(1)], CommitState::Committed(Timestamp(2)));
        assert_eq!(states[&Timestamp(3)], CommitState::Aborted);
        assert_eq!(states[&Timestamp(5)], CommitState::InProgress);
    }
}
