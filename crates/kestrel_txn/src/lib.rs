//! The transaction table: start timestamp → commit outcome.
//!
//! Every transactional commit records its commit timestamp here with a
//! put-unless-exists; aborting writes the `-1` sentinel the same way. The
//! conditional put is the single serialization point for the sweep read
//! path's in-band aborts: exactly one participant wins, and losers observe
//! the winner's outcome.

mod table;

pub use table::{CommitState, TransactionTable, TRANSACTIONS_TABLE_NAME};
