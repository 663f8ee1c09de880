//! Engine counters.
//!
//! ```rust,ignore
//! let stats = replica.stats();
//! println!("committed: {}", stats.transactions_committed);
//! println!("conflicts: {}", stats.conflicts);
//! ```

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live engine counters.
///
/// All counters are atomic and only ever increase.
#[derive(Debug, Default)]
pub struct EngineStats {
    // Transaction counters
    transactions_started: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_aborted: AtomicU64,
    conflicts: AtomicU64,

    // Operation counters
    reads: AtomicU64,
    computes: AtomicU64,
    compute_retries: AtomicU64,
    removes: AtomicU64,

    // Log and replication counters
    records_appended: AtomicU64,
    records_applied: AtomicU64,
    replication_rounds: AtomicU64,
    replication_timeouts: AtomicU64,
    truncated_records: AtomicU64,

    // Leadership counters
    elections_started: AtomicU64,
    elections_won: AtomicU64,
    step_downs: AtomicU64,
}

macro_rules! counters {
    ($($field:ident => $record:ident),* $(,)?) => {
        impl EngineStats {
            $(
                pub(crate) fn $record(&self) {
                    self.$field.fetch_add(1, Ordering::Relaxed);
                }

                #[doc = concat!("Returns the `", stringify!($field), "` counter.")]
                pub fn $field(&self) -> u64 {
                    self.$field.load(Ordering::Relaxed)
                }
            )*

            /// Returns a point-in-time copy of every counter.
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($field: self.$field(),)*
                    truncated_records: self.truncated_records(),
                }
            }
        }

        /// A point-in-time copy of [`EngineStats`].
        #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
        pub struct StatsSnapshot {
            $(
                #[doc = concat!("Value of the `", stringify!($field), "` counter.")]
                pub $field: u64,
            )*
            /// Number of unconfirmed records truncated away.
            pub truncated_records: u64,
        }
    };
}

counters! {
    transactions_started => record_transaction_start,
    transactions_committed => record_transaction_commit,
    transactions_aborted => record_transaction_abort,
    conflicts => record_conflict,
    reads => record_read,
    computes => record_compute,
    compute_retries => record_compute_retry,
    removes => record_remove,
    records_appended => record_append,
    records_applied => record_apply,
    replication_rounds => record_replication_round,
    replication_timeouts => record_replication_timeout,
    elections_started => record_election_start,
    elections_won => record_election_win,
    step_downs => record_step_down,
}

impl EngineStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_truncation(&self, records: u64) {
        self.truncated_records.fetch_add(records, Ordering::Relaxed);
    }

    /// Returns how many unconfirmed records were truncated away.
    pub fn truncated_records(&self) -> u64 {
        self.truncated_records.load(Ordering::Relaxed)
    }
}
