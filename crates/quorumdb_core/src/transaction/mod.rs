//! Optimistic transactions over replicated collections.
//!
//! - **Atomicity**: a transaction's writes form one log record, applied all
//!   at once or not at all
//! - **Isolation**: reads record the version they saw and commit validates
//!   them, so a transaction never overwrites a change it did not see
//! - **Durability**: a transaction is committed once its record reached a
//!   quorum of replicas
//!
//! Transactions move `Active → Committing → Committed`, or to `Aborted` on
//! abort, close, drop or a failed commit.

mod cancel;
mod manager;
mod retry;
mod state;

pub use cancel::CancellationToken;
pub use manager::TransactionManager;
pub use retry::RetryPolicy;
pub use state::{EntryKey, Transaction, TransactionState};
