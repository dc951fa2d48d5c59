//! In-memory append-only event log with nested transactions.
//!
//! The log owns the ground truth; repositories and projections are derived
//! from it. Transactions buffer events on top of the log (or of another
//! transaction) and replay them into their parent on commit.

pub mod in_memory;
pub mod options;
pub mod transaction;

pub use in_memory::EventLog;
pub use options::{ENV_CAPTURE_TRACES, ENV_SYNC_SUBSCRIBERS, EventLogOptions};
pub use transaction::Transaction;
