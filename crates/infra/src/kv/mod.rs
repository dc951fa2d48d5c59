//! Namespaced key-value store with cascading rollback.

pub mod store;
pub mod transaction;

pub use store::KvStore;
pub use transaction::KvTransaction;
