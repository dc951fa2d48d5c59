//! `memkit-core` — building blocks shared by the in-memory adapters.
//!
//! This crate contains no storage: only the ambient context, the error
//! taxonomy, id capabilities and the one-phase commit port.

pub mod commit;
pub mod context;
pub mod entity;
pub mod error;
pub mod id;

pub use commit::{OnePhaseCommit, TxStatus};
pub use context::{CancelHandle, Context, SlotKey};
pub use entity::Identifiable;
pub use error::{StoreError, StoreResult};
pub use id::{EntityKey, GenerateId, canonical_key, next_sequence};
