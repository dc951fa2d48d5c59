//! Entity keys and default id generation.

use core::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use uuid::Uuid;

use crate::context::Context;
use crate::error::{StoreError, StoreResult};

/// Textual key of an identifier inside a view.
///
/// The key must be injective: two ids the repository considers different
/// must never map to the same key. Strings map to themselves, integers and
/// uuids to their display form; composite ids can use [`canonical_key`].
pub trait EntityKey {
    fn entity_key(&self) -> String;
}

/// Canonical JSON rendering of a serializable id.
///
/// Suitable for composite ids whose fields serialize deterministically
/// (structs and tuples do; hash maps do not).
pub fn canonical_key<T: Serialize + ?Sized>(id: &T) -> String {
    serde_json::to_string(id).unwrap_or_else(|e| format!("<unserializable id: {e}>"))
}

impl EntityKey for String {
    fn entity_key(&self) -> String {
        self.clone()
    }
}

impl EntityKey for str {
    fn entity_key(&self) -> String {
        self.to_owned()
    }
}

impl EntityKey for Uuid {
    fn entity_key(&self) -> String {
        self.to_string()
    }
}

impl<T: EntityKey + ?Sized> EntityKey for &T {
    fn entity_key(&self) -> String {
        (**self).entity_key()
    }
}

/// Produces a fresh identifier for an entity that has none.
pub trait GenerateId: Sized {
    fn generate(ctx: &Context) -> StoreResult<Self>;
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Next value of the process-wide id counter.
///
/// Monotonically increasing across all repositories; meant for tests and
/// dev setups, not for ids that must be unguessable.
pub fn next_sequence() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

impl GenerateId for String {
    fn generate(ctx: &Context) -> StoreResult<Self> {
        ctx.err()?;
        Ok(next_sequence().to_string())
    }
}

impl GenerateId for Uuid {
    fn generate(ctx: &Context) -> StoreResult<Self> {
        ctx.err()?;
        Ok(Uuid::now_v7())
    }
}

macro_rules! impl_integer_id {
    ($($t:ty),* $(,)?) => {
        $(
            impl EntityKey for $t {
                fn entity_key(&self) -> String {
                    self.to_string()
                }
            }

            impl GenerateId for $t {
                fn generate(ctx: &Context) -> StoreResult<Self> {
                    ctx.err()?;
                    let next = next_sequence();
                    <$t>::try_from(next).map_err(|_| {
                        StoreError::IdGeneration(format!(
                            "counter value {next} does not fit in {}",
                            stringify!($t)
                        ))
                    })
                }
            }
        )*
    };
}

impl_integer_id!(u32, u64, u128, usize, i32, i64, i128);
