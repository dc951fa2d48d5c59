//! Identifiable trait: the id capability repositories rely on.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::id::EntityKey;

/// Entity with an optional, settable identifier.
///
/// `id` returns `None` while the entity has not been assigned an id yet
/// (e.g. an empty string id); repositories then generate one on `create`.
/// Both methods must be pure.
pub trait Identifiable {
    /// Strongly-typed entity identifier.
    type Id: EntityKey
        + Clone
        + PartialEq
        + core::fmt::Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    /// Returns the entity identifier, if assigned.
    fn id(&self) -> Option<Self::Id>;

    /// Assigns the entity identifier.
    fn set_id(&mut self, id: Self::Id);
}
