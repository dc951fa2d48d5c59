use std::sync::Arc;

use memkit_core::{Context, Identifiable, StoreResult};

use super::iter::Entities;

/// CRUD repository port.
///
/// Every operation takes the ambient [`Context`]; when the context carries a
/// transaction of the backing store, reads see the transaction's pending
/// writes and writes stay buffered until commit.
///
/// ## Error semantics
///
/// - `create` on a visible id → `AlreadyExists`
/// - `update` / `delete_by_id` on an id that is not visible → `NotFound`
/// - `update` on an entity without id → `MissingId`
/// - any operation on a canceled context → `Canceled`, nothing written
pub trait Repository<E>: Send + Sync
where
    E: Identifiable,
{
    /// Store a new entity, assigning an id first when it has none.
    fn create(&self, ctx: &Context, entity: &mut E) -> StoreResult<()>;

    fn find_by_id(&self, ctx: &Context, id: &E::Id) -> StoreResult<Option<E>>;

    fn find_all(&self, ctx: &Context) -> StoreResult<Entities<E>>;

    /// Entities for `ids`, in order; a missing id ends the iteration with `NotFound`.
    fn find_by_ids(&self, ctx: &Context, ids: &[E::Id]) -> StoreResult<Entities<E>>;

    fn update(&self, ctx: &Context, entity: &E) -> StoreResult<()>;

    fn delete_by_id(&self, ctx: &Context, id: &E::Id) -> StoreResult<()>;

    fn delete_all(&self, ctx: &Context) -> StoreResult<()>;

    /// Create or update every entity, all or nothing.
    fn upsert(&self, ctx: &Context, entities: &mut [E]) -> StoreResult<()>;
}

impl<E, R> Repository<E> for Arc<R>
where
    E: Identifiable,
    R: Repository<E> + ?Sized,
{
    fn create(&self, ctx: &Context, entity: &mut E) -> StoreResult<()> {
        (**self).create(ctx, entity)
    }

    fn find_by_id(&self, ctx: &Context, id: &E::Id) -> StoreResult<Option<E>> {
        (**self).find_by_id(ctx, id)
    }

    fn find_all(&self, ctx: &Context) -> StoreResult<Entities<E>> {
        (**self).find_all(ctx)
    }

    fn find_by_ids(&self, ctx: &Context, ids: &[E::Id]) -> StoreResult<Entities<E>> {
        (**self).find_by_ids(ctx, ids)
    }

    fn update(&self, ctx: &Context, entity: &E) -> StoreResult<()> {
        (**self).update(ctx, entity)
    }

    fn delete_by_id(&self, ctx: &Context, id: &E::Id) -> StoreResult<()> {
        (**self).delete_by_id(ctx, id)
    }

    fn delete_all(&self, ctx: &Context) -> StoreResult<()> {
        (**self).delete_all(ctx)
    }

    fn upsert(&self, ctx: &Context, entities: &mut [E]) -> StoreResult<()> {
        (**self).upsert(ctx, entities)
    }
}
