use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use memkit_core::{
    Context, EntityKey, GenerateId, Identifiable, OnePhaseCommit, StoreError, StoreResult,
};
use memkit_events::{RepositoryEvent, RepositoryOp, Subscription, View};

use crate::event_log::{EventLog, Transaction};

use super::iter::{Entities, Lookup};
use super::r#trait::Repository;
use super::subscription::{ChangeFilter, ChangeSubscriber};

/// Produces ids for entities created without one.
pub type IdGenerator<Id> = Arc<dyn Fn(&Context) -> StoreResult<Id> + Send + Sync>;

/// Construction options of an [`EventLogRepository`].
pub struct RepositoryConfig<Id> {
    namespace: Option<String>,
    make_id: IdGenerator<Id>,
    compress_on_append: bool,
}

impl<Id> RepositoryConfig<Id>
where
    Id: 'static,
{
    /// Config with a custom id generator (for id types without [`GenerateId`]).
    pub fn with_generator(
        make_id: impl Fn(&Context) -> StoreResult<Id> + Send + Sync + 'static,
    ) -> Self {
        Self {
            namespace: None,
            make_id: Arc::new(make_id),
            compress_on_append: false,
        }
    }

    /// Partition key of the repository's events.
    ///
    /// Defaults to the entity's fully-qualified type name, which every
    /// repository of that type shares; set distinct namespaces to keep two
    /// repositories of one type isolated on the same log.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn id_generator(
        mut self,
        make_id: impl Fn(&Context) -> StoreResult<Id> + Send + Sync + 'static,
    ) -> Self {
        self.make_id = Arc::new(make_id);
        self
    }

    /// Compress the log after every successful mutation.
    pub fn compress_on_append(mut self, enabled: bool) -> Self {
        self.compress_on_append = enabled;
        self
    }
}

impl<Id> Default for RepositoryConfig<Id>
where
    Id: GenerateId + 'static,
{
    fn default() -> Self {
        Self::with_generator(Id::generate)
    }
}

/// Typed CRUD facade over an [`EventLog`].
///
/// Writes append `Create` / `Update` / `DeleteByID` / `DeleteAll` events
/// tagged with the repository namespace. Reads fold the events visible from
/// the context into a [`View`]; the view itself is never stored.
pub struct EventLogRepository<E>
where
    E: Identifiable,
{
    log: EventLog,
    namespace: String,
    make_id: IdGenerator<E::Id>,
    compress_on_append: bool,
    _entity: PhantomData<fn() -> E>,
}

impl<E> EventLogRepository<E>
where
    E: Identifiable + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Repository with the default namespace and id generator.
    pub fn new(log: EventLog) -> Self
    where
        E::Id: GenerateId,
    {
        Self::with_config(log, RepositoryConfig::default())
    }

    pub fn with_config(log: EventLog, config: RepositoryConfig<E::Id>) -> Self {
        let namespace = config
            .namespace
            .unwrap_or_else(|| std::any::type_name::<E>().to_string());
        Self {
            log,
            namespace,
            make_id: config.make_id,
            compress_on_append: config.compress_on_append,
            _entity: PhantomData,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn log(&self) -> &EventLog {
        &self.log
    }

    pub fn lookup_tx(&self, ctx: &Context) -> Option<Arc<Transaction>> {
        self.log.lookup_tx(ctx)
    }

    /// Untyped view of the events visible from `ctx`.
    pub fn project(&self, ctx: &Context) -> StoreResult<View> {
        let events = self.log.events_in_context(ctx)?;
        Ok(View::project(self.namespace.as_str(), &events))
    }

    /// Decoded view keyed by entity key.
    pub fn view(&self, ctx: &Context) -> StoreResult<BTreeMap<String, E>> {
        self.project(ctx)?
            .into_entries()
            .into_iter()
            .map(|(key, entry)| -> StoreResult<(String, E)> {
                Ok((key, serde_json::from_value(entry.value)?))
            })
            .collect()
    }

    /// Rewrite the log so this namespace holds one `Create` per visible entity.
    ///
    /// Events of other namespaces are kept verbatim and transaction markers are
    /// dropped. Only committed events are touched; open transactions replay on
    /// top of the compacted log as usual.
    pub fn compress(&self) {
        let namespace = self.namespace.as_str();
        self.log.rewrite_matching(
            |event| event.namespace() == Some(namespace),
            |owned| View::project(namespace, &owned).canonical_events(),
        );
        self.log.compress();
        debug!(namespace, "compressed repository events");
    }

    /// Receive typed changes of the listed kinds for this namespace.
    pub fn subscribe<S>(&self, kinds: &[RepositoryOp], subscriber: S) -> Subscription
    where
        S: ChangeSubscriber<E>,
    {
        let filter = ChangeFilter::<E, S>::new(self.namespace.as_str(), kinds, subscriber);
        self.log.subscribe(Arc::new(filter))
    }

    fn append(&self, ctx: &Context, event: RepositoryEvent) -> StoreResult<()> {
        let at_root = self.lookup_tx(ctx).is_none();
        self.log.append(ctx, event)?;
        if at_root {
            self.compress_if_enabled();
        }
        Ok(())
    }

    /// Events only reach the root through plain appends and depth-1 commits;
    /// both end here when `compress_on_append` is set.
    fn compress_if_enabled(&self) {
        if self.compress_on_append {
            self.compress();
        }
    }

    fn lookups(
        &self,
        ctx: &Context,
        keys: impl IntoIterator<Item = String>,
    ) -> StoreResult<Vec<Lookup>> {
        let view = self.project(ctx)?;
        Ok(keys
            .into_iter()
            .map(|key| match view.get(&key) {
                Some(entry) => Lookup::Found(entry.value.clone()),
                None => Lookup::Missing(key),
            })
            .collect())
    }
}

impl<E> Repository<E> for EventLogRepository<E>
where
    E: Identifiable + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn create(&self, ctx: &Context, entity: &mut E) -> StoreResult<()> {
        ctx.err()?;
        let id = match entity.id() {
            Some(id) => id,
            None => {
                let id = (self.make_id)(ctx)?;
                entity.set_id(id.clone());
                id
            }
        };

        let key = id.entity_key();
        if self.project(ctx)?.contains_key(&key) {
            return Err(StoreError::already_exists(self.namespace.as_str(), key));
        }

        let event = RepositoryEvent::create(
            self.namespace.as_str(),
            serde_json::to_value(&id)?,
            key,
            serde_json::to_value(&*entity)?,
        );
        self.append(ctx, event)
    }

    fn find_by_id(&self, ctx: &Context, id: &E::Id) -> StoreResult<Option<E>> {
        let view = self.project(ctx)?;
        view.get(&id.entity_key())
            .map(|entry| serde_json::from_value(entry.value.clone()))
            .transpose()
            .map_err(StoreError::from)
    }

    fn find_all(&self, ctx: &Context) -> StoreResult<Entities<E>> {
        let view = self.project(ctx)?;
        let pending = view
            .into_entries()
            .into_values()
            .map(|entry| Lookup::Found(entry.value))
            .collect();
        Ok(Entities::new(ctx, &self.namespace, pending))
    }

    fn find_by_ids(&self, ctx: &Context, ids: &[E::Id]) -> StoreResult<Entities<E>> {
        let pending = self.lookups(ctx, ids.iter().map(EntityKey::entity_key))?;
        Ok(Entities::new(ctx, &self.namespace, pending))
    }

    fn update(&self, ctx: &Context, entity: &E) -> StoreResult<()> {
        ctx.err()?;
        let id = entity.id().ok_or(StoreError::MissingId)?;
        let key = id.entity_key();
        if !self.project(ctx)?.contains_key(&key) {
            return Err(StoreError::not_found(self.namespace.as_str(), key));
        }

        let event = RepositoryEvent::update(
            self.namespace.as_str(),
            serde_json::to_value(&id)?,
            key,
            serde_json::to_value(entity)?,
        );
        self.append(ctx, event)
    }

    fn delete_by_id(&self, ctx: &Context, id: &E::Id) -> StoreResult<()> {
        ctx.err()?;
        let key = id.entity_key();
        if !self.project(ctx)?.contains_key(&key) {
            return Err(StoreError::not_found(self.namespace.as_str(), key));
        }

        let event =
            RepositoryEvent::delete_by_id(self.namespace.as_str(), serde_json::to_value(id)?, key);
        self.append(ctx, event)
    }

    fn delete_all(&self, ctx: &Context) -> StoreResult<()> {
        self.append(ctx, RepositoryEvent::delete_all(self.namespace.as_str()))
    }

    fn upsert(&self, ctx: &Context, entities: &mut [E]) -> StoreResult<()> {
        let at_root = self.lookup_tx(ctx).is_none();
        self.log.atomic(ctx, |tx_ctx| {
            for entity in entities.iter_mut() {
                let exists = match entity.id() {
                    Some(id) => self.project(tx_ctx)?.contains_key(&id.entity_key()),
                    None => false,
                };
                if exists {
                    self.update(tx_ctx, entity)?;
                } else {
                    self.create(tx_ctx, entity)?;
                }
            }
            Ok(())
        })?;
        if at_root {
            self.compress_if_enabled();
        }
        Ok(())
    }
}

impl<E> OnePhaseCommit for EventLogRepository<E>
where
    E: Identifiable + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn begin_tx(&self, ctx: &Context) -> StoreResult<Context> {
        self.log.begin_tx(ctx)
    }

    fn commit_tx(&self, ctx: &Context) -> StoreResult<()> {
        let into_root = self.lookup_tx(ctx).is_some_and(|tx| tx.depth() == 1);
        self.log.commit_tx(ctx)?;
        if into_root {
            self.compress_if_enabled();
        }
        Ok(())
    }

    fn rollback_tx(&self, ctx: &Context) -> StoreResult<()> {
        self.log.rollback_tx(ctx)
    }
}

impl<E> Clone for EventLogRepository<E>
where
    E: Identifiable,
{
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            namespace: self.namespace.clone(),
            make_id: self.make_id.clone(),
            compress_on_append: self.compress_on_append,
            _entity: PhantomData,
        }
    }
}

impl<E> core::fmt::Debug for EventLogRepository<E>
where
    E: Identifiable,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventLogRepository")
            .field("namespace", &self.namespace)
            .field("compress_on_append", &self.compress_on_append)
            .field("log", &self.log)
            .finish()
    }
}
