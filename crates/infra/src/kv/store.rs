use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tracing::{debug, warn};
use uuid::Uuid;

use memkit_core::{Context, OnePhaseCommit, SlotKey, StoreError, StoreResult};

use super::transaction::{KvScope, KvTransaction};

const TX_SLOT: &str = "kv.tx";

type Tables<V> = HashMap<String, HashMap<String, V>>;

pub(crate) struct KvShared<V> {
    id: OnceLock<Uuid>,
    tables: RwLock<Tables<V>>,
}

impl<V: Clone> KvShared<V> {
    fn id(&self) -> Uuid {
        *self.id.get_or_init(Uuid::now_v7)
    }

    pub(crate) fn get(&self, namespace: &str, key: &str) -> Option<V> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.get(namespace)?.get(key).cloned()
    }

    pub(crate) fn all(&self, namespace: &str) -> HashMap<String, V> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        tables.get(namespace).cloned().unwrap_or_default()
    }

    pub(crate) fn set(&self, namespace: &str, key: String, value: V) {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables
            .entry(namespace.to_string())
            .or_default()
            .insert(key, value);
    }

    pub(crate) fn delete(&self, namespace: &str, key: &str) -> bool {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        tables
            .get_mut(namespace)
            .is_some_and(|table| table.remove(key).is_some())
    }
}

/// Namespaced in-memory key-value tables with nested transactions.
///
/// Handles are cheap to clone and share the same tables. Like the event log,
/// a transaction lives on the [`Context`] returned by `begin_tx`; unlike the
/// event log, [`rollback_tx`](OnePhaseCommit::rollback_tx) also rolls back
/// every enclosing transaction of this store.
pub struct KvStore<V> {
    shared: Arc<KvShared<V>>,
}

impl<V> KvStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            shared: Arc::new(KvShared {
                id: OnceLock::new(),
                tables: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Process-unique id of this store, generated on first use.
    pub fn id(&self) -> Uuid {
        self.shared.id()
    }

    fn tx_slot(&self) -> SlotKey {
        SlotKey::new(self.id(), TX_SLOT)
    }

    /// Innermost transaction of this store carried by `ctx`.
    pub fn lookup_tx(&self, ctx: &Context) -> Option<Arc<KvTransaction<V>>> {
        ctx.value::<KvTransaction<V>>(&self.tx_slot())
    }

    fn scope(&self, ctx: &Context) -> KvScope<V> {
        match self.lookup_tx(ctx) {
            Some(tx) => KvScope::Tx(tx),
            None => KvScope::Root(self.shared.clone()),
        }
    }

    pub fn get(&self, ctx: &Context, namespace: &str, key: &str) -> StoreResult<Option<V>> {
        ctx.err()?;
        self.scope(ctx).get(namespace, key)
    }

    pub fn set(
        &self,
        ctx: &Context,
        namespace: &str,
        key: impl Into<String>,
        value: V,
    ) -> StoreResult<()> {
        ctx.err()?;
        self.scope(ctx).set(namespace, key.into(), value)
    }

    /// Remove `key`; returns whether it was visible before.
    pub fn delete(&self, ctx: &Context, namespace: &str, key: &str) -> StoreResult<bool> {
        ctx.err()?;
        self.scope(ctx).delete(namespace, key.to_string())
    }

    /// Every visible entry of `namespace`.
    pub fn all(&self, ctx: &Context, namespace: &str) -> StoreResult<HashMap<String, V>> {
        ctx.err()?;
        self.scope(ctx).all(namespace)
    }

    /// Run `body` in a transaction: commit on success, roll back and return its error otherwise.
    ///
    /// The rollback cascades, so a failing nested `atomic` aborts the enclosing
    /// transactions too.
    pub fn atomic<T>(
        &self,
        ctx: &Context,
        body: impl FnOnce(&Context) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let tx_ctx = self.begin_tx(ctx)?;
        match body(&tx_ctx) {
            Ok(value) => {
                self.commit_tx(&tx_ctx)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback_tx(&tx_ctx) {
                    warn!(store = %self.id(), error = %rollback_err, "rollback after failed body failed");
                }
                Err(err)
            }
        }
    }
}

impl<V> Default for KvStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for KvStore<V> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<V> core::fmt::Debug for KvStore<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let tables = self
            .shared
            .tables
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("KvStore")
            .field("id", &self.shared.id.get())
            .field("namespaces", &tables.len())
            .finish()
    }
}

impl<V> OnePhaseCommit for KvStore<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn begin_tx(&self, ctx: &Context) -> StoreResult<Context> {
        ctx.err()?;
        let tx = KvTransaction::begin(self.scope(ctx))?;
        debug!(store = %self.id(), depth = tx.depth(), "begin kv transaction");
        Ok(ctx.with_value(self.tx_slot(), tx))
    }

    fn commit_tx(&self, ctx: &Context) -> StoreResult<()> {
        ctx.err()?;
        let tx = self.lookup_tx(ctx).ok_or(StoreError::NoTransaction)?;
        debug!(store = %self.id(), depth = tx.depth(), "commit kv transaction");
        tx.commit()
    }

    fn rollback_tx(&self, ctx: &Context) -> StoreResult<()> {
        ctx.err()?;
        let tx = self.lookup_tx(ctx).ok_or(StoreError::NoTransaction)?;
        debug!(store = %self.id(), depth = tx.depth(), "rollback kv transaction, cascading");
        tx.rollback()
    }
}
