//! Change sets layered on the KV tables.
//!
//! Unlike event-log transactions, rolling back a KV transaction aborts every
//! enclosing transaction as well: a failed inner step invalidates the whole
//! chain of outer work.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use memkit_core::{StoreError, StoreResult, TxStatus};

use super::store::KvShared;

/// Pending writes and deletes of one namespace, in recorded order.
pub(crate) struct ChangeSet<V> {
    writes: Vec<(String, V)>,
    deletes: Vec<String>,
}

impl<V> Default for ChangeSet<V> {
    fn default() -> Self {
        Self {
            writes: Vec::new(),
            deletes: Vec::new(),
        }
    }
}

impl<V: Clone> ChangeSet<V> {
    /// `Some(None)` when deleted here, `Some(Some(v))` when written here.
    fn lookup(&self, key: &str) -> Option<Option<V>> {
        if self.deletes.iter().any(|k| k == key) {
            return Some(None);
        }
        self.writes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| Some(v.clone()))
    }

    fn write(&mut self, key: String, value: V) {
        self.deletes.retain(|k| *k != key);
        match self.writes.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.writes.push((key, value)),
        }
    }

    fn delete(&mut self, key: String) {
        self.writes.retain(|(k, _)| *k != key);
        if !self.deletes.contains(&key) {
            self.deletes.push(key);
        }
    }

    fn overlay(&self, table: &mut HashMap<String, V>) {
        for key in &self.deletes {
            table.remove(key);
        }
        for (key, value) in &self.writes {
            table.insert(key.clone(), value.clone());
        }
    }
}

pub(crate) enum KvScope<V> {
    Root(Arc<KvShared<V>>),
    Tx(Arc<KvTransaction<V>>),
}

impl<V> Clone for KvScope<V> {
    fn clone(&self) -> Self {
        match self {
            KvScope::Root(shared) => KvScope::Root(shared.clone()),
            KvScope::Tx(tx) => KvScope::Tx(tx.clone()),
        }
    }
}

impl<V> KvScope<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<V>> {
        match self {
            KvScope::Root(shared) => Ok(shared.get(namespace, key)),
            KvScope::Tx(tx) => tx.get(namespace, key),
        }
    }

    pub(crate) fn all(&self, namespace: &str) -> StoreResult<HashMap<String, V>> {
        match self {
            KvScope::Root(shared) => Ok(shared.all(namespace)),
            KvScope::Tx(tx) => tx.all(namespace),
        }
    }

    pub(crate) fn set(&self, namespace: &str, key: String, value: V) -> StoreResult<()> {
        match self {
            KvScope::Root(shared) => {
                shared.set(namespace, key, value);
                Ok(())
            }
            KvScope::Tx(tx) => tx.set(namespace, key, value),
        }
    }

    pub(crate) fn delete(&self, namespace: &str, key: String) -> StoreResult<bool> {
        match self {
            KvScope::Root(shared) => Ok(shared.delete(namespace, &key)),
            KvScope::Tx(tx) => tx.delete(namespace, key),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        match self {
            KvScope::Root(_) => true,
            KvScope::Tx(tx) => tx.is_active(),
        }
    }

    fn depth(&self) -> usize {
        match self {
            KvScope::Root(_) => 0,
            KvScope::Tx(tx) => tx.depth,
        }
    }
}

struct KvTxState<V> {
    status: TxStatus,
    changes: BTreeMap<String, ChangeSet<V>>,
}

/// A change set over the root tables or another KV transaction.
pub struct KvTransaction<V> {
    parent: KvScope<V>,
    depth: usize,
    state: Mutex<KvTxState<V>>,
}

impl<V> KvTransaction<V>
where
    V: Clone + Send + Sync + 'static,
{
    pub(crate) fn begin(parent: KvScope<V>) -> StoreResult<Arc<Self>> {
        if !parent.is_active() {
            return Err(StoreError::TransactionDone);
        }
        Ok(Arc::new(Self {
            depth: parent.depth() + 1,
            parent,
            state: Mutex::new(KvTxState {
                status: TxStatus::Active,
                changes: BTreeMap::new(),
            }),
        }))
    }

    fn state(&self) -> MutexGuard<'_, KvTxState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the state, failing when the transaction is finished.
    fn active_state(&self) -> StoreResult<MutexGuard<'_, KvTxState<V>>> {
        let state = self.state();
        if !state.status.is_active() {
            return Err(StoreError::TransactionDone);
        }
        Ok(state)
    }

    pub fn status(&self) -> TxStatus {
        self.state().status
    }

    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Number of keys with a pending write or delete.
    pub fn pending(&self) -> usize {
        self.state()
            .changes
            .values()
            .map(|c| c.writes.len() + c.deletes.len())
            .sum()
    }

    pub(crate) fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<V>> {
        let state = self.active_state()?;
        if let Some(found) = state.changes.get(namespace).and_then(|c| c.lookup(key)) {
            return Ok(found);
        }
        self.parent.get(namespace, key)
    }

    pub(crate) fn all(&self, namespace: &str) -> StoreResult<HashMap<String, V>> {
        let state = self.active_state()?;
        let mut table = self.parent.all(namespace)?;
        if let Some(changes) = state.changes.get(namespace) {
            changes.overlay(&mut table);
        }
        Ok(table)
    }

    pub(crate) fn set(&self, namespace: &str, key: String, value: V) -> StoreResult<()> {
        let mut state = self.active_state()?;
        state
            .changes
            .entry(namespace.to_string())
            .or_default()
            .write(key, value);
        Ok(())
    }

    /// Record a delete; returns whether the key was visible before.
    pub(crate) fn delete(&self, namespace: &str, key: String) -> StoreResult<bool> {
        let mut state = self.active_state()?;
        let visible = match state.changes.get(namespace).and_then(|c| c.lookup(&key)) {
            Some(found) => found.is_some(),
            None => self.parent.get(namespace, &key)?.is_some(),
        };
        state
            .changes
            .entry(namespace.to_string())
            .or_default()
            .delete(key);
        Ok(visible)
    }

    /// Mark committed, then drain deletes and writes into the parent.
    pub(crate) fn commit(&self) -> StoreResult<()> {
        let changes = {
            let mut state = self.state();
            if !state.status.is_active() {
                return Err(StoreError::TransactionAlreadyDone);
            }
            state.status = TxStatus::Committed;
            std::mem::take(&mut state.changes)
        };

        for (namespace, changes) in changes {
            for key in changes.deletes {
                self.parent.delete(&namespace, key)?;
            }
            for (key, value) in changes.writes {
                self.parent.set(&namespace, key, value)?;
            }
        }
        Ok(())
    }

    /// Discard the change set and roll back every enclosing active transaction.
    ///
    /// Finished ancestors are skipped, not a stopping point: an active
    /// grandparent still rolls back when the parent already committed.
    pub(crate) fn rollback(&self) -> StoreResult<()> {
        if !self.abort() {
            return Err(StoreError::TransactionAlreadyDone);
        }

        let mut scope = self.parent.clone();
        while let KvScope::Tx(tx) = scope {
            tx.abort();
            scope = tx.parent.clone();
        }
        Ok(())
    }

    /// Mark rolled back if still active; `false` when already finished.
    fn abort(&self) -> bool {
        let mut state = self.state();
        if !state.status.is_active() {
            return false;
        }
        state.status = TxStatus::RolledBack;
        state.changes.clear();
        true
    }
}

impl<V> core::fmt::Debug for KvTransaction<V> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("KvTransaction")
            .field("depth", &self.depth)
            .field("status", &state.status)
            .field("namespaces", &state.changes.len())
            .finish()
    }
}
