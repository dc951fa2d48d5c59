//! Nested event buffers layered on the root log.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use memkit_core::{Context, StoreError, StoreResult, TxStatus};
use memkit_events::{Event, TxEventKind};

use super::in_memory::LogShared;

/// Where a transaction drains its buffer on commit.
#[derive(Clone)]
pub(crate) enum Scope {
    Root(Arc<LogShared>),
    Tx(Arc<Transaction>),
}

impl Scope {
    pub(crate) fn append(&self, ctx: &Context, event: Event) -> StoreResult<()> {
        match self {
            Scope::Root(log) => log.append_root(ctx, event),
            Scope::Tx(tx) => tx.append(ctx, event),
        }
    }

    pub(crate) fn visible_events(&self) -> StoreResult<Vec<Event>> {
        match self {
            Scope::Root(log) => Ok(log.snapshot()),
            Scope::Tx(tx) => tx.visible_events(),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        match self {
            Scope::Root(_) => true,
            Scope::Tx(tx) => tx.is_active(),
        }
    }

    fn depth(&self) -> usize {
        match self {
            Scope::Root(_) => 0,
            Scope::Tx(tx) => tx.depth,
        }
    }

    fn log(&self) -> &Arc<LogShared> {
        match self {
            Scope::Root(log) => log,
            Scope::Tx(tx) => tx.parent.log(),
        }
    }
}

#[derive(Debug)]
struct TxState {
    status: TxStatus,
    buffer: Vec<Event>,
}

/// A pending buffer of events on top of the root log or another transaction.
///
/// - Commit appends `CommitTx`, then replays the buffer into the parent in order.
/// - Rollback appends `RollbackTx` and discards the buffer.
/// - Once committed or rolled back, every further operation fails.
pub struct Transaction {
    parent: Scope,
    /// Context the transaction was begun from; replay and publication use it.
    parent_ctx: Context,
    depth: usize,
    state: Mutex<TxState>,
}

impl Transaction {
    /// Open a transaction over `parent`; its buffer starts with a `BeginTx` marker.
    pub(crate) fn begin(parent: Scope, parent_ctx: Context) -> StoreResult<Arc<Self>> {
        if !parent.is_active() {
            return Err(StoreError::TransactionDone);
        }

        let begin = parent.log().prepare(Event::control(TxEventKind::BeginTx));
        Ok(Arc::new(Self {
            depth: parent.depth() + 1,
            parent,
            parent_ctx,
            state: Mutex::new(TxState {
                status: TxStatus::Active,
                buffer: vec![begin],
            }),
        }))
    }

    fn state(&self) -> MutexGuard<'_, TxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self) -> TxStatus {
        self.state().status
    }

    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }

    /// Nesting level: 1 for a transaction directly on the root log.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Copy of the events buffered so far.
    pub fn buffered(&self) -> Vec<Event> {
        self.state().buffer.clone()
    }

    pub(crate) fn append(&self, ctx: &Context, event: Event) -> StoreResult<()> {
        ctx.err()?;
        let mut state = self.state();
        if !state.status.is_active() {
            return Err(StoreError::TransactionDone);
        }
        state.buffer.push(event);
        Ok(())
    }

    /// Parent's visible stream followed by this buffer.
    pub(crate) fn visible_events(&self) -> StoreResult<Vec<Event>> {
        let mut events = self.parent.visible_events()?;
        let state = self.state();
        if !state.status.is_active() {
            return Err(StoreError::TransactionDone);
        }
        events.extend(state.buffer.iter().cloned());
        Ok(events)
    }

    /// Mark committed and replay the buffer into the parent.
    ///
    /// Replay runs under the context the transaction was begun from, so
    /// subscribers of the root log receive a context whose transactions are
    /// still usable.
    ///
    /// A replay failure is returned but does not undo the commit: the
    /// transaction stays committed and the events replayed before the failure
    /// stay in the parent.
    pub(crate) fn commit(&self, ctx: &Context) -> StoreResult<()> {
        ctx.err()?;
        let buffer = {
            let mut state = self.state();
            if !state.status.is_active() {
                return Err(StoreError::TransactionAlreadyDone);
            }
            let commit = self.parent.log().prepare(Event::control(TxEventKind::CommitTx));
            state.buffer.push(commit);
            state.status = TxStatus::Committed;
            std::mem::take(&mut state.buffer)
        };

        let mut first_err = None;
        for event in buffer {
            if let Err(err) = self.parent.append(&self.parent_ctx, event) {
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn rollback(&self, ctx: &Context) -> StoreResult<()> {
        ctx.err()?;
        let mut state = self.state();
        if !state.status.is_active() {
            return Err(StoreError::TransactionAlreadyDone);
        }
        let rollback = self.parent.log().prepare(Event::control(TxEventKind::RollbackTx));
        state.buffer.push(rollback);
        state.status = TxStatus::RolledBack;
        state.buffer.clear();
        Ok(())
    }
}

impl core::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.state();
        f.debug_struct("Transaction")
            .field("depth", &self.depth)
            .field("status", &state.status)
            .field("buffered", &state.buffer.len())
            .finish()
    }
}
