//! One-phase commit port shared by every transactional adapter.

use crate::context::Context;
use crate::error::StoreResult;

/// Lifecycle of a transaction. Terminal states are sticky.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TxStatus {
    Active,
    Committed,
    RolledBack,
}

impl TxStatus {
    pub fn is_active(self) -> bool {
        matches!(self, TxStatus::Active)
    }
}

/// Transaction boundary carried by a [`Context`].
///
/// `begin_tx` returns a derived context; passing that context to other
/// operations of the same adapter routes them through the transaction.
/// Commit and rollback are one-phase: there is no prepare step.
pub trait OnePhaseCommit: Send + Sync {
    fn begin_tx(&self, ctx: &Context) -> StoreResult<Context>;

    fn commit_tx(&self, ctx: &Context) -> StoreResult<()>;

    fn rollback_tx(&self, ctx: &Context) -> StoreResult<()>;
}

impl<P> OnePhaseCommit for std::sync::Arc<P>
where
    P: OnePhaseCommit + ?Sized,
{
    fn begin_tx(&self, ctx: &Context) -> StoreResult<Context> {
        (**self).begin_tx(ctx)
    }

    fn commit_tx(&self, ctx: &Context) -> StoreResult<()> {
        (**self).commit_tx(ctx)
    }

    fn rollback_tx(&self, ctx: &Context) -> StoreResult<()> {
        (**self).rollback_tx(ctx)
    }
}
