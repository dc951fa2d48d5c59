//! Typed, namespace-scoped subscriptions over repository events.

use std::marker::PhantomData;

use serde::de::DeserializeOwned;

use memkit_core::{Context, Identifiable, StoreError, StoreResult};
use memkit_events::{Event, RepositoryEvent, RepositoryOp, Subscriber};

/// A decoded repository fact.
#[derive(Debug, Clone, PartialEq)]
pub enum Change<E>
where
    E: Identifiable,
{
    Created(E),
    Updated(E),
    DeletedById(E::Id),
    DeletedAll,
}

impl<E> Change<E>
where
    E: Identifiable,
{
    pub fn op(&self) -> RepositoryOp {
        match self {
            Change::Created(_) => RepositoryOp::Create,
            Change::Updated(_) => RepositoryOp::Update,
            Change::DeletedById(_) => RepositoryOp::DeleteById,
            Change::DeletedAll => RepositoryOp::DeleteAll,
        }
    }
}

/// Consumer of typed repository changes.
pub trait ChangeSubscriber<E>: Send + Sync + 'static
where
    E: Identifiable,
{
    fn handle(&self, ctx: &Context, change: &Change<E>) -> StoreResult<()>;

    fn handle_error(&self, ctx: &Context, err: StoreError) -> StoreResult<()> {
        let _ = ctx;
        Err(err)
    }
}

/// Adapts a [`ChangeSubscriber`] to the log's raw event stream.
pub(crate) struct ChangeFilter<E, S> {
    namespace: String,
    kinds: Vec<RepositoryOp>,
    inner: S,
    _entity: PhantomData<fn() -> E>,
}

impl<E, S> ChangeFilter<E, S> {
    pub(crate) fn new(namespace: impl Into<String>, kinds: &[RepositoryOp], inner: S) -> Self {
        Self {
            namespace: namespace.into(),
            kinds: kinds.to_vec(),
            inner,
            _entity: PhantomData,
        }
    }

    fn wants<'a>(&self, event: &'a Event) -> Option<&'a RepositoryEvent> {
        let event = event.as_repository()?;
        (event.namespace == self.namespace && self.kinds.contains(&event.op)).then_some(event)
    }
}

fn decode<E>(event: &RepositoryEvent) -> StoreResult<Change<E>>
where
    E: Identifiable + DeserializeOwned,
{
    let value = || {
        event
            .value
            .clone()
            .ok_or_else(|| StoreError::serialization(format!("{} event carries no value", event.op.name())))
    };

    Ok(match event.op {
        RepositoryOp::Create => Change::Created(serde_json::from_value(value()?)?),
        RepositoryOp::Update => Change::Updated(serde_json::from_value(value()?)?),
        RepositoryOp::DeleteById => {
            let id = event
                .id
                .clone()
                .ok_or_else(|| StoreError::serialization("DeleteByID event carries no id"))?;
            Change::DeletedById(serde_json::from_value(id)?)
        }
        RepositoryOp::DeleteAll => Change::DeletedAll,
    })
}

impl<E, S> Subscriber for ChangeFilter<E, S>
where
    E: Identifiable + DeserializeOwned + 'static,
    S: ChangeSubscriber<E>,
{
    fn handle(&self, ctx: &Context, event: &Event) -> StoreResult<()> {
        let Some(event) = self.wants(event) else {
            return Ok(());
        };
        let change = decode::<E>(event)?;
        self.inner.handle(ctx, &change)
    }

    fn handle_error(&self, ctx: &Context, err: StoreError) -> StoreResult<()> {
        self.inner.handle_error(ctx, err)
    }
}

/// Subscriber built from a closure.
pub struct FnChangeSubscriber<F>(pub F);

impl<E, F> ChangeSubscriber<E> for FnChangeSubscriber<F>
where
    E: Identifiable,
    F: Fn(&Context, &Change<E>) -> StoreResult<()> + Send + Sync + 'static,
{
    fn handle(&self, ctx: &Context, change: &Change<E>) -> StoreResult<()> {
        (self.0)(ctx, change)
    }
}
