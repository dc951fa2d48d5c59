//! Event publishing/subscription abstraction.
//!
//! Events are appended to a log first and published second: subscribers only
//! ever see events that reached the root log, never events still buffered in
//! an open transaction.
//!
//! Subscriber failures never fail the publishing operation. An error returned
//! by [`Subscriber::handle`] is routed to the same subscriber's
//! [`Subscriber::handle_error`] hook; if that fails as well the error is
//! logged and dropped.

use std::sync::Arc;

use memkit_core::{Context, StoreError, StoreResult};

use crate::event::Event;
use crate::in_memory_bus::Subscription;

/// Consumer of published events.
pub trait Subscriber: Send + Sync + 'static {
    fn handle(&self, ctx: &Context, event: &Event) -> StoreResult<()>;

    /// Called with the error `handle` returned.
    fn handle_error(&self, ctx: &Context, err: StoreError) -> StoreResult<()> {
        let _ = ctx;
        Err(err)
    }
}

impl<S> Subscriber for Arc<S>
where
    S: Subscriber + ?Sized,
{
    fn handle(&self, ctx: &Context, event: &Event) -> StoreResult<()> {
        (**self).handle(ctx, event)
    }

    fn handle_error(&self, ctx: &Context, err: StoreError) -> StoreResult<()> {
        (**self).handle_error(ctx, err)
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
pub trait EventBus: Send + Sync {
    /// Deliver `event` to every open subscription.
    fn publish(&self, ctx: &Context, event: &Event);

    /// Register a subscriber; delivery stops once the subscription is closed.
    fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> Subscription;
}

impl<B> EventBus for Arc<B>
where
    B: EventBus + ?Sized,
{
    fn publish(&self, ctx: &Context, event: &Event) {
        (**self).publish(ctx, event)
    }

    fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> Subscription {
        (**self).subscribe(subscriber)
    }
}

/// Subscriber built from a closure; errors go to the default `handle_error`.
pub struct FnSubscriber<F>(pub F);

impl<F> Subscriber for FnSubscriber<F>
where
    F: Fn(&Context, &Event) -> StoreResult<()> + Send + Sync + 'static,
{
    fn handle(&self, ctx: &Context, event: &Event) -> StoreResult<()> {
        (self.0)(ctx, event)
    }
}
