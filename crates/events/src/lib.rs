//! Event model, projections and pub/sub for the in-memory adapters.

pub mod bus;
pub mod event;
pub mod in_memory_bus;
pub mod projection;

pub use bus::{EventBus, FnSubscriber, Subscriber};
pub use event::{
    ControlEvent, Event, OpaqueEvent, RepositoryEvent, RepositoryOp, Trace, TxEventKind, dump,
};
pub use in_memory_bus::{Delivery, InMemoryEventBus, Subscription};
pub use projection::{Projection, View, ViewEntry};
