//! Typed repositories projected from the event log.

pub mod event_log;
pub mod iter;
pub mod subscription;
pub mod r#trait;

pub use event_log::{EventLogRepository, IdGenerator, RepositoryConfig};
pub use iter::Entities;
pub use r#trait::Repository;
pub use subscription::{Change, ChangeSubscriber, FnChangeSubscriber};
