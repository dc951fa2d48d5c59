//! Store error model.

use thiserror::Error;

/// Result type used across the adapters.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error surfaced at the boundary of every in-memory adapter.
///
/// A corrupt event log is not represented here: it indicates a programmer
/// bug and is raised as a panic by the projection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The ambient context was canceled before (or while) the operation ran.
    #[error("context canceled")]
    Canceled,

    /// `create` hit an id that is already visible in the view.
    #[error("entity already exists: {namespace}/{id}")]
    AlreadyExists { namespace: String, id: String },

    /// The entity is not visible in the view.
    #[error("entity not found: {namespace}/{id}")]
    NotFound { namespace: String, id: String },

    /// Commit/rollback without a transaction on the context.
    #[error("no transaction found in context")]
    NoTransaction,

    /// Operation on a transaction whose state is terminal.
    #[error("transaction done")]
    TransactionDone,

    /// Second commit/rollback of the same transaction.
    #[error("transaction already done")]
    TransactionAlreadyDone,

    /// The entity carries no identifier.
    #[error("entity has no id")]
    MissingId,

    /// A metadata value exists under the key but has another type.
    #[error("metadata '{key}' has a different type")]
    MetaTypeMismatch { key: String },

    /// Entity or id (de)serialization failed.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// The id generator failed.
    #[error("id generation failed: {0}")]
    IdGeneration(String),

    /// A subscriber rejected an event.
    #[error("subscriber failed: {0}")]
    Subscriber(String),
}

impl StoreError {
    pub fn already_exists(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            namespace: namespace.into(),
            id: id.into(),
        }
    }

    pub fn not_found(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            namespace: namespace.into(),
            id: id.into(),
        }
    }

    pub fn meta_type_mismatch(key: impl Into<String>) -> Self {
        Self::MetaTypeMismatch { key: key.into() }
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn subscriber(msg: impl Into<String>) -> Self {
        Self::Subscriber(msg.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value.to_string())
    }
}
