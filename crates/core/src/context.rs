//! Ambient request context: cancellation plus owner-keyed slots.
//!
//! A `Context` is cheap to clone and immutable: deriving a context with a new
//! slot value returns a fresh `Context` and leaves the original untouched.
//! Adapters key their slots by their own process-unique id, so several event
//! logs or KV stores can keep independent transactions on one context.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

/// Key of a context slot: the owning adapter plus a slot name.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SlotKey {
    owner: Uuid,
    name: &'static str,
}

impl SlotKey {
    pub fn new(owner: Uuid, name: &'static str) -> Self {
        Self { owner, name }
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

type SlotValue = Arc<dyn Any + Send + Sync>;

#[derive(Debug, Default)]
struct CancelNode {
    canceled: AtomicBool,
    parent: Option<Arc<CancelNode>>,
}

impl CancelNode {
    fn is_canceled(&self) -> bool {
        if self.canceled.load(Ordering::Acquire) {
            return true;
        }
        self.parent.as_ref().is_some_and(|p| p.is_canceled())
    }
}

/// Cancels the context it was created with (and every context derived from it).
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<CancelNode>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.canceled.store(true, Ordering::Release);
    }
}

/// Ambient context passed to every adapter operation.
#[derive(Clone, Default)]
pub struct Context {
    cancel: Option<Arc<CancelNode>>,
    slots: Arc<HashMap<SlotKey, SlotValue>>,
}

impl Context {
    /// A never-canceled context without slots.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a cancellable context.
    ///
    /// Canceling the handle cancels the returned context and its descendants;
    /// canceling an ancestor cancels it too.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let node = Arc::new(CancelNode {
            canceled: AtomicBool::new(false),
            parent: self.cancel.clone(),
        });
        let ctx = Context {
            cancel: Some(node.clone()),
            slots: self.slots.clone(),
        };
        (ctx, CancelHandle(node))
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|c| c.is_canceled())
    }

    /// `Err(StoreError::Canceled)` once the context is canceled.
    pub fn err(&self) -> StoreResult<()> {
        if self.is_canceled() {
            Err(StoreError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Derive a context with `value` stored under `key`.
    pub fn with_value<T>(&self, key: SlotKey, value: Arc<T>) -> Context
    where
        T: Any + Send + Sync,
    {
        let mut slots = HashMap::clone(&self.slots);
        slots.insert(key, value);
        Context {
            cancel: self.cancel.clone(),
            slots: Arc::new(slots),
        }
    }

    /// Value stored under `key`, if present and of type `T`.
    pub fn value<T>(&self, key: &SlotKey) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let slot = self.slots.get(key)?.clone();
        slot.downcast::<T>().ok()
    }

    pub fn has_value(&self, key: &SlotKey) -> bool {
        self.slots.contains_key(key)
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("canceled", &self.is_canceled())
            .field("slots", &self.slots.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_is_never_canceled() {
        let ctx = Context::background();
        assert!(!ctx.is_canceled());
        assert_eq!(ctx.err(), Ok(()));
    }

    #[test]
    fn cancel_propagates_to_descendants_only() {
        let root = Context::background();
        let (parent, cancel_parent) = root.with_cancel();
        let (child, _cancel_child) = parent.with_cancel();
        let (_sibling, cancel_sibling) = root.with_cancel();

        cancel_sibling.cancel();
        assert!(!parent.is_canceled());
        assert!(!child.is_canceled());

        cancel_parent.cancel();
        assert!(parent.is_canceled());
        assert!(child.is_canceled());
        assert_eq!(child.err(), Err(StoreError::Canceled));
        assert!(!root.is_canceled());
    }

    #[test]
    fn slots_are_scoped_by_owner() {
        let a = SlotKey::new(Uuid::now_v7(), "tx");
        let b = SlotKey::new(Uuid::now_v7(), "tx");

        let ctx = Context::background().with_value(a, Arc::new(7u32));
        assert_eq!(ctx.value::<u32>(&a).as_deref(), Some(&7));
        assert!(ctx.value::<u32>(&b).is_none());
        assert!(ctx.value::<String>(&a).is_none());
    }

    #[test]
    fn deriving_leaves_original_untouched() {
        let key = SlotKey::new(Uuid::now_v7(), "meta");
        let original = Context::background();
        let derived = original.with_value(key, Arc::new("x".to_string()));

        assert!(!original.has_value(&key));
        assert!(derived.has_value(&key));
    }

    #[test]
    fn derived_value_context_keeps_cancellation() {
        let key = SlotKey::new(Uuid::now_v7(), "tx");
        let (ctx, cancel) = Context::background().with_cancel();
        let derived = ctx.with_value(key, Arc::new(1u8));

        cancel.cancel();
        assert!(derived.is_canceled());
    }
}
