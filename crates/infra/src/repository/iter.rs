use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use memkit_core::{Context, StoreError, StoreResult};

pub(crate) enum Lookup {
    Found(JsonValue),
    Missing(String),
}

/// Lazily decoded query result.
///
/// Cancellation is checked before every element. The first error (cancellation,
/// a missing id, or a decode failure) is yielded once and ends the iteration.
pub struct Entities<E> {
    ctx: Context,
    namespace: String,
    pending: std::vec::IntoIter<Lookup>,
    done: bool,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Entities<E> {
    pub(crate) fn new(ctx: &Context, namespace: &str, pending: Vec<Lookup>) -> Self {
        Self {
            ctx: ctx.clone(),
            namespace: namespace.to_string(),
            pending: pending.into_iter(),
            done: false,
            _entity: PhantomData,
        }
    }

    fn fail(&mut self, err: StoreError) -> Option<StoreResult<E>> {
        self.done = true;
        Some(Err(err))
    }
}

impl<E> Iterator for Entities<E>
where
    E: DeserializeOwned,
{
    type Item = StoreResult<E>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let lookup = self.pending.next()?;
        if let Err(err) = self.ctx.err() {
            return self.fail(err);
        }

        match lookup {
            Lookup::Found(value) => match serde_json::from_value(value) {
                Ok(entity) => Some(Ok(entity)),
                Err(err) => self.fail(err.into()),
            },
            Lookup::Missing(key) => {
                let err = StoreError::not_found(self.namespace.clone(), key);
                self.fail(err)
            }
        }
    }
}

impl<E> core::fmt::Debug for Entities<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Entities")
            .field("namespace", &self.namespace)
            .field("remaining", &self.pending.len())
            .field("done", &self.done)
            .finish()
    }
}
