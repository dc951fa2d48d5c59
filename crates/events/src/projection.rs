use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use crate::event::{Event, RepositoryEvent, RepositoryOp};

/// A projection folds an ordered event stream into a read model.
///
/// Projections are pure: the same event sequence always produces the same
/// state, so views can be thrown away and rebuilt from the log at any time.
pub trait Projection {
    /// Apply a single event. Events the projection does not own are ignored.
    fn apply(&mut self, event: &Event);

    /// Apply many events in order.
    fn run<'a>(&mut self, events: impl IntoIterator<Item = &'a Event>)
    where
        Self: Sized,
    {
        for event in events {
            self.apply(event);
        }
    }
}

/// Serialized id and value of one entity in a [`View`].
#[derive(Debug, Clone, PartialEq)]
pub struct ViewEntry {
    pub id: JsonValue,
    pub value: JsonValue,
}

/// Key → entity mapping of one repository namespace.
///
/// Materialized on demand from the log; never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct View {
    namespace: String,
    entries: BTreeMap<String, ViewEntry>,
}

impl View {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Fold `events` into a fresh view of `namespace`.
    pub fn project<'a>(namespace: impl Into<String>, events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut view = Self::new(namespace);
        view.run(events);
        view
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Whether `event` belongs to this view's namespace.
    pub fn owns(&self, event: &Event) -> bool {
        event.namespace() == Some(self.namespace.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&ViewEntry> {
        self.entries.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ViewEntry)> {
        self.entries.iter()
    }

    pub fn into_entries(self) -> BTreeMap<String, ViewEntry> {
        self.entries
    }

    /// Canonical log representation: one `Create` per surviving entity, in key order.
    pub fn canonical_events(&self) -> Vec<Event> {
        self.entries
            .iter()
            .map(|(key, entry)| {
                RepositoryEvent::create(
                    self.namespace.clone(),
                    entry.id.clone(),
                    key.clone(),
                    entry.value.clone(),
                )
                .into()
            })
            .collect()
    }

    fn apply_owned(&mut self, event: &RepositoryEvent) {
        match event.op {
            RepositoryOp::Create | RepositoryOp::Update => {
                let (key, id) = required_id(event);
                let value = event.value.clone().unwrap_or_else(|| corrupt(event, "value"));
                self.entries.insert(key.clone(), ViewEntry { id: id.clone(), value });
            }
            RepositoryOp::DeleteById => {
                let (key, _) = required_id(event);
                self.entries.remove(key);
            }
            RepositoryOp::DeleteAll => self.entries.clear(),
        }
    }
}

impl Projection for View {
    fn apply(&mut self, event: &Event) {
        if let Event::Repository(e) = event {
            if e.namespace == self.namespace {
                self.apply_owned(e);
            }
        }
    }
}

fn required_id(event: &RepositoryEvent) -> (&String, &JsonValue) {
    match (&event.key, &event.id) {
        (Some(key), Some(id)) => (key, id),
        _ => corrupt(event, "id"),
    }
}

/// A repository event without its id or value can only come from a bug.
fn corrupt(event: &RepositoryEvent, missing: &str) -> ! {
    panic!(
        "corrupt event log: {} event in namespace '{}' carries no {}",
        event.op.name(),
        event.namespace,
        missing
    )
}
