use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

/// Call stack captured when an event was first appended.
///
/// Traces exist for debugging only: they never influence event equality or
/// visibility, and two traces always compare equal.
#[derive(Clone)]
pub struct Trace {
    backtrace: Arc<Backtrace>,
    captured_at: DateTime<Utc>,
}

/// Frame prefixes belonging to the capture machinery itself.
const INTERNAL_FRAMES: &[&str] = &["std::backtrace", "memkit_events::", "memkit_infra::", "<memkit_"];

impl Trace {
    /// Capture the current stack, honoring `RUST_BACKTRACE` / `RUST_LIB_BACKTRACE`.
    pub fn capture() -> Self {
        Self::from_backtrace(Backtrace::capture())
    }

    /// Capture the current stack regardless of environment settings.
    pub fn force_capture() -> Self {
        Self::from_backtrace(Backtrace::force_capture())
    }

    fn from_backtrace(backtrace: Backtrace) -> Self {
        Self {
            backtrace: Arc::new(backtrace),
            captured_at: Utc::now(),
        }
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// Whether frames were actually recorded (capture may be disabled).
    pub fn is_captured(&self) -> bool {
        self.backtrace.status() == BacktraceStatus::Captured
    }

    /// Symbol names of the captured frames, leading adapter frames skipped.
    pub fn frames(&self) -> Vec<String> {
        if !self.is_captured() {
            return Vec::new();
        }

        let rendered = self.backtrace.to_string();
        rendered
            .lines()
            .filter_map(|line| {
                let line = line.trim_start();
                let (index, symbol) = line.split_once(": ")?;
                index.parse::<usize>().ok()?;
                Some(symbol.to_string())
            })
            .skip_while(|symbol| INTERNAL_FRAMES.iter().any(|p| symbol.starts_with(p)))
            .collect()
    }
}

impl PartialEq for Trace {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trace")
            .field("captured_at", &self.captured_at)
            .field("captured", &self.is_captured())
            .finish()
    }
}

/// Transaction control markers recorded in the log.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TxEventKind {
    BeginTx,
    CommitTx,
    RollbackTx,
}

impl TxEventKind {
    pub fn name(self) -> &'static str {
        match self {
            TxEventKind::BeginTx => "BeginTx",
            TxEventKind::CommitTx => "CommitTx",
            TxEventKind::RollbackTx => "RollbackTx",
        }
    }
}

/// Informational transaction marker. Ignored by projections, dropped by compaction.
#[derive(Debug, Clone)]
pub struct ControlEvent {
    pub kind: TxEventKind,
    pub trace: Option<Trace>,
}

impl ControlEvent {
    pub fn new(kind: TxEventKind) -> Self {
        Self { kind, trace: None }
    }
}

/// Repository operation recorded by a repository event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RepositoryOp {
    Create,
    Update,
    DeleteById,
    DeleteAll,
}

impl RepositoryOp {
    pub const ALL: [RepositoryOp; 4] = [
        RepositoryOp::Create,
        RepositoryOp::Update,
        RepositoryOp::DeleteById,
        RepositoryOp::DeleteAll,
    ];

    pub fn name(self) -> &'static str {
        match self {
            RepositoryOp::Create => "Create",
            RepositoryOp::Update => "Update",
            RepositoryOp::DeleteById => "DeleteByID",
            RepositoryOp::DeleteAll => "DeleteAll",
        }
    }

    /// Whether the event must carry an entity id.
    pub fn requires_id(self) -> bool {
        !matches!(self, RepositoryOp::DeleteAll)
    }

    /// Whether the event must carry an entity value.
    pub fn requires_value(self) -> bool {
        matches!(self, RepositoryOp::Create | RepositoryOp::Update)
    }
}

/// A typed CRUD fact for one repository namespace.
///
/// - `id` is the serialized identifier, `key` its view key.
/// - `value` is the serialized entity (`Create`/`Update` only).
#[derive(Debug, Clone)]
pub struct RepositoryEvent {
    pub namespace: String,
    pub op: RepositoryOp,
    pub id: Option<JsonValue>,
    pub key: Option<String>,
    pub value: Option<JsonValue>,
    pub trace: Option<Trace>,
}

impl RepositoryEvent {
    pub fn create(namespace: impl Into<String>, id: JsonValue, key: String, value: JsonValue) -> Self {
        Self::with_entity(namespace, RepositoryOp::Create, id, key, Some(value))
    }

    pub fn update(namespace: impl Into<String>, id: JsonValue, key: String, value: JsonValue) -> Self {
        Self::with_entity(namespace, RepositoryOp::Update, id, key, Some(value))
    }

    pub fn delete_by_id(namespace: impl Into<String>, id: JsonValue, key: String) -> Self {
        Self::with_entity(namespace, RepositoryOp::DeleteById, id, key, None)
    }

    pub fn delete_all(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            op: RepositoryOp::DeleteAll,
            id: None,
            key: None,
            value: None,
            trace: None,
        }
    }

    fn with_entity(
        namespace: impl Into<String>,
        op: RepositoryOp,
        id: JsonValue,
        key: String,
        value: Option<JsonValue>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            op,
            id: Some(id),
            key: Some(key),
            value,
            trace: None,
        }
    }
}

/// Application event sharing the log with repository events.
#[derive(Debug, Clone)]
pub struct OpaqueEvent {
    pub kind: String,
    pub payload: JsonValue,
    pub trace: Option<Trace>,
}

impl OpaqueEvent {
    pub fn new(kind: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            kind: kind.into(),
            payload,
            trace: None,
        }
    }
}

// Equality ignores traces: an event compares equal whether or not a trace
// was attached on append.
impl PartialEq for ControlEvent {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
    }
}

impl PartialEq for RepositoryEvent {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace
            && self.op == other.op
            && self.id == other.id
            && self.key == other.key
            && self.value == other.value
    }
}

impl PartialEq for OpaqueEvent {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.payload == other.payload
    }
}

/// Element of an event log.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Tx(ControlEvent),
    Repository(RepositoryEvent),
    Opaque(OpaqueEvent),
}

impl Event {
    pub fn control(kind: TxEventKind) -> Self {
        Event::Tx(ControlEvent::new(kind))
    }

    pub fn opaque(kind: impl Into<String>, payload: JsonValue) -> Self {
        Event::Opaque(OpaqueEvent::new(kind, payload))
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Event::Tx(_))
    }

    /// Namespace of a repository event.
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Event::Repository(e) => Some(&e.namespace),
            _ => None,
        }
    }

    pub fn as_repository(&self) -> Option<&RepositoryEvent> {
        match self {
            Event::Repository(e) => Some(e),
            _ => None,
        }
    }

    pub fn trace(&self) -> Option<&Trace> {
        match self {
            Event::Tx(e) => e.trace.as_ref(),
            Event::Repository(e) => e.trace.as_ref(),
            Event::Opaque(e) => e.trace.as_ref(),
        }
    }

    /// Attach a trace unless one is already set; an existing trace is never replaced.
    pub fn ensure_trace(&mut self, capture: impl FnOnce() -> Trace) {
        let slot = match self {
            Event::Tx(e) => &mut e.trace,
            Event::Repository(e) => &mut e.trace,
            Event::Opaque(e) => &mut e.trace,
        };
        if slot.is_none() {
            *slot = Some(capture());
        }
    }
}

impl From<RepositoryEvent> for Event {
    fn from(value: RepositoryEvent) -> Self {
        Event::Repository(value)
    }
}

impl From<ControlEvent> for Event {
    fn from(value: ControlEvent) -> Self {
        Event::Tx(value)
    }
}

impl From<OpaqueEvent> for Event {
    fn from(value: OpaqueEvent) -> Self {
        Event::Opaque(value)
    }
}

/// One diagnostic line: `namespace → opname value`.
impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Tx(e) => write!(f, "tx → {}", e.kind.name()),
            Event::Repository(e) => {
                write!(f, "{} → {}", e.namespace, e.op.name())?;
                match (&e.value, &e.id) {
                    (Some(value), _) => write!(f, " {value}"),
                    (None, Some(id)) => write!(f, " {id}"),
                    (None, None) => Ok(()),
                }
            }
            Event::Opaque(e) => write!(f, "{} → event {}", e.kind, e.payload),
        }
    }
}

/// Render events one per line, for test failure output.
pub fn dump<'a>(events: impl IntoIterator<Item = &'a Event>) -> String {
    events
        .into_iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}
