use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tracing::{debug, warn};
use uuid::Uuid;

use memkit_core::{Context, OnePhaseCommit, SlotKey, StoreError, StoreResult};
use memkit_events::{Event, EventBus, InMemoryEventBus, Subscriber, Subscription, Trace, dump};

use super::options::EventLogOptions;
use super::transaction::{Scope, Transaction};

const TX_SLOT: &str = "event_log.tx";
const META_SLOT: &str = "event_log.meta";

type MetaMap = HashMap<String, Arc<dyn Any + Send + Sync>>;

/// State shared by an [`EventLog`] handle and its transactions.
pub(crate) struct LogShared {
    id: OnceLock<Uuid>,
    events: RwLock<Vec<Event>>,
    options: EventLogOptions,
    bus: InMemoryEventBus,
}

impl LogShared {
    fn id(&self) -> Uuid {
        *self.id.get_or_init(Uuid::now_v7)
    }

    /// Attach a trace on first append when enabled.
    pub(crate) fn prepare(&self, mut event: Event) -> Event {
        if self.options.capture_traces {
            event.ensure_trace(Trace::force_capture);
        }
        event
    }

    /// Push under the writer lock and queue for subscribers in the same
    /// critical section, so delivery order is log order.
    pub(crate) fn append_root(&self, ctx: &Context, event: Event) -> StoreResult<()> {
        ctx.err()?;
        {
            let mut events = self.events.write().unwrap_or_else(PoisonError::into_inner);
            events.push(event.clone());
            self.bus.enqueue(ctx, event);
        }
        self.bus.flush();
        Ok(())
    }

    pub(crate) fn snapshot(&self) -> Vec<Event> {
        self.events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// In-memory append-only event log with nested transactions.
///
/// The log is the ground truth for any number of repositories. Handles are
/// cheap to clone and share the same buffer.
///
/// Transactions live on the [`Context`]: `begin_tx` returns a derived context
/// and every operation given that context (or one derived from it) goes
/// through the transaction. Slots are keyed by this log's id, so several
/// logs can keep independent transactions on one context.
#[derive(Clone)]
pub struct EventLog {
    shared: Arc<LogShared>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_options(EventLogOptions::default())
    }

    pub fn with_options(options: EventLogOptions) -> Self {
        Self {
            shared: Arc::new(LogShared {
                id: OnceLock::new(),
                events: RwLock::new(Vec::new()),
                bus: InMemoryEventBus::new(options.delivery()),
                options,
            }),
        }
    }

    /// Process-unique id of this log, generated on first use.
    pub fn id(&self) -> Uuid {
        self.shared.id()
    }

    pub fn options(&self) -> EventLogOptions {
        self.shared.options
    }

    fn tx_slot(&self) -> SlotKey {
        SlotKey::new(self.id(), TX_SLOT)
    }

    fn meta_slot(&self) -> SlotKey {
        SlotKey::new(self.id(), META_SLOT)
    }

    /// Innermost transaction of this log carried by `ctx`.
    pub fn lookup_tx(&self, ctx: &Context) -> Option<Arc<Transaction>> {
        ctx.value::<Transaction>(&self.tx_slot())
    }

    fn scope(&self, ctx: &Context) -> Scope {
        match self.lookup_tx(ctx) {
            Some(tx) => Scope::Tx(tx),
            None => Scope::Root(self.shared.clone()),
        }
    }

    /// Append to the innermost scope reachable from `ctx`.
    pub fn append(&self, ctx: &Context, event: impl Into<Event>) -> StoreResult<()> {
        ctx.err()?;
        let event = self.shared.prepare(event.into());
        self.scope(ctx).append(ctx, event)
    }

    /// Snapshot of the committed (root) events.
    pub fn events(&self) -> Vec<Event> {
        self.shared.snapshot()
    }

    pub fn len(&self) -> usize {
        self.shared
            .events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events visible from `ctx`: the root log plus every enclosing transaction buffer.
    pub fn events_in_context(&self, ctx: &Context) -> StoreResult<Vec<Event>> {
        ctx.err()?;
        self.scope(ctx).visible_events()
    }

    /// Run `body` in a transaction: commit on success, roll back and return its error otherwise.
    pub fn atomic<T>(
        &self,
        ctx: &Context,
        body: impl FnOnce(&Context) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let tx_ctx = self.begin_tx(ctx)?;
        match body(&tx_ctx) {
            Ok(value) => {
                self.commit_tx(&tx_ctx)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = self.rollback_tx(&tx_ctx) {
                    warn!(log = %self.id(), error = %rollback_err, "rollback after failed body failed");
                }
                Err(err)
            }
        }
    }

    /// Replace the root buffer with `mapper(current)` under the writer lock.
    pub fn rewrite(&self, mapper: impl FnOnce(Vec<Event>) -> Vec<Event>) {
        let mut events = self.shared.events.write().unwrap_or_else(PoisonError::into_inner);
        let rewritten = mapper(events.clone());
        *events = rewritten;
    }

    /// Rewrite only the events selected by `matches`.
    ///
    /// The mapper receives the matching events in log order; its output takes
    /// the position of the first matching event (or the end of the log when
    /// nothing matched). Other events keep their relative order.
    pub fn rewrite_matching(
        &self,
        matches: impl Fn(&Event) -> bool,
        mapper: impl FnOnce(Vec<Event>) -> Vec<Event>,
    ) {
        self.rewrite(|events| {
            let mut kept = Vec::with_capacity(events.len());
            let mut matched = Vec::new();
            let mut position = None;

            for event in events {
                if matches(&event) {
                    position.get_or_insert(kept.len());
                    matched.push(event);
                } else {
                    kept.push(event);
                }
            }

            let at = position.unwrap_or(kept.len());
            kept.splice(at..at, mapper(matched));
            kept
        });
    }

    /// Drop every transaction control event from the root log.
    pub fn compress(&self) {
        self.rewrite(|events| events.into_iter().filter(|e| !e.is_control()).collect());
        debug!(log = %self.id(), "compressed transaction markers");
    }

    /// Derive a context carrying `value` as this log's metadata under `key`.
    pub fn set_meta<T>(&self, ctx: &Context, key: impl Into<String>, value: T) -> StoreResult<Context>
    where
        T: Any + Send + Sync,
    {
        ctx.err()?;
        let slot = self.meta_slot();
        let mut meta: MetaMap = ctx
            .value::<MetaMap>(&slot)
            .map(|m| MetaMap::clone(&m))
            .unwrap_or_default();
        meta.insert(key.into(), Arc::new(value));
        Ok(ctx.with_value(slot, Arc::new(meta)))
    }

    /// Metadata stored for this log under `key`.
    ///
    /// `Ok(None)` when absent; `MetaTypeMismatch` when stored with another type.
    pub fn lookup_meta<T>(&self, ctx: &Context, key: &str) -> StoreResult<Option<T>>
    where
        T: Any + Send + Sync + Clone,
    {
        ctx.err()?;
        let Some(meta) = ctx.value::<MetaMap>(&self.meta_slot()) else {
            return Ok(None);
        };
        let Some(value) = meta.get(key) else {
            return Ok(None);
        };
        value
            .downcast_ref::<T>()
            .cloned()
            .map(Some)
            .ok_or_else(|| StoreError::meta_type_mismatch(key))
    }

    /// Receive every event once it reaches the root log.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> Subscription {
        self.shared.bus.subscribe(subscriber)
    }

    /// Root events as `namespace → opname value` lines.
    pub fn dump(&self) -> String {
        dump(&self.events())
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventLog")
            .field("id", &self.id())
            .field("len", &self.len())
            .field("options", &self.shared.options)
            .finish()
    }
}

impl OnePhaseCommit for EventLog {
    fn begin_tx(&self, ctx: &Context) -> StoreResult<Context> {
        ctx.err()?;
        let tx = Transaction::begin(self.scope(ctx), ctx.clone())?;
        debug!(log = %self.id(), depth = tx.depth(), "begin transaction");
        Ok(ctx.with_value(self.tx_slot(), tx))
    }

    fn commit_tx(&self, ctx: &Context) -> StoreResult<()> {
        ctx.err()?;
        let tx = self.lookup_tx(ctx).ok_or(StoreError::NoTransaction)?;
        debug!(log = %self.id(), depth = tx.depth(), "commit transaction");
        tx.commit(ctx)
    }

    fn rollback_tx(&self, ctx: &Context) -> StoreResult<()> {
        ctx.err()?;
        let tx = self.lookup_tx(ctx).ok_or(StoreError::NoTransaction)?;
        debug!(log = %self.id(), depth = tx.depth(), "rollback transaction");
        tx.rollback(ctx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::mpsc;
    use std::time::Duration;

    use serde_json::json;

    use memkit_core::TxStatus;
    use memkit_events::{FnSubscriber, RepositoryEvent, TxEventKind};

    use super::*;

    fn tick(n: u64) -> Event {
        Event::opaque("tick", json!(n))
    }

    fn ticks(events: &[Event]) -> Vec<u64> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Opaque(o) => o.payload.as_u64(),
                _ => None,
            })
            .collect()
    }

    fn control_kinds(events: &[Event]) -> Vec<TxEventKind> {
        events
            .iter()
            .filter_map(|e| match e {
                Event::Tx(c) => Some(c.kind),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn append_is_visible_immediately() {
        let log = EventLog::new();
        let ctx = Context::background();

        log.append(&ctx, tick(1)).unwrap();
        log.append(&ctx, tick(2)).unwrap();

        assert_eq!(log.events(), vec![tick(1), tick(2)]);
        assert_eq!(log.events_in_context(&ctx).unwrap(), log.events());
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn canceled_append_is_rejected() {
        let log = EventLog::new();
        let (ctx, cancel) = Context::background().with_cancel();
        let tx_ctx = log.begin_tx(&ctx).unwrap();
        cancel.cancel();

        assert_eq!(log.append(&ctx, tick(1)), Err(StoreError::Canceled));
        assert_eq!(log.append(&tx_ctx, tick(1)), Err(StoreError::Canceled));
        assert_eq!(log.commit_tx(&tx_ctx), Err(StoreError::Canceled));
        assert_eq!(log.begin_tx(&ctx).unwrap_err(), StoreError::Canceled);
        assert!(log.is_empty());
        assert!(log.lookup_tx(&tx_ctx).is_some_and(|tx| tx.is_active()));
    }

    #[test]
    fn commit_replays_markers_and_events_in_order() {
        let log = EventLog::new();
        let ctx = Context::background();

        let tx_ctx = log.begin_tx(&ctx).unwrap();
        for n in 0..3 {
            log.append(&tx_ctx, tick(n)).unwrap();
        }
        assert!(log.is_empty());
        assert_eq!(ticks(&log.events_in_context(&tx_ctx).unwrap()), vec![0, 1, 2]);

        log.commit_tx(&tx_ctx).unwrap();

        let events = log.events();
        assert_eq!(ticks(&events), vec![0, 1, 2]);
        assert_eq!(
            control_kinds(&events),
            vec![TxEventKind::BeginTx, TxEventKind::CommitTx]
        );
        assert!(events.first().is_some_and(Event::is_control));
        assert!(events.last().is_some_and(Event::is_control));
    }

    #[test]
    fn rollback_discards_buffer() {
        let log = EventLog::new();
        let ctx = Context::background();

        let tx_ctx = log.begin_tx(&ctx).unwrap();
        log.append(&tx_ctx, tick(1)).unwrap();
        log.rollback_tx(&tx_ctx).unwrap();

        assert!(log.is_empty());
        assert_eq!(
            log.lookup_tx(&tx_ctx).map(|tx| tx.status()),
            Some(TxStatus::RolledBack)
        );
    }

    #[test]
    fn finished_transactions_reject_further_use() {
        let log = EventLog::new();
        let ctx = Context::background();
        let tx_ctx = log.begin_tx(&ctx).unwrap();
        log.commit_tx(&tx_ctx).unwrap();

        assert_eq!(log.commit_tx(&tx_ctx), Err(StoreError::TransactionAlreadyDone));
        assert_eq!(log.rollback_tx(&tx_ctx), Err(StoreError::TransactionAlreadyDone));
        assert_eq!(log.append(&tx_ctx, tick(1)), Err(StoreError::TransactionDone));
        assert_eq!(
            log.events_in_context(&tx_ctx).unwrap_err(),
            StoreError::TransactionDone
        );
        assert_eq!(log.begin_tx(&tx_ctx).unwrap_err(), StoreError::TransactionDone);
    }

    #[test]
    fn commit_without_transaction_fails() {
        let log = EventLog::new();
        let ctx = Context::background();

        assert_eq!(log.commit_tx(&ctx), Err(StoreError::NoTransaction));
        assert_eq!(log.rollback_tx(&ctx), Err(StoreError::NoTransaction));
        assert!(log.lookup_tx(&ctx).is_none());
    }

    #[test]
    fn nested_commit_lands_in_parent_only() {
        let log = EventLog::new();
        let ctx = Context::background();

        let outer = log.begin_tx(&ctx).unwrap();
        log.append(&outer, tick(1)).unwrap();
        let inner = log.begin_tx(&outer).unwrap();
        log.append(&inner, tick(2)).unwrap();

        assert_eq!(log.lookup_tx(&inner).map(|tx| tx.depth()), Some(2));
        assert_eq!(ticks(&log.events_in_context(&outer).unwrap()), vec![1]);
        assert_eq!(ticks(&log.events_in_context(&inner).unwrap()), vec![1, 2]);

        log.commit_tx(&inner).unwrap();
        assert_eq!(ticks(&log.events_in_context(&outer).unwrap()), vec![1, 2]);
        assert!(log.is_empty());

        log.commit_tx(&outer).unwrap();
        assert_eq!(ticks(&log.events()), vec![1, 2]);
        assert_eq!(control_kinds(&log.events()).len(), 4);
    }

    #[test]
    fn inner_rollback_keeps_outer_work() {
        let log = EventLog::new();
        let ctx = Context::background();

        let outer = log.begin_tx(&ctx).unwrap();
        log.append(&outer, tick(1)).unwrap();
        let inner = log.begin_tx(&outer).unwrap();
        log.append(&inner, tick(2)).unwrap();
        log.rollback_tx(&inner).unwrap();
        log.commit_tx(&outer).unwrap();

        assert_eq!(ticks(&log.events()), vec![1]);
    }

    #[test]
    fn atomic_commits_on_success_and_rolls_back_on_error() {
        let log = EventLog::new();
        let ctx = Context::background();

        let value = log
            .atomic(&ctx, |tx_ctx| {
                log.append(tx_ctx, tick(1))?;
                Ok(7)
            })
            .unwrap();
        assert_eq!(value, 7);

        let err = log
            .atomic(&ctx, |tx_ctx| -> StoreResult<()> {
                log.append(tx_ctx, tick(2))?;
                Err(StoreError::MissingId)
            })
            .unwrap_err();
        assert_eq!(err, StoreError::MissingId);
        assert_eq!(ticks(&log.events()), vec![1]);
    }

    #[test]
    fn transactions_of_two_logs_share_a_context() {
        let a = EventLog::new();
        let b = EventLog::new();
        let ctx = Context::background();

        let ctx = a.begin_tx(&ctx).unwrap();
        let ctx = b.begin_tx(&ctx).unwrap();
        a.append(&ctx, tick(1)).unwrap();
        b.append(&ctx, tick(2)).unwrap();

        a.commit_tx(&ctx).unwrap();
        assert_eq!(ticks(&a.events()), vec![1]);
        assert!(b.is_empty());

        b.rollback_tx(&ctx).unwrap();
        assert!(b.is_empty());
    }

    #[test]
    fn rewrite_matching_splices_at_first_match() {
        let log = EventLog::new();
        let ctx = Context::background();
        for n in 0..6 {
            log.append(&ctx, tick(n)).unwrap();
        }

        log.rewrite_matching(
            |e| matches!(e, Event::Opaque(o) if o.payload.as_u64().is_some_and(|n| n % 2 == 1)),
            |odd| vec![tick(odd.len() as u64 * 100)],
        );

        assert_eq!(ticks(&log.events()), vec![0, 300, 2, 4]);
    }

    #[test]
    fn rewrite_matching_without_match_appends_output() {
        let log = EventLog::new();
        let ctx = Context::background();
        log.append(&ctx, tick(1)).unwrap();

        log.rewrite_matching(|_| false, |_| vec![tick(9)]);

        assert_eq!(ticks(&log.events()), vec![1, 9]);
    }

    #[test]
    fn compress_drops_control_events_only() {
        let log = EventLog::new();
        let ctx = Context::background();
        log.atomic(&ctx, |tx_ctx| log.append(tx_ctx, tick(1))).unwrap();

        log.compress();

        assert_eq!(log.events(), vec![tick(1)]);
    }

    #[test]
    fn meta_is_scoped_to_the_log() {
        let a = EventLog::new();
        let b = EventLog::new();
        let ctx = a
            .set_meta(&Context::background(), "user", "alice".to_string())
            .unwrap();
        let ctx = a.set_meta(&ctx, "attempt", 3u32).unwrap();

        assert_eq!(a.lookup_meta::<String>(&ctx, "user"), Ok(Some("alice".to_string())));
        assert_eq!(a.lookup_meta::<u32>(&ctx, "attempt"), Ok(Some(3)));
        assert_eq!(a.lookup_meta::<u32>(&ctx, "missing"), Ok(None));
        assert_eq!(b.lookup_meta::<String>(&ctx, "user"), Ok(None));
        assert_eq!(
            a.lookup_meta::<u32>(&ctx, "user"),
            Err(StoreError::meta_type_mismatch("user"))
        );
    }

    #[test]
    fn traces_follow_options() {
        let ctx = Context::background();
        let traced = EventLog::new();
        traced.append(&ctx, tick(1)).unwrap();
        assert!(traced.events()[0].trace().is_some_and(Trace::is_captured));

        let untraced =
            EventLog::with_options(EventLogOptions::default().with_capture_traces(false));
        untraced.append(&ctx, tick(1)).unwrap();
        assert!(untraced.events()[0].trace().is_none());
    }

    #[test]
    fn subscribers_see_root_appends_only() {
        let log = EventLog::new();
        let ctx = Context::background();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = log.subscribe(Arc::new(FnSubscriber(move |_ctx: &Context, e: &Event| {
            sink.lock().unwrap().push(e.clone());
            Ok(())
        })));

        let tx_ctx = log.begin_tx(&ctx).unwrap();
        log.append(&tx_ctx, tick(1)).unwrap();
        assert!(seen.lock().unwrap().is_empty());

        log.commit_tx(&tx_ctx).unwrap();
        assert_eq!(*seen.lock().unwrap(), log.events());
    }

    #[test]
    fn subscribers_can_read_through_the_context_of_a_committed_replay() {
        let log = EventLog::new();
        let ctx = Context::background();
        let reads = Arc::new(Mutex::new(Vec::new()));
        let sink = reads.clone();
        let reader = log.clone();
        let _sub = log.subscribe(Arc::new(FnSubscriber(move |ctx: &Context, _e: &Event| {
            sink.lock()
                .unwrap()
                .push(reader.events_in_context(ctx).map(|events| events.len()));
            Ok(())
        })));

        log.append(&ctx, tick(1)).unwrap();
        let outer = log.begin_tx(&ctx).unwrap();
        let inner = log.begin_tx(&outer).unwrap();
        log.append(&inner, tick(2)).unwrap();
        log.commit_tx(&inner).unwrap();
        log.commit_tx(&outer).unwrap();

        let reads = reads.lock().unwrap();
        assert_eq!(reads.len(), log.len());
        assert!(reads.iter().all(Result::is_ok));
    }

    #[test]
    fn concurrent_appends_reach_subscribers_in_log_order() {
        let log = EventLog::new();
        let (started_tx, started_rx) = mpsc::channel();
        let started_tx = Mutex::new(started_tx);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = log.subscribe(Arc::new(FnSubscriber(move |_ctx: &Context, e: &Event| {
            if *e == tick(1) {
                let _ = started_tx.lock().unwrap().send(());
                std::thread::sleep(Duration::from_millis(100));
            }
            sink.lock().unwrap().push(e.clone());
            Ok(())
        })));

        let first = {
            let log = log.clone();
            std::thread::spawn(move || log.append(&Context::background(), tick(1)))
        };
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        log.append(&Context::background(), tick(2)).unwrap();
        first.join().unwrap().unwrap();

        assert_eq!(ticks(&seen.lock().unwrap()), ticks(&log.events()));
        assert_eq!(ticks(&log.events()), vec![1, 2]);
    }

    #[test]
    fn failing_subscriber_does_not_fail_append() {
        let log = EventLog::new();
        let ctx = Context::background();
        let _sub = log.subscribe(Arc::new(FnSubscriber(|_ctx: &Context, _e: &Event| {
            Err(StoreError::subscriber("nope"))
        })));

        log.append(&ctx, tick(1)).unwrap();
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn asynchronous_subscribers_receive_in_append_order() {
        let log = EventLog::with_options(
            EventLogOptions::default().with_synchronous_subscribers(false),
        );
        let ctx = Context::background();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let sub = log.subscribe(Arc::new(FnSubscriber(move |_ctx: &Context, e: &Event| {
            let _ = tx.lock().unwrap().send(e.clone());
            Ok(())
        })));

        for n in 0..20 {
            log.append(&ctx, tick(n)).unwrap();
        }

        let received: Vec<Event> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(ticks(&received), (0..20).collect::<Vec<_>>());
        sub.close();
    }

    #[test]
    fn dump_renders_one_line_per_event() {
        let log = EventLog::new();
        let ctx = Context::background();
        log.append(
            &ctx,
            RepositoryEvent::create("notes", json!("a"), "a".into(), json!({"id": "a"})),
        )
        .unwrap();
        log.append(&ctx, tick(1)).unwrap();

        let dump = log.dump();
        assert_eq!(dump.lines().count(), 2);
        assert!(dump.starts_with("notes → Create"));
    }
}
