//! In-memory event bus.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak, mpsc};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::warn;

use memkit_core::Context;

use crate::bus::{EventBus, Subscriber};
use crate::event::Event;

/// How published events reach subscribers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum Delivery {
    /// `publish` returns after every subscriber ran (back-pressure on the publisher).
    #[default]
    Synchronous,
    /// Each subscriber drains its own queue on a worker thread, in publish order.
    Asynchronous,
}

type Queued = (Context, Event);

enum Sink {
    Direct(Arc<dyn Subscriber>),
    Queued(mpsc::Sender<Queued>),
}

struct Entry {
    id: u64,
    sink: Sink,
}

struct Registry {
    delivery: Delivery,
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry>>,
}

impl Registry {
    fn entries(&self) -> MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Events waiting for fan-out, plus the thread currently fanning out.
#[derive(Default)]
struct Dispatch {
    pending: VecDeque<Queued>,
    drainer: Option<ThreadId>,
}

/// In-memory pub/sub bus.
///
/// - No IO
/// - Synchronous fan-out by default, per-subscriber worker threads on request
/// - Subscribers whose queue is gone are dropped while publishing
/// - Every subscriber sees events in enqueue order, even with concurrent publishers
///
/// Fan-out happens on one thread at a time. A publisher that finds another
/// thread fanning out waits until its event went out. A subscriber that
/// publishes again has that event delivered after it returns; it must not
/// block on another publishing thread.
pub struct InMemoryEventBus {
    registry: Arc<Registry>,
    dispatch: Mutex<Dispatch>,
    idle: Condvar,
}

impl InMemoryEventBus {
    pub fn new(delivery: Delivery) -> Self {
        Self {
            registry: Arc::new(Registry {
                delivery,
                next_id: AtomicU64::new(1),
                entries: Mutex::new(Vec::new()),
            }),
            dispatch: Mutex::new(Dispatch::default()),
            idle: Condvar::new(),
        }
    }

    pub fn synchronous() -> Self {
        Self::new(Delivery::Synchronous)
    }

    pub fn asynchronous() -> Self {
        Self::new(Delivery::Asynchronous)
    }

    pub fn delivery(&self) -> Delivery {
        self.registry.delivery
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.entries().len()
    }

    fn dispatch(&self) -> MutexGuard<'_, Dispatch> {
        self.dispatch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue `event` without delivering it.
    ///
    /// Events reach subscribers in enqueue order, so callers that record
    /// events elsewhere enqueue while still holding their own lock and
    /// [`flush`](Self::flush) after releasing it.
    pub fn enqueue(&self, ctx: &Context, event: Event) {
        self.dispatch().pending.push_back((ctx.clone(), event));
    }

    /// Deliver every queued event.
    ///
    /// Returns once the events queued before the call went out, or at once
    /// when called from a subscriber of this bus.
    pub fn flush(&self) {
        let me = thread::current().id();
        let mut dispatch = self.dispatch();
        loop {
            match dispatch.drainer {
                Some(owner) if owner == me => return,
                Some(_) => {
                    dispatch = self
                        .idle
                        .wait(dispatch)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                None => break,
            }
        }
        if dispatch.pending.is_empty() {
            return;
        }

        dispatch.drainer = Some(me);
        let _release = DrainerRelease(self);
        loop {
            let Some((ctx, event)) = dispatch.pending.pop_front() else {
                break;
            };
            drop(dispatch);
            self.fan_out(&ctx, &event);
            dispatch = self.dispatch();
        }
        drop(dispatch);
    }

    fn fan_out(&self, ctx: &Context, event: &Event) {
        let direct: Vec<Arc<dyn Subscriber>> = {
            let mut entries = self.registry.entries();
            let mut direct = Vec::new();
            entries.retain(|entry| match &entry.sink {
                Sink::Direct(subscriber) => {
                    direct.push(subscriber.clone());
                    true
                }
                Sink::Queued(tx) => tx.send((ctx.clone(), event.clone())).is_ok(),
            });
            direct
        };

        // Run synchronous subscribers without the registry lock so they may
        // subscribe, close, or publish again.
        for subscriber in direct {
            deliver(subscriber.as_ref(), ctx, event);
        }
    }

    fn register(&self, id: u64, sink: Sink, worker: Option<JoinHandle<()>>) -> Subscription {
        self.registry.entries().push(Entry { id, sink });
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
            worker,
        }
    }
}

/// Hands fan-out back to waiting publishers, also when a subscriber panics.
struct DrainerRelease<'a>(&'a InMemoryEventBus);

impl Drop for DrainerRelease<'_> {
    fn drop(&mut self) {
        self.0.dispatch().drainer = None;
        self.0.idle.notify_all();
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::synchronous()
    }
}

impl core::fmt::Debug for InMemoryEventBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("delivery", &self.registry.delivery)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(&self, ctx: &Context, event: &Event) {
        self.enqueue(ctx, event.clone());
        self.flush();
    }

    fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> Subscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);

        let (sink, worker) = match self.registry.delivery {
            Delivery::Synchronous => (Sink::Direct(subscriber), None),
            Delivery::Asynchronous => {
                let spawned = spawn_worker(id, subscriber.clone());
                queued_or_direct(subscriber, spawned)
            }
        };

        self.register(id, sink, worker)
    }
}

fn spawn_worker(
    id: u64,
    subscriber: Arc<dyn Subscriber>,
) -> io::Result<(mpsc::Sender<Queued>, JoinHandle<()>)> {
    let (tx, rx) = mpsc::channel::<Queued>();
    let join = thread::Builder::new()
        .name(format!("memkit-subscriber-{id}"))
        .spawn(move || {
            for (ctx, event) in rx {
                deliver(subscriber.as_ref(), &ctx, &event);
            }
        })?;
    Ok((tx, join))
}

/// Fall back to synchronous delivery when no worker thread could be started.
fn queued_or_direct(
    subscriber: Arc<dyn Subscriber>,
    spawned: io::Result<(mpsc::Sender<Queued>, JoinHandle<()>)>,
) -> (Sink, Option<JoinHandle<()>>) {
    match spawned {
        Ok((tx, join)) => (Sink::Queued(tx), Some(join)),
        Err(err) => {
            warn!(error = %err, "cannot spawn subscriber thread, delivering synchronously");
            (Sink::Direct(subscriber), None)
        }
    }
}

fn deliver(subscriber: &dyn Subscriber, ctx: &Context, event: &Event) {
    if let Err(err) = subscriber.handle(ctx, event) {
        if let Err(err) = subscriber.handle_error(ctx, err) {
            warn!(error = %err, event = %event, "subscriber failed to handle error");
        }
    }
}

/// Handle to an open subscription.
///
/// Dropping the handle keeps the subscription alive; call [`Subscription::close`]
/// to stop delivery.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<Registry>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_open(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|r| r.entries().iter().any(|e| e.id == self.id))
    }

    /// Stop delivery. Asynchronous subscriptions finish their queued events first.
    pub fn close(mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.entries().retain(|e| e.id != self.id);
        }
        if let Some(join) = self.worker.take() {
            if join.thread().id() != thread::current().id() {
                let _ = join.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use memkit_core::{StoreError, StoreResult};
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Event>>,
        errors: Mutex<Vec<StoreError>>,
        fail: bool,
    }

    impl Subscriber for Recorder {
        fn handle(&self, _ctx: &Context, event: &Event) -> StoreResult<()> {
            self.seen.lock().unwrap().push(event.clone());
            if self.fail {
                return Err(StoreError::subscriber("boom"));
            }
            Ok(())
        }

        fn handle_error(&self, _ctx: &Context, err: StoreError) -> StoreResult<()> {
            self.errors.lock().unwrap().push(err);
            Ok(())
        }
    }

    struct Forward(Mutex<mpsc::Sender<Event>>);

    impl Subscriber for Forward {
        fn handle(&self, _ctx: &Context, event: &Event) -> StoreResult<()> {
            let _ = self.0.lock().unwrap().send(event.clone());
            Ok(())
        }
    }

    fn numbered(n: u64) -> Event {
        Event::opaque("tick", json!(n))
    }

    #[test]
    fn synchronous_delivery_happens_before_publish_returns() {
        let bus = InMemoryEventBus::synchronous();
        let recorder = Arc::new(Recorder::default());
        let _sub = bus.subscribe(recorder.clone());

        let ctx = Context::background();
        bus.publish(&ctx, &numbered(1));
        bus.publish(&ctx, &numbered(2));

        assert_eq!(*recorder.seen.lock().unwrap(), vec![numbered(1), numbered(2)]);
    }

    #[test]
    fn handler_errors_go_to_the_subscriber_hook() {
        let bus = InMemoryEventBus::synchronous();
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let _sub = bus.subscribe(recorder.clone());

        bus.publish(&Context::background(), &numbered(1));

        assert_eq!(*recorder.errors.lock().unwrap(), vec![StoreError::subscriber("boom")]);
    }

    #[test]
    fn closed_subscription_stops_receiving() {
        let bus = InMemoryEventBus::synchronous();
        let recorder = Arc::new(Recorder::default());
        let sub = bus.subscribe(recorder.clone());
        assert!(sub.is_open());

        let ctx = Context::background();
        bus.publish(&ctx, &numbered(1));
        sub.close();
        bus.publish(&ctx, &numbered(2));

        assert_eq!(recorder.seen.lock().unwrap().len(), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn asynchronous_delivery_preserves_publish_order() {
        let bus = InMemoryEventBus::asynchronous();
        let (tx, rx) = mpsc::channel();
        let sub = bus.subscribe(Arc::new(Forward(Mutex::new(tx))));

        let ctx = Context::background();
        for n in 0..50 {
            bus.publish(&ctx, &numbered(n));
        }

        for n in 0..50 {
            let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            assert_eq!(got, numbered(n));
        }
        sub.close();
    }

    #[test]
    fn close_drains_queued_events() {
        let bus = InMemoryEventBus::asynchronous();
        let recorder = Arc::new(Recorder::default());
        let sub = bus.subscribe(recorder.clone());

        let ctx = Context::background();
        for n in 0..10 {
            bus.publish(&ctx, &numbered(n));
        }
        sub.close();

        assert_eq!(recorder.seen.lock().unwrap().len(), 10);
    }

    #[test]
    fn republished_events_follow_the_current_one() {
        let bus = Arc::new(InMemoryEventBus::synchronous());
        let recorder = Arc::new(Recorder::default());
        let _first = bus.subscribe(recorder.clone());
        let inner = bus.clone();
        let _echo = bus.subscribe(Arc::new(crate::FnSubscriber(
            move |ctx: &Context, event: &Event| {
                if *event == numbered(1) {
                    inner.publish(ctx, &numbered(2));
                }
                Ok(())
            },
        )));
        let _last = bus.subscribe(recorder.clone());

        bus.publish(&Context::background(), &numbered(1));

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![numbered(1), numbered(1), numbered(2), numbered(2)]
        );
    }

    #[test]
    fn concurrent_publishers_are_delivered_in_enqueue_order() {
        let bus = Arc::new(InMemoryEventBus::synchronous());
        let (started_tx, started_rx) = mpsc::channel();
        let started_tx = Mutex::new(started_tx);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = bus.subscribe(Arc::new(crate::FnSubscriber(
            move |_ctx: &Context, event: &Event| {
                if *event == numbered(1) {
                    let _ = started_tx.lock().unwrap().send(());
                    thread::sleep(Duration::from_millis(100));
                }
                sink.lock().unwrap().push(event.clone());
                Ok(())
            },
        )));

        let ctx = Context::background();
        let publisher = {
            let bus = bus.clone();
            let ctx = ctx.clone();
            thread::spawn(move || bus.publish(&ctx, &numbered(1)))
        };
        started_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        bus.publish(&ctx, &numbered(2));

        // The second publisher waited for the first fan-out to finish.
        assert_eq!(*seen.lock().unwrap(), vec![numbered(1), numbered(2)]);
        publisher.join().unwrap();
    }

    #[test]
    fn failed_worker_spawn_falls_back_to_direct_delivery() {
        let bus = InMemoryEventBus::asynchronous();
        let recorder = Arc::new(Recorder::default());
        let (sink, worker) = queued_or_direct(
            recorder.clone(),
            Err(io::Error::other("thread limit reached")),
        );
        assert!(worker.is_none());
        let sub = bus.register(1, sink, worker);

        bus.publish(&Context::background(), &numbered(7));

        assert_eq!(*recorder.seen.lock().unwrap(), vec![numbered(7)]);
        sub.close();
    }
}
