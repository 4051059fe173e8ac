//! Event bus
//!
//! Each category has its own broadcast channel, and each subscription its own
//! delivery task, so callbacks for one category run in publication order and a
//! slow or failing subscriber never holds up the session or other
//! subscribers. Callbacks run on the blocking pool, so a callback that blocks
//! does not starve the runtime even on a current-thread scheduler. A callback that returns an error or panics is reported as a
//! [`Diagnostic::SubscriberFailed`] and stays subscribed.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::event::{Diagnostic, Event, EventCategory};

/// Subscriber callback
pub type Callback = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Identifies a subscription within its bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct BusInner {
    channels: [broadcast::Sender<Arc<Event>>; 5],
    subscribers: DashMap<SubscriptionId, EventCategory>,
    next_id: AtomicU64,
}

impl BusInner {
    fn channel(&self, category: EventCategory) -> &broadcast::Sender<Arc<Event>> {
        &self.channels[category.index()]
    }

    fn publish(&self, event: Event) {
        let category = event.category();
        trace!(%category, "Publishing event");
        // No receivers is fine
        let _ = self.channel(category).send(Arc::new(event));
    }
}

/// Fan-out of connector events to category subscribers
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus; `capacity` events of a category may be queued per
    /// subscriber before it starts missing events
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(BusInner {
                channels: std::array::from_fn(|_| broadcast::channel(capacity).0),
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Publish an event to all matching subscriptions
    pub fn publish(&self, event: impl Into<Event>) {
        self.inner.publish(event.into());
    }

    /// Register `callback` for every event of `category`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe<F>(&self, category: EventCategory, callback: F) -> Subscription
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let active = Arc::new(AtomicBool::new(true));
        let cancel = CancellationToken::new();

        self.inner.subscribers.insert(id, category);
        let delivery = Delivery {
            id,
            category,
            callback: Arc::new(callback),
            receiver: self.inner.channel(category).subscribe(),
            active: Arc::clone(&active),
            cancel: cancel.clone(),
            bus: Arc::downgrade(&self.inner),
        };
        tokio::spawn(delivery.run());
        debug!(subscription = %id, %category, "Subscribed");

        Subscription {
            id,
            category,
            active,
            cancel,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a subscription; same as [`Subscription::unsubscribe`]
    pub fn unsubscribe(&self, subscription: &Subscription) {
        subscription.unsubscribe();
    }

    /// Number of live subscriptions for `category`
    pub fn subscriber_count(&self, category: EventCategory) -> usize {
        self.inner
            .subscribers
            .iter()
            .filter(|entry| *entry.value() == category)
            .count()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.inner.subscribers.len())
            .finish()
    }
}

/// Handle to a registered callback
#[derive(Clone)]
pub struct Subscription {
    id: SubscriptionId,
    category: EventCategory,
    active: Arc<AtomicBool>,
    cancel: CancellationToken,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn category(&self) -> EventCategory {
        self.category
    }

    /// Whether the callback is still registered
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop delivery. No event is handed to the callback after this returns,
    /// except one whose invocation already started. Calling it again does
    /// nothing.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers.remove(&self.id);
        }
        debug!(subscription = %self.id, "Unsubscribed");
    }

    /// Tie the subscription to a scope: it is removed when the returned
    /// guard is dropped
    pub fn scoped(self) -> ScopedSubscription {
        ScopedSubscription(self)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Unsubscribes on drop
#[derive(Debug)]
pub struct ScopedSubscription(Subscription);

impl ScopedSubscription {
    pub fn subscription(&self) -> &Subscription {
        &self.0
    }
}

impl Drop for ScopedSubscription {
    fn drop(&mut self) {
        self.0.unsubscribe();
    }
}

/// Per-subscription delivery loop
struct Delivery {
    id: SubscriptionId,
    category: EventCategory,
    callback: Callback,
    receiver: broadcast::Receiver<Arc<Event>>,
    active: Arc<AtomicBool>,
    cancel: CancellationToken,
    bus: Weak<BusInner>,
}

impl Delivery {
    async fn run(mut self) {
        loop {
            let received = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                received = self.receiver.recv() => received,
            };

            match received {
                Ok(event) => {
                    if !self.active.load(Ordering::Acquire) {
                        break;
                    }
                    let failure = invoke(Arc::clone(&self.callback), event).await;
                    if let Some(error) = failure {
                        self.failed(error);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(subscription = %self.id, skipped, "Subscriber lagged, events skipped");
                    if self.category != EventCategory::Diagnostic {
                        self.report(Diagnostic::SubscriberLagged {
                            subscription: self.id,
                            skipped,
                        });
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(subscription = %self.id, "Event bus closed, stopping delivery");
                    break;
                }
            }
        }
    }

    fn failed(&self, error: String) {
        warn!(subscription = %self.id, category = %self.category, "Subscriber failed: {}", error);
        // Failures of diagnostic subscribers are only logged
        if self.category != EventCategory::Diagnostic {
            self.report(Diagnostic::SubscriberFailed {
                subscription: self.id,
                category: self.category,
                error,
            });
        }
    }

    fn report(&self, diagnostic: Diagnostic) {
        if let Some(bus) = self.bus.upgrade() {
            bus.publish(Event::Diagnostic(diagnostic));
        }
    }
}

/// Run one callback off the async workers. Returns the failure, if any.
async fn invoke(callback: Callback, event: Arc<Event>) -> Option<String> {
    let outcome =
        tokio::task::spawn_blocking(move || catch_unwind(AssertUnwindSafe(|| callback(&event))))
            .await;
    match outcome {
        Ok(Ok(Ok(()))) => None,
        Ok(Ok(Err(e))) => Some(format!("{:#}", e)),
        Ok(Err(panic)) => Some(format!("panicked: {}", panic_message(panic.as_ref()))),
        Err(e) => Some(format!("delivery interrupted: {}", e)),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stage_protocol::Message;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn control(n: u64) -> Event {
        Event::Message(Message::control("chat", json!({ "n": n })))
    }

    fn collect(
        bus: &EventBus,
        category: EventCategory,
    ) -> (Subscription, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = bus.subscribe(category, move |event| {
            tx.send(event.clone())?;
            Ok(())
        });
        (subscription, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Event>) {
        let result = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(result.is_err(), "unexpected event: {:?}", result);
    }

    #[tokio::test]
    async fn test_delivery_in_order() {
        let bus = EventBus::new(256);
        let (_sub, mut rx) = collect(&bus, EventCategory::Control);

        for n in 0..100 {
            bus.publish(control(n));
        }
        for n in 0..100 {
            assert_eq!(next(&mut rx).await, control(n));
        }
    }

    #[tokio::test]
    async fn test_category_filtering() {
        let bus = EventBus::new(16);
        let (_control, mut control_rx) = collect(&bus, EventCategory::Control);
        let (_diag, mut diag_rx) = collect(&bus, EventCategory::Diagnostic);

        let gap = Event::Diagnostic(Diagnostic::SequenceGap {
            expected: 1,
            received: 4,
        });
        bus.publish(gap.clone());
        bus.publish(control(1));

        assert_eq!(next(&mut control_rx).await, control(1));
        assert_eq!(next(&mut diag_rx).await, gap);
        assert_quiet(&mut control_rx).await;
        assert_quiet(&mut diag_rx).await;
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let bus = EventBus::new(16);
        let (sub, mut rx) = collect(&bus, EventCategory::Control);
        assert_eq!(bus.subscriber_count(EventCategory::Control), 1);

        bus.unsubscribe(&sub);
        sub.unsubscribe();
        assert!(!sub.is_active());
        assert_eq!(bus.subscriber_count(EventCategory::Control), 0);

        bus.publish(control(1));
        assert!(timeout(Duration::from_millis(100), rx.recv())
            .await
            .map_or(true, |event| event.is_none()));
    }

    #[tokio::test]
    async fn test_scoped_subscription() {
        let bus = EventBus::new(16);
        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let _scoped = bus
                .subscribe(EventCategory::Control, move |event| {
                    tx.send(event.clone())?;
                    Ok(())
                })
                .scoped();
            bus.publish(control(1));
            assert_eq!(next(&mut rx).await, control(1));
        }
        assert_eq!(bus.subscriber_count(EventCategory::Control), 0);

        bus.publish(control(2));
        assert!(timeout(Duration::from_millis(100), rx.recv())
            .await
            .map_or(true, |event| event.is_none()));
    }

    #[tokio::test]
    async fn test_failing_subscribers_are_isolated() {
        let bus = EventBus::new(64);
        let (_diag, mut diag_rx) = collect(&bus, EventCategory::Diagnostic);

        let panicking = bus.subscribe(EventCategory::Control, |_| panic!("subscriber bug"));
        let erroring =
            bus.subscribe(EventCategory::Control, |_| Err(anyhow::anyhow!("handler refused")));
        let (_healthy, mut rx) = collect(&bus, EventCategory::Control);

        for n in 0..3 {
            bus.publish(control(n));
        }
        for n in 0..3 {
            assert_eq!(next(&mut rx).await, control(n));
        }

        let mut panics = 0;
        let mut errors = 0;
        for _ in 0..6 {
            match next(&mut diag_rx).await {
                Event::Diagnostic(Diagnostic::SubscriberFailed {
                    subscription,
                    category,
                    error,
                }) => {
                    assert_eq!(category, EventCategory::Control);
                    if subscription == panicking.id() {
                        assert!(error.contains("subscriber bug"), "{error}");
                        panics += 1;
                    } else {
                        assert_eq!(subscription, erroring.id());
                        assert_eq!(error, "handler refused");
                        errors += 1;
                    }
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!((panics, errors), (3, 3));
        assert!(panicking.is_active());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_reports() {
        let bus = EventBus::new(2);
        let (_diag, mut diag_rx) = collect(&bus, EventCategory::Diagnostic);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _slow = bus.subscribe(EventCategory::Control, move |event| {
            sink.lock().unwrap().push(event.clone());
            Ok(())
        });

        // Publishing more than the capacity before the delivery task runs
        // makes it skip the oldest events.
        for n in 0..10 {
            bus.publish(control(n));
        }

        match next(&mut diag_rx).await {
            Event::Diagnostic(Diagnostic::SubscriberLagged { skipped, .. }) => {
                assert_eq!(skipped, 8)
            }
            other => panic!("unexpected event: {other:?}"),
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec![control(8), control(9)]);
    }
}
