//! EventBus - publish/subscribe over [`SystemEvent`]s.
//!
//! # Delivery
//!
//! ```text
//!                ┌──► queue ──► dispatcher ──► handler A
//! publish(e) ────┼──► queue ──► dispatcher ──► handler B
//!                └──► EventTransport (optional, remote instances)
//! ```
//!
//! Each subscription owns an unbounded queue drained by its own dispatcher
//! task, so `publish` never waits on a handler and one slow or failing
//! handler cannot delay another. Within a subscription events are handled
//! one at a time in publish order.
//!
//! A handler that returns an error or panics is retried up to
//! `max_redeliveries` more times (at-least-once), then the event is dropped
//! for that subscriber only.
//!
//! # Runtime
//!
//! [`EventBus::subscribe`] spawns onto the current tokio runtime and must be
//! called from within one.

use async_trait::async_trait;
use bastion_event::{EventError, EventPattern, SystemEvent};
use bastion_types::{ErrorCode, SubscriptionId};
use futures::FutureExt;
use parking_lot::RwLock;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, warn};

/// Failure reported by an [`EventHandler`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("event handler failed: {0}")]
pub struct HandlerError(pub String);

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self(message.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self(message)
    }
}

impl ErrorCode for HandlerError {
    fn code(&self) -> &'static str {
        "EVENT_HANDLER_FAILED"
    }

    fn is_recoverable(&self) -> bool {
        true
    }
}

/// Failure reported by an [`EventTransport`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("event transport failed: {0}")]
pub struct TransportError(pub String);

impl ErrorCode for TransportError {
    fn code(&self) -> &'static str {
        "EVENT_TRANSPORT_FAILED"
    }

    fn is_recoverable(&self) -> bool {
        true
    }
}

/// Receives events for one subscription.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one event. An error triggers redelivery.
    async fn handle(&self, event: Arc<SystemEvent>) -> Result<(), HandlerError>;
}

/// Handler built from an async closure. See [`handler_fn`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Arc<SystemEvent>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: Arc<SystemEvent>) -> Result<(), HandlerError> {
        (self.0)(event).await
    }
}

/// Wraps an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Arc<SystemEvent>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler(f)
}

/// Cross-instance fan-out.
///
/// The bus forwards every locally published event to the transport; events
/// arriving from other instances enter through [`EventBus::ingest`].
#[async_trait]
pub trait EventTransport: Send + Sync {
    async fn publish(&self, event: &SystemEvent) -> Result<(), TransportError>;
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    id: SubscriptionId,
    pattern: EventPattern,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    #[must_use]
    pub fn pattern(&self) -> &EventPattern {
        &self.pattern
    }
}

/// Delivery counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventBusStats {
    /// Events passed to `publish` or `ingest`.
    pub published: u64,
    /// Successful handler deliveries.
    pub delivered: u64,
    /// Failed handler attempts, including ones later redelivered.
    pub failed_attempts: u64,
    /// Deliveries abandoned after all redeliveries failed.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    failed_attempts: AtomicU64,
    dropped: AtomicU64,
}

/// Tracks queued-but-unhandled deliveries so tests and shutdown can wait
/// for quiescence.
#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    drained: Notify,
}

impl InFlight {
    fn enter(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    fn exit(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
    }
}

struct Subscriber {
    id: SubscriptionId,
    pattern: EventPattern,
    queue: mpsc::UnboundedSender<Arc<SystemEvent>>,
}

/// Publish/subscribe bus.
///
/// # Example
///
/// ```
/// use bastion_event::SystemEvent;
/// use bastion_runtime::eventbus::{handler_fn, EventBus};
/// use bastion_types::CorrelationId;
/// use std::sync::atomic::{AtomicUsize, Ordering};
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let bus = EventBus::new(2);
/// let seen = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&seen);
/// bus.subscribe("operation_*", handler_fn(move |_event| {
///     let counter = Arc::clone(&counter);
///     async move {
///         counter.fetch_add(1, Ordering::SeqCst);
///         Ok(())
///     }
/// }))
/// .expect("valid pattern");
///
/// let event = SystemEvent::builder("operation_started", "demo", CorrelationId::new())
///     .build()
///     .expect("valid event");
/// assert_eq!(bus.publish(event).await, 1);
///
/// bus.idle().await;
/// assert_eq!(seen.load(Ordering::SeqCst), 1);
/// # }
/// ```
pub struct EventBus {
    subscribers: RwLock<Vec<Subscriber>>,
    max_redeliveries: u32,
    transport: Option<Arc<dyn EventTransport>>,
    in_flight: Arc<InFlight>,
    counters: Arc<Counters>,
}

impl EventBus {
    /// Creates a bus that redelivers a failed event up to
    /// `max_redeliveries` times per subscriber.
    #[must_use]
    pub fn new(max_redeliveries: u32) -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
            max_redeliveries,
            transport: None,
            in_flight: Arc::new(InFlight::default()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Forwards every locally published event to `transport`.
    #[must_use]
    pub fn with_transport(mut self, transport: Arc<dyn EventTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Registers `handler` for event types matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidPattern`] if `pattern` does not parse.
    pub fn subscribe<H>(&self, pattern: &str, handler: H) -> Result<Subscription, EventError>
    where
        H: EventHandler + 'static,
    {
        let pattern = EventPattern::parse(pattern)?;
        Ok(self.subscribe_pattern(pattern, Arc::new(handler)))
    }

    /// Registers a handler for an already compiled pattern.
    pub fn subscribe_pattern(
        &self,
        pattern: EventPattern,
        handler: Arc<dyn EventHandler>,
    ) -> Subscription {
        let id = SubscriptionId::new();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(dispatch(
            id,
            handler,
            rx,
            self.max_redeliveries,
            Arc::clone(&self.in_flight),
            Arc::clone(&self.counters),
        ));

        self.subscribers.write().push(Subscriber {
            id,
            pattern: pattern.clone(),
            queue: tx,
        });
        debug!(subscription = %id, pattern = %pattern, "Subscribed");
        Subscription { id, pattern }
    }

    /// Removes a subscription. Events already queued for it are still
    /// delivered. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        let mut subscribers = self.subscribers.write();
        let before = subscribers.len();
        subscribers.retain(|s| s.id != subscription.id);
        let removed = subscribers.len() != before;
        if removed {
            debug!(subscription = %subscription.id, "Unsubscribed");
        }
        removed
    }

    /// Publishes `event` locally and to the transport, if any.
    ///
    /// Returns the number of local subscriptions the event was queued for.
    /// A transport failure is logged and does not affect local delivery.
    pub async fn publish(&self, event: SystemEvent) -> usize {
        let event = Arc::new(event);
        let queued = self.deliver_local(&event);
        if let Some(transport) = &self.transport {
            if let Err(e) = transport.publish(&event).await {
                warn!(event_id = %event.id, event_type = %event.event_type, error = %e, "Event transport failed");
            }
        }
        queued
    }

    /// Delivers an event received from another instance to local
    /// subscribers only.
    pub fn ingest(&self, event: SystemEvent) -> usize {
        self.deliver_local(&Arc::new(event))
    }

    /// Waits until every queued delivery has been handled or dropped.
    pub async fn idle(&self) {
        loop {
            let drained = self.in_flight.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.in_flight.count.load(Ordering::Acquire) == 0 {
                return;
            }
            drained.await;
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    #[must_use]
    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            published: self.counters.published.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed_attempts: self.counters.failed_attempts.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }

    fn deliver_local(&self, event: &Arc<SystemEvent>) -> usize {
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        let subscribers = self.subscribers.read();
        let mut queued = 0;
        for sub in subscribers.iter().filter(|s| s.pattern.matches(&event.event_type)) {
            self.in_flight.enter();
            if sub.queue.send(Arc::clone(event)).is_ok() {
                queued += 1;
            } else {
                self.in_flight.exit();
                warn!(subscription = %sub.id, "Dispatcher gone, event not queued");
            }
        }
        debug!(event_id = %event.id, event_type = %event.event_type, queued, "Event published");
        queued
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("max_redeliveries", &self.max_redeliveries)
            .field("transport", &self.transport.is_some())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(2)
    }
}

async fn dispatch(
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
    mut queue: mpsc::UnboundedReceiver<Arc<SystemEvent>>,
    max_redeliveries: u32,
    in_flight: Arc<InFlight>,
    counters: Arc<Counters>,
) {
    while let Some(event) = queue.recv().await {
        if deliver(id, handler.as_ref(), &event, max_redeliveries, &counters).await {
            counters.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
        in_flight.exit();
    }
    debug!(subscription = %id, "Dispatcher stopped");
}

async fn deliver(
    id: SubscriptionId,
    handler: &dyn EventHandler,
    event: &Arc<SystemEvent>,
    max_redeliveries: u32,
    counters: &Counters,
) -> bool {
    for attempt in 0..=max_redeliveries {
        let outcome = AssertUnwindSafe(handler.handle(Arc::clone(event)))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => {
                warn!(subscription = %id, event_id = %event.id, attempt, error = %e, "Handler failed");
            }
            Err(_) => {
                warn!(subscription = %id, event_id = %event.id, attempt, "Handler panicked");
            }
        }
        counters.failed_attempts.fetch_add(1, Ordering::Relaxed);
    }
    error!(
        subscription = %id,
        event_id = %event.id,
        event_type = %event.event_type,
        attempts = max_redeliveries + 1,
        "Delivery abandoned"
    );
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use bastion_types::CorrelationId;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn event(kind: &str) -> SystemEvent {
        SystemEvent::builder(kind, "test", CorrelationId::new())
            .build()
            .expect("valid event")
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl EventHandler + 'static) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let handler = handler_fn(move |e: Arc<SystemEvent>| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().push(e.event_type.clone());
                Ok(())
            }
        });
        (log, handler)
    }

    #[tokio::test]
    async fn delivers_matching_events_in_order() {
        let bus = EventBus::new(0);
        let (ops, handler) = recorder();
        bus.subscribe("operation_*", handler).expect("subscribe");
        let (all, handler) = recorder();
        bus.subscribe("*", handler).expect("subscribe");

        for kind in ["operation_started", "lock_granted", "operation_failed"] {
            bus.publish(event(kind)).await;
        }
        bus.idle().await;

        assert_eq!(*ops.lock(), ["operation_started", "operation_failed"]);
        assert_eq!(*all.lock(), ["operation_started", "lock_granted", "operation_failed"]);
    }

    #[tokio::test]
    async fn publish_returns_match_count() {
        let bus = EventBus::default();
        let (_, handler) = recorder();
        bus.subscribe("a", handler).expect("subscribe");
        assert_eq!(bus.publish(event("a")).await, 1);
        assert_eq!(bus.publish(event("b")).await, 0);
    }

    #[tokio::test]
    async fn invalid_pattern_rejected() {
        let bus = EventBus::default();
        let (_, handler) = recorder();
        assert!(matches!(
            bus.subscribe("op[", handler),
            Err(EventError::InvalidPattern { .. })
        ));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn failing_handler_is_redelivered_then_dropped() {
        let bus = EventBus::new(2);
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        bus.subscribe(
            "*",
            handler_fn(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(HandlerError::from("boom"))
                }
            }),
        )
        .expect("subscribe");

        bus.publish(event("x")).await;
        bus.idle().await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let stats = bus.stats();
        assert_eq!(stats.failed_attempts, 3);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.delivered, 0);
    }

    #[tokio::test]
    async fn flaky_handler_succeeds_on_redelivery() {
        let bus = EventBus::new(2);
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        bus.subscribe(
            "*",
            handler_fn(move |_| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(HandlerError::from("first attempt fails"))
                    } else {
                        Ok(())
                    }
                }
            }),
        )
        .expect("subscribe");

        bus.publish(event("x")).await;
        bus.idle().await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(bus.stats().delivered, 1);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_affect_others() {
        let bus = EventBus::new(0);
        async fn explode(_: Arc<SystemEvent>) -> Result<(), HandlerError> {
            panic!("handler bug")
        }
        bus.subscribe("*", handler_fn(explode)).expect("subscribe");
        let (log, handler) = recorder();
        bus.subscribe("*", handler).expect("subscribe");

        bus.publish(event("one")).await;
        bus.publish(event("two")).await;
        bus.idle().await;

        assert_eq!(*log.lock(), ["one", "two"]);
        assert_eq!(bus.stats().dropped, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_does_not_block_publish_or_others() {
        let bus = EventBus::new(0);
        bus.subscribe(
            "*",
            handler_fn(|_| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        )
        .expect("subscribe");
        let (log, handler) = recorder();
        bus.subscribe("*", handler).expect("subscribe");

        bus.publish(event("fast")).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(*log.lock(), ["fast"]);

        bus.idle().await;
        assert_eq!(bus.stats().delivered, 2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_new_deliveries() {
        let bus = EventBus::default();
        let (log, handler) = recorder();
        let sub = bus.subscribe("*", handler).expect("subscribe");
        bus.publish(event("before")).await;
        assert!(bus.unsubscribe(&sub));
        assert!(!bus.unsubscribe(&sub));
        bus.publish(event("after")).await;
        bus.idle().await;
        assert_eq!(*log.lock(), ["before"]);
    }

    struct Recording {
        forwarded: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl EventTransport for Recording {
        async fn publish(&self, event: &SystemEvent) -> Result<(), TransportError> {
            self.forwarded.lock().push(event.event_type.clone());
            if self.fail {
                Err(TransportError("broker down".into()))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn transport_forwards_publish_but_not_ingest() {
        let transport = Arc::new(Recording {
            forwarded: Mutex::new(Vec::new()),
            fail: false,
        });
        let bus = EventBus::new(0).with_transport(Arc::clone(&transport) as Arc<dyn EventTransport>);
        let (log, handler) = recorder();
        bus.subscribe("*", handler).expect("subscribe");

        bus.publish(event("local")).await;
        assert_eq!(bus.ingest(event("remote")), 1);
        bus.idle().await;

        assert_eq!(*transport.forwarded.lock(), ["local"]);
        assert_eq!(*log.lock(), ["local", "remote"]);
    }

    #[tokio::test]
    async fn transport_failure_keeps_local_delivery() {
        let transport = Arc::new(Recording {
            forwarded: Mutex::new(Vec::new()),
            fail: true,
        });
        let bus = EventBus::new(0).with_transport(transport);
        let (log, handler) = recorder();
        bus.subscribe("*", handler).expect("subscribe");

        assert_eq!(bus.publish(event("local")).await, 1);
        bus.idle().await;
        assert_eq!(*log.lock(), ["local"]);
    }

    #[tokio::test]
    async fn idle_returns_immediately_without_work() {
        EventBus::default().idle().await;
    }
}
