//! Message bus decoupling inputs, the engine, and outputs
//!
//! Every subscriber owns a bounded queue. Publishing appends to each matching
//! queue and returns without waiting on any consumer. When a queue is full
//! its oldest entry is dropped and a backpressure notice goes out on the
//! observability channel.

use std::collections::{HashMap, VecDeque};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use tokio::sync::{Notify, broadcast};
use uuid::Uuid;

use crate::tools::ToolCallResult;
use crate::{Error, Result};

/// Origin used for envelopes produced by the bus itself
pub const BUS_ORIGIN: &str = "bus";

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Control messages exchanged between modules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    Ping,
    Pong,
}

/// Lifecycle notices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Start,
    /// Request orderly shutdown of the whole system
    Stop,
    Error,
    /// A subscriber queue overflowed and lost its oldest envelope
    BackpressureDrop,
}

/// What an envelope carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "detail")]
pub enum EnvelopeKind {
    InboundText,
    OutboundText,
    Control(ControlKind),
    Lifecycle(LifecycleKind),
}

/// Envelope payload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Empty,
    Text(String),
    Response {
        text: String,
        results: Vec<ToolCallResult>,
    },
}

impl Payload {
    /// Human-readable text, if any
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Empty => None,
            Self::Text(text) | Self::Response { text, .. } => Some(text),
        }
    }
}

/// Unit of bus traffic
///
/// Envelopes are immutable once published; the bus hands them out as
/// `Arc<Envelope>`.
#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    pub id: Uuid,
    /// Producing module instance, or `"engine"`
    pub origin: String,
    pub kind: EnvelopeKind,
    pub payload: Payload,
    pub timestamp: DateTime<Utc>,
    /// Process-wide monotonic counter, strictly increasing in creation order
    pub sequence: u64,
    /// For responses, the id of the inbound envelope being answered
    pub correlation_id: Option<Uuid>,
    /// For responses, the input module the answer is addressed to
    pub target: Option<String>,
}

impl Envelope {
    /// Create a new envelope with a fresh id and sequence number
    pub fn new(origin: impl Into<String>, kind: EnvelopeKind, payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4(),
            origin: origin.into(),
            kind,
            payload,
            timestamp: Utc::now(),
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            correlation_id: None,
            target: None,
        }
    }

    /// Inbound text from an input module
    pub fn inbound(origin: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(origin, EnvelopeKind::InboundText, Payload::Text(text.into()))
    }

    /// Outbound response answering `inbound`
    pub fn response(
        origin: impl Into<String>,
        inbound: &Self,
        text: impl Into<String>,
        results: Vec<ToolCallResult>,
    ) -> Self {
        let mut envelope = Self::new(
            origin,
            EnvelopeKind::OutboundText,
            Payload::Response {
                text: text.into(),
                results,
            },
        );
        envelope.correlation_id = Some(inbound.id);
        envelope.target = Some(inbound.origin.clone());
        envelope
    }

    /// Lifecycle notice with an optional detail message
    pub fn lifecycle(origin: impl Into<String>, kind: LifecycleKind, detail: Option<String>) -> Self {
        let payload = detail.map_or(Payload::Empty, Payload::Text);
        Self::new(origin, EnvelopeKind::Lifecycle(kind), payload)
    }

    /// Control message
    pub fn control(origin: impl Into<String>, kind: ControlKind) -> Self {
        Self::new(origin, EnvelopeKind::Control(kind), Payload::Empty)
    }

    /// Whether this is a lifecycle envelope of the given kind
    #[must_use]
    pub fn is_lifecycle(&self, kind: LifecycleKind) -> bool {
        self.kind == EnvelopeKind::Lifecycle(kind)
    }
}

/// Subscriber filter
pub type Predicate = Box<dyn Fn(&Envelope) -> bool + Send + Sync>;

#[derive(Default)]
struct QueueState {
    items: VecDeque<Arc<Envelope>>,
    closed: bool,
    degraded: bool,
    dropped: u64,
}

struct SubscriberQueue {
    name: String,
    predicate: Predicate,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl SubscriberQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_one();
    }
}

struct BusInner {
    capacity: usize,
    subscribers: RwLock<HashMap<String, Arc<SubscriberQueue>>>,
    observer: broadcast::Sender<Arc<Envelope>>,
    published: AtomicU64,
}

impl BusInner {
    fn snapshot(&self) -> Vec<Arc<SubscriberQueue>> {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn remove(&self, name: &str, queue: &Arc<SubscriberQueue>) {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // Only remove if the entry is still ours
        if subscribers
            .get(name)
            .is_some_and(|current| Arc::ptr_eq(current, queue))
        {
            subscribers.remove(name);
        }
    }

    fn emit(&self, kind: LifecycleKind, detail: String) {
        let envelope = Envelope::lifecycle(BUS_ORIGIN, kind, Some(detail));
        // No observers is fine
        let _ = self.observer.send(Arc::new(envelope));
    }
}

/// Per-subscriber statistics
#[derive(Debug, Clone, Serialize)]
pub struct SubscriberStats {
    pub name: String,
    pub depth: usize,
    pub dropped: u64,
    pub degraded: bool,
}

/// Bus-wide statistics
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub published: u64,
    pub subscribers: Vec<SubscriberStats>,
}

/// Single-writer/multi-reader message bus
///
/// ```
/// use switchboard::bus::{Envelope, MessageBus};
///
/// # tokio_test::block_on(async {
/// let bus = MessageBus::new(16)?;
/// let mut from_terminal = bus.subscribe("printer", |e: &Envelope| e.origin == "terminal")?;
///
/// bus.publish(Envelope::inbound("web", "ignored"));
/// bus.publish(Envelope::inbound("terminal", "hello"));
///
/// let envelope = from_terminal.recv().await.unwrap();
/// assert_eq!(envelope.payload.text(), Some("hello"));
/// # Ok::<(), switchboard::Error>(())
/// # }).unwrap();
/// ```
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("capacity", &self.inner.capacity)
            .finish_non_exhaustive()
    }
}

impl MessageBus {
    /// Create a bus whose subscriber queues hold `capacity` envelopes each
    ///
    /// # Errors
    ///
    /// Returns `ConfigValidation` if `capacity` is zero
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::ConfigValidation(
                "bus capacity must be greater than zero".to_string(),
            ));
        }

        let (observer, _) = broadcast::channel(256);
        Ok(Self {
            inner: Arc::new(BusInner {
                capacity,
                subscribers: RwLock::new(HashMap::new()),
                observer,
                published: AtomicU64::new(0),
            }),
        })
    }

    /// Per-subscriber queue capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Publish an envelope to every matching subscriber
    ///
    /// Never blocks on consumers. Returns the shared envelope that was
    /// delivered.
    pub fn publish(&self, envelope: Envelope) -> Arc<Envelope> {
        let envelope = Arc::new(envelope);
        self.inner.published.fetch_add(1, Ordering::Relaxed);

        for queue in self.inner.snapshot() {
            if queue.lock().degraded {
                continue;
            }

            let matched = catch_unwind(AssertUnwindSafe(|| (queue.predicate)(&envelope)));
            let matched = match matched {
                Ok(matched) => matched,
                Err(_) => {
                    tracing::error!(
                        subscriber = %queue.name,
                        "subscriber filter panicked, detaching subscriber"
                    );
                    {
                        let mut state = queue.lock();
                        state.degraded = true;
                        state.closed = true;
                    }
                    queue.notify.notify_one();
                    self.inner.emit(
                        LifecycleKind::Error,
                        format!("subscriber {} degraded after panic", queue.name),
                    );
                    continue;
                }
            };

            if !matched {
                continue;
            }

            let overflowed = {
                let mut state = queue.lock();
                if state.closed {
                    continue;
                }
                let overflowed = if state.items.len() >= self.inner.capacity {
                    state.items.pop_front();
                    state.dropped += 1;
                    true
                } else {
                    false
                };
                state.items.push_back(Arc::clone(&envelope));
                overflowed
            };
            queue.notify.notify_one();

            if overflowed {
                tracing::warn!(
                    subscriber = %queue.name,
                    capacity = self.inner.capacity,
                    "subscriber queue full, dropped oldest envelope"
                );
                self.inner.emit(
                    LifecycleKind::BackpressureDrop,
                    format!("subscriber {} dropped oldest envelope", queue.name),
                );
            }
        }

        envelope
    }

    /// Subscribe under `name` to envelopes matching `predicate`
    ///
    /// Only envelopes published after this call are delivered.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateName` if `name` already has a live subscription
    pub fn subscribe<F>(&self, name: impl Into<String>, predicate: F) -> Result<Subscription>
    where
        F: Fn(&Envelope) -> bool + Send + Sync + 'static,
    {
        let name = name.into();
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        if subscribers.contains_key(&name) {
            return Err(Error::DuplicateName(format!("subscription {name}")));
        }

        let queue = Arc::new(SubscriberQueue {
            name: name.clone(),
            predicate: Box::new(predicate),
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        });
        subscribers.insert(name.clone(), Arc::clone(&queue));
        tracing::debug!(subscriber = %name, "subscribed");

        Ok(Subscription {
            queue,
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Receive bus diagnostics (backpressure drops, degraded subscribers)
    #[must_use]
    pub fn observe(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.inner.observer.subscribe()
    }

    /// Snapshot of bus statistics
    #[must_use]
    pub fn stats(&self) -> BusStats {
        let mut subscribers: Vec<SubscriberStats> = self
            .inner
            .snapshot()
            .iter()
            .map(|queue| {
                let state = queue.lock();
                SubscriberStats {
                    name: queue.name.clone(),
                    depth: state.items.len(),
                    dropped: state.dropped,
                    degraded: state.degraded,
                }
            })
            .collect();
        subscribers.sort_by(|a, b| a.name.cmp(&b.name));

        BusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            subscribers,
        }
    }

    /// Close every subscription; streams end once drained
    pub fn close(&self) {
        for queue in self.inner.snapshot() {
            queue.close();
        }
    }
}

/// A live subscription; dropping it unsubscribes
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
    bus: Weak<BusInner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.queue.name)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// Subscriber name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.queue.name
    }

    /// Wait for the next envelope
    ///
    /// Returns `None` once the subscription is closed and drained.
    pub async fn recv(&mut self) -> Option<Arc<Envelope>> {
        loop {
            {
                let mut state = self.queue.lock();
                if let Some(envelope) = state.items.pop_front() {
                    return Some(envelope);
                }
                if state.closed {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    /// Take the next envelope if one is queued
    pub fn try_recv(&mut self) -> Option<Arc<Envelope>> {
        self.queue.lock().items.pop_front()
    }

    /// Whether the bus detached this subscriber after a panic
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.queue.lock().degraded
    }

    /// Convert into a lazy stream of envelopes
    pub fn into_stream(self) -> impl Stream<Item = Arc<Envelope>> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|envelope| (envelope, subscription))
        })
    }

    /// Detach from the bus
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(bus) = self.bus.upgrade() {
            bus.remove(&self.queue.name, &self.queue);
            tracing::debug!(subscriber = %self.queue.name, "unsubscribed");
        }
    }
}
