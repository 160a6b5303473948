//! Event bus distributing `WorkflowEvent`s to listeners.
//!
//! Each listener picks a delivery mode:
//! - `Sync`: called inline by the emitter. A panicking listener is caught and
//!   logged; it never disturbs the workflow.
//! - `Async` with `Coalesce::None`: every event is queued and delivered in
//!   order by a background task.
//! - `Async` with `Coalesce::Latest`: only the most recent non-terminal event
//!   is kept while the listener is busy. Terminal events are always delivered,
//!   after any pending non-terminal event.
//!
//! A `tokio::sync::broadcast` receiver is also available for consumers that
//! prefer pulling events.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use durastep_types::event::WorkflowEvent;
use tokio::sync::{Notify, broadcast, mpsc};

/// Listener callback.
pub type Listener = Arc<dyn Fn(&WorkflowEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    #[default]
    Sync,
    Async,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Coalesce {
    #[default]
    None,
    /// Keep only the latest pending non-terminal event.
    Latest,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub mode: DeliveryMode,
    pub coalesce: Coalesce,
}

impl SubscribeOptions {
    pub fn sync() -> Self {
        Self::default()
    }

    pub fn queued() -> Self {
        Self {
            mode: DeliveryMode::Async,
            coalesce: Coalesce::None,
        }
    }

    pub fn latest() -> Self {
        Self {
            mode: DeliveryMode::Async,
            coalesce: Coalesce::Latest,
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery internals
// ---------------------------------------------------------------------------

#[derive(Default)]
struct LatestState {
    latest: Option<WorkflowEvent>,
    terminal: VecDeque<WorkflowEvent>,
    closed: bool,
}

#[derive(Default)]
struct LatestSlot {
    state: Mutex<LatestState>,
    notify: Notify,
}

impl LatestSlot {
    fn push(&self, event: WorkflowEvent) {
        if let Ok(mut state) = self.state.lock() {
            if event.is_terminal() {
                state.terminal.push_back(event);
            } else {
                state.latest = Some(event);
            }
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.closed = true;
        }
        self.notify.notify_one();
    }

    /// Pending events in delivery order, and whether the slot is closed.
    fn take(&self) -> (Vec<WorkflowEvent>, bool) {
        let Ok(mut state) = self.state.lock() else {
            return (Vec::new(), true);
        };
        let mut batch = Vec::with_capacity(1 + state.terminal.len());
        if let Some(latest) = state.latest.take() {
            batch.push(latest);
        }
        batch.extend(state.terminal.drain(..));
        (batch, state.closed)
    }
}

enum Delivery {
    Sync(Listener),
    Queue(mpsc::UnboundedSender<WorkflowEvent>),
    Latest(Arc<LatestSlot>),
}

struct Subscriber {
    id: u64,
    delivery: Delivery,
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Delivery::Latest(slot) = &self.delivery {
            slot.close();
        }
    }
}

struct BusInner {
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
    broadcast: broadcast::Sender<WorkflowEvent>,
}

fn deliver(listener: &Listener, event: &WorkflowEvent) {
    if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
        tracing::warn!(event = event.name(), "event listener panicked; continuing");
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Multi-listener event bus. Cloning shares the listener set.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// `capacity` bounds the broadcast channel used by [`EventBus::receiver`].
    pub fn new(capacity: usize) -> Self {
        let (broadcast, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                broadcast,
            }),
        }
    }

    /// Register a listener. It stays registered until the returned
    /// [`Subscription`] is dropped or unsubscribed.
    ///
    /// Async delivery spawns a task on the current Tokio runtime; outside a
    /// runtime the listener falls back to sync delivery.
    pub fn subscribe<F>(&self, listener: F, options: SubscribeOptions) -> Subscription
    where
        F: Fn(&WorkflowEvent) + Send + Sync + 'static,
    {
        let listener: Listener = Arc::new(listener);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let delivery = match (options.mode, tokio::runtime::Handle::try_current()) {
            (DeliveryMode::Sync, _) => Delivery::Sync(listener),
            (DeliveryMode::Async, Err(_)) => {
                tracing::warn!(
                    "no tokio runtime for async event delivery; delivering synchronously"
                );
                Delivery::Sync(listener)
            }
            (DeliveryMode::Async, Ok(handle)) => match options.coalesce {
                Coalesce::None => {
                    let (tx, mut rx) = mpsc::unbounded_channel::<WorkflowEvent>();
                    handle.spawn(async move {
                        while let Some(event) = rx.recv().await {
                            deliver(&listener, &event);
                        }
                    });
                    Delivery::Queue(tx)
                }
                Coalesce::Latest => {
                    let slot = Arc::new(LatestSlot::default());
                    let task_slot = slot.clone();
                    handle.spawn(async move {
                        loop {
                            let (batch, closed) = task_slot.take();
                            if batch.is_empty() {
                                if closed {
                                    break;
                                }
                                task_slot.notify.notified().await;
                                continue;
                            }
                            for event in &batch {
                                deliver(&listener, event);
                            }
                            tokio::task::yield_now().await;
                        }
                    });
                    Delivery::Latest(slot)
                }
            },
        };

        if let Ok(mut subs) = self.inner.subscribers.write() {
            subs.push(Arc::new(Subscriber { id, delivery }));
        }
        Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Pull-style receiver of all future events.
    pub fn receiver(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.inner.broadcast.subscribe()
    }

    /// Deliver an event to every listener. Never fails.
    ///
    /// Listeners run outside the subscriber lock, so they may subscribe or
    /// drop subscriptions while handling an event.
    pub fn emit(&self, event: WorkflowEvent) {
        let subs: Vec<Arc<Subscriber>> = match self.inner.subscribers.read() {
            Ok(subs) => subs.clone(),
            Err(_) => Vec::new(),
        };
        for sub in &subs {
            match &sub.delivery {
                Delivery::Sync(listener) => deliver(listener, &event),
                Delivery::Queue(tx) => {
                    let _ = tx.send(event.clone());
                }
                Delivery::Latest(slot) => slot.push(event.clone()),
            }
        }
        let _ = self.inner.broadcast.send(event);
    }

    pub fn listener_count(&self) -> usize {
        self.inner.subscribers.read().map(|s| s.len()).unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listener_count", &self.listener_count())
            .field("receiver_count", &self.inner.broadcast.receiver_count())
            .finish()
    }
}

/// Registration handle returned by [`EventBus::subscribe`].
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    bus: Weak<BusInner>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.bus.upgrade() else {
            return;
        };
        if let Ok(mut subs) = inner.subscribers.write() {
            subs.retain(|s| s.id != self.id);
        }
    }
}

impl std::fmt::Debug for BusInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusInner").finish_non_exhaustive()
    }
}
