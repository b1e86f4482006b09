use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::join_all;
use futures::FutureExt;
use tracing::error;
use uuid::Uuid;

use crate::types::{Event, EventType};

type StoredHandler = Arc<dyn Fn(Event) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Subscriber {
    id: u64,
    handler: StoredHandler,
}

#[derive(Default)]
struct SubscriberMap {
    next_id: u64,
    global: Vec<Subscriber>,
    by_type: HashMap<EventType, Vec<Subscriber>>,
}

struct History {
    enabled: bool,
    max_size: usize,
    events: VecDeque<Event>,
}

impl Default for History {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size: 1000,
            events: VecDeque::new(),
        }
    }
}

struct BusInner {
    subscribers: Mutex<SubscriberMap>,
    history: Mutex<History>,
}

/// Filters for querying the bus's bounded event history.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub event_type: Option<EventType>,
    pub correlation_id: Option<Uuid>,
    pub limit: Option<usize>,
}

/// Disposer returned by `subscribe`/`subscribe_all`. Unsubscribing twice is
/// a no-op; dropping the handle leaves the subscription in place.
pub struct Subscription {
    bus: Weak<BusInner>,
    event_type: Option<EventType>,
    id: u64,
    disposed: AtomicBool,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(inner) = self.bus.upgrade() else {
            return;
        };
        let mut subs = inner.subscribers.lock().unwrap();
        match self.event_type {
            Some(ty) => {
                if let Some(list) = subs.by_type.get_mut(&ty) {
                    list.retain(|s| s.id != self.id);
                }
            }
            None => subs.global.retain(|s| s.id != self.id),
        }
    }
}

/// In-process async event bus.
///
/// Delivery per publish: all global subscribers, then all type-specific
/// subscribers, concurrently relative to each other; the publisher awaits
/// the fan-out join point. Handler panics are caught and logged so one
/// failing handler never starves its siblings. Events published by a
/// single producer reach each individual handler in publish order; nothing
/// is guaranteed across handlers or producers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(SubscriberMap::default()),
                history: Mutex::new(History::default()),
            }),
        }
    }

    /// Subscribe a handler to one event type.
    pub fn subscribe<F, Fut>(&self, event_type: EventType, handler: F) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stored: StoredHandler = Arc::new(move |event| Box::pin(handler(event)));
        let mut subs = self.inner.subscribers.lock().unwrap();
        let id = subs.next_id;
        subs.next_id += 1;
        subs.by_type
            .entry(event_type)
            .or_default()
            .push(Subscriber { id, handler: stored });
        Subscription {
            bus: Arc::downgrade(&self.inner),
            event_type: Some(event_type),
            id,
            disposed: AtomicBool::new(false),
        }
    }

    /// Subscribe a handler to every event. Useful for logging and metrics.
    pub fn subscribe_all<F, Fut>(&self, handler: F) -> Subscription
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let stored: StoredHandler = Arc::new(move |event| Box::pin(handler(event)));
        let mut subs = self.inner.subscribers.lock().unwrap();
        let id = subs.next_id;
        subs.next_id += 1;
        subs.global.push(Subscriber { id, handler: stored });
        Subscription {
            bus: Arc::downgrade(&self.inner),
            event_type: None,
            id,
            disposed: AtomicBool::new(false),
        }
    }

    /// Publish an event to all matching subscribers. Never fails; handler
    /// panics are contained per handler.
    pub async fn publish(&self, event: Event) {
        {
            let mut history = self.inner.history.lock().unwrap();
            if history.enabled {
                if history.events.len() >= history.max_size {
                    history.events.pop_front();
                }
                history.events.push_back(event.clone());
            }
        }

        // Snapshot handlers so subscribers can change mid-dispatch.
        let handlers: Vec<StoredHandler> = {
            let subs = self.inner.subscribers.lock().unwrap();
            subs.global
                .iter()
                .map(|s| s.handler.clone())
                .chain(
                    subs.by_type
                        .get(&event.event_type)
                        .into_iter()
                        .flat_map(|list| list.iter().map(|s| s.handler.clone())),
                )
                .collect()
        };

        if handlers.is_empty() {
            return;
        }

        let event_type = event.event_type;
        let dispatches = handlers.into_iter().map(|handler| {
            let event = event.clone();
            async move {
                if AssertUnwindSafe(handler(event)).catch_unwind().await.is_err() {
                    error!(?event_type, "Event handler panicked");
                }
            }
        });
        join_all(dispatches).await;
    }

    /// Start retaining published events in a bounded ring, oldest evicted.
    pub fn enable_history(&self, max_size: usize) {
        let mut history = self.inner.history.lock().unwrap();
        history.enabled = true;
        history.max_size = max_size;
        while history.events.len() > max_size {
            history.events.pop_front();
        }
    }

    pub fn disable_history(&self) {
        let mut history = self.inner.history.lock().unwrap();
        history.enabled = false;
        history.events.clear();
    }

    /// Query retained events, oldest first.
    pub fn history(&self, filter: HistoryFilter) -> Vec<Event> {
        let history = self.inner.history.lock().unwrap();
        let matching: Vec<Event> = history
            .events
            .iter()
            .filter(|e| filter.event_type.is_none_or(|ty| e.event_type == ty))
            .filter(|e| {
                filter
                    .correlation_id
                    .is_none_or(|id| e.correlation_id == Some(id))
            })
            .cloned()
            .collect();
        match filter.limit {
            Some(limit) if matching.len() > limit => matching[matching.len() - limit..].to_vec(),
            _ => matching,
        }
    }

    /// Drop all subscriptions and retained history.
    pub fn clear(&self) {
        let mut subs = self.inner.subscribers.lock().unwrap();
        subs.global.clear();
        subs.by_type.clear();
        drop(subs);
        self.inner.history.lock().unwrap().events.clear();
    }
}
