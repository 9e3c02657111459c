//! Change notifier for attribute subscribers.
//!
//! When a cached or derived value changes, the notifier fans the change out
//! to every interested subscriber. Publishing never blocks: each subscriber
//! owns a bounded queue, and a full queue drops its oldest event and counts
//! it as missed.

mod subscription;

pub use subscription::Subscription;

use crate::attributes::AttrValue;
use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Notify;

/// One value transition of one attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub attribute: String,
    /// `None` when the attribute had no value before.
    pub old: Option<AttrValue>,
    pub new: AttrValue,
    pub timestamp: DateTime<Utc>,
    /// Notifier-wide sequence number, strictly increasing in publish order.
    pub sequence: u64,
}

/// Which events a subscription receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Attribute(String),
}

impl Scope {
    fn matches(&self, attribute: &str) -> bool {
        match self {
            Scope::All => true,
            Scope::Attribute(name) => name == attribute,
        }
    }
}

impl From<&str> for Scope {
    fn from(name: &str) -> Self {
        Scope::Attribute(name.to_string())
    }
}

pub(crate) struct QueueState {
    pub(crate) events: VecDeque<ChangeEvent>,
    pub(crate) missed: u64,
    pub(crate) closed: bool,
}

/// Per-subscriber bounded queue shared between the notifier and the subscription.
pub(crate) struct SubscriberQueue {
    pub(crate) id: u64,
    scope: Scope,
    capacity: usize,
    pub(crate) state: Mutex<QueueState>,
    pub(crate) wake: Notify,
}

impl SubscriberQueue {
    fn push(&self, event: &ChangeEvent) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            if state.events.len() >= self.capacity {
                state.events.pop_front();
                state.missed += 1;
            }
            state.events.push_back(event.clone());
        }
        self.wake.notify_one();
    }

    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.wake.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Fans change events out to subscribers.
pub struct ChangeNotifier {
    subscribers: Mutex<Vec<Arc<SubscriberQueue>>>,
    capacity: usize,
    next_sequence: AtomicU64,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl ChangeNotifier {
    /// Create a notifier whose subscribers each buffer up to `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            next_sequence: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a new subscriber.
    ///
    /// Subscribing after [`close`](Self::close) yields an already-closed
    /// subscription.
    pub fn subscribe(&self, scope: impl Into<Scope>) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            scope: scope.into(),
            capacity: self.capacity,
            state: Mutex::new(QueueState {
                events: VecDeque::with_capacity(self.capacity.min(64)),
                missed: 0,
                closed: false,
            }),
            wake: Notify::new(),
        });

        if self.closed.load(Ordering::SeqCst) {
            queue.close();
        } else {
            let mut subscribers = self.subscribers.lock();
            subscribers.push(queue.clone());
            debug!(
                "[Notify] Subscriber {} registered for {:?}",
                queue.id, queue.scope
            );
        }

        Subscription::new(queue)
    }

    /// Publish a value transition. Callers only publish real changes; the
    /// notifier does not compare values itself.
    ///
    /// Returns the published event, or `None` once the notifier is closed.
    pub fn publish(
        &self,
        attribute: &str,
        old: Option<AttrValue>,
        new: AttrValue,
    ) -> Option<ChangeEvent> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }

        let mut subscribers = self.subscribers.lock();
        let event = ChangeEvent {
            attribute: attribute.to_string(),
            old,
            new,
            timestamp: Utc::now(),
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
        };

        subscribers.retain(|queue| !queue.is_closed());
        for queue in subscribers.iter() {
            if queue.scope.matches(attribute) {
                queue.push(&event);
            }
        }

        Some(event)
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|queue| !queue.is_closed());
        subscribers.len()
    }

    /// Close every subscription and refuse further events.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let subscribers = std::mem::take(&mut *self.subscribers.lock());
        for queue in &subscribers {
            queue.close();
        }
        debug!("[Notify] Closed {} subscription(s)", subscribers.len());
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
