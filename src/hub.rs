//! Mailbox event fan-out
//!
//! One logical topic per mailbox plus a wildcard for monitors.
//! Publication never blocks: each subscriber owns a bounded queue, and
//! when the queue is full the oldest pending event is dropped in favor
//! of the new one. A subscriber that needs lossless observation must
//! drain faster than the ingress produces.
//!
//! The hub knows nothing about the manager; it only carries
//! notifications. The registry is held under a single lock, but
//! delivery happens after the matching subscribers have been copied
//! out, so a slow subscriber cannot stall an unrelated publish.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Notify;

use crate::metrics;

/// What happened to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationKind {
    New,
    Removed,
    Purged,
}

/// A single mailbox event. `id` is absent for purges.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Notification {
    pub mailbox: String,
    pub kind: NotificationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl Notification {
    #[must_use]
    pub fn new(mailbox: impl Into<String>, kind: NotificationKind, id: Option<String>) -> Self {
        Self {
            mailbox: mailbox.into(),
            kind,
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Topic {
    Mailbox(String),
    All,
}

impl Topic {
    fn matches(&self, mailbox: &str) -> bool {
        match self {
            Self::Mailbox(name) => name == mailbox,
            Self::All => true,
        }
    }
}

#[derive(Debug)]
struct SubscriberState {
    queue: Mutex<VecDeque<Notification>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SubscriberState {
    fn push(&self, n: Notification, buffer: usize) {
        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= buffer {
                queue.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counters().hub_dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(n);
        }
        self.notify.notify_one();
    }
}

#[derive(Debug)]
struct Subscriber {
    topic: Topic,
    state: Arc<SubscriberState>,
}

/// The fan-out point for mailbox events.
#[derive(Debug)]
pub struct Hub {
    buffer: usize,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl Hub {
    /// A hub whose subscribers buffer at most `buffer` pending events.
    #[must_use]
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer: buffer.max(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Subscribe to a single mailbox.
    #[must_use]
    pub fn subscribe(&self, mailbox: &str) -> Subscription {
        self.register(Topic::Mailbox(mailbox.to_string()))
    }

    /// Subscribe to every mailbox.
    #[must_use]
    pub fn subscribe_all(&self) -> Subscription {
        self.register(Topic::All)
    }

    fn register(&self, topic: Topic) -> Subscription {
        let state = Arc::new(SubscriberState {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        self.subscribers.lock().unwrap().push(Subscriber {
            topic,
            state: Arc::clone(&state),
        });
        Subscription { state }
    }

    /// Deliver a notification to every matching subscriber.
    ///
    /// Never blocks; a full subscriber queue loses its oldest event.
    pub fn publish(&self, n: &Notification) {
        let targets: Vec<Arc<SubscriberState>> = {
            let mut subscribers = self.subscribers.lock().unwrap();
            subscribers.retain(|s| !s.state.closed.load(Ordering::Acquire));
            subscribers
                .iter()
                .filter(|s| s.topic.matches(&n.mailbox))
                .map(|s| Arc::clone(&s.state))
                .collect()
        };
        for state in targets {
            state.push(n.clone(), self.buffer);
        }
    }

    /// Close every subscriber; pending events remain readable.
    pub fn close_all(&self) {
        let subscribers = std::mem::take(&mut *self.subscribers.lock().unwrap());
        for s in &subscribers {
            s.state.closed.store(true, Ordering::Release);
            s.state.notify.notify_one();
        }
    }
}

/// The read end of a hub subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    state: Arc<SubscriberState>,
}

impl Subscription {
    /// Wait for the next notification.
    ///
    /// Returns `None` once the hub has closed this subscriber and the
    /// queue has drained.
    pub async fn recv(&self) -> Option<Notification> {
        loop {
            // Arm the waiter before checking the queue so a push that
            // lands in between is not missed.
            let notified = self.state.notify.notified();
            if let Some(n) = self.state.queue.lock().unwrap().pop_front() {
                return Some(n);
            }
            if self.state.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Pop a pending notification without waiting.
    pub fn try_recv(&self) -> Option<Notification> {
        self.state.queue.lock().unwrap().pop_front()
    }

    /// Events lost to the slow-subscriber policy.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.state.closed.store(true, Ordering::Release);
    }
}
