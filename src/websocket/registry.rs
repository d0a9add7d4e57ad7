//! Subscription registry and per-topic inboxes
//!
//! The registry is the source of truth for desired topics: the session
//! replays its contents after every (re)connect. Each topic owns one
//! bounded FIFO inbox. On overflow the oldest message is evicted, since
//! live market data favors recency over completeness; every eviction is
//! logged.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex, Notify, RwLock};
use tracing::warn;

use crate::error::{Error, Result};
use crate::websocket::frame::Message;
use crate::websocket::topic::Topic;

/// Shared handle to a topic inbox
pub type InboxHandle = Arc<TopicInbox>;

/// Bounded FIFO mailbox for one topic
///
/// Multiple consumers may call [`recv`](TopicInbox::recv) concurrently;
/// they compete for messages and each message is delivered exactly once.
#[derive(Debug)]
pub struct TopicInbox {
    topic: String,
    capacity: usize,
    queue: Mutex<VecDeque<Message>>,
    notify: Notify,
    closed: AtomicBool,
}

impl TopicInbox {
    fn new(topic: String, capacity: usize) -> Self {
        Self {
            topic,
            capacity,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// The topic identifier this inbox belongs to
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Maximum number of undelivered messages held
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of undelivered messages currently queued
    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Whether the inbox holds no undelivered messages
    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    /// Whether the inbox has been closed by `unsubscribe` or session close
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Enqueue a message, evicting the oldest one when full.
    ///
    /// Messages pushed after close are discarded.
    pub(crate) async fn push(&self, message: Message) {
        if self.is_closed() {
            return;
        }
        {
            let mut queue = self.queue.lock().await;
            if queue.len() >= self.capacity {
                queue.pop_front();
                warn!(
                    topic = %self.topic,
                    capacity = self.capacity,
                    "inbox full, dropping oldest message"
                );
            }
            queue.push_back(message);
        }
        self.notify.notify_one();
    }

    /// Wait for the next message, up to `timeout`.
    ///
    /// Returns [`Error::ReceiveTimeout`] on expiry with no side effects on
    /// the queue, and [`Error::SessionClosed`] once the inbox is closed.
    pub async fn recv(&self, timeout: Duration) -> Result<Message> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut queue = self.queue.lock().await;
                if let Some(message) = queue.pop_front() {
                    // A consumer that takes a message off the queue path may
                    // also have absorbed the stored permit; pass the wakeup
                    // on while messages remain
                    if !queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Ok(message);
                }
            }
            if self.is_closed() {
                return Err(Error::SessionClosed);
            }
            // notify_one stores a permit when no task is waiting, so a push
            // between the pop attempt and this await cannot be missed
            match tokio::time::timeout_at(deadline, self.notify.notified()).await {
                Ok(()) => continue,
                Err(_) => return Err(Error::ReceiveTimeout),
            }
        }
    }

    /// Close the inbox and wake every pending receiver
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Drop all undelivered messages
    pub(crate) async fn clear(&self) {
        self.queue.lock().await.clear();
    }
}

struct Registered {
    topic: Topic,
    inbox: InboxHandle,
}

/// Tracks the set of desired topics and their inboxes
///
/// Mutated by the session (subscribe/unsubscribe) and read by the
/// dispatcher (lookup); cloning shares state.
pub struct SubscriptionRegistry {
    topics: Arc<RwLock<HashMap<String, Registered>>>,
    inbox_capacity: usize,
    // Bumped on every membership change so waiters on not-yet-subscribed
    // topics can re-check instead of sleeping blind
    membership: Arc<watch::Sender<u64>>,
}

impl std::fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("inbox_capacity", &self.inbox_capacity)
            .finish_non_exhaustive()
    }
}

impl SubscriptionRegistry {
    /// Create a registry whose inboxes hold up to `inbox_capacity` messages
    pub fn new(inbox_capacity: usize) -> Self {
        let (membership, _) = watch::channel(0);
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            inbox_capacity,
            membership: Arc::new(membership),
        }
    }

    fn bump_membership(&self) {
        self.membership.send_modify(|v| *v += 1);
    }

    /// Watch for membership changes; the value increments on every
    /// subscribe, unsubscribe and close
    pub(crate) fn membership_receiver(&self) -> watch::Receiver<u64> {
        self.membership.subscribe()
    }

    /// Add a topic, returning its inbox handle and whether it was new.
    ///
    /// Idempotent: subscribing an existing topic returns the existing
    /// inbox unchanged.
    pub async fn subscribe(&self, topic: Topic) -> (InboxHandle, bool) {
        let name = topic.name();
        let mut topics = self.topics.write().await;
        if let Some(existing) = topics.get(&name) {
            return (Arc::clone(&existing.inbox), false);
        }
        let inbox = Arc::new(TopicInbox::new(name.clone(), self.inbox_capacity));
        topics.insert(
            name,
            Registered {
                topic,
                inbox: Arc::clone(&inbox),
            },
        );
        drop(topics);
        self.bump_membership();
        (inbox, true)
    }

    /// Remove a topic; its inbox is closed and drained.
    ///
    /// Returns whether the topic was present.
    pub async fn unsubscribe(&self, name: &str) -> bool {
        let removed = self.topics.write().await.remove(name);
        match removed {
            Some(entry) => {
                entry.inbox.close();
                entry.inbox.clear().await;
                self.bump_membership();
                true
            }
            None => false,
        }
    }

    /// Look up the inbox for a topic identifier
    pub async fn inbox(&self, name: &str) -> Option<InboxHandle> {
        self.topics
            .read()
            .await
            .get(name)
            .map(|entry| Arc::clone(&entry.inbox))
    }

    /// Whether a topic is registered
    pub async fn contains(&self, name: &str) -> bool {
        self.topics.read().await.contains_key(name)
    }

    /// Snapshot of all desired topics, for replay after (re)connect
    pub async fn topics(&self) -> Vec<Topic> {
        self.topics
            .read()
            .await
            .values()
            .map(|entry| entry.topic.clone())
            .collect()
    }

    /// Number of registered topics
    pub async fn len(&self) -> usize {
        self.topics.read().await.len()
    }

    /// Whether no topics are registered
    pub async fn is_empty(&self) -> bool {
        self.topics.read().await.is_empty()
    }

    /// Close every inbox and drop all topics; used on session close
    pub async fn close_all(&self) {
        let mut topics = self.topics.write().await;
        for entry in topics.values() {
            entry.inbox.close();
        }
        topics.clear();
        drop(topics);
        self.bump_membership();
    }
}

impl Clone for SubscriptionRegistry {
    fn clone(&self) -> Self {
        Self {
            topics: Arc::clone(&self.topics),
            inbox_capacity: self.inbox_capacity,
            membership: Arc::clone(&self.membership),
        }
    }
}
