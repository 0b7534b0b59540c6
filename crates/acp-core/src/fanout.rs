use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct WatcherSlot<T> {
    sender: mpsc::Sender<T>,
    evicted: Arc<AtomicBool>,
}

struct FanoutInner<T> {
    topic: String,
    capacity: usize,
    next_id: AtomicU64,
    closed: AtomicBool,
    watchers: Mutex<HashMap<u64, WatcherSlot<T>>>,
}

impl<T> FanoutInner<T> {
    fn watchers(&self) -> MutexGuard<'_, HashMap<u64, WatcherSlot<T>>> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-process multiplexer for one topic. Each watcher owns a bounded queue;
/// a watcher whose queue is full is evicted instead of back-pressuring the
/// publisher.
pub struct Fanout<T> {
    inner: Arc<FanoutInner<T>>,
}

impl<T> Clone for Fanout<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Fanout<T> {
    pub fn new(topic: impl Into<String>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(FanoutInner {
                topic: topic.into(),
                capacity: capacity.max(1),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                watchers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Registers a watcher. Subscribing to a closed topic yields a
    /// subscription that ends immediately.
    pub fn subscribe(&self) -> Subscription<T> {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (sender, receiver) = mpsc::channel(self.inner.capacity);
        let evicted = Arc::new(AtomicBool::new(false));
        let mut watchers = self.inner.watchers();
        if !self.inner.closed.load(Ordering::SeqCst) {
            watchers.insert(
                id,
                WatcherSlot {
                    sender,
                    evicted: evicted.clone(),
                },
            );
        }
        debug!(event = "fanout_subscribe", topic = %self.inner.topic, watcher = id, watchers = watchers.len());
        Subscription {
            id,
            receiver,
            evicted,
            owner: Arc::downgrade(&self.inner),
        }
    }

    /// Delivers `item` to every watcher without blocking. Returns how many
    /// watchers received it.
    pub fn publish(&self, item: &T) -> usize {
        let mut watchers = self.inner.watchers();
        let mut dropped = Vec::new();
        for (id, slot) in watchers.iter() {
            match slot.sender.try_send(item.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(*id),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(event = "fanout_slow_watcher", topic = %self.inner.topic, watcher = *id);
                    slot.evicted.store(true, Ordering::SeqCst);
                    dropped.push(*id);
                }
            }
        }
        for id in dropped {
            watchers.remove(&id);
        }
        watchers.len()
    }

    /// Ends every active subscription and refuses new ones.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let drained = {
            let mut watchers = self.inner.watchers();
            watchers.drain().count()
        };
        debug!(event = "fanout_closed", topic = %self.inner.topic, watchers = drained);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.watchers().len()
    }
}

pub struct Subscription<T> {
    id: u64,
    receiver: mpsc::Receiver<T>,
    evicted: Arc<AtomicBool>,
    owner: Weak<FanoutInner<T>>,
}

impl<T> Subscription<T> {
    /// Next item, or `None` once the topic closed or this watcher was evicted.
    /// Cancel-safe.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    pub fn was_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.watchers().remove(&self.id);
        }
    }
}
