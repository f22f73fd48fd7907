// Delivery Queue - Bounded FIFO between the network and the application
//
// Overflow drops the oldest item instead of applying backpressure, so a slow
// consumer loses history rather than stalling relays.

use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Default queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Bounded, overwrite-on-overflow FIFO with an async blocking pop
///
/// Each push wakes at most one waiting consumer. The queue is meant to be
/// drained by a single consumer; several concurrent poppers all make
/// progress, but no ordering between them is promised.
pub struct DeliveryQueue<T> {
    capacity: usize,
    items: Mutex<VecDeque<T>>,
    available: Notify,
}

impl<T> DeliveryQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Notify::new(),
        }
    }

    /// Get the capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Append an item, returning the oldest one if it had to be dropped
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut items = self.items.lock();
            items.push_back(item);
            if items.len() > self.capacity {
                items.pop_front()
            } else {
                None
            }
        };
        self.available.notify_one();
        evicted
    }

    /// Remove the oldest item without waiting
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Wait for an item and remove the oldest one
    pub async fn pop(&self) -> T {
        loop {
            // Register interest before looking so a push in between is not lost
            let notified = self.available.notified();
            if let Some(item) = self.try_pop() {
                return item;
            }
            notified.await;
        }
    }

    /// Like [`pop`](Self::pop), but gives up once `cancel` fires
    ///
    /// Items queued before cancellation are still returned; `None` means the
    /// token fired and the queue is empty.
    pub async fn pop_or_cancel(&self, cancel: &CancellationToken) -> Option<T> {
        loop {
            let notified = self.available.notified();
            if let Some(item) = self.try_pop() {
                return Some(item);
            }
            tokio::select! {
                biased;
                _ = notified => {}
                _ = cancel.cancelled() => return self.try_pop(),
            }
        }
    }

    /// Visit every item, oldest first
    pub fn for_each(&self, mut f: impl FnMut(&T)) {
        for item in self.items.lock().iter() {
            f(item);
        }
    }

    /// Drop every item matching `predicate`; returns how many were removed
    pub fn remove_if(&self, mut predicate: impl FnMut(&T) -> bool) -> usize {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|item| !predicate(item));
        before - items.len()
    }

    /// Remove every item, handing each to `f` oldest first
    pub fn drain_each(&self, mut f: impl FnMut(T)) {
        for item in self.items.lock().drain(..) {
            f(item);
        }
    }
}

impl<T> Default for DeliveryQueue<T> {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}
