//! Bounded handoff queue between the link reader and the ingest task.
//!
//! The radio side must never block on a slow consumer, so a full queue drops
//! its oldest entry to make room. Both ends share one `VecDeque` under a short
//! std mutex; a `Notify` wakes the consumer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

struct Inner<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    available: Notify,
    emptied: Notify,
}

pub struct HandoffQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for HandoffQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> HandoffQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                items: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                available: Notify::new(),
                emptied: Notify::new(),
            }),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.inner.items.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue `item`; returns the entry evicted to make room, if any.
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut items = self.items();
            let evicted = if items.len() >= self.inner.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            evicted
        };
        self.inner.available.notify_one();
        evicted
    }

    pub fn try_pop(&self) -> Option<T> {
        let (item, now_empty) = {
            let mut items = self.items();
            let item = items.pop_front();
            (item, items.is_empty())
        };
        if now_empty {
            self.inner.emptied.notify_waiters();
        }
        item
    }

    /// Wait for the next item. Cancel safe.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.inner.available.notified().await;
        }
    }

    /// Resolve once the queue has been emptied by the consumer.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.inner.emptied.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}
