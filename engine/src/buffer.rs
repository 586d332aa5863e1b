//! Fixed-capacity FIFO between frame ingestion and inference.
//!
//! Pushing into a full buffer evicts the oldest entry, so under sustained
//! overload the most recent scene always gets a slot.

use std::collections::VecDeque;
use std::time::Duration;

use image::DynamicImage;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A keyframe waiting for inference.
#[derive(Debug, Clone)]
pub struct BufferedKeyframe {
    pub seq: u64,
    pub timestamp: f64,
    pub frame: DynamicImage,
}

pub type KeyframeBuffer = BoundedBuffer<BufferedKeyframe>;

pub struct BoundedBuffer<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    available: Notify,
}

impl<T> BoundedBuffer<T> {
    /// # Panics
    /// If `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "buffer capacity must be non-zero");
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            available: Notify::new(),
        }
    }

    /// Append `item`, returning the entry evicted to make room, if any.
    /// Never blocks on a consumer.
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut items = self.items.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(item);
            evicted
        };
        self.available.notify_one();
        evicted
    }

    pub fn pop_front(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Pop the oldest entry, waiting up to `timeout` for one to arrive.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = self.pop_front() {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return self.pop_front();
            }
        }
    }

    pub fn depth(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }
}
