//! Single-slot, latest-wins mailbox.
//!
//! Each session owns one mailbox per ingestion kind (frames, CSI). The
//! reader task takes whatever is in the slot; a `put` that lands while the
//! slot is still full replaces the old value and counts it as superseded.
//! Memory per session is therefore bounded to one pending item per kind.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Latest-wins slot with an async single consumer.
#[derive(Debug)]
pub struct Mailbox<T> {
    slot: Mutex<Option<T>>,
    notify: Notify,
    closed: AtomicBool,
    superseded: AtomicU64,
}

impl<T> Mailbox<T> {
    /// Create an empty, open mailbox.
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            superseded: AtomicU64::new(0),
        }
    }

    /// Store `value`, returning the unprocessed value it replaced, if any.
    ///
    /// Values put after [`Mailbox::close`] are dropped.
    pub fn put(&self, value: T) -> Option<T> {
        if self.is_closed() {
            return None;
        }
        let previous = self.slot.lock().replace(value);
        if previous.is_some() {
            self.superseded.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        previous
    }

    /// Take the pending value without waiting.
    pub fn try_take(&self) -> Option<T> {
        self.slot.lock().take()
    }

    /// Wait for a value. Returns `None` once the mailbox is closed and empty.
    pub async fn take(&self) -> Option<T> {
        loop {
            if let Some(value) = self.try_take() {
                return Some(value);
            }
            if self.is_closed() {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// Stop accepting values and wake the consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    /// Whether [`Mailbox::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of values replaced before they were taken.
    pub fn superseded(&self) -> u64 {
        self.superseded.load(Ordering::Relaxed)
    }
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}
