// ABOUTME: Bounded per-engine FIFO queues that reject instead of growing
//
// Each engine has one queue feeding its workers. Admission is checked under
// the queue lock, so the depth never exceeds capacity; a full queue fails the
// submission immediately with QueueFull. Workers block on pop() until an entry
// arrives or the queue is closed for shutdown.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tokio::sync::Notify;

/// Errors returned when backpressure blocks a submission
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackpressureError {
    /// Queue is at capacity, cannot accept more entries
    #[error("Queue for '{engine}' full: capacity {capacity}, current {current}")]
    QueueFull {
        /// Engine whose queue is full
        engine: String,
        /// Maximum queue capacity
        capacity: usize,
        /// Current queue size
        current: usize,
    },

    /// Queue no longer accepts entries (shutdown)
    #[error("Queue for '{engine}' is closed")]
    Closed {
        /// Engine whose queue is closed
        engine: String,
    },
}

struct QueueInner<T> {
    entries: VecDeque<T>,
    closed: bool,
}

/// Bounded FIFO feeding one engine's workers
pub struct EngineQueue<T> {
    engine: String,
    capacity: usize,
    inner: Mutex<QueueInner<T>>,
    notify: Notify,
}

impl<T> std::fmt::Debug for EngineQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineQueue")
            .field("engine", &self.engine)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl<T> EngineQueue<T> {
    /// Create an empty queue holding at most `capacity` entries
    pub fn new(engine: impl Into<String>, capacity: usize) -> Self {
        Self {
            engine: engine.into(),
            capacity,
            inner: Mutex::new(QueueInner {
                entries: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Engine this queue feeds
    #[must_use]
    pub fn engine(&self) -> &str {
        &self.engine
    }

    /// Maximum number of waiting entries
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of waiting entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_inner().entries.len()
    }

    /// Whether no entries are waiting
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock the queue for a multi-step admission decision
    ///
    /// Entries pushed through the guard wake one worker each when the guard
    /// is dropped.
    pub fn admission(&self) -> Admission<'_, T> {
        Admission {
            queue: self,
            inner: self.lock_inner(),
            pushed: 0,
        }
    }

    /// Push one entry, failing fast when full
    pub fn try_push(&self, entry: T) -> Result<(), BackpressureError> {
        let mut admission = self.admission();
        admission.check()?;
        admission.push(entry);
        Ok(())
    }

    /// Wait for the oldest entry; `None` once closed and drained
    pub async fn pop(&self) -> Option<T> {
        loop {
            // Registered before the check so a push in between is not missed
            let notified = self.notify.notified();
            {
                let mut inner = self.lock_inner();
                if let Some(entry) = inner.entries.pop_front() {
                    return Some(entry);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Remove every waiting entry matching `predicate`, oldest first
    pub fn remove_where(&self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut inner = self.lock_inner();
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(inner.entries.len());
        for entry in inner.entries.drain(..) {
            if predicate(&entry) {
                removed.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        inner.entries = kept;
        removed
    }

    /// Take every waiting entry
    pub fn drain(&self) -> Vec<T> {
        self.lock_inner().entries.drain(..).collect()
    }

    /// Stop accepting entries and wake every waiting worker
    pub fn close(&self) {
        self.lock_inner().closed = true;
        self.notify.notify_waiters();
    }

    /// Whether the queue was closed
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock_inner().closed
    }

    fn lock_inner(&self) -> MutexGuard<'_, QueueInner<T>> {
        self.inner.lock().expect("Mutex poisoned")
    }
}

/// Locked view of a queue used to admit entries atomically
pub struct Admission<'a, T> {
    queue: &'a EngineQueue<T>,
    inner: MutexGuard<'a, QueueInner<T>>,
    pushed: usize,
}

impl<T> Admission<'_, T> {
    /// Fail if the queue is closed or has no room for one more entry
    pub fn check(&self) -> Result<(), BackpressureError> {
        if self.inner.closed {
            return Err(BackpressureError::Closed {
                engine: self.queue.engine.clone(),
            });
        }
        let current = self.inner.entries.len();
        if current >= self.queue.capacity {
            return Err(BackpressureError::QueueFull {
                engine: self.queue.engine.clone(),
                capacity: self.queue.capacity,
                current,
            });
        }
        Ok(())
    }

    /// Append an entry; call `check` first
    pub fn push(&mut self, entry: T) {
        self.inner.entries.push_back(entry);
        self.pushed += 1;
    }
}

impl<T> Drop for Admission<'_, T> {
    fn drop(&mut self) {
        for _ in 0..self.pushed {
            self.queue.notify.notify_one();
        }
    }
}
