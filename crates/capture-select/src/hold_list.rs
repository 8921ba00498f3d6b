//! Blocking FIFO with timed waits and an external wake-all signal.
//!
//! A wait ends in exactly one of three ways: an item arrives, the relative
//! wait time elapses, or [`BlockingBoundedQueue::wake_all`] raised the
//! cancellation flag. The flag is checked before sleeping and again on every
//! wake-up, so a cancel issued between the check and the sleep is not lost.
//!
//! Cancellation is sticky until [`BlockingBoundedQueue::reset_cancel`].

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

/// Result of [`BlockingBoundedQueue::wait_and_pop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PopOutcome<T> {
    /// An item was available.
    Item(T),
    /// The wait time elapsed with the queue empty.
    TimedOut,
    /// The queue was woken by `wake_all`.
    Canceled,
}

/// FIFO queue with an optional bound and cancellable waits.
#[derive(Debug)]
pub struct BlockingBoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    bound: Option<usize>,
    wait_time: Mutex<Duration>,
    canceled: AtomicBool,
    waiters: AtomicUsize,
}

impl<T> BlockingBoundedQueue<T> {
    /// Unbounded queue.
    #[must_use]
    pub fn new(wait_time: Duration) -> Self {
        Self::with_bound(None, wait_time)
    }

    /// Queue whose `push` blocks once `bound` items are queued.
    #[must_use]
    pub fn bounded(bound: usize, wait_time: Duration) -> Self {
        Self::with_bound(Some(bound.max(1)), wait_time)
    }

    fn with_bound(bound: Option<usize>, wait_time: Duration) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            bound,
            wait_time: Mutex::new(wait_time),
            canceled: AtomicBool::new(false),
            waiters: AtomicUsize::new(0),
        }
    }

    /// Append an item, blocking while the queue is full.
    ///
    /// Returns the item back if the queue is canceled while waiting for room.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock();
        if let Some(bound) = self.bound {
            while items.len() >= bound {
                if self.canceled.load(Ordering::Acquire) {
                    return Err(item);
                }
                self.not_full.wait(&mut items);
            }
        }
        items.push_back(item);
        drop(items);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Pop the oldest item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let item = self.items.lock().pop_front();
        if item.is_some() {
            self.not_full.notify_one();
        }
        item
    }

    /// Pop the oldest item, waiting up to the configured wait time.
    pub fn wait_and_pop(&self) -> PopOutcome<T> {
        let deadline = Instant::now() + *self.wait_time.lock();
        let mut items = self.items.lock();
        self.waiters.fetch_add(1, Ordering::AcqRel);

        let outcome = loop {
            if self.canceled.load(Ordering::Acquire) {
                break PopOutcome::Canceled;
            }
            if let Some(item) = items.pop_front() {
                self.not_full.notify_one();
                break PopOutcome::Item(item);
            }
            if self.not_empty.wait_until(&mut items, deadline).timed_out() {
                if self.canceled.load(Ordering::Acquire) {
                    break PopOutcome::Canceled;
                }
                match items.pop_front() {
                    Some(item) => {
                        self.not_full.notify_one();
                        break PopOutcome::Item(item);
                    }
                    None => break PopOutcome::TimedOut,
                }
            }
        };

        self.waiters.fetch_sub(1, Ordering::AcqRel);
        outcome
    }

    /// Raise the cancellation flag and wake every waiter.
    pub fn wake_all(&self) {
        self.canceled.store(true, Ordering::Release);
        // Taking the lock orders the store before any waiter's next check.
        drop(self.items.lock());
        self.not_empty.notify_all();
        self.not_full.notify_all();
        trace!("hold list woken");
    }

    /// Clear the cancellation flag.
    pub fn reset_cancel(&self) {
        self.canceled.store(false, Ordering::Release);
    }

    /// Whether the cancellation flag is raised.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Whether a consumer is currently inside `wait_and_pop`.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        self.waiters.load(Ordering::Acquire) > 0
    }

    /// Change the relative wait used by later `wait_and_pop` calls.
    pub fn set_wait_time(&self, wait_time: Duration) {
        *self.wait_time.lock() = wait_time;
    }

    /// Current relative wait.
    #[must_use]
    pub fn wait_time(&self) -> Duration {
        *self.wait_time.lock()
    }

    /// Remove every item, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = self.items.lock().drain(..).collect();
        self.not_full.notify_all();
        drained
    }

    /// Queued items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// True when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
