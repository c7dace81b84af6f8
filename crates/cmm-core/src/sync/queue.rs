//! Frame queues with coupled blocking waits.
//!
//! A queue may be coupled with one sibling so a single waiter wakes when an
//! item arrives in either queue: the Sender idles on its two outbound queues
//! (ring-forwarded traffic from the Lobby, locally originated traffic from
//! the Stack) with one bounded wait. Coupling shares only the wake
//! condition; each queue's contents stay independent and individually FIFO.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use cmm_api::Frame;

/// Outcome of a bounded wait. A timeout is a distinct status, not an error:
/// it is how the Sender bounds each loop iteration by the heartbeat
/// interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitResult {
    Ready,
    TimedOut,
}

/// Shared wake condition of one or more coupled queues. `pending` counts
/// items across the whole coupled set so a waiter can tell "something
/// arrived somewhere" without locking every sibling.
#[derive(Debug, Default)]
struct WaitSet {
    notify: Notify,
    pending: AtomicUsize,
}

/// Iteration cursor. `Before(i)` marks the gap left by `remove_current` so
/// the scan resumes at the removed element's successor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Cursor {
    #[default]
    Idle,
    Before(usize),
    At(usize),
}

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<Frame>,
    cursor: Cursor,
}

/// FIFO frame queue; the only inter-worker communication primitive besides
/// the cluster node table.
#[derive(Debug)]
pub struct FrameQueue {
    inner: Mutex<Inner>,
    wait: RwLock<Arc<WaitSet>>,
}

impl FrameQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            wait: RwLock::new(Arc::new(WaitSet::default())),
        })
    }

    /// Share the wake condition with `other`. Must be called during setup,
    /// before either queue has items or waiters.
    pub fn couple_with(self: &Arc<Self>, other: &Arc<Self>) {
        let shared = other.wait.read().clone();
        *self.wait.write() = shared;
    }

    /// Append an item and wake every waiter of the coupled set.
    pub fn add(&self, frame: Frame) {
        {
            let mut inner = self.inner.lock();
            inner.items.push_back(frame);
        }
        let wait = self.wait.read().clone();
        wait.pending.fetch_add(1, Ordering::SeqCst);
        wait.notify.notify_waiters();
    }

    /// Pop the oldest item, or `None` when empty.
    pub fn extract_first(&self) -> Option<Frame> {
        let frame = {
            let mut inner = self.inner.lock();
            let frame = inner.items.pop_front()?;
            // The cursor tracks positions, not elements; popping the head
            // shifts everything one slot left. Popping the element under
            // the cursor leaves the scan at the removed element's successor.
            inner.cursor = match inner.cursor {
                Cursor::Idle => Cursor::Idle,
                Cursor::At(0) => Cursor::Before(0),
                Cursor::At(i) => Cursor::At(i - 1),
                Cursor::Before(0) => Cursor::Before(0),
                Cursor::Before(i) => Cursor::Before(i - 1),
            };
            frame
        };
        self.wait.read().pending.fetch_sub(1, Ordering::SeqCst);
        Some(frame)
    }

    /// Start a non-destructive iteration; returns a copy of the first item.
    pub fn get_first(&self) -> Option<Frame> {
        let mut inner = self.inner.lock();
        if inner.items.is_empty() {
            inner.cursor = Cursor::Idle;
            return None;
        }
        inner.cursor = Cursor::At(0);
        inner.items.front().cloned()
    }

    /// Advance the iteration cursor; returns a copy of the next item.
    pub fn get_next(&self) -> Option<Frame> {
        let mut inner = self.inner.lock();
        let next = match inner.cursor {
            Cursor::Idle => return None,
            Cursor::Before(i) => i,
            Cursor::At(i) => i + 1,
        };
        if next >= inner.items.len() {
            inner.cursor = Cursor::Idle;
            return None;
        }
        inner.cursor = Cursor::At(next);
        inner.items.get(next).cloned()
    }

    /// Remove the element the cursor currently references.
    pub fn remove_current(&self) -> Option<Frame> {
        let frame = {
            let mut inner = self.inner.lock();
            let i = match inner.cursor {
                Cursor::At(i) => i,
                _ => return None,
            };
            let frame = inner.items.remove(i)?;
            inner.cursor = Cursor::Before(i);
            frame
        };
        self.wait.read().pending.fetch_sub(1, Ordering::SeqCst);
        Some(frame)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    pub fn count(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Wait until an item is present somewhere in the coupled set.
    pub async fn block(&self) {
        loop {
            let wait = self.wait.read().clone();
            if wait.pending.load(Ordering::SeqCst) > 0 {
                return;
            }
            let notified = wait.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if wait.pending.load(Ordering::SeqCst) > 0 {
                return;
            }
            notified.await;
        }
    }

    /// Wait up to `bound` for an item anywhere in the coupled set.
    pub async fn timed_block(&self, bound: Duration) -> WaitResult {
        match tokio::time::timeout(bound, self.block()).await {
            Ok(()) => WaitResult::Ready,
            Err(_) => WaitResult::TimedOut,
        }
    }
}
