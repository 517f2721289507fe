//! Bounded hand-off queue between the decode thread and the materializers.
//!
//! A fixed ring of `capacity` slots guarded by one mutex and two condition
//! variables.  The producer blocks while the ring is full, consumers block
//! while it is empty.  Cursor arithmetic is the plain `head + len` modulo
//! `capacity` form; `len` is tracked explicitly so full and empty are never
//! confused.
//!
//! Two ways out of a wait:
//! - [`BoundedQueue::close`]: the producer is done.  Consumers drain what is
//!   left, then see `Ok(None)`.
//! - cancellation: every waiter returns `Err(Cancelled)` promptly and
//!   buffered items are dropped.  Waits also re-check the token on a short
//!   timeout so a token cancelled from outside the queue is noticed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Upper bound on how long a waiter can miss an external cancellation.
const CANCEL_POLL: Duration = Duration::from_millis(50);

// ── Cancellation ─────────────────────────────────────────────────────────────

/// Shared cooperative stop flag.
///
/// A token made with [`CancellationToken::child`] also reports cancellation
/// of its ancestors, but cancelling the child leaves them untouched.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag:      Arc<AtomicBool>,
    ancestors: Vec<Arc<AtomicBool>>,
}

impl CancellationToken {
    pub fn new() -> Self { Self::default() }

    /// Fresh token that is cancelled when either it or `self` is.
    pub fn child(&self) -> Self {
        let mut ancestors = self.ancestors.clone();
        ancestors.push(Arc::clone(&self.flag));
        Self { flag: Arc::new(AtomicBool::new(false)), ancestors }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
            || self.ancestors.iter().any(|a| a.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

// ── Queue ────────────────────────────────────────────────────────────────────

struct Ring<T> {
    slots:  Vec<Option<T>>,
    head:   usize,
    len:    usize,
    closed: bool,
    peak:   usize,
}

pub struct BoundedQueue<T> {
    ring:      Mutex<Ring<T>>,
    not_full:  Condvar,
    not_empty: Condvar,
    token:     CancellationToken,
    capacity:  usize,
}

impl<T> BoundedQueue<T> {
    /// `capacity` is clamped to at least one slot.
    pub fn new(capacity: usize, token: CancellationToken) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            ring: Mutex::new(Ring { slots, head: 0, len: 0, closed: false, peak: 0 }),
            not_full:  Condvar::new(),
            not_empty: Condvar::new(),
            token,
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Ring<T>> {
        // A panicking peer has already failed the pipeline; the ring itself
        // is never left half-updated.
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a slot is free, then enqueue `item`.
    ///
    /// Fails if the queue is cancelled (or was closed) before a slot frees up;
    /// the item is dropped in that case.
    pub fn push(&self, item: T) -> Result<(), Cancelled> {
        let mut ring = self.lock();
        loop {
            if self.token.is_cancelled() || ring.closed {
                return Err(Cancelled);
            }
            if ring.len < self.capacity {
                break;
            }
            ring = self
                .not_full
                .wait_timeout(ring, CANCEL_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        let tail = (ring.head + ring.len) % self.capacity;
        ring.slots[tail] = Some(item);
        ring.len += 1;
        ring.peak = ring.peak.max(ring.len);
        drop(ring);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Block until an item is available.  `Ok(None)` once the queue is
    /// closed and drained.
    pub fn pop(&self) -> Result<Option<T>, Cancelled> {
        let mut ring = self.lock();
        loop {
            if self.token.is_cancelled() {
                return Err(Cancelled);
            }
            if ring.len > 0 {
                let head = ring.head;
                let item = ring.slots[head].take();
                ring.head = (head + 1) % self.capacity;
                ring.len -= 1;
                drop(ring);
                self.not_full.notify_one();
                return Ok(item);
            }
            if ring.closed {
                return Ok(None);
            }
            ring = self
                .not_empty
                .wait_timeout(ring, CANCEL_POLL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// No more items will be pushed.
    pub fn close(&self) {
        self.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Cancel the shared token, release buffered items and wake everyone.
    pub fn cancel(&self) {
        self.token.cancel();
        let mut ring = self.lock();
        for slot in ring.slots.iter_mut() {
            *slot = None;
        }
        ring.len = 0;
        drop(ring);
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn token(&self) -> &CancellationToken { &self.token }

    pub fn is_cancelled(&self) -> bool { self.token.is_cancelled() }

    pub fn capacity(&self) -> usize { self.capacity }

    pub fn len(&self) -> usize { self.lock().len }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Highest number of items ever buffered at once.
    pub fn peak(&self) -> usize { self.lock().peak }
}
