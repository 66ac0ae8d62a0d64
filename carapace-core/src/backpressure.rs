//! Backpressure: per-subscription pending limits
//!
//! Flow control for inbound deliveries. The read loop never waits on a slow
//! subscriber; instead every subscription carries a message and byte budget
//! and anything past it is dropped.
//!
//! Policy:
//! - The newest incoming message is the one dropped; queued messages are kept
//! - A message that would break either budget (or both) counts as one drop
//! - One slow-consumer report per episode; an episode ends when a message is
//!   admitted again
//!
//! Usage:
//! ```rust
//! use carapace_core::backpressure::{Admission, PendingCounter, PendingLimits};
//!
//! let counter = PendingCounter::new(PendingLimits::new(2, 0));
//! assert_eq!(counter.admit(10), Admission::Accepted);
//! assert_eq!(counter.admit(10), Admission::Accepted);
//! assert_eq!(counter.admit(10), Admission::Dropped { first_in_episode: true });
//! counter.release(10);
//! assert_eq!(counter.admit(10), Admission::Accepted);
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

/// Message and byte budget of one subscription. Zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingLimits {
    pub msgs: usize,
    pub bytes: usize,
}

impl PendingLimits {
    pub const fn new(msgs: usize, bytes: usize) -> Self {
        Self { msgs, bytes }
    }

    /// No limit on either axis.
    pub const fn unlimited() -> Self {
        Self { msgs: 0, bytes: 0 }
    }

    fn fits(&self, msgs: usize, bytes: usize) -> bool {
        (self.msgs == 0 || msgs <= self.msgs) && (self.bytes == 0 || bytes <= self.bytes)
    }
}

/// Outcome of offering one message to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    Dropped { first_in_episode: bool },
}

/// Pending counters shared by the dispatcher (producer) and the consumer.
#[derive(Debug)]
pub struct PendingCounter {
    limits: PendingLimits,
    msgs: AtomicUsize,
    bytes: AtomicUsize,
    delivered: AtomicU64,
    dropped: AtomicU64,
    slow: AtomicBool,
}

impl PendingCounter {
    pub fn new(limits: PendingLimits) -> Self {
        Self {
            limits,
            msgs: AtomicUsize::new(0),
            bytes: AtomicUsize::new(0),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            slow: AtomicBool::new(false),
        }
    }

    /// Offer a message of `len` bytes. Called from the read loop only.
    pub fn admit(&self, len: usize) -> Admission {
        let msgs = self.msgs.load(Ordering::Acquire) + 1;
        let bytes = self.bytes.load(Ordering::Acquire) + len;

        if !self.limits.fits(msgs, bytes) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            let first_in_episode = !self.slow.swap(true, Ordering::AcqRel);
            return Admission::Dropped { first_in_episode };
        }

        self.msgs.fetch_add(1, Ordering::AcqRel);
        self.bytes.fetch_add(len, Ordering::AcqRel);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        self.slow.store(false, Ordering::Release);
        Admission::Accepted
    }

    /// Account for a message handed to (or finished by) the application.
    ///
    /// Returns true when the queue became empty.
    pub fn release(&self, len: usize) -> bool {
        let prev = self
            .msgs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |m| Some(m.saturating_sub(1)))
            .unwrap_or(0);
        let _ = self
            .bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |b| Some(b.saturating_sub(len)));
        prev <= 1
    }

    /// Forget everything still queued (subscription torn down).
    pub fn clear(&self) {
        self.msgs.store(0, Ordering::Release);
        self.bytes.store(0, Ordering::Release);
    }

    #[inline]
    pub fn pending_msgs(&self) -> usize {
        self.msgs.load(Ordering::Acquire)
    }

    #[inline]
    pub fn pending_bytes(&self) -> usize {
        self.bytes.load(Ordering::Acquire)
    }

    #[inline]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub const fn limits(&self) -> PendingLimits {
        self.limits
    }
}
