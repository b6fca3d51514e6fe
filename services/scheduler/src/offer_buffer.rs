//! Bounded buffer of incoming resource offers.
//!
//! Offers arrive on the driver's callback thread and are consumed in batches
//! by whoever processes them (inline, or the dedicated processing thread).
//! The buffer has its own lock and condition variable, independent of the
//! scheduler lock, so it can also be used on its own.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use fleet_id::OfferId;
use tracing::{info, warn};

use crate::offer::ResourceOffer;

/// Default maximum number of buffered offers.
pub const DEFAULT_CAPACITY: usize = 100;

/// Default time `drain_all` waits for the first offer.
pub const DEFAULT_OFFER_WAIT: Duration = Duration::from_secs(600);

/// Counters for buffer activity.
#[derive(Debug, Default)]
pub struct OfferBufferStats {
    /// Offers accepted into the buffer.
    pub added: AtomicU64,
    /// Offers rejected because the buffer was full.
    pub dropped: AtomicU64,
    /// Offers removed after being rescinded.
    pub removed: AtomicU64,
}

struct Inner {
    offers: VecDeque<ResourceOffer>,
    /// Bumped by `interrupt()`; waiters that observe a change give up.
    generation: u64,
}

/// A bounded FIFO of offers with blocking batch drain.
pub struct OfferBuffer {
    /// Zero means unbounded.
    capacity: usize,
    inner: Mutex<Inner>,
    available: Condvar,
    stats: OfferBufferStats,
}

impl OfferBuffer {
    /// Create a buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a buffer holding at most `capacity` offers, or an unbounded
    /// buffer when `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                offers: VecDeque::new(),
                generation: 0,
            }),
            available: Condvar::new(),
            stats: OfferBufferStats::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an offer if there is capacity.
    ///
    /// Returns false, and counts a drop, when the buffer is full.
    pub fn enqueue(&self, offer: ResourceOffer) -> bool {
        let mut inner = self.lock();
        if self.capacity != 0 && inner.offers.len() >= self.capacity {
            drop(inner);
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        inner.offers.push_back(offer);
        drop(inner);

        self.stats.added.fetch_add(1, Ordering::Relaxed);
        self.available.notify_one();
        true
    }

    /// Wait up to `timeout` for an offer, then return it together with every
    /// other offer already buffered.
    ///
    /// Returns an empty batch if nothing arrived in time or the wait was
    /// interrupted. A timeout too large to represent waits without a
    /// deadline.
    pub fn drain_all(&self, timeout: Duration) -> Vec<ResourceOffer> {
        let deadline = Instant::now().checked_add(timeout);
        let mut inner = self.lock();
        let generation = inner.generation;

        while inner.offers.is_empty() {
            if inner.generation != generation {
                warn!("Interrupted while waiting for offers");
                return Vec::new();
            }

            inner = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Vec::new();
                    }
                    self.available
                        .wait_timeout(inner, deadline - now)
                        .map(|(guard, _)| guard)
                        .unwrap_or_else(|poisoned| poisoned.into_inner().0)
                }
                None => self
                    .available
                    .wait(inner)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }

        inner.offers.drain(..).collect()
    }

    /// Wake every thread blocked in `drain_all`; each returns an empty batch.
    pub fn interrupt(&self) {
        self.lock().generation += 1;
        self.available.notify_all();
    }

    /// Remove the offer with `offer_id`, if buffered.
    ///
    /// Returns true if an offer was removed. A missing offer is logged, not
    /// treated as an error.
    pub fn remove(&self, offer_id: &OfferId) -> bool {
        let mut inner = self.lock();
        let position = inner.offers.iter().position(|o| &o.id == offer_id);
        let removed = position.and_then(|i| inner.offers.remove(i)).is_some();
        drop(inner);

        if removed {
            info!(offer_id = %offer_id, "Removed offer");
            self.stats.removed.fetch_add(1, Ordering::Relaxed);
        } else {
            warn!(
                offer_id = %offer_id,
                "Attempted to remove offer but it was not present in the queue"
            );
        }
        removed
    }

    /// Number of buffered offers.
    pub fn len(&self) -> usize {
        self.lock().offers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().offers.is_empty()
    }

    /// Free slots left, or `usize::MAX` for an unbounded buffer.
    pub fn remaining_capacity(&self) -> usize {
        if self.capacity == 0 {
            return usize::MAX;
        }
        self.capacity.saturating_sub(self.len())
    }

    /// Get buffer statistics.
    pub fn stats(&self) -> &OfferBufferStats {
        &self.stats
    }
}

impl Default for OfferBuffer {
    fn default() -> Self {
        Self::new()
    }
}
