use std::sync::atomic::{fence, AtomicI64, Ordering};

use crossbeam_utils::atomic::AtomicCell;
use crossbeam_utils::CachePadded;

/// Result of a [`SpmcDeque::pop`] or [`SpmcDeque::steal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Steal<T> {
    /// A value was taken.
    Success(T),
    /// The deque had nothing to take.
    Empty,
    /// Lost the race for the last item. No slot was consumed.
    Retry,
}

impl<T> Steal<T> {
    #[inline(always)]
    pub fn success(self) -> Option<T> {
        match self {
            Steal::Success(value) => Some(value),
            _ => None,
        }
    }
}

/// Bounded Chase-Lev work-stealing deque.
///
/// The owning worker pushes and pops at the bottom; any other thread may
/// steal from the top. `push` and `pop` must only be called from the owning
/// thread.
///
/// Indices are signed and monotonically increasing; a slot is
/// `index & (capacity - 1)`. The element stores themselves need no ordering
/// of their own, the synchronization on the indices establishes the
/// happens-before.
pub struct SpmcDeque<T> {
    indices: CachePadded<Indices>,
    data: Box<[AtomicCell<T>]>,
    mask: i64,
}

// Both indices live in one padded block, away from the slot array.
struct Indices {
    producer: AtomicI64,
    consumer: AtomicI64,
}

impl<T: Copy + Default + Send> SpmcDeque<T> {
    pub fn with_capacity(capacity: usize) -> SpmcDeque<T> {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");

        SpmcDeque {
            indices: CachePadded::new(Indices {
                producer: AtomicI64::new(0),
                consumer: AtomicI64::new(0),
            }),
            data: (0..capacity).map(|_| AtomicCell::new(T::default())).collect(),
            mask: capacity as i64 - 1,
        }
    }

    #[inline(always)]
    fn slot(&self, index: i64) -> &AtomicCell<T> {
        &self.data[(index & self.mask) as usize]
    }

    /// Owner only. Returns the value back when the deque is at capacity.
    pub fn push(&self, value: T) -> Result<(), T> {
        let producer = self.indices.producer.load(Ordering::Relaxed);
        let consumer = self.indices.consumer.load(Ordering::Acquire);

        if producer - consumer > self.mask {
            return Err(value);
        }

        self.slot(producer).store(value);
        self.indices.producer.store(producer + 1, Ordering::Release);

        Ok(())
    }

    /// Owner only.
    pub fn pop(&self) -> Steal<T> {
        let producer = self.indices.producer.load(Ordering::Relaxed) - 1;

        // Reserve the bottom slot first; only this thread writes
        // `producer`, so after the fence the consumer index read below is
        // ordered against the reservation and a thief cannot take the same
        // slot unseen.
        self.indices.producer.store(producer, Ordering::Relaxed);
        fence(Ordering::SeqCst);

        let consumer = self.indices.consumer.load(Ordering::Relaxed);

        if consumer <= producer {
            if consumer == producer {
                // Single item left, contested with thieves.
                let won = self
                    .indices
                    .consumer
                    .compare_exchange(consumer, consumer + 1, Ordering::SeqCst, Ordering::Relaxed)
                    .is_ok();

                let result = if won {
                    Steal::Success(self.slot(producer).load())
                } else {
                    Steal::Retry
                };

                // Either way the deque returns to canonical empty.
                self.indices.producer.store(producer + 1, Ordering::Relaxed);
                return result;
            }

            return Steal::Success(self.slot(producer).load());
        }

        // Empty; undo the reservation.
        self.indices.producer.store(producer + 1, Ordering::SeqCst);
        Steal::Empty
    }

    /// Any thread but the owner.
    pub fn steal(&self) -> Steal<T> {
        let consumer = self.indices.consumer.load(Ordering::Acquire);

        // The consumer index must be read in full before the producer
        // owned index.
        fence(Ordering::SeqCst);

        let producer = self.indices.producer.load(Ordering::Acquire);

        if consumer < producer {
            // The slot must be read before the CAS; a push landing right
            // after the CAS may overwrite it.
            let value = self.slot(consumer).load();

            if self
                .indices
                .consumer
                .compare_exchange(consumer, consumer + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return Steal::Success(value);
            }

            return Steal::Retry;
        }

        Steal::Empty
    }
}
