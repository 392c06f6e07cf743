use std::cell::{Cell, UnsafeCell};
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// Lock-free single-producer single-consumer ring.
///
/// The producer owns `head`, the consumer owns `tail`, and each side keeps
/// a cached copy of the opposite index so the common case never touches the
/// other side's cache line. The cache is refreshed only when the cheap
/// check says the ring appears full (producer) or empty (consumer); if it
/// still appears so afterwards, the call fails. One slot is sacrificed to
/// tell full from empty.
pub struct SpscRing<T> {
    // Producer side.
    head: CachePadded<AtomicUsize>,
    cached_tail: CachePadded<Cell<usize>>,

    // Consumer side.
    tail: CachePadded<AtomicUsize>,
    cached_head: CachePadded<Cell<usize>>,

    data: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
}

unsafe impl<T: Send> Send for SpscRing<T> {}
// One thread pushes, one thread pops; each cached index cell is touched by
// exactly one of them.
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T> SpscRing<T> {
    pub fn with_capacity(capacity: usize) -> SpscRing<T> {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");

        SpscRing {
            head: CachePadded::new(AtomicUsize::new(0)),
            cached_tail: CachePadded::new(Cell::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            cached_head: CachePadded::new(Cell::new(0)),
            data: (0..capacity).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect(),
            mask: capacity - 1,
        }
    }

    /// Producer only. Returns the value back when the ring is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let head = self.head.load(Ordering::Relaxed);

        if self.is_full(head, self.cached_tail.get()) {
            self.cached_tail.set(self.tail.load(Ordering::Acquire));
            if self.is_full(head, self.cached_tail.get()) {
                return Err(value);
            }
        }

        unsafe { (*self.data[head & self.mask].get()).write(value) };
        self.head.store(head.wrapping_add(1), Ordering::Release);

        Ok(())
    }

    /// Consumer only.
    pub fn pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);

        if self.cached_head.get() == tail {
            self.cached_head.set(self.head.load(Ordering::Acquire));
            if self.cached_head.get() == tail {
                return None;
            }
        }

        let value = unsafe { (*self.data[tail & self.mask].get()).assume_init_read() };
        self.tail.store(tail.wrapping_add(1), Ordering::Release);

        Some(value)
    }

    #[inline(always)]
    fn is_full(&self, head: usize, tail: usize) -> bool {
        (head.wrapping_add(1) & self.mask) == (tail & self.mask)
    }
}

impl<T> Drop for SpscRing<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}
