use std::mem::MaybeUninit;
use std::sync::Mutex;

/// Mutex guarded FIFO ring.
///
/// Backs the main-thread queue, which sees little contention; simplicity is
/// worth more than speed here. Capacity must be a power of two.
pub struct LockedQueue<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    data: Box<[MaybeUninit<T>]>,
    mask: usize,
    write_index: usize,
    len: usize,
}

unsafe impl<T: Send> Send for LockedQueue<T> {}
unsafe impl<T: Send> Sync for LockedQueue<T> {}

impl<T> LockedQueue<T> {
    pub fn with_capacity(capacity: usize) -> LockedQueue<T> {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");

        LockedQueue {
            inner: Mutex::new(Inner {
                data: (0..capacity).map(|_| MaybeUninit::uninit()).collect(),
                mask: capacity - 1,
                write_index: 0,
                len: 0,
            }),
        }
    }

    /// Returns the value back when the ring is full.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut q = self.inner.lock().unwrap();

        if q.len == q.data.len() {
            return Err(value);
        }

        let slot = q.write_index & q.mask;
        q.data[slot] = MaybeUninit::new(value);
        q.write_index = q.write_index.wrapping_add(1);
        q.len += 1;

        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        let mut q = self.inner.lock().unwrap();

        if q.len == 0 {
            return None;
        }

        let slot = q.write_index.wrapping_sub(q.len) & q.mask;
        q.len -= 1;

        // The slot was written by a past push and is vacated here.
        Some(unsafe { q.data[slot].assume_init_read() })
    }
}

impl<T> Drop for LockedQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}
