use std::cell::UnsafeCell;
use std::fmt;
use std::mem::size_of;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU8, Ordering};

/// Worker thread identifier. Worker 0 is the main thread.
pub type WorkerId = u16;

/// Slot index of a task cell inside its owning worker's pool.
pub(crate) type TaskHandle = u16;

pub(crate) const NULL_TASK_HANDLE: TaskHandle = TaskHandle::MAX;

/// The function a task runs, invoked with the task itself as argument.
pub type TaskFn = fn(&Task);

/// Determines which threads a task is allowed to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueType {
    /// Runs on either the main or worker threads.
    Normal = 0,
    /// Runs only on the main thread.
    Main = 1,
    /// Never runs on the main thread.
    Worker = 2,
}

/// `q_type` of a task that is not currently submitted to any queue.
pub(crate) const QUEUE_TYPE_INVALID: u8 = QueueType::Worker as u8 + 1;

impl QueueType {
    #[inline(always)]
    pub(crate) fn from_raw(raw: u8) -> QueueType {
        match raw {
            0 => QueueType::Normal,
            1 => QueueType::Main,
            2 => QueueType::Worker,
            _ => unreachable!("task was not submitted to a queue"),
        }
    }
}

/// Compact task identity: owning worker plus pool slot.
///
/// Fits in 32 bits so the continuation list head can be a plain lock-free
/// atomic on every target. The alignment is raised to that of `u32` so a
/// deque slot holding one maps onto a plain atomic as well.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C, align(4))]
pub struct TaskRef {
    worker: WorkerId,
    index: TaskHandle,
}

const _: () = assert!(size_of::<TaskRef>() == 4);

pub(crate) const NULL_TASK_REF: TaskRef = TaskRef {
    worker: WorkerId::MAX,
    index: NULL_TASK_HANDLE,
};

impl TaskRef {
    #[inline(always)]
    pub(crate) fn new(worker: WorkerId, index: TaskHandle) -> TaskRef {
        TaskRef { worker, index }
    }

    #[inline(always)]
    pub(crate) fn is_null(self) -> bool {
        self.index == NULL_TASK_HANDLE
    }

    #[inline(always)]
    pub(crate) fn worker(self) -> WorkerId {
        self.worker
    }

    #[inline(always)]
    pub(crate) fn index(self) -> TaskHandle {
        self.index
    }

    #[inline(always)]
    fn to_bits(self) -> u32 {
        (self.worker as u32) << 16 | self.index as u32
    }

    #[inline(always)]
    fn from_bits(bits: u32) -> TaskRef {
        TaskRef {
            worker: (bits >> 16) as u16,
            index: bits as u16,
        }
    }
}

impl Default for TaskRef {
    fn default() -> TaskRef {
        NULL_TASK_REF
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("TaskRef(null)")
        } else {
            write!(f, "TaskRef({}:{})", self.worker, self.index)
        }
    }
}

pub(crate) struct AtomicTaskRef(AtomicU32);

impl AtomicTaskRef {
    pub(crate) fn new(value: TaskRef) -> AtomicTaskRef {
        AtomicTaskRef(AtomicU32::new(value.to_bits()))
    }

    #[inline(always)]
    pub(crate) fn load(&self, order: Ordering) -> TaskRef {
        TaskRef::from_bits(self.0.load(order))
    }

    #[inline(always)]
    pub(crate) fn store(&self, value: TaskRef, order: Ordering) {
        self.0.store(value.to_bits(), order);
    }

    #[inline(always)]
    pub(crate) fn compare_exchange(
        &self,
        current: TaskRef,
        new: TaskRef,
        success: Ordering,
        failure: Ordering,
    ) -> Result<TaskRef, TaskRef> {
        self.0
            .compare_exchange(current.to_bits(), new.to_bits(), success, failure)
            .map(TaskRef::from_bits)
            .map_err(TaskRef::from_bits)
    }
}

/// Size of one task cell; one destructive-interference line on the targets
/// this crate cares about.
pub(crate) const TASK_SIZE: usize = 128;

const TASK_HEADER_SIZE: usize = size_of::<TaskFn>()
    + size_of::<AtomicI32>() * 2
    + size_of::<TaskRef>()
    + size_of::<AtomicTaskRef>() * 2
    + size_of::<WorkerId>()
    + size_of::<AtomicU8>() * 2;

/// Bytes of inline storage inside a task cell.
pub const TASK_USER_DATA_SIZE: usize = TASK_SIZE - TASK_HEADER_SIZE;

/// A single unit of work.
///
/// The cell is trivially destructible: reclamation is a free-list push, and
/// any user payload needing cleanup must be dropped by the task body.
#[repr(C, align(128))]
pub struct Task {
    pub(crate) func: TaskFn,
    /// 1 at construction, +1 per child, −1 when the body or a child
    /// finishes; −1 is the published done state.
    pub(crate) num_unfinished_tasks: AtomicI32,
    /// Keeps the cell from being garbage collected; 0 only once the task is
    /// finished and no external holder remains.
    pub(crate) ref_count: AtomicI32,
    pub(crate) parent: TaskRef,
    /// Head of the linked list of continuations.
    pub(crate) first_continuation: AtomicTaskRef,
    /// Link used when this task is itself a continuation.
    pub(crate) next_continuation: AtomicTaskRef,
    pub(crate) owning_worker: WorkerId,
    /// Queue the task was submitted to, `QUEUE_TYPE_INVALID` until then.
    pub(crate) q_type: AtomicU8,
    /// Offset past the library-reserved prefix of `user_data`.
    pub(crate) user_data_start: AtomicU8,
    user_data: UnsafeCell<[u8; TASK_USER_DATA_SIZE]>,
}

const _: () = assert!(size_of::<Task>() == TASK_SIZE);
const _: () = assert!(std::mem::align_of::<Task>() == TASK_SIZE);
const _: () = assert!(TASK_USER_DATA_SIZE <= u8::MAX as usize);

// Cross-thread fields are all atomics; `user_data` is only touched by
// whichever thread currently holds construction or execution rights to the
// cell.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

/// User-writable window into a task's inline storage.
#[derive(Debug, Clone, Copy)]
pub struct TaskData {
    pub ptr: *mut u8,
    pub size: usize,
}

#[inline(always)]
pub(crate) fn align_up(addr: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (addr + align - 1) & !(align - 1)
}

impl Task {
    pub(crate) fn new(owner: WorkerId, func: TaskFn, parent: TaskRef) -> Task {
        Task {
            func,
            num_unfinished_tasks: AtomicI32::new(1),
            ref_count: AtomicI32::new(1),
            parent,
            first_continuation: AtomicTaskRef::new(NULL_TASK_REF),
            next_continuation: AtomicTaskRef::new(NULL_TASK_REF),
            owning_worker: owner,
            q_type: AtomicU8::new(QUEUE_TYPE_INVALID),
            user_data_start: AtomicU8::new(0),
            user_data: UnsafeCell::new([0; TASK_USER_DATA_SIZE]),
        }
    }

    #[inline(always)]
    pub(crate) fn invoke(&self) {
        (self.func)(self)
    }

    /// Queue the task was submitted to. Only meaningful between submission
    /// and completion.
    #[inline(always)]
    pub(crate) fn queue_type(&self) -> QueueType {
        QueueType::from_raw(self.q_type.load(Ordering::Relaxed))
    }

    /// Aligned view of the user storage past any reserved prefix.
    pub(crate) fn user_data(&self, alignment: usize) -> TaskData {
        assert!(alignment.is_power_of_two(), "alignment must be a power of two");

        let base = self.user_data.get() as *mut u8 as usize;
        let start = base + self.user_data_start.load(Ordering::Relaxed) as usize;
        let end = base + TASK_USER_DATA_SIZE;
        let aligned = align_up(start, alignment);

        if aligned <= end {
            TaskData {
                ptr: aligned as *mut u8,
                size: end - aligned,
            }
        } else {
            TaskData {
                ptr: std::ptr::null_mut(),
                size: 0,
            }
        }
    }

    /// Reserve an aligned prefix of the user buffer for library-owned
    /// storage; [`Task::user_data`] views start past it afterwards.
    /// Exceeding the cell is a contract error.
    pub(crate) fn reserve_private_data(&self, num_bytes: usize, alignment: usize) -> *mut u8 {
        let base = self.user_data.get() as *mut u8 as usize;
        let start = align_up(base, alignment);
        let end_offset = start - base + num_bytes;

        assert!(
            end_offset <= TASK_USER_DATA_SIZE,
            "object does not fit within the task's inline storage"
        );

        self.user_data_start.store(end_offset as u8, Ordering::Relaxed);
        start as *mut u8
    }

    /// Start of the reserved prefix, at the given alignment.
    #[inline(always)]
    pub(crate) fn private_data(&self, alignment: usize) -> *mut u8 {
        align_up(self.user_data.get() as *mut u8 as usize, alignment) as *mut u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe_task() -> Task {
        Task::new(0, |_| {}, NULL_TASK_REF)
    }

    #[test]
    fn task_ref_bits_round_trip() {
        let r = TaskRef::new(7, 1234);
        assert_eq!(TaskRef::from_bits(r.to_bits()), r);
        assert!(NULL_TASK_REF.is_null());
        assert!(!r.is_null());
    }

    #[test]
    fn atomic_task_ref_compare_exchange() {
        let a = AtomicTaskRef::new(NULL_TASK_REF);
        let first = TaskRef::new(1, 2);
        let second = TaskRef::new(3, 4);

        assert!(a
            .compare_exchange(NULL_TASK_REF, first, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok());
        assert_eq!(
            a.compare_exchange(NULL_TASK_REF, second, Ordering::Relaxed, Ordering::Relaxed),
            Err(first)
        );
        assert_eq!(a.load(Ordering::Relaxed), first);
    }

    #[test]
    fn user_data_spans_to_cell_end() {
        let task = probe_task();
        let data = task.user_data(1);
        assert_eq!(data.size, TASK_USER_DATA_SIZE);
        assert!(!data.ptr.is_null());
    }

    #[test]
    fn reservation_advances_user_data() {
        let task = probe_task();
        let reserved = task.reserve_private_data(24, 8);
        assert_eq!(reserved as usize % 8, 0);

        let data = task.user_data(8);
        assert!(data.size <= TASK_USER_DATA_SIZE - 24);
        assert!((data.ptr as usize) >= reserved as usize + 24);
    }

    #[test]
    fn over_aligned_view_shrinks() {
        let task = probe_task();
        let a = task.user_data(1);
        let b = task.user_data(64);
        assert!(b.size <= a.size);
        assert_eq!(b.ptr as usize % 64, 0);
    }

    #[test]
    #[should_panic(expected = "inline storage")]
    fn oversized_reservation_is_a_contract_error() {
        let task = probe_task();
        task.reserve_private_data(TASK_USER_DATA_SIZE + 1, 1);
    }
}
