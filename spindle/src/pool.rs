use std::cell::{Cell, UnsafeCell};
use std::mem::MaybeUninit;

use crate::task::{Task, TaskFn, TaskHandle, TaskRef, WorkerId, NULL_TASK_HANDLE, TASK_SIZE};

/// Storage for one task cell. While free, the first bytes hold the next
/// free handle.
#[repr(C, align(128))]
struct TaskBlock(UnsafeCell<MaybeUninit<Task>>);

const _: () = assert!(std::mem::size_of::<TaskBlock>() == TASK_SIZE);

/// Fixed slab of task cells with an intrusive LIFO free list.
///
/// Not concurrent; only the owning worker touches it.
pub(crate) struct TaskPool {
    blocks: Box<[TaskBlock]>,
    freelist: Cell<TaskHandle>,
}

impl TaskPool {
    pub(crate) fn with_capacity(capacity: usize) -> TaskPool {
        assert!(
            capacity > 0 && capacity < NULL_TASK_HANDLE as usize,
            "invalid task pool capacity"
        );

        let pool = TaskPool {
            blocks: (0..capacity)
                .map(|_| TaskBlock(UnsafeCell::new(MaybeUninit::uninit())))
                .collect(),
            freelist: Cell::new(0),
        };

        for i in 0..capacity {
            let next = if i + 1 == capacity {
                NULL_TASK_HANDLE
            } else {
                (i + 1) as TaskHandle
            };
            unsafe { pool.write_next(i as TaskHandle, next) };
        }

        pool
    }

    unsafe fn write_next(&self, block: TaskHandle, next: TaskHandle) {
        (self.blocks[block as usize].0.get() as *mut TaskHandle).write(next);
    }

    unsafe fn read_next(&self, block: TaskHandle) -> TaskHandle {
        (self.blocks[block as usize].0.get() as *const TaskHandle).read()
    }

    /// Pop a free cell and construct the task in place. The caller must
    /// have made room first (see the reclamation path in `worker`).
    pub(crate) fn allocate(&self, owner: WorkerId, func: TaskFn, parent: TaskRef) -> &Task {
        let head = self.freelist.get();
        assert!(head != NULL_TASK_HANDLE, "task pool exhausted");

        unsafe {
            self.freelist.set(self.read_next(head));
            let cell = self.blocks[head as usize].0.get() as *mut Task;
            cell.write(Task::new(owner, func, parent));
            &*cell
        }
    }

    pub(crate) fn deallocate(&self, task: &Task) {
        let handle = self.task_to_index(task);
        unsafe { self.write_next(handle, self.freelist.get()) };
        self.freelist.set(handle);
    }

    pub(crate) fn task_to_index(&self, task: &Task) -> TaskHandle {
        let offset = task as *const Task as usize - self.blocks.as_ptr() as usize;
        debug_assert!(offset % TASK_SIZE == 0 && offset / TASK_SIZE < self.blocks.len());
        (offset / TASK_SIZE) as TaskHandle
    }

    /// The slot must hold a task constructed by [`TaskPool::allocate`].
    pub(crate) unsafe fn task_from_index(&self, index: TaskHandle) -> &Task {
        &*(self.blocks[index as usize].0.get() as *const Task)
    }
}
