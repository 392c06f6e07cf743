use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{fence, Ordering};

#[cfg(feature = "tracing")]
use log::trace;

use crate::pool::TaskPool;
use crate::queue::{SpmcDeque, Steal};
use crate::system::JobSystemContext;
use crate::task::{QueueType, Task, TaskFn, TaskHandle, TaskRef, WorkerId, QUEUE_TYPE_INVALID};

/// Per-worker scheduler state.
///
/// The deques are shared with thieves; the pool, the live table, the victim
/// hint and the RNG belong to the owning thread alone.
pub(crate) struct WorkerState {
    pub(crate) id: WorkerId,
    pub(crate) normal_queue: SpmcDeque<TaskRef>,
    pub(crate) worker_queue: SpmcDeque<TaskRef>,
    pool: TaskPool,
    live: UnsafeCell<LiveTable>,
    last_stolen_worker: Cell<WorkerId>,
    rng: UnsafeCell<fastrand::Rng>,
}

// The deques synchronize themselves; every other field is only touched from
// the thread this state belongs to.
unsafe impl Sync for WorkerState {}

/// Handles of every cell allocated on this worker and not yet reclaimed.
struct LiveTable {
    handles: Box<[TaskHandle]>,
    len: usize,
}

impl WorkerState {
    pub(crate) fn new(
        id: WorkerId,
        normal_capacity: usize,
        worker_capacity: usize,
        num_tasks: usize,
        rng_seed: u64,
    ) -> WorkerState {
        WorkerState {
            id,
            normal_queue: SpmcDeque::with_capacity(normal_capacity),
            worker_queue: SpmcDeque::with_capacity(worker_capacity),
            pool: TaskPool::with_capacity(num_tasks),
            live: UnsafeCell::new(LiveTable {
                handles: vec![0; num_tasks].into_boxed_slice(),
                len: 0,
            }),
            // Everyone starts out stealing from the main worker.
            last_stolen_worker: Cell::new(0),
            rng: UnsafeCell::new(fastrand::Rng::with_seed(rng_seed)),
        }
    }

    #[inline(always)]
    pub(crate) fn is_main(&self) -> bool {
        self.id == 0
    }

    pub(crate) fn num_live_tasks(&self) -> usize {
        unsafe { (*self.live.get()).len }
    }

    /// Owner only: allocate a cell and record it in the live table.
    pub(crate) fn allocate_task(&self, func: TaskFn, parent: TaskRef) -> &Task {
        let task = self.pool.allocate(self.id, func, parent);
        let live = unsafe { &mut *self.live.get() };
        live.handles[live.len] = self.pool.task_to_index(task);
        live.len += 1;
        task
    }

    /// Owner only: free every cell whose reference count reached zero and
    /// compact the live table in place.
    pub(crate) fn collect_garbage(&self) {
        let live = unsafe { &mut *self.live.get() };
        let mut write = 0;

        for read in 0..live.len {
            let handle = live.handles[read];
            let task = unsafe { self.pool.task_from_index(handle) };

            if task.ref_count.load(Ordering::Acquire) == 0 {
                self.pool.deallocate(task);
            } else {
                live.handles[write] = handle;
                write += 1;
            }
        }

        #[cfg(feature = "tracing")]
        if write != live.len {
            trace!("worker {} reclaimed {} task cells", self.id, live.len - write);
        }

        live.len = write;
    }

    /// The slot must hold a live task allocated on this worker.
    pub(crate) unsafe fn task_from_index(&self, index: TaskHandle) -> &Task {
        self.pool.task_from_index(index)
    }

    pub(crate) fn task_to_ref(&self, task: &Task) -> TaskRef {
        TaskRef::new(self.id, self.pool.task_to_index(task))
    }

    fn random_victim(&self, num_workers: usize) -> WorkerId {
        let rng = unsafe { &mut *self.rng.get() };
        rng.usize(..num_workers) as WorkerId
    }
}

/// Resolve a task reference through its owning worker's pool.
pub(crate) fn task_from_ref(ctx: &JobSystemContext, task_ref: TaskRef) -> Option<&Task> {
    if task_ref.is_null() {
        return None;
    }

    let worker = ctx.worker(task_ref.worker());
    let task = unsafe { worker.task_from_index(task_ref.index()) };
    debug_assert_eq!(task.owning_worker, task_ref.worker(), "corrupted worker id");
    Some(task)
}

pub(crate) fn ref_of(ctx: &JobSystemContext, task: &Task) -> TaskRef {
    ctx.worker(task.owning_worker).task_to_ref(task)
}

/// Take one unit of work and run it. Returns false when nothing was found.
pub(crate) fn try_run_task(ctx: &JobSystemContext, worker: &WorkerState) -> bool {
    if let Some(task_ref) = find_deque_task(ctx, worker) {
        ctx.num_available_jobs.fetch_sub(1, Ordering::Relaxed);
        if let Some(task) = task_from_ref(ctx, task_ref) {
            run_task(ctx, task);
        }
        return true;
    }

    // Last resort for the main thread: its exclusive queue, so a wait on
    // the main thread cannot starve behind main-only work.
    if worker.is_main() {
        if let Some(task_ref) = ctx.main_queue.pop() {
            if let Some(task) = task_from_ref(ctx, task_ref) {
                run_task(ctx, task);
            }
            return true;
        }
    }

    false
}

fn find_deque_task(ctx: &JobSystemContext, worker: &WorkerState) -> Option<TaskRef> {
    if let Steal::Success(task_ref) = worker.normal_queue.pop() {
        return Some(task_ref);
    }

    if !worker.is_main() {
        if let Steal::Success(task_ref) = worker.worker_queue.pop() {
            return Some(task_ref);
        }
    }

    if let Some(task_ref) = steal_from(ctx, worker, worker.last_stolen_worker.get()) {
        return Some(task_ref);
    }

    let victim = worker.random_victim(ctx.num_workers());
    if let Some(task_ref) = steal_from(ctx, worker, victim) {
        worker.last_stolen_worker.set(victim);
        return Some(task_ref);
    }

    None
}

fn steal_from(ctx: &JobSystemContext, worker: &WorkerState, victim: WorkerId) -> Option<TaskRef> {
    if victim == worker.id {
        return None;
    }

    let other = ctx.worker(victim);

    if let Steal::Success(task_ref) = other.normal_queue.steal() {
        #[cfg(feature = "tracing")]
        trace!("worker {} stole {:?} from worker {}", worker.id, task_ref, victim);
        return Some(task_ref);
    }

    if !worker.is_main() {
        if let Steal::Success(task_ref) = other.worker_queue.steal() {
            #[cfg(feature = "tracing")]
            trace!("worker {} stole {:?} from worker {}", worker.id, task_ref, victim);
            return Some(task_ref);
        }
    }

    None
}

/// Run the task body, then the finish protocol. A panicking body aborts the
/// process; unwinding must never reach the deques.
pub(crate) fn run_task(ctx: &JobSystemContext, task: &Task) {
    spindle_utils::abort_on_panic(|| task.invoke());
    finish_task(ctx, task);
}

/// Drop the unfinished count; on reaching zero cascade into the parent,
/// publish the done state, hand every continuation to its queue and release
/// the intrinsic reference.
pub(crate) fn finish_task(ctx: &JobSystemContext, task: &Task) {
    let left = task.num_unfinished_tasks.fetch_sub(1, Ordering::Relaxed) - 1;

    if left != 0 {
        // Children still running; the last of them re-enters this path.
        return;
    }

    if let Some(parent) = task_from_ref(ctx, task.parent) {
        finish_task(ctx, parent);
    }

    // The next decrement publishes completion.
    fence(Ordering::Release);
    task.num_unfinished_tasks.fetch_sub(1, Ordering::Relaxed);

    let mut continuation_ref = task.first_continuation.load(Ordering::Relaxed);
    while let Some(continuation) = task_from_ref(ctx, continuation_ref) {
        let next = continuation.next_continuation.load(Ordering::Relaxed);
        let q_type = continuation.q_type.swap(QUEUE_TYPE_INVALID, Ordering::Relaxed);

        crate::api::task_submit(continuation, QueueType::from_raw(q_type));

        continuation_ref = next;
    }

    task.ref_count.fetch_sub(1, Ordering::Relaxed);
}
