use std::mem::{align_of, size_of};
use std::sync::atomic::Ordering;

use crossbeam_utils::Backoff;

#[cfg(feature = "tracing")]
use log::trace;

use crate::queue::SpmcDeque;
use crate::system::{self, JobSystemContext};
use crate::task::{
    QueueType, Task, TaskData, TaskFn, TaskRef, WorkerId, NULL_TASK_REF, QUEUE_TYPE_INVALID,
};
use crate::worker::{self, WorkerState};

/// Number of workers the system was initialized with.
pub fn num_workers() -> u16 {
    system::context().num_workers() as u16
}

/// Id of the calling thread's worker. The main thread is always 0.
pub fn current_worker() -> WorkerId {
    system::current_worker_state().id
}

/// True when called on the thread that ran [`initialize`](crate::initialize).
pub fn is_main_thread() -> bool {
    system::current_worker_state().is_main()
}

/// Name of the CPU architecture this binary was compiled for.
pub fn processor_architecture_name() -> &'static str {
    std::env::consts::ARCH
}

/// CPU pause hint for spin-wait loops.
#[inline(always)]
pub fn pause_processor() {
    std::hint::spin_loop();
}

/// Ask the OS to hand the rest of this time slice to another thread.
#[inline(always)]
pub fn yield_time_slice() {
    std::thread::yield_now();
}

/// Create a task from a plain function pointer. Submit it later with
/// [`task_submit`].
///
/// The cell is allocated from the calling worker's pool; under allocation
/// pressure finished cells are reclaimed first, and as a last resort work
/// is run in place until one frees up.
pub fn task_make_fn(func: TaskFn, parent: Option<&Task>) -> &'static Task {
    let ctx = system::context();
    let worker = system::current_worker_state();
    let max_tasks = ctx.num_tasks_per_worker();

    if worker.num_live_tasks() == max_tasks {
        worker.collect_garbage();

        if worker.num_live_tasks() == max_tasks {
            ctx.wake_all_workers();
            while worker.num_live_tasks() == max_tasks {
                worker::try_run_task(ctx, worker);
                worker.collect_garbage();
            }
        }
    }

    let parent_ref = match parent {
        Some(parent) => worker::ref_of(ctx, parent),
        None => NULL_TASK_REF,
    };

    let task = worker.allocate_task(func, parent_ref);

    if let Some(parent) = parent {
        // Register the child before it can possibly be submitted, so the
        // parent cannot observe a zero count early.
        parent.num_unfinished_tasks.fetch_add(1, Ordering::Release);
    }

    task
}

/// Create a task from a closure stored inline in the task's user data.
///
/// The closure runs exactly once and is dropped when the body returns,
/// before the finish protocol publishes completion.
pub fn task_make<F>(func: F, parent: Option<&Task>) -> &'static Task
where
    F: FnOnce(&Task) + Send + 'static,
{
    unsafe { task_make_unchecked(func, parent) }
}

/// Lifetime-erased [`task_make`]; the composition primitive under the
/// parallel helpers.
///
/// # Safety
///
/// Everything the closure borrows must outlive the task's execution, for
/// example by waiting on the task (or an ancestor of it) before those
/// borrows end.
pub unsafe fn task_make_unchecked<F>(func: F, parent: Option<&Task>) -> &'static Task
where
    F: FnOnce(&Task) + Send,
{
    fn invoke<F: FnOnce(&Task)>(task: &Task) {
        // Move the closure out so it drops when the body returns.
        let func = unsafe { (task.private_data(align_of::<F>()) as *mut F).read() };
        func(task);
    }

    let task = task_make_fn(invoke::<F>, parent);
    let slot = task.reserve_private_data(size_of::<F>(), align_of::<F>());
    unsafe { (slot as *mut F).write(func) };

    task
}

/// Aligned view of the task's inline user storage.
pub fn task_get_data(task: &Task, alignment: usize) -> TaskData {
    task.user_data(alignment)
}

/// The user storage as a `T`, when it is large enough to hold one.
pub fn task_data_as<T>(task: &Task) -> Option<*mut T> {
    let data = task.user_data(align_of::<T>());
    (data.size >= size_of::<T>()).then(|| data.ptr as *mut T)
}

/// Copy `value` into the task's user storage. Anything stored previously is
/// overwritten without being dropped.
pub fn task_set_data<T>(task: &Task, value: T) {
    let slot =
        task_data_as::<T>(task).expect("value does not fit within the task's user storage");
    unsafe { slot.write(value) };
}

/// Drop the `T` stored with [`task_set_data`].
///
/// # Safety
///
/// The storage must currently hold a valid `T`.
pub unsafe fn task_destruct_data<T>(task: &Task) {
    let slot = task_data_as::<T>(task).expect("no storage for a T in this task");
    std::ptr::drop_in_place(slot);
}

/// Register `continuation` to be submitted to `queue` once `task` fully
/// finishes. Neither task may have been submitted yet, and the continuation
/// must not already hang off another task.
pub fn task_add_continuation(task: &Task, continuation: &Task, queue: QueueType) {
    assert!(
        task.q_type.load(Ordering::Relaxed) == QUEUE_TYPE_INVALID,
        "the task has already been submitted to a queue"
    );
    assert!(
        continuation.q_type.load(Ordering::Relaxed) == QUEUE_TYPE_INVALID,
        "the continuation has already been submitted to a queue"
    );
    assert!(
        continuation.next_continuation.load(Ordering::Relaxed).is_null(),
        "the continuation has already been added to another task"
    );

    let ctx = system::context();
    let new_head = worker::ref_of(ctx, continuation);

    continuation.q_type.store(queue as u8, Ordering::Relaxed);

    let mut head = task.first_continuation.load(Ordering::Relaxed);
    loop {
        continuation.next_continuation.store(head, Ordering::Relaxed);
        match task
            .first_continuation
            .compare_exchange(head, new_head, Ordering::Relaxed, Ordering::Relaxed)
        {
            Ok(_) => break,
            Err(actual) => head = actual,
        }
    }
}

/// Take an external reference, keeping the cell alive past completion. The
/// first call must happen before the task is submitted.
pub fn task_inc_ref(task: &Task) {
    let old = task.ref_count.fetch_add(1, Ordering::Relaxed);
    assert!(
        old >= 1 || task.q_type.load(Ordering::Relaxed) == QUEUE_TYPE_INVALID,
        "the first external reference must be taken before submission"
    );
}

/// Release a reference taken with [`task_inc_ref`], allowing the cell to be
/// garbage collected.
pub fn task_dec_ref(task: &Task) {
    let old = task.ref_count.fetch_sub(1, Ordering::Relaxed);
    assert!(old >= 1, "task_dec_ref called more times than task_inc_ref");
}

/// True once the task and all of its children have finished. After
/// submission this may only be polled while holding a reference from
/// [`task_inc_ref`].
#[inline(always)]
pub fn task_is_done(task: &Task) -> bool {
    task.num_unfinished_tasks.load(Ordering::Acquire) == -1
}

/// Submit the task to `queue`. A task may be submitted exactly once.
pub fn task_submit(task: &Task, queue: QueueType) {
    let ctx = system::context();
    let worker = system::current_worker_state();

    // With a single thread the worker queue is meaningless.
    let queue = if queue == QueueType::Worker && ctx.num_workers() == 1 {
        QueueType::Normal
    } else {
        queue
    };

    let previous = task.q_type.swap(queue as u8, Ordering::Relaxed);
    assert!(
        previous == QUEUE_TYPE_INVALID,
        "a task cannot be submitted to a queue multiple times"
    );

    let task_ref = worker::ref_of(ctx, task);

    #[cfg(feature = "tracing")]
    trace!("{:?} submitted to {:?} by worker {}", task_ref, queue, worker.id);

    match queue {
        QueueType::Normal => push_spinning(ctx, worker, &worker.normal_queue, task_ref),
        QueueType::Worker => push_spinning(ctx, worker, &worker.worker_queue, task_ref),
        QueueType::Main => {
            // Only the main thread drains this queue; until it ticks, all
            // we can do is run other work.
            let mut task_ref = task_ref;
            let backoff = Backoff::new();
            while let Err(back) = ctx.main_queue.push(task_ref) {
                task_ref = back;
                if !worker::try_run_task(ctx, worker) {
                    backoff.snooze();
                }
            }
        }
    }

    if queue != QueueType::Main {
        let num_pending = ctx.num_available_jobs.fetch_add(1, Ordering::Relaxed);
        if num_pending >= ctx.num_workers() as u32 {
            ctx.wake_all_workers();
        } else {
            ctx.wake_one_worker();
        }
    }
}

fn push_spinning(
    ctx: &JobSystemContext,
    worker: &WorkerState,
    queue: &SpmcDeque<TaskRef>,
    task_ref: TaskRef,
) {
    if let Err(back) = queue.push(task_ref) {
        // Deque is full; wake everyone and run work here until a slot
        // frees up.
        ctx.wake_all_workers();

        let mut task_ref = back;
        loop {
            match queue.push(task_ref) {
                Ok(()) => break,
                Err(back) => {
                    task_ref = back;
                    worker::try_run_task(ctx, worker);
                }
            }
        }
    }
}

/// Run tasks on the calling worker until `task` completes. The waiter never
/// blocks idly.
///
/// May only be called on the worker that owns the task, after the task has
/// been submitted.
pub fn wait_on_task(task: &Task) {
    let ctx = system::context();
    let worker = system::current_worker_state();

    assert!(
        task.q_type.load(Ordering::Relaxed) != QUEUE_TYPE_INVALID,
        "the task must be submitted before it can be waited on"
    );
    assert!(
        task.owning_worker == worker.id,
        "a task may only be waited on by the worker that created it"
    );

    ctx.wake_all_workers();

    let mut backoff = Backoff::new();
    while !task_is_done(task) {
        if worker::try_run_task(ctx, worker) {
            backoff = Backoff::new();
        } else {
            backoff.snooze();
        }
    }
}

/// [`task_submit`] followed by [`wait_on_task`].
pub fn task_submit_and_wait(task: &Task, queue: QueueType) {
    task_submit(task, queue);
    wait_on_task(task);
}

/// Run main-queue tasks while any remain and `condition` keeps returning
/// true. Main thread only.
pub fn tick_main_queue_while(mut condition: impl FnMut() -> bool) {
    let ctx = system::context();
    assert!(
        system::current_worker_state().is_main(),
        "tick_main_queue may only be called from the main thread"
    );

    while let Some(task_ref) = ctx.main_queue.pop() {
        if let Some(task) = worker::task_from_ref(ctx, task_ref) {
            worker::run_task(ctx, task);
        }

        if !condition() {
            break;
        }
    }
}

/// Drain the main queue. Main thread only.
pub fn tick_main_queue() {
    tick_main_queue_while(|| true);
}
