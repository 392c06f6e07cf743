use std::alloc::{Layout, LayoutError};
use std::cell::Cell;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU16, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;

use once_cell::sync::Lazy;

#[cfg(feature = "tracing")]
use log::trace;

use spindle_utils::abort_on_panic;

use crate::queue::LockedQueue;
use crate::task::{TaskRef, WorkerId, TASK_SIZE};
use crate::worker::{self, WorkerState};

/// Runtime configuration for the scheduler.
#[derive(Debug, Clone, Copy)]
pub struct JobSystemCreateOptions {
    /// Worker thread count including the main thread; 0 means one per
    /// hardware thread.
    pub num_threads: u16,
    /// Slots reserved for externally created threads that will call
    /// [`setup_user_thread`].
    pub num_user_threads: u16,
    /// Capacity of the main-thread queue. Must be a power of two.
    pub main_queue_size: u16,
    /// Capacity of each worker's NORMAL deque. Must be a power of two.
    pub normal_queue_size: u16,
    /// Capacity of each worker's WORKER deque. Must be a power of two.
    pub worker_queue_size: u16,
    /// Seed for the per-worker steal-victim generators; a fixed seed gives
    /// a deterministic stealing order.
    pub job_steal_rng_seed: u64,
}

impl Default for JobSystemCreateOptions {
    fn default() -> JobSystemCreateOptions {
        JobSystemCreateOptions {
            num_threads: 0,
            num_user_threads: 0,
            main_queue_size: 256,
            normal_queue_size: 1024,
            worker_queue_size: 32,
            job_steal_rng_seed: 0,
        }
    }
}

impl JobSystemCreateOptions {
    pub(crate) fn worker_count(&self) -> u16 {
        let owned = if self.num_threads != 0 {
            self.num_threads
        } else {
            num_system_threads() as u16
        };
        owned + self.num_user_threads
    }

    pub(crate) fn tasks_per_worker(&self) -> u16 {
        let total = self.normal_queue_size as u32 + self.worker_queue_size as u32;
        assert!(total < u16::MAX as u32, "too many task cells per worker");
        total as u16
    }
}

/// Memory footprint of a configuration.
///
/// Pure accounting, no global state; `initialize` performs the equivalent
/// allocations itself.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRequirements {
    pub(crate) options: JobSystemCreateOptions,
    pub byte_size: usize,
    pub alignment: usize,
}

impl MemoryRequirements {
    pub fn new(options: JobSystemCreateOptions) -> MemoryRequirements {
        assert!(
            options.main_queue_size.is_power_of_two(),
            "main queue size must be a power of two"
        );
        assert!(
            options.normal_queue_size.is_power_of_two(),
            "normal queue size must be a power of two"
        );
        assert!(
            options.worker_queue_size.is_power_of_two(),
            "worker queue size must be a power of two"
        );

        let num_threads = options.worker_count() as usize;
        let tasks_per_worker = options.tasks_per_worker() as usize;
        let total_tasks = num_threads * tasks_per_worker;

        let mut layout = Layout::new::<JobSystemContext>();
        layout = extend(layout, Layout::array::<WorkerState>(num_threads));
        // Task slabs.
        layout = extend(layout, Layout::from_size_align(total_tasks * TASK_SIZE, TASK_SIZE));
        // Main queue slots.
        layout = extend(layout, Layout::array::<TaskRef>(options.main_queue_size as usize));
        // Deque slots, one packed reference each.
        layout = extend(layout, Layout::array::<u32>(total_tasks));
        // Live-task tables.
        layout = extend(layout, Layout::array::<u16>(total_tasks));

        MemoryRequirements {
            options,
            byte_size: layout.size(),
            alignment: layout.align(),
        }
    }
}

impl Default for MemoryRequirements {
    fn default() -> MemoryRequirements {
        MemoryRequirements::new(JobSystemCreateOptions::default())
    }
}

fn extend(layout: Layout, next: Result<Layout, LayoutError>) -> Layout {
    layout
        .extend(next.expect("memory requirements overflow"))
        .expect("memory requirements overflow")
        .0
}

/// Proof that [`initialize`] ran; carries the number of threads the system
/// owns, the main thread included.
#[derive(Debug, Clone, Copy)]
pub struct InitializationToken {
    pub num_owned_workers: u16,
}

struct InitLock {
    mutex: Mutex<()>,
    cv: Condvar,
    num_workers_ready: AtomicU32,
}

pub(crate) struct JobSystemContext {
    workers: Box<[WorkerState]>,
    num_owned_workers: u16,
    num_user_threads_setup: AtomicU16,
    num_tasks_per_worker: u16,
    init_lock: InitLock,

    pub(crate) main_queue: LockedQueue<TaskRef>,
    worker_sleep_mutex: Mutex<()>,
    worker_sleep_cv: Condvar,
    pub(crate) num_available_jobs: AtomicU32,
    pub(crate) is_running: AtomicBool,

    join_handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl JobSystemContext {
    #[inline(always)]
    pub(crate) fn num_workers(&self) -> usize {
        self.workers.len()
    }

    #[inline(always)]
    pub(crate) fn num_tasks_per_worker(&self) -> usize {
        self.num_tasks_per_worker as usize
    }

    #[inline(always)]
    pub(crate) fn worker(&self, id: WorkerId) -> &WorkerState {
        &self.workers[id as usize]
    }

    #[inline(always)]
    pub(crate) fn wake_all_workers(&self) {
        self.worker_sleep_cv.notify_all();
    }

    #[inline(always)]
    pub(crate) fn wake_one_worker(&self) {
        self.worker_sleep_cv.notify_one();
    }

    /// Block until work may be available. Both conditions are re-checked
    /// under the mutex so a signal sent after the counter moves is never
    /// lost.
    pub(crate) fn sleep(&self) {
        if self.is_running.load(Ordering::Relaxed) {
            crate::api::pause_processor();

            if self.num_available_jobs.load(Ordering::Relaxed) == 0 {
                let guard = self.worker_sleep_mutex.lock().unwrap();
                let _guard = self
                    .worker_sleep_cv
                    .wait_while(guard, |_| {
                        self.is_running.load(Ordering::Relaxed)
                            && self.num_available_jobs.load(Ordering::Relaxed) == 0
                    })
                    .unwrap();
            }
        }
    }
}

static JOB_SYSTEM: AtomicPtr<JobSystemContext> = AtomicPtr::new(ptr::null_mut());

thread_local! {
    static CURRENT_WORKER: Cell<*const WorkerState> = const { Cell::new(ptr::null()) };
}

pub(crate) fn context() -> &'static JobSystemContext {
    let ptr = JOB_SYSTEM.load(Ordering::Acquire);
    assert!(!ptr.is_null(), "job system is not initialized");
    unsafe { &*ptr }
}

pub(crate) fn current_worker_state() -> &'static WorkerState {
    let ptr = CURRENT_WORKER.with(|current| current.get());
    assert!(!ptr.is_null(), "this thread was not registered with the job system");
    unsafe { &*ptr }
}

/// Number of hardware threads. Callable before [`initialize`], by any
/// thread.
pub fn num_system_threads() -> usize {
    static NUM_SYSTEM_THREADS: Lazy<usize> = Lazy::new(|| num_cpus::get().max(1));
    *NUM_SYSTEM_THREADS
}

/// Set up the scheduler and spawn its worker threads. The calling thread
/// becomes worker 0, the main thread.
pub fn initialize(requirements: &MemoryRequirements) -> InitializationToken {
    assert!(
        JOB_SYSTEM.load(Ordering::Acquire).is_null(),
        "job system is already initialized"
    );

    let options = &requirements.options;
    let num_threads = options.worker_count();
    let owned_threads = num_threads - options.num_user_threads;
    let tasks_per_worker = options.tasks_per_worker();

    assert!(owned_threads >= 1, "the main thread must be one of the owned workers");

    let workers: Box<[WorkerState]> = (0..num_threads)
        .map(|id| {
            WorkerState::new(
                id,
                options.normal_queue_size as usize,
                options.worker_queue_size as usize,
                tasks_per_worker as usize,
                // Distinct stream per worker, deterministic for a fixed seed.
                options.job_steal_rng_seed
                    ^ (id as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15),
            )
        })
        .collect();

    let context = Box::new(JobSystemContext {
        workers,
        num_owned_workers: owned_threads,
        num_user_threads_setup: AtomicU16::new(0),
        num_tasks_per_worker: tasks_per_worker,
        init_lock: InitLock {
            mutex: Mutex::new(()),
            cv: Condvar::new(),
            // The main thread counts itself.
            num_workers_ready: AtomicU32::new(1),
        },
        main_queue: LockedQueue::with_capacity(options.main_queue_size as usize),
        worker_sleep_mutex: Mutex::new(()),
        worker_sleep_cv: Condvar::new(),
        num_available_jobs: AtomicU32::new(0),
        is_running: AtomicBool::new(false),
        join_handles: Mutex::new(Vec::new()),
    });

    let ctx_ptr = Box::into_raw(context);
    JOB_SYSTEM.store(ctx_ptr, Ordering::Release);
    let ctx: &'static JobSystemContext = unsafe { &*ctx_ptr };

    CURRENT_WORKER.with(|current| current.set(ctx.worker(0) as *const WorkerState));

    {
        let mut handles = ctx.join_handles.lock().unwrap();
        for worker_id in 1..owned_threads {
            let handle = thread::Builder::new()
                .name(format!("spindle-worker-{worker_id}"))
                .spawn(move || abort_on_panic(|| worker_thread_main(worker_id)))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
    }

    #[cfg(feature = "tracing")]
    trace!(
        "job system initialized with {} workers ({} owned)",
        num_threads,
        owned_threads
    );

    InitializationToken {
        num_owned_workers: owned_threads,
    }
}

fn worker_thread_main(worker_id: WorkerId) {
    let ctx = context();
    let worker = ctx.worker(worker_id);
    CURRENT_WORKER.with(|current| current.set(worker as *const WorkerState));

    wait_for_all_threads_ready(ctx);

    #[cfg(feature = "tracing")]
    trace!("worker {} is running", worker_id);

    while ctx.is_running.load(Ordering::Relaxed) {
        if !worker::try_run_task(ctx, worker) {
            ctx.sleep();
        }
    }

    #[cfg(feature = "tracing")]
    trace!("worker {} is exiting", worker_id);
}

fn wait_for_all_threads_ready(ctx: &JobSystemContext) {
    let num_workers = ctx.num_workers() as u32;
    let ready = ctx.init_lock.num_workers_ready.fetch_add(1, Ordering::Relaxed) + 1;

    if ready == num_workers {
        // Raise the flag under the mutex so a worker between its predicate
        // check and the actual wait cannot miss it.
        let guard = ctx.init_lock.mutex.lock().unwrap();
        ctx.is_running.store(true, Ordering::Relaxed);
        drop(guard);
        ctx.init_lock.cv.notify_all();
    } else {
        let guard = ctx.init_lock.mutex.lock().unwrap();
        let _guard = ctx
            .init_lock
            .cv
            .wait_while(guard, |_| !ctx.is_running.load(Ordering::Relaxed))
            .unwrap();
    }
}

/// Register an externally created thread with the scheduler. Must be called
/// exactly once per reserved user-thread slot, after [`initialize`], and
/// never from a thread the system already owns.
pub fn setup_user_thread() {
    let ctx = context();
    let user_thread_id = ctx.num_owned_workers
        + ctx.num_user_threads_setup.fetch_add(1, Ordering::Relaxed);

    assert!(
        (user_thread_id as usize) < ctx.num_workers(),
        "too many calls to setup_user_thread"
    );

    let worker = ctx.worker(user_thread_id);
    CURRENT_WORKER.with(|current| current.set(worker as *const WorkerState));

    wait_for_all_threads_ready(ctx);
}

/// Stop the workers, join them and tear the system down. Main thread only.
/// The system may be initialized again afterwards.
pub fn shutdown() {
    let ctx = context();
    assert!(
        current_worker_state().is_main(),
        "shutdown may only be called by the main thread"
    );

    // Let the startup barrier fully release first, or its last arrival
    // would raise the flag again after it is lowered here. With a single
    // worker the barrier never runs.
    if ctx.num_workers() > 1 {
        while !ctx.is_running.load(Ordering::Relaxed) {
            crate::api::yield_time_slice();
        }
    }

    ctx.is_running.store(false, Ordering::Relaxed);

    // One last wake so every sleeper observes the flag.
    ctx.wake_all_workers();

    let handles = std::mem::take(&mut *ctx.join_handles.lock().unwrap());
    for handle in handles {
        handle.join().expect("worker thread panicked");
    }

    CURRENT_WORKER.with(|current| current.set(ptr::null()));
    let ctx_ptr = JOB_SYSTEM.swap(ptr::null_mut(), Ordering::AcqRel);
    drop(unsafe { Box::from_raw(ctx_ptr) });

    #[cfg(feature = "tracing")]
    trace!("job system shut down");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_requirements_scale_with_workers() {
        let small = MemoryRequirements::new(JobSystemCreateOptions {
            num_threads: 2,
            ..Default::default()
        });
        let large = MemoryRequirements::new(JobSystemCreateOptions {
            num_threads: 8,
            ..Default::default()
        });

        assert!(small.byte_size > 0);
        assert!(large.byte_size > small.byte_size);
        assert!(small.alignment >= TASK_SIZE);
    }

    #[test]
    fn worker_count_includes_user_threads() {
        let options = JobSystemCreateOptions {
            num_threads: 3,
            num_user_threads: 2,
            ..Default::default()
        };
        assert_eq!(options.worker_count(), 5);
        assert_eq!(options.tasks_per_worker(), 1024 + 32);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn queue_sizes_must_be_powers_of_two() {
        MemoryRequirements::new(JobSystemCreateOptions {
            normal_queue_size: 1000,
            ..Default::default()
        });
    }

    #[test]
    fn num_system_threads_is_nonzero() {
        assert!(num_system_threads() >= 1);
    }
}
