//! Fork-join task scheduler.
//!
//! Short-lived tasks run across a fixed pool of worker threads. Every
//! worker owns two lock-free work-stealing deques and a slab of 128-byte
//! task cells; an idle worker steals from the victim it last had luck with,
//! then from a random one, and sleeps on a condvar when the system runs
//! dry. A parent task completes only after all of its children, and
//! continuations are handed to their queues once the task they hang off
//! fully finishes.
//!
//! The thread calling [`initialize`] becomes worker 0, the main thread.
//! Tasks submitted to [`QueueType::Main`] run only there, driven by
//! [`tick_main_queue`] or while the main thread waits on a task.
//!
//! ```no_run
//! spindle::initialize(&spindle::MemoryRequirements::default());
//!
//! let mut data = vec![0u32; 1 << 20];
//! spindle::parallel_for(&mut data, spindle::Splitter::even_split(data.len(), 2), |chunk| {
//!     for value in chunk {
//!         *value += 1;
//!     }
//! });
//!
//! spindle::shutdown();
//! ```

mod api;
mod parallel;
mod pool;
mod queue;
mod system;
mod task;
mod worker;

pub use api::{
    current_worker, is_main_thread, num_workers, pause_processor, processor_architecture_name,
    task_add_continuation, task_data_as, task_dec_ref, task_destruct_data, task_get_data,
    task_inc_ref, task_is_done, task_make, task_make_fn, task_make_unchecked, task_set_data,
    task_submit, task_submit_and_wait, tick_main_queue, tick_main_queue_while, wait_on_task,
    yield_time_slice,
};
pub use parallel::{
    parallel_for, parallel_for_range, parallel_invoke, parallel_reduce, Splitter,
};
pub use queue::{LockedQueue, SpmcDeque, SpscRing, Steal};
pub use system::{
    initialize, num_system_threads, setup_user_thread, shutdown, InitializationToken,
    JobSystemCreateOptions, MemoryRequirements,
};
pub use task::{QueueType, Task, TaskData, TaskFn, TaskRef, WorkerId, TASK_USER_DATA_SIZE};
