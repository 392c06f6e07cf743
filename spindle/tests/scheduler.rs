//! End-to-end scheduler tests.
//!
//! The scheduler context is process-global, so these tests take a shared
//! guard and run one at a time; the thread holding the guard is the main
//! thread for the duration of its test.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use spindle::{
    JobSystemCreateOptions, MemoryRequirements, QueueType, Splitter,
};
use spindle_utils::defer;

static SCHEDULER_GUARD: Mutex<()> = Mutex::new(());

fn with_scheduler(options: JobSystemCreateOptions, body: impl FnOnce()) {
    let _guard = SCHEDULER_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    spindle::initialize(&MemoryRequirements::new(options));
    defer! {
        spindle::shutdown();
    }

    body();
}

fn test_options(num_threads: u16) -> JobSystemCreateOptions {
    JobSystemCreateOptions {
        num_threads,
        job_steal_rng_seed: 0xDEC0DE,
        ..Default::default()
    }
}

#[test]
fn parallel_for_range_runs_every_index_exactly_once() {
    with_scheduler(test_options(4), || {
        const DATA_SIZE: usize = 1_000_000;
        const DATA_SPLIT: usize = 2_500;

        let hits: Vec<AtomicU32> = (0..DATA_SIZE).map(|_| AtomicU32::new(0)).collect();

        spindle::parallel_for_range(0, DATA_SIZE, Splitter::max_items_per_task(DATA_SPLIT), |range| {
            for i in range {
                hits[i].fetch_add(1, Ordering::Relaxed);
            }
        });

        assert!(hits.iter().all(|hit| hit.load(Ordering::Relaxed) == 1));
    });
}

#[test]
fn parallel_for_scales_array_in_bounded_chunks() {
    with_scheduler(test_options(4), || {
        const DATA_SIZE: usize = 100_000;
        const DATA_SPLIT: usize = 6;
        const MULTIPLIER: i32 = 5;

        let mut data: Vec<i32> = (0..DATA_SIZE as i32).collect();
        let max_chunk = AtomicUsize::new(0);

        spindle::parallel_for(&mut data, Splitter::max_items_per_task(DATA_SPLIT), |chunk| {
            max_chunk.fetch_max(chunk.len(), Ordering::Relaxed);
            for value in chunk {
                *value *= MULTIPLIER;
            }
        });

        assert!(max_chunk.load(Ordering::Relaxed) <= DATA_SPLIT);
        for (i, value) in data.iter().enumerate() {
            assert_eq!(*value, i as i32 * MULTIPLIER, "data incorrect at index {i}");
        }
    });
}

#[test]
fn parallel_invoke_halves_do_not_overlap() {
    with_scheduler(test_options(4), || {
        const DATA_SIZE: usize = 1_000_000;

        let mut data = vec![0u8; DATA_SIZE];
        let (left, right) = data.split_at_mut(DATA_SIZE / 2);

        spindle::parallel_invoke(
            || {
                for value in left {
                    *value += 1;
                }
            },
            || {
                for value in right {
                    *value += 1;
                }
            },
        );

        assert!(data.iter().all(|&value| value == 1));
    });
}

// Far more tasks than any worker's pool holds; completed cells must be
// reclaimed on allocation pressure or this never finishes.
#[test]
fn sixty_five_thousand_children_submitted_serially() {
    with_scheduler(test_options(4), || {
        const NUM_CHILDREN: usize = 65_000;

        let ran = AtomicU32::new(0);
        let root = unsafe { spindle::task_make_unchecked(|_| {}, None) };

        for _ in 0..NUM_CHILDREN {
            let child = unsafe {
                spindle::task_make_unchecked(
                    |_| {
                        ran.fetch_add(1, Ordering::Relaxed);
                    },
                    Some(root),
                )
            };
            spindle::task_submit(child, QueueType::Normal);
        }

        spindle::task_submit_and_wait(root, QueueType::Normal);
        assert_eq!(ran.load(Ordering::Relaxed), NUM_CHILDREN as u32);
    });
}

#[test]
fn sixty_five_thousand_leaves_via_recursive_splitting() {
    with_scheduler(test_options(4), || {
        const NUM_LEAVES: usize = 65_000;

        let ran = AtomicU32::new(0);

        // Granularity zero splits all the way down to single-index leaves.
        spindle::parallel_for_range(0, NUM_LEAVES, Splitter::max_items_per_task(0), |range| {
            ran.fetch_add(range.len() as u32, Ordering::Relaxed);
        });

        assert_eq!(ran.load(Ordering::Relaxed), NUM_LEAVES as u32);
    });
}

#[test]
fn external_reference_keeps_finished_task_observable() {
    with_scheduler(test_options(4), || {
        let task = spindle::task_make(|_| std::thread::sleep(Duration::from_millis(12)), None);

        spindle::task_inc_ref(task);
        spindle::task_submit(task, QueueType::Normal);

        while !spindle::task_is_done(task) {
            spindle::yield_time_slice();
        }

        // Allocate past the pool capacity so this worker's reclamation
        // sweep runs; the held reference must keep the cell pinned.
        std::thread::sleep(Duration::from_millis(12));
        for _ in 0..1_100 {
            let filler = spindle::task_make(|_| {}, None);
            spindle::task_submit_and_wait(filler, QueueType::Normal);
        }

        assert!(spindle::task_is_done(task));
        spindle::task_dec_ref(task);
    });
}

#[test]
fn main_queue_tasks_run_only_on_the_main_thread() {
    with_scheduler(test_options(4), || {
        const NUM_TASKS: u32 = 16;

        let ran = AtomicU32::new(0);
        let ran_on_main = AtomicU32::new(0);

        for _ in 0..NUM_TASKS {
            let task = unsafe {
                spindle::task_make_unchecked(
                    |_| {
                        ran.fetch_add(1, Ordering::Relaxed);
                        if spindle::is_main_thread() {
                            ran_on_main.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    None,
                )
            };
            spindle::task_submit(task, QueueType::Main);
        }

        spindle::tick_main_queue();

        assert_eq!(ran.load(Ordering::Relaxed), NUM_TASKS);
        assert_eq!(ran_on_main.load(Ordering::Relaxed), NUM_TASKS);
    });
}

#[test]
fn worker_queue_tasks_never_run_on_the_main_thread() {
    with_scheduler(test_options(4), || {
        const NUM_TASKS: u32 = 64;

        let ran = AtomicU32::new(0);
        let ran_on_main = AtomicU32::new(0);

        let root = unsafe { spindle::task_make_unchecked(|_| {}, None) };

        for _ in 0..NUM_TASKS {
            let task = unsafe {
                spindle::task_make_unchecked(
                    |_| {
                        if spindle::is_main_thread() {
                            ran_on_main.fetch_add(1, Ordering::Relaxed);
                        }
                        ran.fetch_add(1, Ordering::Relaxed);
                        // Give the waiting main thread every chance to
                        // wrongly pick one of these up.
                        std::thread::sleep(Duration::from_micros(200));
                    },
                    Some(root),
                )
            };
            spindle::task_submit(task, QueueType::Worker);
        }

        spindle::task_submit_and_wait(root, QueueType::Normal);

        assert_eq!(ran.load(Ordering::Relaxed), NUM_TASKS);
        assert_eq!(ran_on_main.load(Ordering::Relaxed), 0);
    });
}

#[test]
fn worker_queue_collapses_to_normal_with_a_single_worker() {
    with_scheduler(test_options(1), || {
        let ran = AtomicU32::new(0);

        let task = unsafe {
            spindle::task_make_unchecked(
                |_| {
                    ran.fetch_add(1, Ordering::Relaxed);
                },
                None,
            )
        };

        // Only one worker exists, so this must run on it (the main thread).
        spindle::task_submit_and_wait(task, QueueType::Worker);
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    });
}

#[test]
fn continuation_runs_after_antecedent_and_inherits_queue() {
    with_scheduler(test_options(4), || {
        let order = Mutex::new(Vec::new());
        let continuation_on_main = AtomicU32::new(0);

        let antecedent = unsafe {
            spindle::task_make_unchecked(
                |_| {
                    order.lock().unwrap().push("antecedent");
                },
                None,
            )
        };
        let continuation = unsafe {
            spindle::task_make_unchecked(
                |_| {
                    order.lock().unwrap().push("continuation");
                    if spindle::is_main_thread() {
                        continuation_on_main.fetch_add(1, Ordering::Relaxed);
                    }
                },
                None,
            )
        };

        spindle::task_inc_ref(continuation);
        spindle::task_add_continuation(antecedent, continuation, QueueType::Main);

        spindle::task_submit(antecedent, QueueType::Normal);
        spindle::wait_on_task(antecedent);

        // The continuation is published right after the antecedent's done
        // state; tick until it has run on this (the main) thread.
        while !spindle::task_is_done(continuation) {
            spindle::tick_main_queue();
            spindle::yield_time_slice();
        }

        assert_eq!(*order.lock().unwrap(), ["antecedent", "continuation"]);
        assert_eq!(continuation_on_main.load(Ordering::Relaxed), 1);
        spindle::task_dec_ref(continuation);
    });
}

#[test]
fn chained_continuations_all_run() {
    with_scheduler(test_options(4), || {
        const NUM_CONTINUATIONS: u32 = 8;

        let ran = AtomicU32::new(0);
        let antecedent = unsafe { spindle::task_make_unchecked(|_| {}, None) };

        let continuations: Vec<_> = (0..NUM_CONTINUATIONS)
            .map(|_| {
                let continuation = unsafe {
                    spindle::task_make_unchecked(
                        |_| {
                            ran.fetch_add(1, Ordering::Relaxed);
                        },
                        None,
                    )
                };
                spindle::task_inc_ref(continuation);
                spindle::task_add_continuation(antecedent, continuation, QueueType::Normal);
                continuation
            })
            .collect();

        spindle::task_submit_and_wait(antecedent, QueueType::Normal);

        for continuation in &continuations {
            while !spindle::task_is_done(continuation) {
                spindle::yield_time_slice();
            }
            spindle::task_dec_ref(continuation);
        }

        assert_eq!(ran.load(Ordering::Relaxed), NUM_CONTINUATIONS);
    });
}

#[test]
fn parent_completes_only_after_its_children() {
    with_scheduler(test_options(4), || {
        const NUM_CHILDREN: u32 = 8;

        let children_done = AtomicU32::new(0);

        let root = unsafe {
            spindle::task_make_unchecked(
                |root_task| {
                    for _ in 0..NUM_CHILDREN {
                        let child = unsafe {
                            spindle::task_make_unchecked(
                                |_| {
                                    std::thread::sleep(Duration::from_millis(1));
                                    children_done.fetch_add(1, Ordering::Release);
                                },
                                Some(root_task),
                            )
                        };
                        spindle::task_submit(child, QueueType::Normal);
                    }
                },
                None,
            )
        };

        spindle::task_submit_and_wait(root, QueueType::Normal);

        // The wait returned, so every child must have finished first.
        assert_eq!(children_done.load(Ordering::Acquire), NUM_CHILDREN);
    });
}

#[test]
fn parallel_reduce_sums_chunks() {
    with_scheduler(test_options(4), || {
        const DATA_SIZE: u64 = 100_000;

        let data: Vec<u64> = (0..DATA_SIZE).collect();
        let sum = spindle::parallel_reduce(
            &data,
            Splitter::max_items_per_task(1024),
            |chunk| chunk.iter().sum::<u64>(),
            |a, b| a + b,
        );

        assert_eq!(sum, Some(DATA_SIZE * (DATA_SIZE - 1) / 2));
        assert_eq!(
            spindle::parallel_reduce(&[] as &[u64], Splitter::max_items_per_task(8), |_| 0u64, |a, b| a + b),
            None
        );
    });
}

#[test]
fn user_thread_participates_after_setup() {
    let options = JobSystemCreateOptions {
        num_threads: 2,
        num_user_threads: 1,
        ..Default::default()
    };

    with_scheduler(options, || {
        let user = std::thread::spawn(|| {
            spindle::setup_user_thread();
            assert!(!spindle::is_main_thread());

            let ran = AtomicU32::new(0);
            let task = unsafe {
                spindle::task_make_unchecked(
                    |_| {
                        ran.fetch_add(1, Ordering::Relaxed);
                    },
                    None,
                )
            };
            spindle::task_submit_and_wait(task, QueueType::Normal);
            assert_eq!(ran.load(Ordering::Relaxed), 1);
        });

        user.join().unwrap();
    });
}

#[test]
fn queries_report_the_configuration() {
    with_scheduler(test_options(3), || {
        assert_eq!(spindle::num_workers(), 3);
        assert_eq!(spindle::current_worker(), 0);
        assert!(spindle::is_main_thread());
        assert!(!spindle::processor_architecture_name().is_empty());
    });
}

#[test]
fn task_data_round_trips_through_user_storage() {
    with_scheduler(test_options(2), || {
        let done = AtomicU32::new(0);

        let task = unsafe {
            spindle::task_make_unchecked(
                |task| {
                    let value = spindle::task_data_as::<u64>(task)
                        .map(|slot| unsafe { *slot })
                        .unwrap();
                    assert_eq!(value, 0xFEED_F00D);
                    done.fetch_add(1, Ordering::Relaxed);
                },
                None,
            )
        };

        spindle::task_set_data::<u64>(task, 0xFEED_F00D);
        spindle::task_submit_and_wait(task, QueueType::Normal);
        assert_eq!(done.load(Ordering::Relaxed), 1);
    });
}

#[test]
fn reinitialization_after_shutdown_is_permitted() {
    let _guard = SCHEDULER_GUARD.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

    for round in 0..3u32 {
        spindle::initialize(&MemoryRequirements::new(test_options(2)));

        let ran = AtomicU32::new(0);
        let task = unsafe {
            spindle::task_make_unchecked(
                |_| {
                    ran.fetch_add(1, Ordering::Relaxed);
                },
                None,
            )
        };
        spindle::task_submit_and_wait(task, QueueType::Normal);
        assert_eq!(ran.load(Ordering::Relaxed), 1, "round {round}");

        spindle::shutdown();
    }
}
