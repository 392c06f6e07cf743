//! Recursive fork-join helpers layered over the task API.
//!
//! Each driver submits a root task and waits on it before returning, so the
//! closures may borrow from the caller's stack even though the work fans
//! out across workers.

use std::ops::Range;
use std::sync::Mutex;

use crate::api::{task_make_unchecked, task_submit, task_submit_and_wait};
use crate::task::{QueueType, Task};

/// Raw pointer that may cross threads. The parallel drivers keep the
/// pointee alive until the whole task tree has been waited on.
struct SendPtr<T>(*mut T);

impl<T> Clone for SendPtr<T> {
    fn clone(&self) -> SendPtr<T> {
        SendPtr(self.0)
    }
}

impl<T> Copy for SendPtr<T> {}

unsafe impl<T> Send for SendPtr<T> {}
unsafe impl<T> Sync for SendPtr<T> {}

/// Controls how far the parallel drivers split a range.
#[derive(Debug, Clone, Copy)]
pub struct Splitter {
    max_count: usize,
}

impl Splitter {
    /// Split until no leaf holds more than `max_items` items.
    pub const fn max_items_per_task(max_items: usize) -> Splitter {
        Splitter { max_count: max_items }
    }

    /// Split the work into roughly `groups_per_worker` leaves per worker.
    ///
    /// A tiny range divided across many workers would otherwise split all
    /// the way down to single items, so the granularity is clamped to one.
    pub fn even_split(total_num_items: usize, groups_per_worker: usize) -> Splitter {
        let groups = groups_per_worker.max(1);
        let per_leaf = (total_num_items / groups) / crate::api::num_workers() as usize;
        Splitter {
            max_count: per_leaf.max(1),
        }
    }

    #[inline(always)]
    pub fn should_split(&self, count: usize) -> bool {
        count > self.max_count
    }
}

/// Recursively split `start..start + count` and run `func` on every leaf
/// range in parallel. Returns once every leaf has run.
pub fn parallel_for_range<F>(start: usize, count: usize, splitter: Splitter, func: F)
where
    F: Fn(Range<usize>) + Sync + Send,
{
    if count == 0 {
        return;
    }

    // `func` lives on this frame across the wait below.
    let root = unsafe { range_task(start, count, splitter, SendPtr(&func as *const F as *mut F), None) };
    task_submit_and_wait(root, QueueType::Normal);
}

/// Children inherit the queue their parent was submitted to.
///
/// Safety: `func` must stay alive until the returned task's subtree has
/// been waited on.
unsafe fn range_task<F>(
    start: usize,
    count: usize,
    splitter: Splitter,
    func: SendPtr<F>,
    parent: Option<&Task>,
) -> &'static Task
where
    F: Fn(Range<usize>) + Sync + Send,
{
    task_make_unchecked(
        move |task: &Task| {
            if count > 1 && splitter.should_split(count) {
                let left = count / 2;
                let right = count - left;
                let queue = task.queue_type();

                unsafe {
                    task_submit(range_task(start, left, splitter, func, Some(task)), queue);
                    task_submit(
                        range_task(start + left, right, splitter, func, Some(task)),
                        queue,
                    );
                }
            } else {
                let func = unsafe { &*(func.0 as *const F) };
                func(start..start + count);
            }
        },
        parent,
    )
}

/// Run `func` over disjoint chunks of `data` in parallel. No chunk is
/// larger than the splitter's granularity.
pub fn parallel_for<T, F>(data: &mut [T], splitter: Splitter, func: F)
where
    T: Send,
    F: Fn(&mut [T]) + Sync + Send,
{
    let base = SendPtr(data.as_mut_ptr());
    let len = data.len();

    parallel_for_range(0, len, splitter, move |range: Range<usize>| {
        let base = base;
        // Leaves cover disjoint index ranges, so the chunks never alias.
        let chunk =
            unsafe { std::slice::from_raw_parts_mut(base.0.add(range.start), range.len()) };
        func(chunk);
    });
}

/// Run two closures as parallel siblings; returns once both completed.
pub fn parallel_invoke<A, B>(a: A, b: B)
where
    A: FnOnce() + Send,
    B: FnOnce() + Send,
{
    let root = unsafe {
        task_make_unchecked(
            move |task: &Task| {
                let queue = task.queue_type();
                unsafe {
                    task_submit(task_make_unchecked(move |_: &Task| a(), Some(task)), queue);
                    task_submit(task_make_unchecked(move |_: &Task| b(), Some(task)), queue);
                }
            },
            None,
        )
    };

    task_submit_and_wait(root, QueueType::Normal);
}

/// Map disjoint chunks of `data` in parallel and fold the partial results.
/// Returns `None` for an empty slice.
pub fn parallel_reduce<T, R, M, F>(data: &[T], splitter: Splitter, map: M, fold: F) -> Option<R>
where
    T: Sync,
    R: Send,
    M: Fn(&[T]) -> R + Sync + Send,
    F: Fn(R, R) -> R + Sync + Send,
{
    if data.is_empty() {
        return None;
    }

    let out = Mutex::new(None);
    let base = SendPtr(data.as_ptr() as *mut T);

    parallel_for_range(0, data.len(), splitter, |range: Range<usize>| {
        let base = base;
        let chunk =
            unsafe { std::slice::from_raw_parts(base.0.add(range.start) as *const T, range.len()) };
        let partial = map(chunk);

        let mut slot = out.lock().unwrap();
        *slot = Some(match slot.take() {
            Some(acc) => fold(acc, partial),
            None => partial,
        });
    });

    out.into_inner().unwrap()
}
