//! Bounded queues backing the scheduler.
//!
//! Three flavors for three contention profiles: a mutex-guarded ring for the
//! low-traffic main-thread queue, an SPSC ring, and the work-stealing deque
//! every worker schedules through.

mod deque;
mod locked;
mod spsc;

pub use deque::{SpmcDeque, Steal};
pub use locked::LockedQueue;
pub use spsc::SpscRing;
