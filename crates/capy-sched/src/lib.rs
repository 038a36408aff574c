//! capy-sched - Shared polling for shell widgets
//!
//! Widgets subscribe to helper scripts instead of running their own timers.
//! One master tick drives every distinct `(command, interval)` job:
//!
//! - `registry` - job deduplication, priorities, due selection
//! - `scheduler` - master tick, dispatch, publication to the state sink
//! - `cache` - adaptive TTL memoization with stale-on-error fallback
//! - `sink` - reactive key/value state store
//! - `batch` - coalesced render callbacks
//! - `clock` - fixed-interval and frame-aligned tick strategies
//! - `poll` / `hooks` - standalone periodic polls for simple widgets
//! - `profile` - performance levels and the `PerformanceHub` service object

pub mod batch;
pub mod cache;
pub mod clock;
pub mod error;
pub mod hooks;
pub mod job;
pub mod poll;
pub mod profile;
pub mod registry;
pub mod scheduler;
pub mod sink;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::{BatchStats, RenderBatcher, UpdateFn};
pub use cache::{Cache, CacheConfig, CacheStats};
pub use capy_exec::{ExecError, ScriptExecutor, ScriptOutput};
pub use clock::{Clock, FixedIntervalClock, FrameAlignedClock};
pub use error::SchedError;
pub use job::{JobKey, JobSpec, Priority};
pub use poll::Poll;
pub use profile::{HubConfig, HubStats, PerformanceHub, PerformanceLevel};
pub use registry::{FairnessPolicy, PollingRegistry};
pub use scheduler::{PollScheduler, SchedulerConfig, SchedulerStats, Subscription};
pub use sink::{StateChange, StateSink, StateStore, sink_key};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
