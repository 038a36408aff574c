//! Tick strategies for the master timer and render flushes.

use futures_util::future::BoxFuture;
use std::time::Duration;
use tokio::time::{Instant, sleep, sleep_until};

/// Master tick period in normal mode.
pub const DEFAULT_TICK: Duration = Duration::from_millis(50);
/// Frame period in animation mode (~60 Hz).
pub const DEFAULT_FRAME: Duration = Duration::from_millis(16);

/// Decides when the next tick happens.
pub trait Clock: Send + Sync {
    /// Future resolving at the next tick.
    fn next_tick(&self) -> BoxFuture<'static, ()>;

    /// Nominal distance between ticks.
    fn period(&self) -> Duration;
}

/// Ticks a fixed delay after the previous tick finished.
#[derive(Clone, Debug)]
pub struct FixedIntervalClock {
    period: Duration,
}

impl FixedIntervalClock {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl Default for FixedIntervalClock {
    fn default() -> Self {
        Self::new(DEFAULT_TICK)
    }
}

impl Clock for FixedIntervalClock {
    fn next_tick(&self) -> BoxFuture<'static, ()> {
        Box::pin(sleep(self.period))
    }

    fn period(&self) -> Duration {
        self.period
    }
}

/// Ticks on frame boundaries counted from a fixed origin, so work lands on
/// the same cadence as the compositor's frames instead of drifting.
#[derive(Clone, Debug)]
pub struct FrameAlignedClock {
    frame: Duration,
    origin: Instant,
}

impl FrameAlignedClock {
    pub fn new(frame: Duration) -> Self {
        Self {
            frame: frame.max(Duration::from_millis(1)),
            origin: Instant::now(),
        }
    }

    /// First frame boundary strictly after `now`.
    pub fn next_frame_at(&self, now: Instant) -> Instant {
        let frame_ns = self.frame.as_nanos();
        let elapsed_ns = now.saturating_duration_since(self.origin).as_nanos();
        let next_ns = (elapsed_ns / frame_ns + 1) * frame_ns;
        self.origin + Duration::from_nanos(u64::try_from(next_ns).unwrap_or(u64::MAX))
    }
}

impl Default for FrameAlignedClock {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME)
    }
}

impl Clock for FrameAlignedClock {
    fn next_tick(&self) -> BoxFuture<'static, ()> {
        Box::pin(sleep_until(self.next_frame_at(Instant::now())))
    }

    fn period(&self) -> Duration {
        self.frame
    }
}
