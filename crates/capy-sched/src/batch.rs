//! Render batching.
//!
//! Widgets hand their UI updates to the batcher instead of applying them
//! inline. Updates queued close together are flushed together, once per
//! task yield (or once per frame in animation mode).

use crate::clock::{Clock, FrameAlignedClock};
use crate::lock;
use log::{debug, warn};
use serde::Serialize;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;

/// Callbacks run per batch inside one flush.
pub const BATCH_SIZE: usize = 5;

/// A queued UI update.
pub type UpdateFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Debug, Default, Serialize)]
pub struct BatchStats {
    pub pending: usize,
    pub flushes: u64,
    pub executed: u64,
    pub panics: u64,
    pub animation_mode: bool,
}

#[derive(Default)]
struct Pending {
    updates: Vec<UpdateFn>,
    scheduled: bool,
}

struct Inner {
    pending: Mutex<Pending>,
    animation_mode: AtomicBool,
    frame_clock: FrameAlignedClock,
    flushes: AtomicU64,
    executed: AtomicU64,
    panics: AtomicU64,
}

#[derive(Clone)]
pub struct RenderBatcher {
    inner: Arc<Inner>,
}

impl RenderBatcher {
    pub fn new(frame: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(Pending::default()),
                animation_mode: AtomicBool::new(false),
                frame_clock: FrameAlignedClock::new(frame),
                flushes: AtomicU64::new(0),
                executed: AtomicU64::new(0),
                panics: AtomicU64::new(0),
            }),
        }
    }

    /// Queue `update` for the next flush.
    pub fn schedule_update(&self, update: UpdateFn) {
        let needs_flush = {
            let mut pending = lock(&self.inner.pending);
            pending.updates.push(update);
            !std::mem::replace(&mut pending.scheduled, true)
        };

        if needs_flush {
            self.spawn_flush();
        }
    }

    pub fn schedule<F>(&self, update: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.schedule_update(Arc::new(update));
    }

    /// Wrap `render` so every call goes through the batcher.
    pub fn deferred<T, F>(&self, render: F) -> Box<dyn Fn(T) + Send + Sync>
    where
        T: Send + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let batcher = self.clone();
        let render = Arc::new(render);
        Box::new(move |value: T| {
            let render = Arc::clone(&render);
            let slot = Mutex::new(Some(value));
            batcher.schedule(move || {
                if let Some(value) = lock(&slot).take() {
                    render(value);
                }
            });
        })
    }

    fn spawn_flush(&self) {
        // Without a runtime the owner flushes by hand.
        let Ok(handle) = Handle::try_current() else {
            return;
        };

        let batcher = self.clone();
        let wait = if self.is_animation_mode() {
            Some(self.inner.frame_clock.next_tick())
        } else {
            None
        };

        handle.spawn(async move {
            match wait {
                Some(frame) => frame.await,
                None => tokio::task::yield_now().await,
            }
            batcher.flush();
        });
    }

    /// Run everything queued so far. Returns how many updates completed.
    ///
    /// Updates queued by a running update land in the next flush.
    pub fn flush(&self) -> usize {
        let updates = {
            let mut pending = lock(&self.inner.pending);
            pending.scheduled = false;
            std::mem::take(&mut pending.updates)
        };
        if updates.is_empty() {
            return 0;
        }

        self.inner.flushes.fetch_add(1, Ordering::Relaxed);
        let mut completed = 0;
        for batch in updates.chunks(BATCH_SIZE) {
            for update in batch {
                match catch_unwind(AssertUnwindSafe(|| update())) {
                    Ok(()) => completed += 1,
                    Err(_) => {
                        self.inner.panics.fetch_add(1, Ordering::Relaxed);
                        warn!("Render update panicked, skipping");
                    }
                }
            }
        }

        self.inner
            .executed
            .fetch_add(completed as u64, Ordering::Relaxed);
        debug!("Flushed {}/{} render updates", completed, updates.len());
        completed
    }

    pub fn set_animation_mode(&self, enabled: bool) {
        self.inner.animation_mode.store(enabled, Ordering::SeqCst);
    }

    pub fn is_animation_mode(&self) -> bool {
        self.inner.animation_mode.load(Ordering::SeqCst)
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.inner.pending).updates.len()
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            pending: self.pending_len(),
            flushes: self.inner.flushes.load(Ordering::Relaxed),
            executed: self.inner.executed.load(Ordering::Relaxed),
            panics: self.inner.panics.load(Ordering::Relaxed),
            animation_mode: self.is_animation_mode(),
        }
    }
}

impl Default for RenderBatcher {
    fn default() -> Self {
        Self::new(crate::clock::DEFAULT_FRAME)
    }
}
