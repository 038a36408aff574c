//! Shared polling scheduler.
//!
//! One master timer serves every registered job. Each tick it asks the
//! registry for due jobs, spawns one task per dispatched job and, when a job
//! finishes, publishes the result to every subscriber the job has *at that
//! moment*. The timer runs only while at least one job is registered.

use crate::cache::Cache;
use crate::clock::{Clock, DEFAULT_FRAME, DEFAULT_TICK, FixedIntervalClock, FrameAlignedClock};
use crate::error::SchedError;
use crate::job::{JobKey, JobSpec};
use crate::lock;
use crate::registry::{Dispatch, FairnessPolicy, PollingRegistry};
use crate::sink::{StateSink, sink_key};
use capy_exec::{ExecError, ScriptExecutor, ScriptOutput, split_command};
use log::{debug, info, trace};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Cached results live for half a job's interval, so a due job always
/// refreshes. Entries are keyed per job (command and interval).
const CACHE_TTL_DIVISOR: u32 = 2;

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub tick: Duration,
    pub frame: Duration,
    /// Medium/low jobs allowed in flight at once.
    pub max_concurrent: usize,
    /// Same, while animation mode is on.
    pub max_concurrent_animation: usize,
    pub fairness: FairnessPolicy,
    /// Route executions through the cache when one is provided.
    pub use_cache: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            frame: DEFAULT_FRAME,
            max_concurrent: 4,
            max_concurrent_animation: 2,
            fairness: FairnessPolicy::default(),
            use_cache: true,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SchedulerStats {
    pub active_polls: usize,
    pub total_subscribers: usize,
    pub animation_mode: bool,
    pub running: bool,
    pub ticks: u64,
    pub executions: u64,
    pub failures: u64,
    pub dropped_results: u64,
}

struct State {
    registry: PollingRegistry,
    master: Option<JoinHandle<()>>,
}

struct Inner {
    state: Mutex<State>,
    executor: Arc<dyn ScriptExecutor>,
    sink: Arc<dyn StateSink>,
    cache: Option<Arc<Cache<ScriptOutput>>>,
    config: SchedulerConfig,
    animation_mode: AtomicBool,
    fixed_clock: FixedIntervalClock,
    frame_clock: FrameAlignedClock,
    ticks: AtomicU64,
    executions: AtomicU64,
    failures: AtomicU64,
    dropped: AtomicU64,
}

/// Handle to the shared scheduler. Clones share the same registry.
#[derive(Clone)]
pub struct PollScheduler {
    inner: Arc<Inner>,
}

impl PollScheduler {
    pub fn new(
        config: SchedulerConfig,
        executor: Arc<dyn ScriptExecutor>,
        sink: Arc<dyn StateSink>,
        cache: Option<Arc<Cache<ScriptOutput>>>,
    ) -> Self {
        let cache = if config.use_cache { cache } else { None };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    registry: PollingRegistry::new(),
                    master: None,
                }),
                executor,
                sink,
                cache,
                fixed_clock: FixedIntervalClock::new(config.tick),
                frame_clock: FrameAlignedClock::new(config.frame),
                config,
                animation_mode: AtomicBool::new(false),
                ticks: AtomicU64::new(0),
                executions: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Register `subscriber` for `spec` and start the master timer if idle.
    ///
    /// Must be called from within a Tokio runtime. Dropping the returned
    /// handle unsubscribes.
    pub fn subscribe(&self, subscriber: &str, spec: JobSpec) -> Result<Subscription, SchedError> {
        spec.validate(subscriber)?;
        let key = spec.key();

        let handle = {
            let mut state = self.inner.state();
            let registration = state.registry.subscribe(subscriber, &spec);
            if registration.created {
                debug!("Job {} registered ({})", key, spec.priority);
            }
            if state.master.is_none() {
                state.master = Some(tokio::spawn(master_loop(Arc::downgrade(&self.inner))));
                info!("Master timer started");
            }
            registration.handle
        };

        let sink_key = sink_key(&key.command, subscriber);
        Ok(Subscription {
            rx: self.inner.sink.watch(&sink_key),
            subscriber: subscriber.to_string(),
            key,
            handle,
            sink_key,
            fallback: ScriptOutput::Unavailable,
            scheduler: Arc::downgrade(&self.inner),
        })
    }

    /// Remove `subscriber` from the job for `spec`, along with every handle
    /// it holds there. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, subscriber: &str, spec: &JobSpec) -> bool {
        self.inner.unsubscribe(subscriber, &spec.key())
    }

    /// Switch clock strategy and concurrency cap.
    pub fn set_animation_mode(&self, enabled: bool) {
        let was = self.inner.animation_mode.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            info!("Scheduler animation mode {}", if enabled { "on" } else { "off" });
        }
    }

    pub fn is_animation_mode(&self) -> bool {
        self.inner.animation_mode.load(Ordering::SeqCst)
    }

    /// Whether the master timer is active.
    pub fn is_running(&self) -> bool {
        self.inner.state().master.is_some()
    }

    pub fn job_keys(&self) -> Vec<JobKey> {
        self.inner
            .state()
            .registry
            .jobs()
            .map(|job| job.key().clone())
            .collect()
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state();
        SchedulerStats {
            active_polls: state.registry.len(),
            total_subscribers: state.registry.total_subscribers(),
            animation_mode: self.is_animation_mode(),
            running: state.master.is_some(),
            ticks: self.inner.ticks.load(Ordering::Relaxed),
            executions: self.inner.executions.load(Ordering::Relaxed),
            failures: self.inner.failures.load(Ordering::Relaxed),
            dropped_results: self.inner.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        lock(&self.state)
    }

    fn clock(&self) -> &dyn Clock {
        if self.animation_mode.load(Ordering::SeqCst) {
            &self.frame_clock
        } else {
            &self.fixed_clock
        }
    }

    fn concurrency_cap(&self) -> usize {
        if self.animation_mode.load(Ordering::SeqCst) {
            self.config.max_concurrent_animation
        } else {
            self.config.max_concurrent
        }
    }

    fn unsubscribe(&self, subscriber: &str, key: &JobKey) -> bool {
        self.detach(subscriber, key, |registry| registry.unsubscribe(subscriber, key))
    }

    fn release(&self, subscriber: &str, key: &JobKey, handle: u64) -> bool {
        self.detach(subscriber, key, |registry| {
            registry.release(subscriber, key, handle)
        })
    }

    /// Apply `remove` if `subscriber` is on the job for `key`, then stop the
    /// master timer or forget the sink slot when nothing needs them.
    fn detach<F>(&self, subscriber: &str, key: &JobKey, remove: F) -> bool
    where
        F: FnOnce(&mut PollingRegistry) -> bool,
    {
        let still_subscribed = {
            let mut state = self.state();
            let known = state
                .registry
                .get(key)
                .is_some_and(|job| job.has_subscriber(subscriber));
            if !known {
                return false;
            }

            if remove(&mut state.registry) {
                debug!("Job {} retired", key);
            }
            if state.registry.is_empty() {
                if let Some(master) = state.master.take() {
                    master.abort();
                    info!("No jobs left, master timer stopped");
                }
            }
            state
                .registry
                .get(key)
                .is_some_and(|job| job.has_subscriber(subscriber))
        };

        if !still_subscribed {
            self.sink.retire(&sink_key(&key.command, subscriber));
        }
        true
    }

    /// One master tick. Returns false when the timer should stop.
    fn tick(self: &Arc<Self>) -> bool {
        let now = Instant::now();
        let dispatches = {
            let mut state = self.state();
            if state.registry.is_empty() {
                state.master = None;
                return false;
            }
            state
                .registry
                .select_due(now, self.concurrency_cap(), self.config.fairness)
        };

        self.ticks.fetch_add(1, Ordering::Relaxed);
        if !dispatches.is_empty() {
            trace!("Tick dispatching {} jobs", dispatches.len());
        }

        for dispatch in dispatches {
            tokio::spawn(run_job(Arc::clone(self), dispatch));
        }
        true
    }

    async fn execute(&self, dispatch: &Dispatch) -> Result<ScriptOutput, ExecError> {
        let (script, args) = split_command(&dispatch.key.command).ok_or(ExecError::EmptyCommand)?;
        let run = || self.executor.execute(&script, &args);

        match &self.cache {
            Some(cache) => {
                let ttl = dispatch.key.interval / CACHE_TTL_DIVISOR;
                cache.get(&dispatch.key.to_string(), ttl, run).await
            }
            None => run().await,
        }
    }
}

async fn master_loop(weak: Weak<Inner>) {
    loop {
        let next_tick = {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if !inner.tick() {
                debug!("Registry empty, master timer exiting");
                return;
            }
            inner.clock().next_tick()
        };
        next_tick.await;
    }
}

async fn run_job(inner: Arc<Inner>, dispatch: Dispatch) {
    inner.executions.fetch_add(1, Ordering::Relaxed);
    let result = inner.execute(&dispatch).await;

    // Re-read membership: subscribers may have come or gone meanwhile.
    let subscribers = inner.state().registry.complete(dispatch.job_id);

    match (result, subscribers) {
        (Ok(output), Some(subscribers)) => {
            for subscriber in subscribers {
                inner
                    .sink
                    .publish(&sink_key(&dispatch.key.command, &subscriber), output.clone());
            }
        }
        (Ok(_), None) => {
            inner.dropped.fetch_add(1, Ordering::Relaxed);
            debug!("Job {} retired while running, result dropped", dispatch.key);
        }
        (Err(e), _) => {
            // Subscribers keep their last published value.
            inner.failures.fetch_add(1, Ordering::Relaxed);
            debug!("Job {} failed: {}", dispatch.key, e);
        }
    }
}

/// A widget's handle on one job.
///
/// Reads the latest value published for this subscriber. Dropping the
/// handle unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    rx: watch::Receiver<Option<ScriptOutput>>,
    subscriber: String,
    key: JobKey,
    handle: u64,
    sink_key: String,
    fallback: ScriptOutput,
    scheduler: Weak<Inner>,
}

impl Subscription {
    /// Value returned by [`Subscription::get`] while nothing usable was published.
    pub fn with_fallback(mut self, fallback: ScriptOutput) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }

    pub fn job_key(&self) -> &JobKey {
        &self.key
    }

    pub fn sink_key(&self) -> &str {
        &self.sink_key
    }

    /// Last published value, if any.
    pub fn latest(&self) -> Option<ScriptOutput> {
        self.rx.borrow().clone()
    }

    /// Last published value with data, else the fallback.
    pub fn get(&self) -> ScriptOutput {
        match self.latest() {
            Some(value) if value.is_available() => value,
            _ => self.fallback.clone(),
        }
    }

    /// Wait for the next publication.
    pub async fn changed(&mut self) -> Result<ScriptOutput, SchedError> {
        self.rx.changed().await.map_err(|_| SchedError::SinkClosed)?;
        Ok(self.get())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Let go of our reader first so the sink can forget an unread slot.
        drop(std::mem::replace(&mut self.rx, watch::channel(None).1));
        if let Some(inner) = self.scheduler.upgrade() {
            inner.release(&self.subscriber, &self.key, self.handle);
        }
    }
}
