//! Polling registry: deduplicated jobs and due-job selection.
//!
//! Jobs are kept in registration order. The registry itself never runs
//! anything; the scheduler asks it which jobs to dispatch on each tick and
//! reports back when a dispatched job completes.

use crate::job::{JobKey, JobSpec, Priority};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::time::Instant;

/// How due medium/low jobs are ordered when the concurrency cap bites.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FairnessPolicy {
    /// Registration order. Under sustained overload, later jobs can starve.
    InsertionOrder,
    /// Longest-waiting job first, so deferred jobs move to the front.
    #[default]
    OldestFirst,
}

/// Live handles of one subscriber, with the priority each one asked for.
type Handles = BTreeMap<u64, Priority>;

/// One distinct recurring unit of work.
///
/// Its priority is the most urgent one among the live handles, so it drops
/// back once the handle that escalated it is released.
#[derive(Debug)]
pub struct PollJob {
    id: u64,
    key: JobKey,
    priority: Priority,
    subscribers: BTreeMap<String, Handles>,
    last_run: Option<Instant>,
    in_flight: bool,
    runs: u64,
}

impl PollJob {
    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn subscribers(&self) -> impl Iterator<Item = &str> {
        self.subscribers.keys().map(String::as_str)
    }

    pub fn has_subscriber(&self, subscriber: &str) -> bool {
        self.subscribers.contains_key(subscriber)
    }

    /// Handles held across all subscribers.
    pub fn handle_count(&self) -> usize {
        self.subscribers.values().map(BTreeMap::len).sum()
    }

    pub fn last_run(&self) -> Option<Instant> {
        self.last_run
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Number of dispatches so far.
    pub fn runs(&self) -> u64 {
        self.runs
    }

    fn is_due(&self, now: Instant) -> bool {
        match self.last_run {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.key.interval,
        }
    }

    fn refresh_priority(&mut self) {
        let Some(priority) = self
            .subscribers
            .values()
            .flat_map(|handles| handles.values().copied())
            .min()
        else {
            return;
        };

        if priority != self.priority {
            debug!("Job {} priority {} -> {}", self.key, self.priority, priority);
            self.priority = priority;
        }
    }
}

/// Outcome of [`PollingRegistry::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Registration {
    /// Identifies this subscription when it is released.
    pub handle: u64,
    /// A new job was created for it.
    pub created: bool,
}

/// A job handed to the scheduler for execution.
#[derive(Clone, Debug)]
pub struct Dispatch {
    pub job_id: u64,
    pub key: JobKey,
    pub priority: Priority,
}

#[derive(Debug, Default)]
pub struct PollingRegistry {
    jobs: Vec<PollJob>,
    next_id: u64,
    next_handle: u64,
}

impl PollingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handle for `subscriber` to the job for `spec`, creating the job
    /// if needed. The same subscriber may hold several handles.
    pub fn subscribe(&mut self, subscriber: &str, spec: &JobSpec) -> Registration {
        self.next_handle += 1;
        let handle = self.next_handle;
        let key = spec.key();

        if let Some(job) = self.jobs.iter_mut().find(|job| job.key == key) {
            job.subscribers
                .entry(subscriber.to_string())
                .or_default()
                .insert(handle, spec.priority);
            job.refresh_priority();
            return Registration {
                handle,
                created: false,
            };
        }

        self.next_id += 1;
        self.jobs.push(PollJob {
            id: self.next_id,
            key,
            priority: spec.priority,
            subscribers: BTreeMap::from([(
                subscriber.to_string(),
                BTreeMap::from([(handle, spec.priority)]),
            )]),
            last_run: None,
            in_flight: false,
            runs: 0,
        });
        Registration {
            handle,
            created: true,
        }
    }

    /// Remove `subscriber` and all of its handles from the job for `key`.
    /// Returns true when that emptied and retired the job.
    pub fn unsubscribe(&mut self, subscriber: &str, key: &JobKey) -> bool {
        let Some(idx) = self.position(key) else {
            return false;
        };

        self.jobs[idx].subscribers.remove(subscriber);
        self.settle(idx)
    }

    /// Drop one handle of `subscriber`. The subscriber stays registered
    /// while it holds other handles. Returns true when the job was retired.
    pub fn release(&mut self, subscriber: &str, key: &JobKey, handle: u64) -> bool {
        let Some(idx) = self.position(key) else {
            return false;
        };

        let job = &mut self.jobs[idx];
        if let Some(handles) = job.subscribers.get_mut(subscriber) {
            handles.remove(&handle);
            if handles.is_empty() {
                job.subscribers.remove(subscriber);
            }
        }
        self.settle(idx)
    }

    fn position(&self, key: &JobKey) -> Option<usize> {
        self.jobs.iter().position(|job| &job.key == key)
    }

    /// Retire the job at `idx` if nobody is left, else recompute its priority.
    fn settle(&mut self, idx: usize) -> bool {
        if self.jobs[idx].subscribers.is_empty() {
            self.jobs.remove(idx);
            return true;
        }
        self.jobs[idx].refresh_priority();
        false
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn total_subscribers(&self) -> usize {
        self.jobs.iter().map(|job| job.subscribers.len()).sum()
    }

    pub fn get(&self, key: &JobKey) -> Option<&PollJob> {
        self.jobs.iter().find(|job| &job.key == key)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &PollJob> {
        self.jobs.iter()
    }

    /// Pick the jobs to run at `now` and mark them in flight.
    ///
    /// Every due high-priority job is selected. Medium/low jobs fill at most
    /// `cap` slots, counting ones still in flight from earlier ticks.
    pub fn select_due(
        &mut self,
        now: Instant,
        cap: usize,
        policy: FairnessPolicy,
    ) -> Vec<Dispatch> {
        let busy = self
            .jobs
            .iter()
            .filter(|job| job.in_flight && job.priority != Priority::High)
            .count();

        let mut high = Vec::new();
        let mut background = Vec::new();
        for (idx, job) in self.jobs.iter().enumerate() {
            if job.in_flight || !job.is_due(now) {
                continue;
            }
            match job.priority {
                Priority::High => high.push(idx),
                Priority::Medium | Priority::Low => background.push(idx),
            }
        }

        // Stable sorts keep registration order among equals.
        match policy {
            FairnessPolicy::InsertionOrder => {
                background.sort_by_key(|&idx| self.jobs[idx].priority);
            }
            FairnessPolicy::OldestFirst => {
                background.sort_by_key(|&idx| (self.jobs[idx].priority, self.jobs[idx].last_run));
            }
        }

        let slots = cap.saturating_sub(busy);
        if background.len() > slots {
            debug!(
                "{} background jobs deferred (cap {}, busy {})",
                background.len() - slots,
                cap,
                busy
            );
            background.truncate(slots);
        }

        high.into_iter()
            .chain(background)
            .map(|idx| {
                let job = &mut self.jobs[idx];
                job.in_flight = true;
                job.last_run = Some(now);
                job.runs += 1;
                Dispatch {
                    job_id: job.id,
                    key: job.key.clone(),
                    priority: job.priority,
                }
            })
            .collect()
    }

    /// Mark a dispatched job idle again and return its current subscribers.
    /// `None` means the job was retired while running.
    pub fn complete(&mut self, job_id: u64) -> Option<Vec<String>> {
        let job = self.jobs.iter_mut().find(|job| job.id == job_id)?;
        job.in_flight = false;
        Some(job.subscribers.keys().cloned().collect())
    }
}
