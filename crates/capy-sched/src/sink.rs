//! Reactive state sink.
//!
//! Design:
//! - One `watch` slot per key: readers always see the latest value
//! - Broadcast channel (tokio) of every change for whole-store listeners
//! - Lagging listeners skip old changes (we only care about latest)

use capy_exec::ScriptOutput;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast::{self, Receiver, Sender};
use tokio::sync::watch;

/// Broadcast channel capacity.
/// 64 is enough for burst handling without memory bloat.
pub const CHANNEL_CAPACITY: usize = 64;

/// Sink key for one subscriber of one command.
pub fn sink_key(command: &str, subscriber: &str) -> String {
    format!("{command}-{subscriber}")
}

/// Publish target for scheduler results.
pub trait StateSink: Send + Sync {
    fn publish(&self, key: &str, value: ScriptOutput);

    /// Reactive reader for `key`. `None` until something is published.
    fn watch(&self, key: &str) -> watch::Receiver<Option<ScriptOutput>>;

    /// Nobody publishes to `key` anymore. Sinks may forget it once no
    /// reader is left.
    fn retire(&self, _key: &str) {}
}

/// A single published change.
#[derive(Clone, Debug, PartialEq)]
pub struct StateChange {
    pub key: String,
    pub value: ScriptOutput,
}

/// In-memory key/value store that UI bindings read from.
pub struct StateStore {
    slots: RwLock<HashMap<String, watch::Sender<Option<ScriptOutput>>>>,
    changes: Sender<StateChange>,
    publish_count: AtomicU64,
}

impl StateStore {
    pub fn new() -> Self {
        let (changes, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            slots: RwLock::new(HashMap::new()),
            changes,
            publish_count: AtomicU64::new(0),
        }
    }

    /// Latest value for `key`.
    pub fn get(&self, key: &str) -> Option<ScriptOutput> {
        self.slots
            .read()
            .ok()
            .and_then(|slots| slots.get(key).and_then(|slot| slot.borrow().clone()))
    }

    /// Forget `key`. Existing readers keep their last value.
    pub fn remove(&self, key: &str) -> bool {
        self.slots
            .write()
            .map(|mut slots| slots.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Number of keys with a slot (published or watched).
    pub fn len(&self) -> usize {
        self.slots.read().map(|slots| slots.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of publications so far.
    pub fn publish_count(&self) -> u64 {
        self.publish_count.load(Ordering::Relaxed)
    }

    /// Receive every future change. Each listener gets its own receiver.
    pub fn subscribe(&self) -> Receiver<StateChange> {
        self.changes.subscribe()
    }

    fn slot(&self, key: &str) -> Option<watch::Sender<Option<ScriptOutput>>> {
        if let Ok(slots) = self.slots.read() {
            if let Some(slot) = slots.get(key) {
                return Some(slot.clone());
            }
        }

        let mut slots = self.slots.write().ok()?;
        Some(
            slots
                .entry(key.to_string())
                .or_insert_with(|| watch::channel(None).0)
                .clone(),
        )
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateSink for StateStore {
    fn publish(&self, key: &str, value: ScriptOutput) {
        let Some(slot) = self.slot(key) else {
            return;
        };
        slot.send_replace(Some(value.clone()));
        self.publish_count.fetch_add(1, Ordering::Relaxed);

        // No listeners is fine (expected during startup).
        let _ = self.changes.send(StateChange {
            key: key.to_string(),
            value,
        });
    }

    fn watch(&self, key: &str) -> watch::Receiver<Option<ScriptOutput>> {
        // Subscribe under the write lock so `retire` can't drop the slot
        // between lookup and subscription.
        match self.slots.write() {
            Ok(mut slots) => slots
                .entry(key.to_string())
                .or_insert_with(|| watch::channel(None).0)
                .subscribe(),
            Err(_) => watch::channel(None).1,
        }
    }

    fn retire(&self, key: &str) {
        if let Ok(mut slots) = self.slots.write() {
            if slots.get(key).is_some_and(|slot| slot.receiver_count() == 0) {
                slots.remove(key);
            }
        }
    }
}

/// Drain all pending changes from a receiver, keeping only the latest per key.
/// Handles `Lagged` by continuing to drain.
pub fn drain_latest(rx: &mut Receiver<StateChange>) -> Vec<StateChange> {
    let mut changes = Vec::with_capacity(8);

    loop {
        match rx.try_recv() {
            Ok(change) => changes.push(change),
            Err(broadcast::error::TryRecvError::Empty) => break,
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue, // Skip old, keep draining
            Err(broadcast::error::TryRecvError::Closed) => break,
        }
    }

    if changes.len() <= 1 {
        return changes;
    }

    let mut seen = std::collections::HashSet::new();
    let mut result = Vec::with_capacity(changes.len());
    for change in changes.into_iter().rev() {
        if seen.insert(change.key.clone()) {
            result.push(change);
        }
    }

    result.reverse();
    result
}
