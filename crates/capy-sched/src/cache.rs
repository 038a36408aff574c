//! Adaptive TTL cache for script results.
//!
//! Expiry is lazy: every `get` checks the entry age against its TTL. A
//! background sweep only bounds memory for keys nobody asks for anymore.

use crate::lock;
use log::{debug, info};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Sweep period of the background eviction task.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);
/// TTL bonus granted per recorded cache hit.
pub const DEFAULT_HIT_BONUS: Duration = Duration::from_millis(50);

#[derive(Clone, Debug)]
pub struct CacheConfig {
    pub sweep_interval: Duration,
    pub hit_bonus: Duration,
    /// Keys containing any of these never get a TTL bonus (audio levels etc).
    pub volatile_patterns: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            hit_bonus: DEFAULT_HIT_BONUS,
            volatile_patterns: vec!["cava".to_string()],
        }
    }
}

#[derive(Clone, Debug)]
struct CacheEntry<V> {
    value: V,
    timestamp: Instant,
    ttl: Duration,
    hit_count: u64,
}

impl<V> CacheEntry<V> {
    fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.timestamp)
    }

    fn is_live(&self, now: Instant) -> bool {
        self.age(now) < self.ttl
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub total_hits: u64,
    pub avg_hit_count: f64,
}

/// Keyed memoization with adaptive TTL and stale-on-error fallback.
pub struct Cache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    config: CacheConfig,
}

impl<V: Clone + Send + 'static> Cache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry<V>>> {
        lock(&self.entries)
    }

    /// Serve `key` from cache, or run `executor` and remember its result.
    ///
    /// A failed refresh still returns the previous value when one exists;
    /// the error only surfaces when nothing was ever cached for `key`.
    pub async fn get<F, Fut, E>(&self, key: &str, ttl_hint: Duration, executor: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Display,
    {
        let now = Instant::now();

        let prior_hits = {
            let mut entries = self.entries();
            match entries.get_mut(key) {
                Some(entry) if entry.is_live(now) => {
                    entry.hit_count += 1;
                    return Ok(entry.value.clone());
                }
                Some(entry) => Some(entry.hit_count),
                None => None,
            }
        };

        match executor().await {
            Ok(value) => {
                let ttl = self.adaptive_ttl(key, ttl_hint, prior_hits);
                self.entries().insert(
                    key.to_string(),
                    CacheEntry {
                        value: value.clone(),
                        timestamp: now,
                        ttl,
                        hit_count: prior_hits.unwrap_or(0),
                    },
                );
                Ok(value)
            }
            Err(err) => match self.entries().get(key) {
                Some(entry) => {
                    debug!("Refresh of {} failed, serving stale value: {}", key, err);
                    Ok(entry.value.clone())
                }
                None => Err(err),
            },
        }
    }

    /// TTL for a fresh entry: the base widened by up to 50% for keys that
    /// keep getting hits. First entries and volatile keys use the base.
    pub fn adaptive_ttl(&self, key: &str, base: Duration, prior_hits: Option<u64>) -> Duration {
        let Some(hits) = prior_hits else {
            return base;
        };

        if self.is_volatile(key) {
            return base;
        }

        let hits = u32::try_from(hits).unwrap_or(u32::MAX);
        let bonus = self.config.hit_bonus.saturating_mul(hits).min(base / 2);
        base + bonus
    }

    fn is_volatile(&self, key: &str) -> bool {
        self.config
            .volatile_patterns
            .iter()
            .any(|pattern| key.contains(pattern.as_str()))
    }

    /// Drop every entry, or only keys containing `pattern`.
    /// Returns the number of removed entries.
    pub fn invalidate(&self, pattern: Option<&str>) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        match pattern {
            None => entries.clear(),
            Some(pattern) => entries.retain(|key, _| !key.contains(pattern)),
        }
        before - entries.len()
    }

    /// Evict entries older than twice their TTL.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| entry.age(now) <= entry.ttl * 2);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Effective TTL of the entry for `key`, if cached.
    pub fn entry_ttl(&self, key: &str) -> Option<Duration> {
        self.entries().get(key).map(|entry| entry.ttl)
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries();
        let total_hits: u64 = entries.values().map(|entry| entry.hit_count).sum();
        CacheStats {
            size: entries.len(),
            total_hits,
            avg_hit_count: if entries.is_empty() {
                0.0
            } else {
                total_hits as f64 / entries.len() as f64
            },
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Cache<V> {
    /// Spawn the periodic sweep. The task ends once the cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let evicted = cache.sweep();
                if evicted > 0 {
                    debug!("Cache sweep evicted {} entries", evicted);
                }
            }
            info!("Cache sweeper stopped");
        })
    }
}

impl<V: Clone + Send + 'static> Default for Cache<V> {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}
