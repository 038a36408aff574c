//! Performance profiles and the hub that ties the services together.

use crate::batch::{BatchStats, RenderBatcher};
use crate::cache::{Cache, CacheConfig, CacheStats};
use crate::error::SchedError;
use crate::job::JobSpec;
use crate::lock;
use crate::scheduler::{PollScheduler, SchedulerConfig, SchedulerStats, Subscription};
use crate::sink::StateStore;
use capy_exec::{ScriptExecutor, ScriptOutput};
use chrono::{DateTime, Local};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{MemoryRefreshKind, System};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// How often the low profile drops the whole cache.
pub const LOW_LEVEL_INVALIDATE_INTERVAL: Duration = Duration::from_secs(60);

const GIB: u64 = 1024 * 1024 * 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceLevel {
    High,
    #[default]
    Medium,
    Low,
}

impl PerformanceLevel {
    /// Pick a level from core count and memory size.
    pub fn classify(cores: usize, mem_gib: u64) -> Self {
        if cores >= 8 && mem_gib >= 16 {
            PerformanceLevel::High
        } else if cores >= 4 && mem_gib >= 8 {
            PerformanceLevel::Medium
        } else {
            PerformanceLevel::Low
        }
    }
}

impl fmt::Display for PerformanceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PerformanceLevel::High => write!(f, "high"),
            PerformanceLevel::Medium => write!(f, "medium"),
            PerformanceLevel::Low => write!(f, "low"),
        }
    }
}

/// Classify the machine we are running on.
pub fn detect_performance_level() -> PerformanceLevel {
    let mut sys = System::new();
    sys.refresh_memory_specifics(MemoryRefreshKind::new().with_ram());

    let cores = sys.physical_core_count().unwrap_or_else(|| {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    });
    // Installed RAM is usually reported a bit under the nominal size.
    let mem_gib = (sys.total_memory() + GIB / 2) / GIB;

    let level = PerformanceLevel::classify(cores, mem_gib);
    info!("Detected {} cores, {} GiB RAM: {} performance", cores, mem_gib, level);
    level
}

#[derive(Clone, Debug, Default)]
pub struct HubConfig {
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
    /// `None` detects the level from the hardware.
    pub level: Option<PerformanceLevel>,
}

#[derive(Clone, Debug, Serialize)]
pub struct HubStats {
    pub level: PerformanceLevel,
    pub started_at: String,
    pub uptime_secs: u64,
    pub scheduler: SchedulerStats,
    pub cache: CacheStats,
    pub batcher: BatchStats,
}

/// Owns the shared services for one process.
///
/// Dropping the hub stops its background tasks and every binding.
pub struct PerformanceHub {
    cache: Arc<Cache<ScriptOutput>>,
    store: Arc<StateStore>,
    scheduler: PollScheduler,
    batcher: RenderBatcher,
    level: Mutex<PerformanceLevel>,
    started_at: DateTime<Local>,
    sweeper: JoinHandle<()>,
    invalidator: Mutex<Option<JoinHandle<()>>>,
    bindings: Mutex<Vec<JoinHandle<()>>>,
}

impl PerformanceHub {
    /// Build the services. Must be called from within a Tokio runtime.
    pub fn new(config: HubConfig, executor: Arc<dyn ScriptExecutor>) -> Self {
        let cache = Arc::new(Cache::new(config.cache));
        let sweeper = cache.spawn_sweeper();
        let store = Arc::new(StateStore::new());
        let scheduler = PollScheduler::new(
            config.scheduler.clone(),
            executor,
            store.clone(),
            Some(Arc::clone(&cache)),
        );
        let batcher = RenderBatcher::new(config.scheduler.frame);
        let level = config.level.unwrap_or_else(detect_performance_level);

        let hub = Self {
            cache,
            store,
            scheduler,
            batcher,
            level: Mutex::new(level),
            started_at: Local::now(),
            sweeper,
            invalidator: Mutex::new(None),
            bindings: Mutex::new(Vec::new()),
        };
        hub.apply_level(level);
        hub
    }

    pub fn apply_level(&self, level: PerformanceLevel) {
        *lock(&self.level) = level;
        self.batcher
            .set_animation_mode(level == PerformanceLevel::High);

        let mut invalidator = lock(&self.invalidator);
        if let Some(task) = invalidator.take() {
            task.abort();
        }
        if level == PerformanceLevel::Low {
            *invalidator = Some(self.spawn_invalidator());
        }
        info!("Performance level set to {}", level);
    }

    fn spawn_invalidator(&self) -> JoinHandle<()> {
        let cache = Arc::downgrade(&self.cache);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LOW_LEVEL_INVALIDATE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let dropped = cache.invalidate(None);
                debug!("Low performance level: dropped {} cache entries", dropped);
            }
        })
    }

    pub fn level(&self) -> PerformanceLevel {
        *lock(&self.level)
    }

    /// Animation mode for both the scheduler and the batcher.
    pub fn set_animation_mode(&self, enabled: bool) {
        self.scheduler.set_animation_mode(enabled);
        self.batcher.set_animation_mode(enabled);
    }

    pub fn subscribe(&self, widget_id: &str, spec: JobSpec) -> Result<Subscription, SchedError> {
        self.scheduler.subscribe(widget_id, spec)
    }

    /// Forward every value published to `subscription` to `render`,
    /// through the batcher. The binding lives as long as the hub.
    pub fn bind<F>(&self, mut subscription: Subscription, render: F)
    where
        F: Fn(ScriptOutput) + Send + Sync + 'static,
    {
        let render = self.batcher.deferred(render);
        let task = tokio::spawn(async move {
            while let Ok(value) = subscription.changed().await {
                render(value);
            }
        });
        lock(&self.bindings).push(task);
    }

    pub fn scheduler(&self) -> &PollScheduler {
        &self.scheduler
    }

    pub fn cache(&self) -> &Arc<Cache<ScriptOutput>> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn batcher(&self) -> &RenderBatcher {
        &self.batcher
    }

    pub fn stats(&self) -> HubStats {
        let uptime = Local::now().signed_duration_since(self.started_at);
        HubStats {
            level: self.level(),
            started_at: self.started_at.to_rfc3339(),
            uptime_secs: u64::try_from(uptime.num_seconds()).unwrap_or(0),
            scheduler: self.scheduler.stats(),
            cache: self.cache.stats(),
            batcher: self.batcher.stats(),
        }
    }
}

impl Drop for PerformanceHub {
    fn drop(&mut self) {
        self.sweeper.abort();
        if let Some(task) = lock(&self.invalidator).take() {
            task.abort();
        }
        for task in lock(&self.bindings).drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Priority;
    use crate::testing::CountingExecutor;
    use serde_json::json;
    use tokio::time::sleep;

    fn hub(level: PerformanceLevel) -> (PerformanceHub, Arc<CountingExecutor>) {
        let executor = Arc::new(CountingExecutor::counting());
        let config = HubConfig {
            level: Some(level),
            ..HubConfig::default()
        };
        (PerformanceHub::new(config, executor.clone()), executor)
    }

    #[test]
    fn test_classify() {
        assert_eq!(PerformanceLevel::classify(16, 32), PerformanceLevel::High);
        assert_eq!(PerformanceLevel::classify(8, 16), PerformanceLevel::High);
        assert_eq!(PerformanceLevel::classify(8, 8), PerformanceLevel::Medium);
        assert_eq!(PerformanceLevel::classify(4, 64), PerformanceLevel::Medium);
        assert_eq!(PerformanceLevel::classify(2, 64), PerformanceLevel::Low);
        assert_eq!(PerformanceLevel::classify(4, 4), PerformanceLevel::Low);
    }

    #[test]
    fn test_detect_does_not_panic() {
        let _ = detect_performance_level();
    }

    #[test]
    fn test_level_serde() {
        let level: PerformanceLevel = serde_json::from_str("\"low\"").unwrap();
        assert_eq!(level, PerformanceLevel::Low);
        assert_eq!(serde_json::to_string(&PerformanceLevel::High).unwrap(), "\"high\"");
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_level_sets_batcher_mode() {
        let (hub, _executor) = hub(PerformanceLevel::High);
        assert!(hub.batcher().is_animation_mode());
        assert!(!hub.scheduler().is_animation_mode());

        hub.apply_level(PerformanceLevel::Medium);
        assert!(!hub.batcher().is_animation_mode());
        assert_eq!(hub.level(), PerformanceLevel::Medium);
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_level_invalidates_periodically() {
        let (hub, _executor) = hub(PerformanceLevel::Low);
        let ttl = Duration::from_secs(100);
        hub.cache()
            .get("weather", ttl, || async { Ok::<_, String>(ScriptOutput::Text("sunny".into())) })
            .await
            .unwrap();

        sleep(Duration::from_secs(59)).await;
        assert_eq!(hub.cache().len(), 1);
        sleep(Duration::from_secs(2)).await;
        assert!(hub.cache().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_medium_level_keeps_cache() {
        let (hub, _executor) = hub(PerformanceLevel::Medium);
        hub.cache()
            .get("weather", Duration::from_secs(100), || async {
                Ok::<_, String>(ScriptOutput::Text("sunny".into()))
            })
            .await
            .unwrap();

        sleep(Duration::from_secs(61)).await;
        assert_eq!(hub.cache().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_animation_mode_propagates() {
        let (hub, _executor) = hub(PerformanceLevel::Medium);
        hub.set_animation_mode(true);
        assert!(hub.scheduler().is_animation_mode());
        assert!(hub.batcher().is_animation_mode());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_renders_through_batcher() {
        let (hub, _executor) = hub(PerformanceLevel::Medium);
        let rendered = Arc::new(Mutex::new(Vec::new()));

        let spec = JobSpec::new("clock.sh", Duration::from_millis(1000), Priority::Medium);
        let sub = hub.subscribe("clock", spec).unwrap();
        let sink = Arc::clone(&rendered);
        hub.bind(sub, move |value| lock(&sink).push(value));

        sleep(Duration::from_millis(1500)).await;
        assert_eq!(
            *lock(&rendered),
            [
                ScriptOutput::Json(json!({"n": 0})),
                ScriptOutput::Json(json!({"n": 1})),
            ]
        );
        assert!(hub.batcher().stats().executed >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_releases_bindings() {
        let (hub, executor) = hub(PerformanceLevel::Medium);
        let scheduler = hub.scheduler().clone();
        let sub = hub
            .subscribe("cpu", JobSpec::new("cpu.sh", Duration::from_millis(100), Priority::Medium))
            .unwrap();
        hub.bind(sub, |_| {});
        sleep(Duration::from_millis(50)).await;

        drop(hub);
        sleep(Duration::from_millis(10)).await;
        assert!(!scheduler.is_running());

        let calls = executor.calls("cpu.sh");
        sleep(Duration::from_millis(500)).await;
        assert_eq!(executor.calls("cpu.sh"), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_serialize() {
        let (hub, _executor) = hub(PerformanceLevel::Low);
        let stats = serde_json::to_value(hub.stats()).unwrap();
        assert_eq!(stats["level"], "low");
        assert_eq!(stats["scheduler"]["active_polls"], 0);
        assert_eq!(stats["batcher"]["pending"], 0);
    }
}
