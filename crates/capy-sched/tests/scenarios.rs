//! End-to-end scenarios across registry, scheduler, cache, sink and batcher.

use capy_sched::{
    Cache, CacheConfig, ExecError, JobSpec, PollScheduler, Priority, RenderBatcher, SchedulerConfig,
    ScriptExecutor, ScriptOutput, StateStore, sink_key,
};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

/// Answers `"<script>#<n>"` and remembers the order of invocations.
#[derive(Default)]
struct ScriptLog {
    counts: Mutex<HashMap<String, usize>>,
    order: Mutex<Vec<String>>,
}

impl ScriptLog {
    fn calls(&self, script: &str) -> usize {
        self.counts.lock().unwrap().get(script).copied().unwrap_or(0)
    }

    fn order(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }
}

impl ScriptExecutor for ScriptLog {
    fn execute(
        &self,
        script: &str,
        _args: &[String],
    ) -> BoxFuture<'static, Result<ScriptOutput, ExecError>> {
        let n = {
            let mut counts = self.counts.lock().unwrap();
            let n = counts.entry(script.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        self.order.lock().unwrap().push(script.to_string());
        let output = ScriptOutput::Text(format!("{script}#{n}"));
        async move { Ok(output) }.boxed()
    }
}

fn ms(ms: u64) -> Duration {
    Duration::from_millis(ms)
}

fn setup(config: SchedulerConfig) -> (PollScheduler, Arc<StateStore>, Arc<ScriptLog>) {
    let executor = Arc::new(ScriptLog::default());
    let store = Arc::new(StateStore::new());
    let cache = Arc::new(Cache::new(CacheConfig::default()));
    let scheduler = PollScheduler::new(config, executor.clone(), store.clone(), Some(cache));
    (scheduler, store, executor)
}

#[tokio::test(start_paused = true)]
async fn workspace_widgets_share_one_job() {
    let (scheduler, store, executor) = setup(SchedulerConfig::default());
    let spec = JobSpec::new("workspace.sh", ms(500), Priority::High);

    let a = scheduler.subscribe("A", spec.clone()).unwrap();
    let b = scheduler.subscribe("B", spec.clone()).unwrap();

    for cycle in 1..=3 {
        sleep(ms(if cycle == 1 { 10 } else { 500 })).await;
        assert_eq!(executor.calls("workspace.sh"), cycle);

        let expected = ScriptOutput::Text(format!("workspace.sh#{cycle}"));
        assert_eq!(store.get(&sink_key("workspace.sh", "A")), Some(expected.clone()));
        assert_eq!(store.get(&sink_key("workspace.sh", "B")), Some(expected));
    }

    drop(a);
    sleep(ms(500)).await;
    assert_eq!(executor.calls("workspace.sh"), 4);
    assert_eq!(store.get("workspace.sh-A"), Some(ScriptOutput::Text("workspace.sh#3".into())));
    assert_eq!(b.get(), ScriptOutput::Text("workspace.sh#4".into()));

    drop(b);
    assert!(!scheduler.is_running());
    sleep(ms(2000)).await;
    assert_eq!(executor.calls("workspace.sh"), 4);
}

#[tokio::test(start_paused = true)]
async fn cpu_sample_cache_scenario() {
    let cache = Cache::new(CacheConfig {
        volatile_patterns: vec!["cpu-sample".into()],
        ..CacheConfig::default()
    });
    let samples = [json!({"cpu": 10}), json!({"cpu": 55})];
    let calls = AtomicUsize::new(0);
    let sample = || {
        let value = samples[calls.fetch_add(1, Ordering::SeqCst).min(1)].clone();
        async move { Ok::<_, ExecError>(ScriptOutput::Json(value)) }
    };
    let ttl = ms(2000);

    let mut seen = Vec::new();
    seen.push(cache.get("cpu-sample", ttl, sample).await.unwrap());
    sleep(ms(500)).await;
    seen.push(cache.get("cpu-sample", ttl, sample).await.unwrap());
    sleep(ms(1600)).await;
    seen.push(cache.get("cpu-sample", ttl, sample).await.unwrap());

    let cpu: Vec<_> = seen.iter().map(|s| s.as_json().unwrap()["cpu"].clone()).collect();
    assert_eq!(cpu, [json!(10), json!(10), json!(55)]);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn high_priority_runs_before_capped_background_jobs() {
    let config = SchedulerConfig {
        max_concurrent: 1,
        ..SchedulerConfig::default()
    };
    let (scheduler, _store, executor) = setup(config);

    let _low = scheduler
        .subscribe("w", JobSpec::new("updates.sh", ms(10_000), Priority::Low))
        .unwrap();
    let _medium = scheduler
        .subscribe("w", JobSpec::new("cpu.sh", ms(10_000), Priority::Medium))
        .unwrap();
    let _high = scheduler
        .subscribe("w", JobSpec::new("workspace.sh", ms(10_000), Priority::High))
        .unwrap();

    sleep(ms(200)).await;
    assert_eq!(executor.order(), ["workspace.sh", "cpu.sh", "updates.sh"]);
}

#[tokio::test(start_paused = true)]
async fn unsubscribe_stops_publication_for_that_widget_only() {
    let (scheduler, store, executor) = setup(SchedulerConfig::default());
    let spec = JobSpec::new("media-player.sh status", ms(1000), Priority::Medium);

    let _bar = scheduler.subscribe("bar", spec.clone()).unwrap();
    let _popup = scheduler.subscribe("popup", spec.clone()).unwrap();
    sleep(ms(10)).await;

    assert!(scheduler.unsubscribe("popup", &spec));
    sleep(ms(1000)).await;

    assert_eq!(executor.calls("media-player.sh"), 2);
    assert_eq!(
        store.get("media-player.sh status-popup"),
        Some(ScriptOutput::Text("media-player.sh#1".into()))
    );
    assert_eq!(
        store.get("media-player.sh status-bar"),
        Some(ScriptOutput::Text("media-player.sh#2".into()))
    );
}

#[test]
fn failing_render_does_not_block_batch() {
    let batcher = RenderBatcher::default();
    let rendered = Arc::new(AtomicUsize::new(0));

    for i in 0..7 {
        let rendered = Arc::clone(&rendered);
        batcher.schedule(move || {
            if i == 2 {
                panic!("stale widget handle");
            }
            rendered.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert_eq!(batcher.flush(), 6);
    assert_eq!(rendered.load(Ordering::SeqCst), 6);
    assert_eq!(batcher.pending_len(), 0);
}
