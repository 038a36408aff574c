//! Test doubles shared by the unit tests.

use crate::lock;
use capy_exec::{ExecError, ScriptExecutor, ScriptOutput};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Calls {
    per_script: HashMap<String, usize>,
    last_args: HashMap<String, Vec<String>>,
}

/// Executor that answers `{"n": <call index>}` per script and records calls.
#[derive(Default)]
pub struct CountingExecutor {
    calls: Mutex<Calls>,
    fail_on: Vec<usize>,
    delay: Option<Duration>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl CountingExecutor {
    pub fn counting() -> Self {
        Self::default()
    }

    /// Fail the given (zero-based, per script) calls.
    pub fn failing_on(indices: &[usize]) -> Self {
        Self {
            fail_on: indices.to_vec(),
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self, script: &str) -> usize {
        lock(&self.calls).per_script.get(script).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        lock(&self.calls).per_script.values().sum()
    }

    pub fn last_args(&self, script: &str) -> Option<Vec<String>> {
        lock(&self.calls).last_args.get(script).cloned()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl ScriptExecutor for CountingExecutor {
    fn execute(
        &self,
        script: &str,
        args: &[String],
    ) -> BoxFuture<'static, Result<ScriptOutput, ExecError>> {
        let index = {
            let mut calls = lock(&self.calls);
            calls.last_args.insert(script.to_string(), args.to_vec());
            let count = calls.per_script.entry(script.to_string()).or_insert(0);
            *count += 1;
            *count - 1
        };

        let fails = self.fail_on.contains(&index);
        let delay = self.delay;
        let script = script.to_string();
        let in_flight = Arc::clone(&self.in_flight);
        let max_in_flight = Arc::clone(&self.max_in_flight);

        async move {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            max_in_flight.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            in_flight.fetch_sub(1, Ordering::SeqCst);

            if fails {
                Err(ExecError::Failed(format!("{script} call {index}")))
            } else {
                Ok(ScriptOutput::Json(json!({ "n": index })))
            }
        }
        .boxed()
    }
}
