//! Convenience constructors for widget data.
//!
//! `use_script` and friends give a widget its own [`Poll`]. Widgets that may
//! share a script with others should prefer [`use_optimized_script`], which
//! goes through the shared scheduler.

use crate::error::SchedError;
use crate::job::{JobSpec, Priority};
use crate::poll::Poll;
use crate::scheduler::{PollScheduler, Subscription};
use capy_exec::{ScriptExecutor, ScriptOutput};
use futures_util::FutureExt;
use futures_util::future::join_all;
use log::debug;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

/// Poll `command`. Failures and empty output show `fallback`.
pub fn use_script(
    executor: Arc<dyn ScriptExecutor>,
    command: &str,
    interval: Duration,
    fallback: ScriptOutput,
) -> Poll<ScriptOutput> {
    let command = command.to_string();
    Poll::spawn(fallback.clone(), interval, move || {
        let run = executor.execute_command(&command);
        let fallback = fallback.clone();
        let command = command.clone();
        async move {
            match run.await {
                Ok(output) => output.or(fallback),
                Err(e) => {
                    debug!("{} failed: {}", command, e);
                    fallback
                }
            }
        }
        .boxed()
    })
}

/// Poll `command` and decode its JSON into `T`.
pub fn use_json_script<T>(
    executor: Arc<dyn ScriptExecutor>,
    command: &str,
    interval: Duration,
    fallback: T,
) -> Poll<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    let command = command.to_string();
    Poll::spawn(fallback.clone(), interval, move || {
        let run = executor.execute_command(&command);
        let fallback = fallback.clone();
        async move {
            run.await
                .ok()
                .and_then(|output| output.parse::<T>())
                .unwrap_or(fallback)
        }
        .boxed()
    })
}

/// Poll several commands together. Entry `i` is `None` when command `i` failed.
pub fn use_multiple_scripts(
    executor: Arc<dyn ScriptExecutor>,
    commands: &[&str],
    interval: Duration,
) -> Poll<Vec<Option<ScriptOutput>>> {
    let commands: Vec<String> = commands.iter().map(|c| c.to_string()).collect();
    let initial = vec![None; commands.len()];

    Poll::spawn(initial, interval, move || {
        let runs: Vec<_> = commands
            .iter()
            .map(|command| executor.execute_command(command))
            .collect();
        async move {
            join_all(runs)
                .await
                .into_iter()
                .map(Result::ok)
                .collect()
        }
        .boxed()
    })
}

/// Subscribe `widget_id` to `command` on the shared scheduler.
pub fn use_optimized_script(
    scheduler: &PollScheduler,
    widget_id: &str,
    command: &str,
    interval: Duration,
    priority: Priority,
    fallback: ScriptOutput,
) -> Result<Subscription, SchedError> {
    let subscription = scheduler.subscribe(widget_id, JobSpec::new(command, interval, priority))?;
    Ok(subscription.with_fallback(fallback))
}
