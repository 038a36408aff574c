//! Standalone periodic poll.
//!
//! For widgets that don't need the shared scheduler: one task, one interval,
//! one reactive value. The task is aborted when the `Poll` is dropped.

use crate::error::SchedError;
use futures_util::future::BoxFuture;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub struct Poll<T> {
    rx: watch::Receiver<T>,
    task: JoinHandle<()>,
}

impl<T: Clone + Send + Sync + 'static> Poll<T> {
    /// Start polling `fetch` every `interval`, beginning immediately.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F>(initial: T, interval: Duration, fetch: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, T> + Send + Sync + 'static,
    {
        let (tx, rx) = watch::channel(initial);
        let period = interval.max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let value = fetch().await;
                tx.send_replace(value);
            }
        });

        Self { rx, task }
    }

    /// Current value.
    pub fn get(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Wait for the next poll result.
    pub async fn changed(&mut self) -> Result<T, SchedError> {
        self.rx.changed().await.map_err(|_| SchedError::SinkClosed)?;
        Ok(self.get())
    }

    /// Extra reader, e.g. for a second widget showing the same value.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.rx.clone()
    }
}

impl<T> Drop for Poll<T> {
    fn drop(&mut self) {
        self.task.abort();
    }
}
