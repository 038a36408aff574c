//! CapyPulse - Shared polling daemon for shell widgets
//!
//! Runs every configured widget's helper script through one scheduler and
//! logs what each widget would render.

mod config;

use capy_exec::ShellExecutor;
use capy_sched::PerformanceHub;
use config::{PulseConfig, config_path};
use log::{error, info, warn};
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::MissedTickBehavior;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("Starting CapyPulse...");

    let path = config_path(std::env::args().nth(1));
    let config = match PulseConfig::load(&path) {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return Err(e.into());
        }
    };

    let executor = Arc::new(ShellExecutor::new(config.scripts_dir()));
    info!("Scripts directory: {}", executor.scripts_dir().display());

    let hub = PerformanceHub::new(config.hub_config(), executor);
    if config.animation_mode {
        hub.set_animation_mode(true);
    }

    if config.widgets.is_empty() {
        warn!("No widgets configured in {}", path.display());
    }
    for widget in &config.widgets {
        let subscription = match hub.subscribe(&widget.id, widget.job_spec()) {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!("Skipping widget {}: {}", widget.id, e);
                continue;
            }
        };
        let id = widget.id.clone();
        hub.bind(subscription, move |value| info!("[{}] {}", id, value));
    }

    info!(
        "CapyPulse running with {} jobs.",
        hub.scheduler().stats().active_polls
    );

    run_until_shutdown(&hub, config.stats_interval()).await?;

    info!("Shutting down");
    Ok(())
}

/// Wait for Ctrl-C, logging hub stats every `stats_every` meanwhile.
async fn run_until_shutdown(
    hub: &PerformanceHub,
    stats_every: Option<Duration>,
) -> std::io::Result<()> {
    let Some(period) = stats_every else {
        return signal::ctrl_c().await;
    };

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            result = signal::ctrl_c() => return result,
            _ = ticker.tick() => match serde_json::to_string(&hub.stats()) {
                Ok(stats) => info!("Stats: {}", stats),
                Err(e) => warn!("Failed to encode stats: {}", e),
            },
        }
    }
}
