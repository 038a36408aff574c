//! Daemon configuration, read from a JSON file.

use capy_exec::default_scripts_dir;
use capy_sched::cache::{CacheConfig, DEFAULT_HIT_BONUS};
use capy_sched::job::intervals;
use capy_sched::{FairnessPolicy, HubConfig, JobSpec, PerformanceLevel, Priority, SchedulerConfig};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "CAPY_PULSE_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// One widget polling one command.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WidgetConfig {
    pub id: String,
    pub command: String,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    #[serde(default)]
    pub priority: Priority,
}

fn default_interval_ms() -> u64 {
    intervals::NORMAL.as_millis() as u64
}

impl WidgetConfig {
    pub fn job_spec(&self) -> JobSpec {
        JobSpec::new(
            self.command.clone(),
            Duration::from_millis(self.interval_ms),
            self.priority,
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    /// `None` uses `$CAPY_PULSE_SCRIPTS` or the default location.
    pub scripts_dir: Option<PathBuf>,
    pub tick_ms: u64,
    pub frame_ms: u64,
    pub max_concurrent: usize,
    pub max_concurrent_animation: usize,
    pub fairness: FairnessPolicy,
    pub use_cache: bool,
    pub cache_sweep_secs: u64,
    /// Cache keys containing any of these never get a TTL bonus.
    pub volatile_keys: Vec<String>,
    /// `None` detects the level from the hardware.
    pub performance_level: Option<PerformanceLevel>,
    pub animation_mode: bool,
    /// 0 disables the periodic stats line.
    pub stats_interval_secs: u64,
    pub widgets: Vec<WidgetConfig>,
}

impl Default for PulseConfig {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        let cache = CacheConfig::default();
        Self {
            scripts_dir: None,
            tick_ms: scheduler.tick.as_millis() as u64,
            frame_ms: scheduler.frame.as_millis() as u64,
            max_concurrent: scheduler.max_concurrent,
            max_concurrent_animation: scheduler.max_concurrent_animation,
            fairness: scheduler.fairness,
            use_cache: scheduler.use_cache,
            cache_sweep_secs: cache.sweep_interval.as_secs(),
            volatile_keys: cache.volatile_patterns,
            performance_level: None,
            animation_mode: false,
            stats_interval_secs: 60,
            widgets: Vec::new(),
        }
    }
}

impl PulseConfig {
    /// Load from `path`. A missing file gives the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("No config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.scripts_dir.clone().unwrap_or_else(default_scripts_dir)
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            scheduler: SchedulerConfig {
                tick: Duration::from_millis(self.tick_ms.max(1)),
                frame: Duration::from_millis(self.frame_ms.max(1)),
                max_concurrent: self.max_concurrent,
                max_concurrent_animation: self.max_concurrent_animation,
                fairness: self.fairness,
                use_cache: self.use_cache,
            },
            cache: CacheConfig {
                sweep_interval: Duration::from_secs(self.cache_sweep_secs.max(1)),
                hit_bonus: DEFAULT_HIT_BONUS,
                volatile_patterns: self.volatile_keys.clone(),
            },
            level: self.performance_level,
        }
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}

/// Config file location: the CLI argument, `$CAPY_PULSE_CONFIG`, or
/// `<config_dir>/capy-pulse/config.json`.
pub fn config_path(arg: Option<String>) -> PathBuf {
    if let Some(path) = arg.filter(|p| !p.is_empty()) {
        return PathBuf::from(path);
    }
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from(".config"))
        .join("capy-pulse")
        .join("config.json")
}
