//! Job identity and subscription specs.

use crate::error::SchedError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Common polling intervals.
pub mod intervals {
    use std::time::Duration;

    /// Responsive UI elements (bar, workspace)
    pub const FAST: Duration = Duration::from_millis(500);
    /// Most widgets (timers, status)
    pub const NORMAL: Duration = Duration::from_millis(2000);
    /// System monitoring
    pub const SLOW: Duration = Duration::from_millis(5000);
    /// Weather, external APIs
    pub const VERY_SLOW: Duration = Duration::from_millis(10000);
}

/// Priority class of a job.
///
/// Ordering follows urgency: `High < Medium < Low`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Deduplication key: identical keys share one job.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub command: String,
    pub interval: Duration,
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.command, self.interval.as_millis())
    }
}

/// What a widget asks for when subscribing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSpec {
    /// Script name, optionally followed by arguments.
    pub command: String,
    pub interval: Duration,
    pub priority: Priority,
}

impl JobSpec {
    pub fn new(command: impl Into<String>, interval: Duration, priority: Priority) -> Self {
        Self {
            command: command.into(),
            interval,
            priority,
        }
    }

    /// Collapse runs of whitespace so "a.sh  x" and "a.sh x" share a job.
    pub fn key(&self) -> JobKey {
        JobKey {
            command: self.command.split_whitespace().collect::<Vec<_>>().join(" "),
            interval: self.interval,
        }
    }

    pub fn validate(&self, subscriber: &str) -> Result<(), SchedError> {
        if self.command.trim().is_empty() {
            return Err(SchedError::EmptyCommand(subscriber.to_string()));
        }
        if self.interval.is_zero() {
            return Err(SchedError::ZeroInterval(self.command.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        assert!(Priority::High < Priority::Medium);
        assert!(Priority::Medium < Priority::Low);
        assert_eq!(Priority::High.min(Priority::Low), Priority::High);
    }

    #[test]
    fn test_key_normalizes_whitespace() {
        let a = JobSpec::new("media-player.sh  status", intervals::FAST, Priority::High);
        let b = JobSpec::new(" media-player.sh status ", intervals::FAST, Priority::Low);
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().to_string(), "media-player.sh status-500");
    }

    #[test]
    fn test_validate() {
        let spec = JobSpec::new("cpu.sh", Duration::ZERO, Priority::Medium);
        assert!(matches!(spec.validate("w"), Err(SchedError::ZeroInterval(_))));

        let spec = JobSpec::new("  ", intervals::NORMAL, Priority::Medium);
        assert!(matches!(spec.validate("w"), Err(SchedError::EmptyCommand(_))));

        let spec = JobSpec::new("cpu.sh", intervals::NORMAL, Priority::Medium);
        assert!(spec.validate("w").is_ok());
    }

    #[test]
    fn test_priority_deserialize() {
        let priority: Priority = serde_json::from_str("\"high\"").unwrap();
        assert_eq!(priority, Priority::High);
    }
}
