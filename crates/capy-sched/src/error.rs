//! Error types for capy-sched

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    #[error("Poll interval must be non-zero: {0}")]
    ZeroInterval(String),

    #[error("Empty command for subscriber {0}")]
    EmptyCommand(String),

    #[error("State sink closed")]
    SinkClosed,
}
