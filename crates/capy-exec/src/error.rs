//! Error types for capy-exec

use std::process::ExitStatus;

/// Script execution errors
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Empty command")]
    EmptyCommand,

    #[error("Failed to spawn {script}: {source}")]
    Spawn {
        script: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{script} exited with {status}: {stderr}")]
    Exit {
        script: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("Execution failed: {0}")]
    Failed(String),
}
