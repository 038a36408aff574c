//! capy-exec - Helper script executor
//!
//! Features:
//! - Runs helper programs from a single scripts directory
//! - Decodes stdout as JSON, falling back to trimmed text
//! - One error contract for every call site (`Result`, never silent nulls)

pub mod error;
pub mod executor;
pub mod output;

pub use error::ExecError;
pub use executor::{
    SCRIPTS_DIR_ENV, ScriptExecutor, ShellExecutor, default_scripts_dir, split_command,
};
pub use output::ScriptOutput;
