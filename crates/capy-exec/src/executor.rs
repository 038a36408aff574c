//! Script executor trait and the process-backed implementation.

use crate::error::ExecError;
use crate::output::ScriptOutput;
use futures_util::FutureExt;
use futures_util::future::{self, BoxFuture};
use log::debug;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

/// Environment variable overriding the scripts directory.
pub const SCRIPTS_DIR_ENV: &str = "CAPY_PULSE_SCRIPTS";

/// Runs a named external program and decodes what it printed.
///
/// Failures are always reported as `Err`; callers that prefer a fallback
/// value map the error themselves.
pub trait ScriptExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        script: &str,
        args: &[String],
    ) -> BoxFuture<'static, Result<ScriptOutput, ExecError>>;

    /// Run a whitespace-separated command line ("media-player.sh status").
    fn execute_command(
        &self,
        command: &str,
    ) -> BoxFuture<'static, Result<ScriptOutput, ExecError>> {
        match split_command(command) {
            Some((script, args)) => self.execute(&script, &args),
            None => future::ready(Err(ExecError::EmptyCommand)).boxed(),
        }
    }
}

/// Split a command line into script name and arguments.
/// Returns `None` for blank input.
pub fn split_command(command: &str) -> Option<(String, Vec<String>)> {
    let mut parts = command.split_whitespace();
    let script = parts.next()?.to_string();
    Some((script, parts.map(str::to_string).collect()))
}

/// Resolve the scripts directory: `$CAPY_PULSE_SCRIPTS`, else
/// `<config_dir>/capy-pulse/scripts`.
pub fn default_scripts_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(SCRIPTS_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    dirs::config_dir()
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(".config")
        })
        .join("capy-pulse")
        .join("scripts")
}

/// Executes helper scripts as child processes.
#[derive(Clone, Debug)]
pub struct ShellExecutor {
    scripts_dir: PathBuf,
}

impl ShellExecutor {
    pub fn new(scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
        }
    }

    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    /// Absolute script paths are used as-is.
    pub fn script_path(&self, script: &str) -> PathBuf {
        let path = Path::new(script);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.scripts_dir.join(path)
        }
    }
}

impl ScriptExecutor for ShellExecutor {
    fn execute(
        &self,
        script: &str,
        args: &[String],
    ) -> BoxFuture<'static, Result<ScriptOutput, ExecError>> {
        let path = self.script_path(script);
        let script = script.to_string();
        let args = args.to_vec();

        async move {
            debug!("Executing {} {:?}", path.display(), args);

            let output = Command::new(&path)
                .args(&args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(|source| ExecError::Spawn {
                    script: script.clone(),
                    source,
                })?;

            if !output.status.success() {
                return Err(ExecError::Exit {
                    script,
                    status: output.status,
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }

            Ok(ScriptOutput::decode(&String::from_utf8_lossy(&output.stdout)))
        }
        .boxed()
    }
}
