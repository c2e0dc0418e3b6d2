//! The process-runner seam.
//!
//! The engines depend only on the [`ProcessRunner`] contract: given a
//! script body and an optional working directory, run it and report
//! success plus the captured streams. [`ShellRunner`] is the production
//! implementation; tests substitute stubs.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

use super::EngineError;

/// Captured outcome of one process execution
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// True iff the process exited with status zero
    pub success: bool,
    /// Captured stdout
    pub output: Vec<u8>,
    /// Captured stderr
    pub errors: Vec<u8>,
}

/// Executes a shell script body and captures its streams
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run `script` to completion, optionally in `cwd`
    async fn run(&self, script: &str, cwd: Option<&Path>) -> Result<ProcessOutput, EngineError>;
}

/// Runs scripts by staging them to a temporary `.sh` file and invoking a
/// shell on it. The staged file is removed once the process exits.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: PathBuf,
}

impl ShellRunner {
    /// A runner using `bash`
    pub fn new() -> Self {
        Self {
            shell: PathBuf::from("bash"),
        }
    }

    /// A runner using the given shell executable
    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessRunner for ShellRunner {
    async fn run(&self, script: &str, cwd: Option<&Path>) -> Result<ProcessOutput, EngineError> {
        let path = std::env::temp_dir().join(format!("batchrun-{}.sh", Uuid::new_v4()));
        tokio::fs::write(&path, script).await?;
        debug!(script = %path.display(), shell = %self.shell.display(), "staged script");

        let mut command = Command::new(&self.shell);
        command.arg(&path);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        let result = command.output().await;
        let _ = tokio::fs::remove_file(&path).await;
        let out = result?;

        Ok(ProcessOutput {
            success: out.status.success(),
            output: out.stdout,
            errors: out.stderr,
        })
    }
}
