//! Subprocess execution
//!
//! Every device operation ends up as a bridge-tool subprocess (`adb`,
//! `ios-deploy`) or a directly launched executable. The [`ProcessRunner`]
//! trait is the seam that lets tests replace real processes with scripted
//! ones.

pub mod local;
#[cfg(test)]
pub mod scripted;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::common::{Error, Result};

pub use local::LocalRunner;

/// How long to wait for a killed command to go away
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(15);

/// Options for spawning a process
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

/// Spawns processes
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn spawn(
        &self,
        program: &Path,
        args: &[String],
        options: &SpawnOptions,
    ) -> Result<Arc<dyn ProcessHandle>>;
}

/// A spawned process
///
/// Output is captured continuously from stdout and stderr.
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// OS process id, if known
    fn id(&self) -> Option<u32>;

    /// Exit code once the process has exited
    fn exit_code(&self) -> Option<i32>;

    fn has_exited(&self) -> bool {
        self.exit_code().is_some()
    }

    /// Everything captured so far
    fn output(&self) -> String;

    /// Force-terminate. No-op once exited.
    fn kill(&self);

    /// Wait for exit; returns whether the process exited within `timeout`
    async fn wait_for_exit(&self, timeout: Duration) -> bool;
}

/// Result of a completed command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit code into an error
    pub fn check(self, command: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::command_failed(command, self.exit_code, &self.output))
        }
    }
}

/// Render a command line for logs and errors
pub fn describe_command(program: &Path, args: &[String]) -> String {
    let name = program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.display().to_string());
    if args.is_empty() {
        name
    } else {
        format!("{} {}", name, args.join(" "))
    }
}

/// Run a command to completion within `budget`
///
/// On expiry the process is killed and given [`DEFAULT_KILL_GRACE`] to exit.
pub async fn run_command(
    runner: &dyn ProcessRunner,
    program: &Path,
    args: &[String],
    budget: Duration,
) -> Result<CommandOutput> {
    run_command_with_grace(runner, program, args, budget, DEFAULT_KILL_GRACE).await
}

/// [`run_command`] with an explicit kill grace period
pub async fn run_command_with_grace(
    runner: &dyn ProcessRunner,
    program: &Path,
    args: &[String],
    budget: Duration,
    grace: Duration,
) -> Result<CommandOutput> {
    let command = describe_command(program, args);
    tracing::debug!("Running: {}", command);

    let handle = runner.spawn(program, args, &SpawnOptions::default()).await?;

    if !handle.wait_for_exit(budget).await {
        tracing::warn!(
            "'{}' exceeded its {}s budget, killing",
            command,
            budget.as_secs()
        );
        handle.kill();
        if !handle.wait_for_exit(grace).await {
            tracing::warn!("'{}' did not exit within {}s of being killed", command, grace.as_secs());
        }
        return Err(Error::CommandTimeout {
            command,
            secs: budget.as_secs(),
        });
    }

    let exit_code = handle.exit_code().unwrap_or(-1);
    Ok(CommandOutput {
        exit_code,
        output: handle.output(),
    })
}
