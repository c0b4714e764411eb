//! Fixed command/response contract with the batch scheduler.

use std::io::ErrorKind;
use std::path::Path;
use std::process::Command;
use sweep_core::plan::SchedulerCommands;
use sweep_core::{BatchHandle, Result, SweepError};

pub trait Scheduler {
    /// Submit `script`; returns the raw stdout of the submission command.
    fn submit(&self, script: &Path, env: &[(String, String)]) -> Result<String>;

    /// `<taskToken>|<state>` lines for the batch, possibly none.
    fn accounting(&self, batch: &BatchHandle) -> Result<String>;

    /// Non-empty iff the batch is still queued or running.
    fn queue(&self, batch: &BatchHandle) -> Result<String>;
}

/// Slurm through `sbatch` / `sacct` / `squeue` (names configurable).
#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    commands: SchedulerCommands,
}

impl SlurmScheduler {
    pub fn new(commands: SchedulerCommands) -> Self {
        SlurmScheduler { commands }
    }

    pub fn commands(&self) -> &SchedulerCommands {
        &self.commands
    }
}

impl Default for SlurmScheduler {
    fn default() -> Self {
        Self::new(SchedulerCommands::default())
    }
}

fn run_command(program: &str, args: &[&str], env: &[(String, String)]) -> Result<String> {
    tracing::debug!(command = %program, args = ?args, "running scheduler command");
    let mut cmd = Command::new(program);
    cmd.args(args);
    for (key, value) in env {
        cmd.env(key, value);
    }
    let output = cmd.output().map_err(|e| {
        if e.kind() == ErrorKind::NotFound {
            SweepError::SchedulerUnavailable {
                command: program.to_string(),
            }
        } else {
            SweepError::SchedulerCommandFailed {
                command: program.to_string(),
                status: "spawn failed".to_string(),
                stderr: e.to_string(),
            }
        }
    })?;
    if !output.status.success() {
        return Err(SweepError::SchedulerCommandFailed {
            command: program.to_string(),
            status: output
                .status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string()),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

impl Scheduler for SlurmScheduler {
    fn submit(&self, script: &Path, env: &[(String, String)]) -> Result<String> {
        let script = script.to_string_lossy();
        run_command(&self.commands.submit, &[script.as_ref()], env)
    }

    fn accounting(&self, batch: &BatchHandle) -> Result<String> {
        run_command(
            &self.commands.accounting,
            &["-j", batch.as_str(), "--format=JobID,State", "-n", "-P"],
            &[],
        )
    }

    fn queue(&self, batch: &BatchHandle) -> Result<String> {
        run_command(&self.commands.queue, &["-j", batch.as_str(), "-h"], &[])
    }
}
