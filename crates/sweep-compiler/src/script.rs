//! Array-job batch script for a generated suite.

use serde_json::Value;
use std::fmt::Write as _;
use std::path::Path;
use sweep_core::layout::{GENERATED_CONFIGS_DIR, MANIFEST_FILE, SUBMISSION_LOG_DIR_ENV};
use sweep_core::plan::{HpcSettings, LogFileNames};
use sweep_core::{Result, SweepError};

pub const DEFAULT_BUILD_COMMAND: &str = "pc_build";
pub const DEFAULT_START_COMMAND: &str = "pc_start";
pub const DEFAULT_RUN_COMMAND: &str = "pc_run";

pub struct ScriptInputs<'a> {
    pub experiment: &'a str,
    pub experiment_dir: &'a Path,
    pub scheduler_logs_dir: &'a Path,
    pub hpc: &'a HpcSettings,
    pub log_files: &'a LogFileNames,
    pub num_runs: usize,
    pub rebuild: bool,
}

fn directive_value(key: &str, value: &Value) -> Result<Option<String>> {
    match value {
        Value::Bool(true) => Ok(Some(format!("#SBATCH --{}", key))),
        Value::Bool(false) | Value::Null => Ok(None),
        Value::String(s) => Ok(Some(format!("#SBATCH --{}={}", key, s))),
        Value::Number(n) => Ok(Some(format!("#SBATCH --{}={}", key, n))),
        other => Err(SweepError::config(format!(
            "hpc.sbatch.{} must be a scalar, found {}",
            key, other
        ))),
    }
}

/// Directives the script sets itself; the plan may not override them.
const RESERVED_DIRECTIVES: [&str; 4] = ["array", "job-name", "output", "error"];

pub fn build_submit_script(inputs: &ScriptInputs<'_>) -> Result<String> {
    if inputs.num_runs == 0 {
        return Err(SweepError::config("cannot build a submit script for zero runs"));
    }
    let hpc = inputs.hpc;
    let logs = inputs.scheduler_logs_dir.display();
    let mut s = String::new();
    let _ = writeln!(s, "#!/bin/bash");
    let _ = writeln!(s, "#SBATCH --job-name={}", inputs.experiment);
    let _ = writeln!(s, "#SBATCH --array=1-{}", inputs.num_runs);
    let _ = writeln!(s, "#SBATCH --output={}/%A_%a.out", logs);
    let _ = writeln!(s, "#SBATCH --error={}/%A_%a.err", logs);
    for (key, value) in &hpc.sbatch {
        if RESERVED_DIRECTIVES.contains(&key.as_str()) {
            return Err(SweepError::config(format!(
                "hpc.sbatch.{} is set by the generator and cannot be overridden",
                key
            )));
        }
        if let Some(line) = directive_value(key, value)? {
            let _ = writeln!(s, "{}", line);
        }
    }
    let _ = writeln!(s);
    let _ = writeln!(s, "set -euo pipefail");
    let _ = writeln!(s);
    if !hpc.module_loads.trim().is_empty() {
        let _ = writeln!(s, "{}", hpc.module_loads.trim_end());
        let _ = writeln!(s);
    }

    let _ = writeln!(s, "EXPERIMENT_DIR=\"{}\"", inputs.experiment_dir.display());
    let _ = writeln!(s, "MANIFEST=\"${{EXPERIMENT_DIR}}/{}\"", MANIFEST_FILE);
    let _ = writeln!(
        s,
        "RUN_NAME=$(sed -n \"${{SLURM_ARRAY_TASK_ID}}p\" \"${{MANIFEST}}\")"
    );
    let _ = writeln!(s, "if [ -z \"${{RUN_NAME}}\" ]; then");
    let _ = writeln!(
        s,
        "  echo \"ERROR: no run for task ${{SLURM_ARRAY_TASK_ID}} in ${{MANIFEST}}\" >&2"
    );
    let _ = writeln!(s, "  exit 1");
    let _ = writeln!(s, "fi");
    let _ = writeln!(
        s,
        "CONFIG_DIR=\"${{EXPERIMENT_DIR}}/{}/${{RUN_NAME}}\"",
        GENERATED_CONFIGS_DIR
    );
    let _ = writeln!(
        s,
        "RUN_DIR=\"{}/{}/${{RUN_NAME}}\"",
        hpc.run_base_dir.trim_end_matches('/'),
        inputs.experiment
    );
    let _ = writeln!(
        s,
        "TASK_LOG_DIR=\"${{{env}:-${{EXPERIMENT_DIR}}/task_logs}}/${{SLURM_ARRAY_JOB_ID}}/array_${{SLURM_ARRAY_TASK_ID}}\"",
        env = SUBMISSION_LOG_DIR_ENV
    );
    let _ = writeln!(s, "mkdir -p \"${{RUN_DIR}}\" \"${{TASK_LOG_DIR}}\"");
    let _ = writeln!(s, "cp -r \"${{CONFIG_DIR}}/.\" \"${{RUN_DIR}}/\"");
    let _ = writeln!(s, "cd \"${{RUN_DIR}}\"");
    let _ = writeln!(s, "export RUN_NAME RUN_DIR CONFIG_DIR TASK_LOG_DIR");
    let _ = writeln!(s);
    let _ = writeln!(s, "run_stage() {{");
    let _ = writeln!(s, "  local stage=\"$1\" log=\"$2\"");
    let _ = writeln!(s, "  shift 2");
    let _ = writeln!(s, "  if ! ( eval \"$@\" ) 2>&1 | tee -a \"${{log}}\"; then");
    let _ = writeln!(
        s,
        "    echo \"ERROR: ${{stage}} failed for ${{RUN_NAME}}\" | tee -a \"${{log}}\" >&2"
    );
    let _ = writeln!(s, "    exit 1");
    let _ = writeln!(s, "  fi");
    let _ = writeln!(s, "}}");
    let _ = writeln!(s);

    let stage = |s: &mut String, name: &str, log: &str, command: &str| {
        let _ = writeln!(
            s,
            "run_stage {} \"${{TASK_LOG_DIR}}/{}\" {}",
            name,
            log,
            shell_quote(command)
        );
    };
    if inputs.rebuild {
        stage(
            &mut s,
            "build",
            &inputs.log_files.build,
            hpc.build_command.as_deref().unwrap_or(DEFAULT_BUILD_COMMAND),
        );
    }
    stage(
        &mut s,
        "start",
        &inputs.log_files.start,
        hpc.start_command.as_deref().unwrap_or(DEFAULT_START_COMMAND),
    );
    stage(
        &mut s,
        "run",
        &inputs.log_files.run,
        hpc.run_command.as_deref().unwrap_or(DEFAULT_RUN_COMMAND),
    );
    Ok(s)
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "'\\''"))
}
