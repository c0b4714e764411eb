//! Sweep plan schema.
//!
//! Every plan section is an explicit serde struct with declared defaults, so a
//! malformed plan is rejected when it is loaded instead of being probed field by
//! field later on.

use crate::error::{Result, SweepError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SweepPlan {
    #[serde(default)]
    pub base_experiment: Option<String>,
    #[serde(default)]
    pub output_prefix: String,
    #[serde(default)]
    pub prefix_data_file: Option<String>,
    #[serde(default)]
    pub run_name_template: Option<String>,
    #[serde(default)]
    pub constants: BTreeMap<String, Value>,
    #[serde(default)]
    pub parameter_sweeps: Vec<SweepGroupSpec>,
    #[serde(default)]
    pub derived_parameters: BTreeMap<String, Value>,
    #[serde(default)]
    pub parameter_targets: BTreeMap<String, ParameterTarget>,
    #[serde(default)]
    pub branches: Vec<Branch>,
    #[serde(default)]
    pub modifications: BTreeMap<String, Value>,
    #[serde(default)]
    pub disable_auto_rebuild: bool,
    #[serde(default)]
    pub render_command: Option<Vec<String>>,
    #[serde(default)]
    pub hpc: HpcSettings,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub validation: ValidationCriteria,
}

/// One raw `parameter_sweeps` entry. Shape checks happen in the expander.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SweepGroupSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub variable: Option<String>,
    #[serde(default)]
    pub variables: Option<Vec<String>>,
    #[serde(default)]
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Branch {
    pub name: String,
    /// `config file -> nested overlay` merged into that file's `data`.
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
}

impl Branch {
    pub fn default_branch() -> Self {
        Branch {
            name: "default".to_string(),
            settings: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ParameterTarget {
    pub file: String,
    pub section: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HpcSettings {
    #[serde(default)]
    pub sbatch: BTreeMap<String, Value>,
    #[serde(default)]
    pub module_loads: String,
    #[serde(default = "default_run_base_dir")]
    pub run_base_dir: String,
    #[serde(default)]
    pub scheduler: SchedulerCommands,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default)]
    pub run_command: Option<String>,
}

impl Default for HpcSettings {
    fn default() -> Self {
        HpcSettings {
            sbatch: BTreeMap::new(),
            module_loads: String::new(),
            run_base_dir: default_run_base_dir(),
            scheduler: SchedulerCommands::default(),
            build_command: None,
            start_command: None,
            run_command: None,
        }
    }
}

fn default_run_base_dir() -> String {
    "runs".to_string()
}

/// Command names and the submission-output pattern of the batch scheduler.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerCommands {
    #[serde(default = "default_submit_command")]
    pub submit: String,
    #[serde(default = "default_accounting_command")]
    pub accounting: String,
    #[serde(default = "default_queue_command")]
    pub queue: String,
    #[serde(default = "default_submit_pattern")]
    pub submit_pattern: String,
}

impl Default for SchedulerCommands {
    fn default() -> Self {
        SchedulerCommands {
            submit: default_submit_command(),
            accounting: default_accounting_command(),
            queue: default_queue_command(),
            submit_pattern: default_submit_pattern(),
        }
    }
}

fn default_submit_command() -> String {
    "sbatch".to_string()
}

fn default_accounting_command() -> String {
    "sacct".to_string()
}

fn default_queue_command() -> String {
    "squeue".to_string()
}

fn default_submit_pattern() -> String {
    r"Submitted batch job (\d+)".to_string()
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorSettings {
    #[serde(default)]
    pub log_files: LogFileNames,
    #[serde(default)]
    pub markers: StageMarkers,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct LogFileNames {
    #[serde(default = "default_build_log")]
    pub build: String,
    #[serde(default = "default_start_log")]
    pub start: String,
    #[serde(default = "default_run_log")]
    pub run: String,
}

impl Default for LogFileNames {
    fn default() -> Self {
        LogFileNames {
            build: default_build_log(),
            start: default_start_log(),
            run: default_run_log(),
        }
    }
}

fn default_build_log() -> String {
    "pc_build.log".to_string()
}

fn default_start_log() -> String {
    "pc_start.log".to_string()
}

fn default_run_log() -> String {
    "pc_run.log".to_string()
}

/// Marker vocabulary of the simulation tool's free-form logs.
///
/// Defaults match the tool version the suite was built against; they are data,
/// not assumptions baked into the inferencer.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct StageMarkers {
    /// Case-sensitive substrings that mark a failed stage.
    #[serde(default = "default_error_markers")]
    pub error: Vec<String>,
    /// Case-insensitive words that mark a failed stage.
    #[serde(default = "default_failure_words")]
    pub failure_words: Vec<String>,
    #[serde(default = "default_run_completion")]
    pub run_completion: Vec<String>,
    #[serde(default = "default_standalone_done")]
    pub standalone_done: String,
    #[serde(default = "default_start_completion")]
    pub start_completion: Vec<String>,
    #[serde(default = "default_build_completion")]
    pub build_completion: Vec<String>,
    #[serde(default = "default_error_tail_lines")]
    pub error_tail_lines: usize,
    #[serde(default = "default_completion_window")]
    pub completion_window: usize,
    #[serde(default = "default_standalone_window")]
    pub standalone_window: usize,
}

impl Default for StageMarkers {
    fn default() -> Self {
        StageMarkers {
            error: default_error_markers(),
            failure_words: default_failure_words(),
            run_completion: default_run_completion(),
            standalone_done: default_standalone_done(),
            start_completion: default_start_completion(),
            build_completion: default_build_completion(),
            error_tail_lines: default_error_tail_lines(),
            completion_window: default_completion_window(),
            standalone_window: default_standalone_window(),
        }
    }
}

fn default_error_markers() -> Vec<String> {
    vec!["ERROR:".to_string(), "FATAL ERROR:".to_string()]
}

fn default_failure_words() -> Vec<String> {
    vec!["failed".to_string()]
}

fn default_run_completion() -> Vec<String> {
    vec![
        "finished successfully".to_string(),
        "done".to_string(),
        "completed".to_string(),
    ]
}

fn default_standalone_done() -> String {
    "done".to_string()
}

fn default_start_completion() -> Vec<String> {
    vec!["completed successfully".to_string()]
}

fn default_build_completion() -> Vec<String> {
    vec!["completed successfully".to_string(), "finished".to_string()]
}

fn default_error_tail_lines() -> usize {
    15
}

fn default_completion_window() -> usize {
    50
}

fn default_standalone_window() -> usize {
    10
}

/// Thresholds used to classify a finished run's output.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationCriteria {
    #[serde(default = "default_min_snapshots")]
    pub min_snapshots: usize,
    #[serde(default = "default_min_time_coverage")]
    pub min_time_coverage: f64,
    #[serde(default = "default_min_evolution")]
    pub min_evolution: f64,
    #[serde(default = "default_max_evolution")]
    pub max_evolution: f64,
    /// Fields compared between the first and last snapshot. Empty means all
    /// fields present in both.
    #[serde(default = "default_tracked_fields")]
    pub tracked_fields: Vec<String>,
    #[serde(default)]
    pub expected_end_time: Option<f64>,
}

impl Default for ValidationCriteria {
    fn default() -> Self {
        ValidationCriteria {
            min_snapshots: default_min_snapshots(),
            min_time_coverage: default_min_time_coverage(),
            min_evolution: default_min_evolution(),
            max_evolution: default_max_evolution(),
            tracked_fields: default_tracked_fields(),
            expected_end_time: None,
        }
    }
}

fn default_min_snapshots() -> usize {
    10
}

fn default_min_time_coverage() -> f64 {
    0.9
}

fn default_min_evolution() -> f64 {
    0.01
}

fn default_max_evolution() -> f64 {
    100.0
}

fn default_tracked_fields() -> Vec<String> {
    ["rho", "ux", "pp", "ee"].iter().map(|s| s.to_string()).collect()
}

/// Parse YAML text into a JSON value tree.
pub fn yaml_to_json(raw: &str, origin: &Path) -> Result<Value> {
    let yaml_value: serde_yaml::Value =
        serde_yaml::from_str(raw).map_err(|source| SweepError::Yaml {
            path: origin.to_path_buf(),
            source,
        })?;
    if yaml_value.is_null() {
        return Ok(Value::Object(Default::default()));
    }
    Ok(serde_json::to_value(yaml_value)?)
}

pub fn load_yaml_file(path: &Path) -> Result<Value> {
    let raw = fs::read_to_string(path).map_err(|e| SweepError::io(path, e))?;
    yaml_to_json(&raw, path)
}

pub fn load_plan(path: &Path) -> Result<SweepPlan> {
    let value = load_yaml_file(path)?;
    let plan: SweepPlan = serde_json::from_value(value)
        .map_err(|e| SweepError::config(format!("invalid plan {}: {}", path.display(), e)))?;
    plan.validate()?;
    Ok(plan)
}

impl SweepPlan {
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let value = yaml_to_json(raw, Path::new("<inline plan>"))?;
        let plan: SweepPlan = serde_json::from_value(value)
            .map_err(|e| SweepError::config(format!("invalid plan: {}", e)))?;
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for branch in &self.branches {
            if branch.name.trim().is_empty() {
                return Err(SweepError::config("branch name cannot be empty"));
            }
            if !seen.insert(branch.name.as_str()) {
                return Err(SweepError::config(format!(
                    "duplicate branch name '{}'",
                    branch.name
                )));
            }
        }
        if let Some(cmd) = &self.render_command {
            if cmd.is_empty() {
                return Err(SweepError::config("render_command cannot be an empty list"));
            }
        }
        let v = &self.validation;
        if v.min_snapshots == 0 {
            return Err(SweepError::config("validation.min_snapshots must be >= 1"));
        }
        if v.min_time_coverage <= 0.0 || v.min_evolution <= 0.0 || v.max_evolution <= 0.0 {
            return Err(SweepError::config(
                "validation thresholds must be positive",
            ));
        }
        if v.min_evolution > v.max_evolution {
            return Err(SweepError::config(
                "validation.min_evolution must not exceed validation.max_evolution",
            ));
        }
        Ok(())
    }

    /// Branches to compile; a plan without branches runs one `default` branch.
    pub fn effective_branches(&self) -> Vec<Branch> {
        if self.branches.is_empty() {
            vec![Branch::default_branch()]
        } else {
            self.branches.clone()
        }
    }
}
