use std::path::{Path, PathBuf};

pub const PLAN_SUBDIR: &str = "plan";
pub const INPUTS_SUBDIR: &str = "in";
pub const PLAN_FILE: &str = "sweep.yaml";
pub const MANIFEST_FILE: &str = "run_manifest.txt";
pub const BATCH_ID_FILE: &str = ".batch_id";
pub const SUBMIT_SCRIPT_FILE: &str = "submit_suite.sh";
pub const SUITE_RECORD_FILE: &str = "suite.json";
pub const GENERATED_CONFIGS_DIR: &str = "generated_configs";
pub const SCHEDULER_LOGS_DIR: &str = "slurm_logs";
pub const OUTPUTS_DIR: &str = "outputs";
pub const ANALYSIS_DIR: &str = "analysis";

/// Environment variable carrying the per-submission log root into the job.
pub const SUBMISSION_LOG_DIR_ENV: &str = "SWEEP_SUBMISSION_LOG_DIR";

/// On-disk locations for one experiment.
///
/// ```text
/// <config_root>/<experiment>/plan/sweep.yaml
/// <config_root>/<experiment>/in/*.yaml
/// <runs_root>/<experiment>/{run_manifest.txt,.batch_id,submit_suite.sh,suite.json}
/// <runs_root>/<experiment>/generated_configs/<run>/...
/// <logs_root>/submission/<experiment>/sub_<stamp>/<job>/array_<task>/
/// ```
#[derive(Debug, Clone)]
pub struct ExperimentLayout {
    pub experiment: String,
    pub config_root: PathBuf,
    pub runs_root: PathBuf,
    pub logs_root: PathBuf,
}

impl ExperimentLayout {
    pub fn new(
        experiment: &str,
        config_root: impl Into<PathBuf>,
        runs_root: impl Into<PathBuf>,
        logs_root: impl Into<PathBuf>,
    ) -> Self {
        ExperimentLayout {
            experiment: experiment.to_string(),
            config_root: config_root.into(),
            runs_root: runs_root.into(),
            logs_root: logs_root.into(),
        }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.config_root.join(&self.experiment)
    }

    pub fn plan_path(&self) -> PathBuf {
        self.config_dir().join(PLAN_SUBDIR).join(PLAN_FILE)
    }

    pub fn experiment_dir(&self) -> PathBuf {
        self.runs_root.join(&self.experiment)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.experiment_dir().join(MANIFEST_FILE)
    }

    pub fn batch_id_path(&self) -> PathBuf {
        self.experiment_dir().join(BATCH_ID_FILE)
    }

    pub fn submit_script_path(&self) -> PathBuf {
        self.experiment_dir().join(SUBMIT_SCRIPT_FILE)
    }

    pub fn suite_record_path(&self) -> PathBuf {
        self.experiment_dir().join(SUITE_RECORD_FILE)
    }

    pub fn generated_configs_dir(&self) -> PathBuf {
        self.experiment_dir().join(GENERATED_CONFIGS_DIR)
    }

    pub fn scheduler_logs_dir(&self) -> PathBuf {
        self.experiment_dir().join(SCHEDULER_LOGS_DIR)
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.experiment_dir().join(OUTPUTS_DIR)
    }

    pub fn analysis_dir(&self) -> PathBuf {
        self.experiment_dir().join(ANALYSIS_DIR)
    }

    /// Root under which each submission gets its own `sub_<stamp>` directory.
    pub fn submission_logs_root(&self) -> PathBuf {
        self.logs_root.join("submission").join(&self.experiment)
    }
}

/// Experiments under `config_root` that carry a sweep plan, sorted by name.
pub fn list_experiments(config_root: &Path) -> Vec<String> {
    let mut names = Vec::new();
    if let Ok(entries) = std::fs::read_dir(config_root) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.join(PLAN_SUBDIR).join(PLAN_FILE).is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_string());
                }
            }
        }
    }
    names.sort();
    names
}
