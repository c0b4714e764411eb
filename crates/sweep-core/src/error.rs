use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SweepError>;

/// Failures surfaced by the sweep compiler and the job tracker.
///
/// Generation-time variants (`Configuration`, `CircularInheritance`) are always
/// raised before anything is written to disk. Scheduler variants distinguish a
/// missing command from a command that ran and reported an error.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("circular configuration inheritance: {}", .chain.join(" -> "))]
    CircularInheritance { chain: Vec<String> },

    #[error("scheduler command `{command}` not found (is this an HPC login node?)")]
    SchedulerUnavailable { command: String },

    #[error("scheduler command `{command}` exited with {status}: {stderr}")]
    SchedulerCommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("could not parse a batch id from submission output:\n{stdout}")]
    UnparsedSubmission { stdout: String },

    #[error("run manifest not found at {}", .path.display())]
    ManifestMissing { path: PathBuf },

    #[error("batch handle not found at {} (was the suite submitted?)", .path.display())]
    BatchHandleMissing { path: PathBuf },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid yaml in {}: {source}", .path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SweepError {
    pub fn config(message: impl Into<String>) -> Self {
        SweepError::Configuration(message.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SweepError::Io {
            path: path.into(),
            source,
        }
    }

    /// Errors after which polling must stop instead of retrying on the next tick.
    pub fn is_fatal_for_polling(&self) -> bool {
        matches!(
            self,
            SweepError::SchedulerUnavailable { .. }
                | SweepError::ManifestMissing { .. }
                | SweepError::BatchHandleMissing { .. }
        )
    }

    /// Stable machine-readable code used in `--json` error payloads.
    pub fn code(&self) -> &'static str {
        match self {
            SweepError::Configuration(_) => "configuration_error",
            SweepError::CircularInheritance { .. } => "circular_inheritance",
            SweepError::SchedulerUnavailable { .. } => "scheduler_unavailable",
            SweepError::SchedulerCommandFailed { .. } => "scheduler_command_failed",
            SweepError::UnparsedSubmission { .. } => "unparsed_submission",
            SweepError::ManifestMissing { .. } => "manifest_missing",
            SweepError::BatchHandleMissing { .. } => "batch_handle_missing",
            SweepError::Io { .. } => "io_error",
            SweepError::Yaml { .. } => "yaml_error",
            SweepError::Json(_) => "json_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circular_inheritance_renders_full_chain() {
        let err = SweepError::CircularInheritance {
            chain: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "circular configuration inheritance: a -> b -> a"
        );
        assert_eq!(err.code(), "circular_inheritance");
    }

    #[test]
    fn only_unavailable_scheduler_is_fatal_among_scheduler_errors() {
        let missing = SweepError::SchedulerUnavailable {
            command: "sacct".to_string(),
        };
        let failed = SweepError::SchedulerCommandFailed {
            command: "sacct".to_string(),
            status: "1".to_string(),
            stderr: "slurm_load_jobs error".to_string(),
        };
        assert!(missing.is_fatal_for_polling());
        assert!(!failed.is_fatal_for_polling());
    }
}
