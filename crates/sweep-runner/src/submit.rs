use crate::scheduler::Scheduler;
use regex::Regex;
use serde::Serialize;
use std::path::{Path, PathBuf};
use sweep_core::layout::SUBMISSION_LOG_DIR_ENV;
use sweep_core::plan::SchedulerCommands;
use sweep_core::{
    ensure_dir, write_batch_handle, BatchHandle, ExperimentLayout, ManifestStore, OpContext,
    Result, SweepError,
};

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub batch: BatchHandle,
    pub tasks: usize,
    pub batch_id_path: PathBuf,
    /// Root of the per-task log directories for this submission.
    pub log_dir: PathBuf,
}

/// Pull the batch id out of the submission output with `pattern`'s first
/// capture group.
pub fn parse_batch_id(pattern: &str, stdout: &str) -> Result<BatchHandle> {
    let re = Regex::new(pattern)
        .map_err(|e| SweepError::config(format!("invalid submit_pattern '{}': {}", pattern, e)))?;
    if re.captures_len() < 2 {
        return Err(SweepError::config(format!(
            "submit_pattern '{}' needs a capture group for the batch id",
            pattern
        )));
    }
    let id = re
        .captures(stdout)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| SweepError::UnparsedSubmission {
            stdout: stdout.to_string(),
        })?;
    BatchHandle::new(id)
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Submit the generated suite as one array job and persist its handle.
pub fn submit_suite(
    ctx: &OpContext,
    layout: &ExperimentLayout,
    scheduler: &dyn Scheduler,
    commands: &SchedulerCommands,
    log_dir: &Path,
) -> Result<Submission> {
    let script = layout.submit_script_path();
    if !script.is_file() {
        return Err(SweepError::config(format!(
            "no submit script at {} (generate the suite first)",
            script.display()
        )));
    }
    let (runs, origin) = ManifestStore::for_layout(layout).load(ctx)?;
    if runs.is_empty() {
        return Err(SweepError::config("manifest lists no runs"));
    }

    let log_dir = absolute(log_dir);
    ensure_dir(&log_dir)?;
    let env = vec![(
        SUBMISSION_LOG_DIR_ENV.to_string(),
        log_dir.to_string_lossy().to_string(),
    )];

    let _span = ctx.span().enter();
    if origin.is_order_unsafe() {
        tracing::warn!("submitting against a regenerated manifest");
    }
    tracing::info!(script = %script.display(), tasks = runs.len(), "submitting array job");
    let stdout = scheduler.submit(&script, &env)?;
    let batch = parse_batch_id(&commands.submit_pattern, &stdout)?;
    let batch_id_path = layout.batch_id_path();
    write_batch_handle(&batch_id_path, &batch)?;
    tracing::info!(batch = %batch, log_dir = %log_dir.display(), "submitted");
    ctx.say(format!("submitted batch {} with {} task(s)", batch, runs.len()));
    ctx.say(format!("task logs: {}", log_dir.display()));

    Ok(Submission {
        batch,
        tasks: runs.len(),
        batch_id_path,
        log_dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::cell::RefCell;
    use std::fs;
    use sweep_core::read_batch_handle;

    struct RecordingScheduler {
        reply: String,
        env_seen: RefCell<Vec<(String, String)>>,
    }

    impl Scheduler for RecordingScheduler {
        fn submit(&self, _script: &Path, env: &[(String, String)]) -> Result<String> {
            self.env_seen.borrow_mut().extend(env.iter().cloned());
            Ok(self.reply.clone())
        }

        fn accounting(&self, _batch: &BatchHandle) -> Result<String> {
            Ok(String::new())
        }

        fn queue(&self, _batch: &BatchHandle) -> Result<String> {
            Ok(String::new())
        }
    }

    fn layout(label: &str) -> ExperimentLayout {
        let root = std::env::temp_dir().join(format!(
            "sweep_submit_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let layout = ExperimentLayout::new("st", root.join("config"), root.join("runs"), root.join("logs"));
        ensure_dir(&layout.experiment_dir()).expect("exp dir");
        fs::write(layout.submit_script_path(), "#!/bin/bash\n").expect("script");
        ManifestStore::for_layout(&layout)
            .write(&["r1".to_string(), "r2".to_string()])
            .expect("manifest");
        layout
    }

    #[test]
    fn parses_default_pattern() {
        let pattern = SchedulerCommands::default().submit_pattern;
        let batch = parse_batch_id(&pattern, "Submitted batch job 123456\n").expect("parse");
        assert_eq!(batch.as_str(), "123456");
    }

    #[test]
    fn unparsable_output_surfaces_raw_stdout() {
        let pattern = SchedulerCommands::default().submit_pattern;
        match parse_batch_id(&pattern, "sbatch: error: invalid partition") {
            Err(SweepError::UnparsedSubmission { stdout }) => {
                assert_eq!(stdout, "sbatch: error: invalid partition")
            }
            other => panic!("expected unparsed, got {:?}", other),
        }
        assert!(parse_batch_id(r"job \d+", "job 5").is_err());
    }

    #[test]
    fn submission_persists_handle_and_exports_log_dir() {
        let layout = layout("ok");
        let scheduler = RecordingScheduler {
            reply: "Submitted batch job 4242\n".to_string(),
            env_seen: RefCell::new(Vec::new()),
        };
        let ctx = OpContext::capture("submit", "st");
        let log_dir = layout.submission_logs_root().join("sub_202501010000");
        let submission = submit_suite(
            &ctx,
            &layout,
            &scheduler,
            &SchedulerCommands::default(),
            &log_dir,
        )
        .expect("submit");
        assert_eq!(submission.tasks, 2);
        assert_eq!(read_batch_handle(&layout.batch_id_path()).expect("read").as_str(), "4242");
        let env = scheduler.env_seen.borrow();
        assert_eq!(env[0].0, SUBMISSION_LOG_DIR_ENV);
        assert!(env[0].1.ends_with("sub_202501010000"));
        assert!(log_dir.is_dir());
        let _ = fs::remove_dir_all(layout.runs_root.parent().expect("root"));
    }

    #[test]
    fn failed_parse_leaves_no_handle_behind() {
        let layout = layout("bad");
        let scheduler = RecordingScheduler {
            reply: "queue full".to_string(),
            env_seen: RefCell::new(Vec::new()),
        };
        let ctx = OpContext::capture("submit", "st");
        let result = submit_suite(
            &ctx,
            &layout,
            &scheduler,
            &SchedulerCommands::default(),
            &layout.submission_logs_root().join("sub_x"),
        );
        assert!(matches!(result, Err(SweepError::UnparsedSubmission { .. })));
        assert!(!layout.batch_id_path().exists());
        let _ = fs::remove_dir_all(layout.runs_root.parent().expect("root"));
    }
}
