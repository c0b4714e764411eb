//! Fine-grained progress of one task from its append-only log files.

use crate::logs::tail_lines;
use regex::Regex;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use sweep_core::plan::{LogFileNames, StageMarkers};
use sweep_core::{Result, SweepError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initializing,
    Build,
    BuildComplete,
    Start,
    StartComplete,
    Run,
    Completed,
    Failed,
    Pending,
    Unknown,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Initializing => "initializing",
            Stage::Build => "build",
            Stage::BuildComplete => "build_complete",
            Stage::Start => "start",
            Stage::StartComplete => "start_complete",
            Stage::Run => "run",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
            Stage::Pending => "pending",
            Stage::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageInfo {
    pub stage: Stage,
    pub iteration: Option<u64>,
    pub detail: String,
    pub failed_log: Option<PathBuf>,
    pub error_tail: Option<Vec<String>>,
}

impl StageInfo {
    fn plain(stage: Stage, detail: impl Into<String>) -> Self {
        StageInfo {
            stage,
            iteration: None,
            detail: detail.into(),
            failed_log: None,
            error_tail: None,
        }
    }

    pub fn pending() -> Self {
        Self::plain(Stage::Pending, "no log directory yet")
    }
}

struct LogFile {
    label: &'static str,
    path: PathBuf,
    text: String,
}

fn read_log(label: &'static str, path: PathBuf) -> Option<LogFile> {
    match fs::read(&path) {
        Ok(bytes) => Some(LogFile {
            label,
            text: String::from_utf8_lossy(&bytes).into_owned(),
            path,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "unreadable task log");
            None
        }
    }
}

pub struct StageInferencer {
    log_files: LogFileNames,
    markers: StageMarkers,
    iteration_line: Regex,
}

impl StageInferencer {
    pub fn new(log_files: &LogFileNames, markers: &StageMarkers) -> Result<Self> {
        let iteration_line = Regex::new(r"^[ \t]+(\d+)[ \t]+")
            .map_err(|e| SweepError::config(format!("iteration pattern: {}", e)))?;
        Ok(StageInferencer {
            log_files: log_files.clone(),
            markers: markers.clone(),
            iteration_line,
        })
    }

    fn has_error(&self, text: &str) -> bool {
        let lowered_words: Vec<String> = self
            .markers
            .failure_words
            .iter()
            .map(|w| w.to_lowercase())
            .collect();
        text.lines().any(|line| {
            if self.markers.error.iter().any(|m| line.contains(m.as_str())) {
                return true;
            }
            let lower = line.to_lowercase();
            lowered_words.iter().any(|w| lower.contains(w.as_str()))
        })
    }

    /// Newest indented counter line, scanning one line at a time from the end.
    fn last_iteration(&self, text: &str) -> Option<u64> {
        text.lines().rev().find_map(|line| {
            self.iteration_line
                .captures(line)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok())
        })
    }

    fn contains_any(text: &str, needles: &[String]) -> bool {
        let lower = text.to_lowercase();
        needles.iter().any(|n| lower.contains(&n.to_lowercase()))
    }

    fn run_completion(&self, text: &str) -> Option<&'static str> {
        let lines: Vec<&str> = text.lines().collect();
        let standalone_start = lines.len().saturating_sub(self.markers.standalone_window);
        let done = self.markers.standalone_done.to_lowercase();
        if lines[standalone_start..]
            .iter()
            .any(|l| l.trim().to_lowercase() == done)
        {
            return Some("Run completed successfully");
        }
        let window_start = lines.len().saturating_sub(self.markers.completion_window);
        let window = lines[window_start..].join("\n");
        if Self::contains_any(&window, &self.markers.run_completion) {
            return Some("Run finished successfully");
        }
        None
    }

    /// `None` means the task has no log directory.
    pub fn infer(&self, dir: Option<&Path>) -> StageInfo {
        let Some(dir) = dir.filter(|d| d.is_dir()) else {
            return StageInfo::plain(Stage::Unknown, "no log directory");
        };
        let run = read_log("run", dir.join(&self.log_files.run));
        let start = read_log("start", dir.join(&self.log_files.start));
        let build = read_log("build", dir.join(&self.log_files.build));

        for log in [&run, &start, &build].into_iter().flatten() {
            if self.has_error(&log.text) {
                return StageInfo {
                    stage: Stage::Failed,
                    iteration: None,
                    detail: format!("{} failed", log.label),
                    failed_log: Some(log.path.clone()),
                    error_tail: Some(tail_lines(&log.path, self.markers.error_tail_lines)),
                };
            }
        }

        if let Some(run) = &run {
            let iteration = self.last_iteration(&run.text);
            if let Some(detail) = self.run_completion(&run.text) {
                return StageInfo {
                    iteration,
                    ..StageInfo::plain(Stage::Completed, detail)
                };
            }
            let detail = match iteration {
                Some(i) => format!("iteration {}", i),
                None => "run started".to_string(),
            };
            return StageInfo {
                iteration,
                ..StageInfo::plain(Stage::Run, detail)
            };
        }
        if let Some(start) = &start {
            return if Self::contains_any(&start.text, &self.markers.start_completion) {
                StageInfo::plain(Stage::StartComplete, "initial conditions written")
            } else {
                StageInfo::plain(Stage::Start, "generating initial conditions")
            };
        }
        if let Some(build) = &build {
            return if Self::contains_any(&build.text, &self.markers.build_completion) {
                StageInfo::plain(Stage::BuildComplete, "build finished")
            } else {
                StageInfo::plain(Stage::Build, "compiling")
            };
        }
        StageInfo::plain(Stage::Initializing, "waiting for first log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn task_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "sweep_stage_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("dir");
        dir
    }

    fn inferencer() -> StageInferencer {
        StageInferencer::new(&LogFileNames::default(), &StageMarkers::default()).expect("inferencer")
    }

    #[test]
    fn standalone_done_completes_the_run() {
        let dir = task_dir("done");
        let mut body = String::new();
        for i in 1..=30 {
            body.push_str(&format!("   {}   0.1  0.2\n", i * 10));
        }
        body.push_str("done\n");
        fs::write(dir.join("pc_run.log"), body).expect("run log");
        let info = inferencer().infer(Some(&dir));
        assert_eq!(info.stage, Stage::Completed);
        assert_eq!(info.detail, "Run completed successfully");
        assert_eq!(info.iteration, Some(300));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn build_error_fails_with_bounded_tail() {
        let dir = task_dir("build_err");
        let mut body = String::new();
        for i in 0..40 {
            body.push_str(&format!("compiling unit {}\n", i));
        }
        body.push_str("ERROR: disk full\n");
        fs::write(dir.join("pc_build.log"), body).expect("build log");
        let info = inferencer().infer(Some(&dir));
        assert_eq!(info.stage, Stage::Failed);
        let tail = info.error_tail.expect("tail");
        assert!(tail.len() <= 15);
        assert_eq!(tail.last().map(|s| s.as_str()), Some("ERROR: disk full"));
        assert_eq!(info.failed_log, Some(dir.join("pc_build.log")));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn run_log_takes_priority_and_reports_latest_iteration() {
        let dir = task_dir("running");
        fs::write(dir.join("pc_build.log"), "build finished\n").expect("build");
        fs::write(dir.join("pc_start.log"), "start completed successfully\n").expect("start");
        fs::write(
            dir.join("pc_run.log"),
            "--it-----t------dt\n     10  0.01  1e-3\n     20  0.02  1e-3\n",
        )
        .expect("run");
        let info = inferencer().infer(Some(&dir));
        assert_eq!(info.stage, Stage::Run);
        assert_eq!(info.iteration, Some(20));
        assert_eq!(info.detail, "iteration 20");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn iteration_lines_are_matched_one_line_at_a_time() {
        let inf = inferencer();
        assert_eq!(inf.last_iteration("     10\n     20  x\n"), Some(20));
        assert_eq!(inf.last_iteration("  header\n\n42 foo\n"), None);
        assert_eq!(inf.last_iteration("     7  a\n\n  trailing text\n"), Some(7));
        assert_eq!(inf.last_iteration(""), None);
    }

    #[test]
    fn failure_word_is_case_insensitive_and_checked_across_logs() {
        let dir = task_dir("start_fail");
        fs::write(dir.join("pc_start.log"), "Start FAILED: missing run.in\n").expect("start");
        fs::write(dir.join("pc_run.log"), "     1  0.0\n").expect("run");
        let info = inferencer().infer(Some(&dir));
        assert_eq!(info.stage, Stage::Failed);
        assert_eq!(info.detail, "start failed");
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn earlier_stages_and_empty_directories() {
        let dir = task_dir("early");
        let inf = inferencer();
        assert_eq!(inf.infer(Some(&dir)).stage, Stage::Initializing);
        fs::write(dir.join("pc_build.log"), "make: compiling\n").expect("build");
        assert_eq!(inf.infer(Some(&dir)).stage, Stage::Build);
        fs::write(dir.join("pc_build.log"), "build completed successfully\n").expect("build");
        assert_eq!(inf.infer(Some(&dir)).stage, Stage::BuildComplete);
        fs::write(dir.join("pc_start.log"), "writing var.dat\n").expect("start");
        assert_eq!(inf.infer(Some(&dir)).stage, Stage::Start);
        fs::write(dir.join("pc_start.log"), "start.x completed successfully\n").expect("start");
        assert_eq!(inf.infer(Some(&dir)).stage, Stage::StartComplete);
        assert_eq!(inf.infer(None).stage, Stage::Unknown);
        assert_eq!(inf.infer(Some(&dir.join("missing"))).stage, Stage::Unknown);
        let _ = fs::remove_dir_all(dir);
    }
}
