//! Discovery of per-task log directories.
//!
//! ```text
//! <submission_logs_root>/sub_<stamp>/<job id>/array_<task id>/pc_*.log
//! ```
//!
//! Only the latest `sub_*` directory (by name) is considered.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use sweep_core::BatchHandle;
use walkdir::WalkDir;

#[derive(Debug, Clone, Default)]
pub struct TaskLogIndex {
    submission_dir: Option<PathBuf>,
    tasks: BTreeMap<usize, PathBuf>,
}

pub fn latest_submission_dir(root: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(root).ok()?;
    entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter(|e| e.file_name().to_string_lossy().starts_with("sub_"))
        .map(|e| e.path())
        .max()
}

fn numeric(name: &str) -> Option<u64> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

impl TaskLogIndex {
    /// Index the latest submission under `root`. When `batch` is given, its
    /// job directory wins over older job directories for the same task id.
    pub fn discover(root: &Path, batch: Option<&BatchHandle>) -> Self {
        let Some(submission_dir) = latest_submission_dir(root) else {
            return TaskLogIndex::default();
        };
        let preferred = batch.and_then(|b| numeric(b.as_str()));
        let mut found: Vec<(bool, u64, usize, PathBuf)> = Vec::new();
        for entry in WalkDir::new(&submission_dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_dir() {
                continue;
            }
            let Some(task) = entry
                .file_name()
                .to_str()
                .and_then(|n| n.strip_prefix("array_"))
                .and_then(numeric)
            else {
                continue;
            };
            let Some(job) = entry
                .path()
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                .and_then(numeric)
            else {
                continue;
            };
            found.push((
                Some(job) == preferred,
                job,
                task as usize,
                entry.path().to_path_buf(),
            ));
        }
        found.sort();
        let tasks = found
            .into_iter()
            .map(|(_, _, task, path)| (task, path))
            .collect();
        TaskLogIndex {
            submission_dir: Some(submission_dir),
            tasks,
        }
    }

    pub fn submission_dir(&self) -> Option<&Path> {
        self.submission_dir.as_deref()
    }

    pub fn task_dir(&self, task_id: usize) -> Option<&Path> {
        self.tasks.get(&task_id).map(|p| p.as_path())
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}

/// Last `n` lines of a file, lossily decoded. Missing files yield nothing.
pub fn tail_lines(path: &Path, n: usize) -> Vec<String> {
    match fs::read(path) {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes);
            let lines: Vec<&str> = text.lines().collect();
            let start = lines.len().saturating_sub(n);
            lines[start..].iter().map(|l| l.to_string()).collect()
        }
        Err(_) => Vec::new(),
    }
}
