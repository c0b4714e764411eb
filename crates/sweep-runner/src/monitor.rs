use crate::logs::TaskLogIndex;
use crate::stage::{Stage, StageInferencer, StageInfo};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use sweep_core::OpContext;

#[derive(Debug, Clone, Serialize)]
pub struct TaskProgress {
    pub task_id: usize,
    pub run_name: String,
    pub log_dir: Option<PathBuf>,
    #[serde(flatten)]
    pub info: StageInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressReport {
    pub submission_dir: Option<PathBuf>,
    pub log_dirs_found: usize,
    pub stage_counts: BTreeMap<Stage, usize>,
    pub tasks: Vec<TaskProgress>,
}

impl ProgressReport {
    pub fn failed(&self) -> impl Iterator<Item = &TaskProgress> {
        self.tasks.iter().filter(|t| t.info.stage == Stage::Failed)
    }

    pub fn count(&self, stage: Stage) -> usize {
        self.stage_counts.get(&stage).copied().unwrap_or(0)
    }
}

/// Stage of every manifest task. Tasks without a log directory are pending.
pub fn collect_progress(
    index: &TaskLogIndex,
    inferencer: &StageInferencer,
    manifest: &[String],
) -> ProgressReport {
    let mut stage_counts = BTreeMap::new();
    let mut tasks = Vec::with_capacity(manifest.len());
    for (i, run_name) in manifest.iter().enumerate() {
        let task_id = i + 1;
        let log_dir = index.task_dir(task_id).map(|p| p.to_path_buf());
        let info = match &log_dir {
            Some(dir) => inferencer.infer(Some(dir)),
            None => StageInfo::pending(),
        };
        *stage_counts.entry(info.stage).or_insert(0) += 1;
        tasks.push(TaskProgress {
            task_id,
            run_name: run_name.clone(),
            log_dir,
            info,
        });
    }
    ProgressReport {
        submission_dir: index.submission_dir().map(|p| p.to_path_buf()),
        log_dirs_found: index.len(),
        stage_counts,
        tasks,
    }
}

/// Per-task table followed by failure excerpts.
pub fn print_progress(ctx: &OpContext, report: &ProgressReport) {
    let width = report
        .tasks
        .iter()
        .map(|t| t.run_name.len())
        .max()
        .unwrap_or(8)
        .max(8);
    ctx.say(format!("{:>5}  {:<width$}  {:<15}  detail", "task", "run", "stage", width = width));
    for task in &report.tasks {
        ctx.say(format!(
            "{:>5}  {:<width$}  {:<15}  {}",
            task.task_id,
            task.run_name,
            task.info.stage.as_str(),
            task.info.detail,
            width = width
        ));
    }
    let counts = report
        .stage_counts
        .iter()
        .map(|(stage, n)| format!("{}={}", stage.as_str(), n))
        .collect::<Vec<_>>()
        .join(" ");
    ctx.say(format!("stages: {}", counts));
    for task in report.failed() {
        ctx.say(format!("--- task {} ({}) failed ---", task.task_id, task.run_name));
        if let Some(path) = &task.info.failed_log {
            ctx.say(format!("log: {}", path.display()));
        }
        for line in task.info.error_tail.iter().flatten() {
            ctx.say(format!("  {}", line));
        }
    }
}
