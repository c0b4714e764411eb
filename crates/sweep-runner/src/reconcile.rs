//! Per-task status from scheduler accounting, with a queue fallback when
//! accounting has nothing to say yet.

use crate::scheduler::Scheduler;
use serde::Serialize;
use std::collections::BTreeMap;
use sweep_core::{BatchHandle, OpContext, Result, SweepError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Completed,
    Failed,
    Running,
    Pending,
    Other,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Running,
        TaskStatus::Pending,
        TaskStatus::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Pending => "PENDING",
            TaskStatus::Other => "OTHER",
        }
    }
}

/// Map a raw scheduler state (`CANCELLED by 123`, `COMPLETED`, ...) onto
/// [`TaskStatus`].
pub fn classify(raw: &str) -> TaskStatus {
    let raw = raw.to_ascii_uppercase();
    if raw.contains("COMPLETED") {
        TaskStatus::Completed
    } else if raw.contains("FAILED") || raw.contains("CANCELLED") || raw.contains("TIMEOUT") {
        TaskStatus::Failed
    } else if raw.contains("PENDING") {
        TaskStatus::Pending
    } else if raw.contains("RUNNING") {
        TaskStatus::Running
    } else {
        TaskStatus::Other
    }
}

/// `<batch>_<task>|<state>` lines -> task -> raw state. Step lines
/// (`123_1.batch`), the array summary (`123_[1-4]`) and other batches are
/// skipped. A later line for the same task wins.
pub fn parse_accounting(batch: &BatchHandle, output: &str) -> BTreeMap<usize, String> {
    let prefix = format!("{}_", batch.as_str());
    let mut tasks = BTreeMap::new();
    for line in output.lines() {
        let line = line.trim();
        let Some((token, state)) = line.split_once('|') else {
            continue;
        };
        let Some(index) = token.trim().strip_prefix(&prefix) else {
            continue;
        };
        if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if let Ok(task) = index.parse::<usize>() {
            let state = state.split('|').next().unwrap_or("").trim().to_string();
            tasks.insert(task, state);
        }
    }
    tasks
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusSource {
    Accounting,
    /// Accounting was empty but the queue still knows the batch.
    QueuedNotYetAccounted,
    /// Neither accounting nor the queue knows the batch; assumed finished.
    AssumedCompleted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskReport {
    pub task_id: usize,
    pub run_name: String,
    pub status: TaskStatus,
    pub raw_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub batch: BatchHandle,
    pub total: usize,
    pub counts: BTreeMap<TaskStatus, usize>,
    pub failed_run_names: Vec<String>,
    pub tasks: Vec<TaskReport>,
    pub source: StatusSource,
}

impl StatusReport {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or(0)
    }

    /// Every task reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.count(TaskStatus::Completed) + self.count(TaskStatus::Failed) == self.total
            && self.count(TaskStatus::Pending) == 0
            && self.count(TaskStatus::Running) == 0
    }

    pub fn summary_line(&self) -> String {
        TaskStatus::ALL
            .iter()
            .map(|s| format!("{}={}", s.as_str(), self.count(*s)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn build_report(
    batch: &BatchHandle,
    manifest: &[String],
    raw: &BTreeMap<usize, String>,
    fill: TaskStatus,
    source: StatusSource,
) -> StatusReport {
    let mut counts: BTreeMap<TaskStatus, usize> =
        TaskStatus::ALL.iter().map(|s| (*s, 0)).collect();
    let mut failed_run_names = Vec::new();
    let mut tasks = Vec::with_capacity(manifest.len());
    for (i, run_name) in manifest.iter().enumerate() {
        let task_id = i + 1;
        let raw_state = raw.get(&task_id).cloned();
        let status = match &raw_state {
            Some(state) => classify(state),
            None => fill,
        };
        *counts.entry(status).or_insert(0) += 1;
        if status == TaskStatus::Failed {
            failed_run_names.push(run_name.clone());
        }
        tasks.push(TaskReport {
            task_id,
            run_name: run_name.clone(),
            status,
            raw_state,
        });
    }
    StatusReport {
        batch: batch.clone(),
        total: manifest.len(),
        counts,
        failed_run_names,
        tasks,
        source,
    }
}

pub fn reconcile(
    ctx: &OpContext,
    scheduler: &dyn Scheduler,
    batch: &BatchHandle,
    manifest: &[String],
) -> Result<StatusReport> {
    let output = scheduler.accounting(batch)?;
    let raw = parse_accounting(batch, &output);
    let _span = ctx.span().enter();
    if !raw.is_empty() {
        let unknown = raw.keys().filter(|t| **t == 0 || **t > manifest.len()).count();
        if unknown > 0 {
            tracing::warn!(unknown, "accounting lists tasks outside the manifest");
        }
        return Ok(build_report(
            batch,
            manifest,
            &raw,
            TaskStatus::Pending,
            StatusSource::Accounting,
        ));
    }

    tracing::debug!(batch = %batch, "accounting returned no task lines; checking the queue");
    let queued = match scheduler.queue(batch) {
        Ok(out) => !out.trim().is_empty(),
        Err(err @ SweepError::SchedulerUnavailable { .. }) => return Err(err),
        Err(err) => {
            // squeue exits non-zero for batch ids it no longer knows.
            tracing::debug!(error = %err, "queue query failed; treating batch as not queued");
            false
        }
    };
    if queued {
        return Ok(build_report(
            batch,
            manifest,
            &raw,
            TaskStatus::Pending,
            StatusSource::QueuedNotYetAccounted,
        ));
    }
    tracing::warn!(
        batch = %batch,
        "batch unknown to accounting and queue; assuming all tasks completed"
    );
    ctx.say(format!(
        "warning: batch {} is unknown to both accounting and the queue; assuming completed",
        batch
    ));
    Ok(build_report(
        batch,
        manifest,
        &raw,
        TaskStatus::Completed,
        StatusSource::AssumedCompleted,
    ))
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::path::Path;

    /// Replays scripted accounting/queue replies; the last reply repeats.
    pub struct ScriptedScheduler {
        pub accounting: RefCell<VecDeque<Result<String>>>,
        pub queue: RefCell<VecDeque<Result<String>>>,
        pub accounting_calls: RefCell<usize>,
    }

    impl ScriptedScheduler {
        pub fn new(accounting: Vec<Result<String>>, queue: Vec<Result<String>>) -> Self {
            ScriptedScheduler {
                accounting: RefCell::new(accounting.into()),
                queue: RefCell::new(queue.into()),
                accounting_calls: RefCell::new(0),
            }
        }

        fn next(queue: &RefCell<VecDeque<Result<String>>>) -> Result<String> {
            let mut q = queue.borrow_mut();
            if q.len() > 1 {
                return q.pop_front().unwrap_or_else(|| Ok(String::new()));
            }
            match q.front() {
                Some(Ok(s)) => Ok(s.clone()),
                Some(Err(SweepError::SchedulerUnavailable { command })) => {
                    Err(SweepError::SchedulerUnavailable {
                        command: command.clone(),
                    })
                }
                Some(Err(SweepError::SchedulerCommandFailed {
                    command,
                    status,
                    stderr,
                })) => Err(SweepError::SchedulerCommandFailed {
                    command: command.clone(),
                    status: status.clone(),
                    stderr: stderr.clone(),
                }),
                Some(Err(other)) => Err(SweepError::config(other.to_string())),
                None => Ok(String::new()),
            }
        }
    }

    impl Scheduler for ScriptedScheduler {
        fn submit(&self, _script: &Path, _env: &[(String, String)]) -> Result<String> {
            Ok("Submitted batch job 123\n".to_string())
        }

        fn accounting(&self, _batch: &BatchHandle) -> Result<String> {
            *self.accounting_calls.borrow_mut() += 1;
            Self::next(&self.accounting)
        }

        fn queue(&self, _batch: &BatchHandle) -> Result<String> {
            Self::next(&self.queue)
        }
    }
}
