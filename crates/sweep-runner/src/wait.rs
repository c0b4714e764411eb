//! Polling loop that waits for an array job to finish.
//!
//! Never cancels anything on the scheduler; a timeout only stops watching.

use crate::logs::TaskLogIndex;
use crate::monitor::{collect_progress, print_progress};
use crate::reconcile::{reconcile, StatusReport, TaskStatus};
use crate::scheduler::Scheduler;
use crate::stage::StageInferencer;
use serde::Serialize;
use std::cell::{Cell, RefCell};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};
use sweep_core::{BatchHandle, OpContext, Result};

pub trait Clock {
    /// Time since an arbitrary fixed origin.
    fn elapsed(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Clock that advances only when slept on.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Cell<Duration>,
    sleeps: RefCell<Vec<Duration>>,
}

impl ManualClock {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }
}

impl Clock for ManualClock {
    fn elapsed(&self) -> Duration {
        self.now.get()
    }

    fn sleep(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
        self.sleeps.borrow_mut().push(duration);
    }
}

#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub poll_interval: Duration,
    pub max_wait: Option<Duration>,
    pub initial_delay: Duration,
    /// Print the per-task stage table every n-th poll (0 disables it).
    pub detail_every: u32,
    /// Before this poll, "all done" without any task logs is not trusted.
    pub guard_polls: u32,
}

impl Default for WaitOptions {
    fn default() -> Self {
        WaitOptions {
            poll_interval: Duration::from_secs(60),
            max_wait: None,
            initial_delay: Duration::from_secs(5),
            detail_every: 3,
            guard_polls: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WaitOutcome {
    Succeeded { polls: u32, report: StatusReport },
    CompletedWithFailures { polls: u32, report: StatusReport },
    TimedOut { polls: u32, last: Option<StatusReport> },
}

impl WaitOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, WaitOutcome::Succeeded { .. })
    }
}

pub struct WaitTarget<'a> {
    pub batch: &'a BatchHandle,
    pub manifest: &'a [String],
    pub submission_logs_root: &'a Path,
    pub inferencer: &'a StageInferencer,
}

fn show_progress(ctx: &OpContext, target: &WaitTarget<'_>, poll: u32) {
    let index = TaskLogIndex::discover(target.submission_logs_root, Some(target.batch));
    let progress = collect_progress(&index, target.inferencer, target.manifest);
    ctx.say(format!("=== poll #{} detailed progress ===", poll));
    print_progress(ctx, &progress);
}

pub fn wait_for_completion(
    ctx: &OpContext,
    scheduler: &dyn Scheduler,
    clock: &dyn Clock,
    target: &WaitTarget<'_>,
    options: &WaitOptions,
) -> Result<WaitOutcome> {
    let _span = ctx.span().enter();
    ctx.say(format!(
        "waiting for batch {} ({} task(s)); poll every {}s",
        target.batch,
        target.manifest.len(),
        options.poll_interval.as_secs()
    ));
    if !options.initial_delay.is_zero() {
        clock.sleep(options.initial_delay);
    }
    let started = clock.elapsed();
    let mut poll: u32 = 0;
    let mut last: Option<StatusReport> = None;
    loop {
        poll += 1;
        match reconcile(ctx, scheduler, target.batch, target.manifest) {
            Ok(report) => {
                let detailed = options.detail_every > 0 && poll % options.detail_every == 0;
                if detailed {
                    show_progress(ctx, target, poll);
                }
                if report.is_finished() {
                    let index = TaskLogIndex::discover(target.submission_logs_root, Some(target.batch));
                    if index.is_empty() && poll < options.guard_polls {
                        tracing::info!(poll, "scheduler reports done but no task logs exist yet");
                        ctx.say("all tasks reported done but no task logs found yet; still waiting");
                    } else {
                        if !detailed {
                            show_progress(ctx, target, poll);
                        }
                        let failed = report.count(TaskStatus::Failed);
                        return Ok(if failed > 0 {
                            tracing::warn!(failed, "array job finished with failures");
                            WaitOutcome::CompletedWithFailures { polls: poll, report }
                        } else {
                            tracing::info!(polls = poll, "array job finished");
                            WaitOutcome::Succeeded { polls: poll, report }
                        });
                    }
                } else {
                    ctx.say(format!("poll #{}: {}", poll, report.summary_line()));
                }
                last = Some(report);
            }
            Err(err) if err.is_fatal_for_polling() => return Err(err),
            Err(err) => {
                tracing::warn!(poll, error = %err, "status check failed; retrying next poll");
                ctx.say(format!("poll #{}: status check failed: {}", poll, err));
            }
        }
        if let Some(max_wait) = options.max_wait {
            if clock.elapsed().saturating_sub(started) > max_wait {
                tracing::warn!(max_wait_secs = max_wait.as_secs(), "timed out waiting for batch");
                return Ok(WaitOutcome::TimedOut { polls: poll, last });
            }
        }
        clock.sleep(options.poll_interval);
    }
}
