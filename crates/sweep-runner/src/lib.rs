pub mod logs;
pub mod monitor;
pub mod reconcile;
pub mod scheduler;
pub mod stage;
pub mod submit;
pub mod wait;

pub use logs::{latest_submission_dir, tail_lines, TaskLogIndex};
pub use monitor::{collect_progress, print_progress, ProgressReport, TaskProgress};
pub use reconcile::{
    classify, parse_accounting, reconcile, StatusReport, StatusSource, TaskReport, TaskStatus,
};
pub use scheduler::{Scheduler, SlurmScheduler};
pub use stage::{Stage, StageInferencer, StageInfo};
pub use submit::{parse_batch_id, submit_suite, Submission};
pub use wait::{
    wait_for_completion, Clock, ManualClock, SystemClock, WaitOptions, WaitOutcome, WaitTarget,
};
