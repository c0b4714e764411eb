use chrono::Utc;
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use sweep_compiler::{generate_suite, CompileOptions};
use sweep_core::logging::invocation_log_dir;
use sweep_core::plan::{load_plan, SchedulerCommands};
use sweep_core::{read_batch_handle, BatchHandle, ExperimentLayout, ManifestStore, OpContext, Result};
use sweep_runner::{
    reconcile, submit_suite, wait_for_completion, ManualClock, Scheduler, StageInferencer,
    TaskStatus, WaitOptions, WaitOutcome, WaitTarget,
};

/// Accepts any submission and replays one accounting reply forever.
struct FakeSlurm {
    job_id: String,
    accounting: RefCell<String>,
    submitted: RefCell<Vec<PathBuf>>,
}

impl FakeSlurm {
    fn new(job_id: &str) -> Self {
        FakeSlurm {
            job_id: job_id.to_string(),
            accounting: RefCell::new(String::new()),
            submitted: RefCell::new(Vec::new()),
        }
    }

    fn set_accounting(&self, body: String) {
        *self.accounting.borrow_mut() = body;
    }
}

impl Scheduler for FakeSlurm {
    fn submit(&self, script: &Path, _env: &[(String, String)]) -> Result<String> {
        self.submitted.borrow_mut().push(script.to_path_buf());
        Ok(format!("Submitted batch job {}\n", self.job_id))
    }

    fn accounting(&self, _batch: &BatchHandle) -> Result<String> {
        Ok(self.accounting.borrow().clone())
    }

    fn queue(&self, _batch: &BatchHandle) -> Result<String> {
        Ok(format!("{}_[1-4] normal sweep user PD 0:00 1\n", self.job_id))
    }
}

fn seed_experiment() -> (PathBuf, ExperimentLayout) {
    let root = std::env::temp_dir().join(format!(
        "sweep_lifecycle_{}_{}",
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let cfg = root.join("config/shocktube");
    fs::create_dir_all(cfg.join("in")).expect("in");
    fs::create_dir_all(cfg.join("plan")).expect("plan");
    fs::write(
        cfg.join("in/run_in.yaml"),
        "format: yaml\ndata:\n  run_pars:\n    nt: 100\n  viscosity_run_pars:\n    nu: 0.01\n",
    )
    .expect("run_in");
    fs::write(
        cfg.join("in/cparam_local.yaml"),
        "format: yaml\ndata:\n  nxgrid: 128\n",
    )
    .expect("cparam");
    fs::write(
        cfg.join("plan/sweep.yaml"),
        "output_prefix: st\n\
         parameter_sweeps:\n  - { type: product, variable: nu, values: [1.0e-3, 1.0e-4] }\n\
         branches:\n  - { name: hll }\n  - { name: hllc }\n",
    )
    .expect("plan");
    let layout = ExperimentLayout::new(
        "shocktube",
        root.join("config"),
        root.join("runs"),
        root.join("logs"),
    );
    (root, layout)
}

#[test]
fn generate_submit_and_wait_until_timeout() {
    let (root, layout) = seed_experiment();
    let ctx = OpContext::capture("generate", "shocktube");
    let generated = generate_suite(&ctx, &layout, &CompileOptions::default()).expect("generate");
    assert_eq!(generated.runs, 4);

    let manifest = ManifestStore::for_layout(&layout).read().expect("manifest");
    assert_eq!(manifest.len(), 4);
    assert!(manifest[0].starts_with("st_hll_") && manifest[1].starts_with("st_hll_"));
    assert!(manifest[2].starts_with("st_hllc_") && manifest[3].starts_with("st_hllc_"));

    let slurm = FakeSlurm::new("777");
    let log_dir = invocation_log_dir(&layout.logs_root, "submission", &layout.experiment);
    let submission = submit_suite(
        &ctx,
        &layout,
        &slurm,
        &SchedulerCommands::default(),
        &log_dir,
    )
    .expect("submit");
    assert_eq!(submission.tasks, 4);
    assert_eq!(slurm.submitted.borrow()[0], layout.submit_script_path());
    let batch = read_batch_handle(&layout.batch_id_path()).expect("batch");
    assert_eq!(batch.as_str(), "777");

    slurm.set_accounting((1..=4).map(|t| format!("777_{}|PENDING\n", t)).collect());
    let plan = load_plan(&layout.plan_path()).expect("plan");
    let inferencer =
        StageInferencer::new(&plan.monitor.log_files, &plan.monitor.markers).expect("inferencer");
    let submission_root = layout.submission_logs_root();
    let target = WaitTarget {
        batch: &batch,
        manifest: &manifest,
        submission_logs_root: &submission_root,
        inferencer: &inferencer,
    };
    let options = WaitOptions {
        poll_interval: Duration::from_secs(30),
        max_wait: Some(Duration::from_secs(90)),
        initial_delay: Duration::ZERO,
        ..WaitOptions::default()
    };
    let clock = ManualClock::default();
    let outcome = wait_for_completion(&ctx, &slurm, &clock, &target, &options).expect("wait");
    match outcome {
        WaitOutcome::TimedOut { last, .. } => {
            let last = last.expect("at least one report");
            assert_eq!(last.count(TaskStatus::Pending), 4);
        }
        other => panic!("expected timeout, got {:?}", other),
    }

    fs::create_dir_all(log_dir.join("777/array_3")).expect("task log dir");
    fs::write(log_dir.join("777/array_3/pc_run.log"), "ERROR: blew up\n").expect("log");
    slurm.set_accounting(
        "777_1|COMPLETED\n777_2|COMPLETED\n777_3|FAILED\n777_4|COMPLETED\n".to_string(),
    );
    let report = reconcile(&ctx, &slurm, &batch, &manifest).expect("status");
    assert_eq!(report.failed_run_names, vec![manifest[2].clone()]);

    let clock = ManualClock::default();
    let outcome = wait_for_completion(&ctx, &slurm, &clock, &target, &options).expect("wait");
    assert!(matches!(outcome, WaitOutcome::CompletedWithFailures { polls: 1, .. }));
    assert!(ctx
        .captured()
        .iter()
        .any(|l| l.contains("ERROR: blew up")));
    let _ = fs::remove_dir_all(root);
}
