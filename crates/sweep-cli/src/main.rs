use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use sweep_analysis::{analyze_suite, check_integrity, SimulationValidator, DEFAULT_SAMPLE_SIZE};
use sweep_compiler::{compile_experiment, generate_suite, CompileOptions};
use sweep_core::layout::list_experiments;
use sweep_core::logging::{init_logging, init_terminal_logging};
use sweep_core::plan::{load_plan, SweepPlan};
use sweep_core::{
    read_batch_handle, Console, ExperimentLayout, ManifestStore, OpContext, SweepError,
};
use sweep_runner::{
    collect_progress, print_progress, reconcile, submit_suite, wait_for_completion, SlurmScheduler,
    StageInferencer, SystemClock, TaskLogIndex, WaitOptions, WaitOutcome, WaitTarget,
};

#[derive(Parser)]
#[command(name = "sweep", version = "0.3.0", about = "Parameter-sweep compiler and HPC job tracker")]
struct Cli {
    #[command(flatten)]
    roots: Roots,
    /// Debug-level logging (RUST_LOG still wins).
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct Roots {
    #[arg(long, global = true, default_value = "config")]
    config_root: PathBuf,
    #[arg(long, global = true, default_value = "runs")]
    runs_root: PathBuf,
    #[arg(long, global = true, default_value = "logs")]
    logs_root: PathBuf,
}

impl Roots {
    fn layout(&self, experiment: &str) -> ExperimentLayout {
        ExperimentLayout::new(
            experiment,
            &self.config_root,
            &self.runs_root,
            &self.logs_root,
        )
    }
}

#[derive(Subcommand)]
enum Commands {
    Generate {
        experiment: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        rebuild: bool,
        #[arg(long)]
        json: bool,
    },
    Describe {
        experiment: String,
        #[arg(long)]
        json: bool,
    },
    Submit {
        experiment: String,
        #[arg(long)]
        json: bool,
    },
    Status {
        experiment: String,
        #[arg(long)]
        json: bool,
    },
    Monitor {
        experiment: String,
        #[arg(long)]
        json: bool,
    },
    Wait {
        experiment: String,
        #[arg(long, default_value_t = 60)]
        poll_interval: u64,
        #[arg(long)]
        max_wait: Option<u64>,
        #[arg(long, default_value_t = 5)]
        initial_delay: u64,
        #[arg(long, default_value_t = 3)]
        detail_every: u32,
        /// Runs the integrity check samples once the batch finishes (0 = all).
        #[arg(long, default_value_t = DEFAULT_SAMPLE_SIZE)]
        sample_size: usize,
        #[arg(long)]
        json: bool,
    },
    Validate {
        experiment: String,
        /// Directory holding `<run>/*.json` snapshots; defaults to the
        /// experiment's outputs directory.
        #[arg(long)]
        outputs: Option<PathBuf>,
        /// Runs the integrity check samples (0 = all).
        #[arg(long, default_value_t = DEFAULT_SAMPLE_SIZE)]
        sample_size: usize,
        #[arg(long)]
        json: bool,
    },
    List {
        #[arg(long)]
        json: bool,
    },
    Clean {
        experiment: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(&cli.roots, cli.verbose, cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<SweepError>()
                    .map(|e| e.code())
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, err.to_string(), error_details(&err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

/// Log directory name for a command. `submit` logs into the per-submission
/// directory that also receives the task logs.
fn log_command_name(command: &Commands) -> &'static str {
    match command {
        Commands::Generate { .. } => "generate",
        Commands::Describe { .. } => "describe",
        Commands::Submit { .. } => "submission",
        Commands::Status { .. } => "status",
        Commands::Monitor { .. } => "monitor",
        Commands::Wait { .. } => "wait",
        Commands::Validate { .. } => "validate",
        Commands::List { .. } => "list",
        Commands::Clean { .. } => "clean",
    }
}

fn context(operation: &str, experiment: &str, json: bool) -> OpContext {
    let console = if json { Console::Silent } else { Console::Stdout };
    OpContext::new(operation, experiment, console)
}

fn plan_for(layout: &ExperimentLayout) -> Result<SweepPlan> {
    let path = layout.plan_path();
    if !path.is_file() {
        return Err(SweepError::config(format!("no sweep plan at {}", path.display())).into());
    }
    Ok(load_plan(&path)?)
}

fn run_command(roots: &Roots, verbose: bool, command: Commands) -> Result<Option<Value>> {
    let log_name = log_command_name(&command);
    match command {
        Commands::Generate {
            experiment,
            limit,
            rebuild,
            json,
        } => {
            let layout = roots.layout(&experiment);
            let guard = init_logging(&roots.logs_root, log_name, &experiment, verbose)?;
            let ctx = context("generate", &experiment, json);
            let options = CompileOptions {
                limit,
                force_rebuild: rebuild,
                ..CompileOptions::default()
            };
            let generated = generate_suite(&ctx, &layout, &options)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "generate",
                    "suite": generated,
                    "log": guard.log_path.display().to_string(),
                })));
            }
            println!(
                "rebuild: {} ({})",
                generated.rebuild.rebuild,
                generated.rebuild.reason.describe()
            );
            if generated.runs < generated.planned_runs {
                println!("limited: {} of {} planned runs", generated.runs, generated.planned_runs);
            }
        }
        Commands::Describe { experiment, json } => {
            let layout = roots.layout(&experiment);
            init_logging(&roots.logs_root, log_name, &experiment, verbose)?;
            let ctx = context("describe", &experiment, json);
            let (plan, suite) = compile_experiment(&ctx, &layout, &CompileOptions::default())?;
            if json {
                let runs: Vec<Value> = suite
                    .runs
                    .iter()
                    .enumerate()
                    .map(|(i, r)| {
                        json!({
                            "task_id": i + 1,
                            "name": r.name,
                            "branch": r.branch,
                            "parameters": r.parameters,
                            "files": r.configs.keys().collect::<Vec<_>>(),
                        })
                    })
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "experiment": experiment,
                    "base_experiment": plan.base_experiment,
                    "planned_runs": suite.planned_runs,
                    "rebuild": suite.rebuild,
                    "runs": runs,
                })));
            }
            println!("experiment: {}", experiment);
            if let Some(base) = &plan.base_experiment {
                println!("base_experiment: {}", base);
            }
            println!("branches: {}", plan.effective_branches().len());
            println!("runs: {}", suite.runs.len());
            println!(
                "rebuild: {} ({})",
                suite.rebuild.rebuild,
                suite.rebuild.reason.describe()
            );
            for (i, run) in suite.runs.iter().enumerate() {
                println!(
                    "{:>5}  {}  [{}]  {}",
                    i + 1,
                    run.name,
                    run.branch,
                    Value::Object(run.parameters.clone())
                );
            }
        }
        Commands::Submit { experiment, json } => {
            let layout = roots.layout(&experiment);
            let guard = init_logging(&roots.logs_root, log_name, &experiment, verbose)?;
            let ctx = context("submit", &experiment, json);
            let plan = plan_for(&layout)?;
            let scheduler = SlurmScheduler::new(plan.hpc.scheduler.clone());
            let submission = submit_suite(
                &ctx,
                &layout,
                &scheduler,
                &plan.hpc.scheduler,
                &guard.log_dir,
            )?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "submit",
                    "submission": submission,
                })));
            }
        }
        Commands::Status { experiment, json } => {
            let layout = roots.layout(&experiment);
            init_logging(&roots.logs_root, log_name, &experiment, verbose)?;
            let ctx = context("status", &experiment, json);
            let plan = plan_for(&layout)?;
            let batch = read_batch_handle(&layout.batch_id_path())?;
            let (manifest, _) = ManifestStore::for_layout(&layout).load(&ctx)?;
            let scheduler = SlurmScheduler::new(plan.hpc.scheduler.clone());
            let report = reconcile(&ctx, &scheduler, &batch, &manifest)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "status": report,
                })));
            }
            println!("batch: {}", report.batch);
            println!("tasks: {}", report.total);
            println!("{}", report.summary_line());
            for name in &report.failed_run_names {
                println!("failed: {}", name);
            }
        }
        Commands::Monitor { experiment, json } => {
            let layout = roots.layout(&experiment);
            init_logging(&roots.logs_root, log_name, &experiment, verbose)?;
            let ctx = context("monitor", &experiment, json);
            let plan = plan_for(&layout)?;
            let batch = read_batch_handle(&layout.batch_id_path()).ok();
            let (manifest, _) = ManifestStore::for_layout(&layout).load(&ctx)?;
            let inferencer = StageInferencer::new(&plan.monitor.log_files, &plan.monitor.markers)?;
            let index = TaskLogIndex::discover(&layout.submission_logs_root(), batch.as_ref());
            let progress = collect_progress(&index, &inferencer, &manifest);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "monitor",
                    "progress": progress,
                })));
            }
            match progress.submission_dir.as_deref() {
                Some(dir) => println!("task logs: {}", dir.display()),
                None => println!("task logs: none yet"),
            }
            print_progress(&ctx, &progress);
        }
        Commands::Wait {
            experiment,
            poll_interval,
            max_wait,
            initial_delay,
            detail_every,
            sample_size,
            json,
        } => {
            let layout = roots.layout(&experiment);
            init_logging(&roots.logs_root, log_name, &experiment, verbose)?;
            let ctx = context("wait", &experiment, json);
            let plan = plan_for(&layout)?;
            let batch = read_batch_handle(&layout.batch_id_path())?;
            let (manifest, _) = ManifestStore::for_layout(&layout).load(&ctx)?;
            let inferencer = StageInferencer::new(&plan.monitor.log_files, &plan.monitor.markers)?;
            let scheduler = SlurmScheduler::new(plan.hpc.scheduler.clone());
            let logs_root = layout.submission_logs_root();
            let target = WaitTarget {
                batch: &batch,
                manifest: &manifest,
                submission_logs_root: &logs_root,
                inferencer: &inferencer,
            };
            let options = WaitOptions {
                poll_interval: Duration::from_secs(poll_interval),
                max_wait: max_wait.map(Duration::from_secs),
                initial_delay: Duration::from_secs(initial_delay),
                detail_every,
                ..WaitOptions::default()
            };
            let outcome =
                wait_for_completion(&ctx, &scheduler, &SystemClock::new(), &target, &options)?;
            let integrity = if outcome.is_success() {
                ctx.say("=== integrity verification ===");
                Some(check_integrity(&ctx, &layout, &layout.outputs_dir(), sample_size)?.0)
            } else {
                None
            };
            let integrity_ok = integrity.as_ref().map(|r| !r.has_critical()).unwrap_or(true);
            if json {
                return Ok(Some(json!({
                    "ok": outcome.is_success() && integrity_ok,
                    "command": "wait",
                    "wait": outcome,
                    "integrity": integrity,
                })));
            }
            match &outcome {
                WaitOutcome::Succeeded { polls, .. } => {
                    println!("all tasks completed after {} poll(s)", polls)
                }
                WaitOutcome::CompletedWithFailures { report, .. } => {
                    println!("finished with {} failed task(s):", report.failed_run_names.len());
                    for name in &report.failed_run_names {
                        println!("  {}", name);
                    }
                }
                WaitOutcome::TimedOut { polls, .. } => {
                    println!("gave up after {} poll(s); the batch is still in the scheduler", polls)
                }
            }
            if !outcome.is_success() || !integrity_ok {
                std::process::exit(1);
            }
        }
        Commands::Validate {
            experiment,
            outputs,
            sample_size,
            json,
        } => {
            let layout = roots.layout(&experiment);
            init_logging(&roots.logs_root, log_name, &experiment, verbose)?;
            let ctx = context("validate", &experiment, json);
            let plan = plan_for(&layout)?;
            let outputs = outputs.unwrap_or_else(|| layout.outputs_dir());
            let validator = SimulationValidator::new(plan.validation.clone());
            let (integrity, integrity_path) = check_integrity(&ctx, &layout, &outputs, sample_size)?;
            let (report, path) = analyze_suite(&ctx, &layout, &outputs, &validator)?;
            if json {
                return Ok(Some(json!({
                    "ok": !integrity.has_critical(),
                    "command": "validate",
                    "integrity": integrity,
                    "integrity_path": integrity_path.display().to_string(),
                    "report": report,
                    "path": path.display().to_string(),
                })));
            }
            if integrity.has_critical() {
                std::process::exit(1);
            }
        }
        Commands::List { json } => {
            init_terminal_logging(verbose);
            let experiments = list_experiments(&roots.config_root);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "list",
                    "config_root": roots.config_root.display().to_string(),
                    "experiments": experiments,
                })));
            }
            if experiments.is_empty() {
                println!("no experiments under {}", roots.config_root.display());
            }
            for name in experiments {
                let layout = roots.layout(&name);
                let marker = if layout.manifest_path().exists() {
                    "generated"
                } else {
                    "-"
                };
                println!("{:<40} {}", name, marker);
            }
        }
        Commands::Clean { experiment } => {
            init_terminal_logging(verbose);
            let dir = roots.layout(&experiment).experiment_dir();
            remove_dir_if_present(&dir)?;
        }
    }
    Ok(None)
}

fn remove_dir_if_present(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
        tracing::info!(dir = %dir.display(), "removed experiment directory");
        println!("removed: {}", dir.display());
    } else {
        println!("nothing to remove at {}", dir.display());
    }
    Ok(())
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_details(err: &anyhow::Error) -> Value {
    match err.downcast_ref::<SweepError>() {
        Some(SweepError::CircularInheritance { chain }) => json!({ "chain": chain }),
        Some(SweepError::SchedulerCommandFailed {
            command,
            status,
            stderr,
        }) => json!({ "command": command, "status": status, "stderr": stderr }),
        Some(SweepError::SchedulerUnavailable { command }) => json!({ "command": command }),
        Some(SweepError::UnparsedSubmission { stdout }) => json!({ "stdout": stdout }),
        Some(SweepError::ManifestMissing { path }) | Some(SweepError::BatchHandleMissing { path }) => {
            json!({ "path": path.display().to_string() })
        }
        _ => json!({}),
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Generate { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Submit { json, .. }
        | Commands::Status { json, .. }
        | Commands::Monitor { json, .. }
        | Commands::Wait { json, .. }
        | Commands::Validate { json, .. }
        | Commands::List { json } => *json,
        Commands::Clean { .. } => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn global_roots_and_wait_flags_parse() {
        let cli = Cli::try_parse_from([
            "sweep",
            "--runs-root",
            "/scratch/runs",
            "wait",
            "shocktube",
            "--poll-interval",
            "30",
            "--max-wait",
            "600",
            "--json",
        ])
        .expect("parse");
        assert_eq!(cli.roots.runs_root, PathBuf::from("/scratch/runs"));
        assert_eq!(cli.roots.config_root, PathBuf::from("config"));
        assert!(command_json_mode(&cli.command));
        match cli.command {
            Commands::Wait {
                poll_interval,
                max_wait,
                initial_delay,
                sample_size,
                ..
            } => {
                assert_eq!(poll_interval, 30);
                assert_eq!(max_wait, Some(600));
                assert_eq!(initial_delay, 5);
                assert_eq!(sample_size, DEFAULT_SAMPLE_SIZE);
            }
            _ => panic!("expected wait"),
        }
    }

    #[test]
    fn validate_accepts_outputs_and_full_integrity_sampling() {
        let cli = Cli::try_parse_from([
            "sweep",
            "validate",
            "shocktube",
            "--outputs",
            "/scratch/out",
            "--sample-size",
            "0",
        ])
        .expect("parse");
        assert!(!command_json_mode(&cli.command));
        match cli.command {
            Commands::Validate {
                outputs,
                sample_size,
                ..
            } => {
                assert_eq!(outputs, Some(PathBuf::from("/scratch/out")));
                assert_eq!(sample_size, 0);
            }
            _ => panic!("expected validate"),
        }
    }

    #[test]
    fn sweep_errors_keep_their_code_in_json_payloads() {
        let err: anyhow::Error = SweepError::CircularInheritance {
            chain: vec!["a".to_string(), "b".to_string(), "a".to_string()],
        }
        .into();
        let code = err
            .downcast_ref::<SweepError>()
            .map(|e| e.code())
            .unwrap_or("command_failed");
        let payload = json_error(code, err.to_string(), error_details(&err));
        assert_eq!(payload["error"]["code"], json!("circular_inheritance"));
        assert_eq!(payload["error"]["details"]["chain"][1], json!("b"));
    }
}
