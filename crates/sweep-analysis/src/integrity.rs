//! Suite-wide sanity checks that the sweep actually ran as planned.
//!
//! Where the validator judges each run alone, these checks compare runs
//! against each other and against `suite.json`: identical outputs, missing
//! generated configs, runs that never advanced in time, or swept variables
//! that ended up constant all point at a broken setup rather than bad physics.

use crate::snapshot::{load_snapshots, Snapshot};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use sweep_core::{
    atomic_write_json_pretty, sha256_bytes, ExperimentLayout, ManifestStore, OpContext, Result,
    SweepError,
};
use walkdir::WalkDir;

pub const INTEGRITY_REPORT_FILE: &str = "integrity.json";
pub const DEFAULT_SAMPLE_SIZE: usize = 3;

/// Smallest start-to-end time span that counts as evolution.
const TIME_EPSILON: f64 = 1e-10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    OutputDiversity,
    ParameterFiles,
    SimulationExecution,
    SweepParameters,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::OutputDiversity => "output_diversity",
            CheckKind::ParameterFiles => "parameter_files",
            CheckKind::SimulationExecution => "simulation_execution",
            CheckKind::SweepParameters => "sweep_parameters",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityCheck {
    pub kind: CheckKind,
    pub passed: bool,
    pub critical: bool,
    pub message: String,
    pub issues: Vec<String>,
}

impl IntegrityCheck {
    fn new(kind: CheckKind, message: String, issues: Vec<String>, critical: bool) -> Self {
        IntegrityCheck {
            kind,
            passed: issues.is_empty(),
            critical: critical && !issues.is_empty(),
            message,
            issues,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub schema_version: &'static str,
    pub experiment: String,
    pub generated_at: String,
    /// Runs the per-run checks looked at.
    pub sampled: Vec<String>,
    pub passed: bool,
    pub checks: Vec<IntegrityCheck>,
    pub critical_issues: Vec<String>,
}

impl IntegrityReport {
    pub fn has_critical(&self) -> bool {
        !self.critical_issues.is_empty()
    }

    pub fn check(&self, kind: CheckKind) -> Option<&IntegrityCheck> {
        self.checks.iter().find(|c| c.kind == kind)
    }
}

#[derive(Debug, Deserialize)]
struct SuiteRecord {
    #[serde(default)]
    swept_variables: Vec<String>,
    #[serde(default)]
    runs: Vec<RecordedRun>,
}

#[derive(Debug, Deserialize)]
struct RecordedRun {
    name: String,
    #[serde(default)]
    parameters: Map<String, Value>,
    #[serde(default)]
    config_digest: Option<String>,
}

struct SampledRun {
    name: String,
    output_dir: PathBuf,
    snapshots: std::result::Result<Vec<Snapshot>, String>,
}

fn read_suite_record(path: &Path) -> std::result::Result<SuiteRecord, String> {
    let bytes = fs::read(path).map_err(|e| format!("suite record {}: {}", path.display(), e))?;
    serde_json::from_slice(&bytes).map_err(|e| format!("suite record {}: {}", path.display(), e))
}

/// Content hash of every field sample, ignoring the snapshot time.
fn field_signature(snapshot: &Snapshot) -> String {
    let mut bytes = Vec::new();
    for (name, values) in &snapshot.fields {
        bytes.extend_from_slice(name.as_bytes());
        bytes.push(0);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
    }
    sha256_bytes(&bytes)
}

fn peak(snapshot: &Snapshot) -> Option<f64> {
    snapshot
        .fields
        .values()
        .flatten()
        .copied()
        .filter(|v| v.is_finite())
        .reduce(f64::max)
}

fn check_output_diversity(runs: &[SampledRun]) -> IntegrityCheck {
    let finals: Vec<&Snapshot> = runs
        .iter()
        .filter_map(|r| r.snapshots.as_ref().ok().and_then(|s| s.last()))
        .collect();
    if finals.is_empty() {
        return IntegrityCheck::new(
            CheckKind::OutputDiversity,
            "no readable output".to_string(),
            vec!["could not read output snapshots for any sampled run".to_string()],
            true,
        );
    }
    let signatures: BTreeSet<String> = finals.iter().map(|s| field_signature(s)).collect();
    let peaks: BTreeSet<u64> = finals.iter().filter_map(|s| peak(s)).map(f64::to_bits).collect();
    let mut issues = Vec::new();
    let mut critical = false;
    if finals.len() > 1 && signatures.len() == 1 {
        issues.push(format!(
            "all {} sampled runs produced identical final snapshots; the sweep did not change the simulation",
            finals.len()
        ));
        critical = true;
    }
    if finals.len() > 1 && peaks.len() == 1 {
        if let Some(bits) = peaks.iter().next() {
            issues.push(format!(
                "all {} sampled runs share the same peak value {:.10e}",
                finals.len(),
                f64::from_bits(*bits)
            ));
        }
    }
    IntegrityCheck::new(
        CheckKind::OutputDiversity,
        format!(
            "{} distinct final snapshot(s) across {} sampled run(s)",
            signatures.len(),
            finals.len()
        ),
        issues,
        critical,
    )
}

fn has_any_file(dir: &Path) -> bool {
    WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .any(|e| e.file_type().is_file())
}

fn check_parameter_files(
    layout: &ExperimentLayout,
    runs: &[SampledRun],
    record: &std::result::Result<SuiteRecord, String>,
) -> IntegrityCheck {
    let generated = layout.generated_configs_dir();
    let mut issues: Vec<String> = runs
        .iter()
        .filter(|r| !has_any_file(&generated.join(&r.name)))
        .map(|r| format!("missing generated config files for run {}", r.name))
        .collect();
    let mut distinct = 0;
    match record {
        Ok(record) => {
            let digests: BTreeSet<&str> = record
                .runs
                .iter()
                .filter_map(|r| r.config_digest.as_deref())
                .collect();
            distinct = digests.len();
            if record.runs.len() > 1 && digests.len() == 1 {
                issues.push(format!(
                    "all {} runs share one config digest; parameters were not applied per run",
                    record.runs.len()
                ));
            }
        }
        Err(err) => issues.push(err.clone()),
    }
    IntegrityCheck::new(
        CheckKind::ParameterFiles,
        format!(
            "checked {} run(s); {} distinct config digest(s)",
            runs.len(),
            distinct
        ),
        issues,
        false,
    )
}

fn check_simulation_execution(runs: &[SampledRun]) -> IntegrityCheck {
    let mut issues = Vec::new();
    for run in runs {
        if !run.output_dir.is_dir() {
            issues.push(format!(
                "missing output directory for run {}: {}",
                run.name,
                run.output_dir.display()
            ));
            continue;
        }
        let snapshots = match &run.snapshots {
            Ok(s) => s,
            Err(err) => {
                issues.push(format!("run {}: {}", run.name, err));
                continue;
            }
        };
        if snapshots.len() < 2 {
            issues.push(format!(
                "run {} has only {} snapshot(s); expected several time steps",
                run.name,
                snapshots.len()
            ));
            continue;
        }
        if let (Some(first), Some(last)) = (snapshots.first(), snapshots.last()) {
            if (last.time - first.time).abs() <= TIME_EPSILON {
                issues.push(format!(
                    "run {}: time did not evolve (t_initial={:.6e}, t_final={:.6e})",
                    run.name, first.time, last.time
                ));
            }
        }
    }
    IntegrityCheck::new(
        CheckKind::SimulationExecution,
        format!("checked execution of {} run(s)", runs.len()),
        issues,
        true,
    )
}

fn check_sweep_parameters(record: &std::result::Result<SuiteRecord, String>) -> IntegrityCheck {
    let record = match record {
        Ok(record) => record,
        Err(err) => {
            return IntegrityCheck::new(
                CheckKind::SweepParameters,
                "no suite record".to_string(),
                vec![err.clone()],
                false,
            )
        }
    };
    let mut issues = Vec::new();
    let mut total = 0;
    for variable in &record.swept_variables {
        let values: BTreeSet<String> = record
            .runs
            .iter()
            .filter_map(|r| r.parameters.get(variable))
            .map(|v| v.to_string())
            .collect();
        total += values.len();
        if record.runs.len() > 1 && values.len() == 1 {
            if let Some(only) = values.iter().next() {
                issues.push(format!(
                    "swept variable '{}' has the same value ({}) in all {} runs",
                    variable,
                    only,
                    record.runs.len()
                ));
            }
        }
    }
    IntegrityCheck::new(
        CheckKind::SweepParameters,
        format!(
            "{} distinct value(s) across {} swept variable(s)",
            total,
            record.swept_variables.len()
        ),
        issues,
        false,
    )
}

/// Check the first `sample_size` runs of the manifest (0 checks every run)
/// plus suite-wide facts from `suite.json`, then write
/// `analysis/integrity.json`.
pub fn check_integrity(
    ctx: &OpContext,
    layout: &ExperimentLayout,
    outputs_root: &Path,
    sample_size: usize,
) -> Result<(IntegrityReport, PathBuf)> {
    let (names, _origin) = ManifestStore::for_layout(layout).load(ctx)?;
    let _span = ctx.span().enter();
    let take = if sample_size == 0 {
        names.len()
    } else {
        sample_size.min(names.len())
    };
    tracing::info!(runs = names.len(), sampled = take, "checking suite integrity");

    let sampled: Vec<SampledRun> = names[..take]
        .iter()
        .map(|name| {
            let output_dir = outputs_root.join(name);
            let snapshots = load_snapshots(&output_dir).map_err(|e: SweepError| e.to_string());
            SampledRun {
                name: name.clone(),
                output_dir,
                snapshots,
            }
        })
        .collect();
    let record = read_suite_record(&layout.suite_record_path());

    let checks = vec![
        check_output_diversity(&sampled),
        check_parameter_files(layout, &sampled, &record),
        check_simulation_execution(&sampled),
        check_sweep_parameters(&record),
    ];
    let critical_issues: Vec<String> = checks
        .iter()
        .filter(|c| c.critical)
        .flat_map(|c| c.issues.iter().cloned())
        .collect();
    let report = IntegrityReport {
        schema_version: "integrity_report_v1",
        experiment: layout.experiment.clone(),
        generated_at: Utc::now().to_rfc3339(),
        sampled: sampled.iter().map(|r| r.name.clone()).collect(),
        passed: checks.iter().all(|c| c.passed),
        checks,
        critical_issues,
    };
    let path = layout.analysis_dir().join(INTEGRITY_REPORT_FILE);
    atomic_write_json_pretty(&path, &serde_json::to_value(&report)?)?;

    for check in &report.checks {
        ctx.say(format!(
            "{:<22}  {:<4}  {}",
            check.kind.as_str(),
            if check.passed { "PASS" } else { "FAIL" },
            check.message
        ));
        for issue in &check.issues {
            ctx.say(format!("    - {}", issue));
        }
    }
    if report.has_critical() {
        tracing::error!(critical = report.critical_issues.len(), "integrity check found critical issues");
        ctx.say(format!(
            "integrity: {} critical issue(s); results of this suite are not trustworthy",
            report.critical_issues.len()
        ));
    } else if report.passed {
        tracing::info!("integrity checks passed");
        ctx.say("integrity: all checks passed");
    } else {
        tracing::warn!("integrity checks reported warnings");
        ctx.say("integrity: passed with warnings");
    }
    Ok((report, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scratch(label: &str) -> ExperimentLayout {
        let root = std::env::temp_dir().join(format!(
            "sweep_integrity_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ExperimentLayout::new("st", root.join("config"), root.join("runs"), root.join("logs"))
    }

    fn cleanup(layout: &ExperimentLayout) {
        if let Some(root) = layout.runs_root.parent() {
            let _ = fs::remove_dir_all(root);
        }
    }

    /// Writes `times.len()` snapshots whose density scales with `amplitude`.
    fn write_outputs(layout: &ExperimentLayout, run: &str, times: &[f64], amplitude: f64) {
        let dir = layout.outputs_dir().join(run);
        fs::create_dir_all(&dir).expect("output dir");
        for (i, t) in times.iter().enumerate() {
            let body = json!({"time": t, "fields": {"rho": [1.0, 1.0 + amplitude * t]}});
            fs::write(dir.join(format!("var{:03}.json", i)), body.to_string()).expect("snapshot");
        }
    }

    fn write_configs(layout: &ExperimentLayout, run: &str) {
        let dir = layout.generated_configs_dir().join(run);
        fs::create_dir_all(&dir).expect("config dir");
        fs::write(dir.join("run.in"), "nt: 10\n").expect("run.in");
    }

    fn seed(layout: &ExperimentLayout, runs: &[(&str, Value, &str)]) {
        let names: Vec<String> = runs.iter().map(|(n, _, _)| n.to_string()).collect();
        ManifestStore::for_layout(layout).write(&names).expect("manifest");
        let recorded: Vec<Value> = runs
            .iter()
            .enumerate()
            .map(|(i, (name, nu, digest))| {
                json!({
                    "task_id": i + 1,
                    "name": name,
                    "parameters": {"nu": nu, "scale": 4},
                    "config_digest": digest,
                })
            })
            .collect();
        atomic_write_json_pretty(
            &layout.suite_record_path(),
            &json!({"swept_variables": ["nu"], "runs": recorded}),
        )
        .expect("record");
    }

    #[test]
    fn distinct_evolving_runs_pass_every_check() {
        let layout = scratch("healthy");
        seed(
            &layout,
            &[
                ("r_nu0p1", json!(0.1), "sha256:a"),
                ("r_nu0p2", json!(0.2), "sha256:b"),
            ],
        );
        for (run, amp) in [("r_nu0p1", 0.1), ("r_nu0p2", 0.2)] {
            write_configs(&layout, run);
            write_outputs(&layout, run, &[0.0, 0.5, 1.0], amp);
        }
        let ctx = OpContext::capture("validate", "st");
        let (report, path) =
            check_integrity(&ctx, &layout, &layout.outputs_dir(), DEFAULT_SAMPLE_SIZE).expect("check");
        assert!(report.passed, "{:?}", report.checks);
        assert!(!report.has_critical());
        assert_eq!(report.sampled, vec!["r_nu0p1", "r_nu0p2"]);
        assert_eq!(report.checks.len(), 4);
        assert!(path.is_file());
        assert_eq!(ctx.captured().last().map(String::as_str), Some("integrity: all checks passed"));
        cleanup(&layout);
    }

    #[test]
    fn identical_or_frozen_outputs_are_critical() {
        let layout = scratch("frozen");
        seed(
            &layout,
            &[
                ("a", json!(0.1), "sha256:a"),
                ("b", json!(0.2), "sha256:b"),
            ],
        );
        for run in ["a", "b"] {
            write_configs(&layout, run);
            write_outputs(&layout, run, &[0.0, 0.0], 0.3);
        }
        let ctx = OpContext::capture("wait", "st");
        let (report, _) = check_integrity(&ctx, &layout, &layout.outputs_dir(), 0).expect("check");
        assert!(report.has_critical());
        let diversity = report.check(CheckKind::OutputDiversity).expect("diversity");
        assert!(diversity.critical);
        assert_eq!(diversity.issues.len(), 2);
        let execution = report.check(CheckKind::SimulationExecution).expect("execution");
        assert!(execution.critical);
        assert!(execution.issues[0].contains("time did not evolve"));
        cleanup(&layout);
    }

    #[test]
    fn constant_sweep_and_shared_digest_are_warnings() {
        let layout = scratch("constant");
        seed(
            &layout,
            &[
                ("a", json!(0.1), "sha256:same"),
                ("b", json!(0.1), "sha256:same"),
            ],
        );
        write_configs(&layout, "a");
        write_outputs(&layout, "a", &[0.0, 1.0], 0.1);
        write_outputs(&layout, "b", &[0.0, 1.0], 0.2);
        let ctx = OpContext::capture("validate", "st");
        let (report, _) = check_integrity(&ctx, &layout, &layout.outputs_dir(), 0).expect("check");
        assert!(!report.passed);
        assert!(!report.has_critical());
        let files = report.check(CheckKind::ParameterFiles).expect("files");
        assert_eq!(files.issues.len(), 2);
        assert!(files.issues[0].contains("run b"));
        let sweep = report.check(CheckKind::SweepParameters).expect("sweep");
        assert!(sweep.issues[0].contains("'nu'"));
        assert_eq!(ctx.captured().last().map(String::as_str), Some("integrity: passed with warnings"));
        cleanup(&layout);
    }

    #[test]
    fn only_the_first_runs_are_sampled_and_missing_record_is_reported() {
        let layout = scratch("sampled");
        let names: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        ManifestStore::for_layout(&layout).write(&names).expect("manifest");
        write_configs(&layout, "a");
        write_configs(&layout, "b");
        write_outputs(&layout, "a", &[0.0, 1.0], 0.1);
        write_outputs(&layout, "b", &[0.0, 1.0], 0.2);
        let ctx = OpContext::capture("validate", "st");
        let (report, _) = check_integrity(&ctx, &layout, &layout.outputs_dir(), 2).expect("check");
        assert_eq!(report.sampled, vec!["a", "b"]);
        assert!(report.check(CheckKind::SimulationExecution).expect("exec").passed);
        let sweep = report.check(CheckKind::SweepParameters).expect("sweep");
        assert!(sweep.issues[0].contains("suite record"));
        assert!(!report.has_critical());
        cleanup(&layout);
    }
}
