use crate::snapshot::load_snapshots;
use crate::validator::{HealthStatus, SimulationHealth, SimulationValidator};
use chrono::Utc;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use sweep_core::{atomic_write_json_pretty, ExperimentLayout, ManifestStore, OpContext, Result};

pub const VALIDATION_REPORT_FILE: &str = "validation.json";

#[derive(Debug, Clone, Serialize)]
pub struct RunHealth {
    pub task_id: usize,
    pub run_name: String,
    pub output_dir: PathBuf,
    /// Absent when the run's snapshots could not be read.
    pub health: Option<SimulationHealth>,
    pub load_error: Option<String>,
}

impl RunHealth {
    pub fn completeness(&self) -> f64 {
        self.health.as_ref().map(|h| h.completeness).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SuiteHealthReport {
    pub schema_version: &'static str,
    pub experiment: String,
    pub generated_at: String,
    pub status_counts: BTreeMap<HealthStatus, usize>,
    pub unreadable: usize,
    /// Run names, most complete first.
    pub ranking: Vec<String>,
    pub runs: Vec<RunHealth>,
}

impl SuiteHealthReport {
    pub fn count(&self, status: HealthStatus) -> usize {
        self.status_counts.get(&status).copied().unwrap_or(0)
    }
}

fn assess_run(
    validator: &SimulationValidator,
    task_id: usize,
    run_name: &str,
    output_dir: PathBuf,
) -> RunHealth {
    match load_snapshots(&output_dir) {
        Ok(snapshots) => RunHealth {
            task_id,
            run_name: run_name.to_string(),
            health: Some(validator.validate(&snapshots, None)),
            load_error: None,
            output_dir,
        },
        Err(err) => {
            tracing::warn!(run = %run_name, error = %err, "could not load snapshots");
            RunHealth {
                task_id,
                run_name: run_name.to_string(),
                health: None,
                load_error: Some(err.to_string()),
                output_dir,
            }
        }
    }
}

/// Validate every run of the manifest from `<outputs_root>/<run>/` and write
/// `analysis/validation.json`. A run that cannot be read is recorded, not
/// fatal.
pub fn analyze_suite(
    ctx: &OpContext,
    layout: &ExperimentLayout,
    outputs_root: &Path,
    validator: &SimulationValidator,
) -> Result<(SuiteHealthReport, PathBuf)> {
    let (runs, _origin) = ManifestStore::for_layout(layout).load(ctx)?;
    let _span = ctx.span().enter();

    let assessed: Vec<RunHealth> = runs
        .iter()
        .enumerate()
        .map(|(i, name)| assess_run(validator, i + 1, name, outputs_root.join(name)))
        .collect();

    let mut status_counts: BTreeMap<HealthStatus, usize> =
        HealthStatus::ALL.iter().map(|s| (*s, 0)).collect();
    let mut unreadable = 0;
    for run in &assessed {
        match &run.health {
            Some(h) => *status_counts.entry(h.status).or_insert(0) += 1,
            None => unreadable += 1,
        }
    }

    let mut ranked: Vec<&RunHealth> = assessed.iter().collect();
    ranked.sort_by(|a, b| {
        b.completeness()
            .partial_cmp(&a.completeness())
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.task_id.cmp(&b.task_id))
    });
    let ranking = ranked.iter().map(|r| r.run_name.clone()).collect();

    let report = SuiteHealthReport {
        schema_version: "validation_report_v1",
        experiment: layout.experiment.clone(),
        generated_at: Utc::now().to_rfc3339(),
        status_counts,
        unreadable,
        ranking,
        runs: assessed,
    };
    let path = layout.analysis_dir().join(VALIDATION_REPORT_FILE);
    atomic_write_json_pretty(&path, &serde_json::to_value(&report)?)?;
    tracing::info!(
        runs = report.runs.len(),
        valid = report.count(HealthStatus::Valid),
        unreadable,
        "validation report written"
    );

    for run in &report.runs {
        match &run.health {
            Some(h) => ctx.say(format!(
                "{:>5}  {:<40}  {:<18}  completeness {:.2}",
                run.task_id,
                run.run_name,
                h.status.as_str(),
                h.completeness
            )),
            None => ctx.say(format!(
                "{:>5}  {:<40}  {:<18}  {}",
                run.task_id,
                run.run_name,
                "UNREADABLE",
                run.load_error.as_deref().unwrap_or("")
            )),
        }
    }
    let summary = HealthStatus::ALL
        .iter()
        .map(|s| format!("{}={}", s.as_str(), report.count(*s)))
        .collect::<Vec<_>>()
        .join(" ");
    ctx.say(format!("health: {} UNREADABLE={}", summary, unreadable));
    ctx.say(format!("report: {}", path.display()));
    Ok((report, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::fs;

    fn write_run(dir: &Path, n: usize, growth: f64) {
        fs::create_dir_all(dir).expect("run dir");
        for i in 0..n {
            let f = i as f64 / (n.max(2) - 1) as f64;
            let body = json!({"time": f, "fields": {"rho": [1.0 + growth * f]}});
            fs::write(dir.join(format!("var{:03}.json", i)), body.to_string()).expect("snapshot");
        }
    }

    #[test]
    fn each_run_is_judged_in_isolation_and_report_is_persisted() {
        let root = std::env::temp_dir().join(format!(
            "sweep_report_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let layout = ExperimentLayout::new("st", root.join("config"), root.join("runs"), root.join("logs"));
        ManifestStore::for_layout(&layout)
            .write(&["good".to_string(), "broken".to_string(), "dead".to_string()])
            .expect("manifest");
        let outputs = layout.outputs_dir();
        write_run(&outputs.join("good"), 30, 0.5);
        fs::create_dir_all(outputs.join("broken")).expect("broken");
        fs::write(outputs.join("broken/var000.json"), "{oops").expect("bad snapshot");
        write_run(&outputs.join("dead"), 1, 0.0);

        let ctx = OpContext::capture("validate", "st");
        let (report, path) =
            analyze_suite(&ctx, &layout, &outputs, &SimulationValidator::default()).expect("analyze");
        assert_eq!(report.count(HealthStatus::Valid), 1);
        assert_eq!(report.count(HealthStatus::FailedAsExpected), 1);
        assert_eq!(report.unreadable, 1);
        assert_eq!(report.ranking[0], "good");
        assert!(report.runs[1].load_error.is_some());

        let persisted: Value =
            serde_json::from_slice(&fs::read(&path).expect("read")).expect("json");
        assert_eq!(persisted["status_counts"]["VALID"], json!(1));
        assert_eq!(persisted["runs"][0]["health"]["status"], json!("VALID"));
        assert!(ctx.captured().iter().any(|l| l.starts_with("health: VALID=1")));
        let _ = fs::remove_dir_all(root);
    }
}
