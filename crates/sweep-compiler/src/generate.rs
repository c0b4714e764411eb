//! Materializes a compiled suite on disk.
//!
//! Everything is compiled and rendered in memory first; the experiment
//! directory is only deleted and rebuilt once that succeeded, so a bad plan
//! never leaves a half-written suite behind.

use crate::compile::{compile_suite, CompileOptions, CompiledSuite};
use crate::rebuild::RebuildDecision;
use crate::render::{output_relpath, CommandRenderer, ConfigRenderer, StructuredRenderer};
use crate::resolver::{ConfigResolver, DirConfigSource};
use crate::script::{build_submit_script, ScriptInputs};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use sweep_core::plan::{load_plan, SweepPlan};
use sweep_core::{
    atomic_write_bytes, atomic_write_json_pretty, canonical_json_digest, ensure_dir,
    ExperimentLayout, ManifestStore, OpContext, Result, SweepError,
};

struct RenderedRun {
    name: String,
    files: Vec<(PathBuf, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GeneratedSuite {
    pub experiment: String,
    pub experiment_dir: PathBuf,
    pub manifest_path: PathBuf,
    pub submit_script: PathBuf,
    pub suite_record: PathBuf,
    pub runs: usize,
    pub planned_runs: usize,
    pub rebuild: RebuildDecision,
    pub renderer: String,
}

pub fn renderer_for(plan: &SweepPlan) -> Result<Box<dyn ConfigRenderer>> {
    match &plan.render_command {
        Some(argv) => Ok(Box::new(CommandRenderer::new(argv.clone())?)),
        None => Ok(Box::new(StructuredRenderer)),
    }
}

/// Load the plan, resolve and compile. Nothing is written.
pub fn compile_experiment(
    ctx: &OpContext,
    layout: &ExperimentLayout,
    options: &CompileOptions,
) -> Result<(SweepPlan, CompiledSuite)> {
    let plan_path = layout.plan_path();
    if !plan_path.is_file() {
        return Err(SweepError::config(format!(
            "no sweep plan at {}",
            plan_path.display()
        )));
    }
    let plan = load_plan(&plan_path)?;
    let mut resolver = ConfigResolver::new(DirConfigSource::new(&layout.config_root));
    let suite = compile_suite(ctx, &layout.experiment, &plan, &mut resolver, options)?;
    Ok((plan, suite))
}

pub fn generate_suite(
    ctx: &OpContext,
    layout: &ExperimentLayout,
    options: &CompileOptions,
) -> Result<GeneratedSuite> {
    let (plan, suite) = compile_experiment(ctx, layout, options)?;
    let renderer = renderer_for(&plan)?;
    write_suite(ctx, layout, &plan, &suite, renderer.as_ref())
}

fn render_runs(suite: &CompiledSuite, renderer: &dyn ConfigRenderer) -> Result<Vec<RenderedRun>> {
    let mut rendered = Vec::with_capacity(suite.runs.len());
    for run in &suite.runs {
        let mut files = Vec::new();
        for (file, doc) in &run.configs {
            let Some(format) = &doc.format else { continue };
            let rel = output_relpath(file);
            let filename = rel
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let text = renderer.render(format, &doc.data, &filename).map_err(|e| {
                SweepError::config(format!("run '{}', {}: {}", run.name, file, e))
            })?;
            files.push((rel, text));
        }
        rendered.push(RenderedRun {
            name: run.name.clone(),
            files,
        });
    }
    Ok(rendered)
}

fn suite_record(suite: &CompiledSuite, renderer: &str) -> Result<Value> {
    let mut runs = Vec::with_capacity(suite.runs.len());
    for (i, run) in suite.runs.iter().enumerate() {
        let configs = serde_json::to_value(&run.configs)?;
        runs.push(json!({
            "task_id": i + 1,
            "name": run.name,
            "branch": run.branch,
            "parameters": run.parameters,
            "config_digest": canonical_json_digest(&configs)?,
        }));
    }
    Ok(json!({
        "schema_version": "suite_record_v1",
        "experiment": suite.experiment,
        "generated_at": Utc::now().to_rfc3339(),
        "renderer": renderer,
        "planned_runs": suite.planned_runs,
        "swept_variables": suite.swept_variables,
        "rebuild": suite.rebuild,
        "runs": runs,
    }))
}

pub fn write_suite(
    ctx: &OpContext,
    layout: &ExperimentLayout,
    plan: &SweepPlan,
    suite: &CompiledSuite,
    renderer: &dyn ConfigRenderer,
) -> Result<GeneratedSuite> {
    if suite.runs.is_empty() {
        return Err(SweepError::config("suite has no runs to generate"));
    }
    let rendered = render_runs(suite, renderer)?;
    let experiment_dir = layout.experiment_dir();
    let scheduler_logs = layout.scheduler_logs_dir();
    let script = build_submit_script(&ScriptInputs {
        experiment: &layout.experiment,
        experiment_dir: &experiment_dir,
        scheduler_logs_dir: &scheduler_logs,
        hpc: &plan.hpc,
        log_files: &plan.monitor.log_files,
        num_runs: suite.runs.len(),
        rebuild: suite.rebuild.rebuild,
    })?;
    let record = suite_record(suite, &renderer.describe())?;

    let _span = ctx.span().enter();
    if experiment_dir.exists() {
        tracing::info!(dir = %experiment_dir.display(), "removing previous experiment directory");
        fs::remove_dir_all(&experiment_dir).map_err(|e| SweepError::io(&experiment_dir, e))?;
    }
    ensure_dir(&scheduler_logs)?;
    let generated = layout.generated_configs_dir();
    for run in &rendered {
        let run_dir = generated.join(&run.name);
        ensure_dir(&run_dir)?;
        for (rel, text) in &run.files {
            atomic_write_bytes(&run_dir.join(rel), text.as_bytes())?;
        }
    }
    ManifestStore::for_layout(layout).write(&suite.run_names())?;

    let script_path = layout.submit_script_path();
    atomic_write_bytes(&script_path, script.as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))
            .map_err(|e| SweepError::io(&script_path, e))?;
    }
    let record_path = layout.suite_record_path();
    atomic_write_json_pretty(&record_path, &record)?;

    tracing::info!(
        runs = suite.runs.len(),
        rebuild = suite.rebuild.rebuild,
        dir = %experiment_dir.display(),
        "suite generated"
    );
    ctx.say(format!(
        "generated {} run(s) in {}",
        suite.runs.len(),
        generated.display()
    ));
    ctx.say(format!("manifest: {}", layout.manifest_path().display()));
    ctx.say(format!("submit script: {}", script_path.display()));

    Ok(GeneratedSuite {
        experiment: layout.experiment.clone(),
        experiment_dir,
        manifest_path: layout.manifest_path(),
        submit_script: script_path,
        suite_record: record_path,
        runs: suite.runs.len(),
        planned_runs: suite.planned_runs,
        rebuild: suite.rebuild.clone(),
        renderer: renderer.describe(),
    })
}
