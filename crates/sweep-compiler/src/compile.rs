//! Branches x combinations x resolved configuration -> run descriptors.

use crate::expr::{evaluate, ExprError};
use crate::merge::deep_merge;
use crate::naming::{fallback_run_name, render_template};
use crate::rebuild::{decide, RebuildDecision, RebuildInputs, CRITICAL_PARAM_FILE};
use crate::resolver::{ConfigDocument, ConfigResolver, ConfigSource};
use crate::sweep::{expand, ParameterCombination, SweepSpec};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use sweep_core::plan::{Branch, SweepPlan};
use sweep_core::{OpContext, Result, SweepError};

/// Versioned behaviour switches for the compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompilerFlags {
    /// Let critical-parameter changes override `disable_auto_rebuild`.
    pub auto_rebuild_detection: bool,
}

impl Default for CompilerFlags {
    fn default() -> Self {
        CompilerFlags {
            auto_rebuild_detection: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Keep only the first `limit` runs (smoke tests).
    pub limit: Option<usize>,
    pub force_rebuild: bool,
    pub flags: CompilerFlags,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunDescriptor {
    pub name: String,
    pub branch: String,
    /// Swept and derived values together, keyed by name in sorted order.
    pub parameters: Map<String, Value>,
    pub configs: BTreeMap<String, ConfigDocument>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CompiledSuite {
    pub experiment: String,
    pub runs: Vec<RunDescriptor>,
    pub rebuild: RebuildDecision,
    /// Run count before `limit` was applied.
    pub planned_runs: usize,
    pub swept_variables: Vec<String>,
}

impl CompiledSuite {
    pub fn run_names(&self) -> Vec<String> {
        self.runs.iter().map(|r| r.name.clone()).collect()
    }
}

pub fn compile_suite<S: ConfigSource>(
    ctx: &OpContext,
    experiment: &str,
    plan: &SweepPlan,
    resolver: &mut ConfigResolver<S>,
    options: &CompileOptions,
) -> Result<CompiledSuite> {
    let sweep = SweepSpec::from_specs(&plan.parameter_sweeps)?;
    let combinations = expand(&sweep);

    if let Some(base) = &plan.base_experiment {
        resolver.declare_base(experiment, base);
    }
    let base_configs = resolver.resolve_all(ctx, experiment)?;

    for file in plan.modifications.keys() {
        if !base_configs.contains_key(file) {
            return Err(SweepError::config(format!(
                "modifications name unknown config file '{}'",
                file
            )));
        }
    }
    let branches = plan.effective_branches();
    for branch in &branches {
        for file in branch.settings.keys() {
            if !base_configs.contains_key(file) {
                return Err(SweepError::config(format!(
                    "branch '{}' overlays unknown config file '{}'",
                    branch.name, file
                )));
            }
        }
    }

    let rebuild = rebuild_decision(ctx, experiment, plan, resolver, &base_configs, &sweep, options)?;

    let prefix_file = plan
        .prefix_data_file
        .as_deref()
        .unwrap_or(CRITICAL_PARAM_FILE);
    let prefix_data = base_configs
        .get(prefix_file)
        .map(|d| d.data.clone())
        .unwrap_or_else(|| Value::Object(Map::new()));

    let mut runs = Vec::with_capacity(branches.len() * combinations.len());
    let mut seen = BTreeSet::new();
    for branch in &branches {
        for combo in &combinations {
            let run = compile_run(ctx, plan, branch, combo, &prefix_data, &base_configs)?;
            if !seen.insert(run.name.clone()) {
                return Err(SweepError::config(format!(
                    "run name collision: '{}' (branch '{}'); make run_name_template distinguish every combination",
                    run.name, branch.name
                )));
            }
            runs.push(run);
        }
    }

    let planned_runs = runs.len();
    if let Some(limit) = options.limit {
        runs.truncate(limit);
    }
    {
        let _span = ctx.span().enter();
        tracing::info!(
            planned = planned_runs,
            kept = runs.len(),
            branches = branches.len(),
            combinations = combinations.len(),
            "compiled suite"
        );
    }
    Ok(CompiledSuite {
        experiment: experiment.to_string(),
        runs,
        rebuild,
        planned_runs,
        swept_variables: sweep.variables().into_iter().map(String::from).collect(),
    })
}

fn rebuild_decision<S: ConfigSource>(
    ctx: &OpContext,
    experiment: &str,
    plan: &SweepPlan,
    resolver: &mut ConfigResolver<S>,
    base_configs: &BTreeMap<String, ConfigDocument>,
    sweep: &SweepSpec,
    options: &CompileOptions,
) -> Result<RebuildDecision> {
    let root = resolver.root_of(experiment)?;
    let root_params = if root == experiment {
        None
    } else {
        resolver
            .try_resolve(ctx, &root, CRITICAL_PARAM_FILE)?
            .map(|doc| doc.data)
    };
    let suite_params = base_configs.get(CRITICAL_PARAM_FILE).map(|doc| &doc.data);
    let sweep_variables = sweep.variables();
    let inputs = RebuildInputs {
        plan,
        base_params: root_params.as_ref(),
        suite_params,
        sweep_variables: &sweep_variables,
    };
    Ok(decide(
        ctx,
        &inputs,
        options.flags.auto_rebuild_detection,
        options.force_rebuild,
    ))
}

fn compile_run(
    ctx: &OpContext,
    plan: &SweepPlan,
    branch: &Branch,
    combo: &ParameterCombination,
    prefix_data: &Value,
    base_configs: &BTreeMap<String, ConfigDocument>,
) -> Result<RunDescriptor> {
    let output_prefix = render_output_prefix(ctx, plan, combo, prefix_data);

    let mut context: Map<String, Value> = plan
        .constants
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    context.insert("output_prefix".to_string(), json!(output_prefix));
    context.insert("branch".to_string(), json!({ "name": branch.name }));
    context.insert("data".to_string(), prefix_data.clone());
    for (k, v) in combo.iter() {
        context.insert(k.to_string(), v.clone());
    }

    let mut parameters: Map<String, Value> = combo
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    derive_parameters(plan, &mut context, &mut parameters)?;

    let name = match &plan.run_name_template {
        Some(template) => render_template(template, &context)?,
        None => fallback_run_name(&output_prefix, &branch.name, combo.iter()),
    };
    if name.trim().is_empty() || name.contains('/') || name.contains('\n') {
        return Err(SweepError::config(format!(
            "run name {:?} is not usable as a directory name",
            name
        )));
    }

    let mut configs = base_configs.clone();
    for (file, overlay) in &plan.modifications {
        apply_overlay(&mut configs, file, overlay)?;
    }
    for (file, overlay) in &branch.settings {
        apply_overlay(&mut configs, file, overlay)?;
    }

    let mut injected: Map<String, Value> = plan
        .constants
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    injected.extend(parameters.clone());
    inject_parameters(plan, &mut configs, &injected)?;

    Ok(RunDescriptor {
        name,
        branch: branch.name.clone(),
        parameters,
        configs,
    })
}

fn render_output_prefix(
    ctx: &OpContext,
    plan: &SweepPlan,
    combo: &ParameterCombination,
    prefix_data: &Value,
) -> String {
    let mut prefix_context: Map<String, Value> = plan
        .constants
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    prefix_context.insert("data".to_string(), prefix_data.clone());
    for (k, v) in combo.iter() {
        prefix_context.insert(k.to_string(), v.clone());
    }
    match render_template(&plan.output_prefix, &prefix_context) {
        Ok(rendered) => rendered,
        Err(err) => {
            let _span = ctx.span().enter();
            tracing::debug!(error = %err, "output_prefix left unrendered");
            plan.output_prefix.clone()
        }
    }
}

/// Two passes: the first defers expressions that name something not yet
/// derived, the second must succeed.
fn derive_parameters(
    plan: &SweepPlan,
    context: &mut Map<String, Value>,
    parameters: &mut Map<String, Value>,
) -> Result<()> {
    let mut deferred = Vec::new();
    for (key, formula) in &plan.derived_parameters {
        let Value::String(src) = formula else {
            context.insert(key.clone(), formula.clone());
            parameters.insert(key.clone(), formula.clone());
            continue;
        };
        match evaluate(src, context) {
            Ok(n) => {
                let value = n.to_value().map_err(|e| derived_error(key, src, e))?;
                context.insert(key.clone(), value.clone());
                parameters.insert(key.clone(), value);
            }
            Err(ExprError::UnknownIdentifier(_)) => deferred.push((key, src)),
            Err(e) => return Err(derived_error(key, src, e)),
        }
    }
    for (key, src) in deferred {
        let value = evaluate(src, context)
            .and_then(|n| n.to_value())
            .map_err(|e| derived_error(key, src, e))?;
        context.insert(key.clone(), value.clone());
        parameters.insert(key.clone(), value);
    }
    Ok(())
}

fn derived_error(key: &str, src: &str, err: ExprError) -> SweepError {
    SweepError::config(format!(
        "derived parameter '{}' = '{}': {}",
        key, src, err
    ))
}

fn apply_overlay(
    configs: &mut BTreeMap<String, ConfigDocument>,
    file: &str,
    overlay: &Value,
) -> Result<()> {
    let doc = configs
        .get_mut(file)
        .ok_or_else(|| SweepError::config(format!("unknown config file '{}'", file)))?;
    deep_merge(&mut doc.data, overlay)
}

fn inject_parameters(
    plan: &SweepPlan,
    configs: &mut BTreeMap<String, ConfigDocument>,
    parameters: &Map<String, Value>,
) -> Result<()> {
    for (param, target) in &plan.parameter_targets {
        let Some(value) = parameters.get(param) else {
            continue;
        };
        let doc = configs.get_mut(&target.file).ok_or_else(|| {
            SweepError::config(format!(
                "parameter target for '{}' names unknown config file '{}'",
                param, target.file
            ))
        })?;
        let data = doc.data_map_mut().ok_or_else(|| {
            SweepError::config(format!("{}: data is not a mapping", target.file))
        })?;
        let section = data
            .entry(target.section.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        match section.as_object_mut() {
            Some(section) => {
                section.insert(param.clone(), value.clone());
            }
            None => {
                return Err(SweepError::config(format!(
                    "{}: section '{}' is not a mapping",
                    target.file, target.section
                )))
            }
        }
    }
    for (param, value) in parameters {
        if plan.parameter_targets.contains_key(param) {
            continue;
        }
        for doc in configs.values_mut() {
            replace_key_everywhere(&mut doc.data, param, value);
        }
    }
    Ok(())
}

/// Overwrite every existing `key` inside nested mappings. Never adds keys.
fn replace_key_everywhere(node: &mut Value, key: &str, value: &Value) {
    if let Value::Object(map) = node {
        for (k, child) in map.iter_mut() {
            if k == key {
                *child = value.clone();
            } else {
                replace_key_everywhere(child, key, value);
            }
        }
    }
}
