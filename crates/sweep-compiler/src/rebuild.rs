use serde::Serialize;
use serde_json::Value;
use sweep_core::plan::SweepPlan;
use sweep_core::OpContext;

/// Compile-time parameters; a change to any of them invalidates the binary.
pub const CRITICAL_PARAMS: [&str; 7] = [
    "nxgrid", "nygrid", "nzgrid", "ncpus", "nprocx", "nprocy", "nprocz",
];
pub const CRITICAL_PARAM_FILE: &str = "cparam_local.yaml";
pub const CRITICAL_FILES: [&str; 2] = ["cparam_local.yaml", "Makefile_local.yaml"];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RebuildReason {
    Default,
    DisabledByPlan,
    CriticalParamChanged {
        param: String,
        base: Value,
        suite: Value,
    },
    SweepTouchesCritical { variable: String },
    TargetTouchesCritical { param: String },
    PlanModifiesCriticalFile { file: String },
    BranchModifiesCriticalFile { branch: String, file: String },
    Forced,
}

impl RebuildReason {
    pub fn is_critical(&self) -> bool {
        !matches!(
            self,
            RebuildReason::Default | RebuildReason::DisabledByPlan | RebuildReason::Forced
        )
    }

    pub fn describe(&self) -> String {
        match self {
            RebuildReason::Default => "rebuild enabled by default".to_string(),
            RebuildReason::DisabledByPlan => "disabled by plan configuration".to_string(),
            RebuildReason::CriticalParamChanged { param, base, suite } => format!(
                "critical parameter '{}' differs from base ({} vs {})",
                param, base, suite
            ),
            RebuildReason::SweepTouchesCritical { variable } => {
                format!("sweep varies critical parameter '{}'", variable)
            }
            RebuildReason::TargetTouchesCritical { param } => {
                format!("parameter target injects critical parameter '{}'", param)
            }
            RebuildReason::PlanModifiesCriticalFile { file } => {
                format!("plan modifications touch '{}'", file)
            }
            RebuildReason::BranchModifiesCriticalFile { branch, file } => {
                format!("branch '{}' modifies '{}'", branch, file)
            }
            RebuildReason::Forced => "forced from the command line".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RebuildDecision {
    pub rebuild: bool,
    pub reason: RebuildReason,
}

/// What the suite-wide rebuild check looks at.
pub struct RebuildInputs<'a> {
    pub plan: &'a SweepPlan,
    /// `data` of the critical parameter file in the root base experiment.
    pub base_params: Option<&'a Value>,
    /// `data` of the same file after the suite's inheritance merge.
    pub suite_params: Option<&'a Value>,
    pub sweep_variables: &'a [&'a str],
}

fn first_critical_trigger(inputs: &RebuildInputs<'_>) -> Option<RebuildReason> {
    if let Some(base) = inputs.base_params {
        let null = Value::Null;
        for param in CRITICAL_PARAMS {
            let base_value = base.get(param).unwrap_or(&null);
            let suite_value = inputs
                .suite_params
                .and_then(|s| s.get(param))
                .unwrap_or(&null);
            if base_value != suite_value {
                return Some(RebuildReason::CriticalParamChanged {
                    param: param.to_string(),
                    base: base_value.clone(),
                    suite: suite_value.clone(),
                });
            }
        }
    }
    if let Some(variable) = inputs
        .sweep_variables
        .iter()
        .find(|v| CRITICAL_PARAMS.contains(*v))
    {
        return Some(RebuildReason::SweepTouchesCritical {
            variable: variable.to_string(),
        });
    }
    if let Some(param) = inputs
        .plan
        .parameter_targets
        .keys()
        .find(|k| CRITICAL_PARAMS.contains(&k.as_str()))
    {
        return Some(RebuildReason::TargetTouchesCritical {
            param: param.clone(),
        });
    }
    for file in CRITICAL_FILES {
        if inputs.plan.modifications.contains_key(file) {
            return Some(RebuildReason::PlanModifiesCriticalFile {
                file: file.to_string(),
            });
        }
    }
    for branch in &inputs.plan.branches {
        for file in CRITICAL_FILES {
            if branch.settings.contains_key(file) {
                return Some(RebuildReason::BranchModifiesCriticalFile {
                    branch: branch.name.clone(),
                    file: file.to_string(),
                });
            }
        }
    }
    None
}

/// Decide once for the whole suite whether the job script rebuilds the binary.
///
/// Rebuilding is the default. The plan may disable it unless a critical
/// trigger fires; `force` always wins.
pub fn decide(
    ctx: &OpContext,
    inputs: &RebuildInputs<'_>,
    detect_critical: bool,
    force: bool,
) -> RebuildDecision {
    let _span = ctx.span().enter();
    let mut decision = if inputs.plan.disable_auto_rebuild {
        RebuildDecision {
            rebuild: false,
            reason: RebuildReason::DisabledByPlan,
        }
    } else {
        RebuildDecision {
            rebuild: true,
            reason: RebuildReason::Default,
        }
    };
    if detect_critical {
        if let Some(reason) = first_critical_trigger(inputs) {
            tracing::warn!(reason = %reason.describe(), "critical change forces rebuild");
            decision = RebuildDecision {
                rebuild: true,
                reason,
            };
        }
    }
    if force {
        tracing::warn!("rebuild forced via --rebuild");
        decision = RebuildDecision {
            rebuild: true,
            reason: RebuildReason::Forced,
        };
    } else {
        tracing::info!(
            rebuild = decision.rebuild,
            reason = %decision.reason.describe(),
            "rebuild decision"
        );
    }
    decision
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan(raw: &str) -> SweepPlan {
        SweepPlan::from_yaml_str(raw).expect("plan")
    }

    #[test]
    fn default_is_rebuild_and_plan_can_disable_it() {
        let ctx = OpContext::capture("generate", "e");
        let p = plan("output_prefix: x\n");
        let inputs = RebuildInputs {
            plan: &p,
            base_params: None,
            suite_params: None,
            sweep_variables: &[],
        };
        assert_eq!(
            decide(&ctx, &inputs, true, false),
            RebuildDecision {
                rebuild: true,
                reason: RebuildReason::Default
            }
        );
        let p = plan("disable_auto_rebuild: true\n");
        let inputs = RebuildInputs {
            plan: &p,
            base_params: None,
            suite_params: None,
            sweep_variables: &[],
        };
        let d = decide(&ctx, &inputs, true, false);
        assert!(!d.rebuild);
        assert_eq!(d.reason, RebuildReason::DisabledByPlan);
        assert_eq!(decide(&ctx, &inputs, true, true).reason, RebuildReason::Forced);
    }

    #[test]
    fn changed_grid_size_overrides_plan_opt_out() {
        let ctx = OpContext::capture("generate", "e");
        let p = plan("disable_auto_rebuild: true\n");
        let base = json!({"nxgrid": 64, "nygrid": 1});
        let suite = json!({"nxgrid": 128, "nygrid": 1});
        let inputs = RebuildInputs {
            plan: &p,
            base_params: Some(&base),
            suite_params: Some(&suite),
            sweep_variables: &[],
        };
        let d = decide(&ctx, &inputs, true, false);
        assert!(d.rebuild);
        assert!(d.reason.is_critical());
        assert!(matches!(
            d.reason,
            RebuildReason::CriticalParamChanged { ref param, .. } if param == "nxgrid"
        ));

        let d = decide(&ctx, &inputs, false, false);
        assert!(!d.rebuild, "detection flag off keeps the plan setting");
    }

    #[test]
    fn sweeps_modifications_and_branches_touching_critical_state_force_rebuild() {
        let ctx = OpContext::capture("generate", "e");
        let p = plan("disable_auto_rebuild: true\n");
        let inputs = RebuildInputs {
            plan: &p,
            base_params: None,
            suite_params: None,
            sweep_variables: &["nu", "ncpus"],
        };
        assert_eq!(
            decide(&ctx, &inputs, true, false).reason,
            RebuildReason::SweepTouchesCritical {
                variable: "ncpus".to_string()
            }
        );

        let p = plan(
            "disable_auto_rebuild: true\nmodifications:\n  Makefile_local.yaml: { data: {} }\n",
        );
        let inputs = RebuildInputs {
            plan: &p,
            base_params: None,
            suite_params: None,
            sweep_variables: &[],
        };
        assert!(decide(&ctx, &inputs, true, false).rebuild);

        let p = plan(
            "disable_auto_rebuild: true\nbranches:\n  - name: big\n    settings:\n      cparam_local.yaml: { nxgrid: 256 }\n",
        );
        let inputs = RebuildInputs {
            plan: &p,
            base_params: None,
            suite_params: None,
            sweep_variables: &[],
        };
        assert_eq!(
            decide(&ctx, &inputs, true, false).reason,
            RebuildReason::BranchModifiesCriticalFile {
                branch: "big".to_string(),
                file: "cparam_local.yaml".to_string()
            }
        );
    }
}
