//! Sweep expansion: `parameter_sweeps` -> ordered parameter combinations.

use serde::Serialize;
use serde_json::{Map, Value};
use sweep_core::plan::SweepGroupSpec;
use sweep_core::{Result, SweepError};

#[derive(Debug, Clone, PartialEq)]
pub enum SweepGroup {
    /// All variables take the same value; one combination per value.
    Linked {
        variables: Vec<String>,
        values: Vec<Value>,
    },
    /// One variable, one combination per value.
    Product { variable: String, values: Vec<Value> },
}

impl SweepGroup {
    pub fn from_spec(index: usize, spec: &SweepGroupSpec) -> Result<Self> {
        let group = match spec.kind.as_str() {
            "linked" => {
                let variables = spec.variables.clone().ok_or_else(|| {
                    SweepError::config(format!(
                        "parameter_sweeps[{}]: linked group requires `variables`",
                        index
                    ))
                })?;
                if variables.is_empty() || variables.iter().any(|v| v.trim().is_empty()) {
                    return Err(SweepError::config(format!(
                        "parameter_sweeps[{}]: linked group `variables` must be non-empty names",
                        index
                    )));
                }
                SweepGroup::Linked {
                    variables,
                    values: spec.values.clone(),
                }
            }
            "product" => {
                let variable = spec
                    .variable
                    .clone()
                    .filter(|v| !v.trim().is_empty())
                    .ok_or_else(|| {
                        SweepError::config(format!(
                            "parameter_sweeps[{}]: product group requires `variable`",
                            index
                        ))
                    })?;
                SweepGroup::Product {
                    variable,
                    values: spec.values.clone(),
                }
            }
            other => {
                return Err(SweepError::config(format!(
                    "parameter_sweeps[{}]: unknown sweep type '{}' (expected linked|product)",
                    index, other
                )))
            }
        };
        if group.values().is_empty() {
            return Err(SweepError::config(format!(
                "parameter_sweeps[{}]: `values` must contain at least one entry",
                index
            )));
        }
        Ok(group)
    }

    pub fn values(&self) -> &[Value] {
        match self {
            SweepGroup::Linked { values, .. } | SweepGroup::Product { values, .. } => values,
        }
    }

    pub fn variables(&self) -> Vec<&str> {
        match self {
            SweepGroup::Linked { variables, .. } => variables.iter().map(|s| s.as_str()).collect(),
            SweepGroup::Product { variable, .. } => vec![variable.as_str()],
        }
    }

    fn combinations(&self) -> Vec<ParameterCombination> {
        self.values()
            .iter()
            .map(|value| {
                let mut combo = ParameterCombination::default();
                for var in self.variables() {
                    combo.set(var, value.clone());
                }
                combo
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepSpec {
    pub groups: Vec<SweepGroup>,
}

impl SweepSpec {
    pub fn from_specs(specs: &[SweepGroupSpec]) -> Result<Self> {
        let groups = specs
            .iter()
            .enumerate()
            .map(|(i, s)| SweepGroup::from_spec(i, s))
            .collect::<Result<Vec<_>>>()?;
        Ok(SweepSpec { groups })
    }

    /// Every variable name any group sweeps.
    pub fn variables(&self) -> Vec<&str> {
        self.groups.iter().flat_map(|g| g.variables()).collect()
    }

    /// Expected number of combinations.
    pub fn size(&self) -> usize {
        self.groups.iter().map(|g| g.values().len()).product()
    }
}

/// Variable -> value mapping for one point of the sweep.
///
/// Keys keep first-insertion order so names built from them are stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(into = "Map<String, Value>")]
pub struct ParameterCombination {
    entries: Vec<(String, Value)>,
}

impl ParameterCombination {
    fn set(&mut self, key: &str, value: Value) {
        if let Some(slot) = self.entries.iter_mut().find(|(k, _)| k == key) {
            slot.1 = value;
        } else {
            self.entries.push((key.to_string(), value));
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> Vec<&str> {
        self.entries.iter().map(|(k, _)| k.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn merged_with(&self, other: &ParameterCombination) -> ParameterCombination {
        let mut out = self.clone();
        for (k, v) in other.iter() {
            out.set(k, v.clone());
        }
        out
    }
}

impl From<ParameterCombination> for Map<String, Value> {
    fn from(combo: ParameterCombination) -> Self {
        combo.entries.into_iter().collect()
    }
}

/// Cartesian product of the per-group combination lists, first group varying
/// slowest. No groups yields a single empty combination.
pub fn expand(spec: &SweepSpec) -> Vec<ParameterCombination> {
    let mut acc = vec![ParameterCombination::default()];
    for group in &spec.groups {
        let group_combos = group.combinations();
        let mut next = Vec::with_capacity(acc.len() * group_combos.len());
        for prefix in &acc {
            for combo in &group_combos {
                next.push(prefix.merged_with(combo));
            }
        }
        acc = next;
    }
    acc
}
