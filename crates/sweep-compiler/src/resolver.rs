//! Hierarchical configuration lookup.
//!
//! An experiment may point at a base experiment; its documents are the base's
//! documents with its own overrides merged on top. Pointers are followed one
//! link at a time and every link is checked against the active chain, so a
//! cycle is reported before any experiment is read twice.

use crate::merge::deep_merge;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use sweep_core::layout::INPUTS_SUBDIR;
use sweep_core::plan::load_yaml_file;
use sweep_core::{OpContext, Result, SweepError};

/// Metadata files that may carry a `base_config` pointer, in lookup order.
pub const METADATA_FILES: [&str; 2] = ["experiment.yaml", "analysis_config.yaml"];
pub const BASE_POINTER_KEY: &str = "base_config";

/// `{format, data}` pair. Documents without a format are resolved like any
/// other but are never rendered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigDocument {
    pub format: Option<String>,
    pub data: Value,
}

impl ConfigDocument {
    pub fn from_value(file: &str, value: Value) -> Result<Self> {
        let mut map = match value {
            Value::Object(map) => map,
            other => {
                return Err(SweepError::config(format!(
                    "config file {} must be a mapping, found {}",
                    file,
                    json_kind(&other)
                )))
            }
        };
        if !map.contains_key("format") && !map.contains_key("data") {
            return Ok(ConfigDocument {
                format: None,
                data: Value::Object(map),
            });
        }
        let format = match map.remove("format") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s),
            Some(other) => {
                return Err(SweepError::config(format!(
                    "config file {}: `format` must be a string, found {}",
                    file,
                    json_kind(&other)
                )))
            }
        };
        let data = match map.remove("data") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(v @ Value::Object(_)) => v,
            Some(other) => {
                return Err(SweepError::config(format!(
                    "config file {}: `data` must be a mapping, found {}",
                    file,
                    json_kind(&other)
                )))
            }
        };
        Ok(ConfigDocument { format, data })
    }

    pub fn data_map_mut(&mut self) -> Option<&mut Map<String, Value>> {
        self.data.as_object_mut()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

/// Where experiment configuration comes from.
pub trait ConfigSource {
    fn exists(&self, experiment: &str) -> bool;
    fn base_pointer(&self, experiment: &str) -> Result<Option<String>>;
    fn filenames(&self, experiment: &str) -> Result<Vec<String>>;
    /// Raw document, or `None` when the experiment does not define the file.
    fn load(&self, experiment: &str, file: &str) -> Result<Option<Value>>;
}

/// `<root>/<experiment>/in/*.yaml`, metadata in `<root>/<experiment>/`.
#[derive(Debug, Clone)]
pub struct DirConfigSource {
    root: PathBuf,
}

impl DirConfigSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirConfigSource { root: root.into() }
    }

    fn inputs_dir(&self, experiment: &str) -> PathBuf {
        self.root.join(experiment).join(INPUTS_SUBDIR)
    }
}

impl ConfigSource for DirConfigSource {
    fn exists(&self, experiment: &str) -> bool {
        self.root.join(experiment).is_dir()
    }

    fn base_pointer(&self, experiment: &str) -> Result<Option<String>> {
        for name in METADATA_FILES {
            let path = self.root.join(experiment).join(name);
            if !path.is_file() {
                continue;
            }
            let meta = load_yaml_file(&path)?;
            return match meta.get(BASE_POINTER_KEY) {
                None | Some(Value::Null) => Ok(None),
                Some(Value::String(s)) if !s.trim().is_empty() => Ok(Some(s.trim().to_string())),
                Some(other) => Err(SweepError::config(format!(
                    "{}: `{}` must be an experiment name, found {}",
                    path.display(),
                    BASE_POINTER_KEY,
                    other
                ))),
            };
        }
        Ok(None)
    }

    fn filenames(&self, experiment: &str) -> Result<Vec<String>> {
        let dir = self.inputs_dir(experiment);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| SweepError::io(&dir, e))? {
            let entry = entry.map_err(|e| SweepError::io(&dir, e))?;
            let path = entry.path();
            if path.is_file() && has_yaml_extension(&path) {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn load(&self, experiment: &str, file: &str) -> Result<Option<Value>> {
        let path = self.inputs_dir(experiment).join(file);
        if !path.is_file() {
            return Ok(None);
        }
        load_yaml_file(&path).map(Some)
    }
}

fn has_yaml_extension(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// Resolves and caches merged documents for the lifetime of one compilation.
pub struct ConfigResolver<S: ConfigSource> {
    source: S,
    declared_bases: BTreeMap<String, String>,
    chains: HashMap<String, Vec<String>>,
    cache: HashMap<(String, String), Option<ConfigDocument>>,
}

impl<S: ConfigSource> ConfigResolver<S> {
    pub fn new(source: S) -> Self {
        ConfigResolver {
            source,
            declared_bases: BTreeMap::new(),
            chains: HashMap::new(),
            cache: HashMap::new(),
        }
    }

    /// Pointer declared outside the experiment's own metadata (the plan's
    /// `base_experiment`). Takes precedence over the metadata file.
    pub fn declare_base(&mut self, experiment: &str, base: &str) {
        self.declared_bases
            .insert(experiment.to_string(), base.to_string());
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// `[experiment, base, base-of-base, ...]`, most specific first.
    pub fn chain(&mut self, experiment: &str) -> Result<Vec<String>> {
        if let Some(chain) = self.chains.get(experiment) {
            return Ok(chain.clone());
        }
        if !self.source.exists(experiment) {
            return Err(SweepError::config(format!(
                "experiment '{}' has no configuration directory",
                experiment
            )));
        }
        let mut chain = vec![experiment.to_string()];
        let mut current = experiment.to_string();
        loop {
            let next = match self.declared_bases.get(&current) {
                Some(base) => Some(base.clone()),
                None => self.source.base_pointer(&current)?,
            };
            let Some(next) = next else { break };
            if chain.contains(&next) {
                let mut cycle = chain.clone();
                cycle.push(next);
                return Err(SweepError::CircularInheritance { chain: cycle });
            }
            if !self.source.exists(&next) {
                return Err(SweepError::config(format!(
                    "'{}' inherits from '{}', which has no configuration directory",
                    current, next
                )));
            }
            chain.push(next.clone());
            current = next;
        }
        self.chains.insert(experiment.to_string(), chain.clone());
        Ok(chain)
    }

    /// Root of the inheritance chain (the experiment itself when it has no base).
    pub fn root_of(&mut self, experiment: &str) -> Result<String> {
        let chain = self.chain(experiment)?;
        Ok(chain
            .last()
            .cloned()
            .unwrap_or_else(|| experiment.to_string()))
    }

    /// Merged document, or `None` when no experiment in the chain defines it.
    pub fn try_resolve(
        &mut self,
        ctx: &OpContext,
        experiment: &str,
        file: &str,
    ) -> Result<Option<ConfigDocument>> {
        let key = (experiment.to_string(), file.to_string());
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.clone());
        }
        let chain = self.chain(experiment)?;
        let _span = ctx.span().enter();
        // Layers are normalized first so a bare mapping merges into `data`.
        let mut doc: Option<ConfigDocument> = None;
        for name in chain.iter().rev() {
            let Some(raw) = self.source.load(name, file)? else {
                continue;
            };
            let layer = ConfigDocument::from_value(file, raw)?;
            tracing::debug!(experiment = %name, file = %file, "merging config layer");
            doc = Some(match doc {
                None => layer,
                Some(mut base) => {
                    deep_merge(&mut base.data, &layer.data)?;
                    if layer.format.is_some() {
                        base.format = layer.format;
                    }
                    base
                }
            });
        }
        self.cache.insert(key, doc.clone());
        Ok(doc)
    }

    pub fn resolve(
        &mut self,
        ctx: &OpContext,
        experiment: &str,
        file: &str,
    ) -> Result<ConfigDocument> {
        match self.try_resolve(ctx, experiment, file)? {
            Some(doc) => Ok(doc),
            None => {
                let chain = self.chain(experiment)?;
                Err(SweepError::config(format!(
                    "config file '{}' not found in {}",
                    file,
                    chain.join(" -> ")
                )))
            }
        }
    }

    /// Every document defined anywhere along the chain, merged.
    pub fn resolve_all(
        &mut self,
        ctx: &OpContext,
        experiment: &str,
    ) -> Result<BTreeMap<String, ConfigDocument>> {
        let chain = self.chain(experiment)?;
        let mut files = BTreeSet::new();
        for name in &chain {
            files.extend(self.source.filenames(name)?);
        }
        let mut out = BTreeMap::new();
        for file in files {
            let doc = self.resolve(ctx, experiment, &file)?;
            out.insert(file, doc);
        }
        {
            let _span = ctx.span().enter();
            tracing::info!(
                chain = %chain.join(" -> "),
                files = out.len(),
                "resolved configuration"
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::cell::RefCell;

    #[derive(Default)]
    struct MemorySource {
        pointers: BTreeMap<String, String>,
        docs: BTreeMap<(String, String), Value>,
        pointer_reads: RefCell<Vec<String>>,
    }

    impl MemorySource {
        fn with_experiment(mut self, name: &str, base: Option<&str>) -> Self {
            if let Some(base) = base {
                self.pointers.insert(name.to_string(), base.to_string());
            }
            self.docs
                .entry((name.to_string(), "__marker__".to_string()))
                .or_insert(Value::Null);
            self
        }

        fn with_doc(mut self, name: &str, file: &str, doc: Value) -> Self {
            self.docs.insert((name.to_string(), file.to_string()), doc);
            self
        }
    }

    impl ConfigSource for MemorySource {
        fn exists(&self, experiment: &str) -> bool {
            self.docs.keys().any(|(e, _)| e == experiment)
        }

        fn base_pointer(&self, experiment: &str) -> Result<Option<String>> {
            self.pointer_reads.borrow_mut().push(experiment.to_string());
            Ok(self.pointers.get(experiment).cloned())
        }

        fn filenames(&self, experiment: &str) -> Result<Vec<String>> {
            Ok(self
                .docs
                .keys()
                .filter(|(e, f)| e == experiment && f != "__marker__")
                .map(|(_, f)| f.clone())
                .collect())
        }

        fn load(&self, experiment: &str, file: &str) -> Result<Option<Value>> {
            Ok(self
                .docs
                .get(&(experiment.to_string(), file.to_string()))
                .cloned())
        }
    }

    #[test]
    fn cycle_is_reported_with_full_chain_before_rereading() {
        let source = MemorySource::default()
            .with_experiment("a", Some("b"))
            .with_experiment("b", Some("a"));
        let mut resolver = ConfigResolver::new(source);
        let ctx = OpContext::capture("generate", "a");
        match resolver.resolve(&ctx, "a", "run_in.yaml") {
            Err(SweepError::CircularInheritance { chain }) => {
                assert_eq!(chain, vec!["a", "b", "a"]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
        assert_eq!(*resolver.source().pointer_reads.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let source = MemorySource::default().with_experiment("a", Some("a"));
        let mut resolver = ConfigResolver::new(source);
        assert!(matches!(
            resolver.chain("a"),
            Err(SweepError::CircularInheritance { .. })
        ));
    }

    #[test]
    fn override_is_merged_on_top_of_base() {
        let source = MemorySource::default()
            .with_experiment("base", None)
            .with_experiment("child", Some("base"))
            .with_doc(
                "base",
                "run_in.yaml",
                json!({"format": "namelist", "data": {"run_pars": {"nt": 10, "dt": 0.1}}}),
            )
            .with_doc(
                "child",
                "run_in.yaml",
                json!({"data": {"run_pars": {"nt": 500}}}),
            )
            .with_doc("base", "start_in.yaml", json!({"format": "namelist", "data": {}}));
        let mut resolver = ConfigResolver::new(source);
        let ctx = OpContext::capture("generate", "child");
        let all = resolver.resolve_all(&ctx, "child").expect("resolve");
        assert_eq!(all.len(), 2);
        let run_in = &all["run_in.yaml"];
        assert_eq!(run_in.format.as_deref(), Some("namelist"));
        assert_eq!(run_in.data, json!({"run_pars": {"nt": 500, "dt": 0.1}}));
        assert_eq!(resolver.root_of("child").expect("root"), "base");
    }

    #[test]
    fn bare_mapping_child_merges_into_structured_base_data() {
        let source = MemorySource::default()
            .with_experiment("base", None)
            .with_experiment("child", Some("base"))
            .with_doc(
                "base",
                "run_in.yaml",
                json!({"format": "namelist", "data": {"run_pars": {"nt": 10, "dt": 0.1}}}),
            )
            .with_doc("child", "run_in.yaml", json!({"run_pars": {"nt": 500}}));
        let mut resolver = ConfigResolver::new(source);
        let ctx = OpContext::capture("generate", "child");
        let run_in = resolver.resolve(&ctx, "child", "run_in.yaml").expect("resolve");
        assert_eq!(run_in.format.as_deref(), Some("namelist"));
        assert_eq!(run_in.data, json!({"run_pars": {"nt": 500, "dt": 0.1}}));
    }

    #[test]
    fn declared_base_takes_precedence_over_metadata() {
        let source = MemorySource::default()
            .with_experiment("meta_base", None)
            .with_experiment("plan_base", None)
            .with_experiment("child", Some("meta_base"));
        let mut resolver = ConfigResolver::new(source);
        resolver.declare_base("child", "plan_base");
        assert_eq!(resolver.chain("child").expect("chain"), vec!["child", "plan_base"]);
    }

    #[test]
    fn missing_file_and_missing_base_are_configuration_errors() {
        let source = MemorySource::default()
            .with_experiment("child", Some("ghost"));
        let mut resolver = ConfigResolver::new(source);
        let err = resolver.chain("child").expect_err("ghost base");
        assert!(err.to_string().contains("ghost"), "{}", err);

        let source = MemorySource::default().with_experiment("solo", None);
        let mut resolver = ConfigResolver::new(source);
        let ctx = OpContext::capture("generate", "solo");
        let err = resolver.resolve(&ctx, "solo", "nope.yaml").expect_err("missing");
        assert!(err.to_string().contains("nope.yaml"), "{}", err);
    }

    #[test]
    fn directory_source_reads_inputs_and_metadata_pointer() {
        let root = std::env::temp_dir().join(format!(
            "sweep_resolver_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(root.join("base/in")).expect("base");
        fs::create_dir_all(root.join("child/in")).expect("child");
        fs::write(
            root.join("base/in/cparam_local.yaml"),
            "format: cparam\ndata:\n  nxgrid: 64\n  nygrid: 1\n",
        )
        .expect("base doc");
        fs::write(
            root.join("child/in/cparam_local.yaml"),
            "data:\n  nxgrid: 128\n",
        )
        .expect("child doc");
        fs::write(root.join("child/analysis_config.yaml"), "base_config: base\n")
            .expect("meta");

        let mut resolver = ConfigResolver::new(DirConfigSource::new(&root));
        let ctx = OpContext::capture("generate", "child");
        let doc = resolver
            .resolve(&ctx, "child", "cparam_local.yaml")
            .expect("resolve");
        assert_eq!(doc.format.as_deref(), Some("cparam"));
        assert_eq!(doc.data, json!({"nxgrid": 128, "nygrid": 1}));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn document_without_format_keeps_whole_mapping_as_data() {
        let doc = ConfigDocument::from_value("meta.yaml", json!({"title": "x"})).expect("doc");
        assert_eq!(doc.format, None);
        assert_eq!(doc.data, json!({"title": "x"}));
        assert!(ConfigDocument::from_value("bad.yaml", json!([1, 2])).is_err());
    }
}
