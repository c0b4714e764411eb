use crate::context::OpContext;
use crate::error::{Result, SweepError};
use crate::layout::ExperimentLayout;
use crate::{atomic_write_bytes, ensure_dir};
use std::fs;
use std::path::{Path, PathBuf};

/// How the manifest that was just read came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestOrigin {
    Existing,
    /// Rebuilt from run directories sorted by name. The task-id mapping of the
    /// original generation is not guaranteed to survive this.
    Regenerated { runs: usize },
}

impl ManifestOrigin {
    pub fn is_order_unsafe(&self) -> bool {
        matches!(self, ManifestOrigin::Regenerated { .. })
    }
}

/// Ordered task-index -> run-name list. Line `i` (0-based) is task `i + 1`.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
    artifacts_dir: PathBuf,
}

impl ManifestStore {
    pub fn new(path: impl Into<PathBuf>, artifacts_dir: impl Into<PathBuf>) -> Self {
        ManifestStore {
            path: path.into(),
            artifacts_dir: artifacts_dir.into(),
        }
    }

    pub fn for_layout(layout: &ExperimentLayout) -> Self {
        Self::new(layout.manifest_path(), layout.generated_configs_dir())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&self, run_names: &[String]) -> Result<()> {
        let mut body = String::new();
        for name in run_names {
            let padded = name.trim() != name;
            if name.trim().is_empty() || padded || name.contains('\n') || name.contains('\r') {
                return Err(SweepError::config(format!(
                    "run name {:?} cannot be written to the manifest",
                    name
                )));
            }
            body.push_str(name);
            body.push('\n');
        }
        atomic_write_bytes(&self.path, body.as_bytes())
    }

    pub fn read(&self) -> Result<Vec<String>> {
        if !self.path.exists() {
            return Err(SweepError::ManifestMissing {
                path: self.path.clone(),
            });
        }
        let data = fs::read_to_string(&self.path).map_err(|e| SweepError::io(&self.path, e))?;
        Ok(data
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .map(|l| l.to_string())
            .collect())
    }

    /// Make sure a manifest exists, rebuilding it from the run directories on
    /// disk if it was lost.
    pub fn ensure_exists(&self, ctx: &OpContext) -> Result<ManifestOrigin> {
        let _span = ctx.span().enter();
        if self.path.exists() {
            return Ok(ManifestOrigin::Existing);
        }
        tracing::warn!(
            manifest = %self.path.display(),
            "manifest missing; regenerating from run directories"
        );
        if !self.artifacts_dir.is_dir() {
            return Err(SweepError::ManifestMissing {
                path: self.path.clone(),
            });
        }
        let mut names = Vec::new();
        let entries =
            fs::read_dir(&self.artifacts_dir).map_err(|e| SweepError::io(&self.artifacts_dir, e))?;
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        if names.is_empty() {
            return Err(SweepError::ManifestMissing {
                path: self.path.clone(),
            });
        }
        names.sort();
        if let Some(parent) = self.path.parent() {
            ensure_dir(parent)?;
        }
        self.write(&names)?;
        tracing::warn!(
            runs = names.len(),
            "manifest regenerated in name order; task ids may not match the submitted batch"
        );
        ctx.say(format!(
            "warning: regenerated manifest with {} runs sorted by name; task-id mapping may differ from the original generation",
            names.len()
        ));
        Ok(ManifestOrigin::Regenerated { runs: names.len() })
    }

    /// Ensure-then-read, returning the names together with their origin.
    pub fn load(&self, ctx: &OpContext) -> Result<(Vec<String>, ManifestOrigin)> {
        let origin = self.ensure_exists(ctx)?;
        Ok((self.read()?, origin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn scratch(label: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "sweep_manifest_{}_{}_{}",
            label,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&root).expect("scratch dir");
        root
    }

    #[test]
    fn write_then_read_preserves_order() {
        let root = scratch("roundtrip");
        let store = ManifestStore::new(root.join("run_manifest.txt"), root.join("generated_configs"));
        let names: Vec<String> = ["r1", "r2", "r3"].iter().map(|s| s.to_string()).collect();
        store.write(&names).expect("write");
        assert_eq!(store.read().expect("read"), names);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn write_rejects_names_that_would_not_read_back_verbatim() {
        let root = scratch("reject");
        let store = ManifestStore::new(root.join("m.txt"), root.join("g"));
        assert!(store.write(&["ok".to_string(), " ".to_string()]).is_err());
        assert!(store.write(&["a\nb".to_string()]).is_err());
        assert!(store.write(&[" padded".to_string()]).is_err());
        assert!(store.write(&["trailing\t".to_string()]).is_err());
        assert!(!store.path().exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_manifest_is_regenerated_sorted_and_flagged() {
        let root = scratch("regen");
        let generated = root.join("generated_configs");
        for name in ["zeta", "alpha", "mid"] {
            ensure_dir(&generated.join(name)).expect("run dir");
        }
        fs::write(generated.join("stray.txt"), "x").expect("stray file");
        let store = ManifestStore::new(root.join("run_manifest.txt"), &generated);
        let ctx = OpContext::capture("status", "e");
        let origin = store.ensure_exists(&ctx).expect("regenerate");
        assert_eq!(origin, ManifestOrigin::Regenerated { runs: 3 });
        assert!(origin.is_order_unsafe());
        assert_eq!(store.read().expect("read"), vec!["alpha", "mid", "zeta"]);
        assert!(ctx.captured()[0].contains("task-id mapping may differ"));
        assert_eq!(store.ensure_exists(&ctx).expect("exists"), ManifestOrigin::Existing);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn regeneration_without_run_dirs_reports_missing_manifest() {
        let root = scratch("none");
        let store = ManifestStore::new(root.join("run_manifest.txt"), root.join("generated_configs"));
        let ctx = OpContext::capture("status", "e");
        match store.ensure_exists(&ctx) {
            Err(SweepError::ManifestMissing { .. }) => {}
            other => panic!("expected ManifestMissing, got {:?}", other),
        }
        let _ = fs::remove_dir_all(root);
    }
}
