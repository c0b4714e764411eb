//! Simulation output snapshots.
//!
//! Each snapshot is one JSON file:
//!
//! ```json
//! {"time": 0.25, "fields": {"rho": [1.0, 0.98, "nan"], "ux": [0.0, "inf"]}}
//! ```
//!
//! Non-finite samples are spelled as the strings `nan`, `inf` and `-inf`
//! since JSON numbers cannot carry them.

use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use sweep_core::{Result, SweepError};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Snapshot {
    pub time: f64,
    #[serde(default, deserialize_with = "deserialize_fields")]
    pub fields: BTreeMap<String, Vec<f64>>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Sample {
    Number(f64),
    Text(String),
}

impl Sample {
    fn into_f64(self) -> std::result::Result<f64, String> {
        match self {
            Sample::Number(v) => Ok(v),
            Sample::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "nan" | "-nan" => Ok(f64::NAN),
                "inf" | "+inf" | "infinity" => Ok(f64::INFINITY),
                "-inf" | "-infinity" => Ok(f64::NEG_INFINITY),
                _ => Err(format!("unsupported sample {:?}", s)),
            },
        }
    }
}

fn deserialize_fields<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, Vec<f64>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, Vec<Sample>> = BTreeMap::deserialize(deserializer)?;
    let mut fields = BTreeMap::new();
    for (name, samples) in raw {
        let values = samples
            .into_iter()
            .map(Sample::into_f64)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| serde::de::Error::custom(format!("field '{}': {}", name, e)))?;
        fields.insert(name, values);
    }
    Ok(fields)
}

impl Snapshot {
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn has_nan(&self) -> bool {
        self.fields.values().flatten().any(|v| v.is_nan())
    }

    pub fn has_inf(&self) -> bool {
        self.fields.values().flatten().any(|v| v.is_infinite())
    }
}

fn snapshot_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("json"))
        .collect();
    files.sort();
    files
}

/// Every `*.json` snapshot directly under `dir`, ordered by simulation time.
/// A missing directory holds no snapshots.
pub fn load_snapshots(dir: &Path) -> Result<Vec<Snapshot>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut snapshots = Vec::new();
    for path in snapshot_files(dir) {
        let bytes = fs::read(&path).map_err(|e| SweepError::io(&path, e))?;
        let snapshot = Snapshot::from_json_slice(&bytes).map_err(|e| {
            SweepError::config(format!("invalid snapshot {}: {}", path.display(), e))
        })?;
        snapshots.push(snapshot);
    }
    snapshots.sort_by(|a, b| a.time.total_cmp(&b.time));
    Ok(snapshots)
}
