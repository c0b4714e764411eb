pub mod batch;
pub mod context;
pub mod error;
pub mod layout;
pub mod logging;
pub mod manifest;
pub mod plan;

pub use batch::{read_batch_handle, write_batch_handle, BatchHandle};
pub use context::{Console, OpContext};
pub use error::{Result, SweepError};
pub use layout::ExperimentLayout;
pub use manifest::{ManifestOrigin, ManifestStore};

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::Path;

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| SweepError::io(path, e))
}

/// Write through a sibling temp file and rename, so readers never observe a
/// half-written file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let write = || -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    };
    if let Err(e) = write() {
        let _ = fs::remove_file(&tmp);
        return Err(SweepError::io(path, e));
    }
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty(path: &Path, value: &Value) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Digest of a JSON value with object keys in sorted order.
pub fn canonical_json_digest(value: &Value) -> Result<String> {
    // serde_json::Map is a BTreeMap here, so serialization is key-sorted.
    let bytes = serde_json::to_vec(value)?;
    Ok(sha256_bytes(&bytes))
}
