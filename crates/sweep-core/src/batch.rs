use crate::atomic_write_bytes;
use crate::error::{Result, SweepError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

/// Scheduler-assigned identifier of a submitted array job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchHandle(String);

impl BatchHandle {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
            return Err(SweepError::config(format!("invalid batch id {:?}", id)));
        }
        Ok(BatchHandle(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn write_batch_handle(path: &Path, handle: &BatchHandle) -> Result<()> {
    atomic_write_bytes(path, handle.as_str().as_bytes())
}

pub fn read_batch_handle(path: &Path) -> Result<BatchHandle> {
    if !path.exists() {
        return Err(SweepError::BatchHandleMissing {
            path: path.to_path_buf(),
        });
    }
    let raw = fs::read_to_string(path).map_err(|e| SweepError::io(path, e))?;
    if raw.trim().is_empty() {
        return Err(SweepError::config(format!(
            "batch id file {} is empty",
            path.display()
        )));
    }
    BatchHandle::new(raw)
}
