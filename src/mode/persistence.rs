//! Disk persistence for the operating mode.
//!
//! Only the current mode is kept; history lives in the audit log. A missing
//! or unreadable file means "use the configured default".

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ExecutionMode;

const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedMode {
    pub version: u32,
    pub mode: ExecutionMode,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_by: String,
}

impl PersistedMode {
    pub fn new(mode: ExecutionMode, principal: &str) -> Self {
        Self {
            version: STATE_VERSION,
            mode,
            updated_at: Utc::now(),
            updated_by: principal.to_string(),
        }
    }
}

pub fn default_mode_path(state_dir: &Path) -> PathBuf {
    state_dir.join("mode.json")
}

fn ensure_parent_dir(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
    }
    Ok(())
}

fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    ensure_parent_dir(path)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data).with_context(|| format!("Failed to write temp file: {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| {
        format!(
            "Failed to replace {} with {}",
            path.display(),
            tmp.display()
        )
    })?;
    Ok(())
}

pub fn load(path: &Path) -> anyhow::Result<PersistedMode> {
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let state: PersistedMode =
        serde_json::from_str(&raw).with_context(|| format!("Invalid mode JSON at {}", path.display()))?;
    Ok(state)
}

pub fn save(path: &Path, state: &PersistedMode) -> anyhow::Result<()> {
    let data = serde_json::to_vec_pretty(state).context("Failed to serialize mode")?;
    write_atomic(path, &data)
}
