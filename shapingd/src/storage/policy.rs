use crate::shaping::policy::PolicyTable;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

const POLICY_FILE_NAME: &str = "shaping_policies.json";

pub fn policy_file_path(data_dir: &str) -> PathBuf {
    Path::new(data_dir).join(POLICY_FILE_NAME)
}

/// Load the policy table. A missing file is an empty table.
pub fn load_policies<P: AsRef<Path>>(path: P) -> Result<PolicyTable> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(PolicyTable::default());
    }

    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read policy file {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(PolicyTable::default());
    }

    serde_json::from_str::<PolicyTable>(&content)
        .with_context(|| format!("Failed to parse policy file {}: invalid format", path.display()))
}

pub fn save_policies<P: AsRef<Path>>(path: P, table: &PolicyTable) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(table)
        .map_err(|e| anyhow::anyhow!("Failed to serialize policy table: {}", e))?;

    // Write then rename so a crash never leaves a truncated file.
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    log::debug!("Saved {} traffic shaping policies to {}", table.len(), path.display());
    Ok(())
}
