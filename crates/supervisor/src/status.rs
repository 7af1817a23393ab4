//! `supervisor_status.json`: a per-worker health snapshot for operators.

use std::{collections::BTreeMap, path::Path};

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
};

use crate::{Result, slot::WorkerStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatusEntry {
    pub alive: bool,
    pub pid: Option<u32>,
    pub uptime_secs: u64,
    pub restart_count: u32,
    pub status: WorkerStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub updated_at: DateTime<Utc>,
    pub supervisor_pid: u32,
    pub workers: BTreeMap<String, WorkerStatusEntry>,
}

/// Write `status` atomically (temp file + rename).
pub fn write_status(path: &Path, status: &SupervisorStatus) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(status)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

pub fn read_status(path: &Path) -> Result<SupervisorStatus> {
    let raw = std::fs::read(path)?;
    Ok(serde_json::from_slice(&raw)?)
}
