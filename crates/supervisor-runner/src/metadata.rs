//! `supervisor_meta.json`: the one-file answer to "is the supervisor alive
//! and how recent is its last check". Overwritten, never appended.

use crate::config::RunConfig;
use crate::fsutil::atomic_write_json_pretty;
use crate::tick::TickRecord;
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const META_FILE_NAME: &str = "supervisor_meta.json";
pub const SCHEMA_VERSION: &str = "supervisor_meta_v1";

pub fn meta_path(out_dir: &Path) -> PathBuf {
    out_dir.join(META_FILE_NAME)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorStatus {
    Running,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataSnapshot {
    pub schema_version: String,
    pub process_id: u32,
    pub status: SupervisorStatus,
    pub mode: String,
    pub check_mode: String,
    pub run_id: String,
    pub out_dir: PathBuf,
    pub last_tick_id: Option<String>,
    pub last_tick_timestamp: Option<String>,
    pub last_exit_code: Option<i32>,
    pub ticks_completed: u64,
    pub updated_at: String,
}

impl MetadataSnapshot {
    pub fn new(
        cfg: &RunConfig,
        status: SupervisorStatus,
        last: Option<&TickRecord>,
        ticks_completed: u64,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            process_id: std::process::id(),
            status,
            mode: cfg.mode.to_string(),
            check_mode: cfg.check_mode.to_string(),
            run_id: cfg.run_id.clone(),
            out_dir: cfg.out_dir.clone(),
            last_tick_id: last.map(|t| t.tick_id.clone()),
            last_tick_timestamp: last.map(|t| rfc3339(t.timestamp)),
            last_exit_code: last.map(|t| t.exit_code),
            ticks_completed,
            updated_at: rfc3339(Utc::now()),
        }
    }
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn publish(
    cfg: &RunConfig,
    status: SupervisorStatus,
    last: Option<&TickRecord>,
    ticks_completed: u64,
) -> Result<MetadataSnapshot> {
    let snapshot = MetadataSnapshot::new(cfg, status, last, ticks_completed);
    atomic_write_json_pretty(&meta_path(&cfg.out_dir), &snapshot)
        .context("failed to publish supervisor metadata")?;
    Ok(snapshot)
}

pub fn read(out_dir: &Path) -> Result<Option<MetadataSnapshot>> {
    let path = meta_path(out_dir);
    if !path.exists() {
        return Ok(None);
    }
    let raw =
        fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let snapshot = serde_json::from_str(&raw)
        .with_context(|| format!("malformed metadata in {}", path.display()))?;
    Ok(Some(snapshot))
}
