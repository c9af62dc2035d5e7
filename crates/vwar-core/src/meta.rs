//! Sidecar metadata schemas.
//!
//! Every vault artefact carries a `.meta` JSON sidecar; terminal states are
//! archived into `scanvault/history/` as history entries. Quarantined files
//! carry their own sidecar. `original_path` is always the case-preserved
//! absolute path; the lowercase compare form never appears in sidecars.

use chrono::Local;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultEvent {
    Created,
    Modified,
    Recovery,
    RateLimitRetry,
}

impl VaultEvent {
    pub fn label(&self) -> &'static str {
        match self {
            VaultEvent::Created => "created",
            VaultEvent::Modified => "modified",
            VaultEvent::Recovery => "recovery",
            VaultEvent::RateLimitRetry => "rate_limit_retry",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalStatus {
    Quarantined,
    Restored,
    DuplicateSuppressed,
    Clean,
}

/// Sidecar of a live `.vaulted` artefact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultMeta {
    pub original_path: String,
    pub vaulted_path: String,
    pub timestamp: String,
    pub event: VaultEvent,
    pub signature: String,
}

/// Terminal-state entry archived under `scanvault/history/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryMeta {
    pub original_path: String,
    pub timestamp: String,
    pub final_status: FinalStatus,
    pub action_timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vaulted_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<VaultEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantine_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_rule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_restore_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restored_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recheck_before_restore: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scan_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installation_mode: Option<bool>,
}

impl HistoryMeta {
    /// Archive form of a live vault sidecar.
    pub fn from_vault_meta(meta: &VaultMeta, status: FinalStatus) -> Self {
        Self {
            original_path: meta.original_path.clone(),
            timestamp: meta.timestamp.clone(),
            final_status: status,
            action_timestamp: human_timestamp(),
            vaulted_path: Some(meta.vaulted_path.clone()),
            event: Some(meta.event),
            signature: Some(meta.signature.clone()),
            file_name: None,
            quarantine_path: None,
            matched_rule: None,
            pre_restore_hash: None,
            restored_path: None,
            recheck_before_restore: None,
            scan_time_ms: None,
            installation_mode: None,
        }
    }

    /// Bare entry for paths that never entered the vault (in-place scans,
    /// duplicate suppressions).
    pub fn bare(original_path: String, status: FinalStatus) -> Self {
        let file_name = Path::new(&original_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string());
        Self {
            original_path,
            timestamp: human_timestamp(),
            final_status: status,
            action_timestamp: human_timestamp(),
            vaulted_path: None,
            event: None,
            signature: None,
            file_name,
            quarantine_path: None,
            matched_rule: None,
            pre_restore_hash: None,
            restored_path: None,
            recheck_before_restore: None,
            scan_time_ms: None,
            installation_mode: None,
        }
    }
}

/// Sidecar of a `.quarantined` artefact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineMeta {
    pub original_path: String,
    pub quarantined_path: String,
    pub timestamp: String,
    pub matched_rules: Vec<String>,
}

/// `YYYY-MM-DD HH:MM:SS`, local time. Used in every sidecar.
pub fn human_timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// `YYYYMMDDHHMMSS`, local time. Used in artefact file names.
pub fn file_timestamp() -> String {
    Local::now().format("%Y%m%d%H%M%S").to_string()
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let raw = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, raw)
}

pub fn read_json<T: DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}
