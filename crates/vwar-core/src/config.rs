use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Whether new files are moved into the vault before scanning or scanned at
/// their original location. Installation mode always forces in-place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    InPlace,
    Vault,
}

/// Remote endpoints and their shared-secret headers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub license_fetch_url: String,
    pub license_fetch_key: String,
    pub hw_info_insert_url: String,
    pub hw_info_insert_key: String,
    pub auto_renew_url: String,
    pub rule_fetch_url: String,
    pub rule_fetch_key: String,
    pub rule_insert_url: String,
    pub rule_insert_key: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            license_fetch_url: "https://api.bitss.one/license-fetch".into(),
            license_fetch_key: String::new(),
            hw_info_insert_url: "https://api.bitss.one/hw-info-insert".into(),
            hw_info_insert_key: String::new(),
            auto_renew_url: "https://api.bitss.one/autoReNew".into(),
            rule_fetch_url: "https://api.bitss.one/fetch-rule".into(),
            rule_fetch_key: String::new(),
            rule_insert_url: "https://api.bitss.one/insert-rule".into(),
            rule_insert_key: String::new(),
        }
    }
}

/// Engine limits and toggles. Defaults are the shipped values; a
/// `data/config.json` may override any field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub capture_mode: CaptureMode,
    /// Post-restore hash-guard rechecks. Off: the 180 s restore-exclusion
    /// window is the active mitigation against restore loops.
    pub hash_guard_enabled: bool,

    pub max_captures_per_second: u32,
    pub max_burst_captures: usize,
    pub burst_window_secs: u64,
    pub signature_ttl_secs: u64,
    pub restore_exclusion_secs: u64,
    pub max_restores_per_minute: usize,
    pub max_queue_size: usize,
    pub max_quarantine_files: usize,
    pub max_quarantine_size_mb: u64,
    pub post_restore_recheck_delay_secs: u64,
    pub rule_match_timeout_secs: u64,

    pub license_warning_days: i64,
    pub license_offline_grace_hours: i64,

    /// External change-event emitter command. When unset the built-in
    /// watcher produces the same records in-process.
    pub monitor_command: Option<String>,
    /// Directories handed to the change-event source. Empty means the
    /// per-user defaults (Downloads, Desktop, Documents).
    pub monitored_paths: Vec<String>,

    pub endpoints: Endpoints,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capture_mode: CaptureMode::InPlace,
            hash_guard_enabled: false,
            max_captures_per_second: 20,
            max_burst_captures: 100,
            burst_window_secs: 10,
            signature_ttl_secs: 15,
            restore_exclusion_secs: 180,
            max_restores_per_minute: 30,
            max_queue_size: 500,
            max_quarantine_files: 1000,
            max_quarantine_size_mb: 500,
            post_restore_recheck_delay_secs: 4,
            rule_match_timeout_secs: 60,
            license_warning_days: 7,
            license_offline_grace_hours: 24,
            monitor_command: None,
            monitored_paths: vec![],
            endpoints: Endpoints::default(),
        }
    }
}

impl EngineConfig {
    /// Load the override file if present, defaults otherwise. A malformed
    /// override is ignored with a warning rather than aborting startup.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(cfg) => cfg,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring malformed config override");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        }
    }
}
