//! Activation record store and license cache.
//!
//! The activation record lives encrypted at `data/activation.enc`, guarded
//! against concurrent writers in other processes by an advisory lockfile:
//! exclusive creation of `activation.enc.lock`, polled for at most five
//! seconds, released on drop. Commits go through a temp file and an atomic
//! rename, so a reader never observes a partial blob.

use crate::crypto;
use crate::error::VwarError;
use crate::paths::Layout;
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

pub const ACTIVATION_SECRET: &str = "VWAR@BIFIN";
pub const EXPIRY_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const LOCK_TIMEOUT_SECS: u64 = 5;

/// Server-side license record; two hardware slots per key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivationRecord {
    pub id: i64,
    #[serde(default)]
    pub username: String,
    pub password: String,
    pub valid_till: String,
    #[serde(default)]
    pub processor_id: Option<String>,
    #[serde(default)]
    pub motherboard_id: Option<String>,
    #[serde(default)]
    pub processor_id_2: Option<String>,
    #[serde(default)]
    pub motherboard_id_2: Option<String>,
    #[serde(default)]
    pub auto_renew: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl ActivationRecord {
    pub fn expiry(&self) -> Result<NaiveDateTime, VwarError> {
        NaiveDateTime::parse_from_str(&self.valid_till, EXPIRY_FORMAT)
            .map_err(|e| VwarError::ActivationCorrupt(format!("valid_till: {e}")))
    }

    /// Which slot (1 or 2) this machine occupies, if any.
    pub fn hardware_slot(&self, processor_id: &str, motherboard_id: &str) -> Option<u8> {
        let matches = |cpu: &Option<String>, mobo: &Option<String>| {
            cpu.as_deref() == Some(processor_id) && mobo.as_deref() == Some(motherboard_id)
        };
        if matches(&self.processor_id, &self.motherboard_id) {
            Some(1)
        } else if matches(&self.processor_id_2, &self.motherboard_id_2) {
            Some(2)
        } else {
            None
        }
    }

    pub fn auto_renew_enabled(&self) -> bool {
        matches!(self.auto_renew.as_deref(), Some("YES"))
    }
}

/// Cached verdict consulted when the server is unreachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicenseCache {
    pub is_valid: bool,
    pub valid_until: String,
    pub last_server_check: String,
    pub days_remaining: i64,
    pub network_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offline_since: Option<String>,
}

impl LicenseCache {
    pub fn age(&self) -> Result<chrono::Duration, VwarError> {
        let checked = DateTime::parse_from_rfc3339(&self.last_server_check)
            .map_err(|e| VwarError::ActivationCorrupt(format!("last_server_check: {e}")))?;
        Ok(Utc::now().signed_duration_since(checked.with_timezone(&Utc)))
    }
}

struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub struct ActivationStore {
    file: PathBuf,
    lock_file: PathBuf,
    cache_file: PathBuf,
    key: Zeroizing<Vec<u8>>,
}

impl ActivationStore {
    pub fn new(layout: &Layout) -> Self {
        Self {
            file: layout.activation_file(),
            lock_file: layout.activation_lock_file(),
            cache_file: layout.license_cache_file(),
            key: crypto::derive_blob_key(ACTIVATION_SECRET),
        }
    }

    pub fn exists(&self) -> bool {
        self.file.exists()
    }

    pub fn load(&self) -> Result<ActivationRecord, VwarError> {
        let blob = fs::read(&self.file)?;
        let plain = crypto::open_blob(&self.key, &blob)
            .map_err(|e| VwarError::ActivationCorrupt(e.to_string()))?;
        serde_json::from_slice(&plain)
            .map_err(|e| VwarError::ActivationCorrupt(format!("record json: {e}")))
    }

    /// Commit a record. A lock timeout aborts only this write; the file on
    /// disk remains the last known good record.
    pub fn store(&self, record: &ActivationRecord) -> Result<(), VwarError> {
        let _lock = self.acquire_lock()?;
        let plain = serde_json::to_vec(record)?;
        let blob = crypto::seal(&self.key, &plain)
            .map_err(|e| VwarError::ActivationCorrupt(e.to_string()))?;
        let tmp = self.file.with_extension("enc.tmp");
        fs::write(&tmp, blob)?;
        fs::rename(&tmp, &self.file)?;
        Ok(())
    }

    fn acquire_lock(&self) -> Result<LockGuard, VwarError> {
        let deadline = Instant::now() + Duration::from_secs(LOCK_TIMEOUT_SECS);
        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_file)
            {
                Ok(mut f) => {
                    let _ = write!(f, "{}", std::process::id());
                    return Ok(LockGuard {
                        path: self.lock_file.clone(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if Instant::now() >= deadline {
                        return Err(VwarError::ActivationLockTimeout(LOCK_TIMEOUT_SECS));
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub fn load_cache(&self) -> Result<LicenseCache, VwarError> {
        let raw = fs::read_to_string(&self.cache_file)?;
        serde_json::from_str(&raw)
            .map_err(|e| VwarError::ActivationCorrupt(format!("cache json: {e}")))
    }

    pub fn store_cache(&self, cache: &LicenseCache) -> Result<(), VwarError> {
        let tmp = self.cache_file.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(cache)?)?;
        fs::rename(&tmp, &self.cache_file)?;
        Ok(())
    }
}

/// Convenience for cache writers.
pub fn now_rfc3339() -> String {
    Local::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::tempdir;

    fn record() -> ActivationRecord {
        ActivationRecord {
            id: 7,
            username: "user".into(),
            password: "KEY-123".into(),
            valid_till: "2030-01-01 00:00:00".into(),
            processor_id: Some("cpu-a".into()),
            motherboard_id: Some("mobo-a".into()),
            processor_id_2: None,
            motherboard_id_2: None,
            auto_renew: Some("NO".into()),
            created_at: None,
        }
    }

    fn store_in(dir: &Path) -> ActivationStore {
        let layout = Layout::new(dir);
        layout.ensure().unwrap();
        ActivationStore::new(&layout)
    }

    #[test]
    fn store_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.store(&record()).unwrap();
        let back = store.load().unwrap();
        assert_eq!(back.id, 7);
        assert_eq!(back.password, "KEY-123");
        // Lockfile released after commit.
        assert!(!dir
            .path()
            .join("data")
            .join("activation.enc.lock")
            .exists());
    }

    #[test]
    fn corrupt_blob_is_reported() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.store(&record()).unwrap();
        let file = dir.path().join("data").join("activation.enc");
        fs::write(&file, b"garbage garbage garbage garbage").unwrap();
        assert!(matches!(
            store.load(),
            Err(VwarError::ActivationCorrupt(_))
        ));
    }

    #[test]
    fn held_lock_times_out_other_writer() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        // Simulate a foreign process holding the lock.
        fs::write(dir.path().join("data").join("activation.enc.lock"), b"1").unwrap();
        let err = store.store(&record()).unwrap_err();
        assert!(matches!(err, VwarError::ActivationLockTimeout(_)));
        // No partial blob was committed.
        assert!(!dir.path().join("data").join("activation.enc").exists());
    }

    #[test]
    fn hardware_slot_matching() {
        let rec = record();
        assert_eq!(rec.hardware_slot("cpu-a", "mobo-a"), Some(1));
        assert_eq!(rec.hardware_slot("cpu-b", "mobo-b"), None);
    }

    #[test]
    fn cache_round_trip_and_age() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let cache = LicenseCache {
            is_valid: true,
            valid_until: "2030-01-01 00:00:00".into(),
            last_server_check: now_rfc3339(),
            days_remaining: 42,
            network_status: "online".into(),
            offline_since: None,
        };
        store.store_cache(&cache).unwrap();
        let back = store.load_cache().unwrap();
        assert!(back.is_valid);
        assert!(back.age().unwrap().num_seconds() < 5);
    }
}
