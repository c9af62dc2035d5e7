//! Quarantine store.
//!
//! Terminal holding area for files that matched at least one rule. Files
//! are only ever moved here, never deleted on the way in; deletion happens
//! solely through cap-driven pruning of the oldest artefacts. The sidecar
//! is written only after a successful move, so a failed quarantine leaves
//! no orphan metadata behind.
//!
//! Layout: `quarantine/<name>__<YYYYMMDDHHMMSS>__<path-hash16>.quarantined`
//! plus a `.meta` JSON sidecar.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::warn;
use vwar_core::error::VwarError;
use vwar_core::logchan::LogChannels;
use vwar_core::telemetry::Telemetry;
use vwar_core::{fingerprint, fsutil, meta, paths};

const MOVE_ATTEMPTS: u32 = 3;
const MOVE_RETRY_DELAY: Duration = Duration::from_millis(300);

pub struct QuarantineStore {
    root: PathBuf,
    max_files: usize,
    max_size_mb: u64,
    logs: Arc<LogChannels>,
    telemetry: Arc<Telemetry>,
}

impl QuarantineStore {
    pub fn new(
        root: PathBuf,
        max_files: usize,
        max_size_mb: u64,
        logs: Arc<LogChannels>,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            root,
            max_files,
            max_size_mb,
            logs,
            telemetry,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn quarantined_count(&self) -> usize {
        self.quarantined_files().len()
    }

    /// Move a matched file into quarantine and write its sidecar.
    pub fn move_to_quarantine(
        &self,
        source: &Path,
        matched_rules: &[String],
    ) -> Result<PathBuf, VwarError> {
        if !source.exists() {
            return Err(VwarError::QuarantineFailed {
                path: source.to_path_buf(),
                reason: "file no longer exists".into(),
            });
        }
        fs::create_dir_all(&self.root)?;
        self.enforce_limits();

        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let timestamp = meta::file_timestamp();
        let path_hash = fingerprint::path_hash16(source);
        let dest = self
            .root
            .join(format!("{file_name}__{timestamp}__{path_hash}.quarantined"));

        let mut moved = false;
        for attempt in 0..MOVE_ATTEMPTS {
            if source.exists() {
                match fsutil::move_file(source, &dest) {
                    Ok(()) => {
                        moved = true;
                        break;
                    }
                    Err(e) => {
                        if attempt + 1 == MOVE_ATTEMPTS {
                            return Err(VwarError::QuarantineFailed {
                                path: source.to_path_buf(),
                                reason: format!("move failed after {MOVE_ATTEMPTS} attempts: {e}"),
                            });
                        }
                        std::thread::sleep(MOVE_RETRY_DELAY);
                    }
                }
            } else {
                std::thread::sleep(MOVE_RETRY_DELAY);
            }
        }
        if !moved {
            return Err(VwarError::QuarantineFailed {
                path: source.to_path_buf(),
                reason: "file no longer exists after waiting".into(),
            });
        }

        let sidecar = meta::QuarantineMeta {
            original_path: paths::normalize_preserve_case(source),
            quarantined_path: paths::normalize_preserve_case(&dest),
            timestamp: meta::human_timestamp(),
            matched_rules: matched_rules.to_vec(),
        };
        let meta_path = sidecar_path(&dest);
        meta::write_json(&meta_path, &sidecar)?;

        Ok(dest)
    }

    fn quarantined_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.root) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.ends_with(".quarantined"))
                    .unwrap_or(false)
                {
                    files.push(path);
                }
            }
        }
        files
    }

    /// Count cap prunes to 80% of the limit, size cap to 50%. Oldest first,
    /// file and sidecar together.
    fn enforce_limits(&self) {
        let files = self.quarantined_files();

        if files.len() >= self.max_files {
            self.logs.general.warn(&format!(
                "[QUARANTINE] Limit exceeded: {} files (max: {}). Cleaning oldest files.",
                files.len(),
                self.max_files
            ));
            self.telemetry.incr("quarantine_limit_exceeded");
            self.prune_oldest((self.max_files as f64 * 0.8) as usize);
            return;
        }

        let total_bytes: u64 = files
            .iter()
            .filter_map(|p| fs::metadata(p).ok())
            .map(|m| m.len())
            .sum();
        if total_bytes >= self.max_size_mb * 1024 * 1024 {
            self.logs.general.warn(&format!(
                "[QUARANTINE] Size limit exceeded: {:.1}MB (max: {}MB). Cleaning oldest files.",
                total_bytes as f64 / (1024.0 * 1024.0),
                self.max_size_mb
            ));
            self.telemetry.incr("quarantine_size_exceeded");
            self.prune_oldest((self.max_files as f64 * 0.5) as usize);
        }
    }

    fn prune_oldest(&self, keep_newest: usize) {
        let mut with_time: Vec<(SystemTime, PathBuf)> = self
            .quarantined_files()
            .into_iter()
            .filter_map(|p| {
                let meta = fs::metadata(&p).ok()?;
                let ctime = meta.created().or_else(|_| meta.modified()).ok()?;
                Some((ctime, p))
            })
            .collect();
        if with_time.len() <= keep_newest {
            return;
        }
        with_time.sort_by_key(|(t, _)| *t);

        let num_to_delete = with_time.len() - keep_newest;
        let mut deleted = 0usize;
        for (_, path) in with_time.into_iter().take(num_to_delete) {
            let sidecar = sidecar_path(&path);
            match fs::remove_file(&path) {
                Ok(()) => {
                    let _ = fs::remove_file(&sidecar);
                    deleted += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "quarantine prune failed"),
            }
        }
        self.logs.general.info(&format!(
            "[QUARANTINE] Cleanup complete: Deleted {deleted} oldest files (kept {keep_newest} newest)"
        ));
        self.telemetry.incr("quarantine_cleanup_performed");
    }
}

fn sidecar_path(quarantined: &Path) -> PathBuf {
    let mut name = quarantined
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    name.push_str(".meta");
    quarantined.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use vwar_core::paths::Layout;

    fn store_in(dir: &Path, max_files: usize, max_size_mb: u64) -> QuarantineStore {
        let layout = Layout::new(dir);
        layout.ensure().unwrap();
        QuarantineStore::new(
            layout.quarantine_dir(),
            max_files,
            max_size_mb,
            Arc::new(LogChannels::open(&layout)),
            Arc::new(Telemetry::new()),
        )
    }

    #[test]
    fn quarantine_moves_file_and_writes_sidecar() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), 100, 100);
        let victim = dir.path().join("work").join("Evil.Exe");
        fs::create_dir_all(victim.parent().unwrap()).unwrap();
        fs::write(&victim, b"malicious bytes").unwrap();

        let dest = store
            .move_to_quarantine(&victim, &["eicar_test".to_string()])
            .unwrap();
        assert!(!victim.exists());
        assert!(dest.exists());
        let name = dest.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("Evil.Exe__"));
        assert!(name.ends_with(".quarantined"));

        let sidecar: meta::QuarantineMeta = meta::read_json(&sidecar_path(&dest)).unwrap();
        assert_eq!(sidecar.matched_rules, vec!["eicar_test"]);
        // Case preserved for restoration.
        assert!(sidecar.original_path.ends_with("work/Evil.Exe"));
    }

    #[test]
    fn missing_source_leaves_no_sidecar() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), 100, 100);
        let gone = dir.path().join("never-existed.bin");
        assert!(store.move_to_quarantine(&gone, &[]).is_err());
        assert_eq!(store.quarantined_count(), 0);
        let sidecars: Vec<_> = fs::read_dir(store.root())
            .map(|rd| rd.flatten().collect())
            .unwrap_or_default();
        assert!(sidecars.is_empty());
    }

    #[test]
    fn count_cap_prunes_to_80_percent() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), 10, 1000);
        for i in 0..10 {
            let victim = dir.path().join(format!("v{i}.bin"));
            fs::write(&victim, b"x").unwrap();
            store.move_to_quarantine(&victim, &[]).unwrap();
        }
        // The 11th quarantine sees 10 >= 10 and prunes to 8 before moving.
        let victim = dir.path().join("last.bin");
        fs::write(&victim, b"x").unwrap();
        store.move_to_quarantine(&victim, &[]).unwrap();
        assert!(store.quarantined_count() <= 9);
    }

    #[test]
    fn pruning_removes_sidecars_too() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path(), 2, 1000);
        for i in 0..3 {
            let victim = dir.path().join(format!("v{i}.bin"));
            fs::write(&victim, b"x").unwrap();
            store.move_to_quarantine(&victim, &[]).unwrap();
            std::thread::sleep(Duration::from_millis(20));
        }
        // Sidecar parity must hold after pruning.
        let mut artefacts = 0;
        let mut sidecars = 0;
        for entry in fs::read_dir(store.root()).unwrap().flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".quarantined") {
                artefacts += 1;
            } else if name.ends_with(".quarantined.meta") {
                sidecars += 1;
            }
        }
        assert_eq!(artefacts, sidecars);
    }
}
