//! Rotating application log channels.
//!
//! Three channels: general (`vwar.log`), vault (`scanvault.log`) and
//! installation (`installation.log`), each rotating at 10 MiB with five
//! numbered backups. Logging failures are swallowed: the pipeline must
//! never stall because a log line could not be written.

use crate::paths::Layout;
use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_BACKUPS: usize = 5;

pub struct RotatingLog {
    path: PathBuf,
    max_bytes: u64,
    max_backups: usize,
    lock: Mutex<()>,
}

impl RotatingLog {
    pub fn new<P: AsRef<Path>>(path: P, max_bytes: u64, max_backups: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_bytes,
            max_backups,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn log(&self, level: &str, message: &str) {
        let _g = self.lock.lock();
        let _ = self.rotate_if_needed();
        let line = format!(
            "[{}] [{}] {}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            level,
            message
        );
        let _ = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()));
    }

    pub fn debug(&self, message: &str) {
        self.log("DEBUG", message);
    }

    pub fn info(&self, message: &str) {
        self.log("INFO", message);
    }

    pub fn warn(&self, message: &str) {
        self.log("WARNING", message);
    }

    pub fn error(&self, message: &str) {
        self.log("ERROR", message);
    }

    fn rotate_if_needed(&self) -> std::io::Result<()> {
        match fs::metadata(&self.path) {
            Ok(meta) if meta.len() >= self.max_bytes => {}
            _ => return Ok(()),
        }
        for i in (1..=self.max_backups).rev() {
            let rotated = self.path_with_suffix(i);
            if rotated.exists() {
                if i == self.max_backups {
                    fs::remove_file(&rotated)?;
                } else {
                    fs::rename(&rotated, self.path_with_suffix(i + 1))?;
                }
            }
        }
        fs::rename(&self.path, self.path_with_suffix(1))?;
        Ok(())
    }

    fn path_with_suffix(&self, index: usize) -> PathBuf {
        let mut p = self.path.clone();
        let filename = p
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        p.set_file_name(format!("{filename}.{index}"));
        p
    }
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

/// The three channels plus the structured vault-channel vocabulary.
pub struct LogChannels {
    pub general: RotatingLog,
    pub vault: RotatingLog,
    pub install: RotatingLog,
}

impl LogChannels {
    pub fn open(layout: &Layout) -> Self {
        Self {
            general: RotatingLog::new(layout.general_log(), DEFAULT_MAX_BYTES, DEFAULT_MAX_BACKUPS),
            vault: RotatingLog::new(layout.vault_log(), DEFAULT_MAX_BYTES, DEFAULT_MAX_BACKUPS),
            install: RotatingLog::new(
                layout.installation_log(),
                DEFAULT_MAX_BYTES,
                DEFAULT_MAX_BACKUPS,
            ),
        }
    }

    pub fn capture(&self, original: &Path, vaulted: &Path, event: &str) {
        self.vault.info(&format!(
            "CAPTURE | {} | {} -> {}",
            event.to_uppercase(),
            original.display(),
            basename(vaulted)
        ));
    }

    pub fn capture_failed(&self, original: &Path, event: &str, error: &str) {
        self.vault.error(&format!(
            "CAPTURE_FAILED | {} | {} | Error: {error}",
            event.to_uppercase(),
            original.display()
        ));
    }

    pub fn scan(&self, path: &Path, status: &str, rule: Option<&str>, scan_time_ms: u128) {
        let name = basename(path);
        match (status, rule) {
            ("CLEAN", _) => self
                .vault
                .info(&format!("SCAN_CLEAN | {name} | {scan_time_ms}ms")),
            ("THREAT", Some(rule)) => self.vault.warn(&format!(
                "SCAN_THREAT | {name} | Rule: {rule} | {scan_time_ms}ms"
            )),
            ("ERROR", _) => self
                .vault
                .error(&format!("SCAN_ERROR | {name} | {scan_time_ms}ms")),
            (other, _) => self
                .vault
                .info(&format!("SCAN_{other} | {name} | {scan_time_ms}ms")),
        }
    }

    pub fn restore(&self, vaulted: &Path, restored: &Path) {
        self.vault.info(&format!(
            "RESTORE | {} -> {}",
            basename(vaulted),
            restored.display()
        ));
    }

    pub fn restore_failed(&self, vaulted: &Path, error: &str) {
        self.vault.error(&format!(
            "RESTORE_FAILED | {} | Error: {error}",
            basename(vaulted)
        ));
    }

    pub fn quarantined(&self, source: &Path, quarantined: &Path, rule: &str) {
        self.vault.warn(&format!(
            "QUARANTINED | {} -> {} | Rule: {rule}",
            basename(source),
            basename(quarantined)
        ));
    }

    pub fn rate_limit(&self, kind: &str, current: usize, max: usize) {
        self.vault.warn(&format!(
            "RATE_LIMIT | {kind} | Current: {current}, Max: {max}"
        ));
    }

    pub fn duplicate(&self, path: &Path, signature: &str) {
        let sig = &signature[..signature.len().min(16)];
        self.vault
            .debug(&format!("DUPLICATE | {} | Signature: {sig}...", path.display()));
    }
}
