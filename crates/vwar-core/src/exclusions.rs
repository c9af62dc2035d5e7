//! Path exclusion resolver.
//!
//! Classifies every observed path before it can reach the queue or the
//! vault. Evaluation order, first match wins: INTERNAL, RECYCLE_BIN,
//! TEMP_ROOT, TEMP_FILE. Paths under the vault root are allowlisted out of
//! INTERNAL so vaulted artefacts can be re-scanned.

use crate::paths::{self, Layout};
use std::fs;
use std::path::{Path, PathBuf};

const TEMP_EXTENSIONS: &[&str] = &[
    "tmp", "temp", "part", "partial", "crdownload", "download", "swp", "swo", "bak", "old",
    "log", "lock", "cache", "dmp", "tmp~", "~tmp",
];

const TEMP_FILE_NAMES: &[&str] = &["thumbs.db", ".ds_store"];

const TEMP_PREFIXES: &[&str] = &["~$", "._"];

/// Why a path was excluded. Absence of a reason means NONE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    Internal,
    RecycleBin,
    TempRoot,
    TempFile,
}

impl Exclusion {
    /// Status label used in logs and history entries.
    pub fn status(&self) -> &'static str {
        match self {
            Exclusion::Internal => "SKIPPED_INTERNAL",
            Exclusion::RecycleBin => "SKIPPED_RECYCLE_BIN",
            Exclusion::TempRoot => "SKIPPED_TEMP_ROOT",
            Exclusion::TempFile => "SKIPPED_TEMP_FILE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExclusionResolver {
    internal_roots: Vec<String>,
    vault_allow: Vec<String>,
    temp_roots: Vec<String>,
}

impl ExclusionResolver {
    pub fn new(layout: &Layout) -> Self {
        let mut internal_roots = vec![
            paths::normalize_for_compare(layout.root()),
            paths::normalize_for_compare(&layout.rules_dir()),
            paths::normalize_for_compare(&layout.quarantine_dir()),
            paths::normalize_for_compare(&layout.vault_dir()),
            paths::normalize_for_compare(&layout.data_dir()),
        ];
        // The running executable's directory is internal regardless of
        // where the engine root lives.
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                internal_roots.push(paths::normalize_for_compare(dir));
            }
        }

        Self {
            internal_roots,
            vault_allow: vec![paths::normalize_for_compare(&layout.vault_dir())],
            temp_roots: Self::collect_temp_roots(),
        }
    }

    fn collect_temp_roots() -> Vec<String> {
        let mut roots = vec![paths::normalize_for_compare(&std::env::temp_dir())];
        for var in ["TEMP", "TMP"] {
            if let Ok(val) = std::env::var(var) {
                if !val.is_empty() {
                    roots.push(paths::normalize_for_compare(&PathBuf::from(val)));
                }
            }
        }
        #[cfg(unix)]
        {
            roots.push("/tmp".to_string());
            roots.push("/var/tmp".to_string());
        }
        #[cfg(windows)]
        {
            let system_root = std::env::var("SystemRoot").unwrap_or_else(|_| r"C:\Windows".into());
            roots.push(paths::normalize_for_compare(
                &PathBuf::from(system_root).join("Temp"),
            ));
            for letter in b'A'..=b'Z' {
                let drive = format!("{}:\\", letter as char);
                if Path::new(&drive).exists() {
                    roots.push(paths::normalize_for_compare(
                        &PathBuf::from(&drive).join("System Volume Information"),
                    ));
                }
            }
        }
        roots.sort();
        roots.dedup();
        roots
    }

    /// Classify a path. `None` means the path is eligible for processing.
    pub fn classify(&self, path: &Path) -> Option<Exclusion> {
        self.classify_inner(path, false)
    }

    /// Classification for re-scans of vaulted artefacts: INTERNAL is
    /// ignored, temp-style reasons still apply.
    pub fn classify_bypass_internal(&self, path: &Path) -> Option<Exclusion> {
        self.classify_inner(path, true)
    }

    fn classify_inner(&self, path: &Path, bypass_internal: bool) -> Option<Exclusion> {
        let norm = paths::normalize_for_compare(path);

        if !bypass_internal
            && !is_under_any(&norm, &self.vault_allow)
            && is_under_any(&norm, &self.internal_roots)
        {
            return Some(Exclusion::Internal);
        }

        if norm
            .split('/')
            .any(|segment| segment.eq_ignore_ascii_case("$recycle.bin"))
        {
            return Some(Exclusion::RecycleBin);
        }

        if is_under_any(&norm, &self.temp_roots) {
            return Some(Exclusion::TempRoot);
        }

        if is_temp_like_file(path) {
            return Some(Exclusion::TempFile);
        }

        None
    }
}

fn is_under_any(norm: &str, roots: &[String]) -> bool {
    roots
        .iter()
        .any(|root| norm == root.as_str() || norm.starts_with(&format!("{root}/")))
}

fn is_temp_like_file(path: &Path) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(n) => n.to_lowercase(),
        None => return false,
    };
    if TEMP_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return true;
    }
    if TEMP_FILE_NAMES.contains(&name.as_str()) {
        return true;
    }
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        if TEMP_EXTENSIONS.contains(&ext.to_lowercase().as_str()) {
            return true;
        }
    }
    // Zero-byte files are usually transient placeholders; a path whose
    // metadata cannot be read is treated the same way.
    match fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.len() == 0,
        Err(_) => true,
    }
}
