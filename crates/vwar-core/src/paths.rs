//! On-disk layout of the engine root and the two path normal forms.
//!
//! Every stored path has a case-preserved form (used for restoration and in
//! sidecar metadata) and a lowercase forward-slash compare form (used for
//! dedup, queue identity and prefix checks). The compare form is never
//! written into metadata that is later used to restore a file.

use directories::ProjectDirs;
use std::path::{Path, PathBuf};

pub const APP_QUALIFIER: &str = "one";
pub const APP_ORG: &str = "bitss";
pub const APP_NAME: &str = "vwar";

/// Absolute path with forward slashes, case preserved.
pub fn normalize_preserve_case(path: &Path) -> String {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    abs.to_string_lossy().replace('\\', "/")
}

/// Lowercased compare form of [`normalize_preserve_case`].
pub fn normalize_for_compare(path: &Path) -> String {
    normalize_preserve_case(path).to_lowercase()
}

/// The engine root and everything it contains (see the layout in
/// `assets/rules`, `quarantine/`, `scanvault/`, `data/`).
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Resolve the engine root: `VWAR_ROOT` override, then the executable's
    /// directory, then the per-user data directory.
    pub fn discover() -> anyhow::Result<Self> {
        if let Ok(root) = std::env::var("VWAR_ROOT") {
            if !root.is_empty() {
                return Ok(Self::new(root));
            }
        }
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                return Ok(Self::new(dir));
            }
        }
        let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
            .ok_or_else(|| anyhow::anyhow!("cannot determine engine root directory"))?;
        Ok(Self::new(dirs.data_dir()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn rules_dir(&self) -> PathBuf {
        self.root.join("assets").join("rules")
    }

    pub fn quarantine_dir(&self) -> PathBuf {
        self.root.join("quarantine")
    }

    pub fn vault_dir(&self) -> PathBuf {
        self.root.join("scanvault")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.vault_dir().join("history")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn activation_file(&self) -> PathBuf {
        self.data_dir().join("activation.enc")
    }

    pub fn activation_lock_file(&self) -> PathBuf {
        self.data_dir().join("activation.enc.lock")
    }

    pub fn license_cache_file(&self) -> PathBuf {
        self.data_dir().join("license_cache.json")
    }

    pub fn queue_file(&self) -> PathBuf {
        self.data_dir().join("scanvault_queue.json")
    }

    pub fn config_file(&self) -> PathBuf {
        self.data_dir().join("config.json")
    }

    pub fn general_log(&self) -> PathBuf {
        self.data_dir().join("vwar.log")
    }

    pub fn vault_log(&self) -> PathBuf {
        self.data_dir().join("scanvault.log")
    }

    pub fn installation_log(&self) -> PathBuf {
        self.data_dir().join("installation.log")
    }

    /// Create every directory the engine writes into.
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [
            self.rules_dir(),
            self.quarantine_dir(),
            self.vault_dir(),
            self.history_dir(),
            self.data_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compare_form_is_lowercase_forward_slash() {
        let n = normalize_for_compare(Path::new("/Tmp/Some/File.TXT"));
        assert_eq!(n, "/tmp/some/file.txt");
        assert!(!n.contains('\\'));
    }

    #[test]
    fn preserve_form_keeps_case() {
        let n = normalize_preserve_case(Path::new("/Tmp/Report.PDF"));
        assert_eq!(n, "/Tmp/Report.PDF");
    }

    #[test]
    fn layout_paths_hang_off_root() {
        let layout = Layout::new("/srv/vwar");
        assert_eq!(layout.queue_file(), Path::new("/srv/vwar/data/scanvault_queue.json"));
        assert_eq!(layout.history_dir(), Path::new("/srv/vwar/scanvault/history"));
        assert_eq!(layout.rules_dir(), Path::new("/srv/vwar/assets/rules"));
    }
}
