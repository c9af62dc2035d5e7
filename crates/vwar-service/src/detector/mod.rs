//! Automatic installation detection.
//!
//! A 5 s sampling loop classifies running processes as installers and
//! tracks the folders they install into. While any installer is alive,
//! files under a monitored folder are scanned in place instead of being
//! vaulted, so installations are never broken by a mid-install move.
//!
//! Installation mode can also be activated manually by registering a
//! trusted folder, independent of process detection.

use crate::engine::UiEvent;
use crate::notifications::Notifier;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::sync::{broadcast, watch};
use tracing::debug;
use vwar_core::logchan::LogChannels;
use vwar_core::paths;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(5);

/// Name fragments that mark an executable as installer-like when paired
/// with an installer extension.
const INSTALLER_KEYWORDS: &[&str] = &["install", "setup", "update", "uninstall", "upgrade", "patch"];

const INSTALLER_EXTENSIONS: &[&str] = &[
    "exe", "msi", "bat", "cmd", "ps1", "vbs", "wsf", "reg", "scr", "jar", "app", "deb", "rpm",
    "pkg", "dmg", "run", "sh",
];

/// Curated installer process names: platform package managers, launcher
/// updaters and OS servicing executables.
const INSTALLER_NAMES: &[&str] = &[
    "msiexec.exe",
    "setup.exe",
    "install.exe",
    "installer.exe",
    "uninstaller.exe",
    "update.exe",
    "updater.exe",
    "winget.exe",
    "choco.exe",
    "scoop.exe",
    "steam.exe",
    "epicgameslauncher.exe",
    "origin.exe",
    "battle.net.exe",
    "wusa.exe",
    "dism.exe",
    "pkgmgr.exe",
];

#[derive(Debug, Clone)]
pub struct InstallerInfo {
    pub pid: u32,
    pub name: String,
    pub exe_path: Option<String>,
    pub started: Instant,
}

#[derive(Debug, Clone)]
pub struct InstallerSummary {
    pub pid: u32,
    pub name: String,
    pub exe_path: Option<String>,
    pub duration_secs: u64,
}

#[derive(Default)]
struct DetectorState {
    active: HashMap<u32, InstallerInfo>,
    monitored_folders: HashSet<String>,
    notified: HashSet<u32>,
}

pub struct InstallationDetector {
    state: Mutex<DetectorState>,
    logs: Arc<LogChannels>,
    notifier: Notifier,
    ui_tx: broadcast::Sender<UiEvent>,
}

impl InstallationDetector {
    pub fn new(
        logs: Arc<LogChannels>,
        notifier: Notifier,
        ui_tx: broadcast::Sender<UiEvent>,
    ) -> Self {
        Self {
            state: Mutex::new(DetectorState::default()),
            logs,
            notifier,
            ui_tx,
        }
    }

    /// Background sampling thread; exits when the shutdown flag flips.
    pub fn spawn_sampler(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> std::thread::JoinHandle<()> {
        let detector = self;
        std::thread::Builder::new()
            .name("installation-detector".into())
            .spawn(move || {
                let mut sys = System::new();
                detector.logs.install.info("Installation detector monitoring started");
                while !*shutdown.borrow() {
                    detector.sample(&mut sys);
                    // Sleep in slices so shutdown is observed promptly.
                    let waited = Instant::now();
                    while waited.elapsed() < SAMPLE_INTERVAL && !*shutdown.borrow() {
                        std::thread::sleep(Duration::from_millis(500));
                    }
                }
                detector.logs.install.info("Installation detector monitoring stopped");
            })
            .expect("spawn installation detector thread")
    }

    fn sample(&self, sys: &mut System) {
        sys.refresh_processes();
        let mut current_pids: HashSet<u32> = HashSet::new();

        for (pid, process) in sys.processes() {
            let name = process.name().to_lowercase();
            let exe = process.exe();
            if !Self::is_installer(&name, exe) {
                continue;
            }
            let pid = pid.as_u32();
            current_pids.insert(pid);
            self.on_installer_seen(pid, &name, exe);
        }

        // Installers that disappeared since the last sample are done.
        let completed: Vec<InstallerInfo> = {
            let mut state = self.state.lock();
            let gone: Vec<u32> = state
                .active
                .keys()
                .copied()
                .filter(|pid| !current_pids.contains(pid))
                .collect();
            gone.iter()
                .filter_map(|pid| {
                    state.notified.remove(pid);
                    state.active.remove(pid)
                })
                .collect()
        };
        for info in completed {
            let duration = info.started.elapsed().as_secs();
            self.logs.install.info(&format!(
                "INSTALLER_COMPLETED | {} | Duration: {duration}s",
                info.name
            ));
        }
    }

    fn is_installer(name: &str, exe: Option<&Path>) -> bool {
        if let Some(exe) = exe {
            let ext_matches = exe
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| INSTALLER_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false);
            if ext_matches {
                let base = exe
                    .file_name()
                    .map(|n| n.to_string_lossy().to_lowercase())
                    .unwrap_or_default();
                if INSTALLER_KEYWORDS.iter().any(|kw| base.contains(kw)) {
                    return true;
                }
            }
        }
        INSTALLER_NAMES.contains(&name)
    }

    fn on_installer_seen(&self, pid: u32, name: &str, exe: Option<&Path>) {
        let mut state = self.state.lock();
        if state.active.contains_key(&pid) {
            return;
        }
        state.active.insert(
            pid,
            InstallerInfo {
                pid,
                name: name.to_string(),
                exe_path: exe.map(|p| p.to_string_lossy().to_string()),
                started: Instant::now(),
            },
        );
        self.logs.install.info(&format!(
            "INSTALLER_DETECTED | {name} | PID: {pid} | Path: {}",
            exe.map(|p| p.display().to_string())
                .unwrap_or_else(|| "Unknown".into())
        ));

        // Monitor the installer's folder and its parent for broader coverage
        // of where the install actually writes.
        if let Some(exe) = exe {
            let mut folders: Vec<PathBuf> = Vec::new();
            if let Some(dir) = exe.parent() {
                folders.push(dir.to_path_buf());
                if let Some(parent) = dir.parent() {
                    folders.push(parent.to_path_buf());
                }
            }
            for folder in folders {
                let key = paths::normalize_for_compare(&folder);
                if state.monitored_folders.insert(key) {
                    self.logs
                        .install
                        .info(&format!("MONITORING_FOLDER | {}", folder.display()));
                }
            }
        }

        let first_notification = state.notified.insert(pid);
        drop(state);

        if first_notification {
            self.notifier.notify(
                "Installation Detected",
                &format!(
                    "Installer: {name}\nFiles will be scanned in-place during installation.\nOnly malware will be quarantined."
                ),
            );
            let _ = self.ui_tx.send(UiEvent::InstallationDetected {
                name: name.to_string(),
                pid,
            });
        }
    }

    /// Manual installation mode: trust a folder without any process match.
    pub fn register_manual_folder(&self, folder: &Path) {
        let key = paths::normalize_for_compare(folder);
        let mut state = self.state.lock();
        if state.monitored_folders.insert(key) {
            self.logs
                .install
                .info(&format!("MONITORING_FOLDER | {} | manual", folder.display()));
        }
        // A synthetic pid keeps the active set non-empty for manual mode.
        state.active.entry(0).or_insert_with(|| InstallerInfo {
            pid: 0,
            name: "manual".into(),
            exe_path: None,
            started: Instant::now(),
        });
    }

    pub fn is_installation_active(&self) -> bool {
        !self.state.lock().active.is_empty()
    }

    pub fn is_file_being_installed(&self, path: &Path) -> bool {
        if !self.is_installation_active() {
            return false;
        }
        let norm = paths::normalize_for_compare(path);
        let state = self.state.lock();
        for folder in &state.monitored_folders {
            if norm == *folder || norm.starts_with(&format!("{folder}/")) {
                self.logs.install.info(&format!(
                    "FILE_PART_OF_INSTALLATION | {} | Installer folder: {folder}",
                    path.display()
                ));
                return true;
            }
        }
        false
    }

    pub fn get_active_installers(&self) -> Vec<InstallerSummary> {
        self.state
            .lock()
            .active
            .values()
            .map(|info| InstallerSummary {
                pid: info.pid,
                name: info.name.clone(),
                exe_path: info.exe_path.clone(),
                duration_secs: info.started.elapsed().as_secs(),
            })
            .collect()
    }

    pub fn log_installation_scan(
        &self,
        path: &Path,
        status: &str,
        rule: Option<&str>,
        scan_time_ms: u128,
    ) {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        match (status, rule) {
            ("CLEAN", _) => self
                .logs
                .install
                .info(&format!("INSTALL_SCAN_CLEAN | {name} | {scan_time_ms}ms")),
            ("THREAT", Some(rule)) => self.logs.install.warn(&format!(
                "INSTALL_SCAN_THREAT | {name} | Rule: {rule} | {scan_time_ms}ms"
            )),
            (other, _) => self
                .logs
                .install
                .info(&format!("INSTALL_SCAN_{other} | {name} | {scan_time_ms}ms")),
        }
        debug!(path = %path.display(), status, "installation-mode scan logged");
    }

    pub fn log_installation_quarantine(&self, path: &Path, quarantine_path: &Path, rule: &str) {
        self.logs.install.warn(&format!(
            "INSTALL_QUARANTINE | {} -> {} | Rule: {rule}",
            path.display(),
            quarantine_path.display()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use vwar_core::paths::Layout;

    fn detector_in(dir: &Path) -> InstallationDetector {
        let layout = Layout::new(dir);
        layout.ensure().unwrap();
        let (ui_tx, _) = broadcast::channel(16);
        InstallationDetector::new(
            Arc::new(LogChannels::open(&layout)),
            Notifier::disabled(),
            ui_tx,
        )
    }

    #[test]
    fn keyword_plus_extension_classifies() {
        assert!(InstallationDetector::is_installer(
            "brave_setup.exe",
            Some(Path::new("/tmp/dl/brave_setup.exe"))
        ));
        assert!(InstallationDetector::is_installer(
            "update-helper.sh",
            Some(Path::new("/opt/app/update-helper.sh"))
        ));
        // Installer extension without installer keyword is not enough.
        assert!(!InstallationDetector::is_installer(
            "game.exe",
            Some(Path::new("/games/game.exe"))
        ));
    }

    #[test]
    fn curated_names_classify_without_keywords() {
        assert!(InstallationDetector::is_installer("msiexec.exe", None));
        assert!(InstallationDetector::is_installer("winget.exe", None));
        assert!(!InstallationDetector::is_installer("notepad.exe", None));
    }

    #[test]
    fn manual_folder_enables_installation_mode() {
        let dir = tempdir().unwrap();
        let d = detector_in(dir.path());
        assert!(!d.is_installation_active());

        let folder = Path::new("/opt/VendorApp/Staging");
        d.register_manual_folder(folder);
        assert!(d.is_installation_active());
        assert!(d.is_file_being_installed(Path::new("/opt/VendorApp/Staging/lib.dll")));
        assert!(d.is_file_being_installed(Path::new("/OPT/vendorapp/staging/nested/x.bin")));
        assert!(!d.is_file_being_installed(Path::new("/opt/Other/x.bin")));
    }

    #[test]
    fn monitored_folder_prefix_is_segment_aware() {
        let dir = tempdir().unwrap();
        let d = detector_in(dir.path());
        d.register_manual_folder(Path::new("/opt/app"));
        // "/opt/application" must not match "/opt/app".
        assert!(!d.is_file_being_installed(Path::new("/opt/application/file.bin")));
    }
}
