//! Vault processor: the single consumer of the processing queue.
//!
//! One item is in flight at any instant. Each iteration takes the next
//! pending item, routes it (recovery artefact, missing file, recently
//! restored, in-place scan or capture-then-scan) and completes it before
//! touching the next. Terminal routing always produces exactly one history
//! entry; errors leave the file where it is for manual review.
//!
//! The restore path re-scans immediately before moving a vaulted file back
//! and records the destination in the recently-restored map for 180 s so
//! the monitor echo of the restore cannot re-capture it. Post-restore
//! hash-guard rechecks exist behind `hash_guard_enabled` and are off by
//! default; they historically produced re-vault loops.

use crate::engine::{Engine, UiEvent};
use crate::vault::capture::{CaptureEngine, CaptureOutcome};
use crate::vault::scanner::{self, ScanStatus};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::warn;
use vwar_core::config::CaptureMode;
use vwar_core::meta::{self, FinalStatus, HistoryMeta, VaultEvent, VaultMeta};
use vwar_core::{fsutil, paths};

const IDLE_POLL: Duration = Duration::from_millis(500);
const ITEM_PACING: Duration = Duration::from_millis(100);
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(300);
const RESTORE_RATE_WINDOW: Duration = Duration::from_secs(60);
const RESTORE_RETRY_DELAY: Duration = Duration::from_secs(2);
const HANDLE_RELEASE_DELAY: Duration = Duration::from_millis(200);
const HASH_GUARD_RULE: &str = "HASH_GUARD_CHANGE";

pub struct VaultProcessor {
    engine: Arc<Engine>,
    capture: Arc<CaptureEngine>,
    recently_restored: Mutex<HashMap<String, Instant>>,
    restoration_timestamps: Mutex<Vec<Instant>>,
    notified: Mutex<HashSet<String>>,
}

impl VaultProcessor {
    pub fn new(engine: Arc<Engine>, capture: Arc<CaptureEngine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            capture,
            recently_restored: Mutex::new(HashMap::new()),
            restoration_timestamps: Mutex::new(Vec::new()),
            notified: Mutex::new(HashSet::new()),
        })
    }

    /// Enqueue every vault artefact with a valid sidecar so processing
    /// resumes after a crash or restart.
    pub fn auto_recover(&self) {
        let vault_dir = self.engine.layout.vault_dir();
        let entries = match std::fs::read_dir(&vault_dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        let mut recovered = 0usize;
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".vaulted") {
                continue;
            }
            let meta_path = sidecar_of(&path);
            if meta::read_json::<VaultMeta>(&meta_path).is_err() {
                warn!(path = %path.display(), "vault artefact without valid sidecar, leaving untouched");
                continue;
            }
            if self.engine.queue.add(&path, VaultEvent::Recovery) {
                recovered += 1;
            }
        }
        if recovered > 0 {
            self.engine.logs.general.info(&format!(
                "[SCANVAULT] Auto-recovery: Added {recovered} files to queue"
            ));
            self.engine.emit_queue_size();
        }
    }

    /// Start the consumer thread.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name("vault-processor".into())
            .spawn(move || self.run(shutdown))
            .expect("spawn vault processor thread")
    }

    fn run(&self, shutdown: watch::Receiver<bool>) {
        self.engine
            .logs
            .general
            .info("[SCANVAULT] Queue processor started (sequential processing)");
        let mut last_housekeeping = Instant::now();

        while !*shutdown.borrow() {
            if last_housekeeping.elapsed() > HOUSEKEEPING_INTERVAL {
                self.housekeeping();
                last_housekeeping = Instant::now();
            }

            let item = match self.engine.queue.get_next_pending() {
                Some(item) => item,
                None => {
                    std::thread::sleep(IDLE_POLL);
                    continue;
                }
            };

            let original = PathBuf::from(&item.original_path);
            self.engine.queue.mark_processing(&original);
            self.process_item(&original, item.event_type);
            self.engine.queue.mark_completed(&original);
            self.engine.emit_queue_size();

            // Strict sequential pacing.
            std::thread::sleep(ITEM_PACING);
        }
        self.engine
            .logs
            .general
            .info("[SCANVAULT] Queue processor stopped");
    }

    fn process_item(&self, original: &Path, event: VaultEvent) {
        // Recovery artefacts route directly.
        if event == VaultEvent::Recovery
            && original
                .to_string_lossy()
                .ends_with(".vaulted")
        {
            let meta_path = sidecar_of(original);
            if !original.exists() || !meta_path.exists() {
                self.engine.logs.general.warn(&format!(
                    "[SCANVAULT] Vaulted file missing: {}",
                    original.display()
                ));
                return;
            }
            self.scan_and_route_vaulted(original, &meta_path);
            return;
        }

        if !original.exists() {
            self.engine.logs.general.info(&format!(
                "[SCANVAULT] File no longer exists (deleted before processing): {}",
                original.display()
            ));
            return;
        }

        if self.is_recently_restored(original) {
            self.engine.logs.general.info(&format!(
                "[SCANVAULT] Skipping recently restored file: {}",
                basename(original)
            ));
            return;
        }

        let installation = self.engine.detector.is_file_being_installed(original);
        if installation {
            let names: Vec<String> = self
                .engine
                .detector
                .get_active_installers()
                .into_iter()
                .map(|i| i.name)
                .collect();
            self.engine.logs.general.info(&format!(
                "[SCANVAULT] Installation detected: {} - Scanning in-place",
                names.join(", ")
            ));
        }

        // Capture-then-scan is configuration-gated; installation mode
        // always overrides it back to in-place.
        if self.engine.config.capture_mode == CaptureMode::Vault && !installation {
            match self.capture.capture(original, event) {
                CaptureOutcome::Captured {
                    vaulted_path,
                    meta_path,
                } => {
                    self.scan_and_route_vaulted(&vaulted_path, &meta_path);
                    return;
                }
                CaptureOutcome::Duplicate { .. } => return,
                CaptureOutcome::InstallationMode => {
                    // Race: the installer appeared mid-capture. Fall through
                    // to the in-place scan.
                }
                CaptureOutcome::Failed { .. } => {
                    // Already logged by the capture engine; degrade to
                    // in-place scanning so the file is never lost.
                }
            }
        }

        self.scan_in_place(original, installation);
    }

    fn scan_in_place(&self, original: &Path, installation: bool) {
        let outcome = scanner::scan_file_at(&self.engine, original);
        let ms = outcome.scan_time_ms;

        match outcome.status {
            ScanStatus::Match => {
                let rule = outcome.rule.clone().unwrap_or_default();
                match self
                    .engine
                    .quarantine
                    .move_to_quarantine(original, &[rule.clone()])
                {
                    Ok(quarantine_path) => {
                        self.engine.logs.scan(original, "THREAT", Some(&rule), ms);
                        self.engine.logs.quarantined(original, &quarantine_path, &rule);
                        if installation {
                            self.engine
                                .detector
                                .log_installation_scan(original, "THREAT", Some(&rule), ms);
                            self.engine.detector.log_installation_quarantine(
                                original,
                                &quarantine_path,
                                &rule,
                            );
                        }
                        let mut hist = HistoryMeta::bare(
                            paths::normalize_preserve_case(original),
                            FinalStatus::Quarantined,
                        );
                        hist.quarantine_path =
                            Some(paths::normalize_preserve_case(&quarantine_path));
                        hist.matched_rule = Some(rule.clone());
                        hist.scan_time_ms = Some(ms as u64);
                        hist.installation_mode = Some(installation);
                        self.write_history(&hist);

                        self.notify_once(
                            original,
                            "ScanVault: Threat Quarantined",
                            &format!("Rule: {rule}\nFile: {}", basename(original)),
                        );
                        self.engine.emit(UiEvent::FileQuarantined {
                            path: paths::normalize_preserve_case(original),
                            rules: vec![rule],
                        });
                    }
                    Err(e) => {
                        self.engine.telemetry.incr("scan_quarantine_failed");
                        self.engine.logs.general.error(&format!(
                            "[SCANVAULT] Quarantine FAILED for {}: {e}",
                            basename(original)
                        ));
                        // File stays in place for manual review.
                    }
                }
            }
            ScanStatus::Clean => {
                self.engine.logs.scan(original, "CLEAN", None, ms);
                if installation {
                    self.engine
                        .detector
                        .log_installation_scan(original, "CLEAN", None, ms);
                }
                let mut hist = HistoryMeta::bare(
                    paths::normalize_preserve_case(original),
                    FinalStatus::Clean,
                );
                hist.scan_time_ms = Some(ms as u64);
                hist.installation_mode = Some(installation);
                self.write_history(&hist);

                self.notify_once(
                    original,
                    "File Scanned: Safe",
                    &format!(
                        "File: {}\nStatus: Clean - No threats detected{}",
                        basename(original),
                        if installation { " (during installation)" } else { "" }
                    ),
                );
                self.engine.emit(UiEvent::FileClean {
                    path: paths::normalize_preserve_case(original),
                });
            }
            ScanStatus::NoRules => {
                // Degraded store: the queue keeps draining, nothing is
                // destroyed, the file stays in place.
                self.engine.logs.scan(original, outcome.status.label(), None, ms);
            }
            ScanStatus::EngineError | ScanStatus::Error => {
                self.engine.logs.scan(original, outcome.status.label(), None, ms);
                self.engine.logs.general.warn(&format!(
                    "[SCANVAULT] Scan error ({}), leaving in place: {}",
                    outcome.status.label(),
                    original.display()
                ));
            }
            _ => {
                // Skipped statuses: log only, no routing.
                self.engine.logs.scan(original, outcome.status.label(), None, ms);
            }
        }
    }

    /// Scan an existing vault artefact and route it to quarantine or
    /// restore.
    fn scan_and_route_vaulted(&self, vaulted: &Path, meta_path: &Path) {
        let sidecar: VaultMeta = match meta::read_json(meta_path) {
            Ok(m) => m,
            Err(e) => {
                self.engine.logs.general.warn(&format!(
                    "[SCANVAULT] Failed to read metadata {}: {e}",
                    meta_path.display()
                ));
                return;
            }
        };

        self.engine
            .logs
            .general
            .info(&format!("[SCANVAULT] Scanning: {}", vaulted.display()));
        let outcome = scanner::force_scan_vaulted(&self.engine, vaulted);
        let ms = outcome.scan_time_ms;

        if outcome.matched() {
            let rule = outcome.rule.clone().unwrap_or_default();
            self.engine.logs.scan(vaulted, "THREAT", Some(&rule), ms);
            self.quarantine_vaulted(vaulted, meta_path, &sidecar, &rule, false);
        } else if outcome.status.allows_restore() {
            self.engine.logs.scan(vaulted, outcome.status.label(), None, ms);
            self.restore_vaulted(vaulted, meta_path, &sidecar);
        } else {
            self.engine.logs.scan(vaulted, outcome.status.label(), None, ms);
            self.engine.logs.general.warn(&format!(
                "[SCANVAULT] Scan error ({}), leaving in vault: {}",
                outcome.status.label(),
                vaulted.display()
            ));
        }
    }

    fn quarantine_vaulted(
        &self,
        vaulted: &Path,
        meta_path: &Path,
        sidecar: &VaultMeta,
        rule: &str,
        recheck_before_restore: bool,
    ) {
        self.engine.logs.general.warn(&format!(
            "[SCANVAULT] THREAT DETECTED: {} - Rule: {rule}",
            basename(vaulted)
        ));
        match self
            .engine
            .quarantine
            .move_to_quarantine(vaulted, &[rule.to_string()])
        {
            Ok(quarantine_path) => {
                self.engine.logs.quarantined(vaulted, &quarantine_path, rule);

                let mut hist = HistoryMeta::from_vault_meta(sidecar, FinalStatus::Quarantined);
                hist.quarantine_path = Some(paths::normalize_preserve_case(&quarantine_path));
                hist.matched_rule = Some(rule.to_string());
                if recheck_before_restore {
                    hist.recheck_before_restore = Some(true);
                }
                self.archive_history(meta_path, &hist);

                self.notify_once(
                    Path::new(&sidecar.original_path),
                    "ScanVault: Threat Quarantined",
                    &format!("Rule: {rule}\nFile: {}", basename(Path::new(&sidecar.original_path))),
                );
                self.engine.emit(UiEvent::FileQuarantined {
                    path: sidecar.original_path.clone(),
                    rules: vec![rule.to_string()],
                });
            }
            Err(e) => {
                self.engine.telemetry.incr("scan_quarantine_failed");
                self.engine.logs.general.error(&format!(
                    "[SCANVAULT] Quarantine FAILED for {}: {e}",
                    basename(vaulted)
                ));
                // Leave artefact and sidecar in the vault for manual review.
            }
        }
    }

    fn restore_vaulted(&self, vaulted: &Path, meta_path: &Path, sidecar: &VaultMeta) {
        // Restoration rate limit: re-enqueue with backoff instead of
        // hammering the filesystem during a burst.
        if self.restore_rate_exceeded() {
            let current = self.restoration_timestamps.lock().len();
            self.engine.logs.rate_limit(
                "RESTORE_RATE",
                current,
                self.engine.config.max_restores_per_minute,
            );
            self.engine.telemetry.incr("restore_rate_limited");
            std::thread::sleep(RESTORE_RETRY_DELAY);
            self.engine.queue.add(vaulted, VaultEvent::RateLimitRetry);
            return;
        }
        self.restoration_timestamps.lock().push(Instant::now());

        let pre_hash = fsutil::sha256_file(vaulted).ok();

        // Re-scan right before restore to close the race between the first
        // verdict and the move.
        let recheck = scanner::force_scan_vaulted(&self.engine, vaulted);
        if recheck.matched() {
            let rule = recheck.rule.clone().unwrap_or_default();
            self.engine.logs.general.warn(&format!(
                "[SCANVAULT] Re-check caught threat, quarantining: {}",
                vaulted.display()
            ));
            self.quarantine_vaulted(vaulted, meta_path, sidecar, &rule, true);
            return;
        }

        let original = PathBuf::from(&sidecar.original_path);
        if let Some(parent) = original.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                self.engine
                    .logs
                    .restore_failed(vaulted, &format!("create destination dir: {e}"));
                return;
            }
        }
        if let Err(e) = fsutil::move_file(vaulted, &original) {
            self.engine.logs.restore_failed(vaulted, &e.to_string());
            return;
        }

        self.mark_recently_restored(&original);
        self.engine.logs.restore(vaulted, &original);
        // Let the OS release handles before anything touches the file.
        std::thread::sleep(HANDLE_RELEASE_DELAY);

        let mut hist = HistoryMeta::from_vault_meta(sidecar, FinalStatus::Restored);
        hist.pre_restore_hash = pre_hash.clone();
        hist.restored_path = Some(paths::normalize_preserve_case(&original));
        hist.recheck_before_restore = Some(false);
        self.archive_history(meta_path, &hist);

        // Allow a later distinct change to re-enter the vault; the path
        // entry expires on its own.
        self.capture.clear_file_signature(&original);

        self.engine.notifier.notify(
            "ScanVault: File Restored",
            &format!("Clean file returned\nFile: {}", basename(&original)),
        );
        self.notified
            .lock()
            .insert(sidecar.original_path.clone());
        self.engine.emit(UiEvent::FileRestored {
            path: sidecar.original_path.clone(),
        });

        if self.engine.config.hash_guard_enabled {
            if let Some(pre_hash) = pre_hash {
                self.schedule_hash_guard(original, pre_hash);
            }
        }
    }

    fn write_history(&self, hist: &HistoryMeta) {
        let history_dir = self.engine.layout.history_dir();
        let _ = std::fs::create_dir_all(&history_dir);
        let file_hash = vwar_core::fingerprint::path_hash16(Path::new(&hist.original_path));
        let name = format!(
            "{}__{}__{}.meta",
            basename(Path::new(&hist.original_path)),
            status_stub(hist.final_status),
            file_hash
        );
        if let Err(e) = meta::write_json(&history_dir.join(name), hist) {
            self.engine
                .logs
                .general
                .warn(&format!("[SCANVAULT] Failed to create history entry: {e}"));
        }
    }

    /// Move a live sidecar into history with its terminal status.
    fn archive_history(&self, meta_path: &Path, hist: &HistoryMeta) {
        let history_dir = self.engine.layout.history_dir();
        let _ = std::fs::create_dir_all(&history_dir);
        let name = meta_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("{}.meta", meta::file_timestamp()));
        if let Err(e) = meta::write_json(&history_dir.join(name), hist) {
            self.engine
                .logs
                .general
                .warn(&format!("[SCANVAULT] Failed to write history meta: {e}"));
        }
        let _ = std::fs::remove_file(meta_path);
    }

    pub fn is_recently_restored(&self, path: &Path) -> bool {
        let normalized = paths::normalize_for_compare(path);
        let window = Duration::from_secs(self.engine.config.restore_exclusion_secs);
        let mut restored = self.recently_restored.lock();
        match restored.get(&normalized) {
            Some(at) if at.elapsed() < window => true,
            Some(_) => {
                restored.remove(&normalized);
                false
            }
            None => false,
        }
    }

    fn mark_recently_restored(&self, path: &Path) {
        let normalized = paths::normalize_for_compare(path);
        self.engine.logs.general.info(&format!(
            "[SCANVAULT] Added to restore exclusion: {normalized} ({}s cooldown)",
            self.engine.config.restore_exclusion_secs
        ));
        self.recently_restored
            .lock()
            .insert(normalized, Instant::now());
    }

    fn restore_rate_exceeded(&self) -> bool {
        let mut stamps = self.restoration_timestamps.lock();
        stamps.retain(|t| t.elapsed() < RESTORE_RATE_WINDOW);
        stamps.len() >= self.engine.config.max_restores_per_minute
    }

    fn housekeeping(&self) {
        self.notified.lock().clear();
        let window = Duration::from_secs(self.engine.config.restore_exclusion_secs);
        self.recently_restored
            .lock()
            .retain(|_, at| at.elapsed() <= window);
        self.engine
            .logs
            .general
            .info("[SCANVAULT] Cleared notification tracking cache");
    }

    fn notify_once(&self, original: &Path, title: &str, body: &str) {
        let key = paths::normalize_preserve_case(original);
        if self.notified.lock().insert(key) {
            self.engine.notifier.notify(title, body);
        }
    }

    // ── Hash guard (off by default) ─────────────────────────────────────

    /// Recheck the restored file at 1 s, the configured delay, and at least
    /// 10 s. Divergence from the pre-restore hash quarantines under a
    /// synthetic rule; a missing destination triggers the sibling sweep to
    /// catch duplicate-download finalization.
    fn schedule_hash_guard(&self, restored: PathBuf, pre_hash: String) {
        let delay = self.engine.config.post_restore_recheck_delay_secs;
        let schedule = [1u64, delay, (delay * 2 + 2).max(10)];
        let engine = self.engine.clone();
        let quarantine_and_count = move |path: &Path, eng: &Arc<Engine>| -> bool {
            match eng.quarantine.move_to_quarantine(path, &[HASH_GUARD_RULE.to_string()]) {
                Ok(qpath) => {
                    eng.logs.quarantined(path, &qpath, HASH_GUARD_RULE);
                    eng.telemetry.incr("hash_guard_quarantined_on_change");
                    eng.notifier.notify(
                        "Threat quarantined!",
                        &format!("RULE: {HASH_GUARD_RULE}\nPath: {}", path.display()),
                    );
                    eng.emit(UiEvent::FileQuarantined {
                        path: paths::normalize_preserve_case(path),
                        rules: vec![HASH_GUARD_RULE.to_string()],
                    });
                    true
                }
                Err(e) => {
                    eng.logs.general.warn(&format!(
                        "[SCANVAULT] Hash guard quarantine failed: {e}"
                    ));
                    eng.telemetry.incr("hash_guard_error");
                    false
                }
            }
        };

        std::thread::Builder::new()
            .name("hash-guard-recheck".into())
            .spawn(move || {
                let started = Instant::now();
                for at in schedule {
                    let target = Duration::from_secs(at);
                    if let Some(remaining) = target.checked_sub(started.elapsed()) {
                        std::thread::sleep(remaining);
                    }
                    engine.telemetry.incr("recheck_scheduled_post_restore");

                    if !restored.exists() {
                        if sibling_sweep(&engine, &restored, &pre_hash, &quarantine_and_count) {
                            return;
                        }
                        engine.telemetry.incr("recheck_missing_post_restore");
                        continue;
                    }
                    match fsutil::sha256_file(&restored) {
                        Ok(now_hash) if now_hash != pre_hash => {
                            if quarantine_and_count(&restored, &engine) {
                                return;
                            }
                        }
                        Ok(_) => {
                            engine.telemetry.incr("recheck_clean_post_restore");
                        }
                        Err(_) => {
                            engine.telemetry.incr("recheck_error_post_restore");
                        }
                    }
                }
            })
            .ok();
    }
}

/// Scan `name.ext` and `name (N).ext` variants of a missing restore
/// destination. Returns true when a sibling was quarantined.
fn sibling_sweep(
    engine: &Arc<Engine>,
    target: &Path,
    pre_hash: &str,
    quarantine: &impl Fn(&Path, &Arc<Engine>) -> bool,
) -> bool {
    let directory = match target.parent() {
        Some(d) if d.is_dir() => d,
        _ => return false,
    };
    let stem = target
        .file_stem()
        .map(|s| s.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let ext = target
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default();

    let mut any_scanned = false;
    let entries = match std::fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(_) => return false,
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_lowercase();
        if !is_sibling_name(&name, &stem, &ext) {
            continue;
        }
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        any_scanned = true;
        if let Ok(now_hash) = fsutil::sha256_file(&path) {
            if now_hash != pre_hash && quarantine(&path, engine) {
                engine.logs.general.warn(&format!(
                    "[SCANVAULT] Sibling sweep hash-guard quarantined: {}",
                    path.display()
                ));
                return true;
            }
        }
        let outcome = scanner::scan_file_at(engine, &path);
        if outcome.matched() {
            engine.telemetry.incr("recheck_sibling_sweep_match_post_restore");
            if quarantine(&path, engine) {
                return true;
            }
        }
    }
    if any_scanned {
        engine.telemetry.incr("recheck_sibling_sweep_clean_post_restore");
    }
    false
}

fn is_sibling_name(name: &str, stem: &str, ext: &str) -> bool {
    if stem.is_empty() || !name.ends_with(ext) {
        return false;
    }
    let body = &name[..name.len() - ext.len()];
    if body == stem {
        return true;
    }
    if let Some(rest) = body.strip_prefix(stem) {
        if let Some(number) = rest.strip_prefix(" (").and_then(|r| r.strip_suffix(')')) {
            return !number.is_empty() && number.chars().all(|c| c.is_ascii_digit());
        }
    }
    false
}

fn sidecar_of(vaulted: &Path) -> PathBuf {
    let name = vaulted
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    vaulted.with_file_name(format!("{name}.meta"))
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

fn status_stub(status: FinalStatus) -> &'static str {
    match status {
        FinalStatus::Quarantined => "quarantined",
        FinalStatus::Restored => "restored",
        FinalStatus::DuplicateSuppressed => "duplicate",
        FinalStatus::Clean => "clean",
    }
}
