//! ScanVault capture engine.
//!
//! Moves a newly observed file into the vault and writes its sidecar, after
//! running the full admission pipeline: per-second rate limiting with
//! exponential backoff, burst suppression, the installation-mode
//! short-circuit, and content/path dedup over a 15 s TTL window.
//!
//! Rate limiting never drops a file: after the retry budget is exhausted
//! the capture proceeds anyway, merely delayed. Duplicates and
//! installation-mode hits are ordinary outcomes; unexpected I/O failures
//! surface as the `Failed` outcome with the reason attached.

use crate::engine::{Engine, UiEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use vwar_core::error::VwarError;
use vwar_core::meta::{self, FinalStatus, HistoryMeta, VaultEvent, VaultMeta};
use vwar_core::{fingerprint, fsutil, paths};

const RATE_RETRY_MAX: u32 = 10;
const RATE_BACKOFF_START: Duration = Duration::from_millis(100);
const RATE_BACKOFF_CAP: Duration = Duration::from_millis(1500);
const RATE_WARNING_GAP: Duration = Duration::from_secs(5);
const BURST_DELAY: Duration = Duration::from_millis(500);
const MOVE_ATTEMPTS: u32 = 10;
const MOVE_BACKOFF_START: Duration = Duration::from_millis(150);
const MOVE_BACKOFF_CAP: Duration = Duration::from_millis(1200);

/// Tagged capture result.
#[derive(Debug)]
pub enum CaptureOutcome {
    Captured {
        vaulted_path: PathBuf,
        meta_path: PathBuf,
    },
    Duplicate {
        signature: String,
    },
    InstallationMode,
    Failed {
        reason: String,
    },
}

#[derive(Default)]
struct CaptureState {
    recent_signatures: HashMap<String, Instant>,
    recent_paths: HashMap<String, Instant>,
    capture_timestamps: Vec<Instant>,
    last_rate_limit_warning: Option<Instant>,
}

impl CaptureState {
    fn purge(&mut self, signature_ttl: Duration, burst_window: Duration) {
        self.recent_signatures
            .retain(|_, t| t.elapsed() <= signature_ttl);
        self.recent_paths.retain(|_, t| t.elapsed() <= signature_ttl);
        self.capture_timestamps
            .retain(|t| t.elapsed() < burst_window);
    }

    fn captures_in_last_second(&self) -> usize {
        self.capture_timestamps
            .iter()
            .filter(|t| t.elapsed() < Duration::from_secs(1))
            .count()
    }

    fn warning_due(&mut self) -> bool {
        let due = self
            .last_rate_limit_warning
            .map(|t| t.elapsed() > RATE_WARNING_GAP)
            .unwrap_or(true);
        if due {
            self.last_rate_limit_warning = Some(Instant::now());
        }
        due
    }
}

pub struct CaptureEngine {
    engine: Arc<Engine>,
    state: Mutex<CaptureState>,
}

impl CaptureEngine {
    pub fn new(engine: Arc<Engine>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            state: Mutex::new(CaptureState::default()),
        })
    }

    /// Full capture pipeline; see module docs for ordering.
    pub fn capture(&self, path: &Path, event: VaultEvent) -> CaptureOutcome {
        match self.capture_inner(path, event) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.engine
                    .logs
                    .capture_failed(path, event.label(), &e.to_string());
                self.engine.logs.general.error(&format!(
                    "[SCANVAULT] Failed to vault {}: {e}",
                    path.display()
                ));
                CaptureOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    fn capture_inner(&self, path: &Path, event: VaultEvent) -> Result<CaptureOutcome, VwarError> {
        if !path.exists() {
            return Err(VwarError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("file no longer exists: {}", path.display()),
            )));
        }

        self.wait_for_rate_capacity();
        self.burst_check();
        self.state.lock().capture_timestamps.push(Instant::now());

        // Installation mode: do not move, queue for in-place scanning.
        if self.engine.detector.is_file_being_installed(path) {
            self.engine.logs.general.info(&format!(
                "[SCANVAULT] Installation active - queuing for in-place scan: {}",
                basename(path)
            ));
            self.engine.queue.add(path, event);
            self.engine.telemetry.incr("installation_mode_queued");
            return Ok(CaptureOutcome::InstallationMode);
        }

        std::fs::create_dir_all(self.engine.layout.vault_dir())?;

        let signature = fingerprint::capture_signature(path);
        let normalized = paths::normalize_for_compare(path);
        let is_duplicate = {
            let mut state = self.state.lock();
            state.purge(self.signature_ttl(), self.burst_window());
            state.recent_signatures.contains_key(&signature)
                || state.recent_paths.contains_key(&normalized)
        };
        if is_duplicate {
            self.write_duplicate_stub(path, &signature, event);
            return Ok(CaptureOutcome::Duplicate { signature });
        }

        let file_name = basename(path);
        let timestamp = meta::file_timestamp();
        let path_hash = fingerprint::path_hash16(path);
        let vaulted_path = self
            .engine
            .layout
            .vault_dir()
            .join(format!("{file_name}__{timestamp}__{path_hash}.vaulted"));

        self.move_with_backoff(path, &vaulted_path)?;

        let sidecar = VaultMeta {
            original_path: paths::normalize_preserve_case(path),
            vaulted_path: paths::normalize_preserve_case(&vaulted_path),
            timestamp: meta::human_timestamp(),
            event,
            signature: signature.clone(),
        };
        let meta_path = vaulted_path.with_file_name(format!(
            "{}.meta",
            vaulted_path.file_name().unwrap_or_default().to_string_lossy()
        ));
        meta::write_json(&meta_path, &sidecar)?;

        {
            let mut state = self.state.lock();
            let now = Instant::now();
            state.recent_signatures.insert(signature, now);
            state.recent_paths.insert(normalized, now);
        }

        self.engine.logs.capture(path, &vaulted_path, event.label());
        self.engine
            .logs
            .general
            .info(&format!("[SCANVAULT] {} -> {}", path.display(), vaulted_path.display()));
        self.engine.telemetry.incr("stabilized_capture");

        Ok(CaptureOutcome::Captured {
            vaulted_path,
            meta_path,
        })
    }

    /// Remove the signature entry after a restoration so a later legitimate
    /// re-save can re-enter the vault. The path entry stays: it must expire
    /// naturally to absorb the monitor echo of the restore itself.
    pub fn clear_file_signature(&self, path: &Path) {
        let signature = fingerprint::capture_signature(path);
        let mut state = self.state.lock();
        if state.recent_signatures.remove(&signature).is_some() {
            self.engine.logs.general.info(&format!(
                "[SCANVAULT] Cleared signature for re-vaulting: {}",
                basename(path)
            ));
        }
    }

    fn signature_ttl(&self) -> Duration {
        Duration::from_secs(self.engine.config.signature_ttl_secs)
    }

    fn burst_window(&self) -> Duration {
        Duration::from_secs(self.engine.config.burst_window_secs)
    }

    /// Block until the per-second window has capacity, with exponential
    /// backoff. Gives up after the retry budget and proceeds: the file is
    /// already under the engine's control and delay is acceptable.
    fn wait_for_rate_capacity(&self) {
        let max_per_second = self.engine.config.max_captures_per_second as usize;
        if max_per_second == 0 {
            return;
        }
        let mut retry = 0u32;
        loop {
            let (recent, warn) = {
                let mut state = self.state.lock();
                state.purge(self.signature_ttl(), self.burst_window());
                let recent = state.captures_in_last_second();
                let warn = recent >= max_per_second && retry == 0 && state.warning_due();
                (recent, warn)
            };
            if recent < max_per_second {
                return;
            }
            if warn {
                self.engine.logs.general.warn(&format!(
                    "[SCANVAULT] Capture rate limit reached ({recent}/sec). Waiting for capacity..."
                ));
                self.engine
                    .logs
                    .rate_limit("CAPTURE_RATE", recent, max_per_second);
                self.engine.telemetry.incr("capture_rate_limited");
            }
            if retry >= RATE_RETRY_MAX {
                self.engine.logs.general.info(&format!(
                    "[SCANVAULT] Rate limit retry timeout after {retry} attempts. Proceeding with capture."
                ));
                return;
            }
            let backoff = RATE_BACKOFF_START
                .checked_mul(1 << retry.min(4))
                .unwrap_or(RATE_BACKOFF_CAP)
                .min(RATE_BACKOFF_CAP);
            std::thread::sleep(backoff);
            retry += 1;
        }
    }

    /// Sustained-attack detection over the burst window. Logs, slows down,
    /// and continues; nothing is dropped.
    fn burst_check(&self) {
        let max_burst = self.engine.config.max_burst_captures;
        let (burst, warn) = {
            let mut state = self.state.lock();
            state.purge(self.signature_ttl(), self.burst_window());
            let burst = state.capture_timestamps.len();
            let warn = burst >= max_burst && state.warning_due();
            (burst, warn)
        };
        if burst >= max_burst {
            if warn {
                self.engine.logs.general.warn(&format!(
                    "[SCANVAULT] Burst limit reached: {burst} captures in {}s. Continuing with backlog.",
                    self.engine.config.burst_window_secs
                ));
                self.engine.logs.rate_limit("BURST_ATTACK", burst, max_burst);
                self.engine.telemetry.incr("burst_attack_blocked");
            }
            std::thread::sleep(BURST_DELAY);
        }
    }

    fn write_duplicate_stub(&self, path: &Path, signature: &str, event: VaultEvent) {
        let history_dir = self.engine.layout.history_dir();
        let _ = std::fs::create_dir_all(&history_dir);
        let stub_name = format!(
            "duplicate__{}__{}.meta",
            &signature[..12],
            meta::file_timestamp()
        );
        let mut stub = HistoryMeta::bare(
            paths::normalize_preserve_case(path),
            FinalStatus::DuplicateSuppressed,
        );
        stub.signature = Some(signature.to_string());
        stub.event = Some(event);
        if let Err(e) = meta::write_json(&history_dir.join(stub_name), &stub) {
            self.engine
                .logs
                .general
                .warn(&format!("[SCANVAULT] Failed to write duplicate meta: {e}"));
        }
        self.engine.logs.duplicate(path, signature);
        self.engine.logs.general.info(&format!(
            "[SCANVAULT] Duplicate suppressed sig={signature} path={}",
            path.display()
        ));
        self.engine.telemetry.incr("duplicate_suppressed");
        self.engine.emit(UiEvent::DuplicateSuppressed {
            path: paths::normalize_preserve_case(path),
        });
    }

    /// Move into the vault, defeating transient locks with backoff.
    fn move_with_backoff(&self, src: &Path, dst: &Path) -> Result<(), VwarError> {
        let mut delay = MOVE_BACKOFF_START;
        for attempt in 1..=MOVE_ATTEMPTS {
            if !src.exists() {
                std::thread::sleep(Duration::from_millis(100));
                continue;
            }
            match fsutil::move_file(src, dst) {
                Ok(()) => return Ok(()),
                Err(_) if attempt < MOVE_ATTEMPTS => {
                    std::thread::sleep(delay);
                    delay = Duration::from_millis(
                        ((delay.as_millis() as u64 * 3) / 2).min(MOVE_BACKOFF_CAP.as_millis() as u64),
                    );
                }
                Err(_) => break,
            }
        }
        Err(VwarError::MoveRetryExhausted {
            source_path: src.to_path_buf(),
            attempts: MOVE_ATTEMPTS,
        })
    }
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
