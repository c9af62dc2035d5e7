//! Scan wrappers over the compiled signature handle.
//!
//! Two entry points: `scan_file_at` for files at their original location
//! (exclusions honored, with the vault-root allowlist) and
//! `force_scan_vaulted` for vault artefacts (INTERNAL bypassed, temp-style
//! skips still respected). Neither moves a file; routing is the
//! processor's job.

use crate::engine::Engine;
use crate::signatures::ScanVerdict;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Instant;
use tracing::warn;
use vwar_core::exclusions::Exclusion;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStatus {
    NoRules,
    SkippedNonFile,
    SkippedInternal,
    SkippedRecycleBin,
    SkippedTempRoot,
    SkippedTempFile,
    Match,
    Clean,
    EngineError,
    Error,
}

impl ScanStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ScanStatus::NoRules => "NO_RULES",
            ScanStatus::SkippedNonFile => "SKIPPED_NON_FILE",
            ScanStatus::SkippedInternal => "SKIPPED_INTERNAL",
            ScanStatus::SkippedRecycleBin => "SKIPPED_RECYCLE_BIN",
            ScanStatus::SkippedTempRoot => "SKIPPED_TEMP_ROOT",
            ScanStatus::SkippedTempFile => "SKIPPED_TEMP_FILE",
            ScanStatus::Match => "MATCH",
            ScanStatus::Clean => "CLEAN",
            ScanStatus::EngineError => "ENGINE_ERROR",
            ScanStatus::Error => "ERROR",
        }
    }

    /// Statuses that route a vaulted file back to its original location.
    pub fn allows_restore(&self) -> bool {
        matches!(
            self,
            ScanStatus::Clean
                | ScanStatus::SkippedInternal
                | ScanStatus::SkippedTempRoot
                | ScanStatus::SkippedTempFile
        )
    }
}

#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub status: ScanStatus,
    pub rule: Option<String>,
    pub scan_time_ms: u128,
}

impl ScanOutcome {
    fn new(status: ScanStatus, rule: Option<String>, started: Instant) -> Self {
        Self {
            status,
            rule,
            scan_time_ms: started.elapsed().as_millis(),
        }
    }

    pub fn matched(&self) -> bool {
        self.status == ScanStatus::Match
    }
}

fn exclusion_status(reason: Exclusion) -> ScanStatus {
    match reason {
        Exclusion::Internal => ScanStatus::SkippedInternal,
        Exclusion::RecycleBin => ScanStatus::SkippedRecycleBin,
        Exclusion::TempRoot => ScanStatus::SkippedTempRoot,
        Exclusion::TempFile => ScanStatus::SkippedTempFile,
    }
}

/// Scan a file at its original location.
pub fn scan_file_at(engine: &Engine, path: &Path) -> ScanOutcome {
    let started = Instant::now();
    let rules = match engine.signatures.compiled() {
        Some(rules) => rules,
        None => {
            engine.logs.general.error("[SCAN] No signature rules loaded.");
            return ScanOutcome::new(ScanStatus::NoRules, None, started);
        }
    };
    if !path.is_file() {
        return ScanOutcome::new(ScanStatus::SkippedNonFile, None, started);
    }
    if let Some(reason) = engine.exclusions.classify(path) {
        engine
            .logs
            .general
            .info(&format!("[SKIPPED] {}: {}", reason.status(), path.display()));
        return ScanOutcome::new(exclusion_status(reason), None, started);
    }
    run_match(engine, path, rules, started)
}

/// Scan a vault artefact, bypassing the INTERNAL exclusion.
pub fn force_scan_vaulted(engine: &Engine, path: &Path) -> ScanOutcome {
    let started = Instant::now();
    let rules = match engine.signatures.compiled() {
        Some(rules) => rules,
        None => {
            engine
                .logs
                .general
                .error("[SCAN] No signature rules loaded (force vault).");
            return ScanOutcome::new(ScanStatus::NoRules, None, started);
        }
    };
    if !path.is_file() {
        return ScanOutcome::new(ScanStatus::SkippedNonFile, None, started);
    }
    if let Some(reason) = engine.exclusions.classify_bypass_internal(path) {
        engine
            .logs
            .general
            .info(&format!("[VAULT][SKIPPED] {}: {}", reason.status(), path.display()));
        return ScanOutcome::new(exclusion_status(reason), None, started);
    }
    run_match(engine, path, rules, started)
}

fn run_match(
    engine: &Engine,
    path: &Path,
    rules: std::sync::Arc<crate::signatures::CompiledRules>,
    started: Instant,
) -> ScanOutcome {
    match rules.scan_file(path, engine.signatures.match_timeout()) {
        Ok(ScanVerdict::Match(rule)) => {
            engine
                .logs
                .general
                .info(&format!("[MATCH] {} => Rule: {rule}", path.display()));
            engine.telemetry.incr("scan_match");
            ScanOutcome::new(ScanStatus::Match, Some(rule), started)
        }
        Ok(ScanVerdict::NoMatch) => {
            engine.telemetry.incr("scan_clean");
            ScanOutcome::new(ScanStatus::Clean, None, started)
        }
        Err(e) if e.kind() == ErrorKind::TimedOut => {
            warn!(path = %path.display(), "rule match deadline exceeded");
            engine
                .logs
                .general
                .warn(&format!("[SCAN] Engine timeout: {}", path.display()));
            engine.telemetry.incr("scan_error");
            ScanOutcome::new(ScanStatus::EngineError, None, started)
        }
        Err(e) => {
            engine
                .logs
                .general
                .warn(&format!("[SCAN] Engine error: {e} - {}", path.display()));
            engine.telemetry.incr("scan_error");
            ScanOutcome::new(ScanStatus::EngineError, None, started)
        }
    }
}
