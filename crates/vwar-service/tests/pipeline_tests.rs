//! End-to-end tests for the capture → scan → route pipeline.
//!
//! Covers:
//!  1. Clean file in a watched folder → CLEAN history, file untouched
//!  2. Rule match → quarantine artefact + sidecar, case preserved
//!  3. Duplicate rapid-fire → DUPLICATE_SUPPRESSED, no second move
//!  4. Crash recovery → vaulted artefact re-enqueued and restored
//!  5. Vault capture mode → capture, scan, quarantine routing
//!  6. Recently-restored exclusion window
//!  7. Installation mode short-circuit (no vaulting)
//!  8. Ingress drops excluded paths before they reach the queue
//!
//! Test roots live under the cargo target tmpdir: the OS temp directory is
//! itself an exclusion (TEMP_ROOT) and must not host scan targets.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use vwar_core::config::{CaptureMode, EngineConfig};
use vwar_core::fsutil;
use vwar_core::meta::{self, FinalStatus, HistoryMeta, VaultEvent, VaultMeta};
use vwar_core::paths::Layout;
use vwar_service::engine::Engine;
use vwar_service::ingress::spawn_ingress;
use vwar_service::monitor::ChangeRecord;
use vwar_service::notifications::Notifier;
use vwar_service::vault::capture::{CaptureEngine, CaptureOutcome};
use vwar_service::vault::processor::VaultProcessor;

const EICAR_PATTERN: &str = "EICAR-STANDARD-ANTIVIRUS-TEST-FILE";
const EICAR_BODY: &[u8] = b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*";

fn test_root(name: &str) -> PathBuf {
    let root = PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join(name);
    let _ = fs::remove_dir_all(&root);
    fs::create_dir_all(&root).unwrap();
    root
}

fn engine_at(root: &Path, config: EngineConfig) -> Arc<Engine> {
    let layout = Layout::new(root.join("engine"));
    Engine::bootstrap_with_notifier(layout, config, Notifier::disabled()).unwrap()
}

fn write_rule(engine: &Engine, name: &str, pattern: &str) {
    let dir = engine.layout.rules_dir().join("test");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(format!("{name}.rule")), pattern).unwrap();
    engine.signatures.load_local().unwrap();
}

fn files_dir(root: &Path) -> PathBuf {
    let dir = root.join("files");
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    false
}

fn history_entries(engine: &Engine) -> Vec<HistoryMeta> {
    let mut entries = Vec::new();
    if let Ok(dir) = fs::read_dir(engine.layout.history_dir()) {
        for entry in dir.flatten() {
            if let Ok(hist) = meta::read_json::<HistoryMeta>(&entry.path()) {
                entries.push(hist);
            }
        }
    }
    entries
}

/// Spawn the processor, run `body`, then shut the thread down.
fn with_processor<F: FnOnce(&Arc<VaultProcessor>)>(engine: &Arc<Engine>, body: F) {
    let capture = CaptureEngine::new(engine.clone());
    let processor = VaultProcessor::new(engine.clone(), capture);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = processor.clone().spawn(shutdown_rx);
    body(&processor);
    let _ = shutdown_tx.send(true);
    handle.join().unwrap();
}

// ─── 1. Clean file ──────────────────────────────────────────────────────────

#[test]
fn clean_file_is_left_in_place_with_clean_history() {
    let root = test_root("clean_file");
    let engine = engine_at(&root, EngineConfig::default());
    write_rule(&engine, "eicar_test", EICAR_PATTERN);

    let victim = files_dir(&root).join("report.pdf");
    fs::write(&victim, b"%PDF-1.7 harmless quarterly figures").unwrap();

    engine.queue.add(&victim, VaultEvent::Created);
    with_processor(&engine, |_| {
        assert!(wait_until(Duration::from_secs(10), || {
            !engine.queue.is_in_queue(&victim)
        }));
    });

    assert!(victim.exists(), "clean file must stay where it was");
    let history = history_entries(&engine);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].final_status, FinalStatus::Clean);
    assert!(history[0].original_path.ends_with("files/report.pdf"));
    assert_eq!(engine.telemetry.get("scan_clean"), 1);
}

// ─── 2. Threat quarantined ──────────────────────────────────────────────────

#[test]
fn matching_file_is_quarantined_with_sidecar() {
    let root = test_root("threat_quarantine");
    let engine = engine_at(&root, EngineConfig::default());
    write_rule(&engine, "eicar_test", EICAR_PATTERN);

    let victim = files_dir(&root).join("Invoice.PDF.exe");
    fs::write(&victim, EICAR_BODY).unwrap();

    engine.queue.add(&victim, VaultEvent::Created);
    with_processor(&engine, |_| {
        assert!(wait_until(Duration::from_secs(10), || {
            !engine.queue.is_in_queue(&victim)
        }));
    });

    assert!(!victim.exists(), "matched file must be moved out");
    let quarantined: Vec<PathBuf> = fs::read_dir(engine.layout.quarantine_dir())
        .unwrap()
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.to_string_lossy().ends_with(".quarantined"))
        .collect();
    assert_eq!(quarantined.len(), 1);
    let name = quarantined[0].file_name().unwrap().to_string_lossy().to_string();
    assert!(name.starts_with("Invoice.PDF.exe__"));

    let sidecar_path = quarantined[0].with_file_name(format!("{name}.meta"));
    let sidecar: meta::QuarantineMeta = meta::read_json(&sidecar_path).unwrap();
    assert_eq!(sidecar.matched_rules, vec!["eicar_test"]);
    // Byte-identical case for restoration.
    assert!(sidecar.original_path.ends_with("files/Invoice.PDF.exe"));

    let history = history_entries(&engine);
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].final_status, FinalStatus::Quarantined);
    assert_eq!(history[0].matched_rule.as_deref(), Some("eicar_test"));
    assert_eq!(engine.telemetry.get("scan_match"), 1);
}

// ─── 3. Duplicate rapid-fire ────────────────────────────────────────────────

#[test]
fn duplicate_rapid_fire_is_suppressed() {
    let root = test_root("duplicate_capture");
    let engine = engine_at(&root, EngineConfig::default());
    let capture = CaptureEngine::new(engine.clone());

    let victim = files_dir(&root).join("download.bin");
    fs::write(&victim, b"twelve kib of payload, morally").unwrap();

    let first = capture.capture(&victim, VaultEvent::Created);
    let vaulted = match first {
        CaptureOutcome::Captured { vaulted_path, meta_path } => {
            assert!(vaulted_path.exists());
            assert!(meta_path.exists());
            vaulted_path
        }
        other => panic!("expected capture, got {other:?}"),
    };

    // The same path reappears within the TTL window (monitor echo or
    // rapid re-download).
    fs::write(&victim, b"twelve kib of payload, morally").unwrap();
    match capture.capture(&victim, VaultEvent::Created) {
        CaptureOutcome::Duplicate { signature } => assert_eq!(signature.len(), 32),
        other => panic!("expected duplicate suppression, got {other:?}"),
    }

    // No second move: the file is still at its path, one vault artefact.
    assert!(victim.exists());
    assert!(vaulted.exists());
    let stub = history_entries(&engine)
        .into_iter()
        .find(|h| h.final_status == FinalStatus::DuplicateSuppressed)
        .expect("duplicate suppression must be visible in history");
    assert!(stub.signature.is_some());
    assert_eq!(engine.telemetry.get("duplicate_suppressed"), 1);
}

// ─── 4. Crash recovery + restore ────────────────────────────────────────────

#[test]
fn vaulted_artefact_is_recovered_and_restored() {
    let root = test_root("crash_recovery");
    let engine = engine_at(&root, EngineConfig::default());
    write_rule(&engine, "eicar_test", EICAR_PATTERN);

    // A capture from a previous run that never got processed.
    let original = files_dir(&root).join("Restored.BIN");
    let vaulted = engine
        .layout
        .vault_dir()
        .join("Restored.BIN__20250101120000__0011223344556677.vaulted");
    fs::write(&vaulted, b"clean content from before the crash").unwrap();
    let sidecar = VaultMeta {
        original_path: original.to_string_lossy().to_string(),
        vaulted_path: vaulted.to_string_lossy().to_string(),
        timestamp: "2025-01-01 12:00:00".into(),
        event: VaultEvent::Created,
        signature: "a".repeat(32),
    };
    let meta_path = vaulted.with_file_name(format!(
        "{}.meta",
        vaulted.file_name().unwrap().to_string_lossy()
    ));
    meta::write_json(&meta_path, &sidecar).unwrap();

    let capture = CaptureEngine::new(engine.clone());
    let processor = VaultProcessor::new(engine.clone(), capture);
    processor.auto_recover();
    let item = engine.queue.get_next_pending().expect("recovery item queued");
    assert_eq!(item.event_type, VaultEvent::Recovery);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = processor.clone().spawn(shutdown_rx);
    assert!(wait_until(Duration::from_secs(10), || original.exists()));
    let _ = shutdown_tx.send(true);
    handle.join().unwrap();

    assert!(!vaulted.exists());
    assert!(!meta_path.exists(), "live sidecar is archived on restore");
    assert_eq!(
        fs::read(&original).unwrap(),
        b"clean content from before the crash"
    );

    let history = history_entries(&engine);
    let restored: Vec<_> = history
        .iter()
        .filter(|h| h.final_status == FinalStatus::Restored)
        .collect();
    assert_eq!(restored.len(), 1);
    assert!(restored[0].pre_restore_hash.is_some());
    assert!(restored[0]
        .restored_path
        .as_deref()
        .unwrap()
        .ends_with("files/Restored.BIN"));

    // The exclusion window now blocks immediate re-capture of that path.
    assert!(processor.is_recently_restored(&original));
}

// ─── 5. Vault capture mode ──────────────────────────────────────────────────

#[test]
fn vault_mode_captures_then_quarantines_threat() {
    let root = test_root("vault_mode");
    let config = EngineConfig {
        capture_mode: CaptureMode::Vault,
        ..EngineConfig::default()
    };
    let engine = engine_at(&root, config);
    write_rule(&engine, "eicar_test", EICAR_PATTERN);

    let victim = files_dir(&root).join("dropper.exe");
    fs::write(&victim, EICAR_BODY).unwrap();

    engine.queue.add(&victim, VaultEvent::Created);
    with_processor(&engine, |_| {
        assert!(wait_until(Duration::from_secs(10), || {
            !engine.queue.is_in_queue(&victim)
        }));
    });

    assert!(!victim.exists());
    // The artefact went through the vault and ended in quarantine; nothing
    // is left behind in the vault directory.
    let leftover_vaulted = fs::read_dir(engine.layout.vault_dir())
        .unwrap()
        .flatten()
        .filter(|e| e.file_name().to_string_lossy().ends_with(".vaulted"))
        .count();
    assert_eq!(leftover_vaulted, 0);

    let history = history_entries(&engine);
    let quarantined: Vec<_> = history
        .iter()
        .filter(|h| h.final_status == FinalStatus::Quarantined)
        .collect();
    assert_eq!(quarantined.len(), 1);
    // Vault-mode history carries the vault artefact path.
    assert!(quarantined[0].vaulted_path.is_some());
    assert_eq!(engine.telemetry.get("stabilized_capture"), 1);
}

// ─── 6. Recently-restored exclusion ─────────────────────────────────────────

#[test]
fn recently_restored_path_is_not_reprocessed() {
    let root = test_root("restore_exclusion");
    let engine = engine_at(&root, EngineConfig::default());
    write_rule(&engine, "eicar_test", EICAR_PATTERN);

    let original = files_dir(&root).join("echo.txt");
    let vaulted = engine
        .layout
        .vault_dir()
        .join("echo.txt__20250101120000__8899aabbccddeeff.vaulted");
    fs::write(&vaulted, b"restored once").unwrap();
    let meta_path = vaulted.with_file_name(format!(
        "{}.meta",
        vaulted.file_name().unwrap().to_string_lossy()
    ));
    meta::write_json(
        &meta_path,
        &VaultMeta {
            original_path: original.to_string_lossy().to_string(),
            vaulted_path: vaulted.to_string_lossy().to_string(),
            timestamp: "2025-01-01 12:00:00".into(),
            event: VaultEvent::Created,
            signature: "b".repeat(32),
        },
    )
    .unwrap();

    let capture = CaptureEngine::new(engine.clone());
    let processor = VaultProcessor::new(engine.clone(), capture);
    processor.auto_recover();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = processor.clone().spawn(shutdown_rx);
    // Wait for the restore to fully archive its history entry.
    assert!(wait_until(Duration::from_secs(10), || {
        history_entries(&engine)
            .iter()
            .any(|h| h.final_status == FinalStatus::Restored)
    }));
    let before = history_entries(&engine).len();

    // The monitor echo of the restore arrives as a fresh event.
    engine.queue.add(&original, VaultEvent::Modified);
    assert!(wait_until(Duration::from_secs(10), || {
        !engine.queue.is_in_queue(&original)
    }));
    let _ = shutdown_tx.send(true);
    handle.join().unwrap();

    // Completed with no action: no new history entry, file untouched.
    assert_eq!(history_entries(&engine).len(), before);
    assert_eq!(fs::read(&original).unwrap(), b"restored once");
}

// ─── 7. Installation mode ───────────────────────────────────────────────────

#[test]
fn installation_mode_queues_in_place_instead_of_vaulting() {
    let root = test_root("installation_mode");
    let engine = engine_at(&root, EngineConfig::default());
    let capture = CaptureEngine::new(engine.clone());

    let install_dir = files_dir(&root).join("VendorSetup");
    fs::create_dir_all(&install_dir).unwrap();
    engine.detector.register_manual_folder(&install_dir);

    let dll = install_dir.join("component.dll");
    fs::write(&dll, b"MZ fresh installer payload").unwrap();

    match capture.capture(&dll, VaultEvent::Created) {
        CaptureOutcome::InstallationMode => {}
        other => panic!("expected installation-mode short-circuit, got {other:?}"),
    }
    // Not moved, queued for in-place scanning instead.
    assert!(dll.exists());
    assert!(engine.queue.is_in_queue(&dll));
    assert_eq!(engine.telemetry.get("installation_mode_queued"), 1);
}

// ─── 8. Ingress exclusion filtering ─────────────────────────────────────────

#[test]
fn ingress_drops_excluded_paths_before_the_queue() {
    let root = test_root("ingress_filter");
    let engine = engine_at(&root, EngineConfig::default());

    let (tx, rx) = std::sync::mpsc::channel::<ChangeRecord>();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = spawn_ingress(engine.clone(), rx, shutdown_rx);

    let good = files_dir(&root).join("legit.docx");
    fs::write(&good, b"contract draft").unwrap();

    for (path, event_type) in [
        // Temp extension
        ("/home/u/Downloads/partial.crdownload", "created"),
        // Recycle bin segment
        ("/mnt/c/$Recycle.Bin/S-1-5/gone.exe", "created"),
        // Inside the engine's own data directory
        (
            engine.layout.queue_file().to_str().unwrap(),
            "modified",
        ),
        (good.to_str().unwrap(), "created"),
    ] {
        tx.send(ChangeRecord {
            path: path.to_string(),
            event_type: event_type.to_string(),
        })
        .unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || {
        engine.queue.is_in_queue(&good)
    }));
    // Only the legitimate file made it through.
    assert_eq!(engine.queue.pending_count(), 1);

    let _ = shutdown_tx.send(true);
    drop(tx);
    handle.join().unwrap();
}

// ─── 9. Zero-byte files are transient ───────────────────────────────────────

#[test]
fn zero_byte_files_classify_as_temp() {
    let root = test_root("zero_byte");
    let engine = engine_at(&root, EngineConfig::default());
    let empty = files_dir(&root).join("placeholder.bin");
    fs::write(&empty, b"").unwrap();
    assert!(engine.exclusions.classify(&empty).is_some());

    // Unreadable metadata gets the same transient treatment.
    assert!(engine
        .exclusions
        .classify(&root.join("does_not_exist.bin"))
        .is_some());

    fs::write(&empty, b"now it has content").unwrap();
    assert!(engine.exclusions.classify(&empty).is_none());
}

// ─── 10. Sidecar parity under mixed traffic ─────────────────────────────────

#[test]
fn every_vault_artefact_has_a_matching_sidecar() {
    let root = test_root("sidecar_parity");
    let engine = engine_at(&root, EngineConfig::default());
    let capture = CaptureEngine::new(engine.clone());

    for i in 0..5 {
        let victim = files_dir(&root).join(format!("file_{i}.bin"));
        fs::write(&victim, format!("content number {i}")).unwrap();
        match capture.capture(&victim, VaultEvent::Created) {
            CaptureOutcome::Captured { .. } => {}
            other => panic!("expected capture, got {other:?}"),
        }
    }

    let mut artefacts = 0;
    let mut sidecars = 0;
    for entry in fs::read_dir(engine.layout.vault_dir()).unwrap().flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".vaulted") {
            artefacts += 1;
            // The matching sidecar must exist with the same stem.
            assert!(entry
                .path()
                .with_file_name(format!("{name}.meta"))
                .exists());
        } else if name.ends_with(".vaulted.meta") {
            sidecars += 1;
        }
    }
    assert_eq!(artefacts, 5);
    assert_eq!(sidecars, 5);

    // Vault names embed the 16-hex path hash.
    let sample = fs::read_dir(engine.layout.vault_dir())
        .unwrap()
        .flatten()
        .find(|e| e.file_name().to_string_lossy().ends_with(".vaulted"))
        .unwrap();
    let name = sample.file_name().to_string_lossy().to_string();
    let hash_part = name
        .trim_end_matches(".vaulted")
        .rsplit("__")
        .next()
        .unwrap()
        .to_string();
    assert_eq!(hash_part.len(), 16);
    let _ = fsutil::sha256_file(&sample.path()).unwrap();
}
