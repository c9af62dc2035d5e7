//! The engine value.
//!
//! One `Engine` is created by `main` at startup and threaded into every
//! subsystem; all shared state lives here. The UI is external and receives
//! typed events over a bounded broadcast channel it drains on its own
//! cadence; the core never blocks on it and has no UI type dependencies.

use crate::detector::InstallationDetector;
use crate::enforcement::quarantine::QuarantineStore;
use crate::notifications::Notifier;
use crate::signatures::SignatureStore;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use vwar_core::config::EngineConfig;
use vwar_core::exclusions::ExclusionResolver;
use vwar_core::logchan::LogChannels;
use vwar_core::paths::Layout;
use vwar_core::queue::ScanQueue;
use vwar_core::telemetry::Telemetry;

const UI_CHANNEL_CAPACITY: usize = 256;

/// Messages delivered to the external view layer.
#[derive(Debug, Clone)]
pub enum UiEvent {
    FileQuarantined { path: String, rules: Vec<String> },
    FileClean { path: String },
    FileRestored { path: String },
    DuplicateSuppressed { path: String },
    InstallationDetected { name: String, pid: u32 },
    LicenseValid,
    LicenseInvalid { reason: String },
    ExpiryWarning { days: i64 },
    QueueSizeChanged { pending: usize },
}

pub struct Engine {
    pub config: EngineConfig,
    pub layout: Layout,
    pub logs: Arc<LogChannels>,
    pub telemetry: Arc<Telemetry>,
    pub queue: ScanQueue,
    pub exclusions: ExclusionResolver,
    pub signatures: Arc<SignatureStore>,
    pub quarantine: QuarantineStore,
    pub detector: Arc<InstallationDetector>,
    pub notifier: Notifier,
    ui_tx: broadcast::Sender<UiEvent>,
}

impl Engine {
    pub fn bootstrap(layout: Layout, config: EngineConfig) -> Result<Arc<Self>> {
        Self::bootstrap_with_notifier(layout, config, Notifier::new())
    }

    /// Used by tests and headless deployments to silence toasts.
    pub fn bootstrap_with_notifier(
        layout: Layout,
        config: EngineConfig,
        notifier: Notifier,
    ) -> Result<Arc<Self>> {
        layout.ensure()?;
        let logs = Arc::new(LogChannels::open(&layout));
        let telemetry = Arc::new(Telemetry::new());
        let (ui_tx, _) = broadcast::channel(UI_CHANNEL_CAPACITY);

        let queue = ScanQueue::new(layout.queue_file(), config.max_queue_size);
        let exclusions = ExclusionResolver::new(&layout);
        let signatures = Arc::new(SignatureStore::new(
            layout.rules_dir(),
            config.endpoints.clone(),
            Duration::from_secs(config.rule_match_timeout_secs),
        ));
        let quarantine = QuarantineStore::new(
            layout.quarantine_dir(),
            config.max_quarantine_files,
            config.max_quarantine_size_mb,
            logs.clone(),
            telemetry.clone(),
        );
        let detector = Arc::new(InstallationDetector::new(
            logs.clone(),
            notifier.clone(),
            ui_tx.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            layout,
            logs,
            telemetry,
            queue,
            exclusions,
            signatures,
            quarantine,
            detector,
            notifier,
            ui_tx,
        }))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.ui_tx.subscribe()
    }

    /// Best-effort: nobody listening is fine.
    pub fn emit(&self, event: UiEvent) {
        let _ = self.ui_tx.send(event);
    }

    pub fn emit_queue_size(&self) {
        let pending = self.queue.pending_count();
        self.emit(UiEvent::QueueSizeChanged { pending });
    }
}
