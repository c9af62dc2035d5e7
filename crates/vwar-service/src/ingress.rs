//! Event ingress.
//!
//! The only coupling between the change-event source and the processor is
//! the persistent queue: ingress classifies, drops exclusions at DEBUG,
//! appends everything else, and never blocks on scanning.

use crate::engine::Engine;
use crate::monitor::ChangeRecord;
use std::path::PathBuf;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;
use vwar_core::meta::VaultEvent;

const POLL: Duration = Duration::from_millis(500);

pub fn spawn_ingress(
    engine: Arc<Engine>,
    rx: Receiver<ChangeRecord>,
    shutdown: watch::Receiver<bool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("event-ingress".into())
        .spawn(move || {
            while !*shutdown.borrow() {
                let record = match rx.recv_timeout(POLL) {
                    Ok(record) => record,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                let path = PathBuf::from(&record.path);

                if let Some(reason) = engine.exclusions.classify(&path) {
                    debug!(
                        path = %path.display(),
                        reason = reason.status(),
                        "excluded change event dropped"
                    );
                    continue;
                }

                let event = match record.event_type.as_str() {
                    "modified" => VaultEvent::Modified,
                    _ => VaultEvent::Created,
                };
                if engine.queue.add(&path, event) {
                    debug!(path = %path.display(), "queued for processing");
                    engine.emit_queue_size();
                }
            }
            debug!("event ingress stopped");
        })
        .expect("spawn event ingress thread")
}
