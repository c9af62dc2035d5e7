//! Persistent sequential processing queue.
//!
//! One JSON array on disk, rewritten wholesale through a temp file and an
//! atomic rename on every mutation. An in-process lock serializes writers;
//! identity is the lowercase normalized path, unique across all
//! non-terminal entries. The single consumer guarantees at most one item in
//! `processing` at a time.

use crate::meta::VaultEvent;
use crate::paths;
use chrono::Local;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub original_path: String,
    pub path_normalized: String,
    pub event_type: VaultEvent,
    pub queued_at: String,
    pub status: QueueStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_started: Option<String>,
}

pub struct ScanQueue {
    path: PathBuf,
    max_size: usize,
    lock: Mutex<()>,
}

impl ScanQueue {
    pub fn new<P: AsRef<Path>>(path: P, max_size: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_size,
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> Vec<QueueItem> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }

    fn save(&self, items: &[QueueItem]) {
        let tmp = self.path.with_extension("json.tmp");
        let write = serde_json::to_string_pretty(items)
            .map_err(anyhow::Error::from)
            .and_then(|raw| {
                fs::write(&tmp, raw)?;
                fs::rename(&tmp, &self.path)?;
                Ok(())
            });
        if let Err(e) = write {
            warn!(path = %self.path.display(), error = %e, "queue save failed");
        }
    }

    /// Append a path. Returns false when the path is already queued or the
    /// queue is at capacity.
    pub fn add(&self, path: &Path, event: VaultEvent) -> bool {
        let _g = self.lock.lock();
        let mut items = self.load();
        let normalized = paths::normalize_for_compare(path);
        if items.iter().any(|i| i.path_normalized == normalized) {
            return false;
        }
        if items.len() >= self.max_size {
            warn!(
                pending = items.len(),
                max = self.max_size,
                "queue at capacity, dropping append"
            );
            return false;
        }
        items.push(QueueItem {
            original_path: paths::normalize_preserve_case(path),
            path_normalized: normalized,
            event_type: event,
            queued_at: Local::now().to_rfc3339(),
            status: QueueStatus::Pending,
            processing_started: None,
        });
        self.save(&items);
        true
    }

    pub fn is_in_queue(&self, path: &Path) -> bool {
        let _g = self.lock.lock();
        let normalized = paths::normalize_for_compare(path);
        self.load().iter().any(|i| i.path_normalized == normalized)
    }

    /// First pending item in FIFO order, without removing it.
    pub fn get_next_pending(&self) -> Option<QueueItem> {
        let _g = self.lock.lock();
        self.load()
            .into_iter()
            .find(|i| i.status == QueueStatus::Pending)
    }

    pub fn mark_processing(&self, path: &Path) {
        let _g = self.lock.lock();
        let mut items = self.load();
        let normalized = paths::normalize_for_compare(path);
        if let Some(item) = items.iter_mut().find(|i| i.path_normalized == normalized) {
            item.status = QueueStatus::Processing;
            item.processing_started = Some(Local::now().to_rfc3339());
            self.save(&items);
        }
    }

    /// Terminal: the item is removed outright. A later `add` of the same
    /// path starts fresh at the tail.
    pub fn mark_completed(&self, path: &Path) {
        let _g = self.lock.lock();
        let normalized = paths::normalize_for_compare(path);
        let mut items = self.load();
        items.retain(|i| i.path_normalized != normalized);
        self.save(&items);
    }

    pub fn clear(&self) {
        let _g = self.lock.lock();
        self.save(&[]);
    }

    pub fn pending_count(&self) -> usize {
        let _g = self.lock.lock();
        self.load()
            .iter()
            .filter(|i| i.status == QueueStatus::Pending)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn queue_in(dir: &Path) -> ScanQueue {
        ScanQueue::new(dir.join("scanvault_queue.json"), 500)
    }

    #[test]
    fn add_dedupes_on_normalized_path() {
        let dir = tempdir().unwrap();
        let q = queue_in(dir.path());
        assert!(q.add(Path::new("/home/u/Downloads/A.bin"), VaultEvent::Created));
        assert!(!q.add(Path::new("/home/u/downloads/a.BIN"), VaultEvent::Modified));
        assert_eq!(q.pending_count(), 1);
    }

    #[test]
    fn fifo_order_and_completion() {
        let dir = tempdir().unwrap();
        let q = queue_in(dir.path());
        q.add(Path::new("/a/first"), VaultEvent::Created);
        q.add(Path::new("/a/second"), VaultEvent::Created);

        let next = q.get_next_pending().unwrap();
        assert_eq!(next.original_path, "/a/first");
        q.mark_processing(Path::new("/a/first"));

        // Still FIFO: the processing item no longer shows as pending.
        let next = q.get_next_pending().unwrap();
        assert_eq!(next.original_path, "/a/second");

        q.mark_completed(Path::new("/a/first"));
        assert!(!q.is_in_queue(Path::new("/a/first")));
        assert_eq!(q.pending_count(), 1);
    }

    #[test]
    fn re_add_after_completion_goes_to_tail() {
        let dir = tempdir().unwrap();
        let q = queue_in(dir.path());
        q.add(Path::new("/a/x"), VaultEvent::Created);
        q.add(Path::new("/a/y"), VaultEvent::Created);
        q.mark_completed(Path::new("/a/x"));
        assert!(q.add(Path::new("/a/x"), VaultEvent::RateLimitRetry));
        let first = q.get_next_pending().unwrap();
        assert_eq!(first.original_path, "/a/y");
    }

    #[test]
    fn survives_reopen() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("scanvault_queue.json");
        {
            let q = ScanQueue::new(&file, 500);
            q.add(Path::new("/a/persist"), VaultEvent::Created);
        }
        let q = ScanQueue::new(&file, 500);
        assert_eq!(q.pending_count(), 1);
        assert!(q.is_in_queue(Path::new("/a/persist")));
    }

    #[test]
    fn capacity_cap_refuses_appends() {
        let dir = tempdir().unwrap();
        let q = ScanQueue::new(dir.path().join("q.json"), 2);
        assert!(q.add(Path::new("/a/1"), VaultEvent::Created));
        assert!(q.add(Path::new("/a/2"), VaultEvent::Created));
        assert!(!q.add(Path::new("/a/3"), VaultEvent::Created));
    }

    #[test]
    fn at_most_one_processing() {
        let dir = tempdir().unwrap();
        let q = queue_in(dir.path());
        q.add(Path::new("/a/1"), VaultEvent::Created);
        q.add(Path::new("/a/2"), VaultEvent::Created);
        q.mark_processing(Path::new("/a/1"));
        let processing: Vec<_> = q
            .load()
            .into_iter()
            .filter(|i| i.status == QueueStatus::Processing)
            .collect();
        assert_eq!(processing.len(), 1);
    }
}
