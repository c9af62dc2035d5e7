use std::path::PathBuf;
use thiserror::Error;

/// Error kinds surfaced by the capture/scan/route core.
///
/// Expected admission-control outcomes are deliberately not errors:
/// duplicates, rate limiting and the installation-mode short-circuit are
/// tagged capture outcomes, and exclusion skips are scan statuses. The
/// variants here are conditions callers must route on or report.
#[derive(Debug, Error)]
pub enum VwarError {
    #[error("move failed after {attempts} attempts: {source_path}")]
    MoveRetryExhausted {
        source_path: PathBuf,
        attempts: u32,
    },

    #[error("quarantine failed for {path}: {reason}")]
    QuarantineFailed { path: PathBuf, reason: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("license cache is stale")]
    CacheStale,

    #[error("activation record corrupt: {0}")]
    ActivationCorrupt(String),

    #[error("activation lock not acquired within {0} seconds")]
    ActivationLockTimeout(u64),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
