//! Signature store.
//!
//! Offline-first: local `.rule` files under `assets/rules/<category>/` are
//! compiled at startup; a non-empty local set makes the store ready
//! immediately and remote sync runs in the background. An empty local set
//! forces one synchronous remote fetch; if that also fails the store is
//! degraded and scanning becomes a NO_RULES pass-through.
//!
//! The compiled handle is one Aho-Corasick automaton over every valid rule
//! pattern, held behind `RwLock<Option<Arc<..>>>` and replaced atomically
//! after each merge. Readers clone the `Arc` and never block a swap.

mod sync;

pub use sync::MergeReport;

use aho_corasick::AhoCorasick;
use anyhow::{anyhow, Context, Result};
use parking_lot::RwLock;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use vwar_core::config::Endpoints;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    Ready,
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanVerdict {
    Match(String),
    NoMatch,
}

/// One compiled, immutable rule set.
pub struct CompiledRules {
    automaton: AhoCorasick,
    names: Vec<String>,
}

impl CompiledRules {
    pub fn rule_count(&self) -> usize {
        self.names.len()
    }

    /// Stream the file through the automaton. The deadline bounds total
    /// scan time; hitting it surfaces as a `TimedOut` I/O error.
    pub fn scan_file(&self, path: &Path, timeout: Duration) -> io::Result<ScanVerdict> {
        let file = fs::File::open(path)?;
        let reader = DeadlineReader {
            inner: io::BufReader::new(file),
            deadline: Instant::now() + timeout,
        };
        match self.automaton.stream_find_iter(reader).next() {
            Some(Ok(mat)) => {
                let name = self
                    .names
                    .get(mat.pattern().as_usize())
                    .cloned()
                    .unwrap_or_else(|| "unknown_rule".to_string());
                Ok(ScanVerdict::Match(name))
            }
            Some(Err(e)) => Err(e),
            None => Ok(ScanVerdict::NoMatch),
        }
    }
}

struct DeadlineReader<R> {
    inner: R,
    deadline: Instant,
}

impl<R: Read> Read for DeadlineReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if Instant::now() >= self.deadline {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "rule match deadline exceeded",
            ));
        }
        self.inner.read(buf)
    }
}

pub struct SignatureStore {
    rules_dir: PathBuf,
    endpoints: Endpoints,
    match_timeout: Duration,
    handle: RwLock<Option<Arc<CompiledRules>>>,
    state: RwLock<StoreState>,
}

impl SignatureStore {
    pub fn new(rules_dir: PathBuf, endpoints: Endpoints, match_timeout: Duration) -> Self {
        Self {
            rules_dir,
            endpoints,
            match_timeout,
            handle: RwLock::new(None),
            state: RwLock::new(StoreState::Degraded),
        }
    }

    pub fn match_timeout(&self) -> Duration {
        self.match_timeout
    }

    pub fn state(&self) -> StoreState {
        *self.state.read()
    }

    /// Current compiled handle, if any rules are loaded.
    pub fn compiled(&self) -> Option<Arc<CompiledRules>> {
        self.handle.read().clone()
    }

    pub fn rule_count(&self) -> usize {
        self.compiled().map(|r| r.rule_count()).unwrap_or(0)
    }

    /// Enumerate and compile the local rule set, swapping the handle on
    /// success. Rules that fail to compile individually are skipped with a
    /// warning; they never poison the set.
    pub fn load_local(&self) -> Result<usize> {
        let mut names = Vec::new();
        let mut patterns: Vec<Vec<u8>> = Vec::new();
        let mut failed = 0usize;

        for entry in WalkDir::new(&self.rules_dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("rule") {
                continue;
            }
            match Self::read_pattern(path) {
                Ok(pattern) => {
                    let name = path
                        .file_stem()
                        .map(|s| s.to_string_lossy().to_string())
                        .unwrap_or_else(|| "unknown_rule".to_string());
                    names.push(name);
                    patterns.push(pattern);
                }
                Err(e) => {
                    failed += 1;
                    warn!(path = %path.display(), error = %e, "skipping invalid rule file");
                }
            }
        }

        if patterns.is_empty() {
            *self.handle.write() = None;
            *self.state.write() = StoreState::Degraded;
            if failed > 0 {
                warn!(failed, "no valid rules compiled");
            }
            return Ok(0);
        }

        let automaton = AhoCorasick::new(&patterns)
            .map_err(|e| anyhow!("rule set compile failed: {e}"))?;
        let count = names.len();
        *self.handle.write() = Some(Arc::new(CompiledRules { automaton, names }));
        *self.state.write() = StoreState::Ready;
        info!(rules = count, failed, "signature set compiled");
        Ok(count)
    }

    /// Per-rule validation: the pattern must be non-empty and individually
    /// compilable.
    fn read_pattern(path: &Path) -> Result<Vec<u8>> {
        let raw = fs::read(path).with_context(|| format!("read {}", path.display()))?;
        let trimmed = trim_ascii(&raw);
        if trimmed.is_empty() {
            return Err(anyhow!("empty rule pattern"));
        }
        AhoCorasick::new([trimmed]).map_err(|e| anyhow!("pattern compile: {e}"))?;
        Ok(trimmed.to_vec())
    }

    /// Startup sequence: local-first, remote sync in the background when the
    /// local set is usable, synchronous remote fetch when it is not.
    pub async fn startup(self: Arc<Self>, client: reqwest::Client) {
        match self.load_local() {
            Ok(count) if count > 0 => {
                info!(rules = count, "signature store ready (local set)");
                let store = self.clone();
                tokio::spawn(async move {
                    match store.fetch_and_merge(&client).await {
                        Ok(report) => {
                            info!(added = report.added, updated = report.updated, "signature sync complete")
                        }
                        Err(e) => debug!(error = %e, "signature sync skipped"),
                    }
                });
            }
            _ => match self.fetch_and_merge(&client).await {
                Ok(_) if self.rule_count() > 0 => {
                    info!(rules = self.rule_count(), "signature store ready (remote fetch)");
                }
                Ok(_) => {
                    warn!("no signature rules available; scanning degrades to NO_RULES");
                }
                Err(e) => {
                    debug!(error = %e, "remote rule fetch failed");
                    warn!("no signature rules available; scanning degrades to NO_RULES");
                }
            },
        }
    }

    /// Incremental remote sync; see `sync.rs`.
    pub async fn fetch_and_merge(&self, client: &reqwest::Client) -> Result<MergeReport> {
        let report = sync::fetch_and_merge(client, &self.endpoints, &self.rules_dir).await?;
        if report.added > 0 || report.updated > 0 || self.rule_count() == 0 {
            self.load_local()?;
        }
        Ok(report)
    }

    /// Upload one rule to the shared library.
    pub async fn insert_rule(
        &self,
        client: &reqwest::Client,
        category: &str,
        rule: &str,
        strings: &str,
    ) -> Result<bool> {
        sync::insert_rule(client, &self.endpoints, category, rule, strings).await
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_rule(dir: &Path, category: &str, name: &str, pattern: &str) {
        let cat = dir.join(category);
        fs::create_dir_all(&cat).unwrap();
        let mut f = fs::File::create(cat.join(format!("{name}.rule"))).unwrap();
        write!(f, "{pattern}").unwrap();
    }

    fn store_in(dir: &Path) -> SignatureStore {
        SignatureStore::new(
            dir.to_path_buf(),
            Endpoints::default(),
            Duration::from_secs(60),
        )
    }

    #[test]
    fn empty_rules_dir_is_degraded() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        assert_eq!(store.load_local().unwrap(), 0);
        assert_eq!(store.state(), StoreState::Degraded);
        assert!(store.compiled().is_none());
    }

    #[test]
    fn local_rules_compile_and_match() {
        let dir = tempdir().unwrap();
        write_rule(dir.path(), "test", "eicar_test", "EICAR-STANDARD-ANTIVIRUS-TEST-FILE");
        let store = store_in(dir.path());
        assert_eq!(store.load_local().unwrap(), 1);
        assert_eq!(store.state(), StoreState::Ready);

        let target = dir.path().join("sample.com");
        fs::write(
            &target,
            b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR-STANDARD-ANTIVIRUS-TEST-FILE!$H+H*",
        )
        .unwrap();
        let rules = store.compiled().unwrap();
        let verdict = rules.scan_file(&target, Duration::from_secs(60)).unwrap();
        assert_eq!(verdict, ScanVerdict::Match("eicar_test".into()));
    }

    #[test]
    fn clean_file_is_no_match() {
        let dir = tempdir().unwrap();
        write_rule(dir.path(), "test", "marker", "NEVER-PRESENT-PATTERN");
        let store = store_in(dir.path());
        store.load_local().unwrap();
        let target = dir.path().join("clean.txt");
        fs::write(&target, b"perfectly ordinary bytes").unwrap();
        let rules = store.compiled().unwrap();
        assert_eq!(
            rules.scan_file(&target, Duration::from_secs(60)).unwrap(),
            ScanVerdict::NoMatch
        );
    }

    #[test]
    fn invalid_rules_are_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        write_rule(dir.path(), "test", "good", "VALID-PATTERN");
        write_rule(dir.path(), "test", "empty", "   ");
        let store = store_in(dir.path());
        assert_eq!(store.load_local().unwrap(), 1);
        assert_eq!(store.rule_count(), 1);
    }

    #[test]
    fn deadline_reader_times_out() {
        let dir = tempdir().unwrap();
        write_rule(dir.path(), "test", "r", "PATTERN");
        let store = store_in(dir.path());
        store.load_local().unwrap();
        let target = dir.path().join("big.bin");
        fs::write(&target, vec![0u8; 1024 * 1024]).unwrap();
        let rules = store.compiled().unwrap();
        let err = rules
            .scan_file(&target, Duration::from_secs(0))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
