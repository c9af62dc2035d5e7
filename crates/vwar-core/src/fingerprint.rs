//! Capture fingerprints.
//!
//! The dedup signature distinguishes rapid repeat downloads of the same
//! bytes at the same path from genuinely new content: size, nanosecond
//! mtime, a prefix hash of the first 64 KiB and a hash of the normalized
//! path all feed the final digest.

use crate::paths;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::UNIX_EPOCH;

const HEAD_SAMPLE: usize = 64 * 1024;

fn hex_sha256(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Hash of the first 64 KiB of content, truncated to 16 hex chars.
/// Unreadable files collapse to a zero sentinel so the signature stays
/// stable across transient locks.
fn first64k_hash(path: &Path) -> String {
    let mut buf = vec![0u8; HEAD_SAMPLE];
    let read = File::open(path).and_then(|mut f| f.read(&mut buf));
    match read {
        Ok(n) => hex_sha256(&buf[..n])[..16].to_string(),
        Err(_) => "0".repeat(16),
    }
}

/// 32-hex-char capture signature:
/// `sha256(size | mtime_ns | sha256(first64k)[:16] | sha256(norm_path)[:12])[:32]`.
pub fn capture_signature(path: &Path) -> String {
    let (size, mtime_ns): (i64, u128) = match std::fs::metadata(path) {
        Ok(meta) => {
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            (meta.len() as i64, mtime)
        }
        Err(_) => (-1, 0),
    };
    let norm = paths::normalize_for_compare(path);
    let path_hash = hex_sha256(norm.as_bytes());
    let head_hash = first64k_hash(path);
    let raw = format!("{size}|{mtime_ns}|{head_hash}|{}", &path_hash[..12]);
    hex_sha256(raw.as_bytes())[..32].to_string()
}

/// 16-hex-char hash of the case-preserved normalized path; used in vault
/// and quarantine artefact names.
pub fn path_hash16(path: &Path) -> String {
    let norm = paths::normalize_preserve_case(path);
    hex_sha256(norm.as_bytes())[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn signature_is_32_hex() {
        let dir = tempdir().unwrap();
        let p = dir.path().join("file.bin");
        std::fs::File::create(&p)
            .unwrap()
            .write_all(b"hello")
            .unwrap();
        let sig = capture_signature(&p);
        assert_eq!(sig.len(), 32);
        assert!(sig.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn signature_stable_for_unchanged_file() {
        let dir = tempdir().unwrap();
        let p = dir.path().join("file.bin");
        std::fs::File::create(&p)
            .unwrap()
            .write_all(b"same content")
            .unwrap();
        assert_eq!(capture_signature(&p), capture_signature(&p));
    }

    #[test]
    fn distinct_paths_get_distinct_signatures() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.bin");
        let b = dir.path().join("b.bin");
        for p in [&a, &b] {
            std::fs::File::create(p)
                .unwrap()
                .write_all(b"identical bytes")
                .unwrap();
        }
        assert_ne!(capture_signature(&a), capture_signature(&b));
    }

    #[test]
    fn missing_file_yields_sentinel_signature() {
        let dir = tempdir().unwrap();
        let gone = dir.path().join("gone.bin");
        let sig = capture_signature(&gone);
        assert_eq!(sig.len(), 32);
    }

    #[test]
    fn path_hash_is_16_hex() {
        let h = path_hash16(std::path::Path::new("/home/u/Downloads/Report.PDF"));
        assert_eq!(h.len(), 16);
    }
}
