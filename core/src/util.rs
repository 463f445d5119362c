//! Small shared helpers: clocks, hashing, constant-time compare.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Instant;

use sha2::{Digest, Sha256};

/// Wall-clock unix time in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Wall-clock unix time in seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

/// UTC timestamp in RFC3339 with millisecond precision, `Z` suffix.
pub fn utc_now_iso() -> String {
    chrono::Utc::now()
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Monotonic milliseconds since process start. Stable across wall-clock
/// adjustments; used for wire `ts` and heartbeat bookkeeping.
pub fn now_monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// SHA-256 hex digest of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Constant-time equality for secrets (view tokens). Compares every byte
/// regardless of where the first mismatch occurs.
pub fn timing_safe_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// POSIX-style relative path string from `base` to `path`. Falls back to the
/// absolute path when `path` is not under `base`.
pub fn to_rel_path(base: &Path, path: &Path) -> String {
    match path.strip_prefix(base) {
        Ok(rel) => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => path.to_string_lossy().replace('\\', "/"),
    }
}
