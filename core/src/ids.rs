//! Id and token minting helpers.
//!
//! Wire message ids are time-ordered UUIDv7; entity ids are short prefixed
//! hex; view tokens are opaque url-safe strings.

use base64::Engine as _;
use rand::RngCore;
use uuid::Uuid;

/// Returns a UUIDv7 string (time-ordered).
pub fn uuidv7() -> String {
    Uuid::now_v7().to_string()
}

/// Returns a UUIDv7 string with a prefix, e.g. `trace_0190...`.
pub fn uuidv7_prefixed(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::now_v7())
}

/// Returns a pure random UUIDv4 string.
pub fn uuidv4() -> String {
    Uuid::new_v4().to_string()
}

/// Returns a short id built from 12 hex chars of a UUIDv4, optionally prefixed.
pub fn uuid_12(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}{}", &hex[..12])
}

/// Returns a compact opaque token for URLs/cookies: `nbytes` of randomness,
/// base64url without padding.
pub fn short_token(nbytes: usize) -> String {
    let mut buf = vec![0u8; nbytes];
    rand::thread_rng().fill_bytes(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uuid_12_has_prefix_and_length() {
        let id = uuid_12("ms_");
        assert!(id.starts_with("ms_"));
        assert_eq!(id.len(), 3 + 12);
    }

    #[test]
    fn uuidv7_is_time_ordered() {
        let a = uuidv7();
        let b = uuidv7();
        assert!(a < b);
    }

    #[test]
    fn short_token_is_urlsafe() {
        let token = short_token(24);
        assert!(!token.contains('='));
        assert!(!token.contains('+'));
        assert!(!token.contains('/'));
        // 24 bytes -> 32 base64url chars
        assert_eq!(token.len(), 32);
    }
}
