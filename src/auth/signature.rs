//! Signature Verifier (component A): HMAC-SHA256 request signing and
//! constant-time verification, plus timestamp freshness.
//!
//! Pure functions, no I/O, never panic on malformed input — invalid inputs
//! return `false`, not an error.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Default timestamp skew tolerance, in seconds.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Canonicalise a request as `timestamp\nMETHOD\npath\nsha256hex(body)` and
/// return `HMAC-SHA256(secret, canonical)` as lowercase hex.
pub fn sign(method: &str, path: &str, body: &[u8], timestamp: &str, secret: &str) -> String {
    let canonical = canonical_string(method, path, body, timestamp);
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(canonical.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

fn canonical_string(method: &str, path: &str, body: &[u8], timestamp: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let body_hash = hex::encode(hasher.finalize());
    format!(
        "{timestamp}\n{}\n{path}\n{body_hash}",
        method.to_ascii_uppercase()
    )
}

/// Recompute the expected signature and compare against `signature` in
/// constant time. Returns `false` on length mismatch, malformed hex, or an
/// actual mismatch — never panics, never raises.
pub fn verify(
    method: &str,
    path: &str,
    body: &[u8],
    timestamp: &str,
    secret: &str,
    signature: &str,
) -> bool {
    let Ok(given) = hex::decode(signature) else {
        return false;
    };
    let expected_hex = sign(method, path, body, timestamp, secret);
    let Ok(expected) = hex::decode(&expected_hex) else {
        return false;
    };
    if given.len() != expected.len() {
        return false;
    }
    given.ct_eq(&expected).into()
}

/// Accepts an absolute difference between `ts` and wall-clock seconds that is
/// within `tolerance`. `ts` must parse as an integer; non-numeric input is
/// handled by the caller (this just compares two `i64`s).
pub fn timestamp_fresh(ts: i64, now: i64, tolerance: i64) -> bool {
    (now - ts).abs() <= tolerance
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_own_signature() {
        let sig = sign("POST", "/projects", b"{}", "1700000000", "secret");
        assert!(verify(
            "POST",
            "/projects",
            b"{}",
            "1700000000",
            "secret",
            &sig
        ));
    }

    #[test]
    fn verify_rejects_tampered_method() {
        let sig = sign("POST", "/projects", b"{}", "1700000000", "secret");
        assert!(!verify(
            "DELETE",
            "/projects",
            b"{}",
            "1700000000",
            "secret",
            &sig
        ));
    }

    #[test]
    fn verify_rejects_tampered_path() {
        let sig = sign("POST", "/projects", b"{}", "1700000000", "secret");
        assert!(!verify(
            "POST",
            "/projects/evil",
            b"{}",
            "1700000000",
            "secret",
            &sig
        ));
    }

    #[test]
    fn verify_rejects_tampered_body() {
        let sig = sign("POST", "/projects", b"{}", "1700000000", "secret");
        assert!(!verify(
            "POST",
            "/projects",
            b"{\"x\":1}",
            "1700000000",
            "secret",
            &sig
        ));
    }

    #[test]
    fn verify_rejects_tampered_timestamp() {
        let sig = sign("POST", "/projects", b"{}", "1700000000", "secret");
        assert!(!verify(
            "POST",
            "/projects",
            b"{}",
            "1700000001",
            "secret",
            &sig
        ));
    }

    #[test]
    fn verify_rejects_wrong_secret() {
        let sig = sign("POST", "/projects", b"{}", "1700000000", "secret");
        assert!(!verify(
            "POST",
            "/projects",
            b"{}",
            "1700000000",
            "wrong",
            &sig
        ));
    }

    #[test]
    fn verify_rejects_malformed_hex() {
        assert!(!verify(
            "POST",
            "/projects",
            b"{}",
            "1700000000",
            "secret",
            "not-hex-zz"
        ));
    }

    #[test]
    fn verify_rejects_truncated_signature() {
        let sig = sign("POST", "/projects", b"{}", "1700000000", "secret");
        assert!(!verify(
            "POST",
            "/projects",
            b"{}",
            "1700000000",
            "secret",
            &sig[..10]
        ));
    }

    #[test]
    fn timestamp_fresh_within_tolerance() {
        assert!(timestamp_fresh(1_000_000, 1_000_100, 300));
        assert!(timestamp_fresh(1_000_000, 999_900, 300));
    }

    #[test]
    fn timestamp_fresh_exactly_at_boundary() {
        assert!(timestamp_fresh(1_000_000, 1_000_300, 300));
    }

    #[test]
    fn timestamp_fresh_expired() {
        assert!(!timestamp_fresh(1_000_000, 1_000_601, 300));
        assert!(!timestamp_fresh(1_000_000, 999_399, 300));
    }
}
