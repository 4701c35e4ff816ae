//! HMAC-SHA256 webhook signatures.
//!
//! The signed string is `"<unix seconds>.<json body>"`; the header value is
//! `sha256=<lowercase hex>`. Receivers recompute it with the shared secret
//! and reject stale timestamps.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Event name header.
pub const HEADER_EVENT: &str = "X-Ads-Event";
/// Unix-seconds timestamp header, part of the signed string.
pub const HEADER_TIMESTAMP: &str = "X-Ads-Timestamp";
/// Stable per logical event across retries.
pub const HEADER_IDEMPOTENCY_KEY: &str = "Idempotency-Key";
/// `sha256=<hex>` signature header.
pub const HEADER_SIGNATURE: &str = "X-Ads-Signature";

/// Signs `body` sent at `timestamp`.
#[must_use]
pub fn sign(secret: &str, timestamp: i64, body: &str) -> String {
    // HMAC accepts keys of any length, new_from_slice cannot fail here
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

/// Checks a signature header in constant time.
#[must_use]
pub fn verify(secret: &str, timestamp: i64, body: &str, signature: &str) -> bool {
    let Some(hex_sig) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_has_prefix_and_hex_digest() {
        let sig = sign("s3cret", 1_700_000_000, r#"{"event":"ads.ad.started"}"#);
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
    }

    #[test]
    fn sign_and_verify_agree() {
        let sig = sign("key", 1, "{}");
        assert!(verify("key", 1, "{}", &sig));
    }

    #[test]
    fn verify_rejects_tampering() {
        let body = r#"{"roomId":"r"}"#;
        let sig = sign("s3cret", 42, body);
        assert!(verify("s3cret", 42, body, &sig));
        assert!(!verify("s3cret", 43, body, &sig));
        assert!(!verify("other", 42, body, &sig));
        assert!(!verify("s3cret", 42, r#"{"roomId":"x"}"#, &sig));
        assert!(!verify("s3cret", 42, body, "sha1=abc"));
    }
}
