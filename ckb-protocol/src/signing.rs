//! HMAC-SHA256 payload signing for outbound webhook deliveries (spec §6.2,
//! §6.4, §9 "the HMAC routine used").

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Deterministic function of `(body, secret)` — spec §8 property 11.
/// Returns the header value form `sha256=<hex>`.
pub fn sign_payload(body: &[u8], secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic() {
        let a = sign_payload(b"hello world", "shh");
        let b = sign_payload(b"hello world", "shh");
        assert_eq!(a, b);
    }

    #[test]
    fn signature_changes_with_body_or_secret() {
        let base = sign_payload(b"hello world", "shh");
        assert_ne!(base, sign_payload(b"hello there", "shh"));
        assert_ne!(base, sign_payload(b"hello world", "other"));
    }

    #[test]
    fn signature_has_expected_prefix_and_length() {
        let sig = sign_payload(b"payload", "secret");
        assert!(sig.starts_with("sha256="));
        assert_eq!(sig.len(), "sha256=".len() + 64);
    }
}
