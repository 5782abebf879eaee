//! The intra-service HMAC signing envelope.
//!
//! Canonical string: `method\npath\nhex(sha256(body))\nissued_at\nnonce\ntrace_id`.
//! Signature: `hex(HMAC-SHA256(canonical, secret))`. Verification is
//! constant-time and tolerates a rotation window (current OR previous
//! secret) plus a configurable clock skew on `issued_at`.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::hash::sha256_hex;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Debug)]
pub struct SigningEnvelope<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub body: &'a [u8],
    pub issued_at: i64,
    pub nonce: &'a str,
    pub trace_id: &'a str,
}

impl<'a> SigningEnvelope<'a> {
    pub fn canonical_string(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            self.method,
            self.path,
            sha256_hex(self.body),
            self.issued_at,
            self.nonce,
            self.trace_id,
        )
    }
}

/// Sign `envelope` with `secret`, returning hex-encoded HMAC-SHA256.
pub fn sign_hmac_sha256(envelope: &SigningEnvelope<'_>, secret: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(envelope.canonical_string().as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify `signature_hex` against `envelope` under `secret`, constant-time.
fn verify_one(envelope: &SigningEnvelope<'_>, secret: &[u8], signature_hex: &str) -> bool {
    let Ok(given) = hex::decode(signature_hex) else {
        return false;
    };
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(envelope.canonical_string().as_bytes());
    let expected = mac.finalize().into_bytes();
    expected.as_slice().ct_eq(&given).into()
}

/// Verify a signed request, accepting either the current secret or (during a
/// rotation window) the previous one, and rejecting requests whose
/// `issued_at` falls outside `now ± skew_secs`.
pub fn verify_hmac_request(
    envelope: &SigningEnvelope<'_>,
    signature_hex: &str,
    current_secret: &[u8],
    previous_secret: Option<&[u8]>,
    now: i64,
    skew_secs: i64,
) -> bool {
    if (envelope.issued_at - now).abs() > skew_secs {
        return false;
    }
    if verify_one(envelope, current_secret, signature_hex) {
        return true;
    }
    if let Some(prev) = previous_secret {
        return verify_one(envelope, prev, signature_hex);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(issued_at: i64) -> SigningEnvelope<'static> {
        SigningEnvelope {
            method: "POST",
            path: "/v1/complete",
            body: b"{}",
            issued_at,
            nonce: "abc123",
            trace_id: "trace-1",
        }
    }

    #[test]
    fn round_trip_sign_and_verify() {
        let env = envelope(1_000);
        let sig = sign_hmac_sha256(&env, b"secret");
        assert!(verify_hmac_request(&env, &sig, b"secret", None, 1_000, 30));
    }

    #[test]
    fn rejects_wrong_secret() {
        let env = envelope(1_000);
        let sig = sign_hmac_sha256(&env, b"secret");
        assert!(!verify_hmac_request(&env, &sig, b"other", None, 1_000, 30));
    }

    #[test]
    fn accepts_previous_secret_during_rotation() {
        let env = envelope(1_000);
        let sig = sign_hmac_sha256(&env, b"old-secret");
        assert!(verify_hmac_request(
            &env,
            &sig,
            b"new-secret",
            Some(b"old-secret"),
            1_000,
            30
        ));
    }

    #[test]
    fn rejects_outside_clock_skew() {
        let env = envelope(1_000);
        let sig = sign_hmac_sha256(&env, b"secret");
        assert!(!verify_hmac_request(&env, &sig, b"secret", None, 1_100, 30));
    }
}
