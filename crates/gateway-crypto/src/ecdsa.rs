//! ES256 (ECDSA over P-256) signing and verification, and the JWT claim
//! verification that rides on top of it.

use ecdsa::signature::{Signer, Verifier};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum JwtVerifyError {
    #[error("jwt structurally invalid: {0}")]
    Structural(String),
    #[error("jwt signature invalid")]
    Signature,
    #[error("jwt expired or not yet valid")]
    Expired,
    #[error("jwt issuer or audience mismatch")]
    IssuerAudienceMismatch,
    #[error("signature or claim verification failed: {0}")]
    Verification(String),
}

/// An ES256 keypair. Used in tests and by any tool that needs to mint claims
/// locally; production verification goes through `verify_es256_jwt` against
/// keys resolved from the `JwksCache`.
pub struct Es256KeyPair {
    signing_key: SigningKey,
}

impl Es256KeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        *self.signing_key.verifying_key()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// An `EncodingKey` suitable for `jsonwebtoken::encode`, for tests and
    /// local tooling that mints claims against a `JwksCache` serving this
    /// keypair's public half.
    pub fn to_jwt_encoding_key(&self) -> jsonwebtoken::EncodingKey {
        use p256::pkcs8::EncodePrivateKey;
        let der = self.signing_key.to_pkcs8_der().expect("pkcs8 encode of P-256 key");
        jsonwebtoken::EncodingKey::from_ec_der(der.as_bytes())
    }
}

pub fn verify_raw(key: &VerifyingKey, message: &[u8], signature: &Signature) -> bool {
    key.verify(message, signature).is_ok()
}

/// Verify and decode an ES256 JWT against a specific public key, checking
/// issuer, audience, and expiry with the configured clock skew. The caller
/// (`gateway-node`'s `authenticate`) maps every variant to the same opaque
/// client-facing message, but logs internally on the specific variant — the
/// split here exists for that logging, not for the client response.
pub fn verify_es256_jwt<T: DeserializeOwned>(
    token: &str,
    key: &VerifyingKey,
    issuer: &str,
    audience: &str,
    clock_skew_secs: u64,
) -> Result<T, JwtVerifyError> {
    let point = key.to_encoded_point(false);
    let x = point.x().ok_or_else(|| JwtVerifyError::Structural("key missing x coordinate".into()))?;
    let y = point.y().ok_or_else(|| JwtVerifyError::Structural("key missing y coordinate".into()))?;
    let decoding_key = DecodingKey::from_ec_components(
        &base64_url_no_pad(x),
        &base64_url_no_pad(y),
    )
    .map_err(|e| JwtVerifyError::Structural(e.to_string()))?;

    let mut validation = Validation::new(Algorithm::ES256);
    validation.set_issuer(&[issuer]);
    validation.set_audience(&[audience]);
    validation.leeway = clock_skew_secs;

    let data = decode::<T>(token, &decoding_key, &validation).map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature | jsonwebtoken::errors::ErrorKind::ImmatureSignature => {
            JwtVerifyError::Expired
        }
        jsonwebtoken::errors::ErrorKind::InvalidIssuer | jsonwebtoken::errors::ErrorKind::InvalidAudience => {
            JwtVerifyError::IssuerAudienceMismatch
        }
        jsonwebtoken::errors::ErrorKind::InvalidSignature => JwtVerifyError::Signature,
        jsonwebtoken::errors::ErrorKind::Json(_)
        | jsonwebtoken::errors::ErrorKind::Utf8(_)
        | jsonwebtoken::errors::ErrorKind::Base64(_) => JwtVerifyError::Structural(e.to_string()),
        _ => JwtVerifyError::Verification(e.to_string()),
    })?;
    Ok(data.claims)
}

/// Base64url, no padding — the encoding `jsonwebtoken` expects for raw EC
/// coordinates passed to `DecodingKey::from_ec_components`.
fn base64_url_no_pad(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_sign_and_verify_round_trips() {
        let kp = Es256KeyPair::generate();
        let sig = kp.sign(b"hello world");
        assert!(verify_raw(&kp.verifying_key(), b"hello world", &sig));
        assert!(!verify_raw(&kp.verifying_key(), b"goodbye", &sig));
    }
}
