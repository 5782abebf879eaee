pub mod ecdsa;
pub mod hash;
pub mod hmac;
pub mod jwks;

pub use ecdsa::{verify_es256_jwt, verify_raw, Es256KeyPair, JwtVerifyError};
pub use hash::{crc32_hex, sha256_bytes, sha256_hex, unlock_authorization_fingerprint};
pub use hmac::{sign_hmac_sha256, verify_hmac_request, SigningEnvelope};
pub use jwks::{JwksCache, JwksStaleness};
