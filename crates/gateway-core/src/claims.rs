//! The verified shape of a tenant's signed JWT claims.
//!
//! The core never issues these — it consumes them after `gateway-crypto`
//! verifies signature, issuer, audience, and expiry. A `TenantClaims` value
//! in hand means authentication has already succeeded.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Service tier carried on the claim, distinct from `AccountTier` on the
/// credit account itself: this is what the caller is paying for on this
/// particular request, not their standing in the credit program.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Enterprise => "enterprise",
        }
    }
}

/// Per-request model routing hints, a free-form string map so new keys need
/// no code change.
pub type ModelPreferences = HashMap<String, String>;

/// The verified JWT claim set consumed by the gateway.
///
/// `req_hash` is `"sha256:" + hex(sha256(canonical_body))`; the orchestrator
/// uses it to bind the claim to one specific request body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TenantClaims {
    pub iss: String,
    pub aud: String,
    pub sub: String,
    pub tenant_id: String,
    pub tier: Tier,
    pub req_hash: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default)]
    pub jti: Option<String>,
    #[serde(default)]
    pub nft_id: Option<String>,
    #[serde(default)]
    pub byok: bool,
    #[serde(default)]
    pub model_preferences: ModelPreferences,
}

impl TenantClaims {
    /// `req_hash` has the form `"sha256:" + hex`; this splits off the prefix.
    pub fn req_hash_hex(&self) -> Option<&str> {
        self.req_hash.strip_prefix("sha256:")
    }

    /// True iff `now` (unix seconds) falls within `[iat - skew, exp + skew]`.
    pub fn within_skew(&self, now: i64, skew_secs: i64) -> bool {
        now >= self.iat - skew_secs && now <= self.exp + skew_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn req_hash_strips_prefix() {
        let claims = TenantClaims {
            iss: "gateway".into(),
            aud: "gateway-api".into(),
            sub: "user-1".into(),
            tenant_id: "tenant-1".into(),
            tier: Tier::Pro,
            req_hash: "sha256:deadbeef".into(),
            iat: 0,
            exp: 100,
            jti: None,
            nft_id: None,
            byok: false,
            model_preferences: HashMap::new(),
        };
        assert_eq!(claims.req_hash_hex(), Some("deadbeef"));
        assert!(claims.within_skew(50, 30));
        assert!(!claims.within_skew(1000, 30));
    }
}
