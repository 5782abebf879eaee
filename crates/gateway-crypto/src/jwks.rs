//! Stale-tolerant JWKS cache: a set of remote public keys is
//! fetched periodically and exposed to JWT verification. Unlike a hard TTL,
//! staleness here degrades in three tiers rather than flipping from "good" to
//! "rejected" — an operator outage on the JWKS endpoint should not also take
//! down auth for every in-flight token.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use p256::ecdsa::VerifyingKey;
use serde::Deserialize;
use tracing::warn;

use gateway_core::constants::{JWKS_HEALTHY_MAX_AGE_SECS, JWKS_STALE_MAX_AGE_SECS};

/// Staleness tier of the cached key set, relative to the last successful
/// fetch. `Degraded` does not mean "empty" — the last good keys are still
/// served, callers just get a chance to alert on the age.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JwksStaleness {
    Healthy,
    Stale,
    Degraded,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<JwkEntry>,
}

#[derive(Debug, Deserialize)]
struct JwkEntry {
    kid: String,
    x: String,
    y: String,
}

struct Cached {
    keys: HashMap<String, VerifyingKey>,
    fetched_at: Instant,
}

/// Caches the verifying keys fetched from a JWKS endpoint. Call `refresh`
/// on a schedule (the node binary spawns a cancellable task for this); `get`
/// and `staleness` never block on network I/O.
pub struct JwksCache {
    url: String,
    client: reqwest::Client,
    cached: RwLock<Option<Cached>>,
    healthy_max_age: Duration,
    stale_max_age: Duration,
}

impl JwksCache {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
            cached: RwLock::new(None),
            healthy_max_age: Duration::from_secs(JWKS_HEALTHY_MAX_AGE_SECS as u64),
            stale_max_age: Duration::from_secs(JWKS_STALE_MAX_AGE_SECS as u64),
        }
    }

    /// Fetch the key set and replace the cache on success. On failure the
    /// previous cache (if any) is left untouched and the staleness clock
    /// keeps running — this is what lets `staleness()` degrade gracefully.
    pub async fn refresh(&self) -> Result<(), reqwest::Error> {
        let resp: JwksResponse = self.client.get(&self.url).send().await?.json().await?;
        let mut keys = HashMap::with_capacity(resp.keys.len());
        for entry in resp.keys {
            match decode_p256_key(&entry.x, &entry.y) {
                Ok(key) => {
                    keys.insert(entry.kid, key);
                }
                Err(e) => warn!(kid = %entry.kid, error = %e, "skipping undecodable JWKS entry"),
            }
        }
        *self.cached.write().expect("jwks cache lock poisoned") = Some(Cached {
            keys,
            fetched_at: Instant::now(),
        });
        Ok(())
    }

    pub fn get(&self, kid: &str) -> Option<VerifyingKey> {
        self.cached
            .read()
            .expect("jwks cache lock poisoned")
            .as_ref()
            .and_then(|c| c.keys.get(kid).copied())
    }

    pub fn staleness(&self) -> JwksStaleness {
        let guard = self.cached.read().expect("jwks cache lock poisoned");
        let Some(cached) = guard.as_ref() else {
            return JwksStaleness::Degraded;
        };
        let age = cached.fetched_at.elapsed();
        if age <= self.healthy_max_age {
            JwksStaleness::Healthy
        } else if age <= self.stale_max_age {
            JwksStaleness::Stale
        } else {
            JwksStaleness::Degraded
        }
    }
}

fn decode_p256_key(x_b64: &str, y_b64: &str) -> Result<VerifyingKey, String> {
    use base64::Engine;
    let x = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(x_b64)
        .map_err(|e| e.to_string())?;
    let y = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(y_b64)
        .map_err(|e| e.to_string())?;
    let mut sec1 = Vec::with_capacity(1 + x.len() + y.len());
    sec1.push(0x04);
    sec1.extend_from_slice(&x);
    sec1.extend_from_slice(&y);
    VerifyingKey::from_sec1_bytes(&sec1).map_err(|e| e.to_string())
}

/// Process-wide default instance, constructed once the node binary knows its
/// JWKS URL. Kept as a `OnceCell` rather than a bare `static mut` so tests can
/// construct fresh `JwksCache` values without touching process state.
pub static DEFAULT: OnceCell<JwksCache> = OnceCell::new();

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staleness_is_degraded_before_first_fetch() {
        let cache = JwksCache::new("https://example.invalid/jwks.json");
        assert_eq!(cache.staleness(), JwksStaleness::Degraded);
        assert!(cache.get("any").is_none());
    }
}
