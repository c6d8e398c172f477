//! TTL-bounded persistence of the three auth tokens.
//!
//! The vendor's JWTs claim absurd lifetimes (the login token nominally
//! lasts years) while the server actually invalidates them much earlier,
//! so every stored expiry is capped at `cached_at + max_token_ttl`. A
//! read only returns an entry that both clears the safety margin and is
//! younger than the cap; anything else is reported absent and the auth
//! engine refetches.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{account_key, KeyValueStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStage {
    Anonymous,
    Login,
    Mqtt,
}

impl TokenStage {
    pub fn name(self) -> &'static str {
        match self {
            TokenStage::Anonymous => "anonymous",
            TokenStage::Login => "login",
            TokenStage::Mqtt => "mqtt",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub cached_at: DateTime<Utc>,
    #[serde(default)]
    pub capped: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenFile {
    anonymous: Option<CachedToken>,
    login: Option<CachedToken>,
    mqtt: Option<CachedToken>,
}

impl TokenFile {
    fn slot(&mut self, stage: TokenStage) -> &mut Option<CachedToken> {
        match stage {
            TokenStage::Anonymous => &mut self.anonymous,
            TokenStage::Login => &mut self.login,
            TokenStage::Mqtt => &mut self.mqtt,
        }
    }

    fn get(&self, stage: TokenStage) -> Option<&CachedToken> {
        match stage {
            TokenStage::Anonymous => self.anonymous.as_ref(),
            TokenStage::Login => self.login.as_ref(),
            TokenStage::Mqtt => self.mqtt.as_ref(),
        }
    }
}

#[derive(Clone)]
pub struct TokenCache {
    store: Arc<dyn KeyValueStore>,
    safety_margin: Duration,
    max_token_ttl: Duration,
}

impl TokenCache {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        safety_margin_secs: u64,
        max_token_ttl_secs: u64,
    ) -> Self {
        TokenCache {
            store,
            safety_margin: Duration::seconds(safety_margin_secs as i64),
            max_token_ttl: Duration::seconds(max_token_ttl_secs as i64),
        }
    }

    fn file_key(email: &str) -> String {
        format!("tokens_{}.json", account_key(email))
    }

    fn load_file(&self, email: &str) -> TokenFile {
        let bytes = match self.store.read(&Self::file_key(email)) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return TokenFile::default(),
            Err(e) => {
                log::warn!("Unable to read token cache: {e:#}");
                return TokenFile::default();
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(file) => file,
            Err(e) => {
                // Corrupt cache is a miss, never a failure.
                log::warn!("Token cache is corrupt, discarding it: {e}");
                TokenFile::default()
            }
        }
    }

    fn save_file(&self, email: &str, file: &TokenFile) {
        let bytes = serde_json::to_vec_pretty(file).expect("token file serializes");
        if let Err(e) = self.store.write_atomic(&Self::file_key(email), &bytes) {
            log::warn!("Unable to persist token cache: {e:#}");
        }
    }

    /// Returns the cached token for a stage if it is still usable.
    pub fn get(&self, email: &str, stage: TokenStage) -> Option<CachedToken> {
        self.get_at(email, stage, Utc::now())
    }

    fn get_at(&self, email: &str, stage: TokenStage, now: DateTime<Utc>) -> Option<CachedToken> {
        let file = self.load_file(email);
        let entry = file.get(stage)?;
        if now + self.safety_margin >= entry.expires_at {
            log::debug!("Cached {} token is expired or too close to expiry", stage.name());
            return None;
        }
        if now - entry.cached_at >= self.max_token_ttl {
            log::debug!("Cached {} token is older than max_token_ttl", stage.name());
            return None;
        }
        Some(entry.clone())
    }

    /// Stores a freshly fetched token, capping the claimed expiry at
    /// `cached_at + max_token_ttl`.
    pub fn put(
        &self,
        email: &str,
        stage: TokenStage,
        token: String,
        claimed_expiry: DateTime<Utc>,
    ) -> CachedToken {
        self.put_at(email, stage, token, claimed_expiry, Utc::now())
    }

    fn put_at(
        &self,
        email: &str,
        stage: TokenStage,
        token: String,
        claimed_expiry: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> CachedToken {
        let cap = now + self.max_token_ttl;
        let capped = claimed_expiry > cap;
        if capped {
            log::info!(
                "Capping {} token expiry from {} to {}",
                stage.name(),
                claimed_expiry,
                cap
            );
        }
        let entry = CachedToken {
            token,
            expires_at: claimed_expiry.min(cap),
            cached_at: now,
            capped,
        };

        let mut file = self.load_file(email);
        *file.slot(stage) = Some(entry.clone());
        self.save_file(email, &file);
        entry
    }

    pub fn purge(&self, email: &str, stage: TokenStage) {
        let mut file = self.load_file(email);
        if file.slot(stage).take().is_some() {
            log::debug!("Purged cached {} token", stage.name());
            self.save_file(email, &file);
        }
    }

    pub fn purge_all(&self, email: &str) {
        log::debug!("Purging all cached tokens for the account");
        if let Err(e) = self.store.remove(&Self::file_key(email)) {
            log::warn!("Unable to remove token cache: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;

    const EMAIL: &str = "user@example.com";

    fn cache() -> TokenCache {
        TokenCache::new(Arc::new(MemoryStore::new()), 300, 86_400)
    }

    #[test]
    fn far_future_expiry_is_capped() {
        let cache = cache();
        let now = Utc::now();
        let claimed = now + Duration::days(14 * 365);
        let entry = cache.put_at(EMAIL, TokenStage::Login, "jwt".into(), claimed, now);
        assert!(entry.capped);
        assert_eq!(entry.expires_at - entry.cached_at, Duration::seconds(86_400));
    }

    #[test]
    fn near_expiry_is_kept_verbatim() {
        let cache = cache();
        let now = Utc::now();
        let claimed = now + Duration::minutes(10);
        let entry = cache.put_at(EMAIL, TokenStage::Anonymous, "t".into(), claimed, now);
        assert!(!entry.capped);
        assert_eq!(entry.expires_at, claimed);
    }

    #[test]
    fn read_enforces_the_safety_margin() {
        let cache = cache();
        let now = Utc::now();
        cache.put_at(EMAIL, TokenStage::Mqtt, "t".into(), now + Duration::minutes(10), now);
        assert!(cache.get_at(EMAIL, TokenStage::Mqtt, now).is_some());
        // Four minutes before expiry the 300 s margin no longer clears.
        let late = now + Duration::minutes(6);
        assert!(cache.get_at(EMAIL, TokenStage::Mqtt, late).is_none());
    }

    #[test]
    fn read_enforces_the_age_cap() {
        let cache = cache();
        let now = Utc::now();
        cache.put_at(EMAIL, TokenStage::Login, "t".into(), now + Duration::days(3), now);
        let next_day = now + Duration::seconds(86_401);
        assert!(cache.get_at(EMAIL, TokenStage::Login, next_day).is_none());
    }

    #[test]
    fn stages_are_independent() {
        let cache = cache();
        let now = Utc::now();
        cache.put_at(EMAIL, TokenStage::Anonymous, "a".into(), now + Duration::hours(1), now);
        cache.put_at(EMAIL, TokenStage::Mqtt, "m".into(), now + Duration::hours(1), now);
        cache.purge(EMAIL, TokenStage::Mqtt);
        assert!(cache.get_at(EMAIL, TokenStage::Anonymous, now).is_some());
        assert!(cache.get_at(EMAIL, TokenStage::Mqtt, now).is_none());
    }

    #[test]
    fn corrupt_cache_reads_as_absent() {
        let store = Arc::new(MemoryStore::new());
        store
            .write_atomic(&TokenCache::file_key(EMAIL), b"{not json")
            .unwrap();
        let cache = TokenCache::new(store, 300, 86_400);
        assert!(cache.get(EMAIL, TokenStage::Login).is_none());
        // A put over the corrupt entry repairs the file.
        let now = Utc::now();
        cache.put_at(EMAIL, TokenStage::Login, "t".into(), now + Duration::hours(2), now);
        assert!(cache.get_at(EMAIL, TokenStage::Login, now).is_some());
    }

    #[test]
    fn invariants_hold_for_every_entry() {
        let cache = cache();
        let now = Utc::now();
        for (stage, days) in [
            (TokenStage::Anonymous, 0),
            (TokenStage::Login, 5_000),
            (TokenStage::Mqtt, 3),
        ] {
            let entry = cache.put_at(
                EMAIL,
                stage,
                "t".into(),
                now + Duration::days(days) + Duration::minutes(10),
                now,
            );
            assert!(entry.cached_at <= now);
            assert!(entry.expires_at <= entry.cached_at + Duration::seconds(86_400));
        }
    }
}
