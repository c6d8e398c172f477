//! Cached device inventory per account.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::cloud::Device;

use super::{account_key, KeyValueStore};

#[derive(Debug, Serialize, Deserialize)]
struct DeviceFile {
    cached_at: DateTime<Utc>,
    devices: Vec<Device>,
}

#[derive(Clone)]
pub struct DeviceCache {
    store: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl DeviceCache {
    pub fn new(store: Arc<dyn KeyValueStore>, ttl_secs: u64) -> Self {
        DeviceCache {
            store,
            ttl: Duration::seconds(ttl_secs as i64),
        }
    }

    fn file_key(email: &str) -> String {
        format!("devices_{}.json", account_key(email))
    }

    pub fn get(&self, email: &str) -> Option<Vec<Device>> {
        self.get_at(email, Utc::now())
    }

    fn get_at(&self, email: &str, now: DateTime<Utc>) -> Option<Vec<Device>> {
        let bytes = match self.store.read(&Self::file_key(email)) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Unable to read device cache: {e:#}");
                return None;
            }
        };
        let file: DeviceFile = match serde_json::from_slice(&bytes) {
            Ok(file) => file,
            Err(e) => {
                log::warn!("Device cache is corrupt, discarding it: {e}");
                return None;
            }
        };
        if now - file.cached_at > self.ttl {
            log::debug!("Device cache is older than its TTL, refetching");
            return None;
        }
        Some(file.devices)
    }

    pub fn put(&self, email: &str, devices: &[Device]) {
        let file = DeviceFile {
            cached_at: Utc::now(),
            devices: devices.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&file).expect("device file serializes");
        if let Err(e) = self.store.write_atomic(&Self::file_key(email), &bytes) {
            log::warn!("Unable to persist device cache: {e:#}");
        }
    }

    pub fn invalidate(&self, email: &str) {
        if let Err(e) = self.store.remove(&Self::file_key(email)) {
            log::warn!("Unable to remove device cache: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;

    const EMAIL: &str = "user@example.com";

    fn device(mac: &str) -> Device {
        Device {
            mac: mac.to_string(),
            name: "F2400".to_string(),
            model: "F2400".to_string(),
        }
    }

    #[test]
    fn round_trips_within_ttl() {
        let cache = DeviceCache::new(Arc::new(MemoryStore::new()), 86_400);
        cache.put(EMAIL, &[device("7C2C67AB5F0E")]);
        let devices = cache.get(EMAIL).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].mac, "7C2C67AB5F0E");
    }

    #[test]
    fn expires_after_ttl() {
        let cache = DeviceCache::new(Arc::new(MemoryStore::new()), 86_400);
        cache.put(EMAIL, &[device("7C2C67AB5F0E")]);
        let later = Utc::now() + Duration::seconds(86_401);
        assert!(cache.get_at(EMAIL, later).is_none());
    }

    #[test]
    fn corrupt_cache_reads_as_absent() {
        let store = Arc::new(MemoryStore::new());
        store
            .write_atomic(&DeviceCache::file_key(EMAIL), b"\xff\xfe")
            .unwrap();
        let cache = DeviceCache::new(store, 86_400);
        assert!(cache.get(EMAIL).is_none());
    }

    #[test]
    fn invalidate_forces_a_refetch() {
        let cache = DeviceCache::new(Arc::new(MemoryStore::new()), 86_400);
        cache.put(EMAIL, &[device("7C2C67AB5F0E")]);
        cache.invalidate(EMAIL);
        assert!(cache.get(EMAIL).is_none());
    }
}
