//! `HostRegistry`: the aggregator's mapping of hostname → descriptor, with
//! liveness derived from `last_seen` rather than stored.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

use crate::error::StorageError;
use crate::sample::{decode_tags, encode_tags};
use crate::storage::TimeSeriesStore;

pub const DEFAULT_INACTIVE_THRESHOLD_SECONDS: i64 = 300;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HostDescriptor {
    pub hostname: String,
    pub last_seen: i64,
    pub first_seen: i64,
    pub platform: String,
    pub version: String,
    pub tags: HashMap<String, String>,
}

impl HostDescriptor {
    pub fn is_online(&self, now: i64, inactive_threshold_seconds: i64) -> bool {
        now - self.last_seen < inactive_threshold_seconds
    }
}

/// In-memory cache backed by the `hosts` table, behind a single mutex per
/// All persistence goes through the owning `TimeSeriesStore`'s
/// writer thread, so the table is never touched from two connections at
/// once.
pub struct HostRegistry {
    cache: Mutex<HashMap<String, HostDescriptor>>,
    inactive_threshold_seconds: i64,
}

impl HostRegistry {
    pub fn new(inactive_threshold_seconds: i64) -> Self {
        Self { cache: Mutex::new(HashMap::new()), inactive_threshold_seconds }
    }

    /// Loads every persisted descriptor into the in-memory cache. Called
    /// once at aggregator startup.
    pub fn load_from(&self, store: &TimeSeriesStore) -> Result<(), StorageError> {
        let rows = store.load_hosts()?;
        let mut cache = self.cache.lock().unwrap();
        for row in rows {
            cache.insert(
                row.hostname.clone(),
                HostDescriptor {
                    hostname: row.hostname,
                    last_seen: row.last_seen,
                    first_seen: row.first_seen,
                    platform: row.platform,
                    version: row.version,
                    tags: decode_tags(&row.tags_encoded).into_iter().collect(),
                },
            );
        }
        Ok(())
    }

    /// Creates or refreshes a descriptor: sets `last_seen = now`, merges
    /// tags, and persists through the store writer. `first_seen` is set
    /// once and never overwritten.
    pub fn upsert(
        &self,
        store: &TimeSeriesStore,
        hostname: &str,
        now: i64,
        platform: Option<&str>,
        version: Option<&str>,
        tags: &HashMap<String, String>,
    ) -> Result<(), StorageError> {
        let snapshot = {
            let mut cache = self.cache.lock().unwrap();
            let entry = cache.entry(hostname.to_owned()).or_insert_with(|| HostDescriptor {
                hostname: hostname.to_owned(),
                last_seen: now,
                first_seen: now,
                platform: platform.unwrap_or("Unknown").to_owned(),
                version: version.unwrap_or_default().to_owned(),
                tags: HashMap::new(),
            });

            entry.last_seen = now;
            if let Some(p) = platform {
                entry.platform = p.to_owned();
            }
            if let Some(v) = version {
                entry.version = v.to_owned();
            }
            entry.tags.extend(tags.clone());
            entry.clone()
        };

        let encoded_tags = encode_tags(&snapshot.tags.into_iter().collect());
        store.upsert_host(hostname, snapshot.last_seen, snapshot.first_seen, &snapshot.platform, &snapshot.version, &encoded_tags)
    }

    pub fn get(&self, hostname: &str) -> Option<HostDescriptor> {
        self.cache.lock().unwrap().get(hostname).cloned()
    }

    pub fn inactive_threshold_seconds(&self) -> i64 {
        self.inactive_threshold_seconds
    }

    /// Lists known hosts. `include_inactive = false` hides hosts whose
    /// `last_seen` is older than the configured inactive threshold.
    pub fn list(&self, now: i64, include_inactive: bool) -> Vec<HostDescriptor> {
        let cache = self.cache.lock().unwrap();
        cache
            .values()
            .filter(|d| include_inactive || d.is_online(now, self.inactive_threshold_seconds))
            .cloned()
            .collect()
    }

    pub fn online_count(&self, now: i64) -> usize {
        let cache = self.cache.lock().unwrap();
        cache.values().filter(|d| d.is_online(now, self.inactive_threshold_seconds)).count()
    }

    /// Optional maintenance hook; does not delete rows, only useful for
    /// callers that want a pruned view.
    pub fn mark_inactive_before(&self, ts: i64) -> Vec<String> {
        let cache = self.cache.lock().unwrap();
        cache.values().filter(|d| d.last_seen < ts).map(|d| d.hostname.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StoreConfig;
    use tempfile::tempdir;

    fn open_store(dir: &std::path::Path) -> TimeSeriesStore {
        let mut config = StoreConfig::new(dir.join("test.db"));
        config.flush_interval = std::time::Duration::from_millis(20);
        TimeSeriesStore::open(config).unwrap()
    }

    #[test]
    fn upsert_creates_then_refreshes_last_seen() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let registry = HostRegistry::new(300);
        let tags = HashMap::new();

        registry.upsert(&store, "host-a", 100, Some("Linux"), Some("1.0"), &tags).unwrap();
        let first = registry.get("host-a").unwrap();
        assert_eq!(first.first_seen, 100);
        assert_eq!(first.last_seen, 100);

        registry.upsert(&store, "host-a", 200, Some("Linux"), Some("1.0"), &tags).unwrap();
        let second = registry.get("host-a").unwrap();
        assert_eq!(second.first_seen, 100);
        assert_eq!(second.last_seen, 200);
    }

    #[test]
    fn online_count_reflects_liveness_window() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let registry = HostRegistry::new(300);
        let tags = HashMap::new();

        registry.upsert(&store, "a", 0, None, None, &tags).unwrap();
        registry.upsert(&store, "b", 0, None, None, &tags).unwrap();
        registry.upsert(&store, "c", 0, None, None, &tags).unwrap();

        // B goes stale; advance the clock past the inactive threshold.
        let now = 301;
        registry.upsert(&store, "a", now, None, None, &tags).unwrap();
        registry.upsert(&store, "c", now, None, None, &tags).unwrap();

        assert_eq!(registry.online_count(now), 2);
        let active_only = registry.list(now, false);
        assert_eq!(active_only.len(), 2);
        let all = registry.list(now, true);
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn load_from_restores_cache_after_restart() {
        let dir = tempdir().unwrap();
        let store = open_store(dir.path());
        let registry = HostRegistry::new(300);
        registry.upsert(&store, "host-a", 42, Some("Linux"), Some("1.2.3"), &HashMap::new()).unwrap();
        store.flush(std::time::Duration::from_secs(2)).unwrap();

        let reloaded = HostRegistry::new(300);
        reloaded.load_from(&store).unwrap();
        let descriptor = reloaded.get("host-a").unwrap();
        assert_eq!(descriptor.last_seen, 42);
        assert_eq!(descriptor.platform, "Linux");
    }
}
