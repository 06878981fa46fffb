use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::{LocalStore, StoreError, StoreExt};

pub const EVENTS_TABLE: &str = "events";

/// What gets recorded for an identity once it has been forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedMarker {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub processed_at: i64,
}

/// First-notification-wins gate over the `events` table.
#[derive(Clone)]
pub struct Deduplicator {
    store: Arc<dyn LocalStore>,
    ttl_seconds: i64,
}

impl Deduplicator {
    /// `ttl_seconds <= 0` keeps markers for the life of the store.
    pub fn new(store: Arc<dyn LocalStore>, ttl_seconds: i64) -> Self {
        Self { store, ttl_seconds }
    }

    pub fn already_processed(&self, identity: &str) -> Result<bool, StoreError> {
        Ok(self.store.get(EVENTS_TABLE, identity)?.is_some())
    }

    pub fn mark_processed(&self, identity: &str, version: Option<&str>) -> Result<(), StoreError> {
        let marker = ProcessedMarker {
            version: version.map(str::to_owned),
            processed_at: chrono::Utc::now().timestamp(),
        };
        self.store
            .set_json_with_ttl(EVENTS_TABLE, identity, &marker, self.ttl_seconds)
    }

    /// Version stored by the last `mark_processed` under `key`, if any.
    pub fn latest_version(&self, key: &str) -> Result<Option<String>, StoreError> {
        let marker: Option<ProcessedMarker> = self.store.get_json(EVENTS_TABLE, key)?;
        Ok(marker.and_then(|m| m.version))
    }
}

/// Resource versions are opaque strings, in practice they are etcd revisions. Compare numerically
/// when both sides are integers and fall back to byte order otherwise.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// True when `incoming` should be processed given the version already on record.
pub fn is_newer(incoming: &str, recorded: Option<&str>) -> bool {
    match recorded {
        Some(recorded) => compare_versions(incoming, recorded) == Ordering::Greater,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_first_notification_wins() {
        let dedup = Deduplicator::new(Arc::new(MemoryStore::new()), 0);

        assert!(!dedup.already_processed("e-1").unwrap());
        dedup.mark_processed("e-1", None).unwrap();
        assert!(dedup.already_processed("e-1").unwrap());
        assert!(!dedup.already_processed("e-2").unwrap());
    }

    #[test]
    fn test_latest_version() {
        let dedup = Deduplicator::new(Arc::new(MemoryStore::new()), 0);
        assert_eq!(dedup.latest_version("shop/s-1").unwrap(), None);

        dedup.mark_processed("shop/s-1", Some("10")).unwrap();
        dedup.mark_processed("shop/s-1", Some("12")).unwrap();
        assert_eq!(dedup.latest_version("shop/s-1").unwrap().as_deref(), Some("12"));
    }

    #[test]
    fn test_markers_honour_ttl() {
        let store = Arc::new(MemoryStore::new());
        Deduplicator::new(store.clone(), 30)
            .mark_processed("e-1", None)
            .unwrap();

        let record = store.get(EVENTS_TABLE, "e-1").unwrap().unwrap();
        assert!(record.expires_at.is_some());
    }

    #[test]
    fn test_version_ordering() {
        assert!(is_newer("1", None));
        assert!(is_newer("10", Some("9")));
        assert!(!is_newer("9", Some("10")));
        assert!(!is_newer("10", Some("10")));
        // Non-numeric versions fall back to lexical order.
        assert!(is_newer("b", Some("a")));
        assert!(!is_newer("a", Some("a")));
    }
}
