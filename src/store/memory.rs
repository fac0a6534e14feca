//! In-process store backend.
//!
//! TTL semantics match the wire backend: expired keys are pruned lazily on
//! access. Roles are accepted but not enforced; ACLs are the external
//! store's job. Used by tests and by `store.mode = "memory"` deployments,
//! where approvals do not survive a restart.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::store::{PolicyStore, StoreRole};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|t| Instant::now() >= t)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    keys: Mutex<HashMap<String, Entry>>,
    lists: Mutex<HashMap<String, Vec<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of an ordered list (test inspection of the audit trail).
    pub async fn list(&self, key: &str) -> Vec<String> {
        self.lists
            .lock()
            .await
            .get(key)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl PolicyStore for MemoryStore {
    async fn get(&self, _role: StoreRole, key: &str) -> Result<Option<String>> {
        let mut keys = self.keys.lock().await;
        match keys.get(key) {
            Some(e) if e.expired() => {
                keys.remove(key);
                Ok(None)
            }
            Some(e) => Ok(Some(e.value.clone())),
            None => Ok(None),
        }
    }

    async fn put(
        &self,
        _role: StoreRole,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let mut keys = self.keys.lock().await;
        keys.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn delete(&self, _role: StoreRole, key: &str) -> Result<bool> {
        let mut keys = self.keys.lock().await;
        match keys.remove(key) {
            Some(e) => Ok(!e.expired()),
            None => Ok(false),
        }
    }

    async fn set_if_absent(
        &self,
        _role: StoreRole,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool> {
        let mut keys = self.keys.lock().await;
        let occupied = keys.get(key).map(|e| !e.expired()).unwrap_or(false);
        if occupied {
            return Ok(false);
        }
        keys.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn append(&self, _role: StoreRole, key: &str, entry: &str) -> Result<()> {
        let mut lists = self.lists.lock().await;
        lists
            .entry(key.to_string())
            .or_default()
            .push(entry.to_string());
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete() {
        let store = MemoryStore::new();
        store.put(StoreRole::Approval, "k", "v", None).await.unwrap();
        assert_eq!(
            store.get(StoreRole::Scan, "k").await.unwrap(),
            Some("v".to_string())
        );
        assert!(store.delete(StoreRole::Approval, "k").await.unwrap());
        assert!(!store.delete(StoreRole::Approval, "k").await.unwrap());
        assert_eq!(store.get(StoreRole::Scan, "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ttl_expiry_reads_as_absent() {
        let store = MemoryStore::new();
        store
            .put(StoreRole::Approval, "k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(store.get(StoreRole::Scan, "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_if_absent_is_exclusive() {
        let store = MemoryStore::new();
        assert!(store
            .set_if_absent(StoreRole::Approval, "lock", "a", Duration::from_secs(5))
            .await
            .unwrap());
        assert!(!store
            .set_if_absent(StoreRole::Approval, "lock", "b", Duration::from_secs(5))
            .await
            .unwrap());
        assert_eq!(
            store.get(StoreRole::Scan, "lock").await.unwrap(),
            Some("a".to_string())
        );
    }

    #[tokio::test]
    async fn set_if_absent_wins_after_expiry() {
        let store = MemoryStore::new();
        assert!(store
            .set_if_absent(StoreRole::Approval, "lock", "a", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(store
            .set_if_absent(StoreRole::Approval, "lock", "b", Duration::from_secs(5))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn append_preserves_order() {
        let store = MemoryStore::new();
        store.append(StoreRole::Audit, "log", "one").await.unwrap();
        store.append(StoreRole::Audit, "log", "two").await.unwrap();
        assert_eq!(store.list("log").await, vec!["one", "two"]);
    }
}
