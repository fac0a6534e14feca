//! Policy/credential store client.
//!
//! The store is an external keyed store reached over an authenticated
//! transport with per-role access control; values are structured JSON. Keys
//! are namespaced by purpose:
//!
//! | Namespace | Holds |
//! |-----------|-------|
//! | `blocked:<id>` | [`BlockedRequest`](crate::ott::BlockedRequest) records |
//! | `ott:<code>` | minted tokens |
//! | `approved:<id>` / `approved:host:<host>` | approval markers |
//! | `log:events` | the append-only audit trail |
//! | `config:security_level` | the operator-set security level |
//!
//! Two backends: [`memory::MemoryStore`] (in-process, tests and standalone
//! mode) and [`resp::RespStore`] (RESP wire protocol over TCP/TLS). Every
//! store operation carries an explicit bounded timeout.

pub mod memory;
pub mod poller;
pub mod resp;

pub use memory::MemoryStore;
pub use poller::{spawn_poller, SecurityLevelCache};
pub use resp::RespStore;

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::dlp::SecurityLevel;
use crate::error::{Result, TollgateError};

/// Store ACL roles. Each maps to its own credentials and, for the RESP
/// backend, its own lazily established connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRole {
    /// Scan-time reads (security level, approval markers).
    Scan,
    /// Approval-issuance writes (blocked requests, tokens, markers, locks).
    Approval,
    /// Audit appends.
    Audit,
    /// Health checks.
    Health,
}

/// Key of the append-only audit list.
pub const AUDIT_LOG_KEY: &str = "log:events";
/// Key of the polled security level.
pub const SECURITY_LEVEL_KEY: &str = "config:security_level";

pub fn blocked_key(request_id: &str) -> String {
    format!("blocked:{}", request_id)
}

pub fn ott_key(code: &str) -> String {
    format!("ott:{}", code)
}

pub fn approved_key(request_id: &str) -> String {
    format!("approved:{}", request_id)
}

pub fn approved_host_key(host: &str) -> String {
    format!("approved:host:{}", host)
}

pub fn lock_key(request_id: &str) -> String {
    format!("lock:{}", request_id)
}

/// Keyed-store operations the gateway needs.
///
/// All methods are bounded in time by the implementation; a slow store
/// surfaces as [`TollgateError::PolicyStore`], and approval features then
/// degrade to unavailable (fail closed).
#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// Fetch a value. `None` for absent or expired keys.
    async fn get(&self, role: StoreRole, key: &str) -> Result<Option<String>>;

    /// Write a value with an optional TTL.
    async fn put(&self, role: StoreRole, key: &str, value: &str, ttl: Option<Duration>)
        -> Result<()>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, role: StoreRole, key: &str) -> Result<bool>;

    /// Set-if-absent with TTL; the cross-worker lock primitive. Returns
    /// whether this caller won the key.
    async fn set_if_absent(
        &self,
        role: StoreRole,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool>;

    /// Append one entry to an ordered list (the audit trail).
    async fn append(&self, role: StoreRole, key: &str, entry: &str) -> Result<()>;

    /// Liveness probe with the health role.
    async fn ping(&self) -> Result<()>;
}

/// Fetch and deserialize a JSON value. Malformed JSON is a store error, not
/// a silent miss: a record we cannot parse must never be treated as absent
/// evidence.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn PolicyStore,
    role: StoreRole,
    key: &str,
) -> Result<Option<T>> {
    match store.get(role, key).await? {
        None => Ok(None),
        Some(raw) => {
            let value = serde_json::from_str(&raw).map_err(|e| {
                TollgateError::PolicyStore(format!("malformed record at {}: {}", key, e))
            })?;
            Ok(Some(value))
        }
    }
}

/// Serialize and write a JSON value.
pub async fn put_json<T: Serialize>(
    store: &dyn PolicyStore,
    role: StoreRole,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<()> {
    let raw = serde_json::to_string(value)?;
    store.put(role, key, &raw, ttl).await
}

/// Read the operator-set security level; `None` when unset.
pub async fn fetch_security_level(store: &dyn PolicyStore) -> Result<Option<SecurityLevel>> {
    match store.get(StoreRole::Scan, SECURITY_LEVEL_KEY).await? {
        None => Ok(None),
        Some(raw) => {
            let level: SecurityLevel = serde_json::from_str(&raw).map_err(|e| {
                TollgateError::PolicyStore(format!("malformed security level: {}", e))
            })?;
            Ok(Some(level))
        }
    }
}
