//! Append-only audit trail.
//!
//! Every security decision is serialized as one JSON object and appended to
//! the store's `log:events` list with the audit role; entries are never
//! mutated or deleted. Entries may name the matching pattern, but never
//! carry raw matched credential text or live token values.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::ott::BlockedRequest;
use crate::store::{PolicyStore, StoreRole, AUDIT_LOG_KEY};

/// Events worth an audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// An outbound exchange was blocked.
    RequestBlocked {
        request_id: String,
        destination: String,
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pattern: Option<String>,
    },
    /// An approval command was rewritten into an armed token.
    TokenArmed {
        request_id: String,
        origin_host: String,
        armed_after: i64,
    },
    /// A token was accepted; the archived record preserves the evidence
    /// that is deleted right after this entry is durable.
    Approved {
        request_id: String,
        origin_host: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        archived: Option<BlockedRequest>,
    },
    /// Inbound content was withheld after a scanner hit.
    ScanInfected {
        destination: String,
        signature: String,
    },
    /// A scan error on a trusted bulk-download destination passed through
    /// unscanned.
    ScanFailOpen { destination: String, detail: String },
}

/// One serialized audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

/// Store-backed audit writer shared across connection tasks.
#[derive(Clone)]
pub struct AuditLog {
    store: Arc<dyn PolicyStore>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn PolicyStore>) -> Self {
        Self { store }
    }

    /// Append one event. Callers that delete evidence afterwards must await
    /// this first; the ordering is what keeps a crash from losing the trail.
    pub async fn append(&self, event: AuditEvent) -> Result<()> {
        let entry = AuditLogEntry {
            timestamp: Utc::now(),
            event,
        };
        let json = serde_json::to_string(&entry)?;
        self.store
            .append(StoreRole::Audit, AUDIT_LOG_KEY, &json)
            .await?;
        info!(entry = %json, "audit");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn entries_append_in_order() {
        let store = Arc::new(MemoryStore::new());
        let log = AuditLog::new(store.clone());
        log.append(AuditEvent::RequestBlocked {
            request_id: "req-deadbeef".to_string(),
            destination: "evil.example".to_string(),
            reason: "credential_detected".to_string(),
            pattern: Some("anthropic".to_string()),
        })
        .await
        .unwrap();
        log.append(AuditEvent::TokenArmed {
            request_id: "req-deadbeef".to_string(),
            origin_host: "evil.example".to_string(),
            armed_after: 1_700_000_000,
        })
        .await
        .unwrap();

        let entries = store.list(AUDIT_LOG_KEY).await;
        assert_eq!(entries.len(), 2);
        assert!(entries[0].contains("request_blocked"));
        assert!(entries[1].contains("token_armed"));
    }

    #[tokio::test]
    async fn entry_json_has_event_tag_and_timestamp() {
        let store = Arc::new(MemoryStore::new());
        let log = AuditLog::new(store.clone());
        log.append(AuditEvent::ScanInfected {
            destination: "downloads.example".to_string(),
            signature: "Eicar-Test-Signature".to_string(),
        })
        .await
        .unwrap();

        let raw = &store.list(AUDIT_LOG_KEY).await[0];
        let parsed: AuditLogEntry = serde_json::from_str(raw).unwrap();
        assert!(matches!(parsed.event, AuditEvent::ScanInfected { .. }));
        assert!(raw.contains("timestamp"));
    }
}
