//! One-Time-Token approval protocol.
//!
//! A blocked action moves through **Blocked → Armed → Approved → Consumed**,
//! with **Expired** as the alternate terminal at any point via store TTLs:
//!
//! - *Block* persists a [`BlockedRequest`] and hands the agent a request id
//!   plus a human-readable approval command — never the matched pattern.
//! - *Rewrite* arms the approval: an approval command observed in outbound
//!   content is swapped, in place and length-preserving, for a freshly
//!   minted token that only becomes usable after a time gate.
//! - *Approve* consumes the token when it arrives back in inbound content
//!   from the same origin host, after the gate, writing the audit entry
//!   before any evidence is deleted.

pub mod ids;
pub mod protocol;

pub use ids::{OttCode, RequestId};
pub use protocol::{ApprovalOutcome, OttProtocol};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A blocked action awaiting possible approval. Keyed by
/// `blocked:<request_id>`, TTL about an hour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedRequest {
    pub request_id: RequestId,
    /// Redacted reason shown to the agent (e.g. `credential_detected`).
    pub reason: String,
    /// Destination host of the blocked exchange.
    pub destination: String,
    /// Matching pattern name; audit-only, never surfaced to the agent.
    pub pattern: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// An armed token. Keyed by `ott:<code>`, TTL about ten minutes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimeToken {
    pub ott_code: OttCode,
    pub request_id: RequestId,
    /// Unix time before which the token is rejected (echo protection).
    pub armed_after: i64,
    /// Host of the exchange that armed the token; approval must come back
    /// over the same channel.
    pub origin_host: String,
}

/// Marker recorded under both `approved:<id>` and `approved:host:<host>`
/// once an approval lands; short TTL. The host marker lets subsequent
/// retries to the same destination pass without a fresh token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovedMarker {
    pub request_id: RequestId,
    pub destination: String,
    pub approved_at: DateTime<Utc>,
}

/// The approval command handed to the operator for a blocked request.
pub fn approval_command(request_id: &RequestId) -> String {
    format!("tollgate approve {}", request_id)
}
