//! Block / rewrite / approve passes over request and response bodies.
//!
//! All body scanning is byte-oriented (`regex::bytes`), so offsets stay
//! valid for in-place, length-preserving substitution even in bodies that
//! are not clean UTF-8.

use std::sync::{Arc, OnceLock};

use chrono::Utc;
use regex::bytes::Regex;
use tracing::{debug, warn};

use crate::audit::{AuditEvent, AuditLog};
use crate::config::OttConfig;
use crate::error::Result;
use crate::ott::{approval_command, ApprovedMarker, BlockedRequest, OneTimeToken, OttCode, RequestId};
use crate::store::{
    approved_host_key, approved_key, blocked_key, get_json, lock_key, ott_key, put_json,
    PolicyStore, StoreRole,
};
use crate::dlp::domains::normalize_host;

/// Replacement for any token-shaped text leaving the gateway. Same length
/// as a real code, so framing never shifts.
const REDACTED_CODE: &[u8] = b"ott-********";

fn command_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"tollgate approve (req-[a-f0-9]{8})").unwrap())
}

fn ott_shaped_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"ott-[A-Za-z0-9]{8}").unwrap())
}

/// Per-token outcome of an approve pass, for logging and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// Token consumed, markers set.
    Approved(RequestId),
    /// No such token (absent or expired). Rejected without a response.
    Unknown,
    /// Token seen before its arming time. Rejected without a response.
    BeforeArmed,
    /// Token seen from a host other than its origin. Rejected without a response.
    WrongOrigin,
    /// A store step failed mid-sequence; the token was left in place for a
    /// legitimate retry.
    Errored,
}

/// The OTT state machine over the policy store.
#[derive(Clone)]
pub struct OttProtocol {
    store: Arc<dyn PolicyStore>,
    audit: AuditLog,
    config: OttConfig,
}

impl OttProtocol {
    pub fn new(store: Arc<dyn PolicyStore>, audit: AuditLog, config: OttConfig) -> Self {
        Self {
            store,
            audit,
            config,
        }
    }

    /// *Block*: persist the blocked request and write its audit entry.
    ///
    /// Returns the record; the caller builds the agent-facing body from the
    /// request id and [`approval_command`], never from the pattern.
    pub async fn block(
        &self,
        destination: &str,
        reason: &str,
        pattern: Option<&str>,
    ) -> Result<BlockedRequest> {
        let record = BlockedRequest {
            request_id: RequestId::mint()?,
            reason: reason.to_string(),
            destination: normalize_host(destination),
            pattern: pattern.map(|p| p.to_string()),
            timestamp: Utc::now(),
        };
        put_json(
            self.store.as_ref(),
            StoreRole::Approval,
            &blocked_key(record.request_id.as_str()),
            &record,
            Some(self.config.blocked_ttl()),
        )
        .await?;
        self.audit
            .append(AuditEvent::RequestBlocked {
                request_id: record.request_id.to_string(),
                destination: record.destination.clone(),
                reason: record.reason.clone(),
                pattern: record.pattern.clone(),
            })
            .await?;
        Ok(record)
    }

    /// *Rewrite (arm)*: swap each approval command's request id for a fresh
    /// token, in place. Returns the rewritten body, or `None` when nothing
    /// changed.
    ///
    /// A short-TTL per-id lock dedupes concurrent rewrites: the loser skips
    /// the id and leaves the text as sent. CSPRNG failure aborts the pass.
    pub async fn rewrite_pass(&self, body: &[u8], host: &str) -> Result<Option<Vec<u8>>> {
        let spans: Vec<(usize, usize)> = command_re()
            .captures_iter(body)
            .filter_map(|c| c.get(1).map(|m| (m.start(), m.end())))
            .collect();
        if spans.is_empty() {
            return Ok(None);
        }

        let mut out = body.to_vec();
        let mut changed = false;
        for (start, end) in spans {
            // The capture shape guarantees ASCII.
            let id_text = match std::str::from_utf8(&body[start..end]) {
                Ok(t) => t,
                Err(_) => continue,
            };
            let request_id = RequestId::parse(id_text)?;

            let won = self
                .store
                .set_if_absent(
                    StoreRole::Approval,
                    &lock_key(request_id.as_str()),
                    "armed",
                    self.config.lock_ttl(),
                )
                .await?;
            if !won {
                debug!("rewrite for {} already in flight; skipping", request_id);
                continue;
            }

            let blocked: Option<BlockedRequest> = get_json(
                self.store.as_ref(),
                StoreRole::Approval,
                &blocked_key(request_id.as_str()),
            )
            .await?;
            if blocked.is_none() {
                debug!("no blocked record for {}; skipping rewrite", request_id);
                continue;
            }

            let token = OneTimeToken {
                ott_code: OttCode::mint()?,
                request_id: request_id.clone(),
                armed_after: Utc::now().timestamp() + self.config.time_gate_secs as i64,
                origin_host: normalize_host(host),
            };
            put_json(
                self.store.as_ref(),
                StoreRole::Approval,
                &ott_key(token.ott_code.as_str()),
                &token,
                Some(self.config.token_ttl()),
            )
            .await?;

            out[start..end].copy_from_slice(token.ott_code.as_str().as_bytes());
            changed = true;

            self.audit
                .append(AuditEvent::TokenArmed {
                    request_id: request_id.to_string(),
                    origin_host: token.origin_host.clone(),
                    armed_after: token.armed_after,
                })
                .await?;
        }

        Ok(changed.then_some(out))
    }

    /// *Approve*: process every token-shaped string in inbound content from
    /// `host`, then redact them all from the returned body regardless of
    /// outcome. Token text never reaches the visible output.
    pub async fn approve_pass(
        &self,
        body: &[u8],
        host: &str,
    ) -> Result<(Vec<u8>, Vec<ApprovalOutcome>)> {
        let spans: Vec<(usize, usize)> = ott_shaped_re()
            .find_iter(body)
            .map(|m| (m.start(), m.end()))
            .collect();

        let mut outcomes = Vec::new();
        let mut seen = Vec::new();
        for &(start, end) in &spans {
            let code_text = match std::str::from_utf8(&body[start..end]) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if seen.contains(&code_text) {
                continue;
            }
            seen.push(code_text);
            outcomes.push(self.approve_one(code_text, host).await);
        }

        let mut out = body.to_vec();
        for (start, end) in spans {
            out[start..end].copy_from_slice(REDACTED_CODE);
        }
        Ok((out, outcomes))
    }

    /// Evaluate one token. Every rejection is a silent no-op; store
    /// failures leave the token in place.
    async fn approve_one(&self, code_text: &str, host: &str) -> ApprovalOutcome {
        let code = match OttCode::parse(code_text) {
            Ok(c) => c,
            Err(_) => return ApprovalOutcome::Unknown,
        };
        let token: OneTimeToken = match get_json(
            self.store.as_ref(),
            StoreRole::Scan,
            &ott_key(code.as_str()),
        )
        .await
        {
            Ok(Some(t)) => t,
            Ok(None) => {
                debug!("unknown or expired token observed");
                return ApprovalOutcome::Unknown;
            }
            Err(e) => {
                warn!("token lookup failed: {}", e);
                return ApprovalOutcome::Errored;
            }
        };

        if Utc::now().timestamp() < token.armed_after {
            debug!("token for {} echoed before arming", token.request_id);
            return ApprovalOutcome::BeforeArmed;
        }
        if normalize_host(host) != token.origin_host {
            debug!("token for {} replayed from wrong host", token.request_id);
            return ApprovalOutcome::WrongOrigin;
        }

        match self.consume(&token).await {
            Ok(()) => ApprovalOutcome::Approved(token.request_id.clone()),
            Err(e) => {
                warn!("approval sequence failed, token retained: {}", e);
                ApprovalOutcome::Errored
            }
        }
    }

    /// The crash-safe consumption sequence. Order is load-bearing: the
    /// audit entry (with the archived evidence) is durable before the
    /// BlockedRequest is deleted, and the token is deleted last so an
    /// earlier failure leaves it valid for a retry.
    async fn consume(&self, token: &OneTimeToken) -> Result<()> {
        let blocked_k = blocked_key(token.request_id.as_str());
        let archived: Option<BlockedRequest> =
            get_json(self.store.as_ref(), StoreRole::Approval, &blocked_k).await?;

        self.audit
            .append(AuditEvent::Approved {
                request_id: token.request_id.to_string(),
                origin_host: token.origin_host.clone(),
                archived: archived.clone(),
            })
            .await?;

        self.store.delete(StoreRole::Approval, &blocked_k).await?;

        let destination = archived
            .as_ref()
            .map(|b| b.destination.clone())
            .unwrap_or_else(|| token.origin_host.clone());
        let marker = ApprovedMarker {
            request_id: token.request_id.clone(),
            destination: destination.clone(),
            approved_at: Utc::now(),
        };
        let ttl = Some(self.config.approved_ttl());
        put_json(
            self.store.as_ref(),
            StoreRole::Approval,
            &approved_key(token.request_id.as_str()),
            &marker,
            ttl,
        )
        .await?;
        put_json(
            self.store.as_ref(),
            StoreRole::Approval,
            &approved_host_key(&destination),
            &marker,
            ttl,
        )
        .await?;

        self.store
            .delete(StoreRole::Approval, &ott_key(token.ott_code.as_str()))
            .await?;
        Ok(())
    }

    /// Whether `host` carries a live approval marker, letting a retried
    /// request through without a fresh token.
    pub async fn is_host_approved(&self, host: &str) -> Result<bool> {
        let marker: Option<ApprovedMarker> = get_json(
            self.store.as_ref(),
            StoreRole::Scan,
            &approved_host_key(&normalize_host(host)),
        )
        .await?;
        Ok(marker.is_some())
    }
}
