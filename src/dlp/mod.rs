pub mod domains;
pub mod engine;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Operator-controlled strictness for destinations outside the known-domain
/// list. Polled from the policy store at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// Novel destinations pass.
    Relaxed,
    /// Novel destinations are blocked but flagged for approval.
    Balanced,
    /// Novel destinations are blocked outright.
    Strict,
}

impl Default for SecurityLevel {
    fn default() -> Self {
        SecurityLevel::Balanced
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SecurityLevel::Relaxed => "relaxed",
            SecurityLevel::Balanced => "balanced",
            SecurityLevel::Strict => "strict",
        };
        f.write_str(s)
    }
}

/// Outcome of evaluating one outbound exchange.
///
/// The pattern name travels to audit entries and proxy-facing diagnostic
/// headers only; agent-facing bodies carry the reason and a request id,
/// never the pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DlpDecision {
    /// Nothing matched; forward unmodified.
    Allow,
    /// Hard block.
    Block {
        reason: String,
        /// Name of the matching pattern, absent for domain-policy blocks.
        pattern: Option<String>,
    },
    /// Blocked, but flagged as awaiting human approval (novel destination
    /// under the `balanced` security level).
    Prompt { reason: String },
}

impl DlpDecision {
    /// Whether the exchange is withheld from the destination.
    pub fn is_blocking(&self) -> bool {
        !matches!(self, DlpDecision::Allow)
    }
}
