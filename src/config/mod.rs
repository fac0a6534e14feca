//! TOML configuration types for Tollgate.
//!
//! The top-level [`AppConfig`] is deserialized from `tollgate.toml` and
//! contains sections for the ICAP listener, buffer limits, the scan backend,
//! the policy store, the OTT protocol, and the DLP pattern set.
//!
//! # Example `tollgate.toml`
//!
//! ```toml
//! [icap]
//! listen = "127.0.0.1:1344"
//!
//! [scanner]
//! address = "127.0.0.1:3310"
//!
//! [store]
//! mode = "memory"
//!
//! [[patterns]]
//! name = "anthropic"
//! credential = "sk-ant-[A-Za-z0-9-]{20,}"
//! allow_domains = "(^|\\.)api\\.anthropic\\.com$"
//!
//! [domains]
//! known_suffixes = [".anthropic.com", ".github.com"]
//! ```

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TollgateError};

/// ICAP listener configuration (`[icap]` section).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IcapConfig {
    /// Address to listen on (e.g., `"127.0.0.1:1344"`).
    pub listen: String,
    /// Service name advertised in OPTIONS responses.
    #[serde(default = "default_service")]
    pub service: String,
    /// ISTag value advertised in every response. Changing it invalidates
    /// proxy-side caches of our verdicts.
    #[serde(default = "default_istag")]
    pub istag: String,
    /// Preview size offered during capability negotiation, in bytes.
    #[serde(default = "default_preview")]
    pub preview: usize,
}

fn default_service() -> String {
    "tollgate".to_string()
}

fn default_istag() -> String {
    "tollgate-1".to_string()
}

fn default_preview() -> usize {
    1024
}

/// Buffer and decompression limits (`[limits]` section).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Hard cap on the in-memory response scan buffer, in bytes.
    #[serde(default = "default_scan_buffer")]
    pub max_scan_buffer: usize,
    /// Rolling tail buffer kept past the cap, in bytes.
    #[serde(default = "default_tail_buffer")]
    pub tail_buffer: usize,
    /// Absolute decompressed-output cap, in bytes.
    #[serde(default = "default_max_decompressed")]
    pub max_decompressed: u64,
    /// Cumulative compression-ratio cap (output bytes per input byte).
    #[serde(default = "default_max_ratio")]
    pub max_ratio: u64,
}

fn default_scan_buffer() -> usize {
    2 * 1024 * 1024
}

fn default_tail_buffer() -> usize {
    10 * 1024
}

fn default_max_decompressed() -> u64 {
    10 * 1024 * 1024
}

fn default_max_ratio() -> u64 {
    100
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_scan_buffer: default_scan_buffer(),
            tail_buffer: default_tail_buffer(),
            max_decompressed: default_max_decompressed(),
            max_ratio: default_max_ratio(),
        }
    }
}

/// Scan backend configuration (`[scanner]` section).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScannerConfig {
    /// Scanner daemon address (e.g., `"127.0.0.1:3310"`).
    pub address: String,
    /// Per-call socket timeout in seconds (connect, write, and verdict read).
    #[serde(default = "default_scan_timeout")]
    pub timeout_secs: u64,
    /// Size of each length-prefixed chunk streamed to the daemon.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Consecutive failures before the circuit breaker opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Cooldown before the open breaker admits a half-open probe, in seconds.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    /// Domains that fail open (pass through unscanned) when scanning errors.
    /// Everything else fails closed. Dot-boundary suffix entries.
    #[serde(default)]
    pub fail_open_domains: Vec<String>,
}

fn default_scan_timeout() -> u64 {
    30
}

fn default_chunk_size() -> usize {
    16 * 1024
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown() -> u64 {
    30
}

impl ScannerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Which backend the policy store client talks to.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreMode {
    /// In-process TTL map. Approvals do not survive a restart.
    Memory,
    /// External keyed store over the RESP wire protocol.
    Resp,
}

/// Credentials for one store role.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoleCredential {
    pub username: String,
    pub password: String,
}

/// Per-role store credentials (`[store.roles]` section).
///
/// The store enforces distinct ACLs for scan-time reads, approval-issuance
/// writes, audit appends, and health checks; each role authenticates
/// separately.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreRoles {
    pub scan: RoleCredential,
    pub approval: RoleCredential,
    pub audit: RoleCredential,
    pub health: RoleCredential,
}

/// Policy/credential store configuration (`[store]` section).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// Backend selection. `memory` needs no further settings.
    pub mode: StoreMode,
    /// Store address, required for `mode = "resp"`.
    #[serde(default)]
    pub address: Option<String>,
    /// Wrap the store connection in TLS.
    #[serde(default)]
    pub tls: bool,
    /// Server name for TLS certificate verification; defaults to the
    /// host part of `address`.
    #[serde(default)]
    pub tls_server_name: Option<String>,
    /// Bound on every store operation, in milliseconds.
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
    /// Per-role credentials, required for `mode = "resp"`.
    #[serde(default)]
    pub roles: Option<StoreRoles>,
    /// Fast polling interval for the security level, in seconds.
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
}

fn default_store_timeout_ms() -> u64 {
    2000
}

fn default_poll_secs() -> u64 {
    5
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_secs)
    }
}

/// OTT protocol timings (`[ott]` section).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OttConfig {
    /// Seconds between minting a token and it becoming usable. Blocks
    /// self-approval via an immediate echo of the approval command.
    #[serde(default = "default_time_gate")]
    pub time_gate_secs: u64,
    /// TTL of a BlockedRequest record, in seconds.
    #[serde(default = "default_blocked_ttl")]
    pub blocked_ttl_secs: u64,
    /// TTL of a minted token, in seconds.
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    /// TTL of the approved markers, in seconds.
    #[serde(default = "default_approved_ttl")]
    pub approved_ttl_secs: u64,
    /// TTL of the per-request-id rewrite lock, in seconds.
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,
}

fn default_time_gate() -> u64 {
    15
}

fn default_blocked_ttl() -> u64 {
    3600
}

fn default_token_ttl() -> u64 {
    600
}

fn default_approved_ttl() -> u64 {
    300
}

fn default_lock_ttl() -> u64 {
    5
}

impl Default for OttConfig {
    fn default() -> Self {
        Self {
            time_gate_secs: default_time_gate(),
            blocked_ttl_secs: default_blocked_ttl(),
            token_ttl_secs: default_token_ttl(),
            approved_ttl_secs: default_approved_ttl(),
            lock_ttl_secs: default_lock_ttl(),
        }
    }
}

impl OttConfig {
    pub fn blocked_ttl(&self) -> Duration {
        Duration::from_secs(self.blocked_ttl_secs)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn approved_ttl(&self) -> Duration {
        Duration::from_secs(self.approved_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

/// A single DLP pattern (`[[patterns]]` entry).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PatternConfig {
    /// Human-readable pattern name (e.g., `"anthropic"`). Appears in audit
    /// entries and diagnostic headers, never in agent-facing bodies.
    pub name: String,
    /// Regex matched against the accumulated body.
    pub credential: String,
    /// Optional regex the Host header must satisfy for a match to be
    /// tolerated. Absent means any body match blocks.
    #[serde(default)]
    pub allow_domains: Option<String>,
    /// Unconditional block on match, regardless of destination.
    #[serde(default)]
    pub always_block: bool,
}

/// Known-domain policy (`[domains]` section).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DomainsConfig {
    /// Dot-boundary suffix entries; destinations outside this list are
    /// "novel" and subject to the polled security level.
    #[serde(default)]
    pub known_suffixes: Vec<String>,
}

/// Top-level application configuration deserialized from `tollgate.toml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// ICAP listener settings.
    pub icap: IcapConfig,
    /// Buffer and decompression limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Scan backend settings.
    pub scanner: ScannerConfig,
    /// Policy store settings.
    pub store: StoreConfig,
    /// OTT protocol timings.
    #[serde(default)]
    pub ott: OttConfig,
    /// DLP patterns. The service refuses to start with none loaded.
    #[serde(default)]
    pub patterns: Vec<PatternConfig>,
    /// Known-domain suffix list.
    #[serde(default)]
    pub domains: DomainsConfig,
}

impl AppConfig {
    /// Load and parse the configuration from a TOML file at the given path.
    ///
    /// Before parsing, `${VAR}` and `$VAR` placeholders in the TOML text are
    /// replaced with the corresponding environment variable values. An error
    /// is returned if a referenced variable is not set.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let content = substitute_env_vars(&content)?;
        let config: AppConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (templates, tests).
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Fail-closed startup checks.
    ///
    /// An empty pattern set would silently wave every credential through,
    /// so it is a refusal to start, not a warning.
    pub fn validate(&self) -> Result<()> {
        if self.patterns.is_empty() {
            return Err(TollgateError::Config(
                "no DLP patterns loaded; refusing to start".to_string(),
            ));
        }
        for p in &self.patterns {
            Regex::new(&p.credential).map_err(|e| {
                TollgateError::Config(format!("pattern '{}': bad credential regex: {}", p.name, e))
            })?;
            if let Some(allow) = &p.allow_domains {
                Regex::new(allow).map_err(|e| {
                    TollgateError::Config(format!("pattern '{}': bad allow regex: {}", p.name, e))
                })?;
            }
        }
        if self.store.mode == StoreMode::Resp {
            if self.store.address.is_none() {
                return Err(TollgateError::Config(
                    "store.mode = \"resp\" requires store.address".to_string(),
                ));
            }
            if self.store.roles.is_none() {
                return Err(TollgateError::Config(
                    "store.mode = \"resp\" requires [store.roles]".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Replace `${VAR_NAME}` and `$VAR_NAME` placeholders with environment
/// variable values.
///
/// Returns an error containing the variable name if the variable is not set.
fn substitute_env_vars(input: &str) -> Result<String> {
    // Match ${VAR_NAME} (braces form)
    let re_braces = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    // Match $VAR_NAME (no braces, uppercase + underscore only to avoid false positives)
    let re_bare = Regex::new(r"\$([A-Z_][A-Z0-9_]*)").unwrap();

    let mut result = input.to_string();

    for cap in re_braces.captures_iter(input) {
        let var_name = &cap[1];
        let value = std::env::var(var_name)
            .map_err(|_| TollgateError::ConfigEnvVar(var_name.to_string()))?;
        result = result.replace(&cap[0], &value);
    }

    let intermediate = result.clone();
    for cap in re_bare.captures_iter(&intermediate) {
        let var_name = &cap[1];
        let value = std::env::var(var_name)
            .map_err(|_| TollgateError::ConfigEnvVar(var_name.to_string()))?;
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}
