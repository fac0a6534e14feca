use thiserror::Error;

/// Unified error type for the Tollgate library.
///
/// The variants follow the gateway's failure taxonomy: only
/// [`ScanBackend`](TollgateError::ScanBackend) and
/// [`PolicyStore`](TollgateError::PolicyStore) are retryable (circuit
/// breaker, lazy reconnect); every other kind is terminal for the current
/// request. Error messages never carry matched pattern contents or live
/// token values.
#[derive(Debug, Error)]
pub enum TollgateError {
    /// Malformed ICAP framing; the connection is rejected.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Scanner daemon unreachable, slow, or speaking garbage.
    #[error("Scan backend error: {0}")]
    ScanBackend(String),

    /// The scan-backend circuit breaker is open; no connection was attempted.
    #[error("Scan backend circuit open")]
    CircuitOpen,

    /// Policy/credential store unreachable or returned a malformed value.
    #[error("Policy store error: {0}")]
    PolicyStore(String),

    /// CSPRNG unavailable. Fail closed, no weaker fallback.
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Malformed request-id or token shape, rejected before any store access.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Decompression aborted: output or ratio limit breached.
    #[error("Decompression bomb: {produced} bytes from {consumed} compressed ({limit} limit)")]
    DecompressionBomb {
        consumed: u64,
        produced: u64,
        limit: &'static str,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config references unset environment variable: {0}")]
    ConfigEnvVar(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TollgateError>;

impl TollgateError {
    /// Whether this error kind may be retried by its owning subsystem.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TollgateError::ScanBackend(_) | TollgateError::PolicyStore(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TollgateError = io_err.into();
        assert!(matches!(err, TollgateError::Io(_)));
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn bomb_error_displays_both_counters() {
        let err = TollgateError::DecompressionBomb {
            consumed: 1024,
            produced: 10_000_000,
            limit: "ratio",
        };
        let msg = err.to_string();
        assert!(msg.contains("10000000"));
        assert!(msg.contains("ratio"));
    }

    #[test]
    fn only_scan_and_store_errors_are_retryable() {
        assert!(TollgateError::ScanBackend("down".into()).is_retryable());
        assert!(TollgateError::PolicyStore("down".into()).is_retryable());
        assert!(!TollgateError::CircuitOpen.is_retryable());
        assert!(!TollgateError::Crypto("no entropy".into()).is_retryable());
        assert!(!TollgateError::Validation("bad id".into()).is_retryable());
        assert!(!TollgateError::Protocol("bad framing".into()).is_retryable());
    }

    #[test]
    fn config_parse_error_converts() {
        let bad_toml = "[invalid";
        let toml_err = toml::from_str::<toml::Value>(bad_toml).unwrap_err();
        let err: TollgateError = toml_err.into();
        assert!(matches!(err, TollgateError::ConfigParse(_)));
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TollgateError>();
    }
}
