//! Shared per-process state, built once at startup and handed to each
//! connection task behind an `Arc`.

use std::sync::Arc;

use crate::audit::AuditLog;
use crate::config::{AppConfig, StoreMode};
use crate::dlp::domains::SuffixList;
use crate::dlp::engine::DlpEngine;
use crate::error::Result;
use crate::ott::OttProtocol;
use crate::scan::ScanClient;
use crate::store::{MemoryStore, PolicyStore, RespStore, SecurityLevelCache};

/// Everything a connection handler needs: compiled policy, the scan
/// client with its circuit breaker, the token protocol, and the audit
/// sink. No global singletons; tests build their own instances.
pub struct AppState {
    pub config: AppConfig,
    pub dlp: DlpEngine,
    pub scanner: ScanClient,
    pub ott: OttProtocol,
    pub audit: AuditLog,
    pub security: Arc<SecurityLevelCache>,
    pub store: Arc<dyn PolicyStore>,
    pub fail_open: SuffixList,
}

impl AppState {
    /// Build state from validated config, opening the configured store
    /// backend.
    pub fn from_config(config: AppConfig) -> Result<Arc<Self>> {
        let store: Arc<dyn PolicyStore> = match config.store.mode {
            StoreMode::Memory => Arc::new(MemoryStore::new()),
            StoreMode::Resp => Arc::new(RespStore::new(config.store.clone())?),
        };
        Self::with_store(config, store)
    }

    /// Build state over an existing store. Used by tests to inject a
    /// memory store they can inspect.
    pub fn with_store(config: AppConfig, store: Arc<dyn PolicyStore>) -> Result<Arc<Self>> {
        let dlp = DlpEngine::new(&config.patterns, &config.domains.known_suffixes)?;
        let scanner = ScanClient::new(config.scanner.clone());
        let audit = AuditLog::new(Arc::clone(&store));
        let ott = OttProtocol::new(Arc::clone(&store), audit.clone(), config.ott.clone());
        let fail_open = SuffixList::new(&config.scanner.fail_open_domains);
        let security = Arc::new(SecurityLevelCache::default());
        Ok(Arc::new(AppState {
            config,
            dlp,
            scanner,
            ott,
            audit,
            security,
            store,
            fail_open,
        }))
    }
}
