//! Security-level cache and poll loop.
//!
//! The operator-set [`SecurityLevel`] lives in the store under
//! `config:security_level`. A background task polls it at the configured
//! fast interval, falling back to exponential backoff while the store is
//! unreachable and resetting to fast polling on the first success. The
//! cache always serves the last-known-good value.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::dlp::SecurityLevel;
use crate::store::{fetch_security_level, PolicyStore};

/// Longest interval the backoff is allowed to reach.
const MAX_POLL_BACKOFF: Duration = Duration::from_secs(120);

/// Process-wide cached security level, shared across connection tasks.
pub struct SecurityLevelCache {
    level: RwLock<SecurityLevel>,
}

impl SecurityLevelCache {
    pub fn new(initial: SecurityLevel) -> Self {
        Self {
            level: RwLock::new(initial),
        }
    }

    pub fn get(&self) -> SecurityLevel {
        *self.level.read().unwrap()
    }

    pub fn set(&self, level: SecurityLevel) {
        *self.level.write().unwrap() = level;
    }
}

impl Default for SecurityLevelCache {
    fn default() -> Self {
        Self::new(SecurityLevel::default())
    }
}

/// Spawn the poll loop. The handle is held by the server for its lifetime.
pub fn spawn_poller(
    cache: Arc<SecurityLevelCache>,
    store: Arc<dyn PolicyStore>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut delay = interval;
        loop {
            tokio::time::sleep(delay).await;
            match fetch_security_level(store.as_ref()).await {
                Ok(Some(level)) => {
                    if level != cache.get() {
                        debug!("security level changed to {}", level);
                        cache.set(level);
                    }
                    delay = interval;
                }
                Ok(None) => {
                    // Unset in the store; keep the current value.
                    delay = interval;
                }
                Err(e) => {
                    warn!(
                        "security level poll failed ({}); keeping {} and backing off",
                        e,
                        cache.get()
                    );
                    delay = (delay * 2).min(MAX_POLL_BACKOFF);
                }
            }
        }
    })
}
