//! Per-domain serialisation of host mutations.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// One async mutex per domain, created on first use.
///
/// Pipelines on different domains run concurrently; pipelines on the
/// same domain queue behind each other.
#[derive(Clone, Default)]
pub struct DomainLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

/// Held for the duration of one operation on a domain.
pub struct DomainGuard {
    _guard: OwnedMutexGuard<()>,
}

impl DomainLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, domain: &str) -> DomainGuard {
        let lock = {
            let mut map = self.inner.lock().await;
            // Entries nobody holds or waits on can go.
            map.retain(|key, lock| key == domain || Arc::strong_count(lock) > 1);
            map.entry(domain.to_string()).or_default().clone()
        };
        if lock.try_lock().is_err() {
            debug!(domain, "waiting for another operation on this domain");
        }
        DomainGuard {
            _guard: lock.lock_owned().await,
        }
    }
}
