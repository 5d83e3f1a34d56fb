use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tracing::debug;
use ulid::Ulid;

/// Shared store offering atomic set-if-absent with expiry.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Set `key` to `token` unless it is held and unexpired. Returns whether it was set.
    async fn set_if_absent(&self, key: &str, token: Ulid, ttl: Duration) -> bool;

    /// Clear `key` if it still holds `token`.
    async fn clear(&self, key: &str, token: Ulid);
}

#[derive(Debug, Clone, Copy)]
struct LeaseEntry {
    token: Ulid,
    expires_at: Instant,
}

/// Process-local lease store. Expiry is checked lazily on access.
#[derive(Default)]
pub struct InMemoryLeaseStore {
    leases: DashMap<String, LeaseEntry>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current unexpired holder of `key`, if any.
    pub fn holder(&self, key: &str) -> Option<Ulid> {
        self.leases
            .get(key)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.token)
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn set_if_absent(&self, key: &str, token: Ulid, ttl: Duration) -> bool {
        let now = Instant::now();
        let fresh = LeaseEntry {
            token,
            expires_at: now + ttl,
        };
        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut e) => {
                if e.get().expires_at > now {
                    return false;
                }
                e.insert(fresh);
                true
            }
            Entry::Vacant(e) => {
                e.insert(fresh);
                true
            }
        }
    }

    async fn clear(&self, key: &str, token: Ulid) {
        self.leases.remove_if(key, |_, e| e.token == token);
    }
}

/// A held lease. Dropping it does not release it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub resource_key: String,
    pub token: Ulid,
    pub expires_at: Instant,
}

/// Lease-based mutual exclusion: at most one holder per resource key.
///
/// Failed passes never release; their lease runs out after its duration.
#[derive(Clone)]
pub struct ExecutionLock {
    store: Arc<dyn LeaseStore>,
}

impl ExecutionLock {
    pub fn new(store: Arc<dyn LeaseStore>) -> Self {
        Self { store }
    }

    /// Try to take `resource_key` for `lease_duration`. `None` on contention.
    pub async fn acquire(&self, resource_key: &str, lease_duration: Duration) -> Option<Lease> {
        let token = Ulid::new();
        let expires_at = Instant::now() + lease_duration;
        if self
            .store
            .set_if_absent(resource_key, token, lease_duration)
            .await
        {
            debug!("acquired lease {resource_key} ({token})");
            Some(Lease {
                resource_key: resource_key.to_string(),
                token,
                expires_at,
            })
        } else {
            debug!("lease {resource_key} is held");
            None
        }
    }

    /// Release after a fully successful pass.
    pub async fn release(&self, lease: Lease) {
        self.store.clear(&lease.resource_key, lease.token).await;
        debug!("released lease {} ({})", lease.resource_key, lease.token);
    }
}
