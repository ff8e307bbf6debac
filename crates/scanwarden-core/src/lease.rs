//! A thin manager wrapping a persistence seam ([`Store`]'s lease methods)
//! backed by the relational `scheduler_lock` table, generalized from a
//! single-key KV prefix to a row per named lease. The owner-token fencing
//! scheme and idempotent-reacquire rule make this a true mutual-exclusion
//! primitive rather than a single-owner credential; the "manager wraps
//! store, every call logs via `tracing`" shape stays the same either way.

use std::fmt;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use scanwarden_store::models::LeaseInfo;
use scanwarden_store::Store;

use crate::error::LeaseError;

static OWNER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Builds an owner token of the form `host:pid:counter:random`, so any two
/// processes (or two acquisitions within the same process) never collide.
#[must_use]
pub fn new_owner_token() -> String {
    let host = hostname();
    let pid = process::id();
    let counter = OWNER_COUNTER.fetch_add(1, Ordering::Relaxed);
    let random = Uuid::new_v4();
    format!("{host}:{pid}:{counter}:{random}")
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown-host".to_owned())
}

/// Manages lease acquisition, heartbeating, and release against a [`Store`].
pub struct LeaseLock {
    store: Arc<dyn Store>,
}

impl LeaseLock {
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Acquire or idempotently re-acquire a lease.
    ///
    /// Returns the owner token on success. Returns `Ok(None)` when another,
    /// unexpired owner currently holds the lease — this is the expected
    /// "lost the race" outcome, not an error.
    ///
    /// # Errors
    /// Returns [`LeaseError::Store`] if the underlying store call fails.
    pub async fn acquire(
        &self,
        name: &str,
        ttl_seconds: i64,
        metadata: serde_json::Value,
    ) -> Result<Option<String>, LeaseError> {
        let owner = new_owner_token();
        let now = self.store.now().await.map_err(LeaseError::Store)?;
        let acquired = self
            .store
            .acquire_lease(name, &owner, ttl_seconds, now, metadata)
            .await
            .map_err(LeaseError::Store)?;

        match acquired {
            Some(info) if info.owner == owner => {
                info!(lease = name, owner = %owner, "lease acquired");
                Ok(Some(owner))
            }
            Some(_) => Ok(None),
            None => Ok(None),
        }
    }

    /// Refresh `expires_at`/`last_heartbeat_at` for a lease this owner holds.
    ///
    /// Returns `false` if a concurrent takeover has occurred — callers MUST
    /// treat that as "I no longer own this lease" and abort in-progress
    /// work rather than continue mutating state the mutual-exclusion
    /// invariant protects.
    ///
    /// # Errors
    /// Returns [`LeaseError::Store`] if the underlying store call fails.
    pub async fn heartbeat(&self, name: &str, owner: &str, ttl_seconds: i64) -> Result<bool, LeaseError> {
        let now = self.store.now().await.map_err(LeaseError::Store)?;
        let ok = self
            .store
            .renew_lease(name, owner, ttl_seconds, now)
            .await
            .map_err(LeaseError::Store)?;
        if !ok {
            warn!(lease = name, owner = %owner, "lease heartbeat refused — lost ownership");
        }
        Ok(ok)
    }

    /// Extend the lease's TTL by an additional amount without resetting the
    /// heartbeat clock otherwise. Implemented in
    /// terms of `heartbeat` with a larger TTL since the store only tracks a
    /// single `expires_at`, not a base TTL plus increment.
    ///
    /// # Errors
    /// Returns [`LeaseError::Store`] if the underlying store call fails.
    pub async fn extend(
        &self,
        name: &str,
        owner: &str,
        ttl_seconds: i64,
        additional_seconds: i64,
    ) -> Result<bool, LeaseError> {
        self.heartbeat(name, owner, ttl_seconds.saturating_add(additional_seconds)).await
    }

    /// Release a lease this owner holds.
    ///
    /// # Errors
    /// Returns [`LeaseError::Store`] if the underlying store call fails.
    pub async fn release(&self, name: &str, owner: &str) -> Result<(), LeaseError> {
        let released = self.store.release_lease(name, owner).await.map_err(LeaseError::Store)?;
        if released {
            info!(lease = name, owner = %owner, "lease released");
        } else {
            warn!(lease = name, owner = %owner, "release no-op — owner did not match");
        }
        Ok(())
    }

    /// Read current lease state without attempting to acquire it.
    ///
    /// # Errors
    /// Returns [`LeaseError::Store`] if the underlying store call fails.
    pub async fn info(&self, name: &str) -> Result<Option<LeaseInfo>, LeaseError> {
        self.store.get_lease(name).await.map_err(LeaseError::Store)
    }

    /// Forcibly clear a lease regardless of current owner. Operator
    /// escape hatch for a stuck lease; not used by normal dispatcher flow.
    ///
    /// # Errors
    /// Returns [`LeaseError::Store`] if the underlying store call fails.
    pub async fn force_release(&self, name: &str) -> Result<(), LeaseError> {
        if let Some(info) = self.info(name).await? {
            self.store
                .release_lease(name, &info.owner)
                .await
                .map_err(LeaseError::Store)?;
            warn!(lease = name, prior_owner = %info.owner, "lease force-released");
        }
        Ok(())
    }

    /// Whether the lease identified by `info` is currently expired relative
    /// to the store's clock.
    #[must_use]
    pub fn is_expired(info: &LeaseInfo, now: DateTime<Utc>) -> bool {
        !info.is_held(now)
    }
}

impl fmt::Debug for LeaseLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseLock").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use scanwarden_store::memory::MemoryStore;

    fn store() -> Arc<dyn Store> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn acquire_is_mutually_exclusive_across_lock_instances() {
        let s = store();
        let lock_a = LeaseLock::new(Arc::clone(&s));
        let lock_b = LeaseLock::new(Arc::clone(&s));

        let owner_a = lock_a
            .acquire("scheduler_execution", 30, serde_json::json!({}))
            .await
            .unwrap();
        assert!(owner_a.is_some());

        let owner_b = lock_b
            .acquire("scheduler_execution", 30, serde_json::json!({}))
            .await
            .unwrap();
        assert!(owner_b.is_none(), "second acquirer must lose the race");
    }

    #[tokio::test]
    async fn reacquire_by_same_owner_is_idempotent() {
        let s = store();
        let lock = LeaseLock::new(Arc::clone(&s));
        let owner = new_owner_token();

        let now = s.now().await.unwrap();
        let first = s
            .acquire_lease("scheduler_execution", &owner, 30, now, serde_json::json!({}))
            .await
            .unwrap();
        assert!(first.is_some());

        let second = s
            .acquire_lease("scheduler_execution", &owner, 30, now, serde_json::json!({}))
            .await
            .unwrap();
        assert!(second.is_some(), "same owner re-acquiring must succeed");

        let _ = lock;
    }

    #[tokio::test]
    async fn heartbeat_fails_after_takeover() {
        let s = store();
        let lock = LeaseLock::new(Arc::clone(&s));

        let owner_a = lock
            .acquire("scheduler_execution", 1, serde_json::json!({}))
            .await
            .unwrap()
            .unwrap();

        // Force-expire by waiting past ttl using a manually crafted clock:
        // MemoryStore uses Utc::now(), so sleep past the 1s ttl.
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;

        let owner_b = lock
            .acquire("scheduler_execution", 30, serde_json::json!({}))
            .await
            .unwrap();
        assert!(owner_b.is_some(), "expired lease must be acquirable by a new owner");

        let ok = lock.heartbeat("scheduler_execution", &owner_a, 30).await.unwrap();
        assert!(!ok, "stale owner's heartbeat must be refused after takeover");
    }
}
