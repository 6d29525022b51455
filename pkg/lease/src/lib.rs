//! Time-bounded exclusive claims on string keys.
//!
//! A [`LeaseLock`] polls a [`LeaseBackend`] until it owns the key or the wait
//! budget runs out. The returned [`LeaseGuard`] releases on drop; if the
//! holder dies without dropping it, the lease simply expires.

mod file;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

pub use file::FileLeaseBackend;

const POLL_INTERVAL_MIN: Duration = Duration::from_millis(2);
const POLL_INTERVAL_MAX: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LeaseError {
    #[error("timed out after {waited:?} waiting for lease on `{key}`")]
    Timeout { key: String, waited: Duration },
    #[error("lease backend io error: {0}")]
    Io(String),
    #[error("lease record for `{key}` is unreadable: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("lease table lock poisoned")]
    Poisoned,
}

impl From<std::io::Error> for LeaseError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

/// Storage for live leases. Implementations must make `try_claim` atomic
/// with respect to every other caller sharing the backend.
pub trait LeaseBackend: Send + Sync {
    /// Claims `key` for `holder` if no other unexpired lease exists. A live
    /// lease held by the same holder is not re-entered.
    fn try_claim(&self, key: &str, holder: &str, lease_duration: Duration)
    -> Result<bool, LeaseError>;

    /// Removes the lease if `holder` still owns it. Returns whether it did.
    fn release(&self, key: &str, holder: &str) -> Result<bool, LeaseError>;
}

#[derive(Debug, Clone)]
struct HeldLease {
    holder: String,
    expires_at: Instant,
}

/// Lease table for callers sharing one process.
#[derive(Debug, Default)]
pub struct InMemoryLeaseBackend {
    leases: Mutex<HashMap<String, HeldLease>>,
}

impl InMemoryLeaseBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LeaseBackend for InMemoryLeaseBackend {
    fn try_claim(
        &self,
        key: &str,
        holder: &str,
        lease_duration: Duration,
    ) -> Result<bool, LeaseError> {
        let mut leases = self.leases.lock().map_err(|_| LeaseError::Poisoned)?;
        let now = Instant::now();
        if let Some(current) = leases.get(key)
            && current.expires_at > now
        {
            return Ok(false);
        }
        leases.insert(
            key.to_string(),
            HeldLease {
                holder: holder.to_string(),
                expires_at: now + lease_duration,
            },
        );
        Ok(true)
    }

    fn release(&self, key: &str, holder: &str) -> Result<bool, LeaseError> {
        let mut leases = self.leases.lock().map_err(|_| LeaseError::Poisoned)?;
        match leases.get(key) {
            Some(current) if current.holder == holder => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Clone)]
pub struct LeaseLock {
    backend: Arc<dyn LeaseBackend>,
}

impl LeaseLock {
    pub fn new(backend: Arc<dyn LeaseBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryLeaseBackend::new()))
    }

    /// Blocks the calling thread until `key` is owned by `holder` or
    /// `wait_timeout` has elapsed.
    pub fn acquire(
        &self,
        key: &str,
        holder: &str,
        lease_duration: Duration,
        wait_timeout: Duration,
    ) -> Result<LeaseGuard, LeaseError> {
        let started = Instant::now();
        let deadline = started + wait_timeout;
        let mut backoff = POLL_INTERVAL_MIN;
        let mut contended = false;
        loop {
            // The backend stamps its own expiry during the claim, so the
            // guard's deadline must not be later than that one.
            let claimed_at = Instant::now();
            if self.backend.try_claim(key, holder, lease_duration)? {
                if contended {
                    tracing::debug!(
                        key,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "lease acquired after contention"
                    );
                }
                return Ok(LeaseGuard {
                    backend: Arc::clone(&self.backend),
                    key: key.to_string(),
                    holder: holder.to_string(),
                    expires_at: claimed_at + lease_duration,
                    released: false,
                });
            }
            contended = true;
            let now = Instant::now();
            if now >= deadline {
                return Err(LeaseError::Timeout {
                    key: key.to_string(),
                    waited: now - started,
                });
            }
            std::thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(POLL_INTERVAL_MAX);
        }
    }
}

/// Proof of ownership of a lease. Dropping the guard releases the lease.
pub struct LeaseGuard {
    backend: Arc<dyn LeaseBackend>,
    key: String,
    holder: String,
    expires_at: Instant,
    released: bool,
}

impl LeaseGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Whether the lease has outlived its duration. Past this point another
    /// holder may own the key.
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn release(mut self) -> Result<bool, LeaseError> {
        self.released = true;
        self.backend.release(&self.key, &self.holder)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.backend.release(&self.key, &self.holder) {
            tracing::warn!(key = %self.key, error = %err, "lease release failed; it will expire");
        }
    }
}
