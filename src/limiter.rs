//! Keyed admission limiter.
//!
//! Bounds concurrent executions per logical key (a client, a transport, a
//! caller-chosen label) with one counting semaphore per key. Pools are
//! created lazily on first use and live for the lifetime of the limiter;
//! their capacity never changes once created.
//!
//! Waiters on the same key are served in request order because
//! [`tokio::sync::Semaphore`] is fair.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore, TryAcquireError};
use tracing::debug;

use crate::config::ConcurrencyConfig;
use crate::{AppError, Result};

/// A held slot in a keyed pool. Dropping it releases the slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    key: String,
    _permit: OwnedSemaphorePermit,
}

impl AdmissionPermit {
    /// Key of the pool this permit belongs to.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Per-key concurrency limiter.
#[derive(Debug)]
pub struct AdmissionLimiter {
    default_capacity: usize,
    named: HashMap<String, usize>,
    pools: RwLock<HashMap<String, Arc<Semaphore>>>,
    closed: AtomicBool,
}

impl AdmissionLimiter {
    /// Create a limiter with a global default and no named limits.
    #[must_use]
    pub fn new(default_capacity: usize) -> Self {
        Self {
            default_capacity: default_capacity.max(1),
            named: HashMap::new(),
            pools: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a limiter from the `[concurrency]` configuration section.
    #[must_use]
    pub fn from_config(config: &ConcurrencyConfig) -> Self {
        Self {
            default_capacity: config.default_limit.max(1),
            named: config.limits.clone(),
            pools: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Wait for a free slot in `key`'s pool.
    ///
    /// `capacity` overrides the configured capacity, but only when this call
    /// creates the pool.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Shutdown`] if the pool has been closed.
    pub async fn acquire(&self, key: &str, capacity: Option<usize>) -> Result<AdmissionPermit> {
        let pool = self.pool(key, capacity).await?;
        let permit = Arc::clone(&pool)
            .acquire_owned()
            .await
            .map_err(|_| AppError::Shutdown(format!("admission pool '{key}' is closed")))?;
        debug!(key, available = pool.available_permits(), "admission permit acquired");
        Ok(AdmissionPermit {
            key: key.to_owned(),
            _permit: permit,
        })
    }

    /// Like [`acquire`](Self::acquire), but give up after `wait`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::CapacityExceeded`] if no slot frees up in time.
    pub async fn acquire_within(
        &self,
        key: &str,
        capacity: Option<usize>,
        wait: Duration,
    ) -> Result<AdmissionPermit> {
        tokio::time::timeout(wait, self.acquire(key, capacity))
            .await
            .map_err(|_| {
                AppError::CapacityExceeded(format!(
                    "no admission slot for '{key}' within {wait:?}"
                ))
            })?
    }

    /// Take a slot only if one is free right now.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::CapacityExceeded`] if the pool is full, or
    /// [`AppError::Shutdown`] if it has been closed.
    pub async fn try_acquire(&self, key: &str, capacity: Option<usize>) -> Result<AdmissionPermit> {
        let pool = self.pool(key, capacity).await?;
        match pool.try_acquire_owned() {
            Ok(permit) => Ok(AdmissionPermit {
                key: key.to_owned(),
                _permit: permit,
            }),
            Err(TryAcquireError::NoPermits) => Err(AppError::CapacityExceeded(format!(
                "admission pool '{key}' is full"
            ))),
            Err(TryAcquireError::Closed) => Err(AppError::Shutdown(format!(
                "admission pool '{key}' is closed"
            ))),
        }
    }

    /// Return a slot to its pool.
    pub fn release(&self, permit: AdmissionPermit) {
        debug!(key = permit.key(), "admission permit released");
        drop(permit);
    }

    /// Free slots in `key`'s pool, or `None` if the pool does not exist yet.
    pub async fn available(&self, key: &str) -> Option<usize> {
        self.pools
            .read()
            .await
            .get(key)
            .map(|pool| pool.available_permits())
    }

    /// Close the limiter; pending and later acquisitions on any key fail
    /// with [`AppError::Shutdown`]. Held permits stay valid until dropped.
    pub async fn close(&self) {
        // Taken under the write lock so no pool is created unclosed.
        let pools = self.pools.write().await;
        self.closed.store(true, Ordering::SeqCst);
        for pool in pools.values() {
            pool.close();
        }
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Capacity used when `key`'s pool is created without an override.
    #[must_use]
    pub fn configured_capacity(&self, key: &str) -> usize {
        self.named
            .get(key)
            .copied()
            .unwrap_or(self.default_capacity)
    }

    async fn pool(&self, key: &str, capacity: Option<usize>) -> Result<Arc<Semaphore>> {
        if let Some(pool) = self.pools.read().await.get(key) {
            return Ok(Arc::clone(pool));
        }

        let mut pools = self.pools.write().await;
        if self.is_closed() {
            return Err(AppError::Shutdown(format!(
                "admission limiter is closed, no pool for '{key}'"
            )));
        }
        let pool = pools.entry(key.to_owned()).or_insert_with(|| {
            let size = capacity
                .unwrap_or_else(|| self.configured_capacity(key))
                .max(1);
            debug!(key, capacity = size, "admission pool created");
            Arc::new(Semaphore::new(size))
        });
        Ok(Arc::clone(pool))
    }
}
