//! Bounded lease pool over dedicated Postgres connections.
//!
//! Capacity is fixed at construction and enforced with a semaphore, so
//! outstanding leases can never exceed it and waiting is always bounded.
//! Connections are dialed lazily and returned to the idle set when a lease
//! drops; a periodic probe evicts dead idle connections.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sqlx::postgres::PgConnection;
use sqlx::{Connection, Postgres, Transaction};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use relay_common::RelayError;

use crate::store::classify_sqlx;

struct PoolInner {
    url: String,
    capacity: usize,
    default_acquire_timeout: Duration,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<PgConnection>>,
    lease_counter: AtomicU64,
}

/// Fixed-capacity store connection pool.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(url: impl Into<String>, capacity: usize, acquire_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                url: url.into(),
                capacity,
                default_acquire_timeout: acquire_timeout,
                permits: Arc::new(Semaphore::new(capacity)),
                idle: Mutex::new(VecDeque::with_capacity(capacity)),
                lease_counter: AtomicU64::new(1),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Acquire a lease, waiting at most the configured timeout.
    pub async fn acquire(&self) -> Result<ConnectionLease, RelayError> {
        self.acquire_timeout(self.inner.default_acquire_timeout).await
    }

    /// Acquire a lease, waiting at most `wait` for a free slot.
    pub async fn acquire_timeout(&self, wait: Duration) -> Result<ConnectionLease, RelayError> {
        let permit = timeout(wait, Arc::clone(&self.inner.permits).acquire_owned())
            .await
            .map_err(|_| {
                RelayError::PoolExhausted(format!(
                    "no free store connection within {}ms (capacity {})",
                    wait.as_millis(),
                    self.inner.capacity
                ))
            })?
            .map_err(|_| RelayError::TransientIo("connection pool closed".into()))?;

        let reused = match self.inner.idle.lock() {
            Ok(mut idle) => idle.pop_front(),
            Err(_) => None,
        };
        let conn = match reused {
            Some(conn) => conn,
            None => PgConnection::connect(&self.inner.url)
                .await
                .map_err(|e| RelayError::TransientIo(format!("store connect failed: {e}")))?,
        };

        Ok(ConnectionLease {
            id: self.inner.lease_counter.fetch_add(1, Ordering::Relaxed),
            acquired_at: Instant::now(),
            in_transaction: false,
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Round-trip a trivial query. Used at startup to fail fast before
    /// serving traffic.
    pub async fn check(&self) -> Result<(), RelayError> {
        let mut lease = self.acquire().await?;
        lease.ping().await
    }

    /// Periodically probe idle connections and evict the dead ones.
    /// Replacements are dialed lazily on the next acquire.
    pub fn spawn_health_probe(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                probe_idle(&inner).await;
            }
        })
    }
}

async fn probe_idle(inner: &Arc<PoolInner>) {
    let candidates: Vec<PgConnection> = match inner.idle.lock() {
        Ok(mut idle) => idle.drain(..).collect(),
        Err(_) => return,
    };
    if candidates.is_empty() {
        return;
    }

    let mut healthy = Vec::with_capacity(candidates.len());
    let mut evicted = 0usize;
    for mut conn in candidates {
        match sqlx::query("SELECT 1").execute(&mut conn).await {
            Ok(_) => healthy.push(conn),
            Err(e) => {
                evicted += 1;
                warn!(error = %e, "Evicting unhealthy idle store connection");
            }
        }
    }
    if evicted > 0 {
        debug!(evicted, kept = healthy.len(), "Idle connection probe complete");
    }

    if let Ok(mut idle) = inner.idle.lock() {
        for conn in healthy {
            if idle.len() < inner.capacity {
                idle.push_back(conn);
            }
        }
    }
}

/// Exclusive handle to one pooled connection. Dropping the lease returns
/// the connection to the pool and frees its capacity slot.
pub struct ConnectionLease {
    id: u64,
    acquired_at: Instant,
    in_transaction: bool,
    conn: Option<PgConnection>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("id", &self.id)
            .field("acquired_at", &self.acquired_at)
            .field("in_transaction", &self.in_transaction)
            .finish_non_exhaustive()
    }
}

impl ConnectionLease {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn age(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Open a transaction on the leased connection. Call
    /// [`finish_transaction`](Self::finish_transaction) after commit or
    /// rollback to clear the flag.
    pub async fn begin(&mut self) -> Result<Transaction<'_, Postgres>, RelayError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| RelayError::TransientIo("lease has no connection".into()))?;
        self.in_transaction = true;
        conn.begin().await.map_err(classify_sqlx)
    }

    pub fn finish_transaction(&mut self) {
        self.in_transaction = false;
    }

    pub async fn ping(&mut self) -> Result<(), RelayError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| RelayError::TransientIo("lease has no connection".into()))?;
        sqlx::query("SELECT 1")
            .execute(conn)
            .await
            .map(|_| ())
            .map_err(classify_sqlx)
    }

    pub(crate) fn connection(&mut self) -> Option<&mut PgConnection> {
        self.conn.as_mut()
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            // A lease dropped mid-transaction still returns its connection;
            // sqlx rolls the open transaction back on next use.
            if let Ok(mut idle) = self.pool.idle.lock() {
                if idle.len() < self.pool.capacity {
                    idle.push_back(conn);
                }
            }
        }
        // The permit drops with the lease, freeing the capacity slot.
    }
}
