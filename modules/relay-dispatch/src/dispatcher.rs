//! Keyed dispatch: per-resource-key FIFO partitions, bounded worker pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use relay_common::{Command, Outcome, RelayError};

use crate::retry::RetryPolicy;
use crate::traits::OutcomeStore;

/// Queue depth per partition. Senders backpressure when a key is this far
/// behind rather than buffering without bound.
const PARTITION_QUEUE_DEPTH: usize = 256;

/// A partition whose queue has been empty this long exits and is reclaimed.
const PARTITION_IDLE_AFTER: Duration = Duration::from_secs(30);

/// How long a conflict loser polls for the winner's outcome.
const CONFLICT_WAIT_POLL: Duration = Duration::from_millis(50);
const CONFLICT_WAIT_ROUNDS: u32 = 100;

struct Job {
    cmd: Command,
    done: oneshot::Sender<Result<Outcome, RelayError>>,
}

struct DispatchInner<S: OutcomeStore> {
    store: Arc<S>,
    policy: RetryPolicy,
    /// Bounds how many partitions execute handlers at once.
    workers: Arc<Semaphore>,
    /// A partition whose queue stays empty this long exits and is reclaimed.
    idle_after: Duration,
    /// Live partitions keyed by resource key. Entries are removed by the
    /// partition task itself once idle.
    partitions: Mutex<HashMap<String, mpsc::Sender<Job>>>,
}

/// Receives commands from the gateway session and the API adapter, dedups
/// on idempotency key, and runs them with per-key ordering.
pub struct Dispatcher<S: OutcomeStore> {
    inner: Arc<DispatchInner<S>>,
}

impl<S: OutcomeStore> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: OutcomeStore> Dispatcher<S> {
    pub fn new(store: Arc<S>, policy: RetryPolicy, worker_limit: usize) -> Self {
        Self::with_idle_window(store, policy, worker_limit, PARTITION_IDLE_AFTER)
    }

    /// Like [`new`](Self::new), with a custom window after which an empty
    /// partition exits. Short windows exercise reclamation under load.
    pub fn with_idle_window(
        store: Arc<S>,
        policy: RetryPolicy,
        worker_limit: usize,
        idle_after: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(DispatchInner {
                store,
                policy,
                workers: Arc::new(Semaphore::new(worker_limit.max(1))),
                idle_after,
                partitions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Submit a command and wait for its outcome.
    pub async fn submit(&self, cmd: Command) -> Result<Outcome, RelayError> {
        self.enqueue(cmd).await?.wait().await
    }

    /// Submit a command and return a waiter. Dropping the waiter abandons
    /// the wait only; the command still runs to completion and its outcome
    /// stays queryable by idempotency key.
    pub async fn enqueue(&self, cmd: Command) -> Result<OutcomeWaiter, RelayError> {
        // Fast path: a recorded outcome means this key is already settled.
        // A lookup failure is not fatal here; the execute path dedups again.
        match self.inner.store.lookup(&cmd.idempotency_key).await {
            Ok(Some(outcome)) => {
                debug!(
                    key = %cmd.idempotency_key,
                    "Outcome already recorded, skipping dispatch"
                );
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(Ok(outcome));
                return Ok(OutcomeWaiter { rx });
            }
            Ok(None) => {}
            Err(e) => {
                warn!(key = %cmd.idempotency_key, error = %e, "Outcome pre-check failed, dispatching anyway");
            }
        }

        let (tx, rx) = oneshot::channel();
        let mut job = Job { cmd, done: tx };

        // Route to the partition for this resource key, respawning if the
        // partition reclaimed itself between lookup and send.
        loop {
            let sender = self.partition_sender(&job.cmd.resource_key).await;
            match sender.send(job).await {
                Ok(()) => break,
                Err(mpsc::error::SendError(j)) => {
                    job = j;
                    let mut parts = self.inner.partitions.lock().await;
                    if let Some(existing) = parts.get(&job.cmd.resource_key) {
                        if existing.same_channel(&sender) {
                            parts.remove(&job.cmd.resource_key);
                        }
                    }
                }
            }
        }

        Ok(OutcomeWaiter { rx })
    }

    async fn partition_sender(&self, resource_key: &str) -> mpsc::Sender<Job> {
        let mut parts = self.inner.partitions.lock().await;
        if let Some(sender) = parts.get(resource_key) {
            return sender.clone();
        }

        let (tx, rx) = mpsc::channel(PARTITION_QUEUE_DEPTH);
        parts.insert(resource_key.to_string(), tx.clone());
        let inner = Arc::clone(&self.inner);
        let key = resource_key.to_string();
        tokio::spawn(run_partition(inner, key, rx));
        tx
    }
}

/// Handle for awaiting a command's outcome.
pub struct OutcomeWaiter {
    rx: oneshot::Receiver<Result<Outcome, RelayError>>,
}

impl OutcomeWaiter {
    pub async fn wait(self) -> Result<Outcome, RelayError> {
        self.rx
            .await
            .map_err(|_| RelayError::TransientIo("dispatcher shut down before completion".into()))?
    }
}

/// Sequential task for one resource key. Jobs run strictly in arrival
/// order; the worker semaphore bounds how many partitions run at once.
async fn run_partition<S: OutcomeStore>(
    inner: Arc<DispatchInner<S>>,
    key: String,
    mut rx: mpsc::Receiver<Job>,
) {
    debug!(resource_key = %key, "Partition started");
    loop {
        let job = match timeout(inner.idle_after, rx.recv()).await {
            Ok(Some(job)) => job,
            Ok(None) => break,
            Err(_) => {
                // Idle: deregister under the map lock. A send on an old
                // sender clone can still land between the emptiness check
                // and close(); those jobs must stay ahead of later commands
                // for this key, so they move onto a fresh channel that
                // replaces ours in the map before the lock is released.
                let mut parts = inner.partitions.lock().await;
                if !rx.is_empty() {
                    continue;
                }
                rx.close();
                let mut stragglers = Vec::new();
                while let Ok(job) = rx.try_recv() {
                    stragglers.push(job);
                }
                if stragglers.is_empty() {
                    parts.remove(&key);
                    break;
                }
                let (tx, fresh_rx) = mpsc::channel(PARTITION_QUEUE_DEPTH);
                for job in stragglers {
                    // Cannot fail: the fresh channel is empty and at least
                    // as deep as the closed one.
                    if let Err(e) = tx.try_send(job) {
                        error!(resource_key = %key, error = %e, "Dropped command during partition handoff");
                    }
                }
                parts.insert(key.clone(), tx);
                rx = fresh_rx;
                continue;
            }
        };
        handle_job(&inner, job).await;
    }
    debug!(resource_key = %key, "Partition reclaimed");
}

async fn handle_job<S: OutcomeStore>(inner: &Arc<DispatchInner<S>>, job: Job) {
    let permit = match inner.workers.acquire().await {
        Ok(p) => p,
        Err(_) => {
            error!("Worker semaphore closed, dropping command");
            return;
        }
    };
    let result = process(inner, &job.cmd).await;
    drop(permit);

    if let Err(e) = &result {
        warn!(
            key = %job.cmd.idempotency_key,
            origin = job.cmd.origin.as_str(),
            error = %e,
            "Command failed without a recorded outcome"
        );
    }
    // Receiver may have given up (deadline expired); the outcome is still
    // recorded and queryable.
    let _ = job.done.send(result);
}

/// Execute one command through the retry layer.
async fn process<S: OutcomeStore>(
    inner: &Arc<DispatchInner<S>>,
    cmd: &Command,
) -> Result<Outcome, RelayError> {
    let policy = &inner.policy;
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        match inner.store.execute(cmd, attempts as i32).await {
            Ok(outcome) => return Ok(outcome),
            Err(RelayError::Conflict(reason)) => {
                debug!(key = %cmd.idempotency_key, %reason, "Key owned by concurrent attempt, waiting for winner");
                if let Some(outcome) = wait_for_winner(inner, &cmd.idempotency_key).await? {
                    return Ok(outcome);
                }
                // Winner rolled back without recording; loop re-claims the key.
                if attempts >= policy.max_attempts {
                    let outcome = inner
                        .store
                        .record_failure(
                            cmd,
                            RelayError::Conflict(reason).failure_kind(),
                            attempts as i32,
                        )
                        .await?;
                    return Ok(outcome);
                }
            }
            Err(e) if e.is_retryable() && attempts < policy.max_attempts => {
                let delay = policy.backoff(attempts);
                warn!(
                    key = %cmd.idempotency_key,
                    attempt = attempts,
                    backoff_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                let kind = e.failure_kind();
                warn!(
                    key = %cmd.idempotency_key,
                    attempts,
                    kind = %kind,
                    error = %e,
                    "Terminal failure, recording outcome"
                );
                let outcome = inner.store.record_failure(cmd, kind, attempts as i32).await?;
                return Ok(outcome);
            }
        }
    }
}

/// Poll for the winner's outcome after losing an idempotency race.
/// Returns None if the winner never recorded one (it rolled back).
async fn wait_for_winner<S: OutcomeStore>(
    inner: &Arc<DispatchInner<S>>,
    key: &str,
) -> Result<Option<Outcome>, RelayError> {
    for _ in 0..CONFLICT_WAIT_ROUNDS {
        match inner.store.lookup(key).await {
            Ok(Some(outcome)) => return Ok(Some(outcome)),
            Ok(None) => tokio::time::sleep(CONFLICT_WAIT_POLL).await,
            Err(e) if e.is_retryable() => tokio::time::sleep(CONFLICT_WAIT_POLL).await,
            Err(e) => return Err(e),
        }
    }
    Ok(None)
}
