use async_trait::async_trait;

use relay_common::{Command, FailureKind, Outcome, RelayError};

/// Persistence seam for the dispatcher.
///
/// The production implementation lives in `relay-store` and runs the
/// command's effect and its outcome row inside one Postgres transaction.
/// Tests plug in an in-memory store.
#[async_trait]
pub trait OutcomeStore: Send + Sync + 'static {
    /// Read the recorded outcome for an idempotency key, if any.
    async fn lookup(&self, key: &str) -> Result<Option<Outcome>, RelayError>;

    /// Apply the command's effect and record its outcome atomically.
    ///
    /// If the key already has a recorded outcome, that outcome is returned
    /// and no effect is reapplied. A concurrent attempt that owns the key
    /// surfaces as [`RelayError::Conflict`]; the caller waits for the
    /// winner's outcome instead of erroring.
    async fn execute(&self, cmd: &Command, attempts: i32) -> Result<Outcome, RelayError>;

    /// Record a terminal failure outcome after the retry budget is spent.
    /// Returns the stored outcome (the concurrent winner's, if one beat us).
    async fn record_failure(
        &self,
        cmd: &Command,
        kind: FailureKind,
        attempts: i32,
    ) -> Result<Outcome, RelayError>;
}
