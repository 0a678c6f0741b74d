//! The commands table: idempotent claim, atomic effect + outcome write,
//! and retention purge.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use tracing::{debug, warn};

use relay_common::{Command, FailureKind, Outcome, OutcomeStatus, RelayError};
use relay_dispatch::OutcomeStore;

use crate::pool::{ConnectionLease, ConnectionPool};

/// The business seam. Implementations apply a command's effect inside the
/// dispatcher's transaction, so the effect and its outcome row commit or
/// roll back together.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    /// Returns the side-effect summary recorded on the Outcome.
    async fn handle(
        &self,
        cmd: &Command,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<serde_json::Value, RelayError>;
}

/// Postgres-backed [`OutcomeStore`]: claims the idempotency key, runs the
/// handler, and records the outcome, all in one transaction per attempt.
#[derive(Clone)]
pub struct CommandStore {
    pool: ConnectionPool,
    handler: Arc<dyn CommandHandler>,
}

impl CommandStore {
    pub fn new(pool: ConnectionPool, handler: Arc<dyn CommandHandler>) -> Self {
        Self { pool, handler }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Delete terminal command rows older than `retention`.
    /// Returns the number of rows removed.
    pub async fn purge_terminal_older_than(&self, retention: Duration) -> Result<u64, RelayError> {
        let age = chrono::Duration::from_std(retention)
            .map_err(|e| RelayError::Validation(format!("retention out of range: {e}")))?;
        let cutoff: DateTime<Utc> = Utc::now() - age;

        let mut lease = self.pool.acquire().await?;
        let conn = lease
            .connection()
            .ok_or_else(|| RelayError::TransientIo("lease has no connection".into()))?;
        let result = sqlx::query(
            r#"
            DELETE FROM commands
            WHERE status IN ('succeeded', 'failed') AND updated_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(conn)
        .await
        .map_err(classify_sqlx)?;

        Ok(result.rows_affected())
    }

    async fn lookup_on(
        &self,
        lease: &mut ConnectionLease,
        key: &str,
    ) -> Result<Option<Outcome>, RelayError> {
        let conn = lease
            .connection()
            .ok_or_else(|| RelayError::TransientIo("lease has no connection".into()))?;
        let row = sqlx::query_as::<_, OutcomeRow>(
            r#"
            SELECT idempotency_key, status, failure_kind, effect, attempts, updated_at
            FROM commands
            WHERE idempotency_key = $1 AND status <> 'pending'
            "#,
        )
        .bind(key)
        .fetch_optional(conn)
        .await
        .map_err(classify_sqlx)?;

        row.map(Outcome::try_from).transpose()
    }
}

#[async_trait]
impl OutcomeStore for CommandStore {
    async fn lookup(&self, key: &str) -> Result<Option<Outcome>, RelayError> {
        let mut lease = self.pool.acquire().await?;
        self.lookup_on(&mut lease, key).await
    }

    async fn execute(&self, cmd: &Command, attempts: i32) -> Result<Outcome, RelayError> {
        let mut lease = self.pool.acquire().await?;

        let mut tx = lease.begin().await?;

        // Claim the key. A concurrent attempt holding the row lock makes
        // this statement wait until that attempt commits or rolls back, so
        // duplicate effects are serialized here, before the handler runs.
        let claimed: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO commands (idempotency_key, resource_key, kind, payload, origin, status, attempts)
            VALUES ($1, $2, $3, $4, $5, 'pending', $6)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING idempotency_key
            "#,
        )
        .bind(&cmd.idempotency_key)
        .bind(&cmd.resource_key)
        .bind(cmd.kind.as_str())
        .bind(&cmd.payload)
        .bind(cmd.origin.as_str())
        .bind(attempts)
        .fetch_optional(&mut *tx)
        .await
        .map_err(classify_sqlx)?;

        if claimed.is_none() {
            // Key already settled by a committed attempt. Committed rows are
            // always terminal, so a miss here means the winner is still
            // in flight in a way the row lock did not cover.
            drop(tx);
            lease.finish_transaction();
            let existing = self.lookup_on(&mut lease, &cmd.idempotency_key).await?;
            return existing.ok_or_else(|| {
                RelayError::Conflict(format!(
                    "idempotency key '{}' owned by a concurrent attempt",
                    cmd.idempotency_key
                ))
            });
        }

        match self.handler.handle(cmd, &mut tx).await {
            Ok(effect) => {
                sqlx::query(
                    r#"
                    UPDATE commands
                    SET status = 'succeeded', effect = $2, attempts = $3, updated_at = now()
                    WHERE idempotency_key = $1
                    "#,
                )
                .bind(&cmd.idempotency_key)
                .bind(&effect)
                .bind(attempts)
                .execute(&mut *tx)
                .await
                .map_err(classify_sqlx)?;

                tx.commit().await.map_err(classify_sqlx)?;
                lease.finish_transaction();
                debug!(key = %cmd.idempotency_key, attempts, "Command effect committed");
                Ok(Outcome::success(
                    cmd.idempotency_key.clone(),
                    effect,
                    attempts,
                ))
            }
            Err(e) => {
                // Rolling back discards the pending claim, so a retry can
                // claim the key afresh.
                if let Err(rb) = tx.rollback().await {
                    warn!(key = %cmd.idempotency_key, error = %rb, "Rollback after handler failure also failed");
                }
                lease.finish_transaction();
                Err(e)
            }
        }
    }

    async fn record_failure(
        &self,
        cmd: &Command,
        kind: FailureKind,
        attempts: i32,
    ) -> Result<Outcome, RelayError> {
        let mut lease = self.pool.acquire().await?;
        let conn = lease
            .connection()
            .ok_or_else(|| RelayError::TransientIo("lease has no connection".into()))?;

        let inserted: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO commands (idempotency_key, resource_key, kind, payload, origin, status, failure_kind, attempts)
            VALUES ($1, $2, $3, $4, $5, 'failed', $6, $7)
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING idempotency_key
            "#,
        )
        .bind(&cmd.idempotency_key)
        .bind(&cmd.resource_key)
        .bind(cmd.kind.as_str())
        .bind(&cmd.payload)
        .bind(cmd.origin.as_str())
        .bind(kind.as_str())
        .bind(attempts)
        .fetch_optional(&mut *conn)
        .await
        .map_err(classify_sqlx)?;

        if inserted.is_some() {
            return Ok(Outcome::failure(cmd.idempotency_key.clone(), kind, attempts));
        }

        // A concurrent winner settled the key first; return its outcome.
        let existing = self.lookup_on(&mut lease, &cmd.idempotency_key).await?;
        existing.ok_or_else(|| {
            RelayError::Conflict(format!(
                "idempotency key '{}' owned by a concurrent attempt",
                cmd.idempotency_key
            ))
        })
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct OutcomeRow {
    idempotency_key: String,
    status: String,
    failure_kind: Option<String>,
    effect: Option<serde_json::Value>,
    attempts: i32,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for OutcomeRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(OutcomeRow {
            idempotency_key: row.try_get("idempotency_key")?,
            status: row.try_get("status")?,
            failure_kind: row.try_get("failure_kind")?,
            effect: row.try_get("effect")?,
            attempts: row.try_get("attempts")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<OutcomeRow> for Outcome {
    type Error = RelayError;

    fn try_from(row: OutcomeRow) -> Result<Self, RelayError> {
        let status = match row.status.as_str() {
            "succeeded" => OutcomeStatus::Succeeded,
            "failed" => OutcomeStatus::Failed,
            other => {
                return Err(RelayError::TransientIo(format!(
                    "unrecognized outcome status '{other}' for key '{}'",
                    row.idempotency_key
                )))
            }
        };
        let failure_kind = match row.failure_kind.as_deref() {
            Some(raw) => {
                let parsed = FailureKind::parse(raw);
                if parsed.is_none() {
                    warn!(key = %row.idempotency_key, raw, "Unrecognized failure kind in store");
                }
                parsed
            }
            None => None,
        };
        Ok(Outcome {
            idempotency_key: row.idempotency_key,
            status,
            failure_kind,
            effect: row.effect,
            attempts: row.attempts,
            recorded_at: row.updated_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Error classification
// ---------------------------------------------------------------------------

/// Map sqlx failures onto the shared taxonomy. Unique violations are
/// idempotency races; serialization failures and deadlocks are transient.
/// Exposed so [`CommandHandler`] implementations can classify their own
/// queries the same way.
pub fn classify_sqlx(e: sqlx::Error) -> RelayError {
    match &e {
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("23505") => RelayError::Conflict(db.message().to_string()),
            Some("40001") | Some("40P01") => RelayError::TransientIo(db.message().to_string()),
            _ => RelayError::TransientIo(db.message().to_string()),
        },
        sqlx::Error::PoolTimedOut => RelayError::PoolExhausted(e.to_string()),
        _ => RelayError::TransientIo(e.to_string()),
    }
}
