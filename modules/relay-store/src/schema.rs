//! Idempotent schema bootstrap, run at startup before serving traffic.
//!
//! The primary key on `idempotency_key` is the sole dedup mechanism for
//! the whole pipeline.

use relay_common::RelayError;

use crate::pool::ConnectionPool;
use crate::store::classify_sqlx;

const DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS commands (
        idempotency_key TEXT PRIMARY KEY,
        resource_key    TEXT NOT NULL,
        kind            TEXT NOT NULL,
        payload         JSONB NOT NULL,
        origin          TEXT NOT NULL,
        status          TEXT NOT NULL,
        failure_kind    TEXT,
        effect          JSONB,
        attempts        INT NOT NULL DEFAULT 0,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT now()
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_commands_resource ON commands (resource_key)",
    "CREATE INDEX IF NOT EXISTS idx_commands_updated ON commands (status, updated_at)",
];

/// Create the commands table and its indexes if they do not exist.
pub async fn init_schema(pool: &ConnectionPool) -> Result<(), RelayError> {
    let mut lease = pool.acquire().await?;
    let conn = lease
        .connection()
        .ok_or_else(|| RelayError::TransientIo("lease has no connection".into()))?;
    for ddl in DDL {
        sqlx::query(ddl)
            .execute(&mut *conn)
            .await
            .map_err(classify_sqlx)?;
    }
    Ok(())
}
