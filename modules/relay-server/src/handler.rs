//! Effect handlers for the three command kinds.
//!
//! `apply` and `retract` mutate the records table inside the dispatcher's
//! transaction, so the effect and its outcome commit together. `deliver`
//! pushes through the platform client and records its response.

use async_trait::async_trait;
use serde_json::json;
use sqlx::{Postgres, Transaction};
use tracing::debug;

use platform_client::PlatformClient;
use relay_common::{Command, CommandKind, RelayError};
use relay_store::{classify_sqlx, CommandHandler, ConnectionPool};

const RECORDS_DDL: &str = r#"
    CREATE TABLE IF NOT EXISTS records (
        resource_key TEXT PRIMARY KEY,
        body         JSONB NOT NULL,
        updated_at   TIMESTAMPTZ NOT NULL DEFAULT now()
    )
"#;

/// Create the records table if it does not exist.
pub async fn init_records(pool: &ConnectionPool) -> Result<(), RelayError> {
    let mut lease = pool.acquire().await?;
    let mut tx = lease.begin().await?;
    sqlx::query(RECORDS_DDL)
        .execute(&mut *tx)
        .await
        .map_err(classify_sqlx)?;
    tx.commit().await.map_err(classify_sqlx)?;
    lease.finish_transaction();
    Ok(())
}

pub struct BridgeHandler {
    platform: PlatformClient,
}

impl BridgeHandler {
    pub fn new(platform: PlatformClient) -> Self {
        Self { platform }
    }

    async fn apply(
        &self,
        cmd: &Command,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<serde_json::Value, RelayError> {
        sqlx::query(
            r#"
            INSERT INTO records (resource_key, body)
            VALUES ($1, $2)
            ON CONFLICT (resource_key)
            DO UPDATE SET body = EXCLUDED.body, updated_at = now()
            "#,
        )
        .bind(&cmd.resource_key)
        .bind(&cmd.payload)
        .execute(&mut **tx)
        .await
        .map_err(classify_sqlx)?;

        debug!(resource_key = %cmd.resource_key, "Record applied");
        Ok(json!({ "applied": cmd.resource_key }))
    }

    async fn retract(
        &self,
        cmd: &Command,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<serde_json::Value, RelayError> {
        let result = sqlx::query("DELETE FROM records WHERE resource_key = $1")
            .bind(&cmd.resource_key)
            .execute(&mut **tx)
            .await
            .map_err(classify_sqlx)?;

        debug!(resource_key = %cmd.resource_key, "Record retracted");
        Ok(json!({
            "retracted": cmd.resource_key,
            "existed": result.rows_affected() > 0,
        }))
    }

    async fn deliver(&self, cmd: &Command) -> Result<serde_json::Value, RelayError> {
        // The resource key doubles as the rate-limit route, so deliveries
        // to one resource pace independently of the others.
        let response = self
            .platform
            .post_json(&cmd.resource_key, "/deliveries", &cmd.payload)
            .await?;

        debug!(resource_key = %cmd.resource_key, "Delivery pushed");
        Ok(json!({
            "delivered": cmd.resource_key,
            "response": response,
        }))
    }
}

#[async_trait]
impl CommandHandler for BridgeHandler {
    async fn handle(
        &self,
        cmd: &Command,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<serde_json::Value, RelayError> {
        match cmd.kind {
            CommandKind::Apply => self.apply(cmd, tx).await,
            CommandKind::Retract => self.retract(cmd, tx).await,
            CommandKind::Deliver => self.deliver(cmd).await,
        }
    }
}
