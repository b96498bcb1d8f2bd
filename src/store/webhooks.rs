//! Postgres implementation of [`WebhookKeyRepo`].

use async_trait::async_trait;
use sqlx::PgPool;

use super::{StoreError, WebhookKeyRepo};

/// Webhook signing keys over Postgres.
#[derive(Debug, Clone)]
pub struct PgWebhookKeyStore {
    pool: PgPool,
}

impl PgWebhookKeyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WebhookKeyRepo for PgWebhookKeyStore {
    async fn signing_key(&self, webhook_id: &str) -> Result<Option<String>, StoreError> {
        let key = sqlx::query_scalar(
            "SELECT signing_key FROM webhook_signing_keys WHERE webhook_id = $1",
        )
        .bind(webhook_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(key)
    }

    async fn upsert(
        &self,
        webhook_id: &str,
        signing_key: &str,
        network_identifier: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO webhook_signing_keys (webhook_id, signing_key, network_identifier) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (webhook_id) DO UPDATE SET \
                 signing_key = EXCLUDED.signing_key, \
                 network_identifier = EXCLUDED.network_identifier, \
                 updated_at = NOW()",
        )
        .bind(webhook_id)
        .bind(signing_key)
        .bind(network_identifier)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
