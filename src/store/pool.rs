//! Postgres implementation of [`PoolRepo`].
//!
//! Allocation is a single statement: the candidate subquery takes a
//! row-level lock with `FOR UPDATE SKIP LOCKED`, so concurrent allocators
//! never block on, or receive, the same row, and `ORDER BY random()` keeps
//! selection uniform over the lockable window.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{
    PoolRepo, ReceiveAddress, StoreError, chain_id_from_db, parse_address,
    parse_address_status, parse_opt_tx_hash,
};

const ADDRESS_COLUMNS: &str = "id, address, salt, network_identifier, chain_id, status, \
     is_deployed, deployment_tx_hash, deployment_block, deployed_at, assigned_at, recycled_at, \
     times_used, last_indexed_block, last_used, valid_until";

pub(crate) fn receive_address_from_row(row: &PgRow) -> Result<ReceiveAddress, StoreError> {
    Ok(ReceiveAddress {
        id: row.try_get("id")?,
        address: parse_address(row.try_get::<String, _>("address")?.as_str())?,
        salt: row.try_get("salt")?,
        network_identifier: row.try_get("network_identifier")?,
        chain_id: chain_id_from_db(row.try_get("chain_id")?)?,
        status: parse_address_status(row.try_get::<String, _>("status")?.as_str())?,
        is_deployed: row.try_get("is_deployed")?,
        deployment_tx_hash: parse_opt_tx_hash(row.try_get("deployment_tx_hash")?)?,
        deployment_block: row.try_get("deployment_block")?,
        deployed_at: row.try_get("deployed_at")?,
        assigned_at: row.try_get("assigned_at")?,
        recycled_at: row.try_get("recycled_at")?,
        times_used: row.try_get("times_used")?,
        last_indexed_block: row.try_get("last_indexed_block")?,
        last_used: row.try_get("last_used")?,
        valid_until: row.try_get("valid_until")?,
    })
}

/// Receive-address pool over Postgres.
#[derive(Debug, Clone)]
pub struct PgPoolStore {
    pool: PgPool,
}

impl PgPoolStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PoolRepo for PgPoolStore {
    async fn allocate(
        &self,
        chain_id: u64,
        network_identifier: &str,
        reuse_cap: u32,
    ) -> Result<ReceiveAddress, StoreError> {
        let sql = format!(
            "UPDATE receive_addresses SET \
                 status = 'pool_assigned', \
                 assigned_at = NOW(), \
                 last_used = NOW(), \
                 times_used = times_used + 1, \
                 updated_at = NOW() \
             WHERE id = ( \
                 SELECT id FROM receive_addresses \
                 WHERE status IN ('pool_ready', 'unused') \
                   AND is_deployed \
                   AND chain_id = $1 \
                   AND network_identifier = $2 \
                   AND times_used < $3 \
                 ORDER BY random() \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {ADDRESS_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(chain_id as i64)
            .bind(network_identifier)
            .bind(reuse_cap as i32)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => receive_address_from_row(&row),
            None => Err(StoreError::PoolEmpty {
                chain_id,
                network_identifier: network_identifier.to_string(),
            }),
        }
    }

    async fn recycle(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE receive_addresses SET \
                 status = 'pool_ready', \
                 recycled_at = NOW(), \
                 updated_at = NOW() \
             WHERE id = $1 \
               AND status IN ('pool_assigned', 'pool_processing', 'pool_completed')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_processing(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE receive_addresses SET status = 'pool_processing', updated_at = NOW() \
             WHERE id = $1 AND status IN ('pool_assigned', 'pool_processing')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_completed(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE receive_addresses SET status = 'pool_completed', updated_at = NOW() \
             WHERE id = $1 AND status IN ('pool_assigned', 'pool_processing')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ReceiveAddress>, StoreError> {
        let sql = format!("SELECT {ADDRESS_COLUMNS} FROM receive_addresses WHERE id = $1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.map(|row| receive_address_from_row(&row)).transpose()
    }

    async fn ready_count(
        &self,
        chain_id: u64,
        network_identifier: &str,
    ) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM receive_addresses \
             WHERE status = 'pool_ready' AND is_deployed \
               AND chain_id = $1 AND network_identifier = $2",
        )
        .bind(chain_id as i64)
        .bind(network_identifier)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn retired_count(&self, chain_id: u64, reuse_cap: u32) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM receive_addresses \
             WHERE status = 'pool_completed' AND chain_id = $1 AND times_used >= $2",
        )
        .bind(chain_id as i64)
        .bind(reuse_cap as i32)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn open_order_count(&self, id: Uuid) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM payment_orders \
             WHERE receive_address_id = $1 \
               AND status NOT IN ('settled', 'cancelled', 'expired', 'failed', 'refunded')",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}
