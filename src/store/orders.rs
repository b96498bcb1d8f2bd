//! Postgres implementation of [`OrderRepo`].
//!
//! Every state transition is a single guarded statement (`WHERE status =
//! …`), so concurrent events for the same order collapse: `amount_paid`
//! only ever rises, and the `initiated → validated` edge fires at most
//! once.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

use super::{
    ApplyOutcome, OrderContext, OrderRepo, PaymentApplied, PaymentObservation, PaymentOrder,
    StoreError, SweepFailure, Token, chain_id_from_db, parse_address, parse_opt_address,
    parse_order_status, parse_opt_tx_hash,
};
use crate::types::{OrderStatus, TxHash};

const TERMINAL_STATUSES: &str = "('settled', 'cancelled', 'expired', 'failed', 'refunded')";

/// Joined order + receive address + token projection used by both detection
/// paths and the sweeper.
const CONTEXT_SELECT: &str = "SELECT \
     o.id AS o_id, o.amount AS o_amount, o.amount_paid AS o_amount_paid, \
     o.sender_fee AS o_sender_fee, o.network_fee AS o_network_fee, \
     o.protocol_fee AS o_protocol_fee, o.rate AS o_rate, o.token_id AS o_token_id, \
     o.sender_profile_id AS o_sender_profile_id, o.status AS o_status, \
     o.receive_address_id AS o_receive_address_id, o.recipient AS o_recipient, \
     o.refund_address AS o_refund_address, o.tx_hash AS o_tx_hash, \
     o.sweep_tx_hash AS o_sweep_tx_hash, o.swept_at AS o_swept_at, \
     o.sweep_retries AS o_sweep_retries, o.block_number AS o_block_number, \
     o.created_at AS o_created_at, o.updated_at AS o_updated_at, o.expires_at AS o_expires_at, \
     r.id AS r_id, r.address AS r_address, r.salt AS r_salt, \
     r.network_identifier AS r_network_identifier, r.chain_id AS r_chain_id, \
     r.status AS r_status, r.is_deployed AS r_is_deployed, \
     r.deployment_tx_hash AS r_deployment_tx_hash, r.deployment_block AS r_deployment_block, \
     r.deployed_at AS r_deployed_at, r.assigned_at AS r_assigned_at, \
     r.recycled_at AS r_recycled_at, r.times_used AS r_times_used, \
     r.last_indexed_block AS r_last_indexed_block, r.last_used AS r_last_used, \
     r.valid_until AS r_valid_until, \
     t.id AS t_id, t.symbol AS t_symbol, t.contract_address AS t_contract_address, \
     t.decimals AS t_decimals, t.network_identifier AS t_network_identifier, \
     t.chain_id AS t_chain_id, t.is_enabled AS t_is_enabled \
     FROM payment_orders o \
     JOIN receive_addresses r ON r.id = o.receive_address_id \
     JOIN tokens t ON t.id = o.token_id";

fn order_context_from_row(row: &PgRow) -> Result<OrderContext, StoreError> {
    let order = PaymentOrder {
        id: row.try_get("o_id")?,
        amount: row.try_get("o_amount")?,
        amount_paid: row.try_get("o_amount_paid")?,
        sender_fee: row.try_get("o_sender_fee")?,
        network_fee: row.try_get("o_network_fee")?,
        protocol_fee: row.try_get("o_protocol_fee")?,
        rate: row.try_get("o_rate")?,
        token_id: row.try_get("o_token_id")?,
        sender_profile_id: row.try_get("o_sender_profile_id")?,
        status: parse_order_status(row.try_get::<String, _>("o_status")?.as_str())?,
        receive_address_id: row.try_get("o_receive_address_id")?,
        recipient: row.try_get("o_recipient")?,
        refund_address: parse_opt_address(row.try_get("o_refund_address")?)?,
        tx_hash: parse_opt_tx_hash(row.try_get("o_tx_hash")?)?,
        sweep_tx_hash: parse_opt_tx_hash(row.try_get("o_sweep_tx_hash")?)?,
        swept_at: row.try_get("o_swept_at")?,
        sweep_retries: row.try_get("o_sweep_retries")?,
        block_number: row.try_get("o_block_number")?,
        created_at: row.try_get("o_created_at")?,
        updated_at: row.try_get("o_updated_at")?,
        expires_at: row.try_get("o_expires_at")?,
    };
    let receive_address = super::ReceiveAddress {
        id: row.try_get("r_id")?,
        address: parse_address(row.try_get::<String, _>("r_address")?.as_str())?,
        salt: row.try_get("r_salt")?,
        network_identifier: row.try_get("r_network_identifier")?,
        chain_id: chain_id_from_db(row.try_get("r_chain_id")?)?,
        status: super::parse_address_status(row.try_get::<String, _>("r_status")?.as_str())?,
        is_deployed: row.try_get("r_is_deployed")?,
        deployment_tx_hash: parse_opt_tx_hash(row.try_get("r_deployment_tx_hash")?)?,
        deployment_block: row.try_get("r_deployment_block")?,
        deployed_at: row.try_get("r_deployed_at")?,
        assigned_at: row.try_get("r_assigned_at")?,
        recycled_at: row.try_get("r_recycled_at")?,
        times_used: row.try_get("r_times_used")?,
        last_indexed_block: row.try_get("r_last_indexed_block")?,
        last_used: row.try_get("r_last_used")?,
        valid_until: row.try_get("r_valid_until")?,
    };
    let token = Token {
        id: row.try_get("t_id")?,
        symbol: row.try_get("t_symbol")?,
        contract_address: parse_address(row.try_get::<String, _>("t_contract_address")?.as_str())?,
        decimals: u8::try_from(row.try_get::<i16, _>("t_decimals")?)
            .map_err(|_| StoreError::Corrupt("token decimals out of range".into()))?,
        network_identifier: row.try_get("t_network_identifier")?,
        chain_id: chain_id_from_db(row.try_get("t_chain_id")?)?,
        is_enabled: row.try_get("t_is_enabled")?,
    };
    Ok(OrderContext {
        order,
        receive_address,
        token,
    })
}

/// Payment orders over Postgres.
#[derive(Debug, Clone)]
pub struct PgOrderStore {
    pool: PgPool,
}

impl PgOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrderRepo for PgOrderStore {
    async fn open_orders_by_address(
        &self,
        chain_id: u64,
        to: &crate::types::EvmAddress,
    ) -> Result<Vec<OrderContext>, StoreError> {
        let sql = format!(
            "{CONTEXT_SELECT} \
             WHERE r.chain_id = $1 \
               AND LOWER(r.address) = LOWER($2) \
               AND o.status NOT IN {TERMINAL_STATUSES} \
             ORDER BY CASE WHEN o.status IN ('initiated', 'validated') THEN 0 ELSE 1 END, \
                      o.created_at ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(chain_id as i64)
            .bind(to.to_lowercase_hex())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(order_context_from_row).collect()
    }

    async fn apply_payment(
        &self,
        order_id: Uuid,
        observation: PaymentObservation,
    ) -> Result<ApplyOutcome, StoreError> {
        // `new_paid` is evaluated inside the statement so concurrent events
        // cannot lose an increment or regress the total.
        let (new_paid_expr, amount) = match observation {
            PaymentObservation::Incremental(amount) => ("o.amount_paid + $2", amount),
            PaymentObservation::Cumulative(amount) => ("GREATEST(o.amount_paid, $2)", amount),
        };
        let sql = format!(
            "WITH locked AS ( \
                 SELECT id, status AS previous_status FROM payment_orders \
                 WHERE id = $1 FOR UPDATE \
             ) \
             UPDATE payment_orders o SET \
                 amount_paid = {new_paid_expr}, \
                 status = CASE \
                     WHEN o.status = 'initiated' \
                          AND {new_paid_expr} >= \
                              o.amount + o.sender_fee + o.network_fee + o.protocol_fee \
                     THEN 'validated' \
                     ELSE o.status \
                 END, \
                 updated_at = NOW() \
             FROM locked \
             WHERE o.id = locked.id AND o.status NOT IN {TERMINAL_STATUSES} \
             RETURNING locked.previous_status, o.status, o.amount_paid, o.receive_address_id"
        );
        let row = sqlx::query(&sql)
            .bind(order_id)
            .bind(amount)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = row {
            let applied = PaymentApplied {
                order_id,
                previous_status: parse_order_status(
                    row.try_get::<String, _>("previous_status")?.as_str(),
                )?,
                status: parse_order_status(row.try_get::<String, _>("status")?.as_str())?,
                amount_paid: row.try_get("amount_paid")?,
                receive_address_id: row.try_get("receive_address_id")?,
            };
            return Ok(ApplyOutcome::Applied(applied));
        }
        // The guard rejected the write: terminal order, or no such row.
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM payment_orders WHERE id = $1")
                .bind(order_id)
                .fetch_optional(&self.pool)
                .await?;
        match status {
            Some(status) => Ok(ApplyOutcome::Terminal(parse_order_status(&status)?)),
            None => Ok(ApplyOutcome::NotFound),
        }
    }

    async fn mark_expired(&self, order_id: Uuid) -> Result<Option<Option<Uuid>>, StoreError> {
        let row = sqlx::query(
            "UPDATE payment_orders SET status = 'expired', updated_at = NOW() \
             WHERE id = $1 AND status IN ('initiated', 'validated') \
             RETURNING receive_address_id",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(match row {
            Some(row) => Some(row.try_get("receive_address_id")?),
            None => None,
        })
    }

    async fn pollable(
        &self,
        min_age: Duration,
        limit: i64,
    ) -> Result<Vec<OrderContext>, StoreError> {
        let sql = format!(
            "{CONTEXT_SELECT} \
             WHERE o.status = 'initiated' \
               AND o.created_at < NOW() - make_interval(secs => $1) \
               AND t.is_enabled \
             ORDER BY o.created_at ASC \
             LIMIT $2"
        );
        let rows = sqlx::query(&sql)
            .bind(min_age.as_secs_f64())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(order_context_from_row).collect()
    }

    async fn sweepable(&self, limit: i64) -> Result<Vec<Uuid>, StoreError> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM payment_orders WHERE status = 'validated' \
             ORDER BY updated_at ASC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn begin_sweep(&self, order_id: Uuid) -> Result<Option<OrderContext>, StoreError> {
        let sql = format!("{CONTEXT_SELECT} WHERE o.id = $1 AND o.status = 'validated'");
        let row = sqlx::query(&sql)
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(order_context_from_row).transpose()
    }

    async fn record_sweep(
        &self,
        order_id: Uuid,
        sweep_tx_hash: TxHash,
        block_number: u64,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE payment_orders SET \
                 status = 'swept', \
                 sweep_tx_hash = $2, \
                 block_number = $3, \
                 swept_at = NOW(), \
                 updated_at = NOW() \
             WHERE id = $1 AND status = 'validated'",
        )
        .bind(order_id)
        .bind(sweep_tx_hash.to_string())
        .bind(block_number as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_sweep_failure(
        &self,
        order_id: Uuid,
        max_retries: u32,
    ) -> Result<SweepFailure, StoreError> {
        let row = sqlx::query(
            "UPDATE payment_orders SET \
                 sweep_retries = sweep_retries + 1, \
                 status = CASE WHEN sweep_retries + 1 >= $2 THEN 'failed' ELSE status END, \
                 updated_at = NOW() \
             WHERE id = $1 AND status = 'validated' \
             RETURNING sweep_retries, status, receive_address_id",
        )
        .bind(order_id)
        .bind(max_retries as i32)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(SweepFailure::Conflict);
        };
        let status = parse_order_status(row.try_get::<String, _>("status")?.as_str())?;
        if status == OrderStatus::Failed {
            Ok(SweepFailure::Failed {
                receive_address_id: row.try_get("receive_address_id")?,
            })
        } else {
            Ok(SweepFailure::Retrying {
                retries: row.try_get("sweep_retries")?,
            })
        }
    }

    async fn mark_settled(&self, order_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE payment_orders SET status = 'settled', updated_at = NOW() \
             WHERE id = $1 AND status = 'swept'",
        )
        .bind(order_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
