//! Persistence layer: repository traits and their Postgres implementations.
//!
//! One repository per aggregate root: [`PoolRepo`] owns receive-address
//! rows, [`OrderRepo`] owns payment orders, [`WebhookKeyRepo`] owns the
//! webhook-id → signing-key association. Workers depend on the traits only,
//! so the detection pipeline and sweeper are testable against in-memory
//! fakes; the `Pg*` types in the submodules are the production
//! implementations over `sqlx`/Postgres.
//!
//! Allocation and the order state transitions are expressed as single
//! atomic statements (row locks / optimistic status guards); no
//! multi-statement transaction spans an await point in a worker.

pub mod orders;
pub mod pool;
pub mod webhooks;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::types::{AddressStatus, EvmAddress, OrderStatus, TxHash};

pub use orders::PgOrderStore;
pub use pool::PgPoolStore;
pub use webhooks::PgWebhookKeyStore;

/// Persistence failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Allocation was requested and no candidate row exists.
    #[error("no allocatable receive address for chain {chain_id} ({network_identifier})")]
    PoolEmpty {
        chain_id: u64,
        network_identifier: String,
    },
    #[error("database failure: {0}")]
    Database(#[from] sqlx::Error),
    /// A stored value failed to parse back into its domain type.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Open the connection pool used by every repository.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Apply pending migrations.
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Corrupt(format!("migration failed: {e}")))?;
    Ok(())
}

/// A receive-address row.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveAddress {
    pub id: Uuid,
    pub address: EvmAddress,
    /// Encrypted CREATE2 salt; `None` on legacy rows.
    pub salt: Option<Vec<u8>>,
    pub network_identifier: String,
    pub chain_id: u64,
    pub status: AddressStatus,
    pub is_deployed: bool,
    pub deployment_tx_hash: Option<TxHash>,
    pub deployment_block: Option<i64>,
    pub deployed_at: Option<DateTime<Utc>>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub recycled_at: Option<DateTime<Utc>>,
    pub times_used: i32,
    pub last_indexed_block: Option<i64>,
    pub last_used: Option<DateTime<Utc>>,
    pub valid_until: Option<DateTime<Utc>>,
}

/// A token row.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub id: Uuid,
    pub symbol: String,
    pub contract_address: EvmAddress,
    pub decimals: u8,
    pub network_identifier: String,
    pub chain_id: u64,
    pub is_enabled: bool,
}

/// A payment-order row.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentOrder {
    pub id: Uuid,
    pub amount: Decimal,
    pub amount_paid: Decimal,
    pub sender_fee: Decimal,
    pub network_fee: Decimal,
    pub protocol_fee: Decimal,
    pub rate: Decimal,
    pub token_id: Uuid,
    pub sender_profile_id: Option<Uuid>,
    pub status: OrderStatus,
    pub receive_address_id: Option<Uuid>,
    /// Opaque fiat-recipient blob; encrypted before on-chain submission.
    pub recipient: String,
    pub refund_address: Option<EvmAddress>,
    pub tx_hash: Option<TxHash>,
    pub sweep_tx_hash: Option<TxHash>,
    pub swept_at: Option<DateTime<Utc>>,
    pub sweep_retries: i32,
    pub block_number: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl PaymentOrder {
    /// `amount + sender_fee + network_fee + protocol_fee`: the threshold
    /// `amount_paid` must reach for the order to validate.
    pub fn total_required(&self) -> Decimal {
        self.amount + self.sender_fee + self.network_fee + self.protocol_fee
    }

    /// Whether the order's payment window has closed.
    pub fn is_past_validity(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at < now)
    }
}

/// An order joined with its receive address and token, the unit both
/// detection paths and the sweeper work on.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderContext {
    pub order: PaymentOrder,
    pub receive_address: ReceiveAddress,
    pub token: Token,
}

/// How an observed payment relates to the order's running total.
///
/// Webhook activities are individual transfers and *add* to `amount_paid`
/// (distinct transactions aggregate); polling reads the absolute on-chain
/// balance, which folds in via `GREATEST` so `amount_paid` stays monotonic
/// whatever order observations land in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PaymentObservation {
    /// A single detected transfer; adds to the running total.
    Incremental(Decimal),
    /// An absolute balance observation; raises the total to at least this.
    Cumulative(Decimal),
}

/// Outcome of applying an observed payment to an order.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The row was updated (possibly a no-op on `amount_paid`).
    Applied(PaymentApplied),
    /// The order is already terminal; nothing was written.
    Terminal(OrderStatus),
    /// No such order.
    NotFound,
}

/// Post-update snapshot of the fields the updater acts on.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentApplied {
    pub order_id: Uuid,
    pub previous_status: OrderStatus,
    pub status: OrderStatus,
    pub amount_paid: Decimal,
    pub receive_address_id: Option<Uuid>,
}

impl PaymentApplied {
    /// The guarded `initiated → validated` edge fired in this update.
    pub fn newly_validated(&self) -> bool {
        self.previous_status == OrderStatus::Initiated && self.status == OrderStatus::Validated
    }
}

/// Outcome of recording a sweep failure.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepFailure {
    /// Below the retry cap; the order stays `validated`.
    Retrying { retries: i32 },
    /// Retry cap reached; the order moved to `failed`.
    Failed {
        receive_address_id: Option<Uuid>,
    },
    /// The order was no longer `validated`; nothing was written.
    Conflict,
}

/// Receive-address pool persistence.
#[async_trait]
pub trait PoolRepo: Send + Sync {
    /// Atomically pick one allocatable address and mark it assigned.
    ///
    /// Candidates satisfy `status ∈ {pool_ready, unused}`, `is_deployed`,
    /// the chain/network pair, and `times_used < reuse_cap`; selection is
    /// uniform over the lockable window so concurrent callers never receive
    /// the same row and no row runs hot.
    async fn allocate(
        &self,
        chain_id: u64,
        network_identifier: &str,
        reuse_cap: u32,
    ) -> Result<ReceiveAddress, StoreError>;

    /// Return an address to `pool_ready`. Idempotent.
    async fn recycle(&self, id: Uuid) -> Result<(), StoreError>;

    /// `pool_assigned → pool_processing`, when a sweep begins. Idempotent.
    async fn mark_processing(&self, id: Uuid) -> Result<(), StoreError>;

    /// `pool_processing → pool_completed`, when a sweep lands. Idempotent.
    async fn mark_completed(&self, id: Uuid) -> Result<(), StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<ReceiveAddress>, StoreError>;

    /// Number of `pool_ready` rows for the chain, for replenishment checks.
    async fn ready_count(
        &self,
        chain_id: u64,
        network_identifier: &str,
    ) -> Result<i64, StoreError>;

    /// Number of rows retired at the reuse cap (the audit view).
    async fn retired_count(&self, chain_id: u64, reuse_cap: u32) -> Result<i64, StoreError>;

    /// Non-terminal orders referencing this address, for invariant audits.
    async fn open_order_count(&self, id: Uuid) -> Result<i64, StoreError>;
}

/// Payment-order persistence. The order updater is the single writer of
/// `status` and `amount_paid`; every transition here carries its own status
/// guard so replays and races collapse to no-ops.
#[async_trait]
pub trait OrderRepo: Send + Sync {
    /// All non-terminal orders whose receive address matches `to`
    /// case-insensitively, payment-accepting statuses first, oldest first.
    async fn open_orders_by_address(
        &self,
        chain_id: u64,
        to: &EvmAddress,
    ) -> Result<Vec<OrderContext>, StoreError>;

    /// Fold an observed payment into the order: `amount_paid` rises
    /// monotonically per the observation kind and the `initiated →
    /// validated` edge fires when the total-required threshold is crossed,
    /// all in one guarded statement.
    async fn apply_payment(
        &self,
        order_id: Uuid,
        observation: PaymentObservation,
    ) -> Result<ApplyOutcome, StoreError>;

    /// Move a non-terminal order to `expired`; returns its receive address
    /// for recycling, or `None` if the order was already terminal.
    async fn mark_expired(&self, order_id: Uuid) -> Result<Option<Option<Uuid>>, StoreError>;

    /// `initiated` orders older than `min_age`, joined with address and
    /// token, for the polling fallback.
    async fn pollable(&self, min_age: Duration, limit: i64) -> Result<Vec<OrderContext>, StoreError>;

    /// Orders currently in `validated`, oldest first, for sweep re-drives.
    async fn sweepable(&self, limit: i64) -> Result<Vec<Uuid>, StoreError>;

    /// Re-read an order for sweeping; `None` unless it is still
    /// `validated` (idempotence under restart).
    async fn begin_sweep(&self, order_id: Uuid) -> Result<Option<OrderContext>, StoreError>;

    /// `validated → swept` with the sweep transaction recorded; `false` if
    /// the guard did not match.
    async fn record_sweep(
        &self,
        order_id: Uuid,
        sweep_tx_hash: TxHash,
        block_number: u64,
    ) -> Result<bool, StoreError>;

    /// Bump the sweep retry counter, tipping into `failed` at the cap.
    async fn record_sweep_failure(
        &self,
        order_id: Uuid,
        max_retries: u32,
    ) -> Result<SweepFailure, StoreError>;

    /// `swept → settled`, driven by the settlement surface. `false` if the
    /// guard did not match.
    async fn mark_settled(&self, order_id: Uuid) -> Result<bool, StoreError>;
}

/// Webhook-id → signing-key association.
#[async_trait]
pub trait WebhookKeyRepo: Send + Sync {
    async fn signing_key(&self, webhook_id: &str) -> Result<Option<String>, StoreError>;

    /// Insert or rotate a signing key.
    async fn upsert(
        &self,
        webhook_id: &str,
        signing_key: &str,
        network_identifier: &str,
    ) -> Result<(), StoreError>;
}

pub(crate) fn parse_address(raw: &str) -> Result<EvmAddress, StoreError> {
    EvmAddress::from_str(raw).map_err(|e| StoreError::Corrupt(e.to_string()))
}

pub(crate) fn parse_opt_address(raw: Option<String>) -> Result<Option<EvmAddress>, StoreError> {
    raw.map(|value| parse_address(&value)).transpose()
}

pub(crate) fn parse_order_status(raw: &str) -> Result<OrderStatus, StoreError> {
    OrderStatus::from_str(raw).map_err(|e| StoreError::Corrupt(e.to_string()))
}

pub(crate) fn parse_address_status(raw: &str) -> Result<AddressStatus, StoreError> {
    AddressStatus::from_str(raw).map_err(|e| StoreError::Corrupt(e.to_string()))
}

pub(crate) fn parse_opt_tx_hash(raw: Option<String>) -> Result<Option<TxHash>, StoreError> {
    raw.map(|value| TxHash::from_str(&value).map_err(|e| StoreError::Corrupt(e.to_string())))
        .transpose()
}

pub(crate) fn chain_id_from_db(raw: i64) -> Result<u64, StoreError> {
    u64::try_from(raw).map_err(|_| StoreError::Corrupt(format!("negative chain id {raw}")))
}
