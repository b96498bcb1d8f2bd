//! Sweeper: moves validated deposits into the gateway escrow.
//!
//! On `initiated → validated` the order updater hands the order id to
//! [`SweeperHandle::trigger`]; a periodic re-drive picks up `validated`
//! orders whose earlier sweep attempt was interrupted. Each sweep:
//!
//! 1. re-reads the order (`begin_sweep`) — a no-op unless still
//!    `validated`, which makes the whole path idempotent under restart;
//! 2. marks the receive address `pool_processing`;
//! 3. builds one user-operation from the smart account: an `executeBatch`
//!    of `approve(gateway, amount + sender_fee)` on the token and
//!    `createOrder(…)` on the gateway, with the recipient blob encrypted
//!    under the platform key;
//! 4. requests paymaster sponsorship — on failure the operation is *not*
//!    sent (permanent failures count toward the retry cap, transient ones
//!    leave the order `validated` for the next re-drive);
//! 5. submits through the bundler and polls the receipt up to
//!    `SWEEP_TIMEOUT`.
//!
//! The sweeper is the only component holding in-flight resources (one entry
//! per order) and caps concurrency per chain to respect bundler rate
//! limits.

use alloy_primitives::{Address, Bytes, U256};
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::{SolCall, sol};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::instrument;
use tracing_core::Level;
use uuid::Uuid;

use crate::chain::{ChainClient, ChainError, RetryPolicy, retry};
use crate::chain::userop::UserOperation;
use crate::crypto::{CryptoError, RecipientCipher};
use crate::network::{ENTRY_POINT_V06, Network};
use crate::pool::{PoolError, PoolManager};
use crate::store::{OrderContext, OrderRepo, StoreError, SweepFailure};
use crate::types::{EvmAddress, TokenAmount, TypeError};
use crate::updater::SweepTrigger;

sol! {
    function approve(address spender, uint256 value) external returns (bool);

    function createOrder(
        address token,
        uint256 amount,
        uint96 rate,
        address senderFeeRecipient,
        uint256 senderFee,
        address refundAddress,
        string messageHash
    ) external returns (bytes32 orderId);

    function executeBatch(address[] dest, bytes[] func) external;
}

/// Exchange rates are quoted to two decimal places on-chain.
const RATE_DECIMALS: u8 = 2;

/// Sweeper knobs, fixed at start-up.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub max_retries: u32,
    pub sweep_timeout: Duration,
    pub concurrency_per_chain: usize,
    pub gas_policy_id: String,
    /// Where sender fees are paid out on-chain.
    pub sender_fee_recipient: EvmAddress,
    pub receipt_poll_interval: Duration,
    /// Cadence of the re-drive scan over `validated` orders.
    pub redrive_interval: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("amount not representable on-chain: {0}")]
    Amount(#[from] TypeError),
    #[error("receive address chain {0} is not configured")]
    UnknownNetwork(u64),
}

impl SweepError {
    /// Transient failures leave the order `validated` without touching the
    /// retry counter; everything else counts toward `MAX_SWEEP_RETRIES`.
    fn is_transient(&self) -> bool {
        matches!(self, SweepError::Chain(error) if error.is_transient())
    }
}

/// What one sweep attempt did; used by tests and the re-drive loop.
#[derive(Debug, Clone, PartialEq)]
pub enum SweepOutcome {
    /// The order was not in `validated` (already swept, or gone).
    Skipped,
    /// Another task already holds this order.
    InFlight,
    /// Landed on-chain; order is `swept` and the address released.
    Swept { user_op_hash: crate::types::TxHash },
    /// Attempt failed; retry counter advanced (`failed` at the cap).
    Failed { terminal: bool },
    /// Transient trouble; order left `validated` for the next re-drive.
    Deferred,
}

/// Builds, sponsors, signs and submits sweep user-operations.
pub struct Sweeper {
    orders: Arc<dyn OrderRepo>,
    pool: Arc<PoolManager>,
    chain: Arc<dyn ChainClient>,
    signer: PrivateKeySigner,
    cipher: RecipientCipher,
    config: SweeperConfig,
    permits: DashMap<u64, Arc<Semaphore>>,
    in_flight: DashMap<Uuid, ()>,
    tracker: TaskTracker,
    retry_policy: RetryPolicy,
}

impl Sweeper {
    pub fn new(
        orders: Arc<dyn OrderRepo>,
        pool: Arc<PoolManager>,
        chain: Arc<dyn ChainClient>,
        signer: PrivateKeySigner,
        cipher: RecipientCipher,
        config: SweeperConfig,
    ) -> Self {
        Self {
            orders,
            pool,
            chain,
            signer,
            cipher,
            config,
            permits: DashMap::new(),
            in_flight: DashMap::new(),
            tracker: TaskTracker::new(),
            retry_policy: RetryPolicy::default(),
        }
    }

    fn chain_permits(&self, chain_id: u64) -> Arc<Semaphore> {
        self.permits
            .entry(chain_id)
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.concurrency_per_chain)))
            .clone()
    }

    /// Periodically re-drive `validated` orders whose sweep never landed
    /// (paymaster hiccups, restarts, transient bundler trouble).
    pub async fn run_redrive(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.redrive_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    match self.orders.sweepable(64).await {
                        Ok(order_ids) => {
                            for order_id in order_ids {
                                self.spawn_sweep(order_id);
                            }
                        }
                        Err(error) => {
                            tracing::error!(%error, "failed to list sweepable orders");
                        }
                    }
                }
            }
        }
    }

    fn spawn_sweep(self: &Arc<Self>, order_id: Uuid) {
        let sweeper = Arc::clone(self);
        self.tracker.spawn(async move {
            if let Err(error) = sweeper.sweep_order(order_id).await {
                tracing::error!(%order_id, %error, "sweep attempt errored");
            }
        });
    }

    /// Stop accepting sweeps and drain in-flight ones for up to `window`.
    pub async fn drain(&self, window: Duration) {
        self.tracker.close();
        if tokio::time::timeout(window, self.tracker.wait()).await.is_err() {
            tracing::warn!(?window, "drain window elapsed with sweeps still in flight");
        }
    }

    /// Execute one sweep attempt for `order_id`.
    #[instrument(skip(self), fields(%order_id))]
    pub async fn sweep_order(&self, order_id: Uuid) -> Result<SweepOutcome, SweepError> {
        if self.in_flight.insert(order_id, ()).is_some() {
            return Ok(SweepOutcome::InFlight);
        }
        let result = self.sweep_inner(order_id).await;
        self.in_flight.remove(&order_id);

        match result {
            Ok(outcome) => Ok(outcome),
            Err(error) if error.is_transient() => {
                tracing::warn!(%order_id, %error, "transient sweep trouble; order stays validated");
                Ok(SweepOutcome::Deferred)
            }
            Err(error) => {
                tracing::warn!(%order_id, %error, "sweep attempt failed");
                let outcome = self.record_failure(order_id).await?;
                Ok(outcome)
            }
        }
    }

    async fn sweep_inner(&self, order_id: Uuid) -> Result<SweepOutcome, SweepError> {
        // Re-read under the `validated` guard: restarts and duplicate
        // triggers fall out here.
        let Some(context) = self.orders.begin_sweep(order_id).await? else {
            return Ok(SweepOutcome::Skipped);
        };
        let chain_id = context.receive_address.chain_id;
        Network::try_from(chain_id).map_err(|_| SweepError::UnknownNetwork(chain_id))?;

        let permits = self.chain_permits(chain_id);
        let _permit = permits
            .acquire()
            .await
            .expect("sweep semaphore is never closed");

        self.pool
            .begin_processing(context.receive_address.id)
            .await?;

        let mut op = self.build_user_op(&context).await?;

        // No sponsorship, no send.
        let sponsorship = retry(self.retry_policy, |_| {
            self.chain
                .paymaster_data(chain_id, &self.config.gas_policy_id, &op)
        })
        .await?;
        sponsorship.apply(&mut op);
        op.sign(&self.signer, ENTRY_POINT_V06, chain_id).await?;

        let user_op_hash = retry(self.retry_policy, |_| {
            self.chain.send_user_op(chain_id, &op)
        })
        .await?;
        tracing::info!(
            %order_id,
            %user_op_hash,
            sender = %context.receive_address.address,
            "sweep user-operation submitted"
        );

        self.await_receipt(&context, user_op_hash).await
    }

    /// Poll for the user-operation receipt until `SWEEP_TIMEOUT`.
    async fn await_receipt(
        &self,
        context: &OrderContext,
        user_op_hash: crate::types::TxHash,
    ) -> Result<SweepOutcome, SweepError> {
        let order_id = context.order.id;
        let chain_id = context.receive_address.chain_id;
        let deadline = tokio::time::Instant::now() + self.config.sweep_timeout;

        loop {
            match self.chain.user_op_receipt(chain_id, user_op_hash).await {
                Ok(Some(receipt)) if receipt.success => {
                    let tx_hash = crate::types::TxHash(receipt.receipt.transaction_hash);
                    let block_number = receipt.receipt.block_number.to::<u64>();
                    let recorded = self
                        .orders
                        .record_sweep(order_id, tx_hash, block_number)
                        .await?;
                    if recorded {
                        tracing::event!(Level::INFO,
                            status = "ok",
                            %order_id,
                            tx = %tx_hash,
                            block_number,
                            "sweep landed"
                        );
                        self.pool.release(context.receive_address.id).await?;
                    } else {
                        tracing::event!(Level::WARN,
                            status = "conflict",
                            %order_id,
                            "sweep landed but order had left validated"
                        );
                    }
                    return Ok(SweepOutcome::Swept { user_op_hash });
                }
                Ok(Some(receipt)) => {
                    return Err(SweepError::Chain(ChainError::Permanent {
                        method: "eth_getUserOperationReceipt",
                        message: format!(
                            "user operation reverted in tx {}",
                            receipt.receipt.transaction_hash
                        ),
                    }));
                }
                Ok(None) => {}
                Err(error) if error.is_transient() => {
                    tracing::debug!(%order_id, %error, "receipt poll hiccup");
                }
                Err(error) => return Err(error.into()),
            }
            if tokio::time::Instant::now() >= deadline {
                // Receipt never appeared inside the window; count it.
                return Err(SweepError::Chain(ChainError::Timeout {
                    method: "eth_getUserOperationReceipt",
                    after: self.config.sweep_timeout,
                }));
            }
            tokio::time::sleep(self.config.receipt_poll_interval).await;
        }
    }

    /// Assemble the `executeBatch(approve, createOrder)` user-operation.
    async fn build_user_op(&self, context: &OrderContext) -> Result<UserOperation, SweepError> {
        let order = &context.order;
        let token = &context.token;
        let chain_id = context.receive_address.chain_id;
        let network =
            Network::try_from(chain_id).map_err(|_| SweepError::UnknownNetwork(chain_id))?;
        let gateway: Address = network.gateway_address().into();
        let sender: Address = context.receive_address.address.into();

        let amount = TokenAmount::from_scaled(order.amount, token.decimals)?.raw;
        let sender_fee = TokenAmount::from_scaled(order.sender_fee, token.decimals)?.raw;
        let rate_raw = TokenAmount::from_scaled(order.rate, RATE_DECIMALS)?.raw;
        let rate = alloy_primitives::Uint::<96, 2>::from(rate_raw.to::<u128>());
        let refund_address: Address = order
            .refund_address
            .unwrap_or(context.receive_address.address)
            .into();
        let encrypted_recipient = self.cipher.encrypt(order.recipient.as_bytes())?;

        let approve_calldata = approveCall {
            spender: gateway,
            value: amount + sender_fee,
        }
        .abi_encode();
        let create_order_calldata = createOrderCall {
            token: token.contract_address.into(),
            amount,
            rate,
            senderFeeRecipient: self.config.sender_fee_recipient.into(),
            senderFee: sender_fee,
            refundAddress: refund_address,
            messageHash: encrypted_recipient,
        }
        .abi_encode();
        let call_data = executeBatchCall {
            dest: vec![token.contract_address.into(), gateway],
            func: vec![
                Bytes::from(approve_calldata),
                Bytes::from(create_order_calldata),
            ],
        }
        .abi_encode();

        let nonce = retry(self.retry_policy, |_| {
            self.chain
                .account_nonce(chain_id, context.receive_address.address)
        })
        .await?;

        Ok(UserOperation::unsponsored(
            sender,
            nonce,
            Bytes::from(call_data),
        ))
    }

    async fn record_failure(&self, order_id: Uuid) -> Result<SweepOutcome, SweepError> {
        match self
            .orders
            .record_sweep_failure(order_id, self.config.max_retries)
            .await?
        {
            SweepFailure::Retrying { retries } => {
                tracing::info!(
                    %order_id,
                    retries,
                    max_retries = self.config.max_retries,
                    "sweep will be retried"
                );
                Ok(SweepOutcome::Failed { terminal: false })
            }
            SweepFailure::Failed { receive_address_id } => {
                tracing::error!(%order_id, "sweep retries exhausted; order failed");
                if let Some(receive_address_id) = receive_address_id {
                    self.pool.release(receive_address_id).await?;
                }
                Ok(SweepOutcome::Failed { terminal: true })
            }
            SweepFailure::Conflict => Ok(SweepOutcome::Skipped),
        }
    }
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

/// Cheap cloneable hand-off used by the order updater.
#[derive(Clone)]
pub struct SweeperHandle(Arc<Sweeper>);

impl SweeperHandle {
    pub fn new(sweeper: Arc<Sweeper>) -> Self {
        Self(sweeper)
    }
}

impl SweepTrigger for SweeperHandle {
    fn trigger(&self, order_id: Uuid) {
        self.0.spawn_sweep(order_id);
    }
}

impl std::fmt::Debug for SweeperHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SweeperHandle")
    }
}
