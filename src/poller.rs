//! Polling fallback: the second, slower half of payment detection.
//!
//! Webhooks are presumed authoritative for young orders; once an
//! `initiated` order is older than `POLLING_MIN_AGE`, each tick reads the
//! receive address's ERC-20 balance directly and synthesizes a transfer
//! event when the observed balance exceeds the recorded `amount_paid`.
//! Synthetic events carry no transaction hash and flow through the same
//! order updater as webhook events, where the cumulative observation rule
//! keeps the two paths from double-counting.
//!
//! A process-local balance cache keyed by `(chain, token, address)`
//! short-circuits repeated reads inside one cycle; staleness up to the TTL
//! is safe because polling only needs to *eventually* observe the correct
//! balance.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use alloy_primitives::Address;

use crate::chain::{ChainClient, RetryPolicy, retry};
use crate::store::{OrderContext, OrderRepo};
use crate::types::{EventSource, TokenAmount, TransferEvent};
use crate::updater::{Applied, EventSink};

/// Polling knobs, fixed at start-up.
#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub interval: Duration,
    pub min_age: Duration,
    pub cache_ttl: Duration,
    /// Upper bound on orders examined per tick.
    pub batch_limit: i64,
}

/// Per-tick counters, emitted as a structured metrics record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollMetrics {
    pub orders_checked: u64,
    pub payments_detected: u64,
    pub rpc_calls: u64,
    pub errors: u64,
    pub avg_check_micros: u64,
}

/// Process-local ERC-20 balance cache with TTL.
struct BalanceCache {
    entries: DashMap<(u64, Address, Address), (TokenAmount, Instant)>,
    ttl: Duration,
}

impl BalanceCache {
    fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    fn get(&self, key: &(u64, Address, Address)) -> Option<TokenAmount> {
        let entry = self.entries.get(key)?;
        let (amount, fetched_at) = *entry;
        (fetched_at.elapsed() <= self.ttl).then_some(amount)
    }

    fn put(&self, key: (u64, Address, Address), amount: TokenAmount) {
        self.entries.insert(key, (amount, Instant::now()));
    }
}

/// Ticker-driven scanner over unresolved orders.
pub struct PollingWorker {
    orders: Arc<dyn OrderRepo>,
    chain: Arc<dyn ChainClient>,
    sink: Arc<dyn EventSink>,
    cache: BalanceCache,
    config: PollerConfig,
    retry_policy: RetryPolicy,
}

impl PollingWorker {
    pub fn new(
        orders: Arc<dyn OrderRepo>,
        chain: Arc<dyn ChainClient>,
        sink: Arc<dyn EventSink>,
        config: PollerConfig,
    ) -> Self {
        Self {
            orders,
            chain,
            sink,
            cache: BalanceCache::new(config.cache_ttl),
            config,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Run until cancelled. One tick per `interval`; ticks never overlap.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(interval = ?self.config.interval, "polling fallback started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("polling fallback stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let metrics = self.tick(&cancel).await;
                    tracing::info!(
                        orders_checked = metrics.orders_checked,
                        payments_detected = metrics.payments_detected,
                        rpc_calls = metrics.rpc_calls,
                        errors = metrics.errors,
                        avg_check_micros = metrics.avg_check_micros,
                        "polling cycle complete"
                    );
                }
            }
        }
    }

    /// One polling cycle.
    ///
    /// Cancellation is honoured *between* orders, never between a balance
    /// read and the resulting event submission, so no order sees partial
    /// work.
    #[instrument(skip_all)]
    pub async fn tick(&self, cancel: &CancellationToken) -> PollMetrics {
        let mut metrics = PollMetrics::default();
        let contexts = match self
            .orders
            .pollable(self.config.min_age, self.config.batch_limit)
            .await
        {
            Ok(contexts) => contexts,
            Err(error) => {
                tracing::error!(%error, "failed to list pollable orders");
                metrics.errors += 1;
                return metrics;
            }
        };

        let mut total_check = Duration::ZERO;
        for context in contexts {
            if cancel.is_cancelled() {
                break;
            }
            let started = Instant::now();
            match self.check_order(&context, &mut metrics).await {
                Ok(detected) => {
                    if detected {
                        metrics.payments_detected += 1;
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        order_id = %context.order.id,
                        %error,
                        "balance check failed"
                    );
                    metrics.errors += 1;
                }
            }
            metrics.orders_checked += 1;
            total_check += started.elapsed();
        }
        if metrics.orders_checked > 0 {
            metrics.avg_check_micros =
                (total_check.as_micros() / metrics.orders_checked as u128) as u64;
        }
        metrics
    }

    /// Read the receive address's balance and synthesize an event if it
    /// exceeds what the order has recorded.
    async fn check_order(
        &self,
        context: &OrderContext,
        metrics: &mut PollMetrics,
    ) -> Result<bool, Box<dyn std::error::Error + Send + Sync>> {
        let chain_id = context.receive_address.chain_id;
        let token = context.token.contract_address;
        let holder = context.receive_address.address;
        let key = (chain_id, token.0, holder.0);

        let balance = match self.cache.get(&key) {
            Some(balance) => balance,
            None => {
                metrics.rpc_calls += 1;
                let balance = retry(self.retry_policy, |_| {
                    self.chain.erc20_balance(chain_id, token, holder)
                })
                .await?;
                self.cache.put(key, balance);
                balance
            }
        };

        let observed = balance.scaled()?;
        if observed <= context.order.amount_paid {
            return Ok(false);
        }
        tracing::info!(
            order_id = %context.order.id,
            address = %holder,
            %observed,
            recorded = %context.order.amount_paid,
            "polling detected a deposit"
        );
        let event = TransferEvent {
            chain_id,
            from: None,
            to: holder,
            token_contract: Some(token),
            amount: balance,
            tx_hash: None,
            block_number: None,
            source: EventSource::Polling,
            provider_event_id: None,
        };
        let applied = self.sink.apply(event).await?;
        Ok(matches!(applied, Applied::Updated { .. } | Applied::Expired { .. }))
    }
}

impl std::fmt::Debug for PollingWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollingWorker")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::U256;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU64, Ordering};
    use uuid::Uuid;

    use crate::chain::userop::{PaymasterData, UserOpReceipt, UserOperation};
    use crate::chain::{ChainError, TransferLog};
    use crate::store::{
        ApplyOutcome, PaymentObservation, PaymentOrder, ReceiveAddress, StoreError, Token,
    };
    use crate::types::{AddressStatus, EvmAddress, OrderStatus, TxHash};
    use crate::updater::UpdateError;

    struct FakeOrders {
        contexts: Vec<OrderContext>,
    }

    #[async_trait]
    impl OrderRepo for FakeOrders {
        async fn open_orders_by_address(
            &self,
            _: u64,
            _: &EvmAddress,
        ) -> Result<Vec<OrderContext>, StoreError> {
            Ok(Vec::new())
        }
        async fn apply_payment(
            &self,
            _: Uuid,
            _: PaymentObservation,
        ) -> Result<ApplyOutcome, StoreError> {
            Ok(ApplyOutcome::NotFound)
        }
        async fn mark_expired(&self, _: Uuid) -> Result<Option<Option<Uuid>>, StoreError> {
            Ok(None)
        }
        async fn pollable(
            &self,
            _: Duration,
            _: i64,
        ) -> Result<Vec<OrderContext>, StoreError> {
            Ok(self.contexts.clone())
        }
        async fn sweepable(&self, _: i64) -> Result<Vec<Uuid>, StoreError> {
            Ok(Vec::new())
        }
        async fn begin_sweep(&self, _: Uuid) -> Result<Option<OrderContext>, StoreError> {
            Ok(None)
        }
        async fn record_sweep(&self, _: Uuid, _: TxHash, _: u64) -> Result<bool, StoreError> {
            Ok(true)
        }
        async fn record_sweep_failure(
            &self,
            _: Uuid,
            _: u32,
        ) -> Result<crate::store::SweepFailure, StoreError> {
            Ok(crate::store::SweepFailure::Conflict)
        }
        async fn mark_settled(&self, _: Uuid) -> Result<bool, StoreError> {
            Ok(true)
        }
    }

    struct FakeChain {
        balance: U256,
        calls: AtomicU64,
    }

    #[async_trait]
    impl ChainClient for FakeChain {
        async fn latest_block(&self, _: u64) -> Result<u64, ChainError> {
            Ok(0)
        }
        async fn erc20_balance(
            &self,
            _: u64,
            _: EvmAddress,
            _: EvmAddress,
        ) -> Result<TokenAmount, ChainError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TokenAmount::new(self.balance, 18))
        }
        async fn transfer_logs(
            &self,
            _: u64,
            _: EvmAddress,
            _: EvmAddress,
            _: u64,
            _: u64,
        ) -> Result<Vec<TransferLog>, ChainError> {
            Ok(Vec::new())
        }
        async fn account_nonce(&self, _: u64, _: EvmAddress) -> Result<U256, ChainError> {
            Ok(U256::ZERO)
        }
        async fn send_user_op(&self, _: u64, _: &UserOperation) -> Result<TxHash, ChainError> {
            unimplemented!("not used by the poller")
        }
        async fn user_op_receipt(
            &self,
            _: u64,
            _: TxHash,
        ) -> Result<Option<UserOpReceipt>, ChainError> {
            Ok(None)
        }
        async fn paymaster_data(
            &self,
            _: u64,
            _: &str,
            _: &UserOperation,
        ) -> Result<PaymasterData, ChainError> {
            unimplemented!("not used by the poller")
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<TransferEvent>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn apply(&self, event: TransferEvent) -> Result<Applied, UpdateError> {
            let order_id = Uuid::new_v4();
            self.events.lock().unwrap().push(event);
            Ok(Applied::Updated {
                order_id,
                status: OrderStatus::Validated,
                newly_validated: true,
            })
        }
    }

    fn context(amount_paid: &str) -> OrderContext {
        let now = Utc::now();
        OrderContext {
            order: PaymentOrder {
                id: Uuid::new_v4(),
                amount: Decimal::from_str("0.5").unwrap(),
                amount_paid: Decimal::from_str(amount_paid).unwrap(),
                sender_fee: Decimal::ZERO,
                network_fee: Decimal::ZERO,
                protocol_fee: Decimal::ZERO,
                rate: Decimal::ONE,
                token_id: Uuid::new_v4(),
                sender_profile_id: None,
                status: OrderStatus::Initiated,
                receive_address_id: Some(Uuid::new_v4()),
                recipient: "opaque".into(),
                refund_address: None,
                tx_hash: None,
                sweep_tx_hash: None,
                swept_at: None,
                sweep_retries: 0,
                block_number: None,
                created_at: now - chrono::Duration::minutes(10),
                updated_at: now,
                expires_at: None,
            },
            receive_address: ReceiveAddress {
                id: Uuid::new_v4(),
                address: "0xaaa0000000000000000000000000000000000aaa".parse().unwrap(),
                salt: None,
                network_identifier: "base-sepolia".into(),
                chain_id: 84532,
                status: AddressStatus::PoolAssigned,
                is_deployed: true,
                deployment_tx_hash: None,
                deployment_block: None,
                deployed_at: None,
                assigned_at: Some(now),
                recycled_at: None,
                times_used: 1,
                last_indexed_block: None,
                last_used: None,
                valid_until: None,
            },
            token: Token {
                id: Uuid::new_v4(),
                symbol: "DAI".into(),
                contract_address: "0x7683022d84F726a96c4A6611cD31DBf5409c0Ac9"
                    .parse()
                    .unwrap(),
                decimals: 18,
                network_identifier: "base-sepolia".into(),
                chain_id: 84532,
                is_enabled: true,
            },
        }
    }

    fn config() -> PollerConfig {
        PollerConfig {
            interval: Duration::from_secs(60),
            min_age: Duration::from_secs(300),
            cache_ttl: Duration::from_secs(30),
            batch_limit: 100,
        }
    }

    fn worker(
        contexts: Vec<OrderContext>,
        balance: U256,
    ) -> (PollingWorker, Arc<RecordingSink>, Arc<FakeChain>) {
        let chain = Arc::new(FakeChain {
            balance,
            calls: AtomicU64::new(0),
        });
        let sink = Arc::new(RecordingSink::default());
        let worker = PollingWorker::new(
            Arc::new(FakeOrders { contexts }),
            Arc::clone(&chain) as Arc<dyn ChainClient>,
            Arc::clone(&sink) as Arc<dyn EventSink>,
            config(),
        );
        (worker, sink, chain)
    }

    #[tokio::test]
    async fn detects_a_deposit_and_synthesizes_an_event() {
        let (worker, sink, _) = worker(
            vec![context("0")],
            U256::from(500_000_000_000_000_000u64),
        );
        let metrics = worker.tick(&CancellationToken::new()).await;
        assert_eq!(metrics.orders_checked, 1);
        assert_eq!(metrics.payments_detected, 1);
        assert_eq!(metrics.rpc_calls, 1);
        assert_eq!(metrics.errors, 0);

        let events = sink.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, EventSource::Polling);
        assert!(events[0].tx_hash.is_none());
        assert_eq!(
            events[0].amount.raw,
            U256::from(500_000_000_000_000_000u64)
        );
    }

    #[tokio::test]
    async fn no_event_when_balance_matches_recorded_payment() {
        let (worker, sink, _) = worker(
            vec![context("0.5")],
            U256::from(500_000_000_000_000_000u64),
        );
        let metrics = worker.tick(&CancellationToken::new()).await;
        assert_eq!(metrics.orders_checked, 1);
        assert_eq!(metrics.payments_detected, 0);
        assert!(sink.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn balance_cache_short_circuits_repeat_reads() {
        // Two orders on the same (chain, token, address) triple.
        let shared = context("0");
        let mut second = shared.clone();
        second.order.id = Uuid::new_v4();
        let (worker, _, chain) = worker(
            vec![shared, second],
            U256::from(500_000_000_000_000_000u64),
        );
        let metrics = worker.tick(&CancellationToken::new()).await;
        assert_eq!(metrics.orders_checked, 2);
        assert_eq!(chain.calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.rpc_calls, 1);
    }

    #[tokio::test]
    async fn cancellation_stops_between_orders() {
        let (worker, sink, _) = worker(
            vec![context("0"), context("0")],
            U256::from(500_000_000_000_000_000u64),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let metrics = worker.tick(&cancel).await;
        assert_eq!(metrics.orders_checked, 0);
        assert!(sink.events.lock().unwrap().is_empty());
    }
}
