//! In-memory reference implementations of the repositories and chain
//! client, with the same transition semantics as the SQL layer. Scenario
//! tests drive the real workers against these.

use alloy_primitives::{B256, U256};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use uuid::Uuid;

use rampline::chain::userop::{PaymasterData, UserOpInclusion, UserOpReceipt, UserOperation};
use rampline::chain::{ChainClient, ChainError, TransferLog};
use rampline::store::{
    ApplyOutcome, OrderContext, OrderRepo, PaymentApplied, PaymentObservation, PaymentOrder,
    PoolRepo, ReceiveAddress, StoreError, SweepFailure, Token, WebhookKeyRepo,
};
use rampline::types::{AddressStatus, EvmAddress, OrderStatus, TokenAmount, TxHash};
use rampline::updater::SweepTrigger;

pub const DAI_BASE_SEPOLIA: &str = "0x7683022d84f726a96c4a6611cd31dbf5409c0ac9";
pub const CHAIN_ID: u64 = 84532;
pub const NETWORK: &str = "base-sepolia";

pub fn receive_address_row(address: &str) -> ReceiveAddress {
    ReceiveAddress {
        id: Uuid::new_v4(),
        address: address.parse().expect("valid address literal"),
        salt: None,
        network_identifier: NETWORK.into(),
        chain_id: CHAIN_ID,
        status: AddressStatus::PoolReady,
        is_deployed: true,
        deployment_tx_hash: None,
        deployment_block: Some(1),
        deployed_at: Some(Utc::now()),
        assigned_at: None,
        recycled_at: None,
        times_used: 0,
        last_indexed_block: None,
        last_used: None,
        valid_until: None,
    }
}

pub fn dai_token() -> Token {
    Token {
        id: Uuid::new_v4(),
        symbol: "DAI".into(),
        contract_address: DAI_BASE_SEPOLIA.parse().unwrap(),
        decimals: 18,
        network_identifier: NETWORK.into(),
        chain_id: CHAIN_ID,
        is_enabled: true,
    }
}

pub fn order_row(amount: &str, token: &Token) -> PaymentOrder {
    let now = Utc::now();
    PaymentOrder {
        id: Uuid::new_v4(),
        amount: amount.parse().unwrap(),
        amount_paid: Decimal::ZERO,
        sender_fee: Decimal::ZERO,
        network_fee: Decimal::ZERO,
        protocol_fee: Decimal::ZERO,
        rate: "1580.50".parse().unwrap(),
        token_id: token.id,
        sender_profile_id: None,
        status: OrderStatus::Initiated,
        receive_address_id: None,
        recipient: r#"{"institution":"FBNINGLA","account":"0123456789"}"#.into(),
        refund_address: None,
        tx_hash: None,
        sweep_tx_hash: None,
        swept_at: None,
        sweep_retries: 0,
        block_number: None,
        created_at: now - chrono::Duration::minutes(10),
        updated_at: now,
        expires_at: Some(now + chrono::Duration::minutes(30)),
    }
}

/// In-memory receive-address pool with the allocator's eligibility rules.
#[derive(Default)]
pub struct InMemoryPool {
    pub rows: Mutex<Vec<ReceiveAddress>>,
}

impl InMemoryPool {
    pub fn with_rows(rows: Vec<ReceiveAddress>) -> Self {
        Self {
            rows: Mutex::new(rows),
        }
    }

    pub fn status_of(&self, id: Uuid) -> Option<AddressStatus> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|row| row.id == id)
            .map(|row| row.status)
    }
}

#[async_trait]
impl PoolRepo for InMemoryPool {
    async fn allocate(
        &self,
        chain_id: u64,
        network_identifier: &str,
        reuse_cap: u32,
    ) -> Result<ReceiveAddress, StoreError> {
        // The mutex plays the role of the row lock: check-and-set is atomic.
        let mut rows = self.rows.lock().unwrap();
        let candidate = rows.iter_mut().find(|row| {
            row.status.is_allocatable()
                && row.is_deployed
                && row.chain_id == chain_id
                && row.network_identifier == network_identifier
                && row.times_used < reuse_cap as i32
        });
        match candidate {
            Some(row) => {
                row.status = AddressStatus::PoolAssigned;
                row.times_used += 1;
                row.assigned_at = Some(Utc::now());
                row.last_used = Some(Utc::now());
                Ok(row.clone())
            }
            None => Err(StoreError::PoolEmpty {
                chain_id,
                network_identifier: network_identifier.into(),
            }),
        }
    }

    async fn recycle(&self, id: Uuid) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|row| {
            row.id == id
                && matches!(
                    row.status,
                    AddressStatus::PoolAssigned
                        | AddressStatus::PoolProcessing
                        | AddressStatus::PoolCompleted
                )
        }) {
            row.status = AddressStatus::PoolReady;
            row.recycled_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_processing(&self, id: Uuid) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|row| {
            row.id == id
                && matches!(
                    row.status,
                    AddressStatus::PoolAssigned | AddressStatus::PoolProcessing
                )
        }) {
            row.status = AddressStatus::PoolProcessing;
        }
        Ok(())
    }

    async fn mark_completed(&self, id: Uuid) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.iter_mut().find(|row| {
            row.id == id
                && matches!(
                    row.status,
                    AddressStatus::PoolAssigned | AddressStatus::PoolProcessing
                )
        }) {
            row.status = AddressStatus::PoolCompleted;
        }
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ReceiveAddress>, StoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .find(|row| row.id == id)
            .cloned())
    }

    async fn ready_count(
        &self,
        chain_id: u64,
        network_identifier: &str,
    ) -> Result<i64, StoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| {
                row.status == AddressStatus::PoolReady
                    && row.is_deployed
                    && row.chain_id == chain_id
                    && row.network_identifier == network_identifier
            })
            .count() as i64)
    }

    async fn retired_count(&self, chain_id: u64, reuse_cap: u32) -> Result<i64, StoreError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| {
                row.status == AddressStatus::PoolCompleted
                    && row.chain_id == chain_id
                    && row.times_used >= reuse_cap as i32
            })
            .count() as i64)
    }

    async fn open_order_count(&self, _id: Uuid) -> Result<i64, StoreError> {
        Ok(1)
    }
}

/// In-memory order store mirroring the SQL layer's guarded transitions.
pub struct InMemoryOrders {
    pub contexts: Mutex<Vec<OrderContext>>,
}

impl InMemoryOrders {
    pub fn with_contexts(contexts: Vec<OrderContext>) -> Self {
        Self {
            contexts: Mutex::new(contexts),
        }
    }

    pub fn order(&self, id: Uuid) -> PaymentOrder {
        self.contexts
            .lock()
            .unwrap()
            .iter()
            .find(|context| context.order.id == id)
            .map(|context| context.order.clone())
            .expect("order exists")
    }
}

#[async_trait]
impl OrderRepo for InMemoryOrders {
    async fn open_orders_by_address(
        &self,
        chain_id: u64,
        to: &EvmAddress,
    ) -> Result<Vec<OrderContext>, StoreError> {
        let contexts = self.contexts.lock().unwrap();
        let mut matched: Vec<OrderContext> = contexts
            .iter()
            .filter(|context| {
                context.receive_address.chain_id == chain_id
                    && context.receive_address.address == *to
                    && !context.order.status.is_terminal()
            })
            .cloned()
            .collect();
        matched.sort_by_key(|context| {
            (
                !context.order.status.accepts_payment(),
                context.order.created_at,
            )
        });
        Ok(matched)
    }

    async fn apply_payment(
        &self,
        order_id: Uuid,
        observation: PaymentObservation,
    ) -> Result<ApplyOutcome, StoreError> {
        let mut contexts = self.contexts.lock().unwrap();
        let Some(context) = contexts
            .iter_mut()
            .find(|context| context.order.id == order_id)
        else {
            return Ok(ApplyOutcome::NotFound);
        };
        let order = &mut context.order;
        if order.status.is_terminal() {
            return Ok(ApplyOutcome::Terminal(order.status));
        }
        let previous_status = order.status;
        let new_paid = match observation {
            PaymentObservation::Incremental(amount) => order.amount_paid + amount,
            PaymentObservation::Cumulative(amount) => order.amount_paid.max(amount),
        };
        order.amount_paid = new_paid;
        if order.status == OrderStatus::Initiated && new_paid >= order.total_required() {
            order.status = OrderStatus::Validated;
        }
        order.updated_at = Utc::now();
        Ok(ApplyOutcome::Applied(PaymentApplied {
            order_id,
            previous_status,
            status: order.status,
            amount_paid: order.amount_paid,
            receive_address_id: order.receive_address_id,
        }))
    }

    async fn mark_expired(&self, order_id: Uuid) -> Result<Option<Option<Uuid>>, StoreError> {
        let mut contexts = self.contexts.lock().unwrap();
        let Some(context) = contexts
            .iter_mut()
            .find(|context| context.order.id == order_id)
        else {
            return Ok(None);
        };
        if !matches!(
            context.order.status,
            OrderStatus::Initiated | OrderStatus::Validated
        ) {
            return Ok(None);
        }
        context.order.status = OrderStatus::Expired;
        Ok(Some(context.order.receive_address_id))
    }

    async fn pollable(
        &self,
        min_age: Duration,
        limit: i64,
    ) -> Result<Vec<OrderContext>, StoreError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(min_age).expect("min_age fits chrono range");
        let contexts = self.contexts.lock().unwrap();
        Ok(contexts
            .iter()
            .filter(|context| {
                context.order.status == OrderStatus::Initiated
                    && context.order.created_at < cutoff
                    && context.token.is_enabled
            })
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn sweepable(&self, limit: i64) -> Result<Vec<Uuid>, StoreError> {
        let contexts = self.contexts.lock().unwrap();
        Ok(contexts
            .iter()
            .filter(|context| context.order.status == OrderStatus::Validated)
            .take(limit as usize)
            .map(|context| context.order.id)
            .collect())
    }

    async fn begin_sweep(&self, order_id: Uuid) -> Result<Option<OrderContext>, StoreError> {
        let contexts = self.contexts.lock().unwrap();
        Ok(contexts
            .iter()
            .find(|context| {
                context.order.id == order_id && context.order.status == OrderStatus::Validated
            })
            .cloned())
    }

    async fn record_sweep(
        &self,
        order_id: Uuid,
        sweep_tx_hash: TxHash,
        block_number: u64,
    ) -> Result<bool, StoreError> {
        let mut contexts = self.contexts.lock().unwrap();
        let Some(context) = contexts.iter_mut().find(|context| {
            context.order.id == order_id && context.order.status == OrderStatus::Validated
        }) else {
            return Ok(false);
        };
        context.order.status = OrderStatus::Swept;
        context.order.sweep_tx_hash = Some(sweep_tx_hash);
        context.order.block_number = Some(block_number as i64);
        context.order.swept_at = Some(Utc::now());
        Ok(true)
    }

    async fn record_sweep_failure(
        &self,
        order_id: Uuid,
        max_retries: u32,
    ) -> Result<SweepFailure, StoreError> {
        let mut contexts = self.contexts.lock().unwrap();
        let Some(context) = contexts.iter_mut().find(|context| {
            context.order.id == order_id && context.order.status == OrderStatus::Validated
        }) else {
            return Ok(SweepFailure::Conflict);
        };
        context.order.sweep_retries += 1;
        if context.order.sweep_retries >= max_retries as i32 {
            context.order.status = OrderStatus::Failed;
            Ok(SweepFailure::Failed {
                receive_address_id: context.order.receive_address_id,
            })
        } else {
            Ok(SweepFailure::Retrying {
                retries: context.order.sweep_retries,
            })
        }
    }

    async fn mark_settled(&self, order_id: Uuid) -> Result<bool, StoreError> {
        let mut contexts = self.contexts.lock().unwrap();
        let Some(context) = contexts.iter_mut().find(|context| {
            context.order.id == order_id && context.order.status == OrderStatus::Swept
        }) else {
            return Ok(false);
        };
        context.order.status = OrderStatus::Settled;
        Ok(true)
    }
}

/// Static signing-key table.
pub struct StaticKeys {
    pub keys: HashMap<String, String>,
}

impl StaticKeys {
    pub fn single(webhook_id: &str, key: &str) -> Self {
        let mut keys = HashMap::new();
        keys.insert(webhook_id.to_string(), key.to_string());
        Self { keys }
    }
}

#[async_trait]
impl WebhookKeyRepo for StaticKeys {
    async fn signing_key(&self, webhook_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.keys.get(webhook_id).cloned())
    }

    async fn upsert(&self, _: &str, _: &str, _: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Scripted chain client: programmable balances and paymaster responses, a
/// bundler that always accepts, and receipts that always succeed.
pub struct ScriptedChain {
    pub balances: Mutex<HashMap<(EvmAddress, EvmAddress), U256>>,
    pub paymaster_script: Mutex<Vec<Result<PaymasterData, ChainError>>>,
    pub sent_ops: Mutex<Vec<UserOperation>>,
    pub balance_calls: AtomicU64,
}

impl Default for ScriptedChain {
    fn default() -> Self {
        Self {
            balances: Mutex::new(HashMap::new()),
            paymaster_script: Mutex::new(Vec::new()),
            sent_ops: Mutex::new(Vec::new()),
            balance_calls: AtomicU64::new(0),
        }
    }
}

impl ScriptedChain {
    pub fn set_balance(&self, token: EvmAddress, holder: EvmAddress, raw: U256) {
        self.balances.lock().unwrap().insert((token, holder), raw);
    }

    pub fn push_paymaster_failure(&self, error: ChainError) {
        self.paymaster_script.lock().unwrap().push(Err(error));
    }

    pub fn sponsorship() -> PaymasterData {
        PaymasterData {
            paymaster_and_data: alloy_primitives::Bytes::from(vec![0xaa; 52]),
            call_gas_limit: U256::from(200_000u64),
            verification_gas_limit: U256::from(150_000u64),
            pre_verification_gas: U256::from(60_000u64),
            max_fee_per_gas: U256::from(1_000_000_000u64),
            max_priority_fee_per_gas: U256::from(1_000_000u64),
        }
    }
}

#[async_trait]
impl ChainClient for ScriptedChain {
    async fn latest_block(&self, _: u64) -> Result<u64, ChainError> {
        Ok(1000)
    }

    async fn erc20_balance(
        &self,
        _: u64,
        token: EvmAddress,
        holder: EvmAddress,
    ) -> Result<TokenAmount, ChainError> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        let raw = self
            .balances
            .lock()
            .unwrap()
            .get(&(token, holder))
            .copied()
            .unwrap_or(U256::ZERO);
        Ok(TokenAmount::new(raw, 18))
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

    async fn send_user_op(&self, _: u64, op: &UserOperation) -> Result<TxHash, ChainError> {
        self.sent_ops.lock().unwrap().push(op.clone());
        Ok(TxHash(B256::repeat_byte(0x42)))
    }

    async fn user_op_receipt(
        &self,
        _: u64,
        user_op_hash: TxHash,
    ) -> Result<Option<UserOpReceipt>, ChainError> {
        Ok(Some(UserOpReceipt {
            user_op_hash: user_op_hash.0,
            success: true,
            receipt: UserOpInclusion {
                transaction_hash: B256::repeat_byte(0x77),
                block_number: U256::from(1234u64),
            },
        }))
    }

    async fn paymaster_data(
        &self,
        _: u64,
        _: &str,
        _: &UserOperation,
    ) -> Result<PaymasterData, ChainError> {
        let mut script = self.paymaster_script.lock().unwrap();
        if script.is_empty() {
            Ok(Self::sponsorship())
        } else {
            script.remove(0)
        }
    }
}

/// Records sweep triggers instead of spawning tasks, so scenario tests can
/// drive the sweeper deterministically.
#[derive(Default)]
pub struct RecordingTrigger {
    pub triggered: Mutex<Vec<Uuid>>,
}

impl SweepTrigger for RecordingTrigger {
    fn trigger(&self, order_id: Uuid) {
        self.triggered.lock().unwrap().push(order_id);
    }
}
