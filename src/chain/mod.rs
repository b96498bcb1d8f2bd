//! Chain access for the payment-intake pipeline.
//!
//! This module is the only place that talks to EVM JSON-RPC endpoints, the
//! ERC-4337 bundler, and the paymaster. It exposes a narrow [`ChainClient`]
//! trait so the polling worker and the sweeper can be exercised against
//! fakes, with [`client::RpcChainClient`] as the production implementation.
//!
//! Errors carry a transient/permanent classification; retrying is the
//! caller's job and [`retry`] implements the standard exponential backoff
//! with jitter over that classification.

pub mod client;
pub mod userop;

use alloy_primitives::U256;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;

use crate::types::{EvmAddress, TokenAmount, TxHash};
use userop::{PaymasterData, UserOpReceipt, UserOperation};

/// Failure of a chain-client operation.
///
/// `Transient` failures (timeouts, 5xx, retryable JSON-RPC codes) may be
/// retried with the same inputs; `Permanent` failures (invalid params,
/// bundler `AA*` validation codes, non-429 4xx) must not be.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("no provider configured for chain id {0}")]
    UnknownChain(u64),
    #[error("{method} timed out after {after:?}")]
    Timeout {
        method: &'static str,
        after: Duration,
    },
    #[error("transient failure in {method}: {message}")]
    Transient {
        method: &'static str,
        message: String,
    },
    #[error("permanent failure in {method}: {message}")]
    Permanent {
        method: &'static str,
        message: String,
    },
    #[error("malformed response in {method}: {message}")]
    Decode {
        method: &'static str,
        message: String,
    },
}

impl ChainError {
    /// Whether a retry with identical inputs can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ChainError::Timeout { .. } | ChainError::Transient { .. })
    }
}

/// Whether a JSON-RPC error code is worth retrying.
///
/// Server-side errors and rate limiting are; request-shape errors
/// (-32600..-32602, -32700) are not. Bundler simulation failures surface as
/// `-32500`/`-32501` with `AA*` messages and are permanent: the same
/// user-operation will fail the same way again.
pub fn is_retryable_jsonrpc_code(code: i64) -> bool {
    match code {
        -32700 | -32600 | -32601 | -32602 => false,
        -32500 | -32501 | -32502 | -32503 | -32504 | -32505 => false,
        429 => true,
        code if (400..500).contains(&code) => false,
        _ => true,
    }
}

/// Retry policy: exponential backoff with full jitter, bounded attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base: Duration::from_millis(250),
            cap: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base.saturating_mul(1u32 << attempt.min(16));
        let capped = exp.min(self.cap);
        // Full jitter keeps concurrent retries from synchronizing.
        let jitter = rand::rng().random_range(0..=capped.as_millis() as u64);
        Duration::from_millis(jitter)
    }
}

/// Run `op` under `policy`, retrying transient failures.
///
/// The final error is returned once the attempt budget is exhausted;
/// permanent errors short-circuit immediately.
pub async fn retry<T, F, Fut>(policy: RetryPolicy, op: F) -> Result<T, ChainError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = Result<T, ChainError>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_transient() && attempt + 1 < policy.attempts => {
                let delay = policy.delay(attempt);
                tracing::debug!(attempt, ?delay, %error, "retrying transient chain error");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

/// A decoded ERC-20 `Transfer` log.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferLog {
    pub from: EvmAddress,
    pub to: EvmAddress,
    pub value: U256,
    pub tx_hash: TxHash,
    pub block_number: u64,
}

/// Thin adapter over an EVM JSON-RPC endpoint, an ERC-4337 bundler, and a
/// paymaster.
///
/// All calls are bounded by the configured per-call timeout. Implementations
/// surface error kind + cause and leave retrying to the caller.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// `eth_blockNumber`.
    async fn latest_block(&self, chain_id: u64) -> Result<u64, ChainError>;

    /// ERC-20 balance of `holder`, raw units plus token decimals.
    async fn erc20_balance(
        &self,
        chain_id: u64,
        token: EvmAddress,
        holder: EvmAddress,
    ) -> Result<TokenAmount, ChainError>;

    /// Decoded ERC-20 `Transfer` logs into `to` over a block range.
    async fn transfer_logs(
        &self,
        chain_id: u64,
        token: EvmAddress,
        to: EvmAddress,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferLog>, ChainError>;

    /// Current ERC-4337 nonce of `sender` at the entry point (key 0).
    async fn account_nonce(&self, chain_id: u64, sender: EvmAddress) -> Result<U256, ChainError>;

    /// `eth_sendUserOperation`; returns the userOp hash.
    async fn send_user_op(
        &self,
        chain_id: u64,
        op: &UserOperation,
    ) -> Result<TxHash, ChainError>;

    /// `eth_getUserOperationReceipt`; `None` while not yet mined.
    async fn user_op_receipt(
        &self,
        chain_id: u64,
        user_op_hash: TxHash,
    ) -> Result<Option<UserOpReceipt>, ChainError>;

    /// Request sponsorship data and gas fields from the paymaster under the
    /// given gas policy.
    async fn paymaster_data(
        &self,
        chain_id: u64,
        policy_id: &str,
        op: &UserOperation,
    ) -> Result<PaymasterData, ChainError>;
}
