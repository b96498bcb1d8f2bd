//! JSON-RPC implementation of [`ChainClient`] over Alloy providers.
//!
//! One provider per configured network; the bundler and paymaster ride the
//! same provider endpoint. Every call is wrapped in the configured per-call
//! timeout and classified into the transient/permanent taxonomy before it
//! reaches callers.

use alloy_network::TransactionBuilder;
use alloy_primitives::{Address, B256, U256};
use alloy_provider::{Provider, ProviderBuilder, RootProvider};
use alloy_rpc_types_eth::{Filter, Log, TransactionRequest};
use alloy_sol_types::{SolCall, SolEvent, sol};
use alloy_transport::{RpcError, TransportError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tracing::instrument;

use super::{ChainClient, ChainError, TransferLog, is_retryable_jsonrpc_code};
use crate::chain::userop::{PaymasterData, UserOpReceipt, UserOperation, dummy_signature};
use crate::network::{ENTRY_POINT_V06, Network};
use crate::types::{EvmAddress, TokenAmount, TxHash};

sol! {
    function balanceOf(address owner) external view returns (uint256);
    function decimals() external view returns (uint8);
    function getNonce(address sender, uint192 key) external view returns (uint256 nonce);

    event Transfer(address indexed from, address indexed to, uint256 value);
}

/// A connected per-network provider.
struct ChainHandle {
    network: Network,
    provider: RootProvider,
}

/// Production [`ChainClient`] over JSON-RPC/HTTPS.
pub struct RpcChainClient {
    handles: HashMap<u64, ChainHandle>,
    timeout: Duration,
    /// ERC-20 decimals are immutable per deployment; cache them.
    decimals: DashMap<(u64, Address), u8>,
}

impl RpcChainClient {
    /// Connect providers for the given networks.
    ///
    /// The API key is appended to each endpoint template at connect time and
    /// lives only inside the transport.
    pub fn connect(
        networks: &[Network],
        api_key: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, ChainError> {
        let mut handles = HashMap::new();
        for network in networks {
            let url = network
                .rpc_url(api_key)
                .map_err(|e| ChainError::Permanent {
                    method: "connect",
                    message: e.to_string(),
                })?;
            let provider = ProviderBuilder::default().connect_http(url);
            tracing::info!(network = %network, "initialized chain provider");
            handles.insert(
                network.chain_id(),
                ChainHandle {
                    network: *network,
                    provider,
                },
            );
        }
        Ok(Self {
            handles,
            timeout,
            decimals: DashMap::new(),
        })
    }

    fn handle(&self, chain_id: u64) -> Result<&ChainHandle, ChainError> {
        self.handles
            .get(&chain_id)
            .ok_or(ChainError::UnknownChain(chain_id))
    }

    /// Await `fut` under the per-call timeout and classify failures.
    async fn bounded<T>(
        &self,
        method: &'static str,
        fut: impl IntoFuture<Output = Result<T, TransportError>>,
    ) -> Result<T, ChainError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(classify_transport(method, error)),
            Err(_) => Err(ChainError::Timeout {
                method,
                after: self.timeout,
            }),
        }
    }

    async fn eth_call(
        &self,
        method: &'static str,
        chain_id: u64,
        to: Address,
        calldata: Vec<u8>,
    ) -> Result<Vec<u8>, ChainError> {
        let handle = self.handle(chain_id)?;
        let tx = TransactionRequest::default()
            .with_to(to)
            .with_input(calldata);
        let bytes = self
            .bounded(method, handle.provider.call(tx).into_future())
            .await?;
        Ok(bytes.to_vec())
    }

    async fn token_decimals(&self, chain_id: u64, token: Address) -> Result<u8, ChainError> {
        if let Some(cached) = self.decimals.get(&(chain_id, token)) {
            return Ok(*cached);
        }
        let data = self
            .eth_call("erc20_decimals", chain_id, token, decimalsCall {}.abi_encode())
            .await?;
        let decimals = decimalsCall::abi_decode_returns(&data).map_err(|e| ChainError::Decode {
            method: "erc20_decimals",
            message: e.to_string(),
        })?;
        self.decimals.insert((chain_id, token), decimals);
        Ok(decimals)
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    #[instrument(skip(self), err)]
    async fn latest_block(&self, chain_id: u64) -> Result<u64, ChainError> {
        let handle = self.handle(chain_id)?;
        self.bounded(
            "eth_blockNumber",
            handle.provider.get_block_number().into_future(),
        )
        .await
    }

    #[instrument(skip(self), err, fields(chain_id, token = %token, holder = %holder))]
    async fn erc20_balance(
        &self,
        chain_id: u64,
        token: EvmAddress,
        holder: EvmAddress,
    ) -> Result<TokenAmount, ChainError> {
        let decimals = self.token_decimals(chain_id, token.0).await?;
        let calldata = balanceOfCall { owner: holder.0 }.abi_encode();
        let data = self
            .eth_call("erc20_balanceOf", chain_id, token.0, calldata)
            .await?;
        let raw = balanceOfCall::abi_decode_returns(&data).map_err(|e| ChainError::Decode {
            method: "erc20_balanceOf",
            message: e.to_string(),
        })?;
        Ok(TokenAmount::new(raw, decimals))
    }

    #[instrument(skip(self), err, fields(chain_id, token = %token, to = %to))]
    async fn transfer_logs(
        &self,
        chain_id: u64,
        token: EvmAddress,
        to: EvmAddress,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferLog>, ChainError> {
        let handle = self.handle(chain_id)?;
        let filter = Filter::new()
            .address(token.0)
            .event_signature(Transfer::SIGNATURE_HASH)
            .topic2(B256::left_padding_from(to.0.as_slice()))
            .from_block(from_block)
            .to_block(to_block);
        let logs = self
            .bounded("eth_getLogs", handle.provider.get_logs(&filter).into_future())
            .await?;
        let mut transfers = Vec::with_capacity(logs.len());
        for log in &logs {
            match decode_transfer_log(log) {
                Ok(transfer) => transfers.push(transfer),
                Err(error) => {
                    tracing::warn!(%error, "skipping undecodable transfer log");
                }
            }
        }
        Ok(transfers)
    }

    #[instrument(skip(self), err, fields(chain_id, sender = %sender))]
    async fn account_nonce(&self, chain_id: u64, sender: EvmAddress) -> Result<U256, ChainError> {
        let calldata = getNonceCall {
            sender: sender.0,
            key: alloy_primitives::Uint::<192, 3>::ZERO,
        }
        .abi_encode();
        let data = self
            .eth_call("entrypoint_getNonce", chain_id, ENTRY_POINT_V06, calldata)
            .await?;
        getNonceCall::abi_decode_returns(&data).map_err(|e| ChainError::Decode {
            method: "entrypoint_getNonce",
            message: e.to_string(),
        })
    }

    #[instrument(skip(self, op), err, fields(chain_id, sender = %op.sender))]
    async fn send_user_op(
        &self,
        chain_id: u64,
        op: &UserOperation,
    ) -> Result<TxHash, ChainError> {
        let handle = self.handle(chain_id)?;
        let hash: B256 = self
            .bounded(
                "eth_sendUserOperation",
                handle
                    .provider
                    .client()
                    .request("eth_sendUserOperation", (op.clone(), ENTRY_POINT_V06)),
            )
            .await?;
        Ok(TxHash(hash))
    }

    #[instrument(skip(self), err, fields(chain_id, user_op_hash = %user_op_hash))]
    async fn user_op_receipt(
        &self,
        chain_id: u64,
        user_op_hash: TxHash,
    ) -> Result<Option<UserOpReceipt>, ChainError> {
        let handle = self.handle(chain_id)?;
        self.bounded(
            "eth_getUserOperationReceipt",
            handle
                .provider
                .client()
                .request("eth_getUserOperationReceipt", (user_op_hash.0,)),
        )
        .await
    }

    #[instrument(skip(self, op), err, fields(chain_id, policy_id))]
    async fn paymaster_data(
        &self,
        chain_id: u64,
        policy_id: &str,
        op: &UserOperation,
    ) -> Result<PaymasterData, ChainError> {
        let handle = self.handle(chain_id)?;
        let params = json!([{
            "policyId": policy_id,
            "entryPoint": ENTRY_POINT_V06,
            "dummySignature": dummy_signature(),
            "userOperation": op,
        }]);
        self.bounded(
            "alchemy_requestGasAndPaymasterAndData",
            handle
                .provider
                .client()
                .request("alchemy_requestGasAndPaymasterAndData", params),
        )
        .await
    }
}

impl std::fmt::Debug for RpcChainClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let networks: Vec<_> = self
            .handles
            .values()
            .map(|handle| handle.network.identifier())
            .collect();
        f.debug_struct("RpcChainClient")
            .field("networks", &networks)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Decode an `eth_getLogs` entry into a [`TransferLog`].
fn decode_transfer_log(log: &Log) -> Result<TransferLog, ChainError> {
    let topics = log.inner.topics();
    if topics.len() != 3 || topics[0] != Transfer::SIGNATURE_HASH {
        return Err(ChainError::Decode {
            method: "eth_getLogs",
            message: format!("unexpected topics: {topics:?}"),
        });
    }
    let tx_hash = log.transaction_hash.ok_or(ChainError::Decode {
        method: "eth_getLogs",
        message: "log missing transaction hash".into(),
    })?;
    let block_number = log.block_number.ok_or(ChainError::Decode {
        method: "eth_getLogs",
        message: "log missing block number".into(),
    })?;
    Ok(TransferLog {
        from: Address::from_word(topics[1]).into(),
        to: Address::from_word(topics[2]).into(),
        value: U256::from_be_slice(log.inner.data.data.as_ref()),
        tx_hash: TxHash(tx_hash),
        block_number,
    })
}

/// Map a transport failure onto the transient/permanent taxonomy.
fn classify_transport(method: &'static str, error: TransportError) -> ChainError {
    match error {
        RpcError::ErrorResp(payload) => {
            classify_rpc_error(method, payload.code, &payload.message)
        }
        RpcError::SerError(e) => ChainError::Decode {
            method,
            message: e.to_string(),
        },
        RpcError::DeserError { err, .. } => ChainError::Decode {
            method,
            message: err.to_string(),
        },
        RpcError::NullResp => ChainError::Decode {
            method,
            message: "null response".into(),
        },
        other => ChainError::Transient {
            method,
            message: other.to_string(),
        },
    }
}

/// Classify a JSON-RPC error response.
///
/// Bundler validation failures carry `AA`-prefixed reasons regardless of the
/// numeric code; the same operation will fail the same way, so they are
/// permanent.
fn classify_rpc_error(method: &'static str, code: i64, message: &str) -> ChainError {
    let aa_failure = message.contains("AA1")
        || message.contains("AA2")
        || message.contains("AA3")
        || message.contains("AA4")
        || message.contains("AA5");
    if !aa_failure && is_retryable_jsonrpc_code(code) {
        ChainError::Transient {
            method,
            message: format!("code {code}: {message}"),
        }
    } else {
        ChainError::Permanent {
            method,
            message: format!("code {code}: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::LogData;
    use std::str::FromStr;

    fn transfer_log(to: Address, value: U256) -> Log {
        let data = value.to_be_bytes::<32>();
        let inner = alloy_primitives::Log {
            address: Address::from_str("0x036CbD53842c5426634e7929541eC2318f3dCF7e").unwrap(),
            data: LogData::new_unchecked(
                vec![
                    Transfer::SIGNATURE_HASH,
                    B256::left_padding_from(
                        Address::from_str("0x70997970C51812dc3A010C7d01b50e0d17dc79C8")
                            .unwrap()
                            .as_slice(),
                    ),
                    B256::left_padding_from(to.as_slice()),
                ],
                data.to_vec().into(),
            ),
        };
        Log {
            inner,
            block_number: Some(1200),
            transaction_hash: Some(B256::repeat_byte(0x11)),
            ..Default::default()
        }
    }

    #[test]
    fn decodes_transfer_logs() {
        let to = Address::from_str("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266").unwrap();
        let log = transfer_log(to, U256::from(500u64));
        let transfer = decode_transfer_log(&log).unwrap();
        assert_eq!(transfer.to, to.into());
        assert_eq!(transfer.value, U256::from(500u64));
        assert_eq!(transfer.block_number, 1200);
    }

    #[test]
    fn rejects_foreign_event_topics() {
        let to = Address::from_str("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266").unwrap();
        let mut log = transfer_log(to, U256::from(1u8));
        let topics = vec![B256::repeat_byte(0xab)];
        log.inner.data = LogData::new_unchecked(topics, log.inner.data.data.clone());
        assert!(decode_transfer_log(&log).is_err());
    }

    #[test]
    fn rpc_error_classification() {
        // 5xx-ish server error retries.
        assert!(classify_rpc_error("eth_call", -32000, "header not found").is_transient());
        // Rate limit retries.
        assert!(classify_rpc_error("eth_call", 429, "too many requests").is_transient());
        // Invalid params never retries.
        assert!(!classify_rpc_error("eth_call", -32602, "invalid params").is_transient());
        // Bundler AA codes never retry, whatever the numeric code says.
        assert!(
            !classify_rpc_error(
                "eth_sendUserOperation",
                -32603,
                "AA21 didn't pay prefund"
            )
            .is_transient()
        );
    }
}
