//! ERC-4337 user-operation types (EntryPoint v0.6 wire format).
//!
//! A sweep is submitted as a single user-operation from the receive
//! address's smart account. The pool is pre-deployed, so `init_code` is
//! always empty here; gas fields and `paymaster_and_data` are spliced in
//! from the paymaster response before signing.

use alloy_primitives::{Address, B256, Bytes, U256, keccak256};
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::SolValue;
use serde::{Deserialize, Serialize};

use super::ChainError;

/// Dummy owner signature used for paymaster gas estimation: a 1-byte
/// signature-type tag followed by 65 bytes of high-entropy filler, matching
/// the length of a real EOA signature.
pub fn dummy_signature() -> Bytes {
    let mut bytes = vec![0u8; 66];
    for byte in bytes.iter_mut().skip(1) {
        *byte = 0xff;
    }
    bytes[65] = 0x1c;
    Bytes::from(bytes)
}

/// An EntryPoint v0.6 user-operation.
///
/// Numeric fields serialize as 0x-prefixed hex quantities, byte fields as
/// 0x-prefixed hex strings, matching the bundler wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl UserOperation {
    /// A bare operation carrying only sender, nonce and call data; gas
    /// fields and sponsorship arrive from the paymaster.
    pub fn unsponsored(sender: Address, nonce: U256, call_data: Bytes) -> Self {
        Self {
            sender,
            nonce,
            init_code: Bytes::new(),
            call_data,
            call_gas_limit: U256::ZERO,
            verification_gas_limit: U256::ZERO,
            pre_verification_gas: U256::ZERO,
            max_fee_per_gas: U256::ZERO,
            max_priority_fee_per_gas: U256::ZERO,
            paymaster_and_data: Bytes::new(),
            signature: dummy_signature(),
        }
    }

    /// The canonical v0.6 userOp hash:
    /// `keccak256(abi.encode(keccak256(pack(op)), entryPoint, chainId))`.
    pub fn hash(&self, entry_point: Address, chain_id: u64) -> B256 {
        let packed = (
            self.sender,
            self.nonce,
            keccak256(&self.init_code),
            keccak256(&self.call_data),
            self.call_gas_limit,
            self.verification_gas_limit,
            self.pre_verification_gas,
            self.max_fee_per_gas,
            self.max_priority_fee_per_gas,
            keccak256(&self.paymaster_and_data),
        )
            .abi_encode();
        let enveloped = (keccak256(packed), entry_point, U256::from(chain_id)).abi_encode();
        keccak256(enveloped)
    }

    /// Sign as the smart-account owner.
    ///
    /// Light Account expects a 1-byte signature-type tag (`0x00` = EOA
    /// owner) followed by an EIP-191 signature over the userOp hash.
    pub async fn sign(
        &mut self,
        signer: &PrivateKeySigner,
        entry_point: Address,
        chain_id: u64,
    ) -> Result<(), ChainError> {
        let hash = self.hash(entry_point, chain_id);
        let signature = signer
            .sign_message(hash.as_slice())
            .await
            .map_err(|e| ChainError::Permanent {
                method: "sign_user_op",
                message: e.to_string(),
            })?;
        let mut bytes = Vec::with_capacity(66);
        bytes.push(0x00);
        bytes.extend_from_slice(&signature.as_bytes());
        self.signature = Bytes::from(bytes);
        Ok(())
    }
}

/// Gas and sponsorship fields returned by the paymaster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymasterData {
    pub paymaster_and_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
}

impl PaymasterData {
    /// Splice the sponsorship fields into the operation.
    pub fn apply(&self, op: &mut UserOperation) {
        op.paymaster_and_data = self.paymaster_and_data.clone();
        op.call_gas_limit = self.call_gas_limit;
        op.verification_gas_limit = self.verification_gas_limit;
        op.pre_verification_gas = self.pre_verification_gas;
        op.max_fee_per_gas = self.max_fee_per_gas;
        op.max_priority_fee_per_gas = self.max_priority_fee_per_gas;
    }
}

/// Transaction-level fields of a mined user-operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOpInclusion {
    pub transaction_hash: B256,
    pub block_number: U256,
}

/// Subset of `eth_getUserOperationReceipt` the pipeline consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOpReceipt {
    pub user_op_hash: B256,
    pub success: bool,
    pub receipt: UserOpInclusion,
}
