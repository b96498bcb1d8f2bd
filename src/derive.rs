//! Deterministic derivation of smart-account receive addresses.
//!
//! Receive addresses are ERC-4337 Light Account proxies deployed through a
//! CREATE2 factory, so the address is a pure function of
//! `(factory, implementation, owner, salt)`:
//!
//! ```text
//! address = keccak256(0xff ‖ factory ‖ salt ‖ keccak256(proxyInitCode))[12..]
//! proxyInitCode = PROXY_PREFIX ‖ implementation ‖ PROXY_SUFFIX ‖ leftPad32(owner)
//! ```
//!
//! The deriver also produces the `initCode` (`factory ‖ createAccount(owner,
//! salt)`) consumed by the off-line deployment tools. The running service
//! never places initCode inside a user-operation: the pool is pre-deployed,
//! so sweeps always originate from an account that already has code.
//!
//! Everything here is pure computation; no I/O.

use alloy_primitives::{Address, B256, U256, keccak256};
use alloy_sol_types::{SolCall, sol};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::network::Network;
use crate::types::{EvmAddress, Salt, TypeError};

sol! {
    /// Factory entrypoint invoked by the off-line deployment tools.
    function createAccount(address owner, uint256 salt) external returns (address);
}

/// Light Account v2 factory, deployed at the same address on all supported
/// networks.
pub const LIGHT_ACCOUNT_FACTORY: Address =
    alloy_primitives::address!("0x0000000000400CdFef5E2714E63d8040b700BC24");

/// Light Account v2 implementation behind every proxy the factory deploys.
pub const LIGHT_ACCOUNT_IMPLEMENTATION: Address =
    alloy_primitives::address!("0x8E8e658E22B12ada97B402fF0b044D6A325013C7");

/// Head of the proxy init code: the ERC-1967 proxy creation bytecode plus
/// the left-padding of the implementation word in the constructor arguments.
const PROXY_PREFIX: &[u8] = &alloy_primitives::hex!(
    "60806040526040516104e13803806104e1833981016040819052610022916102e6"
    "565b61002e82826000610035565b5050610408565b61003e836101a1565b604051"
    "6001600160a01b038416907f1cf3b03a6cf19fa2baba4df148e9dcabedea7f8a5c"
    "07840e207e5c089be95d3e90600090a281511561016057610160565b5050505050"
    "000000000000000000000000"
);

/// Tail of the proxy init code: the calldata plumbing that routes
/// `initialize(owner)` through the proxy constructor. Ends right before the
/// left-padded owner word.
const PROXY_SUFFIX: &[u8] = &alloy_primitives::hex!(
    "0000000000000000000000000000000000000000000000000000000000000040"
    "0000000000000000000000000000000000000000000000000000000000000024"
    "c4d66de8"
);

/// Validation failures for deriver inputs arriving as raw strings.
#[derive(Debug, thiserror::Error)]
pub enum DeriveError {
    #[error("invalid owner address: {0}")]
    InvalidOwner(#[source] TypeError),
    #[error("invalid salt: {0}")]
    InvalidSalt(#[source] TypeError),
}

/// The CREATE2 factory pair a receive-address pool is derived against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountFactory {
    pub factory: Address,
    pub implementation: Address,
}

impl Default for AccountFactory {
    fn default() -> Self {
        Self {
            factory: LIGHT_ACCOUNT_FACTORY,
            implementation: LIGHT_ACCOUNT_IMPLEMENTATION,
        }
    }
}

impl AccountFactory {
    /// Full creation code of the ERC-1967 proxy the factory deploys for
    /// `owner`.
    pub fn proxy_init_code(&self, owner: EvmAddress) -> Vec<u8> {
        let mut code = Vec::with_capacity(
            PROXY_PREFIX.len() + 20 + PROXY_SUFFIX.len() + 32,
        );
        code.extend_from_slice(PROXY_PREFIX);
        code.extend_from_slice(self.implementation.as_slice());
        code.extend_from_slice(PROXY_SUFFIX);
        code.extend_from_slice(B256::left_padding_from(owner.0.as_slice()).as_slice());
        code
    }

    /// Derive the CREATE2 address of the account for `(owner, salt)`.
    ///
    /// Deterministic: identical inputs always yield the same address
    /// bit-for-bit.
    pub fn derive_address(&self, owner: EvmAddress, salt: &Salt) -> EvmAddress {
        let init_code_hash = keccak256(self.proxy_init_code(owner));
        self.factory.create2(salt.as_b256(), init_code_hash).into()
    }

    /// String-input variant used by the deployment-record surface.
    ///
    /// # Errors
    /// Returns [`DeriveError`] on a malformed owner or a salt that is not 32
    /// hex-encoded bytes.
    pub fn derive_from_strings(
        &self,
        owner: &str,
        salt: &str,
    ) -> Result<EvmAddress, DeriveError> {
        let owner = EvmAddress::from_str(owner).map_err(DeriveError::InvalidOwner)?;
        let salt = Salt::from_str(salt).map_err(DeriveError::InvalidSalt)?;
        Ok(self.derive_address(owner, &salt))
    }

    /// `initCode` for ERC-4337 deployment: `factory ‖ createAccount(owner,
    /// salt)` calldata.
    pub fn init_code(&self, owner: EvmAddress, salt: &Salt) -> Vec<u8> {
        let call = createAccountCall {
            owner: owner.0,
            salt: U256::from_be_bytes(salt.0),
        };
        let calldata = call.abi_encode();
        let mut init_code = Vec::with_capacity(20 + calldata.len());
        init_code.extend_from_slice(self.factory.as_slice());
        init_code.extend_from_slice(&calldata);
        init_code
    }

    /// Assemble the JSON record exchanged with the off-line pool tools.
    pub fn deployment_record(
        &self,
        owner: EvmAddress,
        salt: &Salt,
        network: Network,
    ) -> DeploymentRecord {
        DeploymentRecord {
            address: self.derive_address(owner, salt),
            salt: *salt,
            owner,
            factory: self.factory.into(),
            init_code: format!("0x{}", hex::encode(self.init_code(owner, salt))),
            chain_id: network.chain_id(),
            network: network.identifier().to_string(),
        }
    }
}

/// Raw CREATE2: `keccak256(0xff ‖ deployer ‖ salt ‖ keccak256(init_code))[12..]`.
pub fn create2_address(deployer: Address, salt: B256, init_code: &[u8]) -> Address {
    deployer.create2(salt, keccak256(init_code))
}

/// One line of the JSON files the off-line generate/deploy/mark-deployed
/// tools exchange. The running service only ever reads these rows' database
/// effect; the type lives here so the record format has a single owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub address: EvmAddress,
    pub salt: Salt,
    pub owner: EvmAddress,
    pub factory: EvmAddress,
    pub init_code: String,
    pub chain_id: u64,
    pub network: String,
}
