//! Network definitions and known token deployments.
//!
//! This module defines the supported EVM networks, their chain IDs and
//! gateway deployments, and provides statically known stablecoin deployments
//! per network.
//!
//! RPC, bundler and paymaster endpoints are stored as *templates*: the
//! provider API key is appended at request time and never persisted (see
//! [`Network::rpc_url`]).

use alloy_primitives::{Address, address};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use url::Url;

use crate::types::EvmAddress;

/// The canonical ERC-4337 v0.6 EntryPoint, deployed at the same address on
/// all supported networks.
pub const ENTRY_POINT_V06: Address = address!("0x5FF137D4b0FDCD49DcA30c7CF57E578a026d2789");

/// Supported EVM networks.
///
/// Used to differentiate between testnet and mainnet environments for the
/// payment-intake pipeline.
#[derive(Debug, Hash, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    /// Base Sepolia testnet (chain ID 84532).
    #[serde(rename = "base-sepolia")]
    BaseSepolia,
    /// Base mainnet (chain ID 8453).
    #[serde(rename = "base")]
    Base,
    /// Polygon PoS mainnet (chain ID 137).
    #[serde(rename = "polygon")]
    Polygon,
    /// Arbitrum One (chain ID 42161).
    #[serde(rename = "arbitrum-one")]
    ArbitrumOne,
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.identifier())
    }
}

impl Network {
    /// Return the stable network identifier used in storage and logs.
    pub fn identifier(&self) -> &'static str {
        match self {
            Network::BaseSepolia => "base-sepolia",
            Network::Base => "base",
            Network::Polygon => "polygon",
            Network::ArbitrumOne => "arbitrum-one",
        }
    }

    /// Return the numeric chain ID associated with the network.
    pub fn chain_id(&self) -> u64 {
        match self {
            Network::BaseSepolia => 84532,
            Network::Base => 8453,
            Network::Polygon => 137,
            Network::ArbitrumOne => 42161,
        }
    }

    /// Return all known [`Network`] variants.
    pub fn variants() -> &'static [Network] {
        &[
            Network::BaseSepolia,
            Network::Base,
            Network::Polygon,
            Network::ArbitrumOne,
        ]
    }

    pub fn is_testnet(&self) -> bool {
        matches!(self, Network::BaseSepolia)
    }

    /// Average block time, used to pace receipt polling.
    pub fn block_time_secs(&self) -> u64 {
        match self {
            Network::BaseSepolia | Network::Base => 2,
            Network::Polygon => 2,
            Network::ArbitrumOne => 1,
        }
    }

    /// Gateway escrow contract receiving swept funds on this network.
    pub fn gateway_address(&self) -> EvmAddress {
        let address = match self {
            Network::BaseSepolia => address!("0x87b321fc77A0fDD0CA1fEe7Ab791131157B9841A"),
            Network::Base => address!("0x30F6A8457F8E42371E204a9c103f2Bd42341dD0F"),
            Network::Polygon => address!("0xfB411Cc6385Af50A562aFCb441864E9d541CDA67"),
            Network::ArbitrumOne => address!("0xE8bc3B607CfE68F47000E3d200310D49041148Fc"),
        };
        address.into()
    }

    /// RPC endpoint template; the bundler and paymaster ride the same
    /// provider endpoint on the supported networks.
    fn endpoint_template(&self) -> &'static str {
        match self {
            Network::BaseSepolia => "https://base-sepolia.g.alchemy.com/v2",
            Network::Base => "https://base-mainnet.g.alchemy.com/v2",
            Network::Polygon => "https://polygon-mainnet.g.alchemy.com/v2",
            Network::ArbitrumOne => "https://arb-mainnet.g.alchemy.com/v2",
        }
    }

    /// Resolve the RPC endpoint, appending the API key at request time.
    ///
    /// The key never appears in persisted configuration; only the template
    /// above is stored.
    pub fn rpc_url(&self, api_key: Option<&str>) -> Result<Url, NetworkError> {
        let raw = match api_key {
            Some(key) => format!("{}/{}", self.endpoint_template(), key),
            None => self.endpoint_template().to_string(),
        };
        Url::parse(&raw).map_err(|_| NetworkError::InvalidEndpoint(self.identifier()))
    }

    /// Parse the upstream provider's network tag (webhook `event.network`).
    pub fn from_provider_tag(tag: &str) -> Result<Self, NetworkError> {
        match tag {
            "BASE_SEPOLIA" => Ok(Network::BaseSepolia),
            "BASE_MAINNET" => Ok(Network::Base),
            "MATIC_MAINNET" => Ok(Network::Polygon),
            "ARB_MAINNET" => Ok(Network::ArbitrumOne),
            _ => Err(NetworkError::UnknownProviderTag(tag.to_string())),
        }
    }
}

impl TryFrom<u64> for Network {
    type Error = NetworkError;

    fn try_from(chain_id: u64) -> Result<Self, Self::Error> {
        Network::variants()
            .iter()
            .copied()
            .find(|network| network.chain_id() == chain_id)
            .ok_or(NetworkError::UnknownChainId(chain_id))
    }
}

impl FromStr for Network {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Network::variants()
            .iter()
            .copied()
            .find(|network| network.identifier() == s)
            .ok_or_else(|| NetworkError::UnknownIdentifier(s.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("unknown chain id: {0}")]
    UnknownChainId(u64),
    #[error("unknown network identifier: {0}")]
    UnknownIdentifier(String),
    #[error("unknown provider network tag: {0}")]
    UnknownProviderTag(String),
    #[error("invalid endpoint template for network {0}")]
    InvalidEndpoint(&'static str),
}

/// A statically known stablecoin deployment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenDeployment {
    pub symbol: &'static str,
    pub address: EvmAddress,
    pub network: Network,
    pub decimals: u8,
}

/// Known DAI and USDC deployments across the supported networks.
static KNOWN_TOKENS: Lazy<Vec<TokenDeployment>> = Lazy::new(|| {
    vec![
        TokenDeployment {
            symbol: "USDC",
            address: address!("0x036CbD53842c5426634e7929541eC2318f3dCF7e").into(),
            network: Network::BaseSepolia,
            decimals: 6,
        },
        TokenDeployment {
            symbol: "DAI",
            address: address!("0x7683022d84F726a96c4A6611cD31DBf5409c0Ac9").into(),
            network: Network::BaseSepolia,
            decimals: 18,
        },
        TokenDeployment {
            symbol: "USDC",
            address: address!("0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913").into(),
            network: Network::Base,
            decimals: 6,
        },
        TokenDeployment {
            symbol: "DAI",
            address: address!("0x50c5725949A6F0c72E6C4a641F24049A917DB0Cb").into(),
            network: Network::Base,
            decimals: 18,
        },
        TokenDeployment {
            symbol: "USDC",
            address: address!("0x3c499c542cEF5E3811e1192ce70d8cC03d5c3359").into(),
            network: Network::Polygon,
            decimals: 6,
        },
        TokenDeployment {
            symbol: "DAI",
            address: address!("0x8f3Cf7ad23Cd3CaDbD9735AFf958023239c6A063").into(),
            network: Network::Polygon,
            decimals: 18,
        },
        TokenDeployment {
            symbol: "USDC",
            address: address!("0xaf88d065e77c8cC2239327C5EDb3A432268e5831").into(),
            network: Network::ArbitrumOne,
            decimals: 6,
        },
        TokenDeployment {
            symbol: "DAI",
            address: address!("0xDA10009cBd5D07dd0CeCc66161FC93D7c9000da1").into(),
            network: Network::ArbitrumOne,
            decimals: 18,
        },
    ]
});

impl TokenDeployment {
    /// Return the known deployments for the given network.
    pub fn by_network<N: Borrow<Network>>(network: N) -> Vec<&'static TokenDeployment> {
        let network = *network.borrow();
        KNOWN_TOKENS
            .iter()
            .filter(|token| token.network == network)
            .collect()
    }

    /// Resolve a token contract address on a network, case-insensitively.
    pub fn by_contract<N: Borrow<Network>>(
        network: N,
        contract: &EvmAddress,
    ) -> Option<&'static TokenDeployment> {
        let network = *network.borrow();
        KNOWN_TOKENS
            .iter()
            .find(|token| token.network == network && token.address == *contract)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_ids_round_trip() {
        for network in Network::variants() {
            assert_eq!(Network::try_from(network.chain_id()).unwrap(), *network);
            assert_eq!(
                Network::from_str(network.identifier()).unwrap(),
                *network
            );
        }
        assert!(Network::try_from(999_999).is_err());
    }

    #[test]
    fn rpc_url_appends_api_key_at_request_time() {
        let bare = Network::BaseSepolia.rpc_url(None).unwrap();
        assert_eq!(bare.as_str(), "https://base-sepolia.g.alchemy.com/v2");
        let keyed = Network::BaseSepolia.rpc_url(Some("test-key")).unwrap();
        assert_eq!(
            keyed.as_str(),
            "https://base-sepolia.g.alchemy.com/v2/test-key"
        );
    }

    #[test]
    fn provider_tags_map_to_networks() {
        assert_eq!(
            Network::from_provider_tag("BASE_SEPOLIA").unwrap(),
            Network::BaseSepolia
        );
        assert_eq!(
            Network::from_provider_tag("MATIC_MAINNET").unwrap(),
            Network::Polygon
        );
        assert!(Network::from_provider_tag("UNKNOWN_NET").is_err());
    }

    #[test]
    fn token_lookup_is_case_insensitive() {
        let mixed: EvmAddress = "0x036cbd53842C5426634E7929541Ec2318F3DCF7E".parse().unwrap();
        let token = TokenDeployment::by_contract(Network::BaseSepolia, &mixed).unwrap();
        assert_eq!(token.symbol, "USDC");
        assert_eq!(token.decimals, 6);
    }

    #[test]
    fn every_network_has_known_tokens() {
        for network in Network::variants() {
            assert!(!TokenDeployment::by_network(network).is_empty());
        }
    }
}
