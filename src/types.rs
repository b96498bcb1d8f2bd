//! Core type definitions for the payment-intake subsystem.
//!
//! The key objects are [`EvmAddress`], [`TxHash`], [`TokenAmount`], the
//! [`OrderStatus`]/[`AddressStatus`] lifecycle enums, and [`TransferEvent`],
//! the transient record produced by both detection paths (webhook and
//! polling) and consumed by the order updater.
//!
//! Addresses are case-preserving on the wire but compared case-insensitively
//! everywhere: parsing normalizes to the underlying 20 bytes, so equality on
//! parsed values never depends on EIP-55 checksumming.

use alloy_primitives::{Address, B256, U256};
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

/// Wrapper around [`alloy_primitives::Address`] providing display and
/// serialization support.
///
/// Comparison happens on the decoded 20 bytes, so two hex spellings of the
/// same address are always equal regardless of case.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EvmAddress(pub Address);

impl EvmAddress {
    /// Lowercase `0x`-prefixed hex form, as stored and matched in SQL.
    pub fn to_lowercase_hex(&self) -> String {
        format!("{:#x}", self.0)
    }
}

impl Display for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EvmAddress {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::from_str(s)
            .map(Self)
            .map_err(|_| TypeError::InvalidAddress(s.to_string()))
    }
}

impl From<Address> for EvmAddress {
    fn from(address: Address) -> Self {
        Self(address)
    }
}

impl From<EvmAddress> for Address {
    fn from(address: EvmAddress) -> Self {
        address.0
    }
}

/// A 32-byte EVM transaction hash, encoded as a 0x-prefixed hex string.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TxHash(pub B256);

static TX_HASH_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("invalid tx hash regex"));

impl FromStr for TxHash {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !TX_HASH_REGEX.is_match(s) {
            return Err(TypeError::InvalidTxHash(s.to_string()));
        }
        B256::from_str(s)
            .map(Self)
            .map_err(|_| TypeError::InvalidTxHash(s.to_string()))
    }
}

impl Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Serialize for TxHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TxHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        TxHash::from_str(&s).map_err(DeError::custom)
    }
}

/// A 32-byte CREATE2 salt.
///
/// Salts are generated off-line by the pool deployment tools and persisted
/// encrypted; in memory they are plain 32-byte values.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Salt(pub [u8; 32]);

impl Salt {
    pub fn as_b256(&self) -> B256 {
        B256::from(self.0)
    }
}

impl FromStr for Salt {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped).map_err(|_| TypeError::InvalidSalt(s.to_string()))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| TypeError::InvalidSalt(s.to_string()))?;
        Ok(Self(array))
    }
}

impl Display for Salt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Serialize for Salt {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Salt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Salt::from_str(&s).map_err(DeError::custom)
    }
}

/// A raw ERC-20 amount paired with the token's decimals.
///
/// `raw` is the on-chain integer value; [`TokenAmount::scaled`] converts to a
/// decimal token amount for bookkeeping, and [`TokenAmount::from_scaled`]
/// goes the other way when building on-chain calls.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TokenAmount {
    pub raw: U256,
    pub decimals: u8,
}

impl TokenAmount {
    pub fn new(raw: U256, decimals: u8) -> Self {
        Self { raw, decimals }
    }

    /// Scale the raw units down by the token's decimals.
    ///
    /// # Errors
    /// Returns [`TypeError::AmountOverflow`] if the raw value does not fit
    /// the 96-bit mantissa of [`Decimal`].
    pub fn scaled(&self) -> Result<Decimal, TypeError> {
        let raw: u128 = self
            .raw
            .try_into()
            .map_err(|_| TypeError::AmountOverflow(self.raw))?;
        let raw: i128 = raw
            .try_into()
            .map_err(|_| TypeError::AmountOverflow(self.raw))?;
        Decimal::try_from_i128_with_scale(raw, self.decimals as u32)
            .map_err(|_| TypeError::AmountOverflow(self.raw))
    }

    /// Scale a decimal token amount up to raw units, truncating any
    /// precision beyond the token's decimals.
    ///
    /// # Errors
    /// Returns [`TypeError::NegativeAmount`] for negative inputs.
    pub fn from_scaled(amount: Decimal, decimals: u8) -> Result<Self, TypeError> {
        if amount.is_sign_negative() {
            return Err(TypeError::NegativeAmount(amount));
        }
        let mut rescaled = amount;
        rescaled.rescale(decimals as u32);
        let mantissa = rescaled.mantissa().unsigned_abs();
        Ok(Self {
            raw: U256::from(mantissa),
            decimals,
        })
    }
}

impl Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}e-{}", self.raw, self.decimals)
    }
}

/// Lifecycle of a payment order.
///
/// The core path is `initiated → validated → swept → settled`; the remaining
/// statuses are terminal exits. See [`OrderStatus::is_terminal`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Initiated,
    Validated,
    Swept,
    Settled,
    Cancelled,
    Expired,
    Failed,
    Refunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Initiated => "initiated",
            OrderStatus::Validated => "validated",
            OrderStatus::Swept => "swept",
            OrderStatus::Settled => "settled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Expired => "expired",
            OrderStatus::Failed => "failed",
            OrderStatus::Refunded => "refunded",
        }
    }

    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Settled
                | OrderStatus::Cancelled
                | OrderStatus::Expired
                | OrderStatus::Failed
                | OrderStatus::Refunded
        )
    }

    /// Statuses for which inbound transfer events still matter.
    pub fn accepts_payment(&self) -> bool {
        matches!(self, OrderStatus::Initiated | OrderStatus::Validated)
    }
}

impl Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initiated" => Ok(OrderStatus::Initiated),
            "validated" => Ok(OrderStatus::Validated),
            "swept" => Ok(OrderStatus::Swept),
            "settled" => Ok(OrderStatus::Settled),
            "cancelled" => Ok(OrderStatus::Cancelled),
            "expired" => Ok(OrderStatus::Expired),
            "failed" => Ok(OrderStatus::Failed),
            "refunded" => Ok(OrderStatus::Refunded),
            _ => Err(TypeError::UnknownOrderStatus(s.to_string())),
        }
    }
}

/// Pool lifecycle of a receive address.
///
/// `unused`, `used` and `expired` are legacy statuses preserved for rows
/// created before the pool rework; new code never writes them, but the
/// allocator still accepts `unused` rows as candidates.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressStatus {
    PoolReady,
    PoolAssigned,
    PoolProcessing,
    PoolCompleted,
    Unused,
    Used,
    Expired,
}

impl AddressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressStatus::PoolReady => "pool_ready",
            AddressStatus::PoolAssigned => "pool_assigned",
            AddressStatus::PoolProcessing => "pool_processing",
            AddressStatus::PoolCompleted => "pool_completed",
            AddressStatus::Unused => "unused",
            AddressStatus::Used => "used",
            AddressStatus::Expired => "expired",
        }
    }

    /// Whether the allocator may hand this row to a new order.
    pub fn is_allocatable(&self) -> bool {
        matches!(self, AddressStatus::PoolReady | AddressStatus::Unused)
    }
}

impl Display for AddressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AddressStatus {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pool_ready" => Ok(AddressStatus::PoolReady),
            "pool_assigned" => Ok(AddressStatus::PoolAssigned),
            "pool_processing" => Ok(AddressStatus::PoolProcessing),
            "pool_completed" => Ok(AddressStatus::PoolCompleted),
            "unused" => Ok(AddressStatus::Unused),
            "used" => Ok(AddressStatus::Used),
            "expired" => Ok(AddressStatus::Expired),
            _ => Err(TypeError::UnknownAddressStatus(s.to_string())),
        }
    }
}

/// Which detection path produced a transfer event.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSource {
    Webhook,
    Polling,
}

impl Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventSource::Webhook => write!(f, "webhook"),
            EventSource::Polling => write!(f, "polling"),
        }
    }
}

/// A detected inbound token transfer, transient and never persisted.
///
/// Webhook events carry the originating transaction hash; polling events are
/// synthesized from a balance read and carry none. The dedup key reflects
/// that difference, see [`TransferEvent::dedup_key`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransferEvent {
    pub chain_id: u64,
    pub from: Option<EvmAddress>,
    pub to: EvmAddress,
    pub token_contract: Option<EvmAddress>,
    pub amount: TokenAmount,
    pub tx_hash: Option<TxHash>,
    pub block_number: Option<u64>,
    pub source: EventSource,
    pub provider_event_id: Option<String>,
}

impl TransferEvent {
    /// Idempotence key for the order updater's in-flight dedup set.
    ///
    /// Webhook events key on `(chain_id, tx_hash, to)`; polling synthetics
    /// have no transaction hash and key on `(chain_id, to, observed_amount)`
    /// instead, so a repeated balance observation collapses to one event.
    pub fn dedup_key(&self) -> String {
        match (self.source, self.tx_hash.as_ref()) {
            (EventSource::Webhook, Some(tx_hash)) => {
                format!("{}:{}:{}", self.chain_id, tx_hash, self.to.to_lowercase_hex())
            }
            _ => format!(
                "{}:polling:{}:{}",
                self.chain_id,
                self.to.to_lowercase_hex(),
                self.amount.raw
            ),
        }
    }
}

/// Validation failures for the wire-level types in this module.
#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    #[error("invalid EVM address: {0}")]
    InvalidAddress(String),
    #[error("invalid transaction hash: {0}")]
    InvalidTxHash(String),
    #[error("invalid salt, expected 32 hex-encoded bytes: {0}")]
    InvalidSalt(String),
    #[error("token amount {0} exceeds decimal range")]
    AmountOverflow(U256),
    #[error("negative token amount: {0}")]
    NegativeAmount(Decimal),
    #[error("unknown order status: {0}")]
    UnknownOrderStatus(String),
    #[error("unknown address status: {0}")]
    UnknownAddressStatus(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn address_matching_ignores_case() {
        let lower = EvmAddress::from_str("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266").unwrap();
        let upper = EvmAddress::from_str("0xF39FD6E51AAD88F6F4CE6AB8827279CFFFB92266").unwrap();
        let checksummed =
            EvmAddress::from_str("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266").unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower, checksummed);
        assert_eq!(lower.to_lowercase_hex(), upper.to_lowercase_hex());
    }

    #[test]
    fn address_rejects_malformed_input() {
        assert!(EvmAddress::from_str("0x1234").is_err());
        assert!(EvmAddress::from_str("not-an-address").is_err());
    }

    #[test]
    fn tx_hash_round_trips_lowercase() {
        let input = "0xABCDEF0000000000000000000000000000000000000000000000000000000001";
        let hash = TxHash::from_str(input).unwrap();
        assert_eq!(
            hash.to_string(),
            "0xabcdef0000000000000000000000000000000000000000000000000000000001"
        );
        assert!(TxHash::from_str("0x1234").is_err());
    }

    #[test]
    fn salt_requires_exactly_32_bytes() {
        let ok = Salt::from_str(
            "0x00000000000000000000000000000000000000000000000000000000cafebabe",
        )
        .unwrap();
        assert_eq!(ok.0[28..], [0xca, 0xfe, 0xba, 0xbe]);
        assert!(Salt::from_str("0xcafebabe").is_err());
    }

    #[test]
    fn token_amount_scales_both_ways() {
        // 0.5 DAI in 18-decimal raw units.
        let amount = TokenAmount::new(U256::from(500_000_000_000_000_000u64), 18);
        assert_eq!(amount.scaled().unwrap(), Decimal::from_str("0.5").unwrap());

        let back = TokenAmount::from_scaled(Decimal::from_str("0.5").unwrap(), 18).unwrap();
        assert_eq!(back.raw, U256::from(500_000_000_000_000_000u64));

        // 6-decimal token, e.g. USDC.
        let usdc = TokenAmount::from_scaled(Decimal::from_str("1.25").unwrap(), 6).unwrap();
        assert_eq!(usdc.raw, U256::from(1_250_000u64));
    }

    #[test]
    fn token_amount_rejects_negative() {
        assert!(TokenAmount::from_scaled(Decimal::from_str("-1").unwrap(), 6).is_err());
    }

    #[test]
    fn order_status_terminality() {
        assert!(!OrderStatus::Initiated.is_terminal());
        assert!(!OrderStatus::Validated.is_terminal());
        assert!(!OrderStatus::Swept.is_terminal());
        for status in [
            OrderStatus::Settled,
            OrderStatus::Cancelled,
            OrderStatus::Expired,
            OrderStatus::Failed,
            OrderStatus::Refunded,
        ] {
            assert!(status.is_terminal());
        }
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            OrderStatus::Initiated,
            OrderStatus::Validated,
            OrderStatus::Swept,
            OrderStatus::Settled,
            OrderStatus::Cancelled,
            OrderStatus::Expired,
            OrderStatus::Failed,
            OrderStatus::Refunded,
        ] {
            assert_eq!(OrderStatus::from_str(status.as_str()).unwrap(), status);
        }
        for status in [
            AddressStatus::PoolReady,
            AddressStatus::PoolAssigned,
            AddressStatus::PoolProcessing,
            AddressStatus::PoolCompleted,
            AddressStatus::Unused,
            AddressStatus::Used,
            AddressStatus::Expired,
        ] {
            assert_eq!(AddressStatus::from_str(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn allocatable_statuses_include_legacy_unused() {
        assert!(AddressStatus::PoolReady.is_allocatable());
        assert!(AddressStatus::Unused.is_allocatable());
        assert!(!AddressStatus::PoolAssigned.is_allocatable());
        assert!(!AddressStatus::Used.is_allocatable());
    }

    #[test]
    fn webhook_and_polling_events_have_distinct_dedup_keys() {
        let to = EvmAddress::from_str("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266").unwrap();
        let webhook = TransferEvent {
            chain_id: 84532,
            from: None,
            to,
            token_contract: None,
            amount: TokenAmount::new(U256::from(5u8), 18),
            tx_hash: Some(
                TxHash::from_str(
                    "0x1111111111111111111111111111111111111111111111111111111111111111",
                )
                .unwrap(),
            ),
            block_number: Some(1),
            source: EventSource::Webhook,
            provider_event_id: Some("whevt_1".into()),
        };
        let polling = TransferEvent {
            tx_hash: None,
            block_number: None,
            source: EventSource::Polling,
            provider_event_id: None,
            ..webhook.clone()
        };
        assert_ne!(webhook.dedup_key(), polling.dedup_key());
        // Same webhook event replayed keys identically.
        assert_eq!(webhook.dedup_key(), webhook.clone().dedup_key());
    }

    #[test]
    fn dedup_key_is_case_insensitive_on_recipient() {
        let lower = EvmAddress::from_str("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266").unwrap();
        let upper = EvmAddress::from_str("0xF39FD6E51AAD88F6F4CE6AB8827279CFFFB92266").unwrap();
        let event = |to| TransferEvent {
            chain_id: 1,
            from: None,
            to,
            token_contract: None,
            amount: TokenAmount::new(U256::from(1u8), 6),
            tx_hash: None,
            block_number: None,
            source: EventSource::Polling,
            provider_event_id: None,
        };
        assert_eq!(event(lower).dedup_key(), event(upper).dedup_key());
    }
}
