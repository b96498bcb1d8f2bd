//! Configuration module for the payment-intake service.
//!
//! All configuration is environment-driven and loaded once at start-up into
//! an immutable [`Config`]. Secrets (API keys, signer key, encryption key)
//! are redacted from `Debug` output and never written back to storage; RPC
//! endpoints persist only as templates to which the API key is appended at
//! request time (see [`crate::network::Network::rpc_url`]).

use alloy_primitives::B256;
use std::env;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use crate::network::{Network, NetworkError};
use crate::types::EvmAddress;

/// A validated EVM private key (32 bytes).
///
/// Used to sign sweep user-operations as the smart-account owner. The pool
/// *deployment* key is never held by the running service; this key only
/// authorizes withdrawals from already-deployed accounts.
#[derive(Clone, Copy)]
pub struct EvmPrivateKey(B256);

impl EvmPrivateKey {
    /// Get the raw 32 bytes of the private key.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_ref()
    }
}

impl fmt::Debug for EvmPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EvmPrivateKey(***)")
    }
}

impl FromStr for EvmPrivateKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        B256::from_str(s)
            .map(Self)
            .map_err(|e| format!("Invalid evm private key: {e}"))
    }
}

/// A string-valued secret, redacted from `Debug` output.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A validated 32-byte symmetric key, hex-encoded in the environment.
#[derive(Clone, Copy)]
pub struct EncryptionKey(pub [u8; 32]);

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(***)")
    }
}

impl FromStr for EncryptionKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped).map_err(|e| format!("invalid hex: {e}"))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| "encryption key must be 32 bytes".to_string())?;
        Ok(Self(array))
    }
}

/// Immutable service configuration, loaded from the environment at start-up.
#[derive(Debug, Clone)]
pub struct Config {
    host: IpAddr,
    port: u16,
    database_url: Secret,
    alchemy_api_key: Option<Secret>,
    alchemy_auth_token: Option<Secret>,
    use_alchemy_for_receive_addresses: bool,
    enable_polling_fallback: bool,
    polling_interval: Duration,
    polling_min_age: Duration,
    polling_cache_ttl: Duration,
    smart_account_owner_address: EvmAddress,
    smart_account_owner_key: EvmPrivateKey,
    sender_fee_recipient: EvmAddress,
    default_chain_id: u64,
    reuse_cap: u32,
    min_pool_size: u32,
    max_pool_size: u32,
    max_sweep_retries: u32,
    sweep_timeout: Duration,
    sweep_concurrency: usize,
    rpc_timeout: Duration,
    drain_timeout: Duration,
    gas_policy_id: Option<String>,
    recipient_encryption_key: EncryptionKey,
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    MissingVar(&'static str),
    #[error("invalid value for {name}: {reason}")]
    InvalidVar { name: &'static str, reason: String },
    #[error("DEFAULT_CHAIN_ID does not resolve to a configured network: {0}")]
    UnknownDefaultChain(#[from] NetworkError),
}

pub mod config_defaults {
    use std::time::Duration;

    pub const DEFAULT_PORT: u16 = 8000;
    pub const DEFAULT_HOST: &str = "0.0.0.0";
    pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(60);
    pub const DEFAULT_POLLING_MIN_AGE: Duration = Duration::from_secs(300);
    pub const DEFAULT_POLLING_CACHE_TTL: Duration = Duration::from_secs(30);
    pub const DEFAULT_CHAIN_ID: u64 = 84532;
    pub const DEFAULT_REUSE_CAP: u32 = 10;
    pub const DEFAULT_MIN_POOL_SIZE: u32 = 20;
    pub const DEFAULT_MAX_POOL_SIZE: u32 = 200;
    pub const DEFAULT_MAX_SWEEP_RETRIES: u32 = 5;
    pub const DEFAULT_SWEEP_TIMEOUT: Duration = Duration::from_secs(120);
    pub const DEFAULT_SWEEP_CONCURRENCY: usize = 8;
    pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);
    pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
}

fn env_opt(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_required(name: &'static str) -> Result<String, ConfigError> {
    env_opt(name).ok_or(ConfigError::MissingVar(name))
}

fn env_parsed<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env_opt(name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidVar {
                name,
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}

fn env_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match env_opt(name).as_deref() {
        None => Ok(default),
        Some("true") | Some("1") | Some("yes") => Ok(true),
        Some("false") | Some("0") | Some("no") => Ok(false),
        Some(other) => Err(ConfigError::InvalidVar {
            name,
            reason: format!("expected boolean, got {other:?}"),
        }),
    }
}

fn env_duration_secs(
    name: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match env_parsed::<u64>(name)? {
        Some(secs) => Ok(Duration::from_secs(secs)),
        None => Ok(default),
    }
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Validates that the default chain resolves to a supported network and
    /// that all required secrets are present and well-formed.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env_parsed::<IpAddr>("HOST")?.unwrap_or_else(|| {
            config_defaults::DEFAULT_HOST
                .parse()
                .expect("default host is a valid address")
        });
        let port = env_parsed::<u16>("PORT")?.unwrap_or(config_defaults::DEFAULT_PORT);
        let database_url = Secret::from(env_required("DATABASE_URL")?);

        let alchemy_api_key = env_opt("ALCHEMY_API_KEY").map(Secret::from);
        let alchemy_auth_token = env_opt("ALCHEMY_AUTH_TOKEN").map(Secret::from);

        let smart_account_owner_address = env_required("SMART_ACCOUNT_OWNER_ADDRESS")?
            .parse::<EvmAddress>()
            .map_err(|e| ConfigError::InvalidVar {
                name: "SMART_ACCOUNT_OWNER_ADDRESS",
                reason: e.to_string(),
            })?;
        let smart_account_owner_key = env_required("SMART_ACCOUNT_OWNER_PRIVATE_KEY")?
            .parse::<EvmPrivateKey>()
            .map_err(|reason| ConfigError::InvalidVar {
                name: "SMART_ACCOUNT_OWNER_PRIVATE_KEY",
                reason,
            })?;
        // Sender fees default to the owner wallet unless routed elsewhere.
        let sender_fee_recipient = match env_opt("SENDER_FEE_RECIPIENT") {
            Some(raw) => raw
                .parse::<EvmAddress>()
                .map_err(|e| ConfigError::InvalidVar {
                    name: "SENDER_FEE_RECIPIENT",
                    reason: e.to_string(),
                })?,
            None => smart_account_owner_address,
        };
        let recipient_encryption_key = env_required("RECIPIENT_ENCRYPTION_KEY")?
            .parse::<EncryptionKey>()
            .map_err(|reason| ConfigError::InvalidVar {
                name: "RECIPIENT_ENCRYPTION_KEY",
                reason,
            })?;

        let default_chain_id =
            env_parsed::<u64>("DEFAULT_CHAIN_ID")?.unwrap_or(config_defaults::DEFAULT_CHAIN_ID);
        // Fail fast on a chain id no configured network serves.
        let _ = Network::try_from(default_chain_id)?;

        let config = Config {
            host,
            port,
            database_url,
            alchemy_api_key,
            alchemy_auth_token,
            use_alchemy_for_receive_addresses: env_bool(
                "USE_ALCHEMY_FOR_RECEIVE_ADDRESSES",
                true,
            )?,
            enable_polling_fallback: env_bool("ENABLE_POLLING_FALLBACK", true)?,
            polling_interval: env_duration_secs(
                "POLLING_INTERVAL",
                config_defaults::DEFAULT_POLLING_INTERVAL,
            )?,
            polling_min_age: env_duration_secs(
                "POLLING_MIN_AGE",
                config_defaults::DEFAULT_POLLING_MIN_AGE,
            )?,
            polling_cache_ttl: env_duration_secs(
                "POLLING_CACHE_TTL",
                config_defaults::DEFAULT_POLLING_CACHE_TTL,
            )?,
            smart_account_owner_address,
            smart_account_owner_key,
            sender_fee_recipient,
            default_chain_id,
            reuse_cap: env_parsed::<u32>("REUSE_CAP")?
                .unwrap_or(config_defaults::DEFAULT_REUSE_CAP),
            min_pool_size: env_parsed::<u32>("MIN_POOL_SIZE")?
                .unwrap_or(config_defaults::DEFAULT_MIN_POOL_SIZE),
            max_pool_size: env_parsed::<u32>("MAX_POOL_SIZE")?
                .unwrap_or(config_defaults::DEFAULT_MAX_POOL_SIZE),
            max_sweep_retries: env_parsed::<u32>("MAX_SWEEP_RETRIES")?
                .unwrap_or(config_defaults::DEFAULT_MAX_SWEEP_RETRIES),
            sweep_timeout: env_duration_secs(
                "SWEEP_TIMEOUT",
                config_defaults::DEFAULT_SWEEP_TIMEOUT,
            )?,
            sweep_concurrency: env_parsed::<usize>("SWEEP_CONCURRENCY")?
                .unwrap_or(config_defaults::DEFAULT_SWEEP_CONCURRENCY),
            rpc_timeout: env_duration_secs("RPC_TIMEOUT", config_defaults::DEFAULT_RPC_TIMEOUT)?,
            drain_timeout: env_duration_secs(
                "DRAIN_TIMEOUT",
                config_defaults::DEFAULT_DRAIN_TIMEOUT,
            )?,
            gas_policy_id: env_opt("GAS_POLICY_ID"),
            recipient_encryption_key,
        };
        Ok(config)
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }
    pub fn port(&self) -> u16 {
        self.port
    }
    pub fn database_url(&self) -> &Secret {
        &self.database_url
    }
    pub fn alchemy_api_key(&self) -> Option<&Secret> {
        self.alchemy_api_key.as_ref()
    }
    pub fn alchemy_auth_token(&self) -> Option<&Secret> {
        self.alchemy_auth_token.as_ref()
    }
    pub fn use_alchemy_for_receive_addresses(&self) -> bool {
        self.use_alchemy_for_receive_addresses
    }
    pub fn enable_polling_fallback(&self) -> bool {
        self.enable_polling_fallback
    }
    pub fn polling_interval(&self) -> Duration {
        self.polling_interval
    }
    pub fn polling_min_age(&self) -> Duration {
        self.polling_min_age
    }
    pub fn polling_cache_ttl(&self) -> Duration {
        self.polling_cache_ttl
    }
    pub fn smart_account_owner_address(&self) -> EvmAddress {
        self.smart_account_owner_address
    }
    pub fn smart_account_owner_key(&self) -> &EvmPrivateKey {
        &self.smart_account_owner_key
    }
    pub fn sender_fee_recipient(&self) -> EvmAddress {
        self.sender_fee_recipient
    }
    pub fn default_chain_id(&self) -> u64 {
        self.default_chain_id
    }
    pub fn reuse_cap(&self) -> u32 {
        self.reuse_cap
    }
    pub fn min_pool_size(&self) -> u32 {
        self.min_pool_size
    }
    pub fn max_pool_size(&self) -> u32 {
        self.max_pool_size
    }
    pub fn max_sweep_retries(&self) -> u32 {
        self.max_sweep_retries
    }
    pub fn sweep_timeout(&self) -> Duration {
        self.sweep_timeout
    }
    pub fn sweep_concurrency(&self) -> usize {
        self.sweep_concurrency
    }
    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }
    pub fn gas_policy_id(&self) -> Option<&str> {
        self.gas_policy_id.as_deref()
    }
    pub fn recipient_encryption_key(&self) -> &EncryptionKey {
        &self.recipient_encryption_key
    }
}
