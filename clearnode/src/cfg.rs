use std::{
    fmt,
    net::{Ipv4Addr, SocketAddr},
    ops::Deref,
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use alloy::primitives::{Address, U256};
use anyhow::{Result, anyhow};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address the WebSocket RPC server listens on.
    #[serde(default = "listen_address_default")]
    pub listen_address: SocketAddr,
    /// The location of the SQLite database. If not set, an in-memory database is used and nothing survives a restart.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    pub chain: ChainConfig,
    /// Assets the broker accepts. Ledger entries refer to assets by symbol.
    #[serde(default)]
    pub assets: Vec<AssetConfig>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub sync: SyncConfig,
}

impl Config {
    pub fn asset_by_symbol(&self, symbol: &str) -> Option<&AssetConfig> {
        self.assets.iter().find(|a| a.symbol == symbol)
    }

    pub fn asset_by_token(&self, token: Address) -> Option<&AssetConfig> {
        self.assets.iter().find(|a| a.token == token)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub custody_address: Address,
    /// Adjudicator referenced by channels the broker creates.
    pub adjudicator_address: Address,
    /// Challenge period of channels the broker creates, in seconds.
    #[serde(default = "challenge_period_default")]
    pub challenge_period: u64,
    /// Whether the custody accepts EIP-712 typed state signatures.
    #[serde(default = "eip712_default")]
    pub eip712: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssetConfig {
    pub symbol: String,
    pub token: Address,
    pub decimals: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    /// Session key scopes which bypass allowance checks. Keys registered under any other scope are bound to their
    /// application.
    #[serde(default = "root_scopes_default")]
    pub root_scopes: Vec<String>,
    /// The furthest in the future a session key may expire. Defaults to 30 days.
    #[serde(default = "max_session_key_lifetime_default")]
    pub max_session_key_lifetime: Duration,
    /// How long an issued auth challenge may be answered. Defaults to 5 minutes.
    #[serde(default = "challenge_lifetime_default")]
    pub challenge_lifetime: Duration,
    /// Channels created by a session key rather than a wallet are only recognised up to this block. Such channels
    /// may only be resized to zero or closed. If not set, they are recognised indefinitely.
    #[serde(default)]
    pub legacy_channel_cutoff_block: Option<u64>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig {
            root_scopes: root_scopes_default(),
            max_session_key_lifetime: max_session_key_lifetime_default(),
            challenge_lifetime: challenge_lifetime_default(),
            legacy_channel_cutoff_block: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Blocks behind the chain head an event must be before it is applied.
    #[serde(default)]
    pub confirmations: u64,
    #[serde(default = "poll_interval_default")]
    pub poll_interval: Duration,
    /// The maximum number of blocks to fetch logs for in a single request.
    #[serde(default = "batch_size_default")]
    pub batch_size: u64,
    /// Delay before the first retry after a failed sync round. Doubles on every further failure.
    #[serde(default = "retry_initial_default")]
    pub retry_initial: Duration,
    #[serde(default = "retry_max_default")]
    pub retry_max: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            confirmations: 0,
            poll_interval: poll_interval_default(),
            batch_size: batch_size_default(),
            retry_initial: retry_initial_default(),
            retry_max: retry_max_default(),
        }
    }
}

pub fn listen_address_default() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8000))
}

pub fn challenge_period_default() -> u64 {
    86_400
}

pub fn eip712_default() -> bool {
    true
}

pub fn root_scopes_default() -> Vec<String> {
    vec!["root".to_owned()]
}

pub fn max_session_key_lifetime_default() -> Duration {
    Duration::from_secs(30 * 24 * 60 * 60)
}

pub fn challenge_lifetime_default() -> Duration {
    Duration::from_secs(5 * 60)
}

pub fn poll_interval_default() -> Duration {
    Duration::from_secs(1)
}

pub fn batch_size_default() -> u64 {
    1000
}

pub fn retry_initial_default() -> Duration {
    Duration::from_millis(500)
}

pub fn retry_max_default() -> Duration {
    Duration::from_secs(30)
}

/// A quantity of an asset in its smallest unit. (De)serializes as a decimal string, since neither `serde_toml` nor
/// JavaScript clients handle `u128`s.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Amount(pub u128);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.0.checked_sub(other.0).map(Amount)
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount(self.0.saturating_sub(other.0))
    }

    pub fn to_u256(self) -> U256 {
        U256::from(self.0)
    }

    pub fn from_u256(value: U256) -> Result<Amount> {
        u128::try_from(value)
            .map(Amount)
            .map_err(|_| anyhow!("amount {value} does not fit in 128 bits"))
    }
}

impl From<u128> for Amount {
    fn from(value: u128) -> Self {
        Amount(value)
    }
}

impl Deref for Amount {
    type Target = u128;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Amount {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut digits = s.to_owned();
        // Remove underscores
        digits.retain(|c| c != '_');
        u128::from_str(&digits).map(Amount)
    }
}

impl Serialize for Amount {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.to_string().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Amount::from_str(&s).map_err(serde::de::Error::custom)
    }
}
