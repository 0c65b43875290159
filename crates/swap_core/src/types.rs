use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ethers::types::{Address, H256};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Peer identifier on the swap network, opaque to the protocol core.
pub type PeerId = String;

/// 32-byte identifier: offer ids and on-chain swap ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_h256(&self) -> H256 {
        H256(self.0)
    }

    pub fn from_h256(h: H256) -> Self {
        Self(h.0)
    }

    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", self.hex())
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash({self})")
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = hex::decode(String::deserialize(deserializer)?).map_err(D::Error::custom)?;
        if raw.len() != 32 {
            return Err(D::Error::custom(format!(
                "expected 32-byte hash, got {}",
                raw.len()
            )));
        }
        let mut out = [0u8; 32];
        out.copy_from_slice(&raw);
        Ok(Self(out))
    }
}

/// Deployment environment. Selects the Monero network tag and the amount of
/// time an external signer gets before a request times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Env {
    Development,
    Stagenet,
    Mainnet,
}

impl Env {
    pub fn monero_network(&self) -> monero::Network {
        match self {
            Env::Development => monero::Network::Testnet,
            Env::Stagenet => monero::Network::Stagenet,
            Env::Mainnet => monero::Network::Mainnet,
        }
    }

    pub fn sign_timeout(&self) -> Duration {
        match self {
            Env::Development => Duration::from_secs(2 * 60),
            Env::Stagenet | Env::Mainnet => Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub address: Address,
    pub decimals: u8,
    pub symbol: String,
}

/// The EVM asset side of a swap: the native coin or an ERC-20 token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EthAsset {
    Eth,
    Token(TokenInfo),
}

impl EthAsset {
    /// Asset address as stored in the escrow; the zero address denotes the
    /// native coin.
    pub fn address(&self) -> Address {
        match self {
            EthAsset::Eth => Address::zero(),
            EthAsset::Token(token) => token.address,
        }
    }

    pub fn decimals(&self) -> u32 {
        match self {
            EthAsset::Eth => 18,
            EthAsset::Token(token) => token.decimals as u32,
        }
    }

    pub fn is_token(&self) -> bool {
        matches!(self, EthAsset::Token(_))
    }
}

/// Role of the local node in a swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Supplies XMR, receives the EVM asset.
    Maker,
    /// Supplies the EVM asset, receives XMR.
    Taker,
}

/// Swap status. Everything before the `Completed*` values is ongoing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Taker only: our keys are out, the maker's have not arrived.
    ExpectingKeys,
    KeysExchanged,
    /// Maker only: waiting for the taker's escrow lock.
    ExpectingEthLock,
    /// The EVM asset is locked in the escrow.
    EthLocked,
    /// Taker only: `new_swap` built but its receipt not yet confirmed.
    ContractDeploying,
    /// Maker only: our XMR transfer to the joint address is out.
    XmrLocked,
    /// Taker called `set_ready`; the claim window is open.
    ContractReady,
    /// A joint-output sweep is in flight.
    SweepingXmr,
    CompletedSuccess,
    CompletedRefund,
    CompletedAbort,
}

impl Status {
    pub fn is_ongoing(&self) -> bool {
        !matches!(
            self,
            Status::CompletedSuccess | Status::CompletedRefund | Status::CompletedAbort
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Status::ExpectingKeys => "ExpectingKeys",
            Status::KeysExchanged => "KeysExchanged",
            Status::ExpectingEthLock => "ExpectingETHLock",
            Status::EthLocked => "ETHLocked",
            Status::ContractDeploying => "ContractDeploying",
            Status::XmrLocked => "XMRLocked",
            Status::ContractReady => "ContractReady",
            Status::SweepingXmr => "SweepingXMR",
            Status::CompletedSuccess => "Success",
            Status::CompletedRefund => "Refunded",
            Status::CompletedAbort => "Aborted",
        };
        f.write_str(name)
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
