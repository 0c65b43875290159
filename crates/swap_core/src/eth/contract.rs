//! Escrow contract surface.
//!
//! Calldata and log codecs for the swap escrow. The contract identifies a
//! swap by the Keccak-256 hash of its ABI-encoded struct and tags every
//! event with that id in topic 1.

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Log, H256, U256};
use ethers::utils::keccak256;
use serde::{Deserialize, Serialize};

use crate::eth::client::EthError;
use crate::types::Hash;

/// The swap struct as stored (hashed) on-chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContractSwap {
    /// The taker's EVM address; may refund.
    pub owner: Address,
    /// The maker's EVM address; may claim.
    pub claimer: Address,
    #[serde(with = "dleq::serde_hex")]
    pub commit_claim: [u8; 32],
    #[serde(with = "dleq::serde_hex")]
    pub commit_refund: [u8; 32],
    pub timeout0: U256,
    pub timeout1: U256,
    /// Zero address for the native coin, the token contract otherwise.
    pub asset: Address,
    pub value: U256,
    pub nonce: U256,
}

impl ContractSwap {
    pub fn abi_token(&self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.owner),
            Token::Address(self.claimer),
            Token::FixedBytes(self.commit_claim.to_vec()),
            Token::FixedBytes(self.commit_refund.to_vec()),
            Token::Uint(self.timeout0),
            Token::Uint(self.timeout1),
            Token::Address(self.asset),
            Token::Uint(self.value),
            Token::Uint(self.nonce),
        ])
    }

    /// On-chain identifier of this swap.
    pub fn swap_id(&self) -> Hash {
        Hash(keccak256(abi::encode(&[self.abi_token()])))
    }
}

/// As persisted for recovery: the struct, its id, and the block the escrow
/// was (or was about to be) created at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractSwapInfo {
    pub swap_id: Hash,
    pub swap: ContractSwap,
    pub start_block: u64,
}

/// Escrow stage as returned by the `swaps(bytes32)` view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Invalid,
    Pending,
    Ready,
    Completed,
}

impl Stage {
    pub fn from_call_output(data: &[u8]) -> Result<Self, EthError> {
        let word = data
            .get(..32)
            .ok_or_else(|| EthError::InvalidLog("short swaps() output".into()))?;
        match word[31] {
            0 => Ok(Stage::Invalid),
            1 => Ok(Stage::Pending),
            2 => Ok(Stage::Ready),
            3 => Ok(Stage::Completed),
            other => Err(EthError::InvalidLog(format!("unknown stage {other}"))),
        }
    }
}

const SWAP_TUPLE: &str = "(address,address,bytes32,bytes32,uint256,uint256,address,uint256,uint256)";

fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

fn calldata(signature: &str, tokens: &[Token]) -> Vec<u8> {
    let mut data = selector(signature).to_vec();
    data.extend_from_slice(&abi::encode(tokens));
    data
}

pub fn new_swap_calldata(
    commit_claim: [u8; 32],
    commit_refund: [u8; 32],
    claimer: Address,
    timeout_duration_0: U256,
    timeout_duration_1: U256,
    asset: Address,
    value: U256,
    nonce: U256,
) -> Vec<u8> {
    calldata(
        "new_swap(bytes32,bytes32,address,uint256,uint256,address,uint256,uint256)",
        &[
            Token::FixedBytes(commit_claim.to_vec()),
            Token::FixedBytes(commit_refund.to_vec()),
            Token::Address(claimer),
            Token::Uint(timeout_duration_0),
            Token::Uint(timeout_duration_1),
            Token::Address(asset),
            Token::Uint(value),
            Token::Uint(nonce),
        ],
    )
}

pub fn set_ready_calldata(swap: &ContractSwap) -> Vec<u8> {
    calldata(&format!("set_ready({SWAP_TUPLE})"), &[swap.abi_token()])
}

pub fn claim_calldata(swap: &ContractSwap, secret: [u8; 32]) -> Vec<u8> {
    calldata(
        &format!("claim({SWAP_TUPLE},bytes32)"),
        &[swap.abi_token(), Token::FixedBytes(secret.to_vec())],
    )
}

pub fn refund_calldata(swap: &ContractSwap, secret: [u8; 32]) -> Vec<u8> {
    calldata(
        &format!("refund({SWAP_TUPLE},bytes32)"),
        &[swap.abi_token(), Token::FixedBytes(secret.to_vec())],
    )
}

pub fn swaps_calldata(swap_id: Hash) -> Vec<u8> {
    calldata(
        "swaps(bytes32)",
        &[Token::FixedBytes(swap_id.as_bytes().to_vec())],
    )
}

pub fn approve_calldata(spender: Address, amount: U256) -> Vec<u8> {
    calldata(
        "approve(address,uint256)",
        &[Token::Address(spender), Token::Uint(amount)],
    )
}

pub fn new_topic() -> H256 {
    H256(keccak256(
        "New(bytes32,bytes32,bytes32,uint256,uint256,address,uint256)",
    ))
}

pub fn ready_topic() -> H256 {
    H256(keccak256("Ready(bytes32)"))
}

pub fn claimed_topic() -> H256 {
    H256(keccak256("Claimed(bytes32,bytes32)"))
}

pub fn refunded_topic() -> H256 {
    H256(keccak256("Refunded(bytes32,bytes32)"))
}

/// Swap id carried in topic 1, if any.
pub fn log_swap_id(log: &Log) -> Option<Hash> {
    log.topics.get(1).map(|topic| Hash::from_h256(*topic))
}

/// Decoded `New` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSwapLog {
    pub swap_id: Hash,
    pub commit_claim: [u8; 32],
    pub commit_refund: [u8; 32],
    pub timeout0: U256,
    pub timeout1: U256,
    pub asset: Address,
    pub value: U256,
}

pub fn decode_new_log(log: &Log) -> Result<NewSwapLog, EthError> {
    let swap_id =
        log_swap_id(log).ok_or_else(|| EthError::InvalidLog("New log without swap id".into()))?;
    let tokens = abi::decode(
        &[
            ParamType::FixedBytes(32),
            ParamType::FixedBytes(32),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Address,
            ParamType::Uint(256),
        ],
        &log.data,
    )
    .map_err(|err| EthError::InvalidLog(format!("New log data: {err}")))?;

    let mut iter = tokens.into_iter();
    let commit_claim = fixed_bytes_32(iter.next(), "claim key")?;
    let commit_refund = fixed_bytes_32(iter.next(), "refund key")?;
    let timeout0 = uint(iter.next(), "timeout0")?;
    let timeout1 = uint(iter.next(), "timeout1")?;
    let asset = address(iter.next(), "asset")?;
    let value = uint(iter.next(), "value")?;

    Ok(NewSwapLog {
        swap_id,
        commit_claim,
        commit_refund,
        timeout0,
        timeout1,
        asset,
        value,
    })
}

/// Decodes the revealed secret from a `Claimed` or `Refunded` log.
pub fn decode_secret_log(log: &Log) -> Result<(Hash, [u8; 32]), EthError> {
    let swap_id =
        log_swap_id(log).ok_or_else(|| EthError::InvalidLog("secret log without swap id".into()))?;
    let tokens = abi::decode(&[ParamType::FixedBytes(32)], &log.data)
        .map_err(|err| EthError::InvalidLog(format!("secret log data: {err}")))?;
    let secret = fixed_bytes_32(tokens.into_iter().next(), "secret")?;
    Ok((swap_id, secret))
}

fn fixed_bytes_32(token: Option<Token>, field: &str) -> Result<[u8; 32], EthError> {
    match token {
        Some(Token::FixedBytes(bytes)) if bytes.len() == 32 => {
            let mut out = [0u8; 32];
            out.copy_from_slice(&bytes);
            Ok(out)
        }
        _ => Err(EthError::InvalidLog(format!("bad {field} field"))),
    }
}

fn uint(token: Option<Token>, field: &str) -> Result<U256, EthError> {
    match token {
        Some(Token::Uint(value)) => Ok(value),
        _ => Err(EthError::InvalidLog(format!("bad {field} field"))),
    }
}

fn address(token: Option<Token>, field: &str) -> Result<Address, EthError> {
    match token {
        Some(Token::Address(value)) => Ok(value),
        _ => Err(EthError::InvalidLog(format!("bad {field} field"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Bytes;

    fn test_swap() -> ContractSwap {
        ContractSwap {
            owner: Address::repeat_byte(1),
            claimer: Address::repeat_byte(2),
            commit_claim: [3u8; 32],
            commit_refund: [4u8; 32],
            timeout0: U256::from(100),
            timeout1: U256::from(200),
            asset: Address::zero(),
            value: U256::exp10(18),
            nonce: U256::from(7),
        }
    }

    #[test]
    fn swap_id_is_stable_and_content_addressed() {
        let swap = test_swap();
        assert_eq!(swap.swap_id(), swap.swap_id());

        let mut other = test_swap();
        other.nonce = U256::from(8);
        assert_ne!(swap.swap_id(), other.swap_id());
    }

    #[test]
    fn calldata_starts_with_selector() {
        let swap = test_swap();
        let data = claim_calldata(&swap, [9u8; 32]);
        assert_eq!(&data[..4], &selector(&format!("claim({SWAP_TUPLE},bytes32)")));
        // tuple (9 words) + secret word
        assert_eq!(data.len(), 4 + 32 * 10);
    }

    #[test]
    fn secret_log_round_trips() {
        let swap = test_swap();
        let secret = [5u8; 32];
        let log = Log {
            topics: vec![claimed_topic(), swap.swap_id().to_h256()],
            data: Bytes::from(abi::encode(&[Token::FixedBytes(secret.to_vec())])),
            ..Default::default()
        };
        let (id, decoded) = decode_secret_log(&log).unwrap();
        assert_eq!(id, swap.swap_id());
        assert_eq!(decoded, secret);
    }

    #[test]
    fn stage_decodes_from_view_output() {
        let mut word = [0u8; 32];
        word[31] = 2;
        assert_eq!(Stage::from_call_output(&word).unwrap(), Stage::Ready);
        word[31] = 9;
        assert!(Stage::from_call_output(&word).is_err());
    }
}
