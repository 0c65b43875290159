//! Wire messages.
//!
//! Framed codec shared with remote peers: one type byte followed by a JSON
//! body. The framing and field names are compatibility-critical; changing
//! them breaks interop with deployed peers. Transport (libp2p streams,
//! relayer HTTP) lives outside the core behind the `Net` trait.

use async_trait::async_trait;
use ethers::types::{Address, H256};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use xmr_wallet::{PrivateViewKey, PublicKey};

use crate::eth::contract::ContractSwap;
use crate::offers::Offer;
use crate::types::{Hash, PeerId};

#[derive(Debug, Error)]
pub enum NetError {
    #[error("codec error: {0}")]
    Codec(String),
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("no relayer available")]
    NoRelayer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub offers: Vec<Offer>,
}

/// Key disclosure, exchanged in both directions at the start of a swap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendKeysMessage {
    pub offer_id: Hash,
    pub provided_amount: Decimal,
    pub public_spend_key: PublicKey,
    pub private_view_key: PrivateViewKey,
    pub dleq_proof: dleq::Proof,
    #[serde(with = "dleq::serde_hex")]
    pub secp256k1_public_key: [u8; 33],
    pub eth_address: Address,
}

/// Taker → maker: the escrow exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyEthLocked {
    pub offer_id: Hash,
    pub address: Address,
    pub contract_swap: ContractSwap,
    pub start_block: u64,
}

/// Maker → taker: the XMR lock transaction is out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyXmrLock {
    pub offer_id: Hash,
    pub tx_id: String,
    pub address: String,
}

/// Claim submitted through a relayer when the maker has no gas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayClaimRequest {
    pub offer_id: Hash,
    pub swap: ContractSwap,
    #[serde(with = "dleq::serde_hex")]
    pub secret: [u8; 32],
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayClaimResponse {
    pub tx_hash: H256,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    QueryRequest(QueryRequest),
    QueryResponse(QueryResponse),
    SendKeys(SendKeysMessage),
    NotifyEthLocked(NotifyEthLocked),
    NotifyXmrLock(NotifyXmrLock),
    RelayClaimRequest(RelayClaimRequest),
    RelayClaimResponse(RelayClaimResponse),
}

impl Message {
    fn type_byte(&self) -> u8 {
        match self {
            Message::QueryRequest(_) => 0,
            Message::QueryResponse(_) => 1,
            Message::SendKeys(_) => 2,
            Message::NotifyEthLocked(_) => 3,
            Message::NotifyXmrLock(_) => 4,
            Message::RelayClaimRequest(_) => 5,
            Message::RelayClaimResponse(_) => 6,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, NetError> {
        let body = match self {
            Message::QueryRequest(msg) => serde_json::to_vec(msg),
            Message::QueryResponse(msg) => serde_json::to_vec(msg),
            Message::SendKeys(msg) => serde_json::to_vec(msg),
            Message::NotifyEthLocked(msg) => serde_json::to_vec(msg),
            Message::NotifyXmrLock(msg) => serde_json::to_vec(msg),
            Message::RelayClaimRequest(msg) => serde_json::to_vec(msg),
            Message::RelayClaimResponse(msg) => serde_json::to_vec(msg),
        }
        .map_err(|err| NetError::Codec(err.to_string()))?;

        let mut framed = Vec::with_capacity(1 + body.len());
        framed.push(self.type_byte());
        framed.extend_from_slice(&body);
        Ok(framed)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, NetError> {
        let (&type_byte, body) = bytes
            .split_first()
            .ok_or_else(|| NetError::Codec("empty message".into()))?;
        let decode_err = |err: serde_json::Error| NetError::Codec(err.to_string());
        match type_byte {
            0 => Ok(Message::QueryRequest(
                serde_json::from_slice(body).map_err(decode_err)?,
            )),
            1 => Ok(Message::QueryResponse(
                serde_json::from_slice(body).map_err(decode_err)?,
            )),
            2 => Ok(Message::SendKeys(
                serde_json::from_slice(body).map_err(decode_err)?,
            )),
            3 => Ok(Message::NotifyEthLocked(
                serde_json::from_slice(body).map_err(decode_err)?,
            )),
            4 => Ok(Message::NotifyXmrLock(
                serde_json::from_slice(body).map_err(decode_err)?,
            )),
            5 => Ok(Message::RelayClaimRequest(
                serde_json::from_slice(body).map_err(decode_err)?,
            )),
            6 => Ok(Message::RelayClaimResponse(
                serde_json::from_slice(body).map_err(decode_err)?,
            )),
            other => Err(NetError::Codec(format!("unknown message type {other}"))),
        }
    }
}

/// Outbound network capability handed to the protocol core.
#[async_trait]
pub trait Net: Send + Sync {
    async fn send_swap_message(
        &self,
        to: &PeerId,
        msg: Message,
        offer_id: Hash,
    ) -> Result<(), NetError>;

    async fn submit_claim_to_relayer(
        &self,
        req: RelayClaimRequest,
    ) -> Result<RelayClaimResponse, NetError>;

    /// Closes the protocol stream for a finished swap; best-effort.
    fn close_protocol_stream(&self, offer_id: Hash);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    #[test]
    fn framed_codec_round_trips() {
        let msg = Message::NotifyXmrLock(NotifyXmrLock {
            offer_id: Hash([8u8; 32]),
            tx_id: "abcd".into(),
            address: "49oc...".into(),
        });
        let bytes = msg.encode().unwrap();
        assert_eq!(bytes[0], 4);
        match Message::decode(&bytes).unwrap() {
            Message::NotifyXmrLock(decoded) => {
                assert_eq!(decoded.tx_id, "abcd");
                assert_eq!(decoded.offer_id, Hash([8u8; 32]));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn contract_swap_survives_the_wire() {
        let swap = ContractSwap {
            owner: Address::repeat_byte(1),
            claimer: Address::repeat_byte(2),
            commit_claim: [3u8; 32],
            commit_refund: [4u8; 32],
            timeout0: U256::from(100),
            timeout1: U256::from(200),
            asset: Address::zero(),
            value: U256::exp10(18),
            nonce: U256::from(42),
        };
        let msg = Message::NotifyEthLocked(NotifyEthLocked {
            offer_id: Hash([1u8; 32]),
            address: Address::repeat_byte(9),
            contract_swap: swap.clone(),
            start_block: 7,
        });
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            Message::NotifyEthLocked(body) => {
                assert_eq!(body.contract_swap, swap);
                assert_eq!(body.contract_swap.swap_id(), swap.swap_id());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_byte_is_rejected() {
        assert!(matches!(
            Message::decode(&[99, b'{', b'}']),
            Err(NetError::Codec(_))
        ));
        assert!(matches!(Message::decode(&[]), Err(NetError::Codec(_))));
    }
}
