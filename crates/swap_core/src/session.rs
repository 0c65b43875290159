//! Per-session key material.
//!
//! Each swap session owns a Monero key pair whose spend scalar doubles as
//! the escrow secret on secp256k1, bound together by a DLEQ proof. The
//! counterparty's keys are accepted only after that proof verifies.

use dleq::{Proof, Secret};
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use xmr_wallet::{PrivateKeyPair, PrivateSpendKey, PrivateViewKey, PublicKey, PublicKeyPair};

use crate::error::ProtocolError;
use crate::net::SendKeysMessage;

pub struct SessionKeys {
    secret: Secret,
    pub key_pair: PrivateKeyPair,
    pub dleq_proof: Proof,
}

impl SessionKeys {
    pub fn generate() -> Self {
        let secret = Secret::random();
        let key_pair = PrivateKeyPair::new(
            PrivateSpendKey::from_bytes(secret.to_bytes()),
            PrivateViewKey::random(),
        );
        let dleq_proof = Proof::new(&secret);
        Self {
            secret,
            key_pair,
            dleq_proof,
        }
    }

    /// Rebuilds the session from a persisted key pair. The proof is only
    /// needed during key exchange, so regenerating it keeps recovery simple.
    pub fn restore(key_pair: PrivateKeyPair) -> Self {
        let secret = Secret::from_bytes(key_pair.spend.to_bytes());
        let dleq_proof = Proof::new(&secret);
        Self {
            secret,
            key_pair,
            dleq_proof,
        }
    }

    pub fn public_pair(&self) -> PublicKeyPair {
        self.key_pair.public_pair()
    }

    pub fn secp_public(&self) -> [u8; 33] {
        self.dleq_proof.pub_secp256k1
    }

    /// Keccak commitment of our secp256k1 key, as stored in the escrow.
    pub fn commitment(&self) -> Result<[u8; 32], ProtocolError> {
        dleq::secp_commitment(&self.dleq_proof.pub_secp256k1)
            .map_err(|err| ProtocolError::Validation(err.to_string()))
    }

    /// The secret in the contract's byte order (big-endian scalar).
    pub fn contract_secret(&self) -> [u8; 32] {
        let mut bytes = self.secret.to_bytes();
        bytes.reverse();
        bytes
    }
}

/// Converts a secret revealed on-chain back into a Monero spend key.
pub fn contract_secret_to_spend_key(secret_be: [u8; 32]) -> PrivateSpendKey {
    let mut le = secret_be;
    le.reverse();
    PrivateSpendKey::from_bytes(le)
}

/// The counterparty's disclosed keys, verified on construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterpartyKeys {
    pub public_spend_key: PublicKey,
    pub private_view_key: PrivateViewKey,
    #[serde(with = "dleq::serde_hex")]
    pub secp256k1_public_key: [u8; 33],
    pub eth_address: Address,
}

impl CounterpartyKeys {
    /// Verifies the DLEQ proof and the consistency of the claimed keys.
    pub fn from_message(msg: &SendKeysMessage) -> Result<Self, ProtocolError> {
        let verified = msg
            .dleq_proof
            .verify()
            .map_err(|err| ProtocolError::Validation(format!("DLEQ verification: {err}")))?;

        if verified.ed25519 != msg.public_spend_key.to_compressed() {
            return Err(ProtocolError::Validation(
                "public spend key does not match DLEQ proof".into(),
            ));
        }
        if verified.secp256k1 != msg.secp256k1_public_key {
            return Err(ProtocolError::Validation(
                "secp256k1 key does not match DLEQ proof".into(),
            ));
        }

        Ok(Self {
            public_spend_key: msg.public_spend_key,
            private_view_key: msg.private_view_key.clone(),
            secp256k1_public_key: msg.secp256k1_public_key,
            eth_address: msg.eth_address,
        })
    }

    pub fn commitment(&self) -> Result<[u8; 32], ProtocolError> {
        dleq::secp_commitment(&self.secp256k1_public_key)
            .map_err(|err| ProtocolError::Validation(err.to_string()))
    }

    pub fn public_pair(&self) -> PublicKeyPair {
        PublicKeyPair::new(self.public_spend_key, self.private_view_key.public())
    }
}
