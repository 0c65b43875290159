//! Monero key pairs and the 2-of-2 joint swap address.
//!
//! A swap locks XMR to the address `(S_a + S_b, V_a + V_b)`: only a party
//! holding `s_a + s_b` can spend it, while either party holding both view
//! scalars can watch it.

use curve25519_dalek::constants::ED25519_BASEPOINT_POINT;
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use monero::{Address, Network};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroize;

use crate::types::KeyError;

/// Private spend scalar, little-endian canonical bytes.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct PrivateSpendKey([u8; 32]);

/// Private view scalar. Sampled independently of the spend key so that view
/// scalars of two parties can be summed for the joint wallet.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct PrivateViewKey([u8; 32]);

macro_rules! scalar_key {
    ($name:ident) => {
        impl $name {
            pub fn random() -> Self {
                let mut bytes = [0u8; 32];
                OsRng.fill_bytes(&mut bytes);
                Self(Scalar::from_bytes_mod_order(bytes).to_bytes())
            }

            pub fn from_bytes(bytes: [u8; 32]) -> Self {
                Self(Scalar::from_bytes_mod_order(bytes).to_bytes())
            }

            pub fn as_scalar(&self) -> Scalar {
                Scalar::from_bytes_mod_order(self.0)
            }

            pub fn to_bytes(&self) -> [u8; 32] {
                self.0
            }

            pub fn public(&self) -> PublicKey {
                PublicKey(&ED25519_BASEPOINT_POINT * &self.as_scalar())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&hex::encode(self.0))
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let raw = hex::decode(String::deserialize(deserializer)?).map_err(D::Error::custom)?;
                if raw.len() != 32 {
                    return Err(D::Error::custom(KeyError::InvalidLength(raw.len())));
                }
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&raw);
                Ok(Self::from_bytes(bytes))
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "(..)"))
            }
        }
    };
}

scalar_key!(PrivateSpendKey);
scalar_key!(PrivateViewKey);

/// Sum of two partial spend keys, the only scalar that can spend the joint
/// output.
pub fn add_spend_keys(a: &PrivateSpendKey, b: &PrivateSpendKey) -> PrivateSpendKey {
    PrivateSpendKey((a.as_scalar() + b.as_scalar()).to_bytes())
}

/// Sum of two view keys; enough to watch the joint output without being
/// able to spend it.
pub fn add_view_keys(a: &PrivateViewKey, b: &PrivateViewKey) -> PrivateViewKey {
    PrivateViewKey((a.as_scalar() + b.as_scalar()).to_bytes())
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(EdwardsPoint);

impl PublicKey {
    pub fn from_compressed(bytes: [u8; 32]) -> Result<Self, KeyError> {
        let point = CompressedEdwardsY(bytes)
            .decompress()
            .ok_or(KeyError::InvalidPoint)?;
        if point.is_small_order() {
            return Err(KeyError::SmallOrderPoint);
        }
        Ok(Self(point))
    }

    pub fn to_compressed(&self) -> [u8; 32] {
        self.0.compress().to_bytes()
    }

    pub fn point(&self) -> &EdwardsPoint {
        &self.0
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_compressed()))
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.to_compressed()))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = hex::decode(String::deserialize(deserializer)?).map_err(D::Error::custom)?;
        if raw.len() != 32 {
            return Err(D::Error::custom(KeyError::InvalidLength(raw.len())));
        }
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&raw);
        PublicKey::from_compressed(bytes).map_err(D::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyPair {
    pub spend: PublicKey,
    pub view: PublicKey,
}

impl PublicKeyPair {
    pub fn new(spend: PublicKey, view: PublicKey) -> Self {
        Self { spend, view }
    }

    /// Point-wise sum of two pairs, the public half of the joint wallet.
    pub fn sum(&self, other: &PublicKeyPair) -> PublicKeyPair {
        PublicKeyPair {
            spend: PublicKey(self.spend.0 + other.spend.0),
            view: PublicKey(self.view.0 + other.view.0),
        }
    }

    pub fn address(&self, network: Network) -> Result<Address, KeyError> {
        let spend = monero::PublicKey::from_slice(&self.spend.to_compressed())
            .map_err(|_| KeyError::InvalidPoint)?;
        let view = monero::PublicKey::from_slice(&self.view.to_compressed())
            .map_err(|_| KeyError::InvalidPoint)?;
        Ok(Address::standard(network, spend, view))
    }
}

#[derive(Clone)]
pub struct PrivateKeyPair {
    pub spend: PrivateSpendKey,
    pub view: PrivateViewKey,
}

impl PrivateKeyPair {
    pub fn generate() -> Self {
        Self {
            spend: PrivateSpendKey::random(),
            view: PrivateViewKey::random(),
        }
    }

    pub fn new(spend: PrivateSpendKey, view: PrivateViewKey) -> Self {
        Self { spend, view }
    }

    /// Full key pair of the joint wallet, for a party that has learned the
    /// counterparty's spend scalar.
    pub fn joint(
        our_spend: &PrivateSpendKey,
        cp_spend: &PrivateSpendKey,
        our_view: &PrivateViewKey,
        cp_view: &PrivateViewKey,
    ) -> Self {
        Self {
            spend: add_spend_keys(our_spend, cp_spend),
            view: PrivateViewKey((our_view.as_scalar() + cp_view.as_scalar()).to_bytes()),
        }
    }

    pub fn public_pair(&self) -> PublicKeyPair {
        PublicKeyPair {
            spend: self.spend.public(),
            view: self.view.public(),
        }
    }

    pub fn address(&self, network: Network) -> Result<Address, KeyError> {
        self.public_pair().address(network)
    }
}
