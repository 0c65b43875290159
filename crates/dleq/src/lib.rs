//! Cross-group discrete-log equality.
//!
//! A swap secret is one scalar used on two curves: as a Monero partial spend
//! key on Ed25519 and as the preimage of an escrow commitment on secp256k1.
//! The proof convinces a counterparty that both public keys were derived
//! from the same scalar without revealing it.

use blake2::{Blake2s256, Digest};
use curve25519_dalek::constants::ED25519_BASEPOINT_POINT;
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{ProjectivePoint, PublicKey as SecpPublicKey, Scalar as SecpScalar};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

pub mod serde_hex;

const DLEQ_DOMAIN_TAG: &[u8; 8] = b"DLEQ-XSC";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DleqError {
    #[error("invalid point encoding: {field}")]
    InvalidPoint { field: &'static str },
    #[error("small-order point: {field}")]
    SmallOrderPoint { field: &'static str },
    #[error("challenge does not match transcript")]
    ChallengeMismatch,
    #[error("verification equation failed on {group}")]
    EquationMismatch { group: &'static str },
}

/// A 32-byte scalar, little-endian, canonical in the Ed25519 group and
/// therefore also canonical in the (larger) secp256k1 group.
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
pub struct Secret([u8; 32]);

impl Secret {
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(Scalar::from_bytes_mod_order(bytes).to_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(Scalar::from_bytes_mod_order(bytes).to_bytes())
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0
    }

    pub fn ed25519_scalar(&self) -> Scalar {
        Scalar::from_bytes_mod_order(self.0)
    }

    pub fn secp256k1_scalar(&self) -> SecpScalar {
        scalar_le_to_secp(&self.0)
    }

    pub fn ed25519_public(&self) -> EdwardsPoint {
        &ED25519_BASEPOINT_POINT * &self.ed25519_scalar()
    }

    pub fn secp256k1_public(&self) -> ProjectivePoint {
        ProjectivePoint::GENERATOR * self.secp256k1_scalar()
    }
}

/// Public halves of a proven secret, as parsed during verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedKeys {
    pub ed25519: [u8; 32],
    pub secp256k1: [u8; 33],
}

impl VerifiedKeys {
    /// Keccak-256 of the uncompressed secp256k1 point (x || y), the
    /// commitment format the escrow contract stores.
    pub fn commitment(&self) -> Result<[u8; 32], DleqError> {
        secp_commitment(&self.secp256k1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    #[serde(with = "serde_hex")]
    pub pub_ed25519: [u8; 32],
    #[serde(with = "serde_hex")]
    pub pub_secp256k1: [u8; 33],
    #[serde(with = "serde_hex")]
    pub commit_ed25519: [u8; 32],
    #[serde(with = "serde_hex")]
    pub commit_secp256k1: [u8; 33],
    #[serde(with = "serde_hex")]
    pub challenge: [u8; 32],
    #[serde(with = "serde_hex")]
    pub response_ed25519: [u8; 32],
    #[serde(with = "serde_hex")]
    pub response_secp256k1: [u8; 32],
}

impl Proof {
    /// Proves knowledge of `secret` underlying both public keys.
    pub fn new(secret: &Secret) -> Self {
        let pub_ed = secret.ed25519_public();
        let pub_secp = secret.secp256k1_public();

        // Nonce canonical below the Ed25519 order, so the same integer is
        // valid in both groups.
        let nonce = Secret::random();
        let commit_ed = nonce.ed25519_public();
        let commit_secp = nonce.secp256k1_public();

        let pub_ed_bytes = pub_ed.compress().to_bytes();
        let pub_secp_bytes = compress_secp(&pub_secp);
        let commit_ed_bytes = commit_ed.compress().to_bytes();
        let commit_secp_bytes = compress_secp(&commit_secp);

        let challenge = compute_challenge(
            &pub_ed_bytes,
            &pub_secp_bytes,
            &commit_ed_bytes,
            &commit_secp_bytes,
        );

        let c_ed = Scalar::from_bytes_mod_order(challenge);
        let z_ed = nonce.ed25519_scalar() + c_ed * secret.ed25519_scalar();

        let c_secp = scalar_le_to_secp(&challenge);
        let z_secp = nonce.secp256k1_scalar() + c_secp * secret.secp256k1_scalar();

        Self {
            pub_ed25519: pub_ed_bytes,
            pub_secp256k1: pub_secp_bytes,
            commit_ed25519: commit_ed_bytes,
            commit_secp256k1: commit_secp_bytes,
            challenge,
            response_ed25519: z_ed.to_bytes(),
            response_secp256k1: z_secp.to_bytes().into(),
        }
    }

    /// Verifies the proof and returns the bound public keys.
    pub fn verify(&self) -> Result<VerifiedKeys, DleqError> {
        let expected = compute_challenge(
            &self.pub_ed25519,
            &self.pub_secp256k1,
            &self.commit_ed25519,
            &self.commit_secp256k1,
        );
        if expected != self.challenge {
            return Err(DleqError::ChallengeMismatch);
        }

        let pub_ed = decompress_ed(&self.pub_ed25519, "pub_ed25519")?;
        let commit_ed = decompress_ed(&self.commit_ed25519, "commit_ed25519")?;
        let pub_secp = decompress_secp(&self.pub_secp256k1, "pub_secp256k1")?;
        let commit_secp = decompress_secp(&self.commit_secp256k1, "commit_secp256k1")?;

        let c_ed = Scalar::from_bytes_mod_order(self.challenge);
        let z_ed = Scalar::from_bytes_mod_order(self.response_ed25519);
        if &ED25519_BASEPOINT_POINT * &z_ed != commit_ed + pub_ed * c_ed {
            return Err(DleqError::EquationMismatch { group: "ed25519" });
        }

        let c_secp = scalar_le_to_secp(&self.challenge);
        let z_secp = scalar_be_to_secp(&self.response_secp256k1);
        if ProjectivePoint::GENERATOR * z_secp != commit_secp + pub_secp * c_secp {
            return Err(DleqError::EquationMismatch { group: "secp256k1" });
        }

        Ok(VerifiedKeys {
            ed25519: self.pub_ed25519,
            secp256k1: self.pub_secp256k1,
        })
    }
}

/// Keccak-256 commitment of a compressed secp256k1 key, over the
/// uncompressed (x || y) coordinates.
pub fn secp_commitment(compressed: &[u8; 33]) -> Result<[u8; 32], DleqError> {
    let key = SecpPublicKey::from_sec1_bytes(compressed).map_err(|_| DleqError::InvalidPoint {
        field: "secp256k1 public key",
    })?;
    let uncompressed = key.to_projective().to_affine().to_encoded_point(false);
    Ok(ethers::utils::keccak256(&uncompressed.as_bytes()[1..]))
}

fn compute_challenge(
    pub_ed: &[u8; 32],
    pub_secp: &[u8; 33],
    commit_ed: &[u8; 32],
    commit_secp: &[u8; 33],
) -> [u8; 32] {
    let mut hasher = Blake2s256::new();
    hasher.update(DLEQ_DOMAIN_TAG);
    hasher.update(ED25519_BASEPOINT_POINT.compress().to_bytes());
    hasher.update(
        ProjectivePoint::GENERATOR
            .to_affine()
            .to_encoded_point(true)
            .as_bytes(),
    );
    hasher.update(pub_ed);
    hasher.update(pub_secp);
    hasher.update(commit_ed);
    hasher.update(commit_secp);
    let mut out: [u8; 32] = hasher.finalize().into();
    // Truncate to 252 bits so the challenge integer is canonical in both
    // groups (the Ed25519 order is the smaller of the two).
    out[31] &= 0x0f;
    out
}

fn decompress_ed(bytes: &[u8; 32], field: &'static str) -> Result<EdwardsPoint, DleqError> {
    let point = CompressedEdwardsY(*bytes)
        .decompress()
        .ok_or(DleqError::InvalidPoint { field })?;
    if point.is_small_order() {
        return Err(DleqError::SmallOrderPoint { field });
    }
    Ok(point)
}

fn decompress_secp(bytes: &[u8; 33], field: &'static str) -> Result<ProjectivePoint, DleqError> {
    let key =
        SecpPublicKey::from_sec1_bytes(bytes).map_err(|_| DleqError::InvalidPoint { field })?;
    Ok(key.to_projective())
}

fn compress_secp(point: &ProjectivePoint) -> [u8; 33] {
    let encoded = point.to_affine().to_encoded_point(true);
    let mut out = [0u8; 33];
    out.copy_from_slice(encoded.as_bytes());
    out
}

/// Interprets 32 little-endian bytes (canonical below the Ed25519 order)
/// as a secp256k1 scalar.
fn scalar_le_to_secp(le: &[u8; 32]) -> SecpScalar {
    let mut be = *le;
    be.reverse();
    scalar_be_to_secp(&be)
}

fn scalar_be_to_secp(be: &[u8; 32]) -> SecpScalar {
    <SecpScalar as Reduce<k256::U256>>::reduce_bytes(&(*be).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proof_round_trips() {
        let secret = Secret::random();
        let proof = Proof::new(&secret);
        let keys = proof.verify().unwrap();
        assert_eq!(keys.ed25519, secret.ed25519_public().compress().to_bytes());
        assert_eq!(keys.secp256k1, compress_secp(&secret.secp256k1_public()));
    }

    #[test]
    fn proof_serde_round_trips() {
        let proof = Proof::new(&Secret::random());
        let json = serde_json::to_string(&proof).unwrap();
        let decoded: Proof = serde_json::from_str(&json).unwrap();
        assert_eq!(proof, decoded);
        decoded.verify().unwrap();
    }

    #[test]
    fn mismatched_keys_fail() {
        let mut proof = Proof::new(&Secret::random());
        let other = Secret::random();
        proof.pub_ed25519 = other.ed25519_public().compress().to_bytes();
        assert!(proof.verify().is_err());
    }

    #[test]
    fn any_bit_flip_fails() {
        let secret = Secret::random();
        let proof = Proof::new(&secret);

        let mut flipped = proof.clone();
        flipped.challenge[0] ^= 0x01;
        assert!(flipped.verify().is_err());

        let mut flipped = proof.clone();
        flipped.response_ed25519[7] ^= 0x80;
        assert!(flipped.verify().is_err());

        let mut flipped = proof.clone();
        flipped.response_secp256k1[16] ^= 0x10;
        assert!(flipped.verify().is_err());

        let mut flipped = proof;
        flipped.commit_secp256k1[5] ^= 0x02;
        assert!(flipped.verify().is_err());
    }

    #[test]
    fn commitment_matches_between_prover_and_verifier() {
        let secret = Secret::random();
        let proof = Proof::new(&secret);
        let keys = proof.verify().unwrap();
        let direct = secp_commitment(&compress_secp(&secret.secp256k1_public())).unwrap();
        assert_eq!(keys.commitment().unwrap(), direct);
    }
}
