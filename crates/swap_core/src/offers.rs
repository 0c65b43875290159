//! Maker offers.
//!
//! An offer advertises a range of XMR the maker will sell at a fixed rate.
//! Its id is derived from the offer contents so that both peers compute the
//! same identifier without a round-trip.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coins::ExchangeRate;
use crate::db::{Db, DbError};
use crate::types::{EthAsset, Hash};

const OFFER_ID_DOMAIN: &[u8] = b"xmr-evm-swap/offer/v1";

#[derive(Debug, Error)]
pub enum OfferError {
    #[error("no offer with id {0}")]
    NotFound(Hash),
    #[error("invalid offer: {0}")]
    Invalid(String),
    #[error("storage failed: {0}")]
    Storage(#[from] DbError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub exchange_rate: ExchangeRate,
    pub eth_asset: EthAsset,
    pub use_relayer: bool,
}

impl Offer {
    pub fn new(
        min_amount: Decimal,
        max_amount: Decimal,
        exchange_rate: ExchangeRate,
        eth_asset: EthAsset,
        use_relayer: bool,
    ) -> Result<Self, OfferError> {
        if min_amount <= Decimal::ZERO || max_amount < min_amount {
            return Err(OfferError::Invalid(format!(
                "bad amount range [{min_amount}, {max_amount}]"
            )));
        }
        Ok(Self {
            min_amount,
            max_amount,
            exchange_rate,
            eth_asset,
            use_relayer,
        })
    }

    /// Deterministic id: Keccak-256 over a domain tag and length-prefixed
    /// field encodings, so both peers derive the same value.
    pub fn id(&self) -> Hash {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(OFFER_ID_DOMAIN);
        for field in [
            self.min_amount.normalize().to_string(),
            self.max_amount.normalize().to_string(),
            self.exchange_rate.as_decimal().normalize().to_string(),
        ] {
            buf.extend_from_slice(&(field.len() as u32).to_be_bytes());
            buf.extend_from_slice(field.as_bytes());
        }
        buf.extend_from_slice(self.eth_asset.address().as_bytes());
        Hash(ethers::utils::keccak256(&buf))
    }

    /// Checks a taker-proposed XMR amount against the advertised range.
    pub fn validate_amount(&self, xmr_amount: &Decimal) -> Result<(), OfferError> {
        if *xmr_amount < self.min_amount || *xmr_amount > self.max_amount {
            return Err(OfferError::Invalid(format!(
                "amount {xmr_amount} outside offer range [{}, {}]",
                self.min_amount, self.max_amount
            )));
        }
        Ok(())
    }
}

/// In-memory offer book with write-through persistence. Offers are removed
/// while a swap consumes them and re-added if the swap does not complete
/// successfully.
pub struct OfferBook {
    db: Arc<Db>,
    offers: RwLock<HashMap<Hash, Offer>>,
}

impl OfferBook {
    pub fn new(db: Arc<Db>) -> Result<Self, OfferError> {
        let offers = db
            .all_offers()?
            .into_iter()
            .map(|offer| (offer.id(), offer))
            .collect();
        Ok(Self {
            db,
            offers: RwLock::new(offers),
        })
    }

    pub fn add(&self, offer: Offer) -> Result<Hash, OfferError> {
        let id = offer.id();
        self.db.put_offer(&offer)?;
        self.offers.write().unwrap().insert(id, offer);
        Ok(id)
    }

    pub fn take(&self, id: Hash) -> Result<Offer, OfferError> {
        let mut offers = self.offers.write().unwrap();
        let offer = offers.remove(&id).ok_or(OfferError::NotFound(id))?;
        Ok(offer)
    }

    pub fn get(&self, id: Hash) -> Result<Offer, OfferError> {
        self.offers
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(OfferError::NotFound(id))
    }

    pub fn all(&self) -> Vec<Offer> {
        self.offers.read().unwrap().values().cloned().collect()
    }

    pub fn delete(&self, id: Hash) -> Result<(), OfferError> {
        self.db.delete_offer(id)?;
        self.offers.write().unwrap().remove(&id);
        Ok(())
    }
}
