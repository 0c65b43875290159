//! Durable swap state.
//!
//! One JSON file per record under three tables: `swaps/` (tracking info),
//! `offers/`, and `recovery/<offer-id>/` holding the key material and
//! contract-side info needed to finish a swap after a restart. Writes are
//! atomic per record (write to a temp file, then rename); invariants that
//! span records are encoded in write order by the callers.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use xmr_wallet::{PrivateKeyPair, PrivateSpendKey, PrivateViewKey};

use crate::eth::contract::ContractSwapInfo;
use crate::offers::Offer;
use crate::session::CounterpartyKeys;
use crate::swap::SwapInfo;
use crate::types::Hash;

const SWAPS_DIR: &str = "swaps";
const OFFERS_DIR: &str = "offers";
const RECOVERY_DIR: &str = "recovery";

#[derive(Debug, Error)]
pub enum DbError {
    #[error("record not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Our session keys as persisted before any XMR moves.
#[derive(Serialize, Deserialize)]
struct SessionKeyRecord {
    spend: PrivateSpendKey,
    view: PrivateViewKey,
}

/// Relayer preference as persisted per swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayerInfo {
    pub use_relayer: bool,
}

pub struct Db {
    base: PathBuf,
}

impl Db {
    pub fn open<P: AsRef<Path>>(base: P) -> Result<Self, DbError> {
        let base = base.as_ref().to_path_buf();
        for table in [SWAPS_DIR, OFFERS_DIR, RECOVERY_DIR] {
            fs::create_dir_all(base.join(table))?;
        }
        Ok(Self { base })
    }

    fn write_json<T: Serialize>(&self, path: PathBuf, value: &T) -> Result<(), DbError> {
        let json = serde_json::to_string_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, path: PathBuf) -> Result<T, DbError> {
        if !path.exists() {
            return Err(DbError::NotFound(path.display().to_string()));
        }
        Ok(serde_json::from_str(&fs::read_to_string(&path)?)?)
    }

    fn swap_path(&self, id: Hash) -> PathBuf {
        self.base.join(SWAPS_DIR).join(format!("{}.json", id.hex()))
    }

    fn offer_path(&self, id: Hash) -> PathBuf {
        self.base
            .join(OFFERS_DIR)
            .join(format!("{}.json", id.hex()))
    }

    fn recovery_path(&self, id: Hash, record: &str) -> PathBuf {
        self.base
            .join(RECOVERY_DIR)
            .join(id.hex())
            .join(format!("{record}.json"))
    }

    // -- swaps table --

    pub fn put_swap(&self, info: &SwapInfo) -> Result<(), DbError> {
        self.write_json(self.swap_path(info.offer_id), info)
    }

    pub fn get_swap(&self, id: Hash) -> Result<SwapInfo, DbError> {
        self.read_json(self.swap_path(id))
    }

    pub fn delete_swap(&self, id: Hash) -> Result<(), DbError> {
        match fs::remove_file(self.swap_path(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// All persisted swaps, ongoing and past. Unreadable entries are
    /// skipped rather than failing startup.
    pub fn all_swaps(&self) -> Result<Vec<SwapInfo>, DbError> {
        let mut swaps = Vec::new();
        for entry in fs::read_dir(self.base.join(SWAPS_DIR))? {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(DbError::from)
                .and_then(|raw| serde_json::from_str(&raw).map_err(DbError::from))
            {
                Ok(info) => swaps.push(info),
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "skipping unreadable swap record")
                }
            }
        }
        Ok(swaps)
    }

    // -- offers table --

    pub fn put_offer(&self, offer: &Offer) -> Result<(), DbError> {
        self.write_json(self.offer_path(offer.id()), offer)
    }

    pub fn get_offer(&self, id: Hash) -> Result<Offer, DbError> {
        self.read_json(self.offer_path(id))
    }

    pub fn delete_offer(&self, id: Hash) -> Result<(), DbError> {
        match fs::remove_file(self.offer_path(id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    pub fn all_offers(&self) -> Result<Vec<Offer>, DbError> {
        let mut offers = Vec::new();
        for entry in fs::read_dir(self.base.join(OFFERS_DIR))? {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            offers.push(serde_json::from_str(&fs::read_to_string(&path)?)?);
        }
        Ok(offers)
    }

    // -- recovery table --

    fn put_recovery<T: Serialize>(&self, id: Hash, record: &str, value: &T) -> Result<(), DbError> {
        let path = self.recovery_path(id, record);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        self.write_json(path, value)
    }

    pub fn put_session_keys(&self, id: Hash, keys: &PrivateKeyPair) -> Result<(), DbError> {
        self.put_recovery(
            id,
            "our_spend",
            &SessionKeyRecord {
                spend: keys.spend.clone(),
                view: keys.view.clone(),
            },
        )
    }

    pub fn get_session_keys(&self, id: Hash) -> Result<PrivateKeyPair, DbError> {
        let record: SessionKeyRecord = self.read_json(self.recovery_path(id, "our_spend"))?;
        Ok(PrivateKeyPair::new(record.spend, record.view))
    }

    pub fn put_counterparty_spend_key(
        &self,
        id: Hash,
        key: &PrivateSpendKey,
    ) -> Result<(), DbError> {
        self.put_recovery(id, "cp_spend", key)
    }

    pub fn get_counterparty_spend_key(&self, id: Hash) -> Result<PrivateSpendKey, DbError> {
        self.read_json(self.recovery_path(id, "cp_spend"))
    }

    pub fn put_counterparty_keys(&self, id: Hash, keys: &CounterpartyKeys) -> Result<(), DbError> {
        self.put_recovery(id, "cp_keys", keys)
    }

    pub fn get_counterparty_keys(&self, id: Hash) -> Result<CounterpartyKeys, DbError> {
        self.read_json(self.recovery_path(id, "cp_keys"))
    }

    pub fn put_contract_swap_info(&self, id: Hash, info: &ContractSwapInfo) -> Result<(), DbError> {
        self.put_recovery(id, "contract", info)
    }

    pub fn get_contract_swap_info(&self, id: Hash) -> Result<ContractSwapInfo, DbError> {
        self.read_json(self.recovery_path(id, "contract"))
    }

    pub fn put_relayer_info(&self, id: Hash, info: &RelayerInfo) -> Result<(), DbError> {
        self.put_recovery(id, "relayer", info)
    }

    pub fn get_relayer_info(&self, id: Hash) -> Result<RelayerInfo, DbError> {
        self.read_json(self.recovery_path(id, "relayer"))
    }

    /// Removes all recovery records for a swap. Called only after a swap
    /// completes successfully; aborted and refunded swaps keep their keys.
    pub fn delete_recovery(&self, id: Hash) -> Result<(), DbError> {
        let dir = self.base.join(RECOVERY_DIR).join(id.hex());
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
