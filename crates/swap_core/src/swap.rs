//! Swap tracking.
//!
//! `Manager` is the in-memory index over ongoing and past swaps with
//! write-through persistence. Ongoing swaps are fully loaded at startup;
//! past swaps are demand-loaded so memory stays bounded.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coins::ExchangeRate;
use crate::db::{Db, DbError};
use crate::types::{unix_now, EthAsset, Hash, PeerId, Role, Status};

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("unable to find swap with given ID")]
    NotFound,
    #[error("storage failed: {0}")]
    Storage(#[from] DbError),
}

/// The durable record of one swap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapInfo {
    pub offer_id: Hash,
    pub role: Role,
    pub peer_id: PeerId,
    /// What we put in: XMR for the maker, the EVM asset for the taker.
    pub provided_amount: Decimal,
    /// What we get out, in the other unit.
    pub expected_amount: Decimal,
    pub exchange_rate: ExchangeRate,
    pub eth_asset: EthAsset,
    pub eth_start_block: u64,
    pub monero_start_height: u64,
    pub status: Status,
    pub start_time: u64,
    pub last_update: u64,
    pub end_time: Option<u64>,
    /// Absolute contract deadlines, known once the escrow exists.
    pub timeout0: Option<u64>,
    pub timeout1: Option<u64>,
}

impl SwapInfo {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        offer_id: Hash,
        role: Role,
        peer_id: PeerId,
        provided_amount: Decimal,
        expected_amount: Decimal,
        exchange_rate: ExchangeRate,
        eth_asset: EthAsset,
        eth_start_block: u64,
        monero_start_height: u64,
        status: Status,
    ) -> Self {
        let now = unix_now();
        Self {
            offer_id,
            role,
            peer_id,
            provided_amount,
            expected_amount,
            exchange_rate,
            eth_asset,
            eth_start_block,
            monero_start_height,
            status,
            start_time: now,
            last_update: now,
            end_time: None,
            timeout0: None,
            timeout1: None,
        }
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
        self.last_update = unix_now();
    }
}

struct Maps {
    ongoing: HashMap<Hash, SwapInfo>,
    past: HashMap<Hash, SwapInfo>,
}

/// Tracks current and past swaps. Past swaps are held in memory only if
/// they completed during this run or were recently retrieved.
pub struct Manager {
    db: Arc<Db>,
    maps: RwLock<Maps>,
}

impl Manager {
    /// Loads all ongoing swaps into memory; completed swaps stay on disk.
    pub fn new(db: Arc<Db>) -> Result<Self, SwapError> {
        let mut ongoing = HashMap::new();
        for info in db.all_swaps()? {
            if info.status.is_ongoing() {
                ongoing.insert(info.offer_id, info);
            }
        }
        Ok(Self {
            db,
            maps: RwLock::new(Maps {
                ongoing,
                past: HashMap::new(),
            }),
        })
    }

    pub fn add_swap(&self, info: &SwapInfo) -> Result<(), SwapError> {
        let mut maps = self.maps.write().unwrap();
        if info.status.is_ongoing() {
            maps.ongoing.insert(info.offer_id, info.clone());
        } else {
            maps.past.insert(info.offer_id, info.clone());
        }
        self.db.put_swap(info)?;
        Ok(())
    }

    /// Persists an updated record for a swap that stays ongoing.
    pub fn write_swap(&self, info: &SwapInfo) -> Result<(), SwapError> {
        let mut maps = self.maps.write().unwrap();
        if let Some(existing) = maps.ongoing.get_mut(&info.offer_id) {
            *existing = info.clone();
        }
        self.db.put_swap(info)?;
        Ok(())
    }

    /// Marks an ongoing swap as completed: stamps the end time, moves the
    /// record to the past map, and re-writes it. The write happens before
    /// the ongoing entry is observable as gone to readers of this manager.
    pub fn complete_ongoing(&self, info: &mut SwapInfo) -> Result<(), SwapError> {
        let mut maps = self.maps.write().unwrap();
        if !maps.ongoing.contains_key(&info.offer_id) {
            return Err(SwapError::NotFound);
        }

        info.end_time = Some(unix_now());
        self.db.put_swap(info)?;

        maps.past.insert(info.offer_id, info.clone());
        maps.ongoing.remove(&info.offer_id);
        Ok(())
    }

    pub fn get_ongoing(&self, id: Hash) -> Result<SwapInfo, SwapError> {
        self.maps
            .read()
            .unwrap()
            .ongoing
            .get(&id)
            .cloned()
            .ok_or(SwapError::NotFound)
    }

    pub fn get_ongoing_all(&self) -> Vec<SwapInfo> {
        self.maps.read().unwrap().ongoing.values().cloned().collect()
    }

    /// A past swap's record; loaded from persistence and cached on a miss.
    pub fn get_past(&self, id: Hash) -> Result<SwapInfo, SwapError> {
        if let Some(info) = self.maps.read().unwrap().past.get(&id) {
            return Ok(info.clone());
        }

        let info = match self.db.get_swap(id) {
            Ok(info) if !info.status.is_ongoing() => info,
            Ok(_) | Err(DbError::NotFound(_)) => return Err(SwapError::NotFound),
            Err(err) => return Err(err.into()),
        };

        self.maps.write().unwrap().past.insert(id, info.clone());
        Ok(info)
    }

    /// All past swap ids: the in-memory map plus persisted non-ongoing
    /// records.
    pub fn get_past_ids(&self) -> Result<Vec<Hash>, SwapError> {
        let mut ids: HashSet<Hash> = self.maps.read().unwrap().past.keys().copied().collect();
        for info in self.db.all_swaps()? {
            if !info.status.is_ongoing() {
                ids.insert(info.offer_id);
            }
        }
        Ok(ids.into_iter().collect())
    }

    pub fn has_ongoing(&self, id: Hash) -> bool {
        self.maps.read().unwrap().ongoing.contains_key(&id)
    }
}
