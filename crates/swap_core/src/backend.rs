//! Shared protocol backend.
//!
//! One `Backend` is shared by every swap; it only exposes the capabilities
//! handlers consume (chain clients, persistence, the manager, the offer
//! book, outbound messaging), which keeps the handler → backend → manager
//! reference chain acyclic.

use std::sync::Arc;
use std::time::Duration;

use ethers::types::Address;
use xmr_wallet::MoneroWallet;

use crate::db::Db;
use crate::error::ProtocolError;
use crate::eth::client::EthClient;
use crate::net::Net;
use crate::offers::OfferBook;
use crate::sender::Sender;
use crate::swap::Manager;
use crate::types::Env;

pub struct BackendConfig {
    pub env: Env,
    pub eth: Arc<dyn EthClient>,
    pub xmr: Arc<dyn MoneroWallet>,
    pub db: Arc<Db>,
    pub net: Arc<dyn Net>,
    pub sender: Arc<dyn Sender>,
    /// Address of the deployed swap escrow contract.
    pub swap_creator: Address,
    /// Filename of the daemon's primary Monero wallet, reopened after
    /// sweeps restore per-swap wallets.
    pub wallet_file: String,
    /// Duration of both contract timeout windows passed to `new_swap`.
    pub contract_timeout: Duration,
}

#[derive(Clone)]
pub struct Backend {
    pub env: Env,
    pub eth: Arc<dyn EthClient>,
    pub xmr: Arc<dyn MoneroWallet>,
    pub db: Arc<Db>,
    pub net: Arc<dyn Net>,
    pub sender: Arc<dyn Sender>,
    pub swap_creator: Address,
    pub wallet_file: String,
    pub contract_timeout: Duration,
    pub manager: Arc<Manager>,
    pub offers: Arc<OfferBook>,
}

impl Backend {
    pub fn new(cfg: BackendConfig) -> Result<Self, ProtocolError> {
        crate::config::validate_nonzero("contract timeout", cfg.contract_timeout.as_secs())?;
        let manager = Arc::new(
            Manager::new(cfg.db.clone()).map_err(|err| match err {
                crate::swap::SwapError::Storage(db) => ProtocolError::StorageFailed(db),
                crate::swap::SwapError::NotFound => {
                    ProtocolError::InvariantViolation("manager startup".into())
                }
            })?,
        );
        let offers = Arc::new(
            OfferBook::new(cfg.db.clone())
                .map_err(|err| ProtocolError::Validation(err.to_string()))?,
        );
        Ok(Self {
            env: cfg.env,
            eth: cfg.eth,
            xmr: cfg.xmr,
            db: cfg.db,
            net: cfg.net,
            sender: cfg.sender,
            swap_creator: cfg.swap_creator,
            wallet_file: cfg.wallet_file,
            contract_timeout: cfg.contract_timeout,
            manager,
            offers,
        })
    }

    pub fn monero_network(&self) -> monero::Network {
        self.env.monero_network()
    }
}
