//! Ethereum side: escrow contract encoding, the client trait, and the log
//! watcher.

pub mod client;
pub mod contract;
pub mod watcher;

pub use client::{EthClient, EthError, RpcEthClient, UnsignedTx};
pub use contract::{ContractSwap, ContractSwapInfo, NewSwapLog, Stage};
pub use watcher::{EventFilter, LOG_CHANNEL_SIZE};
