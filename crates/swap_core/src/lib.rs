//! Swap protocol core.
//!
//! Drives trust-minimized atomic swaps between Monero and an EVM asset:
//! per-swap state machines for both roles, durable swap tracking, the
//! transaction-sender abstraction, EVM log watchers, and restart recovery.
//! Chain and network access go through the `EthClient`, `MoneroWallet` and
//! `Net` traits so the whole protocol can be exercised against fakes.

pub mod backend;
pub mod coins;
pub mod config;
pub mod db;
pub mod error;
pub mod eth;
pub mod event;
pub mod maker;
pub mod net;
pub mod offers;
pub mod recovery;
pub mod sender;
pub mod session;
pub mod swap;
pub mod taker;
pub mod types;

pub use backend::{Backend, BackendConfig};
pub use error::ProtocolError;
pub use types::{Env, EthAsset, Hash, Role, Status, TokenInfo};
