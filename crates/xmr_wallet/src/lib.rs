//! Monero side of the swap.
//!
//! Key material and joint-address math live under `keys`; wallet RPC access
//! is a thin trait over `monero-rpc` so the protocol can be driven against
//! a fake in tests.

pub mod keys;
pub mod retry;
pub mod sweep;
pub mod types;
pub mod wallet;

pub use keys::{
    add_spend_keys, add_view_keys, PrivateKeyPair, PrivateSpendKey, PrivateViewKey, PublicKey,
    PublicKeyPair,
};
pub use retry::{retry_with_timeout, RetryConfig};
pub use sweep::{swap_wallet_filename, sweep_joint_output, SweepRequest};
pub use types::{KeyError, Result, WalletError};
pub use wallet::{Balance, MoneroWallet, RestoreWalletArgs, RpcWallet, TransferReceipt};
