//! Recovering the joint output.
//!
//! Once a party holds both partial spend scalars it restores the joint
//! wallet from raw keys and sweeps everything to its own primary address.

use monero::Network;
use tracing::info;

use crate::keys::PrivateKeyPair;
use crate::types::Result;
use crate::wallet::{MoneroWallet, RestoreWalletArgs};

/// One sweep of a joint swap output.
pub struct SweepRequest<'a> {
    /// Full key pair of the joint wallet (summed spend and view scalars).
    pub joint_keys: &'a PrivateKeyPair,
    pub network: Network,
    /// Monero height the swap started at; scanning below it is wasted work.
    pub restore_height: Option<u64>,
    pub destination: &'a str,
    /// Wallet file to restore into; must not collide across swaps.
    pub wallet_filename: &'a str,
}

/// Deterministic per-swap wallet filename.
pub fn swap_wallet_filename(swap_id_hex: &str) -> String {
    format!("swap-{swap_id_hex}")
}

/// Restores the joint wallet and sweeps its balance to `destination`.
/// Returns the sweep transaction hashes.
pub async fn sweep_joint_output<W: MoneroWallet + ?Sized>(
    wallet: &W,
    req: SweepRequest<'_>,
) -> Result<Vec<String>> {
    let address = req.joint_keys.address(req.network)?.to_string();
    info!(%address, wallet = req.wallet_filename, "restoring joint swap wallet");

    wallet
        .generate_from_keys(RestoreWalletArgs {
            filename: req.wallet_filename.to_string(),
            address,
            spend_key: Some(req.joint_keys.spend.to_bytes()),
            view_key: req.joint_keys.view.to_bytes(),
            restore_height: req.restore_height,
        })
        .await?;
    wallet.refresh(req.restore_height).await?;

    let tx_hashes = wallet.sweep_all(req.destination).await?;
    info!(count = tx_hashes.len(), "swept joint output");
    Ok(tx_hashes)
}
