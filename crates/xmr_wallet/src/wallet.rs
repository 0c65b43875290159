//! Wallet RPC surface.
//!
//! The protocol only ever talks to `MoneroWallet`; `RpcWallet` is the
//! production implementation over `monero-rpc`.

use std::collections::HashMap;
use std::str::FromStr;

use anyhow::anyhow;
use async_trait::async_trait;
use monero_rpc::monero::{Address, Amount, PrivateKey};
use monero_rpc::{
    GenerateFromKeysArgs, RpcClientBuilder, SweepAllArgs, TransferOptions, TransferPriority,
    WalletClient,
};
use tracing::debug;

use crate::retry::{retry_with_timeout, RetryConfig};
use crate::types::Result;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Balance {
    pub total: u64,
    pub unlocked: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub tx_hash: String,
    pub fee: u64,
}

/// Arguments for restoring a (possibly view-only) wallet from raw keys.
#[derive(Clone)]
pub struct RestoreWalletArgs {
    pub filename: String,
    pub address: String,
    /// `None` restores a view-only wallet.
    pub spend_key: Option<[u8; 32]>,
    pub view_key: [u8; 32],
    pub restore_height: Option<u64>,
}

#[async_trait]
pub trait MoneroWallet: Send + Sync {
    async fn get_height(&self) -> Result<u64>;
    async fn refresh(&self, start_height: Option<u64>) -> Result<()>;
    async fn primary_address(&self) -> Result<String>;
    async fn balance(&self) -> Result<Balance>;
    /// Transfers `amount` piconero to `address` from the currently open
    /// wallet and waits for the transaction to be accepted.
    async fn transfer(&self, address: &str, amount: u64) -> Result<TransferReceipt>;
    async fn open_wallet(&self, filename: &str) -> Result<()>;
    async fn generate_from_keys(&self, args: RestoreWalletArgs) -> Result<()>;
    /// Sweeps the full balance of the open wallet to `destination`.
    async fn sweep_all(&self, destination: &str) -> Result<Vec<String>>;
}

pub struct RpcWallet {
    client: WalletClient,
    retry: RetryConfig,
}

impl RpcWallet {
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, RetryConfig::default()).await
    }

    pub async fn connect_with_config(url: &str, retry: RetryConfig) -> Result<Self> {
        debug!(rpc_url = url, "connecting to monero-wallet-rpc");
        let rpc_client = RpcClientBuilder::new()
            .build(url)
            .map_err(|err| anyhow!(err))?;
        Ok(Self {
            client: rpc_client.wallet(),
            retry,
        })
    }

    async fn with_retry<T, F, Fut>(&self, label: &'static str, action: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        retry_with_timeout(label, &self.retry, action).await
    }
}

#[async_trait]
impl MoneroWallet for RpcWallet {
    async fn get_height(&self) -> Result<u64> {
        self.with_retry("get_height", || async {
            let height = self.client.get_height().await.map_err(|e| anyhow!(e))?;
            Ok(height.get())
        })
        .await
    }

    async fn refresh(&self, start_height: Option<u64>) -> Result<()> {
        debug!(start_height, "refreshing wallet");
        self.with_retry("refresh", || async {
            self.client
                .refresh(start_height)
                .await
                .map_err(|e| anyhow!(e))?;
            Ok(())
        })
        .await
    }

    async fn primary_address(&self) -> Result<String> {
        self.with_retry("get_address", || async {
            let addresses = self
                .client
                .get_address(0, None)
                .await
                .map_err(|e| anyhow!(e))?;
            Ok(addresses.address.to_string())
        })
        .await
    }

    async fn balance(&self) -> Result<Balance> {
        self.with_retry("get_balance", || async {
            let balance = self
                .client
                .get_balance(0, None)
                .await
                .map_err(|e| anyhow!(e))?;
            Ok(Balance {
                total: balance.balance.as_pico(),
                unlocked: balance.unlocked_balance.as_pico(),
            })
        })
        .await
    }

    async fn transfer(&self, address: &str, amount: u64) -> Result<TransferReceipt> {
        debug!(address, amount, "transferring XMR");
        let dest = Address::from_str(address).map_err(|err| anyhow!("invalid address: {err}"))?;
        self.with_retry("transfer", || async {
            let mut destinations = HashMap::new();
            destinations.insert(dest, Amount::from_pico(amount));
            let data = self
                .client
                .transfer(
                    destinations,
                    TransferPriority::Default,
                    TransferOptions::default(),
                )
                .await
                .map_err(|e| anyhow!(e))?;
            Ok(TransferReceipt {
                tx_hash: data.tx_hash.to_string(),
                fee: data.fee.as_pico(),
            })
        })
        .await
    }

    async fn open_wallet(&self, filename: &str) -> Result<()> {
        debug!(wallet = filename, "opening wallet");
        let filename = filename.to_string();
        self.with_retry("open_wallet", || async {
            self.client
                .open_wallet(filename.clone(), None)
                .await
                .map_err(|e| anyhow!(e))?;
            Ok(())
        })
        .await
    }

    async fn generate_from_keys(&self, args: RestoreWalletArgs) -> Result<()> {
        debug!(wallet = %args.filename, "restoring wallet from keys");
        let address =
            Address::from_str(&args.address).map_err(|err| anyhow!("invalid address: {err}"))?;
        let view_key = PrivateKey::from_slice(&args.view_key)
            .map_err(|err| anyhow!("invalid view key: {err}"))?;
        let spend_key = match args.spend_key {
            Some(bytes) => Some(
                PrivateKey::from_slice(&bytes)
                    .map_err(|err| anyhow!("invalid spend key: {err}"))?,
            ),
            None => None,
        };
        self.with_retry("generate_from_keys", || async {
            self.client
                .generate_from_keys(GenerateFromKeysArgs {
                    restore_height: args.restore_height,
                    filename: args.filename.clone(),
                    address,
                    spendkey: spend_key,
                    viewkey: view_key,
                    password: String::new(),
                    autosave_current: Some(true),
                })
                .await
                .map_err(|e| anyhow!(e))?;
            Ok(())
        })
        .await
    }

    async fn sweep_all(&self, destination: &str) -> Result<Vec<String>> {
        debug!(destination, "sweeping wallet balance");
        let address =
            Address::from_str(destination).map_err(|err| anyhow!("invalid address: {err}"))?;
        self.with_retry("sweep_all", || async {
            let result = self
                .client
                .sweep_all(SweepAllArgs {
                    address,
                    account_index: 0,
                    subaddr_indices: None,
                    priority: TransferPriority::Default,
                    mixin: 15,
                    ring_size: 16,
                    unlock_time: 0,
                    get_tx_keys: Some(true),
                    below_amount: None,
                    do_not_relay: None,
                    get_tx_hex: None,
                    get_tx_metadata: None,
                })
                .await
                .map_err(|e| anyhow!(e))?;
            Ok(result
                .tx_hash_list
                .iter()
                .map(|hash| hash.to_string())
                .collect())
        })
        .await
    }
}
