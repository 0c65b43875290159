//! Transaction submission.
//!
//! `Sender` is polymorphic over who signs: `InternalSender` signs with the
//! daemon's own key through `EthClient`, `ExternalSender` hands the encoded
//! call to a front-end over channels and waits (bounded) for the submitted
//! hash. Both surface mined-but-reverted transactions as
//! `TxReverted { reason }`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Address, TransactionReceipt, H256, U256};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info};

use crate::eth::client::{EthClient, EthError, UnsignedTx};
use crate::eth::contract::{
    approve_calldata, claim_calldata, new_swap_calldata, refund_calldata, set_ready_calldata,
    ContractSwap,
};
use crate::types::{Env, EthAsset};

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("timed out waiting for transaction to be signed")]
    SignTimeout,
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("transaction reverted: {reason}")]
    TxReverted { reason: String },
    #[error(transparent)]
    Chain(EthError),
}

fn chain_err(err: EthError) -> SenderError {
    match err {
        EthError::Reverted { reason } => SenderError::TxReverted { reason },
        other => SenderError::Chain(other),
    }
}

/// Parameters of an escrow creation.
#[derive(Debug, Clone)]
pub struct NewSwapArgs {
    pub commit_claim: [u8; 32],
    pub commit_refund: [u8; 32],
    pub claimer: Address,
    pub timeout_duration_0: U256,
    pub timeout_duration_1: U256,
    pub asset: EthAsset,
    /// Escrowed value in the asset's smallest unit.
    pub value: U256,
    pub nonce: U256,
}

#[async_trait]
pub trait Sender: Send + Sync {
    async fn new_swap(&self, args: &NewSwapArgs) -> Result<TransactionReceipt, SenderError>;
    async fn set_ready(&self, swap: &ContractSwap) -> Result<TransactionReceipt, SenderError>;
    async fn claim(
        &self,
        swap: &ContractSwap,
        secret: [u8; 32],
    ) -> Result<TransactionReceipt, SenderError>;
    async fn refund(
        &self,
        swap: &ContractSwap,
        secret: [u8; 32],
    ) -> Result<TransactionReceipt, SenderError>;
    async fn approve(
        &self,
        token: Address,
        spender: Address,
        amount: U256,
    ) -> Result<TransactionReceipt, SenderError>;
}

/// Signs and submits with the daemon's own key.
pub struct InternalSender {
    client: Arc<dyn EthClient>,
    contract: Address,
}

impl InternalSender {
    pub fn new(client: Arc<dyn EthClient>, contract: Address) -> Self {
        Self { client, contract }
    }

    async fn submit(&self, to: Address, data: Vec<u8>, value: U256) -> Result<TransactionReceipt, SenderError> {
        self.client
            .send_transaction(UnsignedTx { to, data, value })
            .await
            .map_err(chain_err)
    }
}

#[async_trait]
impl Sender for InternalSender {
    async fn new_swap(&self, args: &NewSwapArgs) -> Result<TransactionReceipt, SenderError> {
        let native_value = match &args.asset {
            EthAsset::Eth => args.value,
            EthAsset::Token(token) => {
                // the escrow pulls tokens via transferFrom
                self.approve(token.address, self.contract, args.value).await?;
                U256::zero()
            }
        };

        let data = new_swap_calldata(
            args.commit_claim,
            args.commit_refund,
            args.claimer,
            args.timeout_duration_0,
            args.timeout_duration_1,
            args.asset.address(),
            args.value,
            args.nonce,
        );
        info!(value = %args.value, asset = ?args.asset.address(), "submitting new_swap");
        self.submit(self.contract, data, native_value).await
    }

    async fn set_ready(&self, swap: &ContractSwap) -> Result<TransactionReceipt, SenderError> {
        self.submit(self.contract, set_ready_calldata(swap), U256::zero())
            .await
    }

    async fn claim(
        &self,
        swap: &ContractSwap,
        secret: [u8; 32],
    ) -> Result<TransactionReceipt, SenderError> {
        self.submit(self.contract, claim_calldata(swap, secret), U256::zero())
            .await
    }

    async fn refund(
        &self,
        swap: &ContractSwap,
        secret: [u8; 32],
    ) -> Result<TransactionReceipt, SenderError> {
        self.submit(self.contract, refund_calldata(swap, secret), U256::zero())
            .await
    }

    async fn approve(
        &self,
        token: Address,
        spender: Address,
        amount: U256,
    ) -> Result<TransactionReceipt, SenderError> {
        self.submit(token, approve_calldata(spender, amount), U256::zero())
            .await
    }
}

/// Channels the front-end consumes: encoded calls out, submitted hashes in.
pub struct SignerChannels {
    pub requests: mpsc::Receiver<UnsignedTx>,
    pub hashes: mpsc::Sender<H256>,
}

/// Hands each transaction to an external signer (a user front-end) and
/// waits for the submitted hash, bounded by the environment's sign timeout.
pub struct ExternalSender {
    client: Arc<dyn EthClient>,
    contract: Address,
    sign_timeout: Duration,
    outgoing: mpsc::Sender<UnsignedTx>,
    incoming: Mutex<mpsc::Receiver<H256>>,
}

impl ExternalSender {
    pub fn new(env: Env, client: Arc<dyn EthClient>, contract: Address) -> (Self, SignerChannels) {
        let (out_tx, out_rx) = mpsc::channel(1);
        let (in_tx, in_rx) = mpsc::channel(1);
        (
            Self {
                client,
                contract,
                sign_timeout: env.sign_timeout(),
                outgoing: out_tx,
                incoming: Mutex::new(in_rx),
            },
            SignerChannels {
                requests: out_rx,
                hashes: in_tx,
            },
        )
    }

    pub fn with_sign_timeout(mut self, timeout: Duration) -> Self {
        self.sign_timeout = timeout;
        self
    }

    async fn send_and_confirm(&self, tx: UnsignedTx) -> Result<TransactionReceipt, SenderError> {
        // one signing round-trip at a time
        let mut incoming = self.incoming.lock().await;

        debug!(to = %tx.to, "forwarding transaction to external signer");
        self.outgoing
            .send(tx)
            .await
            .map_err(|_| SenderError::Chain(EthError::Rpc("external signer went away".into())))?;

        let tx_hash = match timeout(self.sign_timeout, incoming.recv()).await {
            Err(_) => return Err(SenderError::SignTimeout),
            Ok(None) => {
                return Err(SenderError::Chain(EthError::Rpc(
                    "external signer went away".into(),
                )))
            }
            Ok(Some(hash)) => hash,
        };

        self.client.receipt_for(tx_hash).await.map_err(chain_err)
    }
}

#[async_trait]
impl Sender for ExternalSender {
    async fn new_swap(&self, args: &NewSwapArgs) -> Result<TransactionReceipt, SenderError> {
        if args.asset.is_token() {
            return Err(SenderError::Unsupported(
                "external sender does not support ERC-20 token swaps",
            ));
        }
        let data = new_swap_calldata(
            args.commit_claim,
            args.commit_refund,
            args.claimer,
            args.timeout_duration_0,
            args.timeout_duration_1,
            args.asset.address(),
            args.value,
            args.nonce,
        );
        self.send_and_confirm(UnsignedTx {
            to: self.contract,
            data,
            value: args.value,
        })
        .await
    }

    async fn set_ready(&self, swap: &ContractSwap) -> Result<TransactionReceipt, SenderError> {
        self.send_and_confirm(UnsignedTx {
            to: self.contract,
            data: set_ready_calldata(swap),
            value: U256::zero(),
        })
        .await
    }

    async fn claim(
        &self,
        swap: &ContractSwap,
        secret: [u8; 32],
    ) -> Result<TransactionReceipt, SenderError> {
        self.send_and_confirm(UnsignedTx {
            to: self.contract,
            data: claim_calldata(swap, secret),
            value: U256::zero(),
        })
        .await
    }

    async fn refund(
        &self,
        swap: &ContractSwap,
        secret: [u8; 32],
    ) -> Result<TransactionReceipt, SenderError> {
        self.send_and_confirm(UnsignedTx {
            to: self.contract,
            data: refund_calldata(swap, secret),
            value: U256::zero(),
        })
        .await
    }

    async fn approve(
        &self,
        token: Address,
        spender: Address,
        amount: U256,
    ) -> Result<TransactionReceipt, SenderError> {
        self.send_and_confirm(UnsignedTx {
            to: token,
            data: approve_calldata(spender, amount),
            value: U256::zero(),
        })
        .await
    }
}
