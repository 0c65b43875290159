//! Ethereum JSON-RPC access behind a trait.
//!
//! The protocol is written against `EthClient`; `RpcEthClient` is the
//! provider-backed implementation with an in-process signer. Nonce and gas
//! handling are the provider middleware's concern.

use std::time::Duration;

use async_trait::async_trait;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{
    Address, BlockNumber, Filter, Log, TransactionReceipt, TransactionRequest, H256, U256,
};
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

#[derive(Debug, Error)]
pub enum EthError {
    #[error("eth client error: {0}")]
    Rpc(String),
    #[error("transaction reverted: {reason}")]
    Reverted { reason: String },
    #[error("transaction not found: {0}")]
    MissingReceipt(H256),
    #[error("malformed log: {0}")]
    InvalidLog(String),
}

/// A transaction the caller has built but not signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTx {
    pub to: Address,
    pub data: Vec<u8>,
    pub value: U256,
}

#[async_trait]
pub trait EthClient: Send + Sync {
    /// Address transactions are signed with (or expected to be signed with,
    /// for an external signer).
    fn local_address(&self) -> Address;

    async fn block_number(&self) -> Result<u64, EthError>;

    /// Timestamp of the latest block, the clock the contract deadlines are
    /// measured against.
    async fn latest_timestamp(&self) -> Result<u64, EthError>;

    /// Topic-filtered logs in on-chain order over an inclusive block range.
    async fn filter_logs(
        &self,
        contract: Address,
        topic0: H256,
        swap_id: Option<H256>,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, EthError>;

    /// Signs, submits, and waits for inclusion. A mined-but-reverted
    /// transaction surfaces as `EthError::Reverted` with the simulated
    /// reason.
    async fn send_transaction(&self, tx: UnsignedTx) -> Result<TransactionReceipt, EthError>;

    /// Waits for the receipt of an externally submitted transaction.
    async fn receipt_for(&self, tx_hash: H256) -> Result<TransactionReceipt, EthError>;

    /// Read-only call, also used to simulate reverting transactions.
    async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>, EthError>;

    /// Signs an arbitrary message with the local key (relayer requests).
    async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>, EthError>;
}

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct RpcEthClient {
    inner: SignerMiddleware<Provider<Http>, LocalWallet>,
    address: Address,
}

impl RpcEthClient {
    pub async fn connect(endpoint: &str, wallet: LocalWallet) -> Result<Self, EthError> {
        crate::config::validate_rpc_url("ethereum endpoint", endpoint)
            .map_err(|err| EthError::Rpc(err.to_string()))?;
        let provider =
            Provider::<Http>::try_from(endpoint).map_err(|err| EthError::Rpc(err.to_string()))?;
        let chain_id = provider
            .get_chainid()
            .await
            .map_err(|err| EthError::Rpc(err.to_string()))?;
        let wallet = wallet.with_chain_id(chain_id.as_u64());
        let address = wallet.address();
        Ok(Self {
            inner: SignerMiddleware::new(provider, wallet),
            address,
        })
    }

    /// Re-runs a transaction as a call to extract the revert reason.
    async fn simulate_revert_reason(&self, tx: &UnsignedTx) -> String {
        match self.call(tx.to, tx.data.clone()).await {
            Err(EthError::Reverted { reason }) => reason,
            Err(err) => err.to_string(),
            Ok(_) => "reverted on-chain but succeeded in simulation".to_string(),
        }
    }
}

fn revert_error(message: String) -> EthError {
    // Provider errors carry the revert string inline; keep only that part
    // when present.
    match message.split("execution reverted").nth(1) {
        Some(rest) => EthError::Reverted {
            reason: rest.trim_start_matches([':', ' ']).to_string(),
        },
        None if message.contains("revert") => EthError::Reverted { reason: message },
        None => EthError::Rpc(message),
    }
}

#[async_trait]
impl EthClient for RpcEthClient {
    fn local_address(&self) -> Address {
        self.address
    }

    async fn block_number(&self) -> Result<u64, EthError> {
        let number = self
            .inner
            .get_block_number()
            .await
            .map_err(|err| EthError::Rpc(err.to_string()))?;
        Ok(number.as_u64())
    }

    async fn latest_timestamp(&self) -> Result<u64, EthError> {
        let block = self
            .inner
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|err| EthError::Rpc(err.to_string()))?
            .ok_or_else(|| EthError::Rpc("no latest block".to_string()))?;
        Ok(block.timestamp.as_u64())
    }

    async fn filter_logs(
        &self,
        contract: Address,
        topic0: H256,
        swap_id: Option<H256>,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, EthError> {
        let mut filter = Filter::new()
            .address(contract)
            .topic0(topic0)
            .from_block(from_block)
            .to_block(to_block);
        if let Some(id) = swap_id {
            filter = filter.topic1(id);
        }
        self.inner
            .get_logs(&filter)
            .await
            .map_err(|err| EthError::Rpc(err.to_string()))
    }

    async fn send_transaction(&self, tx: UnsignedTx) -> Result<TransactionReceipt, EthError> {
        debug!(to = %tx.to, value = %tx.value, "submitting transaction");
        let request = TransactionRequest::new()
            .from(self.address)
            .to(tx.to)
            .data(tx.data.clone())
            .value(tx.value);

        let pending = self
            .inner
            .send_transaction(request, None)
            .await
            .map_err(|err| revert_error(err.to_string()))?;

        let receipt = pending
            .await
            .map_err(|err| EthError::Rpc(err.to_string()))?
            .ok_or_else(|| EthError::Rpc("transaction dropped from mempool".to_string()))?;

        if receipt.status == Some(0.into()) {
            let reason = self.simulate_revert_reason(&tx).await;
            return Err(EthError::Reverted { reason });
        }
        Ok(receipt)
    }

    async fn receipt_for(&self, tx_hash: H256) -> Result<TransactionReceipt, EthError> {
        loop {
            let receipt = self
                .inner
                .get_transaction_receipt(tx_hash)
                .await
                .map_err(|err| EthError::Rpc(err.to_string()))?;
            match receipt {
                Some(receipt) if receipt.status == Some(0.into()) => {
                    return Err(EthError::Reverted {
                        reason: format!("transaction {tx_hash:?} reverted"),
                    })
                }
                Some(receipt) => return Ok(receipt),
                None => sleep(RECEIPT_POLL_INTERVAL).await,
            }
        }
    }

    async fn call(&self, to: Address, data: Vec<u8>) -> Result<Vec<u8>, EthError> {
        let request = TransactionRequest::new()
            .from(self.address)
            .to(to)
            .data(data);
        let tx: TypedTransaction = request.into();
        let output = self
            .inner
            .call(&tx, None)
            .await
            .map_err(|err| revert_error(err.to_string()))?;
        Ok(output.to_vec())
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>, EthError> {
        let signature = self
            .inner
            .signer()
            .sign_message(message)
            .await
            .map_err(|err| EthError::Rpc(err.to_string()))?;
        Ok(signature.to_vec())
    }
}
