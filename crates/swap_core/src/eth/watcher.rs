//! Topic-filtered log watching.
//!
//! One `EventFilter` polls for a single topic from a start block and
//! delivers matching logs, in on-chain order, on a bounded channel. Logs a
//! reorg has removed are skipped; a log re-emitted after a reorg arrives
//! through normal ordering, so consumers must be idempotent on
//! (block, index, tx hash).

use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, Log, H256};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::eth::client::EthClient;

/// Capacity of every log delivery channel.
pub const LOG_CHANNEL_SIZE: usize = 16;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct EventFilter {
    client: Arc<dyn EthClient>,
    contract: Address,
    topic: H256,
    swap_id: Option<H256>,
    from_block: u64,
    out: mpsc::Sender<Log>,
    shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
}

impl EventFilter {
    pub fn new(
        client: Arc<dyn EthClient>,
        contract: Address,
        topic: H256,
        swap_id: Option<H256>,
        from_block: u64,
        out: mpsc::Sender<Log>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            client,
            contract,
            topic,
            swap_id,
            from_block,
            out,
            shutdown,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        debug!(topic = ?self.topic, from_block = self.from_block, "watcher started");
        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        debug!(topic = ?self.topic, "watcher stopped");
                        return;
                    }
                }
                _ = sleep(self.poll_interval) => {
                    if self.poll_once().await.is_err() {
                        // receiver gone; the swap is finished
                        return;
                    }
                }
            }
        }
    }

    /// One poll round; `Err` means the consumer hung up.
    async fn poll_once(&mut self) -> Result<(), ()> {
        let latest = match self.client.block_number().await {
            Ok(block) => block,
            Err(err) => {
                warn!(%err, "watcher failed to read block number");
                return Ok(());
            }
        };
        if latest < self.from_block {
            return Ok(());
        }

        let logs = match self
            .client
            .filter_logs(
                self.contract,
                self.topic,
                self.swap_id,
                self.from_block,
                latest,
            )
            .await
        {
            Ok(logs) => logs,
            Err(err) => {
                warn!(%err, "watcher failed to filter logs");
                return Ok(());
            }
        };

        for log in logs {
            if log.removed == Some(true) {
                debug!(tx_hash = ?log.transaction_hash, "skipping reorg-removed log");
                continue;
            }
            if self.out.send(log).await.is_err() {
                return Err(());
            }
        }

        self.from_block = latest + 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eth::client::{EthError, UnsignedTx};
    use async_trait::async_trait;
    use ethers::types::{TransactionReceipt, U64};
    use std::sync::Mutex;

    struct ScriptedClient {
        block: Mutex<u64>,
        logs: Mutex<Vec<Log>>,
    }

    #[async_trait]
    impl EthClient for ScriptedClient {
        fn local_address(&self) -> Address {
            Address::zero()
        }

        async fn block_number(&self) -> Result<u64, EthError> {
            Ok(*self.block.lock().unwrap())
        }

        async fn latest_timestamp(&self) -> Result<u64, EthError> {
            Ok(0)
        }

        async fn filter_logs(
            &self,
            _contract: Address,
            topic0: H256,
            _swap_id: Option<H256>,
            from_block: u64,
            to_block: u64,
        ) -> Result<Vec<Log>, EthError> {
            Ok(self
                .logs
                .lock()
                .unwrap()
                .iter()
                .filter(|log| {
                    let block = log.block_number.unwrap_or_default().as_u64();
                    log.topics.first() == Some(&topic0)
                        && block >= from_block
                        && block <= to_block
                })
                .cloned()
                .collect())
        }

        async fn send_transaction(&self, _tx: UnsignedTx) -> Result<TransactionReceipt, EthError> {
            unimplemented!()
        }

        async fn receipt_for(&self, _tx_hash: H256) -> Result<TransactionReceipt, EthError> {
            unimplemented!()
        }

        async fn call(&self, _to: Address, _data: Vec<u8>) -> Result<Vec<u8>, EthError> {
            unimplemented!()
        }

        async fn sign_message(&self, _message: &[u8]) -> Result<Vec<u8>, EthError> {
            unimplemented!()
        }
    }

    fn log_at(block: u64, topic: H256, removed: bool) -> Log {
        Log {
            topics: vec![topic, H256::repeat_byte(9)],
            block_number: Some(U64::from(block)),
            removed: Some(removed),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn delivers_logs_in_order_and_skips_removed() {
        let topic = H256::repeat_byte(1);
        let client = Arc::new(ScriptedClient {
            block: Mutex::new(5),
            logs: Mutex::new(vec![
                log_at(2, topic, false),
                log_at(3, topic, true),
                log_at(4, topic, false),
                log_at(4, H256::repeat_byte(2), false),
            ]),
        });

        let (tx, mut rx) = mpsc::channel(LOG_CHANNEL_SIZE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        EventFilter::new(client, Address::zero(), topic, None, 0, tx, shutdown_rx)
            .with_poll_interval(Duration::from_millis(5))
            .spawn();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.block_number, Some(U64::from(2)));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.block_number, Some(U64::from(4)));

        shutdown_tx.send(true).unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn does_not_redeliver_after_cursor_advances() {
        let topic = H256::repeat_byte(1);
        let client = Arc::new(ScriptedClient {
            block: Mutex::new(3),
            logs: Mutex::new(vec![log_at(1, topic, false)]),
        });

        let (tx, mut rx) = mpsc::channel(LOG_CHANNEL_SIZE);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        EventFilter::new(client, Address::zero(), topic, None, 0, tx, shutdown_rx)
            .with_poll_interval(Duration::from_millis(5))
            .spawn();

        assert!(rx.recv().await.is_some());
        // the cursor moved past block 3; the same log is not re-sent
        let next = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(next.is_err(), "log was redelivered");
    }

}
