//! Taker role: supplies the EVM asset, receives XMR.
//!
//! The taker escrows first, but persists the escrow parameters before the
//! transaction goes out so that recovery can always find it. The XMR lock
//! is verified independently through the shared view key before the claim
//! window opens with `set_ready`; if the maker never claims, t1 unlocks a
//! refund.

use ethers::types::U256;
use rand::rngs::OsRng;
use rand::RngCore;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, info_span, warn, Instrument};
use xmr_wallet::{
    add_view_keys, swap_wallet_filename, sweep_joint_output, PrivateKeyPair, RestoreWalletArgs,
    SweepRequest,
};

use crate::backend::Backend;
use crate::coins::{to_base_units, xmr_to_piconero};
use crate::error::ProtocolError;
use crate::eth::contract::{
    self, decode_new_log, decode_secret_log, ContractSwap, ContractSwapInfo, Stage,
};
use crate::eth::watcher::{EventFilter, LOG_CHANNEL_SIZE};
use crate::event::{deliver, Envelope, EVENT_CHANNEL_SIZE};
use crate::net::{Message, NotifyEthLocked, SendKeysMessage};
use crate::offers::Offer;
use crate::sender::NewSwapArgs;
use crate::session::{contract_secret_to_spend_key, CounterpartyKeys, SessionKeys};
use crate::swap::SwapInfo;
use crate::types::{Hash, PeerId, Role, Status};

const MONERO_REORG_BUFFER: u64 = 10;

const TIMEOUT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Bounds the wait for the XMR lock to become spendable.
const LOCK_VERIFY_POLL_INTERVAL: Duration = Duration::from_secs(5);
const LOCK_VERIFY_MAX_ATTEMPTS: usize = 240;

#[derive(Debug)]
pub enum Event {
    /// The maker's key disclosure arrived.
    KeysReceived(SendKeysMessage),
    /// `NotifyXMRLock`: the maker says the XMR lock transaction is out.
    XmrLocked { tx_id: String, address: String },
    /// `Claimed` log observed; carries the maker's revealed secret.
    Claimed { secret: [u8; 32] },
    /// t1 passed on-chain with no claim.
    TimeoutT1,
    Exit,
}

#[derive(Clone)]
#[derive(Debug)]
pub struct Handle {
    pub offer_id: Hash,
    event_tx: mpsc::Sender<Envelope<Event>>,
    done: watch::Receiver<bool>,
}

impl Handle {
    pub async fn deliver(&self, event: Event) -> Result<(), ProtocolError> {
        deliver(&self.event_tx, event).await
    }

    pub async fn exit(&self) -> Result<(), ProtocolError> {
        self.deliver(Event::Exit).await
    }

    pub async fn wait_done(&self) {
        let mut done = self.done.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }
}

struct TakerSwap {
    backend: Backend,
    info: SwapInfo,
    session: SessionKeys,
    cp_keys: Option<CounterpartyKeys>,
    contract_swap: Option<ContractSwap>,
    swap_id: Option<Hash>,
    event_tx: mpsc::Sender<Envelope<Event>>,
    shutdown: watch::Sender<bool>,
    watchers_started: bool,
}

/// Entry point: take `offer` by providing `eth_amount` of the offer's
/// asset. Our keys go out immediately; the escrow is created once the
/// maker's keys arrive.
pub async fn start(
    backend: Backend,
    offer: Offer,
    peer: PeerId,
    eth_amount: Decimal,
) -> Result<Handle, ProtocolError> {
    let offer_id = offer.id();
    let xmr_expected = offer.exchange_rate.xmr_for(&eth_amount)?;
    offer
        .validate_amount(&xmr_expected)
        .map_err(|err| ProtocolError::Validation(err.to_string()))?;

    let session = SessionKeys::generate();
    backend.db.put_session_keys(offer_id, &session.key_pair)?;

    let monero_start_height = backend
        .xmr
        .get_height()
        .await?
        .saturating_sub(MONERO_REORG_BUFFER);
    let eth_start_block = backend.eth.block_number().await?;

    let info = SwapInfo::new(
        offer_id,
        Role::Taker,
        peer.clone(),
        eth_amount,
        xmr_expected,
        offer.exchange_rate,
        offer.eth_asset.clone(),
        eth_start_block,
        monero_start_height,
        Status::ExpectingKeys,
    );
    backend.manager.add_swap(&info).map_err(storage_err)?;

    let hello = Message::SendKeys(SendKeysMessage {
        offer_id,
        provided_amount: eth_amount,
        public_spend_key: session.public_pair().spend,
        private_view_key: session.key_pair.view.clone(),
        dleq_proof: session.dleq_proof.clone(),
        secp256k1_public_key: session.secp_public(),
        eth_address: backend.eth.local_address(),
    });
    if let Err(err) = backend.net.send_swap_message(&peer, hello, offer_id).await {
        let mut info = info;
        info.set_status(Status::CompletedAbort);
        let _ = backend.manager.complete_ongoing(&mut info);
        return Err(err.into());
    }

    Ok(spawn(backend, info, session, None, None))
}

/// Re-enters a persisted swap; used by recovery once the escrow is known
/// to still be live.
pub(crate) fn resume(
    backend: Backend,
    info: SwapInfo,
    session: SessionKeys,
    cp_keys: CounterpartyKeys,
    contract: ContractSwapInfo,
) -> Handle {
    spawn(
        backend,
        info,
        session,
        Some(cp_keys),
        Some(contract),
    )
}

fn spawn(
    backend: Backend,
    info: SwapInfo,
    session: SessionKeys,
    cp_keys: Option<CounterpartyKeys>,
    contract: Option<ContractSwapInfo>,
) -> Handle {
    let offer_id = info.offer_id;
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let resume_block = contract.as_ref().map(|c| c.start_block);
    let mut swap = TakerSwap {
        backend,
        info,
        session,
        cp_keys,
        swap_id: contract.as_ref().map(|c| c.swap_id),
        contract_swap: contract.map(|c| c.swap),
        event_tx: event_tx.clone(),
        shutdown: shutdown_tx,
        watchers_started: false,
    };

    let span = info_span!("taker_swap", id = %offer_id);
    tokio::spawn(
        async move {
            if let Some(block) = resume_block {
                swap.start_watchers(block);
            }
            swap.run(event_rx).await;
        }
        .instrument(span),
    );

    Handle {
        offer_id,
        event_tx,
        done: shutdown_rx,
    }
}

fn storage_err(err: crate::swap::SwapError) -> ProtocolError {
    match err {
        crate::swap::SwapError::Storage(db) => ProtocolError::StorageFailed(db),
        crate::swap::SwapError::NotFound => {
            ProtocolError::InvariantViolation("swap missing from manager".into())
        }
    }
}

impl TakerSwap {
    async fn run(mut self, mut event_rx: mpsc::Receiver<Envelope<Event>>) {
        info!(status = %self.info.status, "taker swap running");
        while let Some(envelope) = event_rx.recv().await {
            let Envelope { event, reply } = envelope;
            debug!(?event, "handling event");
            let result = self.handle_event(event, &mut event_rx).await;
            if let Err(err) = &result {
                error!(%err, status = %self.info.status, "event handling failed");
            }
            if let Some(reply) = reply {
                let _ = reply.send(result);
            }
            if !self.info.status.is_ongoing() {
                self.finish().await;
                return;
            }
        }
    }

    async fn handle_event(
        &mut self,
        event: Event,
        event_rx: &mut mpsc::Receiver<Envelope<Event>>,
    ) -> Result<(), ProtocolError> {
        match event {
            Event::KeysReceived(msg) => self.handle_keys_received(msg).await,
            Event::XmrLocked { tx_id, address } => self.handle_xmr_locked(tx_id, address).await,
            Event::Claimed { secret } => self.handle_claimed(secret).await,
            Event::TimeoutT1 => self.handle_timeout_t1().await,
            Event::Exit => self.handle_exit(event_rx).await,
        }
    }

    async fn handle_keys_received(&mut self, msg: SendKeysMessage) -> Result<(), ProtocolError> {
        match self.info.status {
            Status::ExpectingKeys => {}
            status if !status.is_ongoing() => return Ok(()),
            status => {
                return Err(ProtocolError::UnexpectedStatus {
                    expected: Status::ExpectingKeys,
                    actual: status,
                })
            }
        }

        if msg.offer_id != self.info.offer_id {
            return Err(ProtocolError::Validation("keys for a different swap".into()));
        }
        if msg.provided_amount != self.info.expected_amount {
            return Err(ProtocolError::Validation(format!(
                "maker offers {} XMR, expected {}",
                msg.provided_amount, self.info.expected_amount
            )));
        }

        let cp_keys = CounterpartyKeys::from_message(&msg)?;
        self.backend
            .db
            .put_counterparty_keys(self.info.offer_id, &cp_keys)?;
        self.cp_keys = Some(cp_keys);

        self.info.set_status(Status::KeysExchanged);
        self.backend
            .manager
            .write_swap(&self.info)
            .map_err(storage_err)?;

        self.lock_eth().await
    }

    async fn lock_eth(&mut self) -> Result<(), ProtocolError> {
        let cp_keys = self
            .cp_keys
            .clone()
            .ok_or_else(|| ProtocolError::InvariantViolation("lock without keys".into()))?;

        let value = to_base_units(&self.info.provided_amount, self.info.eth_asset.decimals())?;
        let mut nonce_bytes = [0u8; 32];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = U256::from_big_endian(&nonce_bytes);

        let args = NewSwapArgs {
            commit_claim: cp_keys.commitment()?,
            commit_refund: self.session.commitment()?,
            claimer: cp_keys.eth_address,
            timeout_duration_0: U256::from(self.backend.contract_timeout.as_secs()),
            timeout_duration_1: U256::from(self.backend.contract_timeout.as_secs()),
            asset: self.info.eth_asset.clone(),
            value,
            nonce,
        };

        // the escrow parameters must survive a crash during broadcast, so a
        // provisional record (timeouts unknown) is written first
        let start_block = self.backend.eth.block_number().await?;
        let provisional = ContractSwap {
            owner: self.backend.eth.local_address(),
            claimer: args.claimer,
            commit_claim: args.commit_claim,
            commit_refund: args.commit_refund,
            timeout0: U256::zero(),
            timeout1: U256::zero(),
            asset: self.info.eth_asset.address(),
            value,
            nonce,
        };
        self.backend.db.put_contract_swap_info(
            self.info.offer_id,
            &ContractSwapInfo {
                swap_id: provisional.swap_id(),
                swap: provisional.clone(),
                start_block,
            },
        )?;
        self.info.set_status(Status::ContractDeploying);
        self.backend
            .manager
            .write_swap(&self.info)
            .map_err(storage_err)?;

        let receipt = match self.backend.sender.new_swap(&args).await {
            Ok(receipt) => receipt,
            Err(err) => {
                let err = ProtocolError::from(err);
                match err {
                    // nothing reached the chain; safe to walk away
                    ProtocolError::SignTimeout
                    | ProtocolError::Unsupported(_)
                    | ProtocolError::TxReverted { .. } => {
                        warn!(%err, "escrow creation failed with no lock on-chain; aborting");
                        self.info.set_status(Status::CompletedAbort);
                        return Err(err);
                    }
                    // ambiguous: the transaction may still land; keep the
                    // swap ongoing so recovery reconciles it
                    other => return Err(other),
                }
            }
        };

        let new_log = receipt
            .logs
            .iter()
            .find(|log| log.topics.first() == Some(&contract::new_topic()))
            .ok_or_else(|| {
                ProtocolError::InvariantViolation("new_swap receipt carries no New log".into())
            })?;
        let decoded = decode_new_log(new_log)?;

        let swap = ContractSwap {
            timeout0: decoded.timeout0,
            timeout1: decoded.timeout1,
            ..provisional
        };
        let swap_id = swap.swap_id();
        if swap_id != decoded.swap_id {
            return Err(ProtocolError::InvariantViolation(
                "escrow id disagrees with New log".into(),
            ));
        }

        let deployed_block = new_log
            .block_number
            .map(|n| n.as_u64())
            .unwrap_or(start_block);
        self.backend.db.put_contract_swap_info(
            self.info.offer_id,
            &ContractSwapInfo {
                swap_id,
                swap: swap.clone(),
                start_block: deployed_block,
            },
        )?;

        self.info.timeout0 = Some(swap.timeout0.as_u64());
        self.info.timeout1 = Some(swap.timeout1.as_u64());
        self.info.set_status(Status::EthLocked);
        self.backend
            .manager
            .write_swap(&self.info)
            .map_err(storage_err)?;

        self.contract_swap = Some(swap.clone());
        self.swap_id = Some(swap_id);
        info!(%swap_id, value = %value, "escrow created");

        let notify = Message::NotifyEthLocked(NotifyEthLocked {
            offer_id: self.info.offer_id,
            address: self.backend.swap_creator,
            contract_swap: swap,
            start_block: deployed_block,
        });
        self.backend
            .net
            .send_swap_message(&self.info.peer_id, notify, self.info.offer_id)
            .await?;

        self.start_watchers(deployed_block);
        Ok(())
    }

    fn start_watchers(&mut self, from_block: u64) {
        if self.watchers_started {
            return;
        }
        self.watchers_started = true;
        let swap_id = match self.swap_id {
            Some(id) => id.to_h256(),
            None => return,
        };

        let (log_tx, mut log_rx) = mpsc::channel(LOG_CHANNEL_SIZE);
        EventFilter::new(
            self.backend.eth.clone(),
            self.backend.swap_creator,
            contract::claimed_topic(),
            Some(swap_id),
            from_block,
            log_tx,
            self.shutdown.subscribe(),
        )
        .spawn();

        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(log) = log_rx.recv().await {
                match decode_secret_log(&log) {
                    Ok((_, secret)) => {
                        if let Err(err) = deliver(&event_tx, Event::Claimed { secret }).await {
                            debug!(%err, "claimed log not handled");
                            return;
                        }
                    }
                    Err(err) => warn!(%err, "undecodable Claimed log"),
                }
            }
        });

        if let Some(t1) = self.info.timeout1 {
            let eth = self.backend.eth.clone();
            let event_tx = self.event_tx.clone();
            let mut shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                        _ = sleep(TIMEOUT_POLL_INTERVAL) => {
                            match eth.latest_timestamp().await {
                                Ok(now) if now >= t1 => {
                                    let _ = deliver(&event_tx, Event::TimeoutT1).await;
                                    return;
                                }
                                Ok(_) => {}
                                Err(err) => warn!(%err, "t1 poll failed"),
                            }
                        }
                    }
                }
            });
        }
    }

    async fn handle_xmr_locked(
        &mut self,
        tx_id: String,
        address: String,
    ) -> Result<(), ProtocolError> {
        match self.info.status {
            Status::EthLocked => {}
            Status::ContractReady => return Ok(()),
            status if !status.is_ongoing() => return Ok(()),
            status => {
                return Err(ProtocolError::UnexpectedStatus {
                    expected: Status::EthLocked,
                    actual: status,
                })
            }
        }

        let cp_keys = self
            .cp_keys
            .clone()
            .ok_or_else(|| ProtocolError::InvariantViolation("XMR lock without keys".into()))?;

        // never trust the claimed address; derive the joint wallet ourselves
        let joint_pub = cp_keys.public_pair().sum(&self.session.public_pair());
        let expected_address = joint_pub
            .address(self.backend.monero_network())
            .map_err(|err| ProtocolError::Validation(err.to_string()))?
            .to_string();
        if address != expected_address {
            return Err(ProtocolError::Validation(
                "maker reported a different joint address".into(),
            ));
        }

        info!(%tx_id, address = %expected_address, "verifying XMR lock via view key");
        let view_key = add_view_keys(&self.session.key_pair.view, &cp_keys.private_view_key);
        let filename = format!("{}-view", swap_wallet_filename(&self.info.offer_id.hex()));
        self.backend
            .xmr
            .generate_from_keys(RestoreWalletArgs {
                filename,
                address: expected_address,
                spend_key: None,
                view_key: view_key.to_bytes(),
                restore_height: Some(self.info.monero_start_height),
            })
            .await?;

        let expected = xmr_to_piconero(&self.info.expected_amount)?;
        let mut verified = false;
        for _ in 0..LOCK_VERIFY_MAX_ATTEMPTS {
            self.backend
                .xmr
                .refresh(Some(self.info.monero_start_height))
                .await?;
            let balance = self.backend.xmr.balance().await?;
            if balance.unlocked >= expected {
                verified = true;
                break;
            }
            debug!(
                total = balance.total,
                unlocked = balance.unlocked,
                expected,
                "XMR lock not yet spendable"
            );
            sleep(LOCK_VERIFY_POLL_INTERVAL).await;
        }
        if let Err(err) = self.backend.xmr.open_wallet(&self.backend.wallet_file).await {
            warn!(%err, "failed to reopen primary wallet after view check");
        }
        if !verified {
            return Err(ProtocolError::Validation(
                "XMR lock never became spendable for the expected amount".into(),
            ));
        }

        let swap = self
            .contract_swap
            .clone()
            .ok_or_else(|| ProtocolError::InvariantViolation("set_ready without escrow".into()))?;
        self.backend.sender.set_ready(&swap).await?;

        self.info.set_status(Status::ContractReady);
        self.backend
            .manager
            .write_swap(&self.info)
            .map_err(storage_err)?;
        info!("XMR lock verified; escrow set ready");
        Ok(())
    }

    async fn handle_claimed(&mut self, secret: [u8; 32]) -> Result<(), ProtocolError> {
        if !self.info.status.is_ongoing() {
            return Ok(());
        }
        if self.info.status == Status::SweepingXmr {
            return Ok(());
        }

        let cp_keys = self
            .cp_keys
            .clone()
            .ok_or_else(|| ProtocolError::InvariantViolation("claim without keys".into()))?;

        let cp_spend = contract_secret_to_spend_key(secret);
        self.backend
            .db
            .put_counterparty_spend_key(self.info.offer_id, &cp_spend)?;

        self.info.set_status(Status::SweepingXmr);
        self.backend
            .manager
            .write_swap(&self.info)
            .map_err(storage_err)?;

        let joint = PrivateKeyPair::joint(
            &self.session.key_pair.spend,
            &cp_spend,
            &self.session.key_pair.view,
            &cp_keys.private_view_key,
        );
        let destination = self.backend.xmr.primary_address().await?;
        let filename = swap_wallet_filename(&self.info.offer_id.hex());
        sweep_joint_output(
            self.backend.xmr.as_ref(),
            SweepRequest {
                joint_keys: &joint,
                network: self.backend.monero_network(),
                restore_height: Some(self.info.monero_start_height),
                destination: &destination,
                wallet_filename: &filename,
            },
        )
        .await?;
        if let Err(err) = self.backend.xmr.open_wallet(&self.backend.wallet_file).await {
            warn!(%err, "failed to reopen primary wallet after sweep");
        }

        self.info.set_status(Status::CompletedSuccess);
        info!("maker claimed; joint XMR swept to our primary address");
        Ok(())
    }

    async fn handle_timeout_t1(&mut self) -> Result<(), ProtocolError> {
        match self.info.status {
            Status::EthLocked | Status::ContractReady => {}
            status if !status.is_ongoing() => return Ok(()),
            Status::SweepingXmr => return Ok(()),
            status => {
                return Err(ProtocolError::UnexpectedStatus {
                    expected: Status::ContractReady,
                    actual: status,
                })
            }
        }
        self.refund().await
    }

    async fn refund(&mut self) -> Result<(), ProtocolError> {
        let swap = self
            .contract_swap
            .clone()
            .ok_or_else(|| ProtocolError::InvariantViolation("refund without escrow".into()))?;

        let result = self
            .backend
            .sender
            .refund(&swap, self.session.contract_secret())
            .await;
        if let Err(err) = result {
            let err = ProtocolError::from(err);
            if let ProtocolError::TxReverted { reason } = &err {
                if self.claimed_log_exists().await? {
                    info!(%reason, "refund reverted because the maker claimed; awaiting Claimed log");
                    return Ok(());
                }
            }
            return Err(err);
        }

        self.info.set_status(Status::CompletedRefund);
        info!("escrow refunded");
        Ok(())
    }

    async fn claimed_log_exists(&self) -> Result<bool, ProtocolError> {
        let swap_id = match self.swap_id {
            Some(id) => id,
            None => return Ok(false),
        };
        let head = self.backend.eth.block_number().await?;
        let logs = self
            .backend
            .eth
            .filter_logs(
                self.backend.swap_creator,
                contract::claimed_topic(),
                Some(swap_id.to_h256()),
                self.info.eth_start_block,
                head,
            )
            .await?;
        Ok(logs.iter().any(|log| log.removed != Some(true)))
    }

    async fn query_stage(&self) -> Result<Stage, ProtocolError> {
        let swap_id = self
            .swap_id
            .ok_or_else(|| ProtocolError::InvariantViolation("stage query without escrow".into()))?;
        let output = self
            .backend
            .eth
            .call(
                self.backend.swap_creator,
                contract::swaps_calldata(swap_id),
            )
            .await?;
        Stage::from_call_output(&output).map_err(ProtocolError::from)
    }

    async fn handle_exit(
        &mut self,
        event_rx: &mut mpsc::Receiver<Envelope<Event>>,
    ) -> Result<(), ProtocolError> {
        debug!(status = %self.info.status, "exit requested");
        match self.info.status {
            Status::ExpectingKeys | Status::KeysExchanged => {
                self.info.set_status(Status::CompletedAbort);
                Ok(())
            }
            Status::EthLocked | Status::ContractReady | Status::ContractDeploying => {
                let stage = self.query_stage().await?;
                if stage == Stage::Completed {
                    // resolved on-chain already; the pending log drives the
                    // terminal state
                    return Ok(());
                }

                let now = self.backend.eth.latest_timestamp().await?;
                let t0 = self.info.timeout0.unwrap_or(0);
                let t1 = self.info.timeout1.unwrap_or(0);
                let refundable = (stage == Stage::Pending && now < t0) || now >= t1;
                if refundable {
                    return self.refund().await;
                }

                // inside the claim window; the maker may still claim, so
                // hold the channel until the swap resolves
                info!("exit inside claim window; waiting for Claimed or t1");
                loop {
                    let envelope = match event_rx.recv().await {
                        Some(envelope) => envelope,
                        None => return Err(ProtocolError::Cancelled),
                    };
                    let Envelope { event, reply } = envelope;
                    let result = match event {
                        Event::Claimed { secret } => self.handle_claimed(secret).await,
                        Event::TimeoutT1 => self.handle_timeout_t1().await,
                        Event::XmrLocked { .. } | Event::Exit => Ok(()),
                        Event::KeysReceived(_) => {
                            Err(ProtocolError::Validation("unexpected keys message".into()))
                        }
                    };
                    let finished = !self.info.status.is_ongoing();
                    if let Some(reply) = reply {
                        let _ = reply.send(result);
                    }
                    if finished {
                        return Ok(());
                    }
                }
            }
            status if !status.is_ongoing() => Ok(()),
            status => Err(ProtocolError::InvariantViolation(format!(
                "exit in unexpected status {status}"
            ))),
        }
    }

    async fn finish(&mut self) {
        let mut info = self.info.clone();
        if let Err(err) = self.backend.manager.complete_ongoing(&mut info) {
            warn!(%err, "failed to complete swap in manager");
        } else {
            self.info = info;
        }

        self.backend.net.close_protocol_stream(self.info.offer_id);

        if self.info.status == Status::CompletedSuccess {
            if let Err(err) = self.backend.db.delete_recovery(self.info.offer_id) {
                warn!(%err, "failed to purge recovery records");
            }
        }

        let _ = self.shutdown.send(true);
        info!(status = %self.info.status, "taker swap finished");
    }
}
