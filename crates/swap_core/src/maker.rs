//! Maker role: supplies XMR, claims the EVM asset.
//!
//! The maker locks XMR only after the taker's escrow lock has been verified
//! against the chain field by field; a mismatch aborts with no XMR at risk.
//! After locking, the only exits are a claim (on `Ready` or t0) or a sweep
//! of the joint output once the taker's refund reveals their secret.

use ethers::types::Address;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, info_span, warn, Instrument};
use xmr_wallet::{swap_wallet_filename, sweep_joint_output, PrivateKeyPair, SweepRequest};

use crate::backend::Backend;
use crate::coins::{to_base_units, xmr_to_piconero};
use crate::error::ProtocolError;
use crate::eth::contract::{
    self, decode_new_log, decode_secret_log, ContractSwap, ContractSwapInfo,
};
use crate::eth::watcher::{EventFilter, LOG_CHANNEL_SIZE};
use crate::event::{deliver, Envelope, EVENT_CHANNEL_SIZE};
use crate::net::{Message, NotifyXmrLock, RelayClaimRequest, SendKeysMessage};
use crate::offers::Offer;
use crate::session::{contract_secret_to_spend_key, CounterpartyKeys, SessionKeys};
use crate::swap::SwapInfo;
use crate::types::{Hash, PeerId, Role, Status};

/// Blocks subtracted from the current Monero height when a swap starts, so
/// a reorg cannot hide the lock from the later scan.
const MONERO_REORG_BUFFER: u64 = 10;

const TIMEOUT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum Event {
    /// The taker claims the escrow exists (from `NotifyETHLocked`).
    EthLocked {
        address: Address,
        swap: ContractSwap,
        start_block: u64,
    },
    /// `Ready` log observed, or the taker said so out of band.
    ContractReady,
    /// `Refunded` log observed; carries the taker's revealed secret.
    EthRefunded { secret: [u8; 32] },
    /// t0 passed on-chain; the contract accepts our claim regardless of
    /// `set_ready`.
    TimeoutT0,
    Exit,
}

/// Caller-facing handle to a running maker swap.
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

    /// Requests a status-dependent safe exit and waits for it to finish.
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

struct MakerSwap {
    backend: Backend,
    info: SwapInfo,
    offer: Offer,
    use_relayer: bool,
    session: SessionKeys,
    cp_keys: CounterpartyKeys,
    contract_swap: Option<ContractSwap>,
    swap_id: Option<Hash>,
    event_tx: mpsc::Sender<Envelope<Event>>,
    shutdown: watch::Sender<bool>,
    watchers_started: bool,
}

/// Entry point when a taker initiates against one of our offers: their keys
/// message is in hand, ours go out on success.
pub async fn start(
    backend: Backend,
    offer: Offer,
    peer: PeerId,
    taker_msg: SendKeysMessage,
) -> Result<Handle, ProtocolError> {
    let offer_id = offer.id();
    if taker_msg.offer_id != offer_id {
        return Err(ProtocolError::Validation(format!(
            "keys message references offer {}, expected {offer_id}",
            taker_msg.offer_id
        )));
    }

    let eth_amount = taker_msg.provided_amount;
    let xmr_amount = offer.exchange_rate.xmr_for(&eth_amount)?;
    offer
        .validate_amount(&xmr_amount)
        .map_err(|err| ProtocolError::Validation(err.to_string()))?;

    let cp_keys = CounterpartyKeys::from_message(&taker_msg)?;
    let session = SessionKeys::generate();

    // the offer is off the market while this swap consumes it; it comes
    // back if the swap ends in anything but success
    let _ = backend.offers.take(offer_id);

    // our spend scalar must be durable before any XMR can move
    backend.db.put_session_keys(offer_id, &session.key_pair)?;
    backend.db.put_counterparty_keys(offer_id, &cp_keys)?;
    if offer.use_relayer {
        backend.db.put_relayer_info(
            offer_id,
            &crate::db::RelayerInfo { use_relayer: true },
        )?;
    }

    let monero_start_height = backend
        .xmr
        .get_height()
        .await?
        .saturating_sub(MONERO_REORG_BUFFER);
    let eth_start_block = backend.eth.block_number().await?;

    let info = SwapInfo::new(
        offer_id,
        Role::Maker,
        peer.clone(),
        xmr_amount,
        eth_amount,
        offer.exchange_rate,
        offer.eth_asset.clone(),
        eth_start_block,
        monero_start_height,
        Status::KeysExchanged,
    );
    backend
        .manager
        .add_swap(&info)
        .map_err(storage_err)?;

    let reply = Message::SendKeys(SendKeysMessage {
        offer_id,
        provided_amount: xmr_amount,
        public_spend_key: session.public_pair().spend,
        private_view_key: session.key_pair.view.clone(),
        dleq_proof: session.dleq_proof.clone(),
        secp256k1_public_key: session.secp_public(),
        eth_address: backend.eth.local_address(),
    });
    if let Err(err) = backend.net.send_swap_message(&peer, reply, offer_id).await {
        let mut info = info;
        info.set_status(Status::CompletedAbort);
        let _ = backend.manager.complete_ongoing(&mut info);
        return Err(err.into());
    }

    let use_relayer = offer.use_relayer;
    Ok(spawn(
        backend, info, offer, use_relayer, session, cp_keys, None, None,
    ))
}

/// Re-enters a persisted swap at `XmrLocked`; used by recovery.
pub(crate) fn resume(
    backend: Backend,
    info: SwapInfo,
    offer: Offer,
    use_relayer: bool,
    session: SessionKeys,
    cp_keys: CounterpartyKeys,
    contract: ContractSwapInfo,
) -> Handle {
    spawn(
        backend,
        info,
        offer,
        use_relayer,
        session,
        cp_keys,
        Some(contract.swap),
        Some((contract.swap_id, contract.start_block)),
    )
}

#[allow(clippy::too_many_arguments)]
fn spawn(
    backend: Backend,
    info: SwapInfo,
    offer: Offer,
    use_relayer: bool,
    session: SessionKeys,
    cp_keys: CounterpartyKeys,
    contract_swap: Option<ContractSwap>,
    resume_from: Option<(Hash, u64)>,
) -> Handle {
    let offer_id = info.offer_id;
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut swap = MakerSwap {
        backend,
        info,
        offer,
        use_relayer,
        session,
        cp_keys,
        contract_swap,
        swap_id: resume_from.map(|(id, _)| id),
        event_tx: event_tx.clone(),
        shutdown: shutdown_tx,
        watchers_started: false,
    };

    let span = info_span!("maker_swap", id = %offer_id);
    tokio::spawn(
        async move {
            if let Some((_, start_block)) = resume_from {
                swap.start_watchers(start_block);
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

impl MakerSwap {
    async fn run(mut self, mut event_rx: mpsc::Receiver<Envelope<Event>>) {
        info!(status = %self.info.status, "maker swap running");
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
            Event::EthLocked {
                address,
                swap,
                start_block,
            } => self.handle_eth_locked(address, swap, start_block).await,
            Event::ContractReady | Event::TimeoutT0 => self.handle_claim().await,
            Event::EthRefunded { secret } => self.handle_refunded(secret).await,
            Event::Exit => self.handle_exit(event_rx).await,
        }
    }

    async fn handle_eth_locked(
        &mut self,
        address: Address,
        swap: ContractSwap,
        start_block: u64,
    ) -> Result<(), ProtocolError> {
        match self.info.status {
            Status::KeysExchanged | Status::ExpectingEthLock => {}
            status if !status.is_ongoing() => return Ok(()),
            status => {
                return Err(ProtocolError::UnexpectedStatus {
                    expected: Status::ExpectingEthLock,
                    actual: status,
                })
            }
        }

        // an invalid lock must abort before any XMR moves
        if let Err(err) = self.verify_and_persist_lock(address, &swap, start_block).await {
            warn!(%err, "escrow lock rejected; aborting with no XMR at risk");
            self.info.set_status(Status::CompletedAbort);
            return Err(err);
        }

        self.lock_xmr().await?;
        self.start_watchers(start_block);
        Ok(())
    }

    /// Field-by-field verification of the taker's escrow against what we
    /// agreed to, confirmed against the on-chain `New` log.
    async fn verify_and_persist_lock(
        &mut self,
        address: Address,
        swap: &ContractSwap,
        start_block: u64,
    ) -> Result<(), ProtocolError> {
        let validation = |what: &str| ProtocolError::Validation(format!("escrow mismatch: {what}"));

        if address != self.backend.swap_creator {
            return Err(validation("contract address"));
        }
        if swap.claimer != self.backend.eth.local_address() {
            return Err(validation("claimer"));
        }
        if swap.owner != self.cp_keys.eth_address {
            return Err(validation("owner"));
        }
        if swap.commit_claim != self.session.commitment()? {
            return Err(validation("claim commitment"));
        }
        if swap.commit_refund != self.cp_keys.commitment()? {
            return Err(validation("refund commitment"));
        }
        if swap.asset != self.info.eth_asset.address() {
            return Err(validation("asset"));
        }
        let expected_value =
            to_base_units(&self.info.expected_amount, self.info.eth_asset.decimals())?;
        if swap.value != expected_value {
            return Err(validation("value"));
        }
        if swap.timeout0 >= swap.timeout1 {
            return Err(validation("timeouts"));
        }

        let swap_id = swap.swap_id();
        let head = self.backend.eth.block_number().await?;
        let logs = self
            .backend
            .eth
            .filter_logs(
                self.backend.swap_creator,
                contract::new_topic(),
                Some(swap_id.to_h256()),
                start_block,
                head,
            )
            .await?;
        let log = logs
            .iter()
            .find(|log| log.removed != Some(true))
            .ok_or_else(|| validation("no New log on-chain"))?;
        let on_chain = decode_new_log(log)?;
        if on_chain.commit_claim != swap.commit_claim
            || on_chain.commit_refund != swap.commit_refund
            || on_chain.timeout0 != swap.timeout0
            || on_chain.timeout1 != swap.timeout1
            || on_chain.asset != swap.asset
            || on_chain.value != swap.value
        {
            return Err(validation("New log disagrees with claimed struct"));
        }

        self.backend.db.put_contract_swap_info(
            self.info.offer_id,
            &ContractSwapInfo {
                swap_id,
                swap: swap.clone(),
                start_block,
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
        info!(swap_id = %swap_id, "escrow lock verified");
        Ok(())
    }

    async fn lock_xmr(&mut self) -> Result<(), ProtocolError> {
        let joint = self.cp_keys.public_pair().sum(&self.session.public_pair());
        let address = joint
            .address(self.backend.monero_network())
            .map_err(|err| ProtocolError::Validation(err.to_string()))?
            .to_string();
        let amount = xmr_to_piconero(&self.info.provided_amount)?;

        // persisted before the transfer: a crash during the transfer must
        // restart as already-locked, never lock twice
        self.info.set_status(Status::XmrLocked);
        self.backend
            .manager
            .write_swap(&self.info)
            .map_err(storage_err)?;

        let receipt = self.backend.xmr.transfer(&address, amount).await?;
        info!(tx_id = %receipt.tx_hash, %address, amount, "locked XMR into joint output");

        let notify = Message::NotifyXmrLock(NotifyXmrLock {
            offer_id: self.info.offer_id,
            tx_id: receipt.tx_hash,
            address,
        });
        if let Err(err) = self
            .backend
            .net
            .send_swap_message(&self.info.peer_id, notify, self.info.offer_id)
            .await
        {
            // the taker can still find the lock through the shared view key
            warn!(%err, "failed to notify taker of XMR lock");
        }
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

        for (topic, kind) in [
            (contract::ready_topic(), LogKind::Ready),
            (contract::refunded_topic(), LogKind::Refunded),
        ] {
            let (log_tx, mut log_rx) = mpsc::channel(LOG_CHANNEL_SIZE);
            EventFilter::new(
                self.backend.eth.clone(),
                self.backend.swap_creator,
                topic,
                Some(swap_id),
                from_block,
                log_tx,
                self.shutdown.subscribe(),
            )
            .spawn();

            let event_tx = self.event_tx.clone();
            tokio::spawn(async move {
                while let Some(log) = log_rx.recv().await {
                    let event = match kind {
                        LogKind::Ready => Event::ContractReady,
                        LogKind::Refunded => match decode_secret_log(&log) {
                            Ok((_, secret)) => Event::EthRefunded { secret },
                            Err(err) => {
                                warn!(%err, "undecodable Refunded log");
                                continue;
                            }
                        },
                    };
                    if let Err(err) = deliver(&event_tx, event).await {
                        debug!(%err, "log event not handled");
                        return;
                    }
                }
            });
        }

        if let Some(t0) = self.info.timeout0 {
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
                                Ok(now) if now >= t0 => {
                                    let _ = deliver(&event_tx, Event::TimeoutT0).await;
                                    return;
                                }
                                Ok(_) => {}
                                Err(err) => warn!(%err, "t0 poll failed"),
                            }
                        }
                    }
                }
            });
        }
    }

    async fn handle_claim(&mut self) -> Result<(), ProtocolError> {
        match self.info.status {
            Status::XmrLocked => {}
            // a second Ready/t0 delivery after completion is a no-op
            Status::SweepingXmr => return Ok(()),
            status if !status.is_ongoing() => return Ok(()),
            status => {
                return Err(ProtocolError::UnexpectedStatus {
                    expected: Status::XmrLocked,
                    actual: status,
                })
            }
        }

        let swap = self
            .contract_swap
            .clone()
            .ok_or_else(|| ProtocolError::InvariantViolation("claim without contract".into()))?;
        let secret = self.session.contract_secret();

        let result = if self.use_relayer {
            self.claim_via_relayer(&swap, secret).await
        } else {
            self.backend
                .sender
                .claim(&swap, secret)
                .await
                .map(|_| ())
                .map_err(ProtocolError::from)
        };

        if let Err(ProtocolError::TxReverted { reason }) = &result {
            // if the taker refunded first the Refunded log resolves this
            // swap; otherwise surface the revert for a retry
            if self.refunded_log_exists().await? {
                info!(%reason, "claim reverted because the escrow was refunded; awaiting Refunded log");
                return Ok(());
            }
        }
        result?;

        self.info.set_status(Status::CompletedSuccess);
        info!("claimed escrow funds");
        Ok(())
    }

    async fn claim_via_relayer(
        &self,
        swap: &ContractSwap,
        secret: [u8; 32],
    ) -> Result<(), ProtocolError> {
        let swap_id = swap.swap_id();
        let mut message = swap_id.as_bytes().to_vec();
        message.extend_from_slice(&secret);
        let signature = self.backend.eth.sign_message(&message).await?;

        let request = RelayClaimRequest {
            offer_id: self.info.offer_id,
            swap: swap.clone(),
            secret,
            signature,
        };
        match self.backend.net.submit_claim_to_relayer(request).await {
            Ok(response) => {
                self.backend
                    .eth
                    .receipt_for(response.tx_hash)
                    .await
                    .map_err(ProtocolError::from)?;
                Ok(())
            }
            Err(err) => {
                // no relayer reachable; fall back to paying our own gas
                warn!(%err, "relayer claim failed, claiming directly");
                self.backend
                    .sender
                    .claim(swap, secret)
                    .await
                    .map(|_| ())
                    .map_err(ProtocolError::from)
            }
        }
    }

    async fn refunded_log_exists(&self) -> Result<bool, ProtocolError> {
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
                contract::refunded_topic(),
                Some(swap_id.to_h256()),
                self.info.eth_start_block,
                head,
            )
            .await?;
        Ok(logs.iter().any(|log| log.removed != Some(true)))
    }

    async fn handle_refunded(&mut self, secret: [u8; 32]) -> Result<(), ProtocolError> {
        if !self.info.status.is_ongoing() {
            return Ok(());
        }

        let cp_spend = contract_secret_to_spend_key(secret);
        // persist the revealed scalar first: with it on disk the sweep can
        // always be redone
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
            &self.cp_keys.private_view_key,
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

        self.info.set_status(Status::CompletedRefund);
        info!("taker refunded; joint XMR swept back to us");
        Ok(())
    }

    async fn handle_exit(
        &mut self,
        event_rx: &mut mpsc::Receiver<Envelope<Event>>,
    ) -> Result<(), ProtocolError> {
        debug!(status = %self.info.status, "exit requested");
        match self.info.status {
            Status::KeysExchanged | Status::ExpectingEthLock => {
                // nothing locked on either chain
                self.info.set_status(Status::CompletedAbort);
                Ok(())
            }
            Status::XmrLocked => {
                // our XMR is locked; the only safe exits are a claim or a
                // sweep, so take over the channel until one arrives
                info!("waiting for Ready/t0 or Refunded before exiting");
                loop {
                    let envelope = match event_rx.recv().await {
                        Some(envelope) => envelope,
                        None => return Err(ProtocolError::Cancelled),
                    };
                    let Envelope { event, reply } = envelope;
                    let result = match event {
                        Event::ContractReady | Event::TimeoutT0 => self.handle_claim().await,
                        Event::EthRefunded { secret } => self.handle_refunded(secret).await,
                        Event::Exit => Ok(()),
                        Event::EthLocked { .. } => Err(ProtocolError::Validation(
                            "unexpected NotifyETHLocked".into(),
                        )),
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

    /// One-shot terminal teardown: completes the manager record, settles
    /// the offer, tears down watchers.
    async fn finish(&mut self) {
        let mut info = self.info.clone();
        if let Err(err) = self.backend.manager.complete_ongoing(&mut info) {
            warn!(%err, "failed to complete swap in manager");
        } else {
            self.info = info;
        }

        self.backend.net.close_protocol_stream(self.info.offer_id);

        match self.info.status {
            Status::CompletedSuccess => {
                if let Err(err) = self.backend.offers.delete(self.info.offer_id) {
                    warn!(%err, "failed to delete taken offer");
                }
                // secrets are useless after a successful claim
                if let Err(err) = self.backend.db.delete_recovery(self.info.offer_id) {
                    warn!(%err, "failed to purge recovery records");
                }
            }
            _ => {
                // the offer was not consumed; advertise it again, and keep
                // the recovery records in case funds are still reachable
                if let Err(err) = self.backend.offers.add(self.offer.clone()) {
                    warn!(%err, "failed to re-add offer");
                }
            }
        }

        let _ = self.shutdown.send(true);
        info!(status = %self.info.status, "maker swap finished");
    }
}

#[derive(Clone, Copy)]
enum LogKind {
    Ready,
    Refunded,
}
