//! Restart recovery.
//!
//! For every persisted ongoing swap, re-hydrates the key material and
//! contract info, reconciles against the current escrow stage and the log
//! history, and either completes the swap synthetically (sweeping the
//! joint output when a revealed secret makes that possible) or re-enters
//! the live state machine at the point the status implies.

use tracing::{error, info, warn};
use xmr_wallet::{swap_wallet_filename, sweep_joint_output, PrivateKeyPair, PrivateSpendKey, SweepRequest};

use crate::backend::Backend;
use crate::db::DbError;
use crate::error::ProtocolError;
use crate::eth::contract::{self, decode_new_log, decode_secret_log, ContractSwap, ContractSwapInfo, Stage};
use crate::maker;
use crate::session::{contract_secret_to_spend_key, CounterpartyKeys, SessionKeys};
use crate::swap::SwapInfo;
use crate::taker;
use crate::types::{Hash, Role, Status};

/// Outcome of recovering one persisted swap.
#[derive(Debug)]
pub enum Resumption {
    /// The chain showed the swap already finished; the record was closed.
    Completed { offer_id: Hash, status: Status },
    MakerResumed(maker::Handle),
    TakerResumed(taker::Handle),
}

/// Recovers every ongoing swap found in persistence. Failures are logged
/// and the records preserved for the operator; one broken swap never
/// blocks the rest.
pub async fn resume_ongoing_swaps(backend: &Backend) -> Vec<Resumption> {
    let mut resumed = Vec::new();
    for info in backend.manager.get_ongoing_all() {
        let offer_id = info.offer_id;
        match resume_swap(backend, info).await {
            Ok(resumption) => resumed.push(resumption),
            Err(err) => {
                // loud by design: this swap needs an operator
                error!(id = %offer_id, %err, "failed to recover swap; record preserved");
            }
        }
    }
    resumed
}

pub async fn resume_swap(backend: &Backend, info: SwapInfo) -> Result<Resumption, ProtocolError> {
    info!(id = %info.offer_id, status = %info.status, role = ?info.role, "recovering swap");
    match info.role {
        Role::Maker => resume_maker(backend, info).await,
        Role::Taker => resume_taker(backend, info).await,
    }
}

async fn resume_maker(backend: &Backend, info: SwapInfo) -> Result<Resumption, ProtocolError> {
    match info.status {
        Status::XmrLocked | Status::SweepingXmr => {}
        status => {
            return Err(ProtocolError::InvariantViolation(format!(
                "maker swap cannot resume from {status}"
            )))
        }
    }

    let offer_id = info.offer_id;
    let session = SessionKeys::restore(backend.db.get_session_keys(offer_id)?);
    let cp_keys = backend.db.get_counterparty_keys(offer_id)?;
    let contract_info = backend.db.get_contract_swap_info(offer_id)?;

    match reconcile_stage(backend, &contract_info).await? {
        Reconciled::Claimed(_) => {
            // our own claim landed before the crash
            complete(backend, info, Status::CompletedSuccess)?;
            Ok(Resumption::Completed {
                offer_id,
                status: Status::CompletedSuccess,
            })
        }
        Reconciled::Refunded(secret) => {
            let cp_spend = contract_secret_to_spend_key(secret);
            backend.db.put_counterparty_spend_key(offer_id, &cp_spend)?;
            sweep_joint(backend, &info, &session, &cp_spend, &cp_keys).await?;
            complete(backend, info, Status::CompletedRefund)?;
            Ok(Resumption::Completed {
                offer_id,
                status: Status::CompletedRefund,
            })
        }
        Reconciled::Live(_) => {
            let offer = backend.db.get_offer(offer_id)?;
            let use_relayer = match backend.db.get_relayer_info(offer_id) {
                Ok(relayer) => relayer.use_relayer,
                Err(DbError::NotFound(_)) => false,
                Err(err) => return Err(err.into()),
            };
            let handle = maker::resume(
                backend.clone(),
                info,
                offer,
                use_relayer,
                session,
                cp_keys,
                contract_info,
            );
            Ok(Resumption::MakerResumed(handle))
        }
    }
}

async fn resume_taker(backend: &Backend, mut info: SwapInfo) -> Result<Resumption, ProtocolError> {
    match info.status {
        Status::ContractDeploying | Status::EthLocked | Status::ContractReady
        | Status::SweepingXmr => {}
        status => {
            return Err(ProtocolError::InvariantViolation(format!(
                "taker swap cannot resume from {status}"
            )))
        }
    }

    let offer_id = info.offer_id;
    let session = SessionKeys::restore(backend.db.get_session_keys(offer_id)?);
    let cp_keys = backend.db.get_counterparty_keys(offer_id)?;
    let mut contract_info = backend.db.get_contract_swap_info(offer_id)?;

    // a crash during broadcast leaves a provisional record with unknown
    // timeouts; the New log (matched on our commitments) completes it
    if contract_info.swap.timeout0.is_zero() {
        match find_our_new_log(backend, &contract_info).await? {
            Some((swap, start_block)) => {
                contract_info = ContractSwapInfo {
                    swap_id: swap.swap_id(),
                    swap,
                    start_block,
                };
                backend.db.put_contract_swap_info(offer_id, &contract_info)?;
                info.timeout0 = Some(contract_info.swap.timeout0.as_u64());
                info.timeout1 = Some(contract_info.swap.timeout1.as_u64());
                info.set_status(Status::EthLocked);
                write_swap(backend, &info)?;
            }
            None => {
                // broadcast never landed; nothing is locked on-chain
                warn!(id = %offer_id, "escrow creation never landed; closing as aborted");
                complete(backend, info, Status::CompletedAbort)?;
                return Ok(Resumption::Completed {
                    offer_id,
                    status: Status::CompletedAbort,
                });
            }
        }
    }

    match reconcile_stage(backend, &contract_info).await? {
        Reconciled::Claimed(secret) => {
            let cp_spend = contract_secret_to_spend_key(secret);
            backend.db.put_counterparty_spend_key(offer_id, &cp_spend)?;
            sweep_joint(backend, &info, &session, &cp_spend, &cp_keys).await?;
            complete(backend, info, Status::CompletedSuccess)?;
            Ok(Resumption::Completed {
                offer_id,
                status: Status::CompletedSuccess,
            })
        }
        Reconciled::Refunded(_) => {
            // our own refund landed before the crash
            complete(backend, info, Status::CompletedRefund)?;
            Ok(Resumption::Completed {
                offer_id,
                status: Status::CompletedRefund,
            })
        }
        Reconciled::Live(stage) => {
            if stage == Stage::Ready && info.status != Status::ContractReady {
                info.set_status(Status::ContractReady);
                write_swap(backend, &info)?;
            }
            let handle = taker::resume(backend.clone(), info, session, cp_keys, contract_info);
            Ok(Resumption::TakerResumed(handle))
        }
    }
}

enum Reconciled {
    /// `Claimed` log found; carries the revealed claim secret.
    Claimed([u8; 32]),
    /// `Refunded` log found; carries the revealed refund secret.
    Refunded([u8; 32]),
    /// The escrow is still pending or ready.
    Live(Stage),
}

async fn reconcile_stage(
    backend: &Backend,
    contract_info: &ContractSwapInfo,
) -> Result<Reconciled, ProtocolError> {
    let output = backend
        .eth
        .call(
            backend.swap_creator,
            contract::swaps_calldata(contract_info.swap_id),
        )
        .await?;
    let stage = Stage::from_call_output(&output)?;

    match stage {
        Stage::Invalid => Err(ProtocolError::InvariantViolation(format!(
            "escrow {} does not exist on-chain",
            contract_info.swap_id
        ))),
        Stage::Pending | Stage::Ready => Ok(Reconciled::Live(stage)),
        Stage::Completed => {
            if let Some(secret) =
                find_secret_log(backend, contract_info, contract::claimed_topic()).await?
            {
                return Ok(Reconciled::Claimed(secret));
            }
            if let Some(secret) =
                find_secret_log(backend, contract_info, contract::refunded_topic()).await?
            {
                return Ok(Reconciled::Refunded(secret));
            }
            Err(ProtocolError::InvariantViolation(format!(
                "escrow {} completed without a Claimed or Refunded log",
                contract_info.swap_id
            )))
        }
    }
}

async fn find_secret_log(
    backend: &Backend,
    contract_info: &ContractSwapInfo,
    topic: ethers::types::H256,
) -> Result<Option<[u8; 32]>, ProtocolError> {
    let head = backend.eth.block_number().await?;
    let logs = backend
        .eth
        .filter_logs(
            backend.swap_creator,
            topic,
            Some(contract_info.swap_id.to_h256()),
            contract_info.start_block,
            head,
        )
        .await?;
    for log in logs {
        if log.removed == Some(true) {
            continue;
        }
        let (_, secret) = decode_secret_log(&log)?;
        return Ok(Some(secret));
    }
    Ok(None)
}

/// Finds the `New` log of a provisional escrow by matching our commitments.
async fn find_our_new_log(
    backend: &Backend,
    contract_info: &ContractSwapInfo,
) -> Result<Option<(ContractSwap, u64)>, ProtocolError> {
    let head = backend.eth.block_number().await?;
    let logs = backend
        .eth
        .filter_logs(
            backend.swap_creator,
            contract::new_topic(),
            None,
            contract_info.start_block,
            head,
        )
        .await?;
    for log in logs {
        if log.removed == Some(true) {
            continue;
        }
        let decoded = match decode_new_log(&log) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(%err, "undecodable New log during recovery");
                continue;
            }
        };
        if decoded.commit_claim != contract_info.swap.commit_claim
            || decoded.commit_refund != contract_info.swap.commit_refund
            || decoded.value != contract_info.swap.value
            || decoded.asset != contract_info.swap.asset
        {
            continue;
        }
        let swap = ContractSwap {
            timeout0: decoded.timeout0,
            timeout1: decoded.timeout1,
            ..contract_info.swap.clone()
        };
        if swap.swap_id() != decoded.swap_id {
            continue;
        }
        let block = log
            .block_number
            .map(|n| n.as_u64())
            .unwrap_or(contract_info.start_block);
        return Ok(Some((swap, block)));
    }
    Ok(None)
}

async fn sweep_joint(
    backend: &Backend,
    info: &SwapInfo,
    session: &SessionKeys,
    cp_spend: &PrivateSpendKey,
    cp_keys: &CounterpartyKeys,
) -> Result<(), ProtocolError> {
    let joint = PrivateKeyPair::joint(
        &session.key_pair.spend,
        cp_spend,
        &session.key_pair.view,
        &cp_keys.private_view_key,
    );
    let destination = backend.xmr.primary_address().await?;
    let filename = swap_wallet_filename(&info.offer_id.hex());
    sweep_joint_output(
        backend.xmr.as_ref(),
        SweepRequest {
            joint_keys: &joint,
            network: backend.monero_network(),
            restore_height: Some(info.monero_start_height),
            destination: &destination,
            wallet_filename: &filename,
        },
    )
    .await?;
    if let Err(err) = backend.xmr.open_wallet(&backend.wallet_file).await {
        warn!(%err, "failed to reopen primary wallet after recovery sweep");
    }
    Ok(())
}

fn write_swap(backend: &Backend, info: &SwapInfo) -> Result<(), ProtocolError> {
    backend.manager.write_swap(info).map_err(|err| match err {
        crate::swap::SwapError::Storage(db) => ProtocolError::StorageFailed(db),
        crate::swap::SwapError::NotFound => {
            ProtocolError::InvariantViolation("recovered swap missing from manager".into())
        }
    })
}

fn complete(backend: &Backend, mut info: SwapInfo, status: Status) -> Result<(), ProtocolError> {
    info.set_status(status);
    backend
        .manager
        .complete_ongoing(&mut info)
        .map_err(|err| match err {
            crate::swap::SwapError::Storage(db) => ProtocolError::StorageFailed(db),
            crate::swap::SwapError::NotFound => {
                ProtocolError::InvariantViolation("completed swap missing from manager".into())
            }
        })?;

    if status == Status::CompletedSuccess {
        if let Err(err) = backend.db.delete_recovery(info.offer_id) {
            warn!(%err, "failed to purge recovery records");
        }
        if info.role == Role::Maker {
            if let Err(err) = backend.offers.delete(info.offer_id) {
                warn!(%err, "failed to delete taken offer");
            }
        }
    }
    info!(id = %info.offer_id, %status, "swap reconciled from chain state");
    Ok(())
}
