//! Restart recovery and the external-signer abort path.

mod common;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use ethers::types::{Address, U256};
use rust_decimal::Decimal;

use common::{make_party, MockChain, MockLedger, MockNet, MockWallet, ESCROW_ADDRESS};
use swap_core::backend::{Backend, BackendConfig};
use swap_core::coins::{to_base_units, ExchangeRate};
use swap_core::db::Db;
use swap_core::eth::contract::{ContractSwap, ContractSwapInfo};
use swap_core::net::{Message, SendKeysMessage};
use swap_core::offers::Offer;
use swap_core::recovery::{self, Resumption};
use swap_core::sender::{ExternalSender, NewSwapArgs, Sender};
use swap_core::session::{CounterpartyKeys, SessionKeys};
use swap_core::swap::SwapInfo;
use swap_core::types::{Env, EthAsset, Role, Status};
use swap_core::{taker, ProtocolError};
use xmr_wallet::MoneroWallet;

const PICONERO: u64 = 1_000_000_000_000;

fn one_for_ten_offer() -> Offer {
    Offer::new(
        Decimal::ONE,
        Decimal::ONE,
        ExchangeRate::new(Decimal::from_str("0.1").unwrap()).unwrap(),
        EthAsset::Eth,
        false,
    )
    .unwrap()
}

fn keys_message_for(session: &SessionKeys, offer: &Offer, eth_address: Address) -> SendKeysMessage {
    SendKeysMessage {
        offer_id: offer.id(),
        provided_amount: Decimal::ONE,
        public_spend_key: session.public_pair().spend,
        private_view_key: session.key_pair.view.clone(),
        dleq_proof: session.dleq_proof.clone(),
        secp256k1_public_key: session.secp_public(),
        eth_address,
    }
}

/// The maker is killed between persisting the XMR-locked state and seeing
/// `Ready`. On restart, recovery re-enters at `XmrLocked`, the watcher
/// replays the `Ready` log, and the claim lands. A concurrent exit request
/// must not produce a second terminal transition.
#[tokio::test(flavor = "multi_thread")]
async fn maker_recovers_after_crash_following_xmr_lock() {
    let chain = MockChain::new();
    let ledger = MockLedger::new();
    let maker_party = make_party(
        &chain,
        &ledger,
        Address::repeat_byte(0xaa),
        "maker-primary",
        Duration::from_secs(600),
    );
    let taker_party = make_party(
        &chain,
        &ledger,
        Address::repeat_byte(0xbb),
        "taker-primary",
        Duration::from_secs(600),
    );
    ledger.fund("maker-primary", 2 * PICONERO);

    let offer = one_for_ten_offer();
    let offer_id = offer.id();
    maker_party.backend.offers.add(offer.clone()).unwrap();

    let taker_handle = taker::start(
        taker_party.backend.clone(),
        offer.clone(),
        "maker-peer".into(),
        Decimal::from(10),
    )
    .await
    .unwrap();
    let taker_keys = taker_party
        .net
        .wait_for(|msg| match msg {
            Message::SendKeys(keys) => Some(keys.clone()),
            _ => None,
        })
        .await;

    // the maker half ran outside a live state machine: keys were
    // exchanged, the escrow verified and persisted, the XMR locked
    let maker_session = SessionKeys::generate();
    let cp_keys = CounterpartyKeys::from_message(&taker_keys).unwrap();
    let maker_keys = keys_message_for(&maker_session, &offer, Address::repeat_byte(0xaa));
    taker_handle
        .deliver(taker::Event::KeysReceived(maker_keys))
        .await
        .unwrap();
    let locked = taker_party
        .net
        .wait_for(|msg| match msg {
            Message::NotifyEthLocked(body) => Some(body.clone()),
            _ => None,
        })
        .await;

    let db = &maker_party.backend.db;
    db.put_session_keys(offer_id, &maker_session.key_pair).unwrap();
    db.put_counterparty_keys(offer_id, &cp_keys).unwrap();
    db.put_contract_swap_info(
        offer_id,
        &ContractSwapInfo {
            swap_id: locked.contract_swap.swap_id(),
            swap: locked.contract_swap.clone(),
            start_block: locked.start_block,
        },
    )
    .unwrap();

    let mut info = SwapInfo::new(
        offer_id,
        Role::Maker,
        "taker-peer".into(),
        Decimal::ONE,
        Decimal::from(10),
        offer.exchange_rate,
        EthAsset::Eth,
        locked.start_block,
        90,
        Status::KeysExchanged,
    );
    info.timeout0 = Some(locked.contract_swap.timeout0.as_u64());
    info.timeout1 = Some(locked.contract_swap.timeout1.as_u64());
    info.set_status(Status::XmrLocked);
    maker_party.backend.manager.add_swap(&info).unwrap();

    let joint_address = cp_keys
        .public_pair()
        .sum(&maker_session.public_pair())
        .address(monero::Network::Testnet)
        .unwrap()
        .to_string();
    maker_party.xmr.transfer(&joint_address, PICONERO).await.unwrap();

    // the taker meanwhile verified the lock and opened the claim window
    taker_handle
        .deliver(taker::Event::XmrLocked {
            tx_id: "xmr-lock".into(),
            address: joint_address,
        })
        .await
        .unwrap();

    // restart
    let resumption = recovery::resume_swap(&maker_party.backend, info)
        .await
        .unwrap();
    let maker_handle = match resumption {
        Resumption::MakerResumed(handle) => handle,
        _ => panic!("expected a live maker resumption"),
    };

    let exit_handle = maker_handle.clone();
    let exit_task = tokio::spawn(async move { exit_handle.exit().await });

    maker_handle.wait_done().await;
    let _ = exit_task.await.unwrap();
    taker_handle.wait_done().await;

    assert_eq!(
        maker_party
            .backend
            .manager
            .get_past(offer_id)
            .unwrap()
            .status,
        Status::CompletedSuccess
    );
    assert!(!maker_party.backend.manager.has_ongoing(offer_id));
    assert_eq!(
        taker_party
            .backend
            .manager
            .get_past(offer_id)
            .unwrap()
            .status,
        Status::CompletedSuccess
    );

    assert_eq!(
        chain.balance_of(Address::repeat_byte(0xaa)),
        U256::exp10(20) + U256::exp10(19)
    );
    assert_eq!(ledger.balance_of("taker-primary"), PICONERO);
}

/// The taker crashed right after broadcasting `new_swap`: only the
/// provisional escrow record (unknown timeouts) survived. Recovery matches
/// the `New` log by commitment and completes the record.
#[tokio::test(flavor = "multi_thread")]
async fn taker_recovers_provisional_escrow_from_new_log() {
    let chain = MockChain::new();
    let ledger = MockLedger::new();
    let taker_party = make_party(
        &chain,
        &ledger,
        Address::repeat_byte(0xbb),
        "taker-primary",
        Duration::from_secs(600),
    );

    let offer = one_for_ten_offer();
    let offer_id = offer.id();
    let taker_session = SessionKeys::generate();
    let ghost_maker = SessionKeys::generate();
    let cp_keys =
        CounterpartyKeys::from_message(&keys_message_for(&ghost_maker, &offer, Address::repeat_byte(0xaa)))
            .unwrap();

    let db = &taker_party.backend.db;
    db.put_session_keys(offer_id, &taker_session.key_pair).unwrap();
    db.put_counterparty_keys(offer_id, &cp_keys).unwrap();

    let value = to_base_units(&Decimal::from(10), 18).unwrap();
    let nonce = U256::from(4242);
    let provisional = ContractSwap {
        owner: Address::repeat_byte(0xbb),
        claimer: Address::repeat_byte(0xaa),
        commit_claim: cp_keys.commitment().unwrap(),
        commit_refund: taker_session.commitment().unwrap(),
        timeout0: U256::zero(),
        timeout1: U256::zero(),
        asset: Address::zero(),
        value,
        nonce,
    };
    db.put_contract_swap_info(
        offer_id,
        &ContractSwapInfo {
            swap_id: provisional.swap_id(),
            swap: provisional.clone(),
            start_block: 1,
        },
    )
    .unwrap();

    let info = SwapInfo::new(
        offer_id,
        Role::Taker,
        "maker-peer".into(),
        Decimal::from(10),
        Decimal::ONE,
        offer.exchange_rate,
        EthAsset::Eth,
        1,
        90,
        Status::ContractDeploying,
    );
    taker_party.backend.manager.add_swap(&info).unwrap();

    // the broadcast did land before the crash
    taker_party
        .backend
        .sender
        .new_swap(&NewSwapArgs {
            commit_claim: provisional.commit_claim,
            commit_refund: provisional.commit_refund,
            claimer: provisional.claimer,
            timeout_duration_0: U256::from(600),
            timeout_duration_1: U256::from(600),
            asset: EthAsset::Eth,
            value,
            nonce,
        })
        .await
        .unwrap();

    let resumption = recovery::resume_swap(&taker_party.backend, info)
        .await
        .unwrap();
    let taker_handle = match resumption {
        Resumption::TakerResumed(handle) => handle,
        _ => panic!("expected a live taker resumption"),
    };

    // the record now carries the real timeouts and status
    let contract_info = db.get_contract_swap_info(offer_id).unwrap();
    assert!(!contract_info.swap.timeout0.is_zero());
    assert_eq!(
        taker_party
            .backend
            .manager
            .get_ongoing(offer_id)
            .unwrap()
            .status,
        Status::EthLocked
    );

    // nothing else is going to happen; exit refunds while still refundable
    taker_handle.exit().await.unwrap();
    taker_handle.wait_done().await;
    assert_eq!(
        taker_party
            .backend
            .manager
            .get_past(offer_id)
            .unwrap()
            .status,
        Status::CompletedRefund
    );
    assert_eq!(
        chain.balance_of(Address::repeat_byte(0xbb)),
        U256::exp10(20)
    );
}

/// A swap in a status recovery cannot resume is reported, not deleted.
#[tokio::test(flavor = "multi_thread")]
async fn unresumable_status_is_preserved() {
    let chain = MockChain::new();
    let ledger = MockLedger::new();
    let maker_party = make_party(
        &chain,
        &ledger,
        Address::repeat_byte(0xaa),
        "maker-primary",
        Duration::from_secs(600),
    );

    let offer = one_for_ten_offer();
    let offer_id = offer.id();
    let info = SwapInfo::new(
        offer_id,
        Role::Maker,
        "peer".into(),
        Decimal::ONE,
        Decimal::from(10),
        offer.exchange_rate,
        EthAsset::Eth,
        1,
        90,
        Status::KeysExchanged,
    );
    maker_party.backend.manager.add_swap(&info).unwrap();

    let err = recovery::resume_swap(&maker_party.backend, info)
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::InvariantViolation(_)));

    // the record is still there for the operator
    assert!(maker_party.backend.manager.has_ongoing(offer_id));
    assert!(maker_party.backend.db.get_swap(offer_id).is_ok());
}

/// External-signer variant: the user never signs, `new_swap` times out,
/// and the swap aborts with no on-chain footprint.
#[tokio::test(flavor = "multi_thread")]
async fn external_signer_timeout_aborts_taker_swap() {
    let chain = MockChain::new();
    let ledger = MockLedger::new();

    let db_dir = tempfile::TempDir::new().unwrap();
    let db = Arc::new(Db::open(db_dir.path()).unwrap());
    let eth = chain.client(Address::repeat_byte(0xbb));
    let xmr = MockWallet::new(ledger.clone(), "primary", "taker-primary");
    let net = MockNet::new();
    let (external, _signer_channels) = ExternalSender::new(Env::Development, eth.clone(), ESCROW_ADDRESS);
    let external = external.with_sign_timeout(Duration::from_millis(50));

    let backend = Backend::new(BackendConfig {
        env: Env::Development,
        eth,
        xmr,
        db,
        net,
        sender: Arc::new(external),
        swap_creator: ESCROW_ADDRESS,
        wallet_file: "primary".to_string(),
        contract_timeout: Duration::from_secs(600),
    })
    .unwrap();

    let offer = one_for_ten_offer();
    let offer_id = offer.id();
    let taker_handle = taker::start(backend.clone(), offer.clone(), "maker-peer".into(), Decimal::from(10))
        .await
        .unwrap();

    let ghost_maker = SessionKeys::generate();
    let maker_keys = keys_message_for(&ghost_maker, &offer, Address::repeat_byte(0xaa));
    let err = taker_handle
        .deliver(taker::Event::KeysReceived(maker_keys))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::SignTimeout));

    taker_handle.wait_done().await;
    assert_eq!(
        backend.manager.get_past(offer_id).unwrap().status,
        Status::CompletedAbort
    );
    // nothing reached the chain
    assert_eq!(chain.escrow_count(), 0);
}
