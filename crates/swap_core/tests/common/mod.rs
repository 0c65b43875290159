//! In-memory fakes driving the protocol end-to-end: an escrow-simulating
//! EVM chain, a shared Monero ledger, and a recording network.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::types::{Address, Bytes, Log, TransactionReceipt, H256, U256, U64};
use ethers::utils::keccak256;

use swap_core::backend::{Backend, BackendConfig};
use swap_core::db::Db;
use swap_core::eth::client::{EthClient, EthError, UnsignedTx};
use swap_core::eth::contract::ContractSwap;
use swap_core::net::{Message, Net, NetError, RelayClaimRequest, RelayClaimResponse};
use swap_core::sender::{InternalSender, Sender};
use swap_core::types::{Env, Hash, PeerId};
use xmr_wallet::{Balance, MoneroWallet, RestoreWalletArgs, TransferReceipt};

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

// ---------------------------------------------------------------------------
// EVM fake
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SwapStage {
    Pending,
    Ready,
    Completed,
}

struct EscrowEntry {
    swap: ContractSwap,
    stage: SwapStage,
}

pub struct ChainState {
    block: u64,
    escrows: HashMap<Hash, EscrowEntry>,
    logs: Vec<Log>,
    pub eth_balances: HashMap<Address, U256>,
}

/// One simulated chain shared by every client in a test.
pub struct MockChain {
    state: Mutex<ChainState>,
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ChainState {
                block: 1,
                escrows: HashMap::new(),
                logs: Vec::new(),
                eth_balances: HashMap::new(),
            }),
        })
    }

    pub fn client(self: &Arc<Self>, address: Address) -> Arc<ChainClient> {
        self.state
            .lock()
            .unwrap()
            .eth_balances
            .insert(address, U256::exp10(20)); // 100 ETH
        Arc::new(ChainClient {
            chain: self.clone(),
            address,
        })
    }

    pub fn balance_of(&self, address: Address) -> U256 {
        self.state
            .lock()
            .unwrap()
            .eth_balances
            .get(&address)
            .copied()
            .unwrap_or_default()
    }

    pub fn escrow_count(&self) -> usize {
        self.state.lock().unwrap().escrows.len()
    }

    pub fn stage_of(&self, swap_id: Hash) -> Option<SwapStage> {
        self.state
            .lock()
            .unwrap()
            .escrows
            .get(&swap_id)
            .map(|entry| entry.stage)
    }

    fn emit(state: &mut ChainState, topic0: H256, swap_id: Hash, data: Vec<u8>) -> Log {
        state.block += 1;
        let log = Log {
            address: Address::repeat_byte(0xcc),
            topics: vec![topic0, swap_id.to_h256()],
            data: Bytes::from(data),
            block_number: Some(U64::from(state.block)),
            transaction_hash: Some(H256::from(keccak256(
                [swap_id.as_bytes().as_slice(), &state.block.to_be_bytes()].concat(),
            ))),
            removed: Some(false),
            ..Default::default()
        };
        state.logs.push(log.clone());
        log
    }

    fn receipt(block: u64, logs: Vec<Log>) -> TransactionReceipt {
        TransactionReceipt {
            status: Some(1.into()),
            block_number: Some(U64::from(block)),
            logs,
            ..Default::default()
        }
    }

    /// Commitment check mirroring the contract: Keccak of the uncompressed
    /// secp256k1 point of `secret`·G.
    fn verify_commitment(secret_be: [u8; 32], commitment: [u8; 32]) -> bool {
        let mut le = secret_be;
        le.reverse();
        let secret = dleq::Secret::from_bytes(le);
        let proof = dleq::Proof::new(&secret);
        match dleq::secp_commitment(&proof.pub_secp256k1) {
            Ok(computed) => computed == commitment,
            Err(_) => false,
        }
    }

    fn handle_tx(&self, caller: Address, tx: &UnsignedTx) -> Result<TransactionReceipt, EthError> {
        let mut state = self.state.lock().unwrap();
        let selector: [u8; 4] = tx.data[..4].try_into().unwrap();
        let body = &tx.data[4..];
        let now = now_unix();

        let sel = |sig: &str| -> [u8; 4] {
            let hash = keccak256(sig.as_bytes());
            [hash[0], hash[1], hash[2], hash[3]]
        };
        const TUPLE: &str =
            "(address,address,bytes32,bytes32,uint256,uint256,address,uint256,uint256)";

        if selector == sel("new_swap(bytes32,bytes32,address,uint256,uint256,address,uint256,uint256)") {
            let tokens = abi::decode(
                &[
                    ParamType::FixedBytes(32),
                    ParamType::FixedBytes(32),
                    ParamType::Address,
                    ParamType::Uint(256),
                    ParamType::Uint(256),
                    ParamType::Address,
                    ParamType::Uint(256),
                    ParamType::Uint(256),
                ],
                body,
            )
            .unwrap();
            let commit_claim = as_bytes32(&tokens[0]);
            let commit_refund = as_bytes32(&tokens[1]);
            let claimer = as_address(&tokens[2]);
            let d0 = as_uint(&tokens[3]);
            let d1 = as_uint(&tokens[4]);
            let asset = as_address(&tokens[5]);
            let value = as_uint(&tokens[6]);
            let nonce = as_uint(&tokens[7]);

            if asset == Address::zero() && tx.value != value {
                return Err(EthError::Reverted {
                    reason: "value mismatch".into(),
                });
            }

            let swap = ContractSwap {
                owner: caller,
                claimer,
                commit_claim,
                commit_refund,
                timeout0: U256::from(now) + d0,
                timeout1: U256::from(now) + d0 + d1,
                asset,
                value,
                nonce,
            };
            let swap_id = swap.swap_id();
            if state.escrows.contains_key(&swap_id) {
                return Err(EthError::Reverted {
                    reason: "swap already exists".into(),
                });
            }

            let balance = state.eth_balances.entry(caller).or_default();
            if *balance < value {
                return Err(EthError::Reverted {
                    reason: "insufficient balance".into(),
                });
            }
            *balance -= value;

            let data = abi::encode(&[
                Token::FixedBytes(commit_claim.to_vec()),
                Token::FixedBytes(commit_refund.to_vec()),
                Token::Uint(swap.timeout0),
                Token::Uint(swap.timeout1),
                Token::Address(asset),
                Token::Uint(value),
            ]);
            let log = Self::emit(
                &mut state,
                swap_core::eth::contract::new_topic(),
                swap_id,
                data,
            );
            state.escrows.insert(
                swap_id,
                EscrowEntry {
                    swap,
                    stage: SwapStage::Pending,
                },
            );
            let block = state.block;
            return Ok(Self::receipt(block, vec![log]));
        }

        if selector == sel(&format!("set_ready({TUPLE})")) {
            let swap = decode_swap_tuple(body, 0);
            let swap_id = swap.swap_id();
            let entry = state
                .escrows
                .get_mut(&swap_id)
                .ok_or_else(|| EthError::Reverted {
                    reason: "swap does not exist".into(),
                })?;
            if caller != entry.swap.owner {
                return Err(EthError::Reverted {
                    reason: "only the owner can set ready".into(),
                });
            }
            if entry.stage != SwapStage::Pending || U256::from(now) >= entry.swap.timeout0 {
                return Err(EthError::Reverted {
                    reason: "swap is not pending".into(),
                });
            }
            entry.stage = SwapStage::Ready;
            let log = Self::emit(
                &mut state,
                swap_core::eth::contract::ready_topic(),
                swap_id,
                vec![],
            );
            let block = state.block;
            return Ok(Self::receipt(block, vec![log]));
        }

        if selector == sel(&format!("claim({TUPLE},bytes32)")) {
            let swap = decode_swap_tuple(body, 0);
            let secret = last_word(body);
            let swap_id = swap.swap_id();
            let entry = state
                .escrows
                .get_mut(&swap_id)
                .ok_or_else(|| EthError::Reverted {
                    reason: "swap does not exist".into(),
                })?;
            if entry.stage == SwapStage::Completed {
                return Err(EthError::Reverted {
                    reason: "relayed transaction failed on simulation".into(),
                });
            }
            if caller != entry.swap.claimer {
                return Err(EthError::Reverted {
                    reason: "only the claimer can claim".into(),
                });
            }
            let now = U256::from(now);
            let window_open = entry.stage == SwapStage::Ready || now >= entry.swap.timeout0;
            if !window_open || now >= entry.swap.timeout1 {
                return Err(EthError::Reverted {
                    reason: "claim window closed".into(),
                });
            }
            if !Self::verify_commitment(secret, entry.swap.commit_claim) {
                return Err(EthError::Reverted {
                    reason: "invalid claim secret".into(),
                });
            }
            entry.stage = SwapStage::Completed;
            let value = entry.swap.value;
            let claimer = entry.swap.claimer;
            *state.eth_balances.entry(claimer).or_default() += value;
            let data = abi::encode(&[Token::FixedBytes(secret.to_vec())]);
            let log = Self::emit(
                &mut state,
                swap_core::eth::contract::claimed_topic(),
                swap_id,
                data,
            );
            let block = state.block;
            return Ok(Self::receipt(block, vec![log]));
        }

        if selector == sel(&format!("refund({TUPLE},bytes32)")) {
            let swap = decode_swap_tuple(body, 0);
            let secret = last_word(body);
            let swap_id = swap.swap_id();
            let entry = state
                .escrows
                .get_mut(&swap_id)
                .ok_or_else(|| EthError::Reverted {
                    reason: "swap does not exist".into(),
                })?;
            if entry.stage == SwapStage::Completed {
                return Err(EthError::Reverted {
                    reason: "swap already completed".into(),
                });
            }
            if caller != entry.swap.owner {
                return Err(EthError::Reverted {
                    reason: "only the owner can refund".into(),
                });
            }
            let now = U256::from(now);
            let before_ready_window = entry.stage == SwapStage::Pending && now < entry.swap.timeout0;
            if !(before_ready_window || now >= entry.swap.timeout1) {
                return Err(EthError::Reverted {
                    reason: "refund window closed".into(),
                });
            }
            if !Self::verify_commitment(secret, entry.swap.commit_refund) {
                return Err(EthError::Reverted {
                    reason: "invalid refund secret".into(),
                });
            }
            entry.stage = SwapStage::Completed;
            let value = entry.swap.value;
            let owner = entry.swap.owner;
            *state.eth_balances.entry(owner).or_default() += value;
            let data = abi::encode(&[Token::FixedBytes(secret.to_vec())]);
            let log = Self::emit(
                &mut state,
                swap_core::eth::contract::refunded_topic(),
                swap_id,
                data,
            );
            let block = state.block;
            return Ok(Self::receipt(block, vec![log]));
        }

        // approve and anything else succeed without effect
        state.block += 1;
        Ok(Self::receipt(state.block, vec![]))
    }
}

fn as_bytes32(token: &Token) -> [u8; 32] {
    match token {
        Token::FixedBytes(bytes) => bytes.as_slice().try_into().unwrap(),
        other => panic!("expected bytes32, got {other:?}"),
    }
}

fn as_address(token: &Token) -> Address {
    match token {
        Token::Address(address) => *address,
        other => panic!("expected address, got {other:?}"),
    }
}

fn as_uint(token: &Token) -> U256 {
    match token {
        Token::Uint(value) => *value,
        other => panic!("expected uint, got {other:?}"),
    }
}

fn decode_swap_tuple(body: &[u8], offset_words: usize) -> ContractSwap {
    let start = offset_words * 32;
    let tokens = abi::decode(
        &[ParamType::Tuple(vec![
            ParamType::Address,
            ParamType::Address,
            ParamType::FixedBytes(32),
            ParamType::FixedBytes(32),
            ParamType::Uint(256),
            ParamType::Uint(256),
            ParamType::Address,
            ParamType::Uint(256),
            ParamType::Uint(256),
        ])],
        &body[start..start + 9 * 32],
    )
    .unwrap();
    let fields = match &tokens[0] {
        Token::Tuple(fields) => fields.clone(),
        other => panic!("expected tuple, got {other:?}"),
    };
    ContractSwap {
        owner: as_address(&fields[0]),
        claimer: as_address(&fields[1]),
        commit_claim: as_bytes32(&fields[2]),
        commit_refund: as_bytes32(&fields[3]),
        timeout0: as_uint(&fields[4]),
        timeout1: as_uint(&fields[5]),
        asset: as_address(&fields[6]),
        value: as_uint(&fields[7]),
        nonce: as_uint(&fields[8]),
    }
}

fn last_word(body: &[u8]) -> [u8; 32] {
    body[body.len() - 32..].try_into().unwrap()
}

/// Per-party view of the shared chain.
pub struct ChainClient {
    chain: Arc<MockChain>,
    address: Address,
}

#[async_trait]
impl EthClient for ChainClient {
    fn local_address(&self) -> Address {
        self.address
    }

    async fn block_number(&self) -> Result<u64, EthError> {
        Ok(self.chain.state.lock().unwrap().block)
    }

    async fn latest_timestamp(&self) -> Result<u64, EthError> {
        Ok(now_unix())
    }

    async fn filter_logs(
        &self,
        _contract: Address,
        topic0: H256,
        swap_id: Option<H256>,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<Log>, EthError> {
        Ok(self
            .chain
            .state
            .lock()
            .unwrap()
            .logs
            .iter()
            .filter(|log| {
                let block = log.block_number.unwrap_or_default().as_u64();
                log.topics.first() == Some(&topic0)
                    && block >= from_block
                    && block <= to_block
                    && swap_id.map_or(true, |id| log.topics.get(1) == Some(&id))
            })
            .cloned()
            .collect())
    }

    async fn send_transaction(&self, tx: UnsignedTx) -> Result<TransactionReceipt, EthError> {
        self.chain.handle_tx(self.address, &tx)
    }

    async fn receipt_for(&self, _tx_hash: H256) -> Result<TransactionReceipt, EthError> {
        Ok(TransactionReceipt {
            status: Some(1.into()),
            ..Default::default()
        })
    }

    async fn call(&self, _to: Address, data: Vec<u8>) -> Result<Vec<u8>, EthError> {
        // the only view is swaps(bytes32)
        let swap_id = Hash(last_word(&data));
        let stage = self.chain.stage_of(swap_id);
        let mut word = [0u8; 32];
        word[31] = match stage {
            None => 0,
            Some(SwapStage::Pending) => 1,
            Some(SwapStage::Ready) => 2,
            Some(SwapStage::Completed) => 3,
        };
        Ok(word.to_vec())
    }

    async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>, EthError> {
        Ok(keccak256(message).to_vec())
    }
}

// ---------------------------------------------------------------------------
// Monero fake
// ---------------------------------------------------------------------------

pub struct Ledger {
    height: u64,
    balances: HashMap<String, u64>,
}

/// One simulated Monero chain shared by both parties' wallets.
pub struct MockLedger {
    inner: Mutex<Ledger>,
}

impl MockLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Ledger {
                height: 100,
                balances: HashMap::new(),
            }),
        })
    }

    pub fn fund(&self, address: &str, amount: u64) {
        *self
            .inner
            .lock()
            .unwrap()
            .balances
            .entry(address.to_string())
            .or_default() += amount;
    }

    pub fn balance_of(&self, address: &str) -> u64 {
        self.inner
            .lock()
            .unwrap()
            .balances
            .get(address)
            .copied()
            .unwrap_or_default()
    }
}

struct WalletFiles {
    open: String,
    addresses: HashMap<String, String>,
}

/// A wallet-RPC fake bound to one party; wallets restored from keys map a
/// filename to the address whose balance they see.
pub struct MockWallet {
    ledger: Arc<MockLedger>,
    files: Mutex<WalletFiles>,
}

impl MockWallet {
    pub fn new(ledger: Arc<MockLedger>, primary_file: &str, primary_address: &str) -> Arc<Self> {
        let mut addresses = HashMap::new();
        addresses.insert(primary_file.to_string(), primary_address.to_string());
        Arc::new(Self {
            ledger,
            files: Mutex::new(WalletFiles {
                open: primary_file.to_string(),
                addresses,
            }),
        })
    }

    fn open_address(&self) -> String {
        let files = self.files.lock().unwrap();
        files.addresses.get(&files.open).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl MoneroWallet for MockWallet {
    async fn get_height(&self) -> xmr_wallet::Result<u64> {
        Ok(self.ledger.inner.lock().unwrap().height)
    }

    async fn refresh(&self, _start_height: Option<u64>) -> xmr_wallet::Result<()> {
        Ok(())
    }

    async fn primary_address(&self) -> xmr_wallet::Result<String> {
        Ok(self.open_address())
    }

    async fn balance(&self) -> xmr_wallet::Result<Balance> {
        let amount = self.ledger.balance_of(&self.open_address());
        Ok(Balance {
            total: amount,
            unlocked: amount,
        })
    }

    async fn transfer(&self, address: &str, amount: u64) -> xmr_wallet::Result<TransferReceipt> {
        let from = self.open_address();
        let mut ledger = self.ledger.inner.lock().unwrap();
        let balance = ledger.balances.entry(from).or_default();
        if *balance < amount {
            return Err(anyhow::anyhow!("insufficient funds").into());
        }
        *balance -= amount;
        *ledger.balances.entry(address.to_string()).or_default() += amount;
        ledger.height += 1;
        Ok(TransferReceipt {
            tx_hash: format!("xmr-tx-{}", ledger.height),
            fee: 0,
        })
    }

    async fn open_wallet(&self, filename: &str) -> xmr_wallet::Result<()> {
        let mut files = self.files.lock().unwrap();
        if !files.addresses.contains_key(filename) {
            return Err(anyhow::anyhow!("no such wallet: {filename}").into());
        }
        files.open = filename.to_string();
        Ok(())
    }

    async fn generate_from_keys(&self, args: RestoreWalletArgs) -> xmr_wallet::Result<()> {
        let mut files = self.files.lock().unwrap();
        files
            .addresses
            .insert(args.filename.clone(), args.address.clone());
        files.open = args.filename;
        Ok(())
    }

    async fn sweep_all(&self, destination: &str) -> xmr_wallet::Result<Vec<String>> {
        let from = self.open_address();
        let mut ledger = self.ledger.inner.lock().unwrap();
        let amount = ledger.balances.remove(&from).unwrap_or_default();
        if amount == 0 {
            return Err(anyhow::anyhow!("nothing to sweep").into());
        }
        *ledger
            .balances
            .entry(destination.to_string())
            .or_default() += amount;
        ledger.height += 1;
        Ok(vec![format!("sweep-tx-{}", ledger.height)])
    }
}

// ---------------------------------------------------------------------------
// Net fake
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MockNet {
    sent: Mutex<Vec<(PeerId, Message)>>,
}

impl MockNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn take_messages(&self) -> Vec<(PeerId, Message)> {
        std::mem::take(&mut self.sent.lock().unwrap())
    }

    /// Waits until a message satisfying `pick` shows up.
    pub async fn wait_for<T>(&self, mut pick: impl FnMut(&Message) -> Option<T>) -> T {
        loop {
            {
                let mut sent = self.sent.lock().unwrap();
                if let Some(pos) = sent.iter().position(|(_, msg)| pick(msg).is_some()) {
                    let (_, msg) = sent.remove(pos);
                    return pick(&msg).unwrap();
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

#[async_trait]
impl Net for MockNet {
    async fn send_swap_message(
        &self,
        to: &PeerId,
        msg: Message,
        _offer_id: Hash,
    ) -> Result<(), NetError> {
        self.sent.lock().unwrap().push((to.clone(), msg));
        Ok(())
    }

    async fn submit_claim_to_relayer(
        &self,
        _req: RelayClaimRequest,
    ) -> Result<RelayClaimResponse, NetError> {
        Err(NetError::NoRelayer)
    }

    fn close_protocol_stream(&self, _offer_id: Hash) {}
}

// ---------------------------------------------------------------------------
// Backend assembly
// ---------------------------------------------------------------------------

pub struct Party {
    pub backend: Backend,
    pub net: Arc<MockNet>,
    pub eth: Arc<ChainClient>,
    pub xmr: Arc<MockWallet>,
    pub db_dir: tempfile::TempDir,
}

pub const ESCROW_ADDRESS: Address = Address::repeat_byte(0xcc);

pub fn make_party(
    chain: &Arc<MockChain>,
    ledger: &Arc<MockLedger>,
    eth_address: Address,
    primary_xmr_address: &str,
    contract_timeout: Duration,
) -> Party {
    let db_dir = tempfile::TempDir::new().unwrap();
    let db = Arc::new(Db::open(db_dir.path()).unwrap());
    let eth = chain.client(eth_address);
    let xmr = MockWallet::new(ledger.clone(), "primary", primary_xmr_address);
    let net = MockNet::new();
    let sender: Arc<dyn Sender> = Arc::new(InternalSender::new(eth.clone(), ESCROW_ADDRESS));

    let backend = Backend::new(BackendConfig {
        env: Env::Development,
        eth: eth.clone(),
        xmr: xmr.clone(),
        db,
        net: net.clone(),
        sender,
        swap_creator: ESCROW_ADDRESS,
        wallet_file: "primary".to_string(),
        contract_timeout,
    })
    .unwrap();

    Party {
        backend,
        net,
        eth,
        xmr,
        db_dir,
    }
}
