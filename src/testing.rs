//! Fixtures shared by unit and integration tests.
//!
//! A 2-of-3 test federation, block factories, an in-memory header chain, block store and
//! wallet repository, and `TestWallet`, which wires them to a started wallet manager.

use crate::chain::{
	BlockStore, BlockStoreError, ChainIndexer, ChainedHeader, DepositId, OpReturnWithdrawalExtractor,
};
use crate::config::{FederationWalletSettings, MultisigParams};
use crate::transaction::builder::op_return_output;
use crate::wallet::sync::repositories::WalletRepository;
use crate::wallet::sync::WalletSyncManager;
use crate::wallet::{FederationWalletManager, SpendingDetails, UtxoRecord, Wallet, WalletError};

use bitcoin::absolute::LockTime;
use bitcoin::block::{Header, Version as BlockVersion};
use bitcoin::hashes::Hash;
use bitcoin::script::Builder;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{
	Amount, Block, BlockHash, CompactTarget, Network, OutPoint, PubkeyHash, PublicKey, ScriptBuf,
	Sequence, Transaction, TxIn, TxMerkleNode, TxOut, Txid, Witness,
};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Timestamp of the test genesis block.
pub const GENESIS_TIME: u32 = 1_600_000_000;
/// Seconds between consecutive test blocks.
pub const BLOCK_INTERVAL: u32 = 600;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The three federation keys, secrets `[1; 32]`, `[2; 32]` and `[3; 32]`.
pub fn federation_keys() -> Vec<(SecretKey, PublicKey)> {
	let secp = Secp256k1::signing_only();
	(1u8..=3)
		.map(|n| {
			let secret = SecretKey::from_slice(&[n; 32]).expect("valid secret");
			(secret, PublicKey::new(secret.public_key(&secp)))
		})
		.collect()
}

/// A 2-of-3 federation seen from one member.
#[derive(Debug, Clone)]
pub struct TestFederation {
	keys: Vec<(SecretKey, PublicKey)>,
	params: MultisigParams,
	member: usize,
}

impl Default for TestFederation {
	fn default() -> Self {
		Self::new()
	}
}

impl TestFederation {
	/// The federation as seen by the first member.
	pub fn new() -> Self {
		Self::for_member(0)
	}

	pub fn for_member(member: usize) -> Self {
		Self::from_keys(federation_keys(), member)
	}

	/// Federation whose first member holds `secret`, e.g. one derived from a mnemonic.
	pub fn with_member_secret(secret: SecretKey) -> Self {
		let mut keys = federation_keys();
		let secp = Secp256k1::signing_only();
		keys[0] = (secret, PublicKey::new(secret.public_key(&secp)));
		Self::from_keys(keys, 0)
	}

	fn from_keys(keys: Vec<(SecretKey, PublicKey)>, member: usize) -> Self {
		let public_keys: Vec<PublicKey> = keys.iter().map(|(_, pk)| *pk).collect();
		let script = MultisigParams::redeem_script_for(2, &public_keys);
		let params = MultisigParams::new(script, public_keys[member]).expect("member key in script");
		Self {
			keys,
			params,
			member,
		}
	}

	pub fn params(&self) -> MultisigParams {
		self.params.clone()
	}

	pub fn script_pubkey(&self) -> ScriptBuf {
		self.params.script_pubkey()
	}

	pub fn member_secret(&self) -> SecretKey {
		self.keys[self.member].0
	}

	pub fn secret(&self, index: usize) -> SecretKey {
		self.keys[index].0
	}

	/// Unsigned version 2 transaction over the given inputs and outputs.
	pub fn transaction(&self, inputs: Vec<OutPoint>, outputs: Vec<TxOut>) -> Transaction {
		Transaction {
			version: Version::TWO,
			lock_time: LockTime::ZERO,
			input: inputs
				.into_iter()
				.map(|previous_output| TxIn {
					previous_output,
					script_sig: ScriptBuf::new(),
					sequence: Sequence::MAX,
					witness: Witness::new(),
				})
				.collect(),
			output: outputs,
		}
	}

	/// Deposit of `sats` into the federation from an outside coin; `nonce` keeps txids apart.
	pub fn deposit(&self, sats: u64, nonce: u32) -> Transaction {
		self.transaction(
			vec![OutPoint::new(Txid::from_byte_array([0xde; 32]), nonce)],
			vec![TxOut {
				value: Amount::from_sat(sats),
				script_pubkey: self.script_pubkey(),
			}],
		)
	}

	/// Withdrawal paying `sats` to an outside address for `deposit_id`, with optional change.
	pub fn withdrawal(
		&self,
		inputs: Vec<OutPoint>,
		deposit_id: DepositId,
		sats: u64,
		change_sats: Option<u64>,
	) -> Transaction {
		let mut outputs = vec![
			TxOut {
				value: Amount::from_sat(sats),
				script_pubkey: p2pkh_script(0x77),
			},
			op_return_output(deposit_id),
		];
		if let Some(change) = change_sats {
			outputs.push(TxOut {
				value: Amount::from_sat(change),
				script_pubkey: self.script_pubkey(),
			});
		}
		self.transaction(inputs, outputs)
	}

	pub fn extractor(&self, network: Network) -> OpReturnWithdrawalExtractor {
		OpReturnWithdrawalExtractor::new(self.script_pubkey(), network)
	}
}

/// P2PKH script for a made-up key hash `[n; 20]`.
pub fn p2pkh_script(n: u8) -> ScriptBuf {
	ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([n; 20]))
}

pub fn txid(n: u8) -> Txid {
	Txid::from_byte_array([n; 32])
}

/// Txid whose displayed hex starts with `prefix` and is zero otherwise.
pub fn txid_from_display_prefix(prefix: u8) -> Txid {
	let mut bytes = [0u8; 32];
	bytes[31] = prefix;
	Txid::from_byte_array(bytes)
}

pub fn fixed_time() -> DateTime<Utc> {
	DateTime::from_timestamp(i64::from(GENESIS_TIME), 0).unwrap_or_default()
}

/// Unspent federation record with a fixed creation time.
pub fn record(id: Txid, index: u32, sats: u64, block_height: Option<u32>) -> UtxoRecord {
	UtxoRecord {
		id,
		index,
		amount: Amount::from_sat(sats),
		script_pub_key: TestFederation::new().script_pubkey(),
		block_height,
		block_hash: block_height.map(|h| BlockHash::from_byte_array([h as u8; 32])),
		creation_time: fixed_time(),
		spending_details: None,
	}
}

/// Spend by `transaction_id` without payments or withdrawal.
pub fn spend(transaction_id: Txid, block_height: Option<u32>) -> SpendingDetails {
	SpendingDetails {
		transaction_id,
		payments: Vec::new(),
		block_height,
		block_hash: block_height.map(|h| BlockHash::from_byte_array([h as u8; 32])),
		creation_time: fixed_time(),
		withdrawal_details: None,
	}
}

/// Settings tuned for tests: fast block fetch retries.
pub fn settings() -> FederationWalletSettings {
	FederationWalletSettings {
		block_fetch_retries: 3,
		block_fetch_retry_interval_ms: 1,
		..FederationWalletSettings::default()
	}
}

fn coinbase(height: u32, branch: u8) -> Transaction {
	Transaction {
		version: Version::TWO,
		lock_time: LockTime::ZERO,
		input: vec![TxIn {
			previous_output: OutPoint::null(),
			script_sig: Builder::new()
				.push_int(i64::from(height))
				.push_int(i64::from(branch))
				.into_script(),
			sequence: Sequence::MAX,
			witness: Witness::new(),
		}],
		output: vec![TxOut {
			value: Amount::from_sat(50 * 100_000_000),
			script_pubkey: p2pkh_script(0xcc),
		}],
	}
}

/// Block at `height` on top of `prev`, with a coinbase tagged by height and branch.
///
/// Timestamps only depend on the height, so the same transaction confirms at the same
/// time on competing branches.
pub fn make_block(prev: BlockHash, height: u32, branch: u8, txs: Vec<Transaction>) -> Block {
	let mut txdata = vec![coinbase(height, branch)];
	txdata.extend(txs);

	let mut block = Block {
		header: Header {
			version: BlockVersion::TWO,
			prev_blockhash: prev,
			merkle_root: TxMerkleNode::all_zeros(),
			time: GENESIS_TIME + height * BLOCK_INTERVAL,
			bits: CompactTarget::from_consensus(0x207f_ffff),
			nonce: 0,
		},
		txdata,
	};
	if let Some(root) = block.compute_merkle_root() {
		block.header.merkle_root = root;
	}
	block
}

pub fn genesis_block() -> Block {
	make_block(BlockHash::all_zeros(), 0, 0, Vec::new())
}

pub fn genesis_header() -> ChainedHeader {
	ChainedHeader::new(0, genesis_block().header)
}

#[derive(Default)]
struct ChainState {
	headers: HashMap<BlockHash, ChainedHeader>,
	/// Main chain hashes indexed by height
	main: Vec<BlockHash>,
}

/// Header tree with a selectable main chain.
pub struct InMemoryChain {
	state: Mutex<ChainState>,
}

impl Default for InMemoryChain {
	fn default() -> Self {
		Self::new()
	}
}

impl InMemoryChain {
	/// Chain holding only the test genesis block.
	pub fn new() -> Self {
		let genesis = genesis_header();
		let mut state = ChainState::default();
		state.headers.insert(genesis.hash(), genesis);
		state.main.push(genesis.hash());
		Self {
			state: Mutex::new(state),
		}
	}

	/// Add a block on top of `parent`. It joins the main chain when `parent` is the tip.
	pub fn add_block(&self, parent: &ChainedHeader, branch: u8, txs: Vec<Transaction>) -> (Block, ChainedHeader) {
		let height = parent.height + 1;
		let block = make_block(parent.hash(), height, branch, txs);
		let header = ChainedHeader::new(height, block.header);

		let mut state = lock(&self.state);
		state.headers.insert(header.hash(), header);
		if state.main.last() == Some(&parent.hash()) {
			state.main.push(header.hash());
		}
		(block, header)
	}

	/// Extend the main chain.
	pub fn mine(&self, txs: Vec<Transaction>) -> (Block, ChainedHeader) {
		let tip = self.tip();
		self.add_block(&tip, 0, txs)
	}

	/// Make the branch ending in `tip` the main chain.
	pub fn reorganize_to(&self, tip: &ChainedHeader) {
		let mut state = lock(&self.state);
		let mut path = Vec::new();
		let mut cursor = Some(*tip);
		while let Some(header) = cursor {
			path.push(header.hash());
			cursor = state.headers.get(&header.prev_hash()).copied();
		}
		path.reverse();
		state.main = path;
	}
}

impl ChainIndexer for InMemoryChain {
	fn tip(&self) -> ChainedHeader {
		let state = lock(&self.state);
		state
			.main
			.last()
			.and_then(|hash| state.headers.get(hash))
			.copied()
			.unwrap_or_else(genesis_header)
	}

	fn header_at(&self, height: u32) -> Option<ChainedHeader> {
		let state = lock(&self.state);
		state
			.main
			.get(height as usize)
			.and_then(|hash| state.headers.get(hash))
			.copied()
	}

	fn header_by_hash(&self, hash: &BlockHash) -> Option<ChainedHeader> {
		lock(&self.state).headers.get(hash).copied()
	}

	fn is_on_main_chain(&self, hash: &BlockHash) -> bool {
		let state = lock(&self.state);
		state
			.headers
			.get(hash)
			.is_some_and(|header| state.main.get(header.height as usize) == Some(hash))
	}
}

/// Block store whose blocks can be held back to simulate slow delivery.
#[derive(Default)]
pub struct InMemoryBlockStore {
	blocks: Mutex<HashMap<BlockHash, Block>>,
	pending: Mutex<HashSet<BlockHash>>,
	fetches: AtomicUsize,
}

impl InMemoryBlockStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&self, block: Block) {
		lock(&self.blocks).insert(block.block_hash(), block);
	}

	/// Report `hash` as not yet available until released.
	pub fn hold_back(&self, hash: BlockHash) {
		lock(&self.pending).insert(hash);
	}

	pub fn release(&self, hash: &BlockHash) {
		lock(&self.pending).remove(hash);
	}

	pub fn fetch_count(&self) -> usize {
		self.fetches.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl BlockStore for InMemoryBlockStore {
	async fn get_block(&self, hash: &BlockHash) -> Result<Block, BlockStoreError> {
		self.fetches.fetch_add(1, Ordering::SeqCst);
		if lock(&self.pending).contains(hash) {
			return Err(BlockStoreError::NotYetAvailable(*hash));
		}
		lock(&self.blocks)
			.get(hash)
			.cloned()
			.ok_or(BlockStoreError::NotFound(*hash))
	}
}

/// Wallet repository keeping the last saved wallet in memory.
#[derive(Default)]
pub struct InMemoryWalletRepository {
	wallet: Mutex<Option<Wallet>>,
	saves: AtomicUsize,
}

impl InMemoryWalletRepository {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_wallet(wallet: Wallet) -> Self {
		Self {
			wallet: Mutex::new(Some(wallet)),
			saves: AtomicUsize::new(0),
		}
	}

	pub fn stored(&self) -> Option<Wallet> {
		lock(&self.wallet).clone()
	}

	pub fn save_count(&self) -> usize {
		self.saves.load(Ordering::SeqCst)
	}
}

#[async_trait::async_trait]
impl WalletRepository for InMemoryWalletRepository {
	async fn save(&self, wallet: &Wallet) -> Result<(), WalletError> {
		*lock(&self.wallet) = Some(wallet.clone());
		self.saves.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	async fn load(&self) -> Result<Option<Wallet>, WalletError> {
		Ok(self.stored())
	}
}

/// A wallet manager wired to in-memory collaborators.
pub struct TestWallet {
	pub federation: TestFederation,
	pub chain: Arc<InMemoryChain>,
	pub store: Arc<InMemoryBlockStore>,
	pub repository: Arc<InMemoryWalletRepository>,
	pub manager: Arc<FederationWalletManager>,
}

impl Default for TestWallet {
	fn default() -> Self {
		Self::new()
	}
}

impl TestWallet {
	pub fn new() -> Self {
		Self::with_settings(settings())
	}

	pub fn with_settings(settings: FederationWalletSettings) -> Self {
		Self::for_federation(TestFederation::new(), settings)
	}

	pub fn for_federation(federation: TestFederation, settings: FederationWalletSettings) -> Self {
		Self::assemble(
			federation,
			settings,
			Arc::new(InMemoryChain::new()),
			Arc::new(InMemoryBlockStore::new()),
			Arc::new(InMemoryWalletRepository::new()),
		)
	}

	/// Another wallet on the same chain and block store, e.g. a second federation member.
	pub fn sharing_chain(&self, federation: TestFederation) -> Self {
		Self::assemble(
			federation,
			self.manager.settings().clone(),
			self.chain.clone(),
			self.store.clone(),
			Arc::new(InMemoryWalletRepository::new()),
		)
	}

	fn assemble(
		federation: TestFederation,
		settings: FederationWalletSettings,
		chain: Arc<InMemoryChain>,
		store: Arc<InMemoryBlockStore>,
		repository: Arc<InMemoryWalletRepository>,
	) -> Self {
		let manager = Arc::new(FederationWalletManager::new(
			settings.clone(),
			federation.params(),
			chain.clone(),
			Arc::new(federation.extractor(settings.network)),
			repository.clone(),
		));
		Self {
			federation,
			chain,
			store,
			repository,
			manager,
		}
	}

	/// New test wallet, started at genesis.
	pub async fn started() -> Self {
		let wallet = Self::new();
		wallet.manager.start().await.expect("wallet starts");
		wallet
	}

	/// New test wallet with `settings`, started at genesis.
	pub async fn started_with(settings: FederationWalletSettings) -> Self {
		let wallet = Self::with_settings(settings);
		wallet.manager.start().await.expect("wallet starts");
		wallet
	}

	pub fn sync_manager(&self) -> WalletSyncManager {
		WalletSyncManager::new(self.manager.clone(), self.chain.clone(), self.store.clone())
	}

	/// Mine a main-chain block and put it in the store without processing it.
	pub fn mine(&self, txs: Vec<Transaction>) -> (Block, ChainedHeader) {
		let (block, header) = self.chain.mine(txs);
		self.store.insert(block.clone());
		(block, header)
	}

	/// Mine a block and hand it to the wallet manager.
	pub async fn mine_and_process(&self, txs: Vec<Transaction>) -> ChainedHeader {
		let (block, header) = self.mine(txs);
		self.manager
			.process_block(&block, &header)
			.await
			.expect("block applies");
		header
	}

	/// Mine empty blocks up to `height`, processing each.
	pub async fn advance_to(&self, height: u32) -> ChainedHeader {
		let mut tip = self.chain.tip();
		while tip.height < height {
			tip = self.mine_and_process(Vec::new()).await;
		}
		tip
	}
}
