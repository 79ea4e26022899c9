//! The federation wallet manager.
//!
//! `FederationWalletManager` owns the wallet aggregate behind a single async mutex. Every
//! public operation takes the lock for its whole duration, works on the ledger with plain
//! method calls and releases it before touching the disk: changed wallets are cloned under
//! the lock and handed to the repository afterwards.
//!
//! Blocks must arrive in chain order. Rolling confirmed state back is only possible through
//! `remove_blocks`; the sync manager is responsible for calling it when the chain reorganizes.

use crate::chain::{ChainError, ChainIndexer, ChainedHeader, DepositId, Withdrawal, WithdrawalExtractor};
use crate::config::{FederationWalletSettings, MultisigParams};
use crate::utils::format_btc_amount;
use crate::wallet::keys::{EncryptedSeed, KeyCache, public_key_of, secret_from_mnemonic};
use crate::wallet::ledger::MultiSigLedger;
use crate::wallet::record::{
	PaymentDetails, SpendingDetails, UnspentOutputReference, UtxoRecord, WithdrawalDetails,
};
use crate::wallet::sync::repositories::WalletRepository;
use crate::wallet::{Wallet, WalletError, WalletState};

use bitcoin::secp256k1::SecretKey;
use bitcoin::{Address, Amount, Block, BlockHash, OutPoint, Transaction, Txid};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Spendable funds split by confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpendableAmount {
	pub confirmed: Amount,
	pub unconfirmed: Amount,
}

/// A withdrawal transaction as recorded on the inputs it spends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawalTransaction {
	pub transaction_id: Txid,
	pub withdrawal: WithdrawalDetails,
	pub block_height: Option<u32>,
	pub block_hash: Option<BlockHash>,
	/// Federation outputs consumed by the withdrawal, in coin order.
	pub inputs: Vec<OutPoint>,
}

pub(crate) struct WalletInner {
	pub(crate) wallet: Option<Wallet>,
	pub(crate) key_cache: KeyCache,
}

pub struct FederationWalletManager {
	pub(crate) settings: FederationWalletSettings,
	pub(crate) multisig: MultisigParams,
	pub(crate) chain: Arc<dyn ChainIndexer>,
	extractor: Arc<dyn WithdrawalExtractor>,
	repository: Arc<dyn WalletRepository>,
	pub(crate) inner: Mutex<WalletInner>,
}

impl FederationWalletManager {
	pub fn new(
		settings: FederationWalletSettings,
		multisig: MultisigParams,
		chain: Arc<dyn ChainIndexer>,
		extractor: Arc<dyn WithdrawalExtractor>,
		repository: Arc<dyn WalletRepository>,
	) -> Self {
		let key_cache = KeyCache::new(settings.key_cache_ttl());
		Self {
			settings,
			multisig,
			chain,
			extractor,
			repository,
			inner: Mutex::new(WalletInner {
				wallet: None,
				key_cache,
			}),
		}
	}

	pub fn settings(&self) -> &FederationWalletSettings {
		&self.settings
	}

	pub fn multisig(&self) -> &MultisigParams {
		&self.multisig
	}

	/// Load the wallet file, or create a fresh wallet synced to genesis.
	pub async fn start(&self) -> Result<WalletState, WalletError> {
		let wallet = match self.repository.load().await? {
			Some(wallet) => {
				if wallet.multi_sig_address.redeem_script != *self.multisig.redeem_script() {
					return Err(WalletError::InvalidMultisigScript(
						"wallet file belongs to a different federation".to_string(),
					));
				}
				info!(
					"Loaded federation wallet with {} records, synced to height {:?}",
					wallet.ledger().len(),
					wallet.last_block_synced_height
				);
				wallet
			}
			None => {
				let genesis = self
					.chain
					.header_at(0)
					.ok_or_else(|| ChainError::HeaderNotFound("genesis".to_string()))?;
				let wallet = Wallet::new(
					&self.settings,
					&self.multisig,
					&genesis,
					self.chain.locator_for(&genesis),
				)?;
				self.repository.save(&wallet).await?;
				info!(
					"Created federation wallet for {}",
					wallet.multi_sig_address.address
				);
				wallet
			}
		};

		let mut inner = self.inner.lock().await;
		inner.wallet = Some(wallet);
		Ok(self.state_of(inner.wallet.as_ref()))
	}

	/// Save the wallet and forget any cached key.
	pub async fn stop(&self) -> Result<(), WalletError> {
		self.save_wallet().await?;
		self.inner.lock().await.key_cache.clear();
		Ok(())
	}

	pub async fn state(&self) -> WalletState {
		let inner = self.inner.lock().await;
		self.state_of(inner.wallet.as_ref())
	}

	pub async fn is_active(&self) -> bool {
		self.state().await == WalletState::Active
	}

	/// `WalletNotActive` unless the wallet has reached its activation height.
	pub async fn ensure_active(&self) -> Result<(), WalletError> {
		let inner = self.inner.lock().await;
		let wallet = inner.wallet.as_ref().ok_or(WalletError::WalletNotLoaded)?;
		match self.state_of(Some(wallet)) {
			WalletState::Active => Ok(()),
			_ => Err(WalletError::WalletNotActive {
				height: wallet.last_block_synced_height.unwrap_or_default(),
				activation_height: self.settings.activation_height,
			}),
		}
	}

	fn state_of(&self, wallet: Option<&Wallet>) -> WalletState {
		match wallet {
			None => WalletState::Uninitialized,
			Some(wallet) => match wallet.last_block_synced_height {
				Some(height) if self.is_active_height(height) => WalletState::Active,
				_ => WalletState::Loaded,
			},
		}
	}

	fn is_active_height(&self, height: u32) -> bool {
		height >= self.settings.activation_height
	}

	pub async fn wallet_tip(&self) -> Option<(u32, BlockHash)> {
		let inner = self.inner.lock().await;
		inner.wallet.as_ref().and_then(|wallet| wallet.tip())
	}

	pub async fn block_locator(&self) -> Vec<BlockHash> {
		let inner = self.inner.lock().await;
		inner
			.wallet
			.as_ref()
			.map(|wallet| wallet.block_locator.clone())
			.unwrap_or_default()
	}

	/// Clone of the current wallet aggregate.
	pub async fn snapshot(&self) -> Option<Wallet> {
		self.inner.lock().await.wallet.clone()
	}

	pub async fn save_wallet(&self) -> Result<(), WalletError> {
		let snapshot = self.snapshot().await.ok_or(WalletError::WalletNotLoaded)?;
		self.repository.save(&snapshot).await
	}

	async fn persist(&self, snapshot: Option<Wallet>) -> Result<(), WalletError> {
		match snapshot {
			Some(wallet) => self.repository.save(&wallet).await,
			None => Ok(()),
		}
	}

	/// Apply a block that extends the wallet tip.
	///
	/// Returns whether any record changed. A block behind the tip is replayed without moving
	/// the tip; a block ahead of the tip that does not build on it is refused with
	/// `BlockTooFarInFuture`.
	pub async fn process_block(
		&self,
		block: &Block,
		header: &ChainedHeader,
	) -> Result<bool, WalletError> {
		let snapshot = {
			let mut inner = self.inner.lock().await;
			let wallet = inner.wallet.as_mut().ok_or(WalletError::WalletNotLoaded)?;
			let changed = self.apply_block(wallet, block, header)?;
			changed.then(|| wallet.clone())
		};
		let changed = snapshot.is_some();
		self.persist(snapshot).await?;
		Ok(changed)
	}

	fn apply_block(
		&self,
		wallet: &mut Wallet,
		block: &Block,
		header: &ChainedHeader,
	) -> Result<bool, WalletError> {
		if let Some((tip_height, tip_hash)) = wallet.tip() {
			if header.prev_hash() != tip_hash {
				if header.height > tip_height {
					return Err(WalletError::BlockTooFarInFuture {
						height: header.height,
						tip_height,
					});
				}
				debug!("Replaying block {} behind wallet tip {}", header, tip_height);
				if !self.is_active_height(header.height) {
					return Ok(false);
				}
				return Ok(self.apply_block_transactions(wallet, block, header));
			}
		}

		if !self.is_active_height(header.height) {
			debug!(
				"Wallet not active before height {}, tracking tip {}",
				self.settings.activation_height, header
			);
			wallet.set_tip(header, self.chain.locator_for(header));
			return Ok(false);
		}

		let mut changed = self.apply_block_transactions(wallet, block, header);
		changed |= self.clean_transactions_past_max_reorg(wallet, header.height);
		wallet.set_tip(header, self.chain.locator_for(header));

		if changed {
			info!(
				"Processed block {}: {} records, {} unspent",
				header,
				wallet.ledger().len(),
				wallet.ledger().unspent().count()
			);
		}
		Ok(changed)
	}

	fn apply_block_transactions(
		&self,
		wallet: &mut Wallet,
		block: &Block,
		header: &ChainedHeader,
	) -> bool {
		let block_hash = header.hash();
		let time = header.time();
		let script = wallet.multi_sig_address.script_pub_key.clone();

		let mut changed = false;
		for tx in &block.txdata {
			if tx.is_coinbase() && !tx.output.iter().any(|o| o.script_pubkey == script) {
				continue;
			}
			changed |= self.apply_transaction(wallet, tx, Some(header.height), Some(block_hash), time);
		}
		changed
	}

	/// Record the effect of a single transaction on the federation's outputs.
	///
	/// Mempool transactions pass `None` for the block fields. Changes caused by an
	/// unconfirmed transaction are saved right away.
	pub async fn process_transaction(
		&self,
		transaction: &Transaction,
		block_height: Option<u32>,
		block_hash: Option<BlockHash>,
		block: Option<&Block>,
	) -> Result<bool, WalletError> {
		let time = block
			.and_then(|b| DateTime::from_timestamp(i64::from(b.header.time), 0))
			.unwrap_or_else(Utc::now);

		let snapshot = {
			let mut inner = self.inner.lock().await;
			let wallet = inner.wallet.as_mut().ok_or(WalletError::WalletNotLoaded)?;
			if let WalletState::Loaded = self.state_of(Some(wallet)) {
				debug!(
					"Ignoring transaction {}: wallet not active",
					transaction.compute_txid()
				);
				return Ok(false);
			}
			let changed = self.apply_transaction(wallet, transaction, block_height, block_hash, time);
			changed.then(|| wallet.clone())
		};

		let changed = snapshot.is_some();
		if block_height.is_none() {
			self.persist(snapshot).await?;
		}
		Ok(changed)
	}

	fn apply_transaction(
		&self,
		wallet: &mut Wallet,
		transaction: &Transaction,
		block_height: Option<u32>,
		block_hash: Option<BlockHash>,
		time: DateTime<Utc>,
	) -> bool {
		let txid = transaction.compute_txid();
		let network = wallet.network;
		let script = wallet.multi_sig_address.script_pub_key.clone();
		let ledger = wallet.ledger_mut();

		let spends_ours = transaction
			.input
			.iter()
			.any(|input| ledger.contains(&input.previous_output));
		let withdrawal = if spends_ours {
			self.extractor
				.extract_withdrawal(transaction, block_hash, block_height)
		} else {
			None
		};

		let mut changed = false;
		if let Some(withdrawal) = &withdrawal {
			let existing = ledger.spending_transactions_by_deposit(Some(withdrawal.deposit_id));
			let records = existing.iter().flat_map(|(_, records)| records);

			if records.clone().any(|r| r.spent_height().is_some()) {
				debug!(
					"Withdrawal for deposit {} already confirmed, skipping {}",
					withdrawal.deposit_id, txid
				);
				return false;
			}

			let mut stale: Vec<Txid> = records
				.filter_map(|r| r.spending_details.as_ref())
				.map(|spend| spend.transaction_id)
				.filter(|candidate| *candidate != txid)
				.collect();
			stale.sort();
			stale.dedup();
			for candidate in stale {
				info!(
					"Replacing unconfirmed withdrawal {} for deposit {} with {}",
					candidate, withdrawal.deposit_id, txid
				);
				changed |= remove_spending_transaction(ledger, candidate);
			}
		}

		for (index, output) in transaction.output.iter().enumerate() {
			if output.script_pubkey != script {
				continue;
			}
			let outpoint = OutPoint::new(txid, index as u32);
			let stored_unconfirmed = ledger.try_get(&outpoint).map(|r| r.block_height.is_none());
			match stored_unconfirmed {
				None => {
					ledger.add(UtxoRecord {
						id: txid,
						index: index as u32,
						amount: output.value,
						script_pub_key: output.script_pubkey.clone(),
						block_height,
						block_hash,
						creation_time: time,
						spending_details: None,
					});
					debug!(
						"Received {} in {} at height {:?}",
						format_btc_amount(output.value),
						outpoint,
						block_height
					);
					changed = true;
				}
				Some(true) if block_height.is_some() => {
					ledger.update_block_height(&outpoint, block_height, block_hash);
					ledger.set_creation_time(&outpoint, time);
					changed = true;
				}
				Some(_) => {}
			}
		}

		let payments = payments_of(transaction, &script, network);
		for input in &transaction.input {
			let outpoint = input.previous_output;
			let Some(record) = ledger.try_get(&outpoint) else {
				continue;
			};

			let details = SpendingDetails {
				transaction_id: txid,
				payments: payments.clone(),
				block_height,
				block_hash,
				creation_time: time,
				withdrawal_details: withdrawal.as_ref().map(withdrawal_details),
			};

			let overwrite = match &record.spending_details {
				None => true,
				// A confirmed spend is never replaced by mempool data.
				Some(current) if current.is_confirmed() && block_height.is_none() => false,
				Some(current) => !same_spend(current, &details),
			};
			if overwrite {
				ledger.update_spending_details(&outpoint, Some(details));
				changed = true;
			}
		}

		changed
	}

	fn clean_transactions_past_max_reorg(&self, wallet: &mut Wallet, height: u32) -> bool {
		let Some(cutoff) = height.checked_sub(self.settings.max_reorg) else {
			return false;
		};
		let floor = self.settings.retained_records_floor;
		let ledger = wallet.ledger_mut();

		let mut removed = 0usize;
		'groups: for (_, records) in ledger.spent_before_height(cutoff) {
			for record in records {
				if ledger.len() <= floor {
					break 'groups;
				}
				ledger.remove(&record.outpoint());
				removed += 1;
			}
		}

		if removed > 0 {
			debug!(
				"Removed {} records spent before height {}, {} retained",
				removed,
				cutoff,
				ledger.len()
			);
		}
		removed > 0
	}

	/// Roll the wallet back to `fork`.
	///
	/// Records created above the fork are dropped, spends confirmed above it are cleared and
	/// the tip is rewound. Calling it again with the same fork changes nothing.
	pub async fn remove_blocks(&self, fork: &ChainedHeader) -> Result<(), WalletError> {
		let locator = self.chain.locator_for(fork);
		let snapshot = {
			let mut inner = self.inner.lock().await;
			let wallet = inner.wallet.as_mut().ok_or(WalletError::WalletNotLoaded)?;
			let ledger = wallet.ledger_mut();

			let created_above: Vec<OutPoint> = ledger
				.records()
				.into_iter()
				.filter(|r| r.block_height.is_some_and(|h| h > fork.height))
				.map(|r| r.outpoint())
				.collect();
			for outpoint in &created_above {
				ledger.remove(outpoint);
			}

			let spent_above: Vec<OutPoint> = ledger
				.records()
				.into_iter()
				.filter(|r| r.spent_height().is_some_and(|h| h > fork.height))
				.map(|r| r.outpoint())
				.collect();
			for outpoint in &spent_above {
				ledger.update_spending_details(outpoint, None);
			}

			wallet.set_tip(fork, locator);
			info!(
				"Rewound wallet to {}: removed {} records, unspent {}",
				fork,
				created_above.len(),
				spent_above.len()
			);
			wallet.clone()
		};
		self.repository.save(&snapshot).await
	}

	/// Lowest height at which a confirmed record or spend no longer matches the chain.
	pub async fn find_unresolvable_history(&self) -> Option<u32> {
		let inner = self.inner.lock().await;
		let wallet = inner.wallet.as_ref()?;

		let resolves = |height: Option<u32>, hash: Option<BlockHash>| match (height, hash) {
			(Some(height), Some(hash)) => self
				.chain
				.header_at(height)
				.is_some_and(|header| header.hash() == hash),
			(Some(height), None) => self.chain.header_at(height).is_some(),
			(None, _) => true,
		};

		wallet
			.ledger()
			.records()
			.into_iter()
			.flat_map(|record| {
				let mut broken = Vec::new();
				if !resolves(record.block_height, record.block_hash) {
					broken.extend(record.block_height);
				}
				if let Some(spend) = &record.spending_details {
					if !resolves(spend.block_height, spend.block_hash) {
						broken.extend(spend.block_height);
					}
				}
				broken
			})
			.min()
	}

	/// Fail with `UnresolvableSpendingHistory` when stored state references blocks that
	/// are no longer on the chain.
	pub async fn verify_spending_history(&self) -> Result<(), WalletError> {
		match self.find_unresolvable_history().await {
			Some(height) => Err(WalletError::UnresolvableSpendingHistory { height }),
			None => Ok(()),
		}
	}

	/// Unlock signing.
	///
	/// With a mnemonic the member key is derived from it and stored encrypted under
	/// `password`; without one the stored key is decrypted. Either way the key must be the
	/// member key of the federation script.
	pub async fn enable_wallet(
		&self,
		password: &str,
		mnemonic: Option<&str>,
		passphrase: Option<&str>,
	) -> Result<(), WalletError> {
		let snapshot = {
			let mut guard = self.inner.lock().await;
			let inner = &mut *guard;
			let wallet = inner.wallet.as_mut().ok_or(WalletError::WalletNotLoaded)?;

			let secret = match mnemonic {
				Some(mnemonic) => {
					secret_from_mnemonic(mnemonic, passphrase.unwrap_or_default(), wallet.network)?
				}
				None => wallet
					.encrypted_seed
					.as_ref()
					.ok_or(WalletError::WalletNotEnabled)?
					.decrypt(password)?,
			};
			self.check_member_key(&secret)?;

			inner.key_cache.put(secret);
			match mnemonic {
				Some(_) => {
					wallet.encrypted_seed = Some(EncryptedSeed::encrypt(&secret, password)?);
					Some(wallet.clone())
				}
				None => None,
			}
		};

		info!("Federation wallet enabled for {}", self.multisig.member_public_key());
		self.persist(snapshot).await
	}

	fn check_member_key(&self, secret: &SecretKey) -> Result<(), WalletError> {
		if public_key_of(secret) != *self.multisig.member_public_key() {
			error!("Key does not match federation member key, refusing to enable wallet");
			return Err(WalletError::KeyMismatch);
		}
		Ok(())
	}

	/// The member signing key, from the cache or decrypted with `password`.
	pub async fn signing_key(&self, password: Option<&str>) -> Result<SecretKey, WalletError> {
		let mut guard = self.inner.lock().await;
		let inner = &mut *guard;
		if let Some(key) = inner.key_cache.get() {
			return Ok(key);
		}

		let password = password.ok_or(WalletError::WalletNotEnabled)?;
		let wallet = inner.wallet.as_ref().ok_or(WalletError::WalletNotLoaded)?;
		let secret = wallet
			.encrypted_seed
			.as_ref()
			.ok_or(WalletError::WalletNotEnabled)?
			.decrypt(password)?;
		self.check_member_key(&secret)?;
		inner.key_cache.put(secret);
		Ok(secret)
	}

	pub async fn spendable_amount(&self) -> Result<SpendableAmount, WalletError> {
		let inner = self.inner.lock().await;
		let wallet = inner.wallet.as_ref().ok_or(WalletError::WalletNotLoaded)?;

		let mut amount = SpendableAmount::default();
		for record in wallet.ledger().unspent() {
			if record.is_confirmed() {
				amount.confirmed += record.amount;
			} else {
				amount.unconfirmed += record.amount;
			}
		}
		Ok(amount)
	}

	/// Unspent records with at least `min_confirmations`, in deterministic coin order.
	pub async fn spendable_transactions(
		&self,
		min_confirmations: u32,
	) -> Result<Vec<UnspentOutputReference>, WalletError> {
		let inner = self.inner.lock().await;
		let wallet = inner.wallet.as_ref().ok_or(WalletError::WalletNotLoaded)?;
		let tip_height = wallet.last_block_synced_height.unwrap_or_default();

		Ok(wallet
			.ledger()
			.unspent()
			.map(|record| UnspentOutputReference {
				confirmations: record.confirmations(tip_height),
				record: record.clone(),
			})
			.filter(|unspent| unspent.confirmations >= min_confirmations)
			.collect())
	}

	/// Withdrawals grouped by spending transaction, for one deposit or all of them.
	pub async fn find_withdrawal_transactions(
		&self,
		deposit_id: Option<DepositId>,
	) -> Result<Vec<WithdrawalTransaction>, WalletError> {
		let inner = self.inner.lock().await;
		let wallet = inner.wallet.as_ref().ok_or(WalletError::WalletNotLoaded)?;

		let mut grouped: BTreeMap<(DepositId, Txid), WithdrawalTransaction> = BTreeMap::new();
		for (deposit_id, records) in wallet.ledger().spending_transactions_by_deposit(deposit_id) {
			for record in records {
				let Some(spend) = &record.spending_details else {
					continue;
				};
				let Some(withdrawal) = &spend.withdrawal_details else {
					continue;
				};
				grouped
					.entry((deposit_id, spend.transaction_id))
					.or_insert_with(|| WithdrawalTransaction {
						transaction_id: spend.transaction_id,
						withdrawal: withdrawal.clone(),
						block_height: spend.block_height,
						block_hash: spend.block_hash,
						inputs: Vec::new(),
					})
					.inputs
					.push(record.outpoint());
			}
		}
		Ok(grouped.into_values().collect())
	}

	/// Wipe every record, keeping the tip. Returns the removed outpoints.
	pub async fn remove_all_transactions(&self) -> Result<Vec<OutPoint>, WalletError> {
		let (removed, snapshot) = {
			let mut inner = self.inner.lock().await;
			let wallet = inner.wallet.as_mut().ok_or(WalletError::WalletNotLoaded)?;
			let removed: Vec<OutPoint> = wallet
				.ledger()
				.records()
				.into_iter()
				.map(|r| r.outpoint())
				.collect();
			wallet.ledger_mut().clear();
			(removed, wallet.clone())
		};

		warn!("Removed all {} federation wallet records", removed.len());
		self.repository.save(&snapshot).await?;
		Ok(removed)
	}

	/// Undo the withdrawals paying out `deposit_id`: their inputs become spendable again
	/// and their change outputs are dropped. Returns the removed transaction ids.
	pub async fn remove_withdrawal_transactions(
		&self,
		deposit_id: DepositId,
	) -> Result<Vec<Txid>, WalletError> {
		let (removed, snapshot) = {
			let mut inner = self.inner.lock().await;
			let wallet = inner.wallet.as_mut().ok_or(WalletError::WalletNotLoaded)?;
			let ledger = wallet.ledger_mut();

			let mut txids: Vec<Txid> = ledger
				.spending_transactions_by_deposit(Some(deposit_id))
				.into_iter()
				.flat_map(|(_, records)| records)
				.filter_map(|r| r.spending_details.map(|s| s.transaction_id))
				.collect();
			txids.sort();
			txids.dedup();

			for txid in &txids {
				remove_spending_transaction(ledger, *txid);
			}
			let snapshot = (!txids.is_empty()).then(|| wallet.clone());
			(txids, snapshot)
		};

		if !removed.is_empty() {
			info!(
				"Removed {} withdrawal transactions for deposit {}",
				removed.len(),
				deposit_id
			);
		}
		self.persist(snapshot).await?;
		Ok(removed)
	}
}

/// Forget a spending transaction: clear the spends it made and drop the outputs it created.
fn remove_spending_transaction(ledger: &mut MultiSigLedger, txid: Txid) -> bool {
	let (spent, created): (Vec<_>, Vec<_>) = ledger
		.records()
		.into_iter()
		.filter(|r| {
			r.id == txid
				|| r.spending_details
					.as_ref()
					.is_some_and(|s| s.transaction_id == txid)
		})
		.map(|r| (r.outpoint(), r.id == txid))
		.partition(|(_, created)| !created);

	for (outpoint, _) in &spent {
		ledger.update_spending_details(outpoint, None);
	}
	for (outpoint, _) in &created {
		ledger.remove(outpoint);
	}
	!spent.is_empty() || !created.is_empty()
}

fn payments_of(
	transaction: &Transaction,
	multisig_script: &bitcoin::ScriptBuf,
	network: bitcoin::Network,
) -> Vec<PaymentDetails> {
	transaction
		.output
		.iter()
		.filter(|o| o.script_pubkey != *multisig_script && !o.script_pubkey.is_op_return())
		.map(|o| PaymentDetails {
			destination_script_pub_key: o.script_pubkey.clone(),
			destination_address: Address::from_script(&o.script_pubkey, network)
				.map(|a| a.to_string())
				.unwrap_or_default(),
			amount: o.value,
		})
		.collect()
}

fn withdrawal_details(withdrawal: &Withdrawal) -> WithdrawalDetails {
	WithdrawalDetails {
		matching_deposit_id: withdrawal.deposit_id,
		amount: withdrawal.amount,
		target_address: withdrawal.target_address.clone(),
	}
}

/// Same spend apart from when it was first seen.
fn same_spend(a: &SpendingDetails, b: &SpendingDetails) -> bool {
	a.transaction_id == b.transaction_id
		&& a.block_height == b.block_height
		&& a.block_hash == b.block_hash
		&& a.payments == b.payments
		&& a.withdrawal_details == b.withdrawal_details
}
