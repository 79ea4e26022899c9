use crate::chain::{BlockStoreError, ChainError, ChainedHeader};
use crate::config::{FederationWalletSettings, MultisigParams};
use crate::wallet::keys::EncryptedSeed;
use crate::wallet::ledger::MultiSigLedger;

use bitcoin::{BlockHash, Network, ScriptBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of the federation wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletState {
	/// No wallet file has been loaded or created yet.
	Uninitialized,
	/// Loaded, but the chain has not reached the activation height.
	Loaded,
	/// Tracking the multisig and processing funds.
	Active,
}

/// The persisted wallet aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub encrypted_seed: Option<EncryptedSeed>,
	#[serde(default)]
	pub block_locator: Vec<BlockHash>,
	pub network: Network,
	#[serde(with = "chrono::serde::ts_seconds")]
	pub creation_time: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_block_synced_height: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub last_block_synced_hash: Option<BlockHash>,
	pub coin_type: u32,
	pub multi_sig_address: MultiSigAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiSigAddress {
	pub address: String,
	/// Signatures required to spend.
	pub m: usize,
	pub script_pub_key: ScriptBuf,
	pub redeem_script: ScriptBuf,
	#[serde(default)]
	pub transactions: MultiSigLedger,
}

impl Wallet {
	/// A fresh wallet synced to `tip`, with no records and no key.
	pub fn new(
		settings: &FederationWalletSettings,
		multisig: &MultisigParams,
		tip: &ChainedHeader,
		block_locator: Vec<BlockHash>,
	) -> Result<Self, WalletError> {
		Ok(Self {
			encrypted_seed: None,
			block_locator,
			network: settings.network,
			creation_time: Utc::now(),
			last_block_synced_height: Some(tip.height),
			last_block_synced_hash: Some(tip.hash()),
			coin_type: settings.coin_type,
			multi_sig_address: MultiSigAddress {
				address: multisig.address(settings.network)?.to_string(),
				m: multisig.threshold(),
				script_pub_key: multisig.script_pubkey(),
				redeem_script: multisig.redeem_script().clone(),
				transactions: MultiSigLedger::new(),
			},
		})
	}

	pub fn ledger(&self) -> &MultiSigLedger {
		&self.multi_sig_address.transactions
	}

	pub fn ledger_mut(&mut self) -> &mut MultiSigLedger {
		&mut self.multi_sig_address.transactions
	}

	pub fn tip(&self) -> Option<(u32, BlockHash)> {
		self.last_block_synced_height
			.zip(self.last_block_synced_hash)
	}

	pub fn set_tip(&mut self, header: &ChainedHeader, block_locator: Vec<BlockHash>) {
		self.last_block_synced_height = Some(header.height);
		self.last_block_synced_hash = Some(header.hash());
		self.block_locator = block_locator;
	}
}

/// Errors raised by the wallet manager and its sync machinery.
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
	#[error("Wallet not loaded")]
	WalletNotLoaded,

	#[error("Wallet not active: height {height} is below activation height {activation_height}")]
	WalletNotActive { height: u32, activation_height: u32 },

	#[error("Block {height} is too far in the future for wallet tip {tip_height}")]
	BlockTooFarInFuture { height: u32, tip_height: u32 },

	#[error("Wallet has not been enabled with a signing key")]
	WalletNotEnabled,

	#[error("Key does not match the federation member public key")]
	KeyMismatch,

	#[error("Invalid wallet password")]
	InvalidPassword,

	#[error("Invalid mnemonic: {0}")]
	InvalidMnemonic(String),

	#[error("Invalid multisig script: {0}")]
	InvalidMultisigScript(String),

	#[error("Spending history cannot be resolved on the current chain at height {height}")]
	UnresolvableSpendingHistory { height: u32 },

	#[error("Key material error: {0}")]
	Crypto(String),

	#[error("Chain error: {0}")]
	Chain(#[from] ChainError),

	#[error("Block store error: {0}")]
	BlockStore(#[from] BlockStoreError),

	#[error("Persistence error: {0}")]
	Persistence(String),

	#[error("IO error: {0}")]
	IoError(#[from] std::io::Error),

	#[error("Serialization error: {0}")]
	Serialization(#[from] serde_json::Error),
}
