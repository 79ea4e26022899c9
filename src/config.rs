//! Runtime settings for the federation wallet.
//!
//! `FederationWalletSettings` covers the tunables of the ledger, the sync loop and the
//! transaction builder. Every field has a default so a partial JSON file is enough.
//! `MultisigParams` describes the federation script this member participates in.

use crate::wallet::WalletError;

use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::script::Instruction;
use bitcoin::{Address, Amount, Network, PublicKey, ScriptBuf};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of records kept regardless of how old their spends are.
pub const DEFAULT_RETAINED_RECORDS_FLOOR: usize = 100;
/// Default byte ceiling of the block ingestion queue.
pub const DEFAULT_QUEUE_MAX_BYTES: u64 = 100 * 1024 * 1024;
/// Default file name of the persisted wallet.
pub const DEFAULT_WALLET_FILE_NAME: &str = "multisig_wallet.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FederationWalletSettings {
	/// Directory holding the wallet file.
	pub data_dir: PathBuf,
	pub wallet_file_name: String,
	pub network: Network,
	/// BIP44 coin type recorded in the wallet file.
	pub coin_type: u32,
	/// Height at which the federation starts tracking its multisig.
	pub activation_height: u32,
	/// Deepest reorganization the chain can undergo.
	pub max_reorg: u32,
	/// Spent records are only pruned while the ledger holds more than this many records.
	pub retained_records_floor: usize,
	pub queue_max_bytes: u64,
	/// Queued bytes at or below which a full queue accepts blocks again.
	pub queue_resume_bytes: u64,
	pub save_interval_secs: u64,
	/// How long a decrypted signing key stays in memory.
	pub key_cache_ttl_secs: u64,
	pub block_fetch_retries: u32,
	pub block_fetch_retry_interval_ms: u64,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub min_tx_fee: Amount,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub dust_threshold: Amount,
	/// Fees above this are rejected by policy verification.
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub absurd_fee: Amount,
	pub default_confirmation_target: u32,
}

impl Default for FederationWalletSettings {
	fn default() -> Self {
		Self {
			data_dir: PathBuf::from("./data"),
			wallet_file_name: DEFAULT_WALLET_FILE_NAME.to_string(),
			network: Network::Regtest,
			coin_type: 1,
			activation_height: 0,
			max_reorg: 240,
			retained_records_floor: DEFAULT_RETAINED_RECORDS_FLOOR,
			queue_max_bytes: DEFAULT_QUEUE_MAX_BYTES,
			queue_resume_bytes: 0,
			save_interval_secs: 5 * 60,
			key_cache_ttl_secs: 5 * 60,
			block_fetch_retries: 10,
			block_fetch_retry_interval_ms: 100,
			min_tx_fee: Amount::from_sat(1_000),
			dust_threshold: Amount::from_sat(546),
			absurd_fee: Amount::from_sat(10_000_000),
			default_confirmation_target: 6,
		}
	}
}

impl FederationWalletSettings {
	/// Load settings from a JSON file, falling back to defaults for missing fields.
	pub fn from_json_file(path: &Path) -> Result<Self, WalletError> {
		let content = std::fs::read_to_string(path)?;
		let settings = serde_json::from_str(&content)?;
		Ok(settings)
	}

	pub fn wallet_file_path(&self) -> PathBuf {
		self.data_dir.join(&self.wallet_file_name)
	}

	pub fn save_interval(&self) -> Duration {
		Duration::from_secs(self.save_interval_secs)
	}

	pub fn key_cache_ttl(&self) -> Duration {
		Duration::from_secs(self.key_cache_ttl_secs)
	}

	pub fn block_fetch_retry_interval(&self) -> Duration {
		Duration::from_millis(self.block_fetch_retry_interval_ms)
	}
}

/// The federation's m-of-n redeem script and this member's place in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultisigParams {
	redeem_script: ScriptBuf,
	member_public_key: PublicKey,
	threshold: usize,
	public_keys: Vec<PublicKey>,
}

impl MultisigParams {
	/// Parse `OP_m <pubkey>... OP_n OP_CHECKMULTISIG` and check the member is one of the keys.
	pub fn new(redeem_script: ScriptBuf, member_public_key: PublicKey) -> Result<Self, WalletError> {
		let (threshold, public_keys) = parse_multisig(&redeem_script)?;
		if !public_keys.contains(&member_public_key) {
			return Err(WalletError::InvalidMultisigScript(format!(
				"member key {} is not part of the redeem script",
				member_public_key
			)));
		}
		Ok(Self {
			redeem_script,
			member_public_key,
			threshold,
			public_keys,
		})
	}

	/// Build the canonical redeem script for `threshold` of `public_keys`.
	pub fn redeem_script_for(threshold: usize, public_keys: &[PublicKey]) -> ScriptBuf {
		let mut builder = bitcoin::script::Builder::new().push_int(threshold as i64);
		for key in public_keys {
			builder = builder.push_key(key);
		}
		builder
			.push_int(public_keys.len() as i64)
			.push_opcode(OP_CHECKMULTISIG)
			.into_script()
	}

	pub fn redeem_script(&self) -> &ScriptBuf {
		&self.redeem_script
	}

	pub fn member_public_key(&self) -> &PublicKey {
		&self.member_public_key
	}

	pub fn threshold(&self) -> usize {
		self.threshold
	}

	pub fn public_keys(&self) -> &[PublicKey] {
		&self.public_keys
	}

	/// The P2SH output script paying the federation.
	pub fn script_pubkey(&self) -> ScriptBuf {
		ScriptBuf::new_p2sh(&self.redeem_script.script_hash())
	}

	pub fn address(&self, network: Network) -> Result<Address, WalletError> {
		Address::p2sh(&self.redeem_script, network)
			.map_err(|e| WalletError::InvalidMultisigScript(e.to_string()))
	}
}

fn small_int(instruction: &Instruction<'_>) -> Option<usize> {
	match instruction {
		Instruction::Op(op) => {
			let code = op.to_u8();
			// OP_1 through OP_16
			(0x51..=0x60).contains(&code).then(|| (code - 0x50) as usize)
		}
		Instruction::PushBytes(_) => None,
	}
}

fn parse_multisig(script: &ScriptBuf) -> Result<(usize, Vec<PublicKey>), WalletError> {
	let invalid = |reason: &str| WalletError::InvalidMultisigScript(reason.to_string());

	let instructions = script
		.instructions()
		.collect::<Result<Vec<_>, _>>()
		.map_err(|e| WalletError::InvalidMultisigScript(e.to_string()))?;

	if instructions.len() < 4 {
		return Err(invalid("script too short"));
	}
	let threshold = small_int(&instructions[0]).ok_or_else(|| invalid("missing threshold"))?;
	let key_count = small_int(&instructions[instructions.len() - 2])
		.ok_or_else(|| invalid("missing key count"))?;
	match &instructions[instructions.len() - 1] {
		Instruction::Op(op) if *op == OP_CHECKMULTISIG => {}
		_ => return Err(invalid("missing OP_CHECKMULTISIG")),
	}

	let mut public_keys = Vec::with_capacity(key_count);
	for instruction in &instructions[1..instructions.len() - 2] {
		match instruction {
			Instruction::PushBytes(bytes) => {
				let key = PublicKey::from_slice(bytes.as_bytes())
					.map_err(|e| WalletError::InvalidMultisigScript(e.to_string()))?;
				public_keys.push(key);
			}
			Instruction::Op(_) => return Err(invalid("unexpected opcode among keys")),
		}
	}

	if public_keys.len() != key_count || threshold == 0 || threshold > key_count {
		return Err(invalid("threshold and key count disagree"));
	}
	Ok((threshold, public_keys))
}
