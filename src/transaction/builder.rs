//! Federation withdrawal transaction builder
//!
//! Every member runs the same builder over the same ledger state and gets the same unsigned
//! transaction: inputs come from deterministic coin selection, outputs are laid out in a
//! fixed order and the fee comes from a shared policy. Each member then adds its own
//! partial signature.

use crate::chain::{DepositId, FeePolicy};
use crate::transaction::fees::{estimate_vsize, fee_for_vsize};
use crate::transaction::signing::{SigningError, sign_transaction, verify_input_signatures};
use crate::utils::format_btc_amount;
use crate::wallet::ordering::{
	CoinSelection, CoinSelector, ConsolidationCoinSelector, DeterministicCoinSelector, sort_records,
};
use crate::wallet::{FederationWalletManager, UtxoRecord, WalletError};

use bitcoin::absolute::LockTime;
use bitcoin::script::PushBytesBuf;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Weight, Witness};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Standardness limit on transaction weight.
const MAX_STANDARD_TX_WEIGHT: Weight = Weight::from_wu(400_000);

#[derive(Error, Debug)]
pub enum TransactionError {
	#[error("Transaction validation error: {0}")]
	ValidationError(String),

	#[error("Insufficient funds: {available} available, {requested} requested")]
	InsufficientFunds { available: Amount, requested: Amount },

	#[error("No spendable coins")]
	NoSpendableCoins,

	#[error("Invalid selected inputs: {0}")]
	InvalidSelectedInputs(String),

	#[error("Transaction failed policy verification: {}", format_policy_errors(.0))]
	VerificationFailed(Vec<PolicyError>),

	#[error("Signing error: {0}")]
	Signing(#[from] SigningError),

	#[error("Wallet error: {0}")]
	Wallet(#[from] WalletError),
}

/// Standardness and sanity rules a built transaction must pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
	DustOutput { index: usize, amount: Amount },
	FeeTooLow { fee: Amount, minimum: Amount },
	AbsurdFee { fee: Amount, maximum: Amount },
	MissingSignatures { input: usize },
	InvalidSignature { input: usize },
	Oversized { weight: Weight },
}

impl fmt::Display for PolicyError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::DustOutput { index, amount } => write!(f, "output {index} is dust ({amount})"),
			Self::FeeTooLow { fee, minimum } => write!(f, "fee {fee} below minimum {minimum}"),
			Self::AbsurdFee { fee, maximum } => write!(f, "fee {fee} above maximum {maximum}"),
			Self::MissingSignatures { input } => write!(f, "input {input} is not signed"),
			Self::InvalidSignature { input } => write!(f, "input {input} has an invalid signature"),
			Self::Oversized { weight } => write!(f, "weight {weight} exceeds standard limit"),
		}
	}
}

fn format_policy_errors(errors: &[PolicyError]) -> String {
	errors
		.iter()
		.map(ToString::to_string)
		.collect::<Vec<_>>()
		.join(", ")
}

/// A payment made by the withdrawal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
	pub script_pubkey: ScriptBuf,
	pub amount: Amount,
}

impl Recipient {
	pub fn new(script_pubkey: ScriptBuf, amount: Amount) -> Self {
		Self {
			script_pubkey,
			amount,
		}
	}

	fn to_output(&self) -> TxOut {
		TxOut {
			value: self.amount,
			script_pubkey: self.script_pubkey.clone(),
		}
	}
}

/// Result of a successful build.
#[derive(Debug, Clone)]
pub struct BuiltTransaction {
	pub transaction: Transaction,
	pub fee: Amount,
	/// Spent records in input order.
	pub inputs: Vec<UtxoRecord>,
	/// Change returned to the multisig, if any.
	pub change: Option<Amount>,
}

/// Builder for federation withdrawals and consolidations
pub struct WithdrawalTransactionBuilder {
	wallet: Arc<FederationWalletManager>,
	fee_policy: Arc<dyn FeePolicy>,
	recipients: Vec<Recipient>,
	min_confirmations: u32,
	password: Option<String>,
	selected_inputs: Vec<OutPoint>,
	allow_other_inputs: bool,
	fee_override: Option<Amount>,
	confirmation_target: Option<u32>,
	op_return: Option<DepositId>,
	sign: bool,
	verify: bool,
	consolidation: bool,
}

impl WithdrawalTransactionBuilder {
	/// Creates a new transaction builder
	pub fn new(wallet: Arc<FederationWalletManager>, fee_policy: Arc<dyn FeePolicy>) -> Self {
		Self {
			wallet,
			fee_policy,
			recipients: Vec::new(),
			min_confirmations: 0,
			password: None,
			selected_inputs: Vec::new(),
			allow_other_inputs: true,
			fee_override: None,
			confirmation_target: None,
			op_return: None,
			sign: false,
			verify: true,
			consolidation: false,
		}
	}

	/// Sets the payments, kept in this order
	pub fn with_recipients(mut self, recipients: Vec<Recipient>) -> Self {
		self.recipients = recipients;
		self
	}

	pub fn with_min_confirmations(mut self, min_confirmations: u32) -> Self {
		self.min_confirmations = min_confirmations;
		self
	}

	/// Password unlocking the member key when it is not cached
	pub fn with_password(mut self, password: impl Into<String>) -> Self {
		self.password = Some(password.into());
		self
	}

	/// Inputs that must be spent, placed first
	pub fn with_selected_inputs(mut self, inputs: Vec<OutPoint>) -> Self {
		self.selected_inputs = inputs;
		self
	}

	/// Whether coins beyond the selected inputs may be added
	pub fn allow_other_inputs(mut self, allow: bool) -> Self {
		self.allow_other_inputs = allow;
		self
	}

	/// Absolute fee, raised to the configured minimum if lower
	pub fn with_fee_override(mut self, fee: Amount) -> Self {
		self.fee_override = Some(fee);
		self
	}

	pub fn with_confirmation_target(mut self, target: u32) -> Self {
		self.confirmation_target = Some(target);
		self
	}

	/// Tag the withdrawal with the deposit it pays out
	pub fn with_op_return(mut self, deposit_id: DepositId) -> Self {
		self.op_return = Some(deposit_id);
		self
	}

	pub fn sign(mut self, sign: bool) -> Self {
		self.sign = sign;
		self
	}

	/// Skip policy verification of the result
	pub fn ignore_verify(mut self) -> Self {
		self.verify = false;
		self
	}

	/// Spend every eligible coin into a single change output
	pub fn consolidation(mut self) -> Self {
		self.consolidation = true;
		self
	}

	/// Builds the transaction
	pub async fn build(self) -> Result<BuiltTransaction, TransactionError> {
		self.wallet.ensure_active().await?;
		let settings = self.wallet.settings().clone();
		let multisig = self.wallet.multisig().clone();

		let coins: Vec<UtxoRecord> = self
			.wallet
			.spendable_transactions(self.min_confirmations)
			.await?
			.into_iter()
			.map(|unspent| unspent.record)
			.collect();
		if coins.is_empty() {
			return Err(TransactionError::NoSpendableCoins);
		}

		let (pinned, others) = self.split_selected(coins)?;

		let target = self
			.recipients
			.iter()
			.try_fold(Amount::ZERO, |acc, r| acc.checked_add(r.amount))
			.ok_or_else(|| TransactionError::ValidationError("amount overflow".to_string()))?;

		let mut outputs: Vec<TxOut> = self.recipients.iter().map(Recipient::to_output).collect();
		if let Some(deposit_id) = self.op_return {
			outputs.push(op_return_output(deposit_id));
		}
		let change_output = TxOut {
			value: Amount::ZERO,
			script_pubkey: multisig.script_pubkey(),
		};

		// The fee is always estimated with a change output so every member agrees on it
		let rate = self.fee_policy.fee_rate(
			self.confirmation_target
				.unwrap_or(settings.default_confirmation_target),
		);
		let sized_outputs: Vec<TxOut> = outputs
			.iter()
			.cloned()
			.chain(std::iter::once(change_output.clone()))
			.collect();
		let fee_override = self.fee_override.map(|fee| fee.max(settings.min_tx_fee));
		let fee_for_inputs = |inputs: usize| match fee_override {
			Some(fee) => fee,
			None => fee_for_vsize(
				rate,
				estimate_vsize(&multisig, inputs, &sized_outputs),
				settings.min_tx_fee,
			),
		};

		let selection = self.select(&pinned, &others, target, &fee_for_inputs)?;
		debug!(
			"Selected {} coins worth {} for {} plus fee {}",
			selection.coins.len(),
			format_btc_amount(selection.total),
			format_btc_amount(target),
			format_btc_amount(selection.fee)
		);

		let surplus = selection.total - target - selection.fee;
		let change = (surplus >= settings.dust_threshold).then_some(surplus);
		let fee = match change {
			Some(_) => selection.fee,
			None => selection.fee + surplus,
		};
		if let Some(value) = change {
			outputs.push(TxOut {
				value,
				..change_output
			});
		}

		let mut transaction = Transaction {
			version: Version::TWO,
			lock_time: LockTime::ZERO,
			input: selection
				.coins
				.iter()
				.map(|coin| TxIn {
					previous_output: coin.outpoint(),
					script_sig: ScriptBuf::new(),
					sequence: Sequence::MAX,
					witness: Witness::new(),
				})
				.collect(),
			output: outputs,
		};

		if self.sign {
			let secret = self.wallet.signing_key(self.password.as_deref()).await?;
			sign_transaction(&mut transaction, &multisig, &secret)?;
		}

		if self.verify {
			let errors = self.policy_errors(&transaction, fee);
			if !errors.is_empty() {
				return Err(TransactionError::VerificationFailed(errors));
			}
		}

		info!(
			"Built transaction {} spending {} coins, fee {}",
			transaction.compute_txid(),
			selection.coins.len(),
			format_btc_amount(fee)
		);
		Ok(BuiltTransaction {
			transaction,
			fee,
			inputs: selection.coins,
			change,
		})
	}

	/// Separate the pinned inputs from the other candidates, in coin order.
	fn split_selected(
		&self,
		coins: Vec<UtxoRecord>,
	) -> Result<(Vec<UtxoRecord>, Vec<UtxoRecord>), TransactionError> {
		let wanted: HashSet<OutPoint> = self.selected_inputs.iter().copied().collect();
		if wanted.len() != self.selected_inputs.len() {
			return Err(TransactionError::InvalidSelectedInputs(
				"duplicate input".to_string(),
			));
		}

		let (mut pinned, mut others): (Vec<_>, Vec<_>) = coins
			.into_iter()
			.partition(|coin| wanted.contains(&coin.outpoint()));
		if pinned.len() != wanted.len() {
			let missing: Vec<String> = self
				.selected_inputs
				.iter()
				.filter(|outpoint| !pinned.iter().any(|coin| coin.outpoint() == **outpoint))
				.map(ToString::to_string)
				.collect();
			return Err(TransactionError::InvalidSelectedInputs(format!(
				"not spendable: {}",
				missing.join(", ")
			)));
		}

		sort_records(&mut pinned);
		sort_records(&mut others);
		if !wanted.is_empty() && !self.allow_other_inputs {
			others.clear();
		}
		Ok((pinned, others))
	}

	fn select(
		&self,
		pinned: &[UtxoRecord],
		others: &[UtxoRecord],
		target: Amount,
		fee_for_inputs: &dyn Fn(usize) -> Amount,
	) -> Result<CoinSelection, TransactionError> {
		let pinned_total = pinned
			.iter()
			.try_fold(Amount::ZERO, |acc, coin| acc.checked_add(coin.amount))
			.unwrap_or(Amount::MAX_MONEY);

		let selection = if self.consolidation {
			let mut all = pinned.to_vec();
			all.extend_from_slice(others);
			ConsolidationCoinSelector.select(&all, target, fee_for_inputs)
		} else if pinned_total >= target + fee_for_inputs(pinned.len()) && !pinned.is_empty() {
			Some(CoinSelection {
				coins: pinned.to_vec(),
				total: pinned_total,
				fee: fee_for_inputs(pinned.len()),
			})
		} else {
			// Pinned coins count towards the target and the input count
			let remaining = target.checked_sub(pinned_total).unwrap_or(Amount::ZERO);
			let surplus = pinned_total.checked_sub(target).unwrap_or(Amount::ZERO);
			DeterministicCoinSelector
				.select(others, remaining, &|inputs| {
					fee_for_inputs(pinned.len() + inputs)
						.checked_sub(surplus)
						.unwrap_or(Amount::ZERO)
				})
				.map(|selected| {
					let mut coins = pinned.to_vec();
					coins.extend(selected.coins);
					let fee = fee_for_inputs(coins.len());
					CoinSelection {
						coins,
						total: pinned_total + selected.total,
						fee,
					}
				})
		};

		selection.ok_or_else(|| {
			let available = pinned
				.iter()
				.chain(others)
				.fold(Amount::ZERO, |acc, coin| acc + coin.amount);
			let requested = target + fee_for_inputs(pinned.len() + others.len());
			info!(
				"Insufficient funds: {} available, {} requested",
				format_btc_amount(available),
				format_btc_amount(requested)
			);
			TransactionError::InsufficientFunds {
				available,
				requested,
			}
		})
	}

	fn policy_errors(&self, transaction: &Transaction, fee: Amount) -> Vec<PolicyError> {
		let settings = self.wallet.settings();
		let multisig = self.wallet.multisig();
		let mut errors = Vec::new();

		for (index, output) in transaction.output.iter().enumerate() {
			if !output.script_pubkey.is_op_return() && output.value < settings.dust_threshold {
				errors.push(PolicyError::DustOutput {
					index,
					amount: output.value,
				});
			}
		}
		if fee < settings.min_tx_fee {
			errors.push(PolicyError::FeeTooLow {
				fee,
				minimum: settings.min_tx_fee,
			});
		}
		if fee > settings.absurd_fee {
			errors.push(PolicyError::AbsurdFee {
				fee,
				maximum: settings.absurd_fee,
			});
		}
		if self.sign {
			for input in 0..transaction.input.len() {
				match verify_input_signatures(transaction, input, multisig) {
					Ok(0) => errors.push(PolicyError::MissingSignatures { input }),
					Ok(_) => {}
					Err(_) => errors.push(PolicyError::InvalidSignature { input }),
				}
			}
		}
		let weight = transaction.weight();
		if weight > MAX_STANDARD_TX_WEIGHT {
			errors.push(PolicyError::Oversized { weight });
		}
		errors
	}
}

/// OP_RETURN output carrying a deposit id.
pub fn op_return_output(deposit_id: DepositId) -> TxOut {
	TxOut {
		value: Amount::ZERO,
		script_pubkey: ScriptBuf::new_op_return(PushBytesBuf::from(*deposit_id.as_bytes())),
	}
}
