//! Checks run before a member co-signs a transaction proposed by another member.

use crate::transaction::signing::verify_input_signatures;
use crate::wallet::ledger::MultiSigLedger;
use crate::wallet::manager::FederationWalletManager;
use crate::wallet::ordering::CoinOrderKey;
use crate::wallet::{UtxoRecord, WalletError};

use bitcoin::{Amount, OutPoint, Transaction};
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationIssue {
	/// The input does not spend a federation record.
	UnknownInput(OutPoint),
	/// The record is not marked as spent by the transaction under validation.
	NotSpentByTransaction(OutPoint),
	/// An older coin is still unspent while this newer one is consumed.
	SkipsOlderCoin { input: OutPoint, oldest_unspent: OutPoint },
	/// Consolidations may only consume unspent records.
	InputAlreadySpent(OutPoint),
	MissingSignature { input: usize },
	InvalidSignature { input: usize },
	NoInputs,
	/// Outputs claim more than the federation inputs provide.
	OutputsExceedInputs { inputs: Amount, outputs: Amount },
	FeeTooLow { fee: Amount, minimum: Amount },
	FeeTooHigh { fee: Amount, maximum: Amount },
}

impl fmt::Display for ValidationIssue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::UnknownInput(outpoint) => write!(f, "input {outpoint} is not a federation coin"),
			Self::NotSpentByTransaction(outpoint) => {
				write!(f, "coin {outpoint} is not spent by this transaction")
			}
			Self::SkipsOlderCoin {
				input,
				oldest_unspent,
			} => write!(f, "input {input} skips older unspent coin {oldest_unspent}"),
			Self::InputAlreadySpent(outpoint) => write!(f, "coin {outpoint} is already spent"),
			Self::MissingSignature { input } => write!(f, "input {input} is not signed"),
			Self::InvalidSignature { input } => write!(f, "input {input} has an invalid signature"),
			Self::NoInputs => write!(f, "transaction spends nothing"),
			Self::OutputsExceedInputs { inputs, outputs } => {
				write!(f, "outputs {outputs} exceed inputs {inputs}")
			}
			Self::FeeTooLow { fee, minimum } => write!(f, "fee {fee} is below minimum {minimum}"),
			Self::FeeTooHigh { fee, maximum } => write!(f, "fee {fee} is above maximum {maximum}"),
		}
	}
}

/// Outcome of a validation; valid when no issue was found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionValidation {
	pub issues: Vec<ValidationIssue>,
}

impl TransactionValidation {
	pub fn is_valid(&self) -> bool {
		self.issues.is_empty()
	}
}

impl FederationWalletManager {
	/// Validate a withdrawal this wallet has already processed.
	///
	/// Every input must be a federation record already spent by `tx`, and no coin older than
	/// the newest input may still be unspent: members selecting independently always take
	/// the oldest coins first. `check_signatures` also checks the signatures and the fee.
	pub async fn validate_transaction(
		&self,
		tx: &Transaction,
		check_signatures: bool,
	) -> Result<TransactionValidation, WalletError> {
		let inner = self.inner.lock().await;
		let wallet = inner.wallet.as_ref().ok_or(WalletError::WalletNotLoaded)?;
		let ledger = wallet.ledger();
		let txid = tx.compute_txid();

		let mut issues = input_count_issues(tx);
		let mut newest: Option<&UtxoRecord> = None;
		for input in &tx.input {
			let outpoint = input.previous_output;
			let Some(record) = ledger.try_get(&outpoint) else {
				issues.push(ValidationIssue::UnknownInput(outpoint));
				continue;
			};
			if record
				.spending_details
				.as_ref()
				.is_none_or(|spend| spend.transaction_id != txid)
			{
				issues.push(ValidationIssue::NotSpentByTransaction(outpoint));
			}
			if newest.is_none_or(|n| CoinOrderKey::of(record) > CoinOrderKey::of(n)) {
				newest = Some(record);
			}
		}

		if let (Some(newest), Some(oldest_unspent)) = (newest, ledger.first_unspent()) {
			if CoinOrderKey::of(oldest_unspent) < CoinOrderKey::of(newest) {
				issues.push(ValidationIssue::SkipsOlderCoin {
					input: newest.outpoint(),
					oldest_unspent: oldest_unspent.outpoint(),
				});
			}
		}

		if check_signatures {
			issues.extend(self.signature_issues(tx));
			issues.extend(self.fee_issues(ledger, tx));
		}
		Ok(report(txid, issues))
	}

	/// Validate a consolidation: any subset of the unspent coins may be merged.
	pub async fn validate_consolidating_transaction(
		&self,
		tx: &Transaction,
		check_signatures: bool,
	) -> Result<TransactionValidation, WalletError> {
		let inner = self.inner.lock().await;
		let wallet = inner.wallet.as_ref().ok_or(WalletError::WalletNotLoaded)?;

		let mut issues = input_count_issues(tx);
		issues.extend(unspent_input_issues(wallet.ledger(), tx));
		if check_signatures {
			issues.extend(self.signature_issues(tx));
			issues.extend(self.fee_issues(wallet.ledger(), tx));
		}
		Ok(report(tx.compute_txid(), issues))
	}

	fn signature_issues(&self, tx: &Transaction) -> Vec<ValidationIssue> {
		(0..tx.input.len())
			.filter_map(|input| match verify_input_signatures(tx, input, &self.multisig) {
				Ok(0) => Some(ValidationIssue::MissingSignature { input }),
				Ok(_) => None,
				Err(_) => Some(ValidationIssue::InvalidSignature { input }),
			})
			.collect()
	}

	/// The fee must sit between the network minimum and the absurd-fee ceiling the builder
	/// enforces. Skipped when an input is unknown, since its amount is not known either.
	fn fee_issues(&self, ledger: &MultiSigLedger, tx: &Transaction) -> Vec<ValidationIssue> {
		let Some(inputs) = tx.input.iter().try_fold(Amount::ZERO, |acc, input| {
			let record = ledger.try_get(&input.previous_output)?;
			acc.checked_add(record.amount)
		}) else {
			return Vec::new();
		};
		let Some(outputs) = tx
			.output
			.iter()
			.try_fold(Amount::ZERO, |acc, output| acc.checked_add(output.value))
		else {
			return vec![ValidationIssue::OutputsExceedInputs {
				inputs,
				outputs: Amount::MAX_MONEY,
			}];
		};
		let Some(fee) = inputs.checked_sub(outputs) else {
			return vec![ValidationIssue::OutputsExceedInputs { inputs, outputs }];
		};

		if fee < self.settings.min_tx_fee {
			vec![ValidationIssue::FeeTooLow {
				fee,
				minimum: self.settings.min_tx_fee,
			}]
		} else if fee > self.settings.absurd_fee {
			vec![ValidationIssue::FeeTooHigh {
				fee,
				maximum: self.settings.absurd_fee,
			}]
		} else {
			Vec::new()
		}
	}
}

fn input_count_issues(tx: &Transaction) -> Vec<ValidationIssue> {
	if tx.input.is_empty() {
		vec![ValidationIssue::NoInputs]
	} else {
		Vec::new()
	}
}

fn unspent_input_issues(ledger: &MultiSigLedger, tx: &Transaction) -> Vec<ValidationIssue> {
	tx.input
		.iter()
		.filter_map(|input| {
			let outpoint = input.previous_output;
			match ledger.try_get(&outpoint) {
				None => Some(ValidationIssue::UnknownInput(outpoint)),
				Some(record) if !record.is_spendable() => {
					Some(ValidationIssue::InputAlreadySpent(outpoint))
				}
				Some(_) => None,
			}
		})
		.collect()
}

fn report(txid: bitcoin::Txid, issues: Vec<ValidationIssue>) -> TransactionValidation {
	for issue in &issues {
		warn!("Transaction {} failed validation: {}", txid, issue);
	}
	TransactionValidation { issues }
}
