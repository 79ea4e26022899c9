//! Records of outputs owned by the federation multisig.
//!
//! A `UtxoRecord` is plain data. Once it lives inside a `MultiSigLedger` its height and
//! spending details must only change through the ledger so that the indices follow.

use crate::chain::DepositId;

use bitcoin::{Amount, BlockHash, OutPoint, ScriptBuf, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An output paying the multisig script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoRecord {
	/// Id of the transaction that created the output.
	pub id: Txid,
	pub index: u32,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
	pub script_pub_key: ScriptBuf,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub block_height: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub block_hash: Option<BlockHash>,
	#[serde(with = "chrono::serde::ts_seconds")]
	pub creation_time: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub spending_details: Option<SpendingDetails>,
}

impl UtxoRecord {
	pub fn outpoint(&self) -> OutPoint {
		OutPoint::new(self.id, self.index)
	}

	pub fn is_spendable(&self) -> bool {
		self.spending_details.is_none()
	}

	pub fn is_confirmed(&self) -> bool {
		self.block_height.is_some()
	}

	/// Confirmations relative to `tip_height`; unconfirmed records have none.
	pub fn confirmations(&self, tip_height: u32) -> u32 {
		match self.block_height {
			Some(height) if height <= tip_height => tip_height - height + 1,
			_ => 0,
		}
	}

	/// Height at which the record was spent, if the spend is confirmed.
	pub fn spent_height(&self) -> Option<u32> {
		self.spending_details.as_ref().and_then(|s| s.block_height)
	}

	pub fn withdrawal_details(&self) -> Option<&WithdrawalDetails> {
		self.spending_details
			.as_ref()
			.and_then(|s| s.withdrawal_details.as_ref())
	}
}

/// The transaction that consumed a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpendingDetails {
	pub transaction_id: Txid,
	/// Outputs of the spending transaction that leave the multisig.
	#[serde(default)]
	pub payments: Vec<PaymentDetails>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub block_height: Option<u32>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub block_hash: Option<BlockHash>,
	#[serde(with = "chrono::serde::ts_seconds")]
	pub creation_time: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub withdrawal_details: Option<WithdrawalDetails>,
}

impl SpendingDetails {
	pub fn is_confirmed(&self) -> bool {
		self.block_height.is_some()
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDetails {
	pub destination_script_pub_key: ScriptBuf,
	pub destination_address: String,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawalDetails {
	pub matching_deposit_id: DepositId,
	#[serde(with = "bitcoin::amount::serde::as_sat")]
	pub amount: Amount,
	pub target_address: String,
}

/// An unspent record together with its confirmation count at query time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnspentOutputReference {
	pub record: UtxoRecord,
	pub confirmations: u32,
}
