//! Multi-index store of the federation's UTXO records.
//!
//! Records live in an arena keyed by `RecordId`. Three ordered indices point into it:
//! spendable records in coin order, spent records by the height of the spending block and
//! withdrawal spends by deposit id. Index membership is derived from record fields, so
//! every field change goes through `mutate`, which removes the record from the indices,
//! applies the change and files it again.

use crate::chain::DepositId;
use crate::wallet::ordering::CoinOrderKey;
use crate::wallet::record::{SpendingDetails, UtxoRecord};

use bitcoin::{BlockHash, OutPoint};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(u64);

#[derive(Debug, Clone, Default)]
pub struct MultiSigLedger {
	records: HashMap<RecordId, UtxoRecord>,
	by_outpoint: HashMap<OutPoint, RecordId>,
	spendable: BTreeMap<CoinOrderKey, RecordId>,
	spent_by_height: BTreeMap<u32, BTreeMap<CoinOrderKey, RecordId>>,
	withdrawals_by_deposit: BTreeMap<DepositId, BTreeMap<CoinOrderKey, RecordId>>,
	next_id: u64,
}

impl MultiSigLedger {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.records.len()
	}

	pub fn is_empty(&self) -> bool {
		self.records.is_empty()
	}

	/// Insert a record and file it in the indices its fields call for.
	///
	/// A record already stored under the same outpoint is replaced and returned.
	pub fn add(&mut self, record: UtxoRecord) -> Option<UtxoRecord> {
		let replaced = self.take(&record.outpoint());

		let id = RecordId(self.next_id);
		self.next_id += 1;
		self.by_outpoint.insert(record.outpoint(), id);
		self.records.insert(id, record);
		self.index(id);

		replaced
	}

	/// Delete a record from every index. Returns `false` if it was not stored.
	pub fn remove(&mut self, outpoint: &OutPoint) -> bool {
		self.take(outpoint).is_some()
	}

	/// Delete a record and hand it back.
	pub fn take(&mut self, outpoint: &OutPoint) -> Option<UtxoRecord> {
		let id = self.by_outpoint.remove(outpoint)?;
		self.unindex(id);
		self.records.remove(&id)
	}

	pub fn try_get(&self, outpoint: &OutPoint) -> Option<&UtxoRecord> {
		self.by_outpoint
			.get(outpoint)
			.and_then(|id| self.records.get(id))
	}

	pub fn contains(&self, outpoint: &OutPoint) -> bool {
		self.by_outpoint.contains_key(outpoint)
	}

	/// Unspent records in deterministic coin order.
	pub fn unspent(&self) -> impl Iterator<Item = &UtxoRecord> + '_ {
		self.spendable.values().filter_map(|id| self.records.get(id))
	}

	/// Snapshot of the unspent records in deterministic coin order.
	pub fn get_unspent(&self) -> Vec<UtxoRecord> {
		self.unspent().cloned().collect()
	}

	/// The unspent record deterministic selection would pick first.
	pub fn first_unspent(&self) -> Option<&UtxoRecord> {
		self.unspent().next()
	}

	/// All records in deterministic coin order.
	pub fn records(&self) -> Vec<&UtxoRecord> {
		let mut records: Vec<&UtxoRecord> = self.records.values().collect();
		records.sort_by_key(|record| CoinOrderKey::of(record));
		records
	}

	/// Withdrawal spends grouped by deposit id, optionally for a single deposit.
	pub fn spending_transactions_by_deposit(
		&self,
		deposit_id: Option<DepositId>,
	) -> Vec<(DepositId, Vec<UtxoRecord>)> {
		let collect = |ids: &BTreeMap<CoinOrderKey, RecordId>| -> Vec<UtxoRecord> {
			ids.values()
				.filter_map(|id| self.records.get(id))
				.cloned()
				.collect()
		};

		match deposit_id {
			Some(deposit_id) => self
				.withdrawals_by_deposit
				.get(&deposit_id)
				.map(|ids| vec![(deposit_id, collect(ids))])
				.unwrap_or_default(),
			None => self
				.withdrawals_by_deposit
				.iter()
				.map(|(deposit_id, ids)| (*deposit_id, collect(ids)))
				.collect(),
		}
	}

	/// Records whose spend confirmed below `height`, grouped by spend height ascending.
	pub fn spent_before_height(&self, height: u32) -> Vec<(u32, Vec<UtxoRecord>)> {
		self.spent_by_height
			.range(..height)
			.map(|(spent_height, ids)| {
				let records = ids
					.values()
					.filter_map(|id| self.records.get(id))
					.cloned()
					.collect();
				(*spent_height, records)
			})
			.collect()
	}

	/// Set or clear the spend of a stored record. Returns `false` if it is not stored.
	pub fn update_spending_details(
		&mut self,
		outpoint: &OutPoint,
		spending_details: Option<SpendingDetails>,
	) -> bool {
		self.mutate(outpoint, |record| record.spending_details = spending_details)
	}

	/// Move a stored record to another block, or back to the mempool with `None`.
	pub fn update_block_height(
		&mut self,
		outpoint: &OutPoint,
		block_height: Option<u32>,
		block_hash: Option<BlockHash>,
	) -> bool {
		self.mutate(outpoint, |record| {
			record.block_height = block_height;
			record.block_hash = block_hash;
		})
	}

	/// Creation time is not indexed, so it can be changed in place.
	pub fn set_creation_time(&mut self, outpoint: &OutPoint, creation_time: DateTime<Utc>) -> bool {
		let Some(id) = self.by_outpoint.get(outpoint) else {
			return false;
		};
		match self.records.get_mut(id) {
			Some(record) => {
				record.creation_time = creation_time;
				true
			}
			None => false,
		}
	}

	pub fn clear(&mut self) {
		self.records.clear();
		self.by_outpoint.clear();
		self.spendable.clear();
		self.spent_by_height.clear();
		self.withdrawals_by_deposit.clear();
	}

	fn mutate(&mut self, outpoint: &OutPoint, change: impl FnOnce(&mut UtxoRecord)) -> bool {
		let Some(id) = self.by_outpoint.get(outpoint).copied() else {
			return false;
		};
		self.unindex(id);
		if let Some(record) = self.records.get_mut(&id) {
			change(record);
		}
		self.index(id);
		true
	}

	fn index(&mut self, id: RecordId) {
		let Some(record) = self.records.get(&id) else {
			return;
		};
		let key = CoinOrderKey::of(record);

		match &record.spending_details {
			None => {
				self.spendable.insert(key, id);
			}
			Some(spend) => {
				if let Some(height) = spend.block_height {
					self.spent_by_height
						.entry(height)
						.or_default()
						.insert(key, id);
				}
				if let Some(withdrawal) = &spend.withdrawal_details {
					self.withdrawals_by_deposit
						.entry(withdrawal.matching_deposit_id)
						.or_default()
						.insert(key, id);
				}
			}
		}
	}

	fn unindex(&mut self, id: RecordId) {
		let Some(record) = self.records.get(&id) else {
			return;
		};
		let key = CoinOrderKey::of(record);

		self.spendable.remove(&key);
		if let Some(height) = record.spent_height() {
			if let Some(ids) = self.spent_by_height.get_mut(&height) {
				ids.remove(&key);
				if ids.is_empty() {
					self.spent_by_height.remove(&height);
				}
			}
		}
		if let Some(withdrawal) = record.withdrawal_details() {
			let deposit_id = withdrawal.matching_deposit_id;
			if let Some(ids) = self.withdrawals_by_deposit.get_mut(&deposit_id) {
				ids.remove(&key);
				if ids.is_empty() {
					self.withdrawals_by_deposit.remove(&deposit_id);
				}
			}
		}
	}

	/// Check every index against the record fields.
	pub fn check_consistency(&self) -> Result<(), String> {
		if self.by_outpoint.len() != self.records.len() {
			return Err("primary map and arena disagree".to_string());
		}

		let mut expected_spendable = 0;
		let mut expected_spent = 0;
		let mut expected_withdrawals = 0;

		for (outpoint, id) in &self.by_outpoint {
			let record = self
				.records
				.get(id)
				.ok_or_else(|| format!("{} points at a missing record", outpoint))?;
			if record.outpoint() != *outpoint {
				return Err(format!("{} filed under the wrong outpoint", outpoint));
			}
			let key = CoinOrderKey::of(record);

			if record.is_spendable() {
				expected_spendable += 1;
				if self.spendable.get(&key) != Some(id) {
					return Err(format!("spendable {} missing from spendable index", outpoint));
				}
			}
			if let Some(height) = record.spent_height() {
				expected_spent += 1;
				if let Some(block_height) = record.block_height {
					if height < block_height {
						return Err(format!("{} spent below its own height", outpoint));
					}
				}
				let filed = self
					.spent_by_height
					.get(&height)
					.and_then(|ids| ids.get(&key));
				if filed != Some(id) {
					return Err(format!("{} missing from spend height {}", outpoint, height));
				}
			}
			if let Some(withdrawal) = record.withdrawal_details() {
				expected_withdrawals += 1;
				let filed = self
					.withdrawals_by_deposit
					.get(&withdrawal.matching_deposit_id)
					.and_then(|ids| ids.get(&key));
				if filed != Some(id) {
					return Err(format!("{} missing from withdrawal index", outpoint));
				}
			}
		}

		let spent_entries: usize = self.spent_by_height.values().map(|ids| ids.len()).sum();
		let withdrawal_entries: usize = self
			.withdrawals_by_deposit
			.values()
			.map(|ids| ids.len())
			.sum();
		if self.spendable.len() != expected_spendable
			|| spent_entries != expected_spent
			|| withdrawal_entries != expected_withdrawals
		{
			return Err("stale entries left in an index".to_string());
		}
		Ok(())
	}
}

impl PartialEq for MultiSigLedger {
	fn eq(&self, other: &Self) -> bool {
		self.records() == other.records()
	}
}

impl Eq for MultiSigLedger {}

impl Serialize for MultiSigLedger {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.collect_seq(self.records())
	}
}

impl<'de> Deserialize<'de> for MultiSigLedger {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let records = Vec::<UtxoRecord>::deserialize(deserializer)?;
		let mut ledger = MultiSigLedger::new();
		for record in records {
			ledger.add(record);
		}
		Ok(ledger)
	}
}
