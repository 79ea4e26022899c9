//! Deterministic coin ordering and selection.
//!
//! Every federation member must pick exactly the same inputs for a withdrawal without
//! talking to the others. Coins are ordered by confirmation height (unconfirmed last), then
//! by transaction id read as a 256-bit little-endian number, then by output index, and
//! selection always takes the oldest coins first without skipping any.

use crate::wallet::record::UtxoRecord;

use bitcoin::hashes::Hash;
use bitcoin::{Amount, OutPoint, Txid};
use std::cmp::Ordering;

/// Sort key equivalent to the deterministic comparator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CoinOrderKey {
	block_height: Option<u32>,
	txid: Txid,
	index: u32,
}

impl CoinOrderKey {
	pub fn new(block_height: Option<u32>, txid: Txid, index: u32) -> Self {
		Self {
			block_height,
			txid,
			index,
		}
	}

	pub fn of(record: &UtxoRecord) -> Self {
		Self::new(record.block_height, record.id, record.index)
	}

	pub fn outpoint(&self) -> OutPoint {
		OutPoint::new(self.txid, self.index)
	}
}

/// Txid bytes most significant first, so byte order equals numeric order.
fn numeric_txid(txid: &Txid) -> [u8; 32] {
	let mut bytes = txid.to_byte_array();
	bytes.reverse();
	bytes
}

impl Ord for CoinOrderKey {
	fn cmp(&self, other: &Self) -> Ordering {
		let by_height = match (self.block_height, other.block_height) {
			(Some(a), Some(b)) => a.cmp(&b),
			(Some(_), None) => Ordering::Less,
			(None, Some(_)) => Ordering::Greater,
			(None, None) => Ordering::Equal,
		};
		by_height
			.then_with(|| numeric_txid(&self.txid).cmp(&numeric_txid(&other.txid)))
			.then_with(|| self.index.cmp(&other.index))
	}
}

impl PartialOrd for CoinOrderKey {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

pub fn compare_records(a: &UtxoRecord, b: &UtxoRecord) -> Ordering {
	CoinOrderKey::of(a).cmp(&CoinOrderKey::of(b))
}

/// Sort records into deterministic coin order.
pub fn sort_records(records: &mut [UtxoRecord]) {
	records.sort_by(compare_records);
}

/// Inputs chosen for a transaction and the fee they were chosen against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinSelection {
	pub coins: Vec<UtxoRecord>,
	pub total: Amount,
	pub fee: Amount,
}

/// Picks inputs for a target amount.
///
/// `fee_for_inputs` returns the fee of the finished transaction when it spends the given
/// number of inputs, so the selector can stop as soon as the fee is covered too.
pub trait CoinSelector: Send + Sync {
	fn select(
		&self,
		candidates: &[UtxoRecord],
		target: Amount,
		fee_for_inputs: &dyn Fn(usize) -> Amount,
	) -> Option<CoinSelection>;

	fn name(&self) -> &'static str;
}

/// Oldest-first accumulation over the candidates in coin order.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeterministicCoinSelector;

impl CoinSelector for DeterministicCoinSelector {
	fn select(
		&self,
		candidates: &[UtxoRecord],
		target: Amount,
		fee_for_inputs: &dyn Fn(usize) -> Amount,
	) -> Option<CoinSelection> {
		let mut ordered = candidates.to_vec();
		sort_records(&mut ordered);

		let mut coins = Vec::new();
		let mut total = Amount::ZERO;
		for coin in ordered {
			total = total.checked_add(coin.amount)?;
			coins.push(coin);

			let fee = fee_for_inputs(coins.len());
			if total >= target.checked_add(fee)? {
				return Some(CoinSelection { coins, total, fee });
			}
		}
		None
	}

	fn name(&self) -> &'static str {
		"deterministic"
	}
}

/// Spends every candidate, for consolidating many small outputs into one.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsolidationCoinSelector;

impl CoinSelector for ConsolidationCoinSelector {
	fn select(
		&self,
		candidates: &[UtxoRecord],
		target: Amount,
		fee_for_inputs: &dyn Fn(usize) -> Amount,
	) -> Option<CoinSelection> {
		if candidates.is_empty() {
			return None;
		}
		let mut coins = candidates.to_vec();
		sort_records(&mut coins);

		let total = coins
			.iter()
			.try_fold(Amount::ZERO, |acc, coin| acc.checked_add(coin.amount))?;
		let fee = fee_for_inputs(coins.len());
		(total >= target.checked_add(fee)?).then_some(CoinSelection { coins, total, fee })
	}

	fn name(&self) -> &'static str {
		"consolidation"
	}
}
