use crate::chain::{BlockStoreError, ChainedHeader, Withdrawal};

use bitcoin::{Block, BlockHash, FeeRate, Transaction};

/// Read access to the node's header chain.
///
/// `header_by_hash` may also answer for headers on stale branches, which is what lets the
/// sync loop walk back from a tip that has been reorganized away.
pub trait ChainIndexer: Send + Sync {
	fn tip(&self) -> ChainedHeader;

	/// Main-chain header at `height`.
	fn header_at(&self, height: u32) -> Option<ChainedHeader>;

	fn header_by_hash(&self, hash: &BlockHash) -> Option<ChainedHeader>;

	fn is_on_main_chain(&self, hash: &BlockHash) -> bool;

	/// Highest main-chain header referenced by `locator`.
	fn find_fork(&self, locator: &[BlockHash]) -> Option<ChainedHeader> {
		locator
			.iter()
			.find(|hash| self.is_on_main_chain(hash))
			.and_then(|hash| self.header_by_hash(hash))
	}

	/// Block locator for a main-chain header: the ten most recent hashes, then
	/// exponentially sparser ones, always ending at genesis.
	fn locator_for(&self, header: &ChainedHeader) -> Vec<BlockHash> {
		let mut locator = vec![header.hash()];
		let mut height = header.height;
		let mut step = 1u32;

		while height > 0 {
			height = height.saturating_sub(step);
			if let Some(ancestor) = self.header_at(height) {
				locator.push(ancestor.hash());
			}
			if locator.len() >= 10 {
				step = step.saturating_mul(2);
			}
		}

		locator
	}
}

/// Source of full blocks.
#[async_trait::async_trait]
pub trait BlockStore: Send + Sync {
	/// `BlockStoreError::NotYetAvailable` is transient; the caller retries it.
	async fn get_block(&self, hash: &BlockHash) -> Result<Block, BlockStoreError>;
}

/// Recognizes federation withdrawals.
pub trait WithdrawalExtractor: Send + Sync {
	fn extract_withdrawal(
		&self,
		transaction: &Transaction,
		block_hash: Option<BlockHash>,
		block_height: Option<u32>,
	) -> Option<Withdrawal>;
}

/// Fee rate the federation pays for a given confirmation target (in blocks).
pub trait FeePolicy: Send + Sync {
	fn fee_rate(&self, confirmation_target: u32) -> FeeRate;
}

/// Same rate for every confirmation target.
#[derive(Debug, Clone, Copy)]
pub struct FixedFeePolicy(pub FeeRate);

impl FeePolicy for FixedFeePolicy {
	fn fee_rate(&self, _confirmation_target: u32) -> FeeRate {
		self.0
	}
}
