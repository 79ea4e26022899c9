use bitcoin::block::Header;
use bitcoin::{Amount, BlockHash};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// A block header together with its height on the chain it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainedHeader {
	pub height: u32,
	pub header: Header,
}

impl ChainedHeader {
	pub fn new(height: u32, header: Header) -> Self {
		Self { height, header }
	}

	pub fn hash(&self) -> BlockHash {
		self.header.block_hash()
	}

	pub fn prev_hash(&self) -> BlockHash {
		self.header.prev_blockhash
	}

	/// Block timestamp as a UTC datetime.
	pub fn time(&self) -> chrono::DateTime<chrono::Utc> {
		chrono::DateTime::from_timestamp(i64::from(self.header.time), 0).unwrap_or_default()
	}
}

impl fmt::Display for ChainedHeader {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}-{}", self.height, self.hash())
	}
}

/// Identifier of the sidechain deposit a withdrawal pays out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DepositId(pub [u8; 32]);

impl DepositId {
	pub fn as_bytes(&self) -> &[u8; 32] {
		&self.0
	}
}

impl fmt::Display for DepositId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&hex::encode(self.0))
	}
}

impl FromStr for DepositId {
	type Err = hex::FromHexError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let mut bytes = [0u8; 32];
		hex::decode_to_slice(s, &mut bytes)?;
		Ok(Self(bytes))
	}
}

impl Serialize for DepositId {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_string())
	}
}

impl<'de> Deserialize<'de> for DepositId {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		s.parse().map_err(serde::de::Error::custom)
	}
}

/// A withdrawal recognized inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Withdrawal {
	pub deposit_id: DepositId,
	pub amount: Amount,
	pub target_address: String,
	/// Height of the including block, `None` while in the mempool.
	pub block_number: Option<u32>,
	pub block_hash: Option<BlockHash>,
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
	#[error("Header not found: {0}")]
	HeaderNotFound(String),

	#[error("No common ancestor with block locator")]
	NoCommonAncestor,
}

#[derive(Debug, thiserror::Error)]
pub enum BlockStoreError {
	/// The block is known but the store has not caught up with it yet.
	#[error("Block {0} not yet available")]
	NotYetAvailable(BlockHash),

	#[error("Block {0} not found")]
	NotFound(BlockHash),

	#[error("Block store backend error: {0}")]
	Backend(String),
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn deposit_id_hex_round_trip() {
		let id = DepositId([0xab; 32]);
		let json = serde_json::to_string(&id).unwrap();
		assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
		assert_eq!(serde_json::from_str::<DepositId>(&json).unwrap(), id);
	}

	#[test]
	fn deposit_id_rejects_short_hex() {
		assert!("abcd".parse::<DepositId>().is_err());
	}
}
