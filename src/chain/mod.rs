//! Contracts between the ledger and the rest of the node.
//!
//! The ledger does not validate blocks, talk to peers or own the block database. It reads
//! headers from a `ChainIndexer`, fetches full blocks from a `BlockStore`, asks a
//! `WithdrawalExtractor` whether a transaction is a federation withdrawal and a `FeePolicy`
//! what a transaction should pay.

/// Collaborator traits
mod collaborators;
/// OP_RETURN based withdrawal recognition
mod extractor;
/// Headers, deposit ids and chain errors
mod types;

pub use collaborators::*;
pub use extractor::OpReturnWithdrawalExtractor;
pub use types::*;
