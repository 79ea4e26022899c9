/// Deterministic withdrawal and consolidation builder
pub mod builder;
/// Size and fee estimation
pub mod fees;
/// Partial P2SH multisig signing
pub mod signing;

pub use builder::{
	BuiltTransaction, PolicyError, Recipient, TransactionError, WithdrawalTransactionBuilder,
};
