pub mod keys;
pub mod ledger;
pub mod manager;
pub mod ordering;
pub mod record;
pub mod sync;
pub mod types;
pub mod validation;

pub use ledger::MultiSigLedger;
pub use manager::{FederationWalletManager, SpendableAmount, WithdrawalTransaction};
pub use ordering::{CoinOrderKey, CoinSelection, CoinSelector, DeterministicCoinSelector};
pub use record::*;
pub use sync::WalletSyncManager;
pub use types::*;
pub use validation::{TransactionValidation, ValidationIssue};
