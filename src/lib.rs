//! Ledger core for a federation-controlled multisig wallet.
//!
//! The crate tracks the outputs owned by one m-of-n multisig address as blocks arrive,
//! rolls its state back across chain reorganizations and builds withdrawal transactions
//! that every federation member can reproduce byte-for-byte.
//!
//! - `chain`: contracts for the header chain, block store, withdrawal extraction and fees.
//! - `wallet`: the record ledger, the wallet manager and the sync machinery around it.
//! - `transaction`: deterministic withdrawal building, fee estimation and multisig signing.

pub mod chain;
pub mod config;
pub mod telemetry;
pub mod transaction;
pub mod utils;
pub mod wallet;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{FederationWalletSettings, MultisigParams};
pub use wallet::{FederationWalletManager, WalletError, WalletState};
