//! Wallet Synchronization Module
//!
//! Keeps the federation wallet in step with the chain. It is composed of several submodules:
//!
//! - `orchestrator`: `WalletSyncManager`, which detects reorganizations, rewinds the wallet and
//!   replays missing blocks from the block store.
//! - `queue`: the byte-bounded ingestion queue that decouples block delivery from processing.
//! - `events`: event types and handlers notified as blocks are connected and disconnected.
//! - `progress_tracker`: progress and gap detection for catch-up replays.
//! - `repositories`: wallet file persistence.
//! - `state_persistence`: the periodic save loop.

/// Event system for sync notifications
pub mod events;
/// Main coordinator for following the chain
pub mod orchestrator;
/// Tracks catch-up progress and statistics
pub mod progress_tracker;
/// Byte-bounded block ingestion
pub mod queue;
/// Wallet file persistence
pub mod repositories;
/// Periodic wallet saving
pub mod state_persistence;

pub use orchestrator::*;
