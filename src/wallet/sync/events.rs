//! Event system for wallet synchronization.
//!
//! The sync manager reports what it did to the chain view of the wallet through `SyncEvent`s.
//! Handlers are registered on an `EventDispatcher`; a failing handler is logged and never
//! interrupts block processing.

use crate::wallet::WalletError;

use bitcoin::BlockHash;
use tracing::{debug, info, warn};

/// Events emitted while the wallet follows the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A block was applied on top of the wallet tip
    BlockConnected {
        height: u32,
        hash: BlockHash,
        /// Whether any federation record changed
        changed: bool,
    },
    /// The wallet was rewound to a fork point
    BlocksDisconnected {
        fork_height: u32,
        fork_hash: BlockHash,
        previous_tip_height: u32,
    },
    /// Catch-up stopped because a block is not in the store yet
    CatchUpStalled { height: u32, hash: BlockHash },
    /// Catch-up reached the block that triggered it
    CatchUpCompleted { tip_height: u32 },
}

/// Trait for handling sync events.
#[async_trait::async_trait]
pub trait SyncEventHandler: Send + Sync {
    /// Handle a sync event.
    async fn handle(&mut self, event: &SyncEvent) -> Result<(), WalletError>;

    /// Get the name of this handler for logging and diagnostics.
    fn name(&self) -> &'static str;
}

/// Event dispatcher that manages multiple event handlers.
///
/// Handlers are called in the order they are registered.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Box<dyn SyncEventHandler>>,
}

impl EventDispatcher {
    /// Create a new, empty event dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new event handler.
    pub fn register_handler(&mut self, handler: Box<dyn SyncEventHandler>) {
        self.handlers.push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Dispatch an event to all registered handlers.
    ///
    /// Errors from handlers are logged, but do not stop other handlers from running.
    pub async fn dispatch(&mut self, event: &SyncEvent) {
        for handler in &mut self.handlers {
            if let Err(e) = handler.handle(event).await {
                tracing::error!("Handler {} failed to process event: {}", handler.name(), e);
            }
        }
    }
}

/// Logs every event.
pub struct LoggingEventHandler;

#[async_trait::async_trait]
impl SyncEventHandler for LoggingEventHandler {
    async fn handle(&mut self, event: &SyncEvent) -> Result<(), WalletError> {
        match event {
            SyncEvent::BlockConnected {
                height,
                hash,
                changed,
            } => {
                if *changed {
                    info!("Block {} ({}) changed the federation wallet", height, hash);
                } else {
                    debug!("Block {} ({}) connected", height, hash);
                }
            }
            SyncEvent::BlocksDisconnected {
                fork_height,
                fork_hash,
                previous_tip_height,
            } => {
                warn!(
                    "Reorg: rewound wallet from height {} to fork {} ({})",
                    previous_tip_height, fork_height, fork_hash
                );
            }
            SyncEvent::CatchUpStalled { height, hash } => {
                info!("Catch-up paused at {} ({}): block not stored yet", height, hash);
            }
            SyncEvent::CatchUpCompleted { tip_height } => {
                info!("Catch-up completed at height {}", tip_height);
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "logging"
    }
}
