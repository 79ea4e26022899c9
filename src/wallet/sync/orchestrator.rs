//! Chain-following front end of the federation wallet.
//!
//! `WalletSyncManager` sits between block delivery and the wallet manager. It keeps its own
//! view of the wallet tip, recognizes when an incoming block does not extend it, rewinds the
//! wallet to the fork point after a reorganization and replays the missing blocks from the
//! block store before applying the incoming one.
//!
//! The manager is responsible for:
//! - Start-up recovery from the persisted block locator
//! - Rolling back history that no longer resolves on the current chain
//! - Catch-up replay with a bounded retry for blocks the store does not have yet
//! - Emitting `SyncEvent`s for registered handlers
//!
//! Block fetch retries sleep while holding only the sync tip lock, never the wallet lock.

use crate::chain::{BlockStore, BlockStoreError, ChainError, ChainIndexer, ChainedHeader};
use crate::wallet::sync::events::{EventDispatcher, SyncEvent, SyncEventHandler};
use crate::wallet::sync::progress_tracker::SyncProgressTracker;
use crate::wallet::sync::queue::{IngestionQueue, QueueConsumer};
use crate::wallet::{FederationWalletManager, WalletError, WalletState};

use backoff::ExponentialBackoffBuilder;
use backoff::future::retry;
use bitcoin::{Block, Transaction};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Retry policy for fetching blocks during catch-up
#[derive(Debug, Clone, Copy)]
pub struct SyncConfig {
    /// Attempts per block before catch-up pauses
    pub block_fetch_retries: u32,
    pub block_fetch_retry_interval: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            block_fetch_retries: 10,
            block_fetch_retry_interval: Duration::from_millis(100),
        }
    }
}

/// Follows the chain on behalf of a `FederationWalletManager`.
pub struct WalletSyncManager {
    wallet: Arc<FederationWalletManager>,
    chain: Arc<dyn ChainIndexer>,
    block_store: Arc<dyn BlockStore>,
    config: SyncConfig,
    /// Last block the wallet applied, as seen by the sync loop
    tip: Mutex<Option<ChainedHeader>>,
    shutdown: Arc<AtomicBool>,
    events: Mutex<EventDispatcher>,
}

enum CatchUp {
    Reached(ChainedHeader),
    Stalled,
    Cancelled,
}

impl WalletSyncManager {
    pub fn new(
        wallet: Arc<FederationWalletManager>,
        chain: Arc<dyn ChainIndexer>,
        block_store: Arc<dyn BlockStore>,
    ) -> Self {
        let settings = wallet.settings();
        let config = SyncConfig {
            block_fetch_retries: settings.block_fetch_retries,
            block_fetch_retry_interval: settings.block_fetch_retry_interval(),
        };

        Self {
            wallet,
            chain,
            block_store,
            config,
            tip: Mutex::new(None),
            shutdown: Arc::new(AtomicBool::new(false)),
            events: Mutex::new(EventDispatcher::new()),
        }
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn wallet(&self) -> &Arc<FederationWalletManager> {
        &self.wallet
    }

    /// Flag observed between replayed blocks; raise it to abandon a catch-up.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn stop(&self) {
        info!("Stopping wallet sync");
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub async fn register_handler(&self, handler: Box<dyn SyncEventHandler>) {
        self.events.lock().await.register_handler(handler);
    }

    pub async fn tip(&self) -> Option<ChainedHeader> {
        *self.tip.lock().await
    }

    /// Bring the wallet onto the current chain.
    ///
    /// Loads the wallet if needed, rewinds it to the last block of its locator that is still
    /// on the main chain and rolls back any stored history that no longer resolves.
    pub async fn start(&self) -> Result<ChainedHeader, WalletError> {
        if self.wallet.state().await == WalletState::Uninitialized {
            self.wallet.start().await?;
        }

        let mut tip = self.tip.lock().await;
        let mut current = self.resume_point().await?;

        // Each pass removes everything at or above the lowest broken height
        while let Some(height) = self.wallet.find_unresolvable_history().await {
            warn!("{}", WalletError::UnresolvableSpendingHistory { height });
            let fork = self
                .chain
                .header_at(height.saturating_sub(1))
                .ok_or_else(|| ChainError::HeaderNotFound(format!("height {}", height)))?;
            if fork.height >= current.height {
                warn!("Cannot roll back below {}, keeping unresolved history", current);
                break;
            }
            self.rewind(&current, &fork).await?;
            current = fork;
        }

        info!("Wallet sync starting from {}", current);
        *tip = Some(current);
        Ok(current)
    }

    async fn resume_point(&self) -> Result<ChainedHeader, WalletError> {
        let (_, wallet_hash) = self
            .wallet
            .wallet_tip()
            .await
            .ok_or(WalletError::WalletNotLoaded)?;

        if self.chain.is_on_main_chain(&wallet_hash) {
            if let Some(header) = self.chain.header_by_hash(&wallet_hash) {
                return Ok(header);
            }
        }

        let locator = self.wallet.block_locator().await;
        let fork = self
            .chain
            .find_fork(&locator)
            .or_else(|| self.chain.header_at(0))
            .ok_or(ChainError::NoCommonAncestor)?;
        warn!(
            "Wallet tip {} is not on the main chain, recovering from locator at {}",
            wallet_hash, fork
        );
        self.wallet.remove_blocks(&fork).await?;
        Ok(fork)
    }

    /// Process the block the node just connected.
    pub async fn process_block(&self, block: Block) -> Result<(), WalletError> {
        let hash = block.block_hash();
        let Some(header) = self.chain.header_by_hash(&hash) else {
            warn!("Ignoring unknown block {}", hash);
            return Ok(());
        };
        if !self.chain.is_on_main_chain(&hash) {
            debug!("Ignoring block {} off the main chain", header);
            return Ok(());
        }

        let mut tip = self.tip.lock().await;
        let current = match *tip {
            Some(current) => current,
            None => self.tip_from_wallet().await?,
        };

        let result = match self.sync_to(&mut tip, current, &block, &header).await {
            Err(WalletError::BlockTooFarInFuture { height, tip_height }) => {
                warn!(
                    "Block {} is ahead of wallet tip {}, resyncing from the wallet",
                    height, tip_height
                );
                let current = self.tip_from_wallet().await?;
                *tip = Some(current);
                self.sync_to(&mut tip, current, &block, &header).await
            }
            other => other,
        };

        if let Err(e) = &result {
            error!("Failed to process block {}: {}", header, e);
        }
        result
    }

    /// Pass a mempool transaction to the wallet.
    pub async fn process_transaction(&self, transaction: &Transaction) -> Result<bool, WalletError> {
        self.wallet
            .process_transaction(transaction, None, None, None)
            .await
    }

    async fn tip_from_wallet(&self) -> Result<ChainedHeader, WalletError> {
        let (height, hash) = self
            .wallet
            .wallet_tip()
            .await
            .ok_or(WalletError::WalletNotLoaded)?;
        self.chain
            .header_by_hash(&hash)
            .ok_or_else(|| ChainError::HeaderNotFound(format!("{} at height {}", hash, height)).into())
    }

    async fn sync_to(
        &self,
        tip: &mut Option<ChainedHeader>,
        mut current: ChainedHeader,
        block: &Block,
        header: &ChainedHeader,
    ) -> Result<(), WalletError> {
        if !self.chain.is_on_main_chain(&current.hash()) {
            let fork = self.find_fork_from(&current).await?;
            self.rewind(&current, &fork).await?;
            current = fork;
            *tip = Some(current);
        }
        if header.height <= current.height {
            debug!("Block {} already behind sync tip {}", header, current);
            return Ok(());
        }

        if header.prev_hash() != current.hash() {
            match self.catch_up(tip, current, header).await? {
                CatchUp::Reached(reached) => current = reached,
                CatchUp::Stalled | CatchUp::Cancelled => return Ok(()),
            }
            if header.prev_hash() != current.hash() {
                return Err(ChainError::NoCommonAncestor.into());
            }
        }

        self.apply(tip, block, header).await
    }

    /// Walk back from a stale tip to its last main-chain ancestor.
    async fn find_fork_from(&self, stale: &ChainedHeader) -> Result<ChainedHeader, WalletError> {
        let mut cursor = *stale;
        while !self.chain.is_on_main_chain(&cursor.hash()) {
            match self.chain.header_by_hash(&cursor.prev_hash()) {
                Some(parent) => cursor = parent,
                None => {
                    let locator = self.wallet.block_locator().await;
                    return self
                        .chain
                        .find_fork(&locator)
                        .or_else(|| self.chain.header_at(0))
                        .ok_or_else(|| ChainError::NoCommonAncestor.into());
                }
            }
        }
        Ok(cursor)
    }

    async fn rewind(&self, from: &ChainedHeader, fork: &ChainedHeader) -> Result<(), WalletError> {
        self.wallet.remove_blocks(fork).await?;
        self.events
            .lock()
            .await
            .dispatch(&SyncEvent::BlocksDisconnected {
                fork_height: fork.height,
                fork_hash: fork.hash(),
                previous_tip_height: from.height,
            })
            .await;
        Ok(())
    }

    /// Replay main-chain blocks from `current` up to the parent of `target`.
    async fn catch_up(
        &self,
        tip: &mut Option<ChainedHeader>,
        mut current: ChainedHeader,
        target: &ChainedHeader,
    ) -> Result<CatchUp, WalletError> {
        info!(
            "Catching up from {} to height {}",
            current,
            target.height.saturating_sub(1)
        );
        let mut progress = SyncProgressTracker::new(current.height, target.height - 1);

        for height in current.height + 1..target.height {
            if self.shutdown.load(Ordering::SeqCst) {
                info!("Catch-up cancelled at height {}", current.height);
                return Ok(CatchUp::Cancelled);
            }

            let header = self
                .chain
                .header_at(height)
                .ok_or_else(|| ChainError::HeaderNotFound(format!("height {}", height)))?;
            let Some(block) = self.fetch_block(&header).await? else {
                self.events
                    .lock()
                    .await
                    .dispatch(&SyncEvent::CatchUpStalled {
                        height,
                        hash: header.hash(),
                    })
                    .await;
                return Ok(CatchUp::Stalled);
            };

            let changed = self.wallet.process_block(&block, &header).await?;
            progress.record_processed(height, changed);
            progress.log_progress(false);
            self.connected(tip, &header, changed).await;
            current = header;
        }

        progress.validate_completion();
        info!("{}", progress.get_stats().summary());
        self.events
            .lock()
            .await
            .dispatch(&SyncEvent::CatchUpCompleted {
                tip_height: current.height,
            })
            .await;
        Ok(CatchUp::Reached(current))
    }

    /// Fetch a block, retrying while the store reports it as not yet available.
    async fn fetch_block(&self, header: &ChainedHeader) -> Result<Option<Block>, WalletError> {
        let hash = header.hash();
        let interval = self.config.block_fetch_retry_interval;
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(interval)
            .with_multiplier(1.0)
            .with_randomization_factor(0.0)
            .with_max_interval(interval)
            .with_max_elapsed_time(None)
            .build();

        let retries = self.config.block_fetch_retries.max(1);
        let mut attempts = 0u32;
        let result = retry(policy, || {
            attempts += 1;
            let last_attempt = attempts >= retries;
            async move {
                self.block_store.get_block(&hash).await.map_err(|e| match e {
                    BlockStoreError::NotYetAvailable(_) if !last_attempt => {
                        debug!("Block {} not available yet, retrying", hash);
                        backoff::Error::transient(e)
                    }
                    other => backoff::Error::permanent(other),
                })
            }
        })
        .await;

        match result {
            Ok(block) => Ok(Some(block)),
            Err(BlockStoreError::NotYetAvailable(_)) => {
                warn!(
                    "Block {} still not available after {} attempts, pausing catch-up",
                    header, attempts
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply(
        &self,
        tip: &mut Option<ChainedHeader>,
        block: &Block,
        header: &ChainedHeader,
    ) -> Result<(), WalletError> {
        let changed = self.wallet.process_block(block, header).await?;
        self.connected(tip, header, changed).await;
        Ok(())
    }

    async fn connected(&self, tip: &mut Option<ChainedHeader>, header: &ChainedHeader, changed: bool) {
        *tip = Some(*header);
        self.events
            .lock()
            .await
            .dispatch(&SyncEvent::BlockConnected {
                height: header.height,
                hash: header.hash(),
                changed,
            })
            .await;
    }

    /// Feed this manager from a byte-bounded ingestion queue.
    pub fn spawn_ingestion_queue(self: &Arc<Self>) -> IngestionQueue<Block> {
        let settings = self.wallet.settings();
        IngestionQueue::spawn(
            self.clone(),
            usize::try_from(settings.queue_max_bytes).unwrap_or(usize::MAX),
            usize::try_from(settings.queue_resume_bytes).unwrap_or(usize::MAX),
        )
    }
}

#[async_trait::async_trait]
impl QueueConsumer<Block> for WalletSyncManager {
    async fn consume(&self, block: Block) {
        // Failures are logged by process_block; the next block retries the catch-up
        let _ = self.process_block(block).await;
    }

    fn name(&self) -> &'static str {
        "wallet-sync"
    }
}
