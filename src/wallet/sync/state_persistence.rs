//! State persistence service for the federation wallet.
//!
//! Mutating wallet operations save the wallet themselves. This service adds the periodic
//! save that bounds how much mempool state can be lost, and a final save on shutdown.

use crate::wallet::FederationWalletManager;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Runs the periodic save loop for a wallet manager.
pub struct StatePersistenceService {
    wallet: Arc<FederationWalletManager>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
}

impl StatePersistenceService {
    pub fn new(wallet: Arc<FederationWalletManager>, shutdown: Arc<AtomicBool>) -> Self {
        let interval = wallet.settings().save_interval();
        Self {
            wallet,
            interval,
            shutdown,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Save once, logging instead of failing.
    pub async fn save_now(&self) -> bool {
        match self.wallet.save_wallet().await {
            Ok(()) => {
                debug!("Periodic wallet save completed");
                true
            }
            Err(e) => {
                warn!("Periodic wallet save failed: {}", e);
                false
            }
        }
    }

    /// Spawn the save loop. It saves every interval until the shutdown flag is raised,
    /// then saves one last time.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Saving wallet every {:?}", self.interval);
            let mut ticker = tokio::time::interval(self.interval);
            // The first tick completes immediately
            ticker.tick().await;

            while !self.shutdown.load(Ordering::SeqCst) {
                ticker.tick().await;
                if self.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                self.save_now().await;
            }

            self.save_now().await;
            info!("Wallet save loop stopped");
        })
    }
}
