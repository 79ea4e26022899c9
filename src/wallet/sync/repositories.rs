use crate::wallet::{Wallet, WalletError};
use std::path::PathBuf;
use tracing::{debug, info};

/// Repository for wallet persistence
#[async_trait::async_trait]
pub trait WalletRepository: Send + Sync {
	async fn save(&self, wallet: &Wallet) -> Result<(), WalletError>;
	async fn load(&self) -> Result<Option<Wallet>, WalletError>;
}

/// File-based implementation of WalletRepository, one pretty-printed JSON document
pub struct FileWalletRepository {
	data_dir: PathBuf,
	file_name: String,
}

impl FileWalletRepository {
	pub fn new(data_dir: PathBuf, file_name: impl Into<String>) -> Self {
		Self {
			data_dir,
			file_name: file_name.into(),
		}
	}

	pub fn path(&self) -> PathBuf {
		self.data_dir.join(&self.file_name)
	}

	fn temp_path(&self) -> PathBuf {
		self.data_dir.join(format!("{}.tmp", self.file_name))
	}
}

#[async_trait::async_trait]
impl WalletRepository for FileWalletRepository {
	async fn save(&self, wallet: &Wallet) -> Result<(), WalletError> {
		tokio::fs::create_dir_all(&self.data_dir).await?;

		let content = serde_json::to_string_pretty(wallet)?;

		// Write next to the wallet file and rename over it
		let temp = self.temp_path();
		tokio::fs::write(&temp, content).await.map_err(|e| {
			WalletError::Persistence(format!("Failed to write wallet file {:?}: {}", temp, e))
		})?;
		tokio::fs::rename(&temp, self.path()).await.map_err(|e| {
			WalletError::Persistence(format!("Failed to replace wallet file: {}", e))
		})?;

		debug!(
			"Saved wallet to {:?} at height {:?}",
			self.path(),
			wallet.last_block_synced_height
		);
		Ok(())
	}

	async fn load(&self) -> Result<Option<Wallet>, WalletError> {
		let path = self.path();

		// Check if file exists
		if !tokio::fs::try_exists(&path).await? {
			return Ok(None);
		}

		let content = tokio::fs::read_to_string(&path).await?;
		let wallet: Wallet = serde_json::from_str(&content)?;

		info!(
			"Loaded wallet from {:?} at height {:?}",
			path, wallet.last_block_synced_height
		);
		Ok(Some(wallet))
	}
}
