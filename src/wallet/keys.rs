//! Member key material.
//!
//! The member's private key is stored encrypted under a password-derived key (Argon2 then
//! ChaCha20-Poly1305). Deriving that key is deliberately slow, so a decrypted key is kept
//! in a short-lived cache while withdrawals are being signed.

use crate::wallet::WalletError;

use bitcoin::bip32::Xpriv;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{Network, PublicKey};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// Encrypted member secret, persisted as one hex string of `salt || nonce || ciphertext`.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptedSeed {
	salt: [u8; SALT_LEN],
	nonce: [u8; NONCE_LEN],
	ciphertext: Vec<u8>,
}

impl std::fmt::Debug for EncryptedSeed {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EncryptedSeed").finish_non_exhaustive()
	}
}

fn derive_key(password: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, WalletError> {
	let mut key = Zeroizing::new([0u8; 32]);
	argon2::Argon2::default()
		.hash_password_into(password.as_bytes(), salt, &mut key[..])
		.map_err(|e| WalletError::Crypto(e.to_string()))?;
	Ok(key)
}

impl EncryptedSeed {
	pub fn encrypt(secret: &SecretKey, password: &str) -> Result<Self, WalletError> {
		let salt: [u8; SALT_LEN] = rand::random();
		let nonce: [u8; NONCE_LEN] = rand::random();

		let key = derive_key(password, &salt)?;
		let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
		let plaintext = Zeroizing::new(secret.secret_bytes());
		let ciphertext = cipher
			.encrypt(Nonce::from_slice(&nonce), &plaintext[..])
			.map_err(|e| WalletError::Crypto(e.to_string()))?;

		Ok(Self {
			salt,
			nonce,
			ciphertext,
		})
	}

	/// Fails with `InvalidPassword` when authentication of the ciphertext fails.
	pub fn decrypt(&self, password: &str) -> Result<SecretKey, WalletError> {
		let key = derive_key(password, &self.salt)?;
		let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
		let plaintext = Zeroizing::new(
			cipher
				.decrypt(Nonce::from_slice(&self.nonce), &self.ciphertext[..])
				.map_err(|_| WalletError::InvalidPassword)?,
		);
		SecretKey::from_slice(&plaintext[..]).map_err(|e| WalletError::Crypto(e.to_string()))
	}

	fn to_hex(&self) -> String {
		let mut bytes = Vec::with_capacity(SALT_LEN + NONCE_LEN + self.ciphertext.len());
		bytes.extend_from_slice(&self.salt);
		bytes.extend_from_slice(&self.nonce);
		bytes.extend_from_slice(&self.ciphertext);
		hex::encode(bytes)
	}

	fn from_hex(s: &str) -> Result<Self, String> {
		let bytes = hex::decode(s).map_err(|e| e.to_string())?;
		if bytes.len() <= SALT_LEN + NONCE_LEN {
			return Err("encrypted seed too short".to_string());
		}
		let (salt, rest) = bytes.split_at(SALT_LEN);
		let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
		Ok(Self {
			salt: salt.try_into().map_err(|_| "bad salt".to_string())?,
			nonce: nonce.try_into().map_err(|_| "bad nonce".to_string())?,
			ciphertext: ciphertext.to_vec(),
		})
	}
}

impl Serialize for EncryptedSeed {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_str(&self.to_hex())
	}
}

impl<'de> Deserialize<'de> for EncryptedSeed {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let s = String::deserialize(deserializer)?;
		Self::from_hex(&s).map_err(serde::de::Error::custom)
	}
}

/// Member secret recovered from a BIP39 mnemonic: the master key of the derived seed.
pub fn secret_from_mnemonic(
	mnemonic: &str,
	passphrase: &str,
	network: Network,
) -> Result<SecretKey, WalletError> {
	let mnemonic = bip39::Mnemonic::parse_normalized(mnemonic)
		.map_err(|e| WalletError::InvalidMnemonic(e.to_string()))?;
	let seed = Zeroizing::new(mnemonic.to_seed(passphrase));
	let master = Xpriv::new_master(network, &seed[..])
		.map_err(|e| WalletError::Crypto(e.to_string()))?;
	Ok(master.private_key)
}

/// Compressed public key of a member secret.
pub fn public_key_of(secret: &SecretKey) -> PublicKey {
	let secp = Secp256k1::signing_only();
	PublicKey::new(secret.public_key(&secp))
}

/// Decrypted signing key held for a limited time.
#[derive(Debug)]
pub struct KeyCache {
	ttl: Duration,
	entry: Option<(SecretKey, Instant)>,
}

impl KeyCache {
	pub fn new(ttl: Duration) -> Self {
		Self { ttl, entry: None }
	}

	pub fn get(&mut self) -> Option<SecretKey> {
		if let Some((key, cached_at)) = self.entry {
			if cached_at.elapsed() < self.ttl {
				return Some(key);
			}
			self.clear();
		}
		None
	}

	pub fn put(&mut self, key: SecretKey) {
		self.clear();
		self.entry = Some((key, Instant::now()));
	}

	pub fn clear(&mut self) {
		if let Some((mut key, _)) = self.entry.take() {
			key.non_secure_erase();
		}
	}
}

impl Drop for KeyCache {
	fn drop(&mut self) {
		self.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const MNEMONIC: &str =
		"abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

	#[test]
	fn encrypt_then_decrypt_with_right_password() {
		let secret = SecretKey::from_slice(&[7u8; 32]).unwrap();
		let encrypted = EncryptedSeed::encrypt(&secret, "hunter2").unwrap();

		assert_eq!(encrypted.decrypt("hunter2").unwrap(), secret);
		assert!(matches!(
			encrypted.decrypt("wrong"),
			Err(WalletError::InvalidPassword)
		));
	}

	#[test]
	fn encrypted_seed_persists_as_hex() {
		let secret = SecretKey::from_slice(&[7u8; 32]).unwrap();
		let encrypted = EncryptedSeed::encrypt(&secret, "pw").unwrap();

		let json = serde_json::to_string(&encrypted).unwrap();
		let parsed: EncryptedSeed = serde_json::from_str(&json).unwrap();
		assert_eq!(parsed, encrypted);
		assert_eq!(parsed.decrypt("pw").unwrap(), secret);
	}

	#[test]
	fn mnemonic_derivation_is_stable_and_passphrase_sensitive() {
		let a = secret_from_mnemonic(MNEMONIC, "", Network::Regtest).unwrap();
		let b = secret_from_mnemonic(MNEMONIC, "", Network::Regtest).unwrap();
		let c = secret_from_mnemonic(MNEMONIC, "extra", Network::Regtest).unwrap();

		assert_eq!(a, b);
		assert_ne!(a, c);
		assert!(matches!(
			secret_from_mnemonic("not a mnemonic", "", Network::Regtest),
			Err(WalletError::InvalidMnemonic(_))
		));
	}

	#[test]
	fn cache_expires_after_ttl() {
		let secret = SecretKey::from_slice(&[7u8; 32]).unwrap();

		let mut cache = KeyCache::new(Duration::from_secs(60));
		cache.put(secret);
		assert_eq!(cache.get(), Some(secret));

		let mut expired = KeyCache::new(Duration::ZERO);
		expired.put(secret);
		assert_eq!(expired.get(), None);
	}
}
