use solana_sdk::signature::{Keypair, Signer};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{info, warn};

use crate::ports::WalletService;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("Failed to load keypair from file: {0}")]
    LoadError(String),
    #[error("Invalid keypair bytes: {0}")]
    InvalidKeypair(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Load keypair from a file path (JSON array format)
pub fn read_keypair<P: AsRef<Path>>(path: P) -> Result<Keypair, WalletError> {
    let contents = fs::read_to_string(path.as_ref())
        .map_err(|e| WalletError::LoadError(format!("Failed to read file: {}", e)))?;

    // Parse JSON array of bytes
    let bytes: Vec<u8> = serde_json::from_str(&contents)
        .map_err(|e| WalletError::LoadError(format!("Invalid JSON format: {}", e)))?;

    keypair_from_bytes(&bytes)
}

/// Load keypair from raw bytes
pub fn keypair_from_bytes(bytes: &[u8]) -> Result<Keypair, WalletError> {
    Keypair::try_from(bytes).map_err(|e| WalletError::InvalidKeypair(e.to_string()))
}

/// Save keypair to file (JSON array format)
pub fn write_keypair<P: AsRef<Path>>(keypair: &Keypair, path: P) -> Result<(), WalletError> {
    let bytes = keypair.to_bytes().to_vec();
    let json = serde_json::to_string(&bytes)
        .map_err(|e| WalletError::LoadError(format!("Failed to serialize: {}", e)))?;

    fs::write(path.as_ref(), json)?;
    Ok(())
}

/// Keypair-file wallet. Starts locked; `unlock` checks the password and loads the
/// keypair from disk.
pub struct KeypairWallet {
    path: Option<PathBuf>,
    password: String,
    keypair: RwLock<Option<Arc<Keypair>>>,
}

impl KeypairWallet {
    /// Locked wallet over a keypair file, unlocked by `password`
    pub fn new<P: Into<PathBuf>>(path: P, password: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            password: password.into(),
            keypair: RwLock::new(None),
        }
    }

    /// Locked wallet whose password comes from `WALLET_PASSWORD` (empty when unset)
    pub fn from_env<P: Into<PathBuf>>(path: P) -> Self {
        let password = std::env::var("WALLET_PASSWORD").unwrap_or_default();
        Self::new(path, password)
    }

    /// Already-unlocked wallet around an in-memory keypair (paper mode and tests)
    pub fn ephemeral(keypair: Keypair) -> Self {
        Self {
            path: None,
            password: String::new(),
            keypair: RwLock::new(Some(Arc::new(keypair))),
        }
    }

    /// Drop the loaded keypair
    pub fn lock(&self) {
        if let Some(path) = &self.path {
            *self.keypair.write().unwrap_or_else(|e| e.into_inner()) = None;
            info!(path = %path.display(), "Wallet locked");
        }
    }

    /// Sign arbitrary bytes with the unlocked keypair
    pub fn sign_message(&self, message: &[u8]) -> Option<solana_sdk::signature::Signature> {
        self.get_current_keypair().map(|k| k.sign_message(message))
    }
}

impl WalletService for KeypairWallet {
    fn is_unlocked(&self) -> bool {
        self.keypair
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn get_current_keypair(&self) -> Option<Arc<Keypair>> {
        self.keypair.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn unlock(&self, password: &str) -> bool {
        if self.is_unlocked() {
            return true;
        }
        let Some(path) = &self.path else {
            return false;
        };
        if password != self.password {
            warn!(path = %path.display(), "Wallet unlock rejected: wrong password");
            return false;
        }

        match read_keypair(path) {
            Ok(keypair) => {
                info!(pubkey = %keypair.pubkey(), "Wallet unlocked");
                *self.keypair.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(keypair));
                true
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Wallet unlock failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn keypair_file(keypair: &Keypair) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        write_keypair(keypair, file.path()).unwrap();
        file
    }

    #[test]
    fn test_starts_locked() {
        let file = keypair_file(&Keypair::new());
        let wallet = KeypairWallet::new(file.path(), "hunter2");
        assert!(!wallet.is_unlocked());
        assert!(wallet.get_current_keypair().is_none());
        assert!(wallet.public_key().is_none());
    }

    #[test]
    fn test_unlock_with_password() {
        let keypair = Keypair::new();
        let expected = keypair.pubkey().to_string();
        let file = keypair_file(&keypair);
        let wallet = KeypairWallet::new(file.path(), "hunter2");

        assert!(!wallet.unlock("wrong"));
        assert!(!wallet.is_unlocked());

        assert!(wallet.unlock("hunter2"));
        assert!(wallet.is_unlocked());
        assert_eq!(wallet.public_key(), Some(expected));
    }

    #[test]
    fn test_lock_drops_keypair() {
        let file = keypair_file(&Keypair::new());
        let wallet = KeypairWallet::new(file.path(), "");
        assert!(wallet.unlock(""));
        wallet.lock();
        assert!(!wallet.is_unlocked());
    }

    #[test]
    fn test_unlock_missing_file_fails() {
        let wallet = KeypairWallet::new("/nonexistent/id.json", "pw");
        assert!(!wallet.unlock("pw"));
    }

    #[test]
    fn test_invalid_json_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(b"not valid json").unwrap();
        temp_file.flush().unwrap();

        assert!(read_keypair(temp_file.path()).is_err());
        let wallet = KeypairWallet::new(temp_file.path(), "");
        assert!(!wallet.unlock(""));
    }

    #[test]
    fn test_invalid_bytes() {
        let invalid_bytes = vec![0u8; 10]; // Too short
        assert!(keypair_from_bytes(&invalid_bytes).is_err());
    }

    #[test]
    fn test_ephemeral_is_unlocked_and_signs() {
        let wallet = KeypairWallet::ephemeral(Keypair::new());
        assert!(wallet.is_unlocked());
        assert_eq!(wallet.public_key().unwrap().len(), 44);

        let signature = wallet.sign_message(b"Hello, Solana!").unwrap();
        assert_eq!(signature.as_ref().len(), 64);
    }
}
