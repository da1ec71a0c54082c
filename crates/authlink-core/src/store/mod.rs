//! Durable, encrypted-at-rest persistence for the session's tokens.
//!
//! - `KeyringTokenStore`: the OS credential store (Keychain, kernel keyutils,
//!   Credential Manager)
//! - `VaultTokenStore`: a passphrase-encrypted file for hosts without a
//!   usable keyring
//!
//! Stores never retry and never cache. The session coordinator decides
//! whether a failed operation is retried.

pub mod keyring;
pub mod vault;

#[cfg(test)]
pub(crate) mod memory;

use std::sync::Arc;

use thiserror::Error;

use crate::auth::TokenSet;
use crate::config::{Config, StorageBackend};
use crate::error::SessionError;

pub use self::keyring::KeyringTokenStore;
pub use self::vault::VaultTokenStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Keyring error: {0}")]
    Keyring(#[from] ::keyring::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stored record is corrupt: {0}")]
    Corrupt(String),

    #[error("Encryption error: {0}")]
    Crypto(String),

    #[error("Vault passphrase is required")]
    MissingPassphrase,

    #[error("Could not determine vault location: {0}")]
    NoVaultLocation(String),

    #[error("Keyring storage is not available in this build; use the vault backend")]
    KeyringUnavailable,
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        SessionError::StorageFailure(e.to_string())
    }
}

/// Persistence for the current session's [`TokenSet`].
///
/// `save` replaces the stored value atomically: a concurrent `load` sees
/// either the old or the new set, never a partial write. `clear` succeeds
/// when nothing is stored.
pub trait TokenStore: Send + Sync {
    fn save(&self, tokens: &TokenSet) -> Result<(), StoreError>;

    fn load(&self) -> Result<Option<TokenSet>, StoreError>;

    fn clear(&self) -> Result<(), StoreError>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

/// Open the backend selected in `config`.
///
/// The vault needs a passphrase; the keyring ignores it. The keyring is
/// refused when it was built without a platform store, since tokens kept
/// in keyring's mock would not survive a restart.
pub fn open_token_store(
    config: &Config,
    passphrase: Option<String>,
) -> Result<Arc<dyn TokenStore>, StoreError> {
    match config.storage {
        StorageBackend::Keyring if !self::keyring::NATIVE_BACKEND => {
            Err(StoreError::KeyringUnavailable)
        }
        StorageBackend::Keyring => Ok(Arc::new(KeyringTokenStore::new(&config.keyring_account)?)),
        StorageBackend::Vault => {
            let passphrase = passphrase.ok_or(StoreError::MissingPassphrase)?;
            let path = config
                .vault_path()
                .map_err(|e| StoreError::NoVaultLocation(e.to_string()))?;
            Ok(Arc::new(VaultTokenStore::new(path, passphrase)))
        }
    }
}
