//! Passphrase-encrypted file store.
//!
//! The [`TokenSet`] JSON is sealed with ChaCha20-Poly1305 under a key derived
//! from the passphrase with Argon2id. The file is a small JSON envelope:
//!
//! ```json
//! { "version": 1, "kdf": { "m_cost": 19456, "t_cost": 2, "p_cost": 1 },
//!   "salt": "<base64>", "nonce": "<base64>", "ciphertext": "<base64>" }
//! ```
//!
//! Writes go to a temp file in the same directory and are renamed over the
//! target, so readers never see a partial envelope.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use argon2::{Algorithm, Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{StoreError, TokenStore};
use crate::auth::TokenSet;

const VAULT_VERSION: u8 = 1;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct KdfParams {
    m_cost: u32,
    t_cost: u32,
    p_cost: u32,
}

impl KdfParams {
    fn from_params(params: &Params) -> Self {
        Self {
            m_cost: params.m_cost(),
            t_cost: params.t_cost(),
            p_cost: params.p_cost(),
        }
    }

    fn to_params(self) -> Result<Params, StoreError> {
        Params::new(self.m_cost, self.t_cost, self.p_cost, Some(KEY_LEN))
            .map_err(|e| StoreError::Corrupt(format!("invalid KDF parameters: {}", e)))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u8,
    kdf: KdfParams,
    salt: String,
    nonce: String,
    ciphertext: String,
}

/// Key derived for one salt, kept so repeated saves skip the KDF.
struct DerivedKey {
    salt: [u8; SALT_LEN],
    kdf: KdfParams,
    key: [u8; KEY_LEN],
}

pub struct VaultTokenStore {
    path: PathBuf,
    passphrase: String,
    params: Params,
    // Serializes writers and caches the derived key.
    key_cache: Mutex<Option<DerivedKey>>,
}

impl VaultTokenStore {
    pub fn new(path: impl Into<PathBuf>, passphrase: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            passphrase: passphrase.into(),
            params: Params::default(),
            key_cache: Mutex::new(None),
        }
    }

    /// Override the Argon2 cost parameters used for new vaults.
    pub fn with_kdf_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn derive_key(&self, salt: &[u8], kdf: KdfParams) -> Result<[u8; KEY_LEN], StoreError> {
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, kdf.to_params()?);
        let mut key = [0u8; KEY_LEN];
        argon2
            .hash_password_into(self.passphrase.as_bytes(), salt, &mut key)
            .map_err(|e| StoreError::Crypto(e.to_string()))?;
        Ok(key)
    }

    /// Key for `salt`, from the cache when it matches.
    fn key_for(
        &self,
        cache: &mut Option<DerivedKey>,
        salt: [u8; SALT_LEN],
        kdf: KdfParams,
    ) -> Result<[u8; KEY_LEN], StoreError> {
        if let Some(cached) = cache.as_ref() {
            if cached.salt == salt && cached.kdf == kdf {
                return Ok(cached.key);
            }
        }
        let key = self.derive_key(&salt, kdf)?;
        *cache = Some(DerivedKey { salt, kdf, key });
        Ok(key)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, Option<DerivedKey>> {
        self.key_cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_envelope(&self) -> Result<Option<Envelope>, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_atomically(&self, contents: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("tmp");

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        let mut file = options.open(&tmp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

fn decode_fixed<const N: usize>(field: &str, value: &str) -> Result<[u8; N], StoreError> {
    let bytes = STANDARD
        .decode(value)
        .map_err(|e| StoreError::Corrupt(format!("{}: {}", field, e)))?;
    bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt(format!("{} has the wrong length", field)))
}

impl TokenStore for VaultTokenStore {
    fn save(&self, tokens: &TokenSet) -> Result<(), StoreError> {
        let mut cache = self.lock_cache();
        let kdf = KdfParams::from_params(&self.params);

        // Reuse the salt of the key we already hold so the KDF runs once per
        // process instead of once per save.
        let salt = match cache.as_ref() {
            Some(cached) if cached.kdf == kdf => cached.salt,
            _ => {
                let mut salt = [0u8; SALT_LEN];
                OsRng.fill_bytes(&mut salt);
                salt
            }
        };
        let key = self.key_for(&mut cache, salt, kdf)?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let plaintext = serde_json::to_vec(tokens)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|e| StoreError::Crypto(e.to_string()))?;

        let envelope = Envelope {
            version: VAULT_VERSION,
            kdf,
            salt: STANDARD.encode(salt),
            nonce: STANDARD.encode(nonce),
            ciphertext: STANDARD.encode(ciphertext),
        };
        self.write_atomically(&serde_json::to_vec(&envelope)?)?;
        debug!(path = %self.path.display(), "Wrote token vault");
        Ok(())
    }

    fn load(&self) -> Result<Option<TokenSet>, StoreError> {
        let Some(envelope) = self.read_envelope()? else {
            return Ok(None);
        };
        if envelope.version != VAULT_VERSION {
            return Err(StoreError::Corrupt(format!(
                "unsupported vault version {}",
                envelope.version
            )));
        }

        let salt: [u8; SALT_LEN] = decode_fixed("salt", &envelope.salt)?;
        let nonce: [u8; NONCE_LEN] = decode_fixed("nonce", &envelope.nonce)?;
        let ciphertext = STANDARD
            .decode(&envelope.ciphertext)
            .map_err(|e| StoreError::Corrupt(format!("ciphertext: {}", e)))?;

        let key = {
            let mut cache = self.lock_cache();
            self.key_for(&mut cache, salt, envelope.kdf)?
        };

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| StoreError::Crypto("wrong passphrase or tampered vault".to_string()))?;

        Ok(Some(serde_json::from_slice(&plaintext)?))
    }

    fn clear(&self) -> Result<(), StoreError> {
        let _guard = self.lock_cache();
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Removed token vault");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &'static str {
        "vault"
    }
}

/// Cheap Argon2 parameters so tests don't spend seconds in the KDF.
#[cfg(test)]
pub(crate) fn test_kdf_params() -> Params {
    Params::new(Params::MIN_M_COST, 1, 1, Some(KEY_LEN)).expect("valid argon2 params")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AccessToken, RefreshToken};

    fn vault(dir: &tempfile::TempDir, passphrase: &str) -> VaultTokenStore {
        VaultTokenStore::new(dir.path().join("session.vault"), passphrase)
            .with_kdf_params(test_kdf_params())
    }

    fn tokens(access: &str, refresh: Option<&str>) -> TokenSet {
        TokenSet::new(
            AccessToken::new(access).unwrap(),
            refresh.and_then(RefreshToken::new),
        )
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = vault(&dir, "correct horse");
        let saved = tokens("abc.def.ghi", Some("r1"));

        store.save(&saved).unwrap();
        assert_eq!(store.load().unwrap(), Some(saved));
    }

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(vault(&dir, "pw").load().unwrap(), None);
    }

    #[test]
    fn test_overwrite_replaces_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = vault(&dir, "pw");
        store.save(&tokens("a1", Some("r1"))).unwrap();
        store.save(&tokens("a2", None)).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.access_token.as_str(), "a2");
        assert!(loaded.refresh_token.is_none());
        assert!(!dir.path().join("session.tmp").exists());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = vault(&dir, "pw");
        store.clear().unwrap();

        store.save(&tokens("a1", None)).unwrap();
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
        store.clear().unwrap();
    }

    #[test]
    fn test_file_does_not_contain_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = vault(&dir, "pw");
        store.save(&tokens("abc.def.ghi", Some("refresh-secret"))).unwrap();

        let raw = fs::read_to_string(store.path()).unwrap();
        assert!(!raw.contains("abc.def.ghi"));
        assert!(!raw.contains("refresh-secret"));
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let dir = tempfile::tempdir().unwrap();
        vault(&dir, "right").save(&tokens("a1", None)).unwrap();

        let err = vault(&dir, "wrong").load().unwrap_err();
        assert!(matches!(err, StoreError::Crypto(_)));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = vault(&dir, "pw");
        store.save(&tokens("a1", None)).unwrap();

        let mut envelope: Envelope =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        let mut bytes = STANDARD.decode(&envelope.ciphertext).unwrap();
        bytes[0] ^= 0xff;
        envelope.ciphertext = STANDARD.encode(bytes);
        fs::write(store.path(), serde_json::to_vec(&envelope).unwrap()).unwrap();

        assert!(matches!(store.load(), Err(StoreError::Crypto(_))));
    }

    #[test]
    fn test_garbage_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = vault(&dir, "pw");
        fs::write(store.path(), b"not json").unwrap();
        assert!(matches!(store.load(), Err(StoreError::Corrupt(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_file_permissions_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = vault(&dir, "pw");
        store.save(&tokens("a1", None)).unwrap();

        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
