use keyring::Entry;
use tracing::{debug, info};

use super::{StoreError, TokenStore};
use crate::auth::TokenSet;

const SERVICE_NAME: &str = "authlink";

/// Whether keyring was built with the platform credential stores.
///
/// Without them keyring falls back to an in-process mock that forgets
/// everything when the process exits.
pub const NATIVE_BACKEND: bool = cfg!(feature = "native-keyring");

/// Token store backed by the OS keychain.
///
/// The whole [`TokenSet`] is stored as one JSON secret so that access and
/// refresh tokens are replaced together.
pub struct KeyringTokenStore {
    entry: Entry,
}

impl KeyringTokenStore {
    pub fn new(account: &str) -> Result<Self, StoreError> {
        let entry = Entry::new(SERVICE_NAME, account)?;
        Ok(Self { entry })
    }
}

impl TokenStore for KeyringTokenStore {
    fn save(&self, tokens: &TokenSet) -> Result<(), StoreError> {
        let json = serde_json::to_string(tokens)?;
        self.entry.set_password(&json)?;
        debug!(
            token_len = tokens.access_token.len(),
            has_refresh = tokens.can_refresh(),
            "Stored tokens in keychain"
        );
        Ok(())
    }

    fn load(&self) -> Result<Option<TokenSet>, StoreError> {
        match self.entry.get_password() {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&self) -> Result<(), StoreError> {
        match self.entry.delete_credential() {
            Ok(()) => {
                info!("Cleared tokens from keychain");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &'static str {
        "keyring"
    }
}

#[cfg(all(test, not(feature = "native-keyring")))]
mod tests {
    //! Without `native-keyring` the keyring crate falls back to its
    //! in-process mock credential, which is what these tests exercise.

    use super::*;
    use crate::auth::{AccessToken, RefreshToken};

    #[test]
    fn test_round_trip() {
        let store = KeyringTokenStore::new("round-trip").unwrap();
        let tokens = TokenSet::new(AccessToken::new("abc.def.ghi").unwrap(), RefreshToken::new("r1"));

        store.save(&tokens).unwrap();
        assert_eq!(store.load().unwrap(), Some(tokens));
    }

    #[test]
    fn test_load_empty_is_none() {
        let store = KeyringTokenStore::new("empty").unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_clear_is_idempotent() {
        let store = KeyringTokenStore::new("clear").unwrap();
        store.clear().unwrap();

        store
            .save(&TokenSet::new(AccessToken::new("a1").unwrap(), None))
            .unwrap();
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
        store.clear().unwrap();
    }
}
