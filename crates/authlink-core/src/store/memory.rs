//! In-memory store for unit tests. Not a production backend: it does not
//! survive the process.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use super::{StoreError, TokenStore};
use crate::auth::TokenSet;

#[derive(Default)]
pub(crate) struct MemoryTokenStore {
    inner: RwLock<Option<TokenSet>>,
    // Number of upcoming operations that should fail.
    failures: AtomicUsize,
}

impl MemoryTokenStore {
    pub(crate) fn with_tokens(tokens: TokenSet) -> Self {
        Self {
            inner: RwLock::new(Some(tokens)),
            failures: AtomicUsize::new(0),
        }
    }

    /// Make the next `count` operations fail with an I/O error.
    pub(crate) fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub(crate) fn peek(&self) -> Option<TokenSet> {
        self.inner.read().unwrap().clone()
    }

    fn check_failure(&self) -> Result<(), StoreError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(StoreError::Io(std::io::Error::other("injected failure")))
        } else {
            Ok(())
        }
    }
}

impl TokenStore for MemoryTokenStore {
    fn save(&self, tokens: &TokenSet) -> Result<(), StoreError> {
        self.check_failure()?;
        *self.inner.write().unwrap() = Some(tokens.clone());
        Ok(())
    }

    fn load(&self) -> Result<Option<TokenSet>, StoreError> {
        self.check_failure()?;
        Ok(self.inner.read().unwrap().clone())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.check_failure()?;
        *self.inner.write().unwrap() = None;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
