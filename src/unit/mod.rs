//! Storage and transport key units
//!
//! Each unit owns one [`CryptoToken`] for the lifetime of the process and
//! serializes access to it. Independent units may be used concurrently.

mod storage;
mod transport;

pub use storage::StorageKeyUnit;
pub use transport::{ArchiveOptions, TransportKeyUnit};

use std::sync::Mutex;

use rsa::RsaPublicKey;

use crate::error::{KraError, Result};
use crate::token::CryptoToken;

/// Mutex-guarded token handle with its public data cached outside the lock
struct TokenSlot {
    name: String,
    public_key: RsaPublicKey,
    token: Mutex<Box<dyn CryptoToken>>,
}

impl TokenSlot {
    fn new(token: Box<dyn CryptoToken>) -> Self {
        TokenSlot {
            name: token.name().to_string(),
            public_key: token.public_key().clone(),
            token: Mutex::new(token),
        }
    }

    /// Run `f` with exclusive access to the token
    fn with_token<T>(&self, f: impl FnOnce(&mut dyn CryptoToken) -> Result<T>) -> Result<T> {
        let mut guard = self
            .token
            .lock()
            .map_err(|_| KraError::TokenUnavailable(self.name.clone()))?;
        f(guard.as_mut())
    }
}
