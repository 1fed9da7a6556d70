//! Cryptographic token provider
//!
//! A token owns an RSA private key and exposes only wrap/unwrap primitives
//! behind a password-gated login. Token handles are not reentrant; the key
//! units serialize every call through a mutex.

use rsa::{
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::DecodePrivateKey,
    RsaPrivateKey, RsaPublicKey,
};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::error::{KraError, Result};
use crate::types::{SessionKey, SymmetricAlgorithm, WrapAlgorithm};
use crate::wrap::{rsa_unwrap, rsa_wrap};

/// Key wrap/unwrap provider backed by a hardware or software token
pub trait CryptoToken: Send {
    /// Token name, used in logs and errors
    fn name(&self) -> &str;

    /// Log in to unlock the private key
    fn login(&mut self, password: &str) -> Result<()>;

    fn is_logged_in(&self) -> bool;

    /// Public half of the token's key pair
    fn public_key(&self) -> &RsaPublicKey;

    /// Wrap a symmetric key under `wrapping_key`
    fn wrap_symmetric(
        &mut self,
        key: &SessionKey,
        wrapping_key: &RsaPublicKey,
        alg: WrapAlgorithm,
    ) -> Result<Vec<u8>>;

    /// Unwrap a symmetric key with the token's private key
    fn unwrap_symmetric(
        &mut self,
        wrapped: &[u8],
        alg: WrapAlgorithm,
        key_algorithm: SymmetricAlgorithm,
    ) -> Result<SessionKey>;
}

/// In-process token holding an RSA private key
pub struct SoftwareToken {
    name: String,
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
    pin: Option<Zeroizing<String>>,
    logged_in: bool,
}

impl SoftwareToken {
    /// Token that needs no login
    pub fn new(name: impl Into<String>, private_key: RsaPrivateKey) -> Self {
        let public_key = RsaPublicKey::from(&private_key);
        SoftwareToken {
            name: name.into(),
            private_key,
            public_key,
            pin: None,
            logged_in: true,
        }
    }

    /// Token that stays locked until [`CryptoToken::login`] with `pin`
    pub fn with_pin(name: impl Into<String>, private_key: RsaPrivateKey, pin: &str) -> Self {
        let mut token = Self::new(name, private_key);
        token.pin = Some(Zeroizing::new(pin.to_string()));
        token.logged_in = false;
        token
    }

    /// Load a private key from PEM
    ///
    /// Accepts `PRIVATE KEY` (PKCS#8), `ENCRYPTED PRIVATE KEY` (PKCS#8,
    /// requires `password`) and `RSA PRIVATE KEY` (PKCS#1).
    pub fn from_pem(name: impl Into<String>, pem: &str, password: Option<&str>) -> Result<Self> {
        let name = name.into();
        let private_key = if pem.contains("ENCRYPTED PRIVATE KEY") {
            let password = password.ok_or_else(|| KraError::TokenUnavailable(name.clone()))?;
            RsaPrivateKey::from_pkcs8_encrypted_pem(pem, password.as_bytes()).map_err(|e| {
                warn!(token = %name, error = %e, "unable to decrypt private key");
                KraError::TokenUnavailable(name.clone())
            })?
        } else if pem.contains("RSA PRIVATE KEY") {
            RsaPrivateKey::from_pkcs1_pem(pem).map_err(|e| {
                warn!(token = %name, error = %e, "unable to parse PKCS#1 private key");
                KraError::TokenUnavailable(name.clone())
            })?
        } else {
            RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| {
                warn!(token = %name, error = %e, "unable to parse PKCS#8 private key");
                KraError::TokenUnavailable(name.clone())
            })?
        };
        debug!(token = %name, "loaded private key");
        Ok(Self::new(name, private_key))
    }

    fn ensure_logged_in(&self) -> Result<()> {
        if self.logged_in {
            Ok(())
        } else {
            Err(KraError::TokenUnavailable(self.name.clone()))
        }
    }
}

impl CryptoToken for SoftwareToken {
    fn name(&self) -> &str {
        &self.name
    }

    fn login(&mut self, password: &str) -> Result<()> {
        match &self.pin {
            None => {
                self.logged_in = true;
                Ok(())
            }
            Some(pin) => {
                if bool::from(pin.as_bytes().ct_eq(password.as_bytes())) {
                    self.logged_in = true;
                    Ok(())
                } else {
                    warn!(token = %self.name, "token login rejected");
                    Err(KraError::TokenUnavailable(self.name.clone()))
                }
            }
        }
    }

    fn is_logged_in(&self) -> bool {
        self.logged_in
    }

    fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    fn wrap_symmetric(
        &mut self,
        key: &SessionKey,
        wrapping_key: &RsaPublicKey,
        alg: WrapAlgorithm,
    ) -> Result<Vec<u8>> {
        rsa_wrap(wrapping_key, key.as_slice(), alg)
    }

    fn unwrap_symmetric(
        &mut self,
        wrapped: &[u8],
        alg: WrapAlgorithm,
        key_algorithm: SymmetricAlgorithm,
    ) -> Result<SessionKey> {
        self.ensure_logged_in()?;
        let raw = rsa_unwrap(&self.private_key, wrapped, alg)?;
        SessionKey::new(key_algorithm, &raw).map_err(|_| {
            debug!(token = %self.name, len = raw.len(), "unwrapped key has wrong length");
            KraError::UnwrapError
        })
    }
}
