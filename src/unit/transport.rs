//! Transport key unit
//!
//! The transport key pair receives material from requesting clients
//! (archive options, caller session keys). Material wrapped under it is
//! never persisted.

use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::TokenSlot;
use crate::cipher;
use crate::error::{KraError, Result};
use crate::token::CryptoToken;
use crate::types::{SessionKey, SymmetricAlgorithm, WrapAlgorithm};
use crate::wrap::{self, rsa_wrap};

/// Secret sealed by a client for archival
///
/// The client generates a session key, encrypts the secret under it and
/// wraps the session key with the transport public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveOptions {
    pub wrapped_session_key: Vec<u8>,
    pub session_algorithm: SymmetricAlgorithm,
    pub wrap_algorithm: WrapAlgorithm,
    pub encrypted_payload: Vec<u8>,
}

impl ArchiveOptions {
    /// Seal `secret` for the holder of `transport_public_key`
    pub fn seal(
        transport_public_key: &RsaPublicKey,
        secret: &[u8],
        session_algorithm: SymmetricAlgorithm,
        wrap_algorithm: WrapAlgorithm,
    ) -> Result<Self> {
        let session = SessionKey::generate(session_algorithm);
        let encrypted_payload = cipher::encrypt(&session, secret)?;
        let wrapped_session_key = rsa_wrap(transport_public_key, session.as_slice(), wrap_algorithm)?;
        Ok(ArchiveOptions {
            wrapped_session_key,
            session_algorithm,
            wrap_algorithm,
            encrypted_payload,
        })
    }
}

pub struct TransportKeyUnit {
    slot: TokenSlot,
}

impl TransportKeyUnit {
    pub fn new(token: impl CryptoToken + 'static) -> Self {
        Self::from_boxed(Box::new(token))
    }

    pub fn from_boxed(token: Box<dyn CryptoToken>) -> Self {
        TransportKeyUnit {
            slot: TokenSlot::new(token),
        }
    }

    pub fn token_name(&self) -> &str {
        &self.slot.name
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.slot.public_key
    }

    /// Transport public key as SPKI PEM, for publication to clients
    pub fn public_key_pem(&self) -> Result<String> {
        wrap::public_key_pem(&self.slot.public_key)
    }

    pub fn login(&self, password: &str) -> Result<()> {
        self.slot.with_token(|token| token.login(password))
    }

    /// Wrap a session key under the transport public key
    pub fn wrap_session_key(&self, session: &SessionKey, alg: WrapAlgorithm) -> Result<Vec<u8>> {
        let public_key = &self.slot.public_key;
        self.slot
            .with_token(|token| token.wrap_symmetric(session, public_key, alg))
    }

    /// Unwrap a session key with the transport private key
    pub fn unwrap_session_key(
        &self,
        wrapped: &[u8],
        alg: WrapAlgorithm,
        target_alg: SymmetricAlgorithm,
    ) -> Result<SessionKey> {
        self.slot
            .with_token(|token| token.unwrap_symmetric(wrapped, alg, target_alg))
    }

    /// Recover the session key of an archive-options blob
    ///
    /// The payload stays encrypted under the returned session key. Every
    /// failure is reported as [`KraError::TransportUnwrapFailure`].
    pub fn unwrap_archive_options(&self, options: &ArchiveOptions) -> Result<SessionKey> {
        self.unwrap_session_key(
            &options.wrapped_session_key,
            options.wrap_algorithm,
            options.session_algorithm,
        )
        .map_err(|e| {
            debug!(token = %self.slot.name, error = %e, "archive options unwrap failed");
            KraError::TransportUnwrapFailure
        })
    }
}

impl std::fmt::Debug for TransportKeyUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportKeyUnit")
            .field("token", &self.slot.name)
            .finish()
    }
}
