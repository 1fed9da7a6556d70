//! Storage key unit
//!
//! Holds the long-lived storage key pair under which every escrowed session
//! key is wrapped at rest.

use rsa::RsaPublicKey;
use tracing::{debug, error};

use super::TokenSlot;
use crate::envelope::WrappedKeyEnvelope;
use crate::error::{KraError, Result};
use crate::token::CryptoToken;
use crate::types::{SessionKey, SymmetricAlgorithm, WrapAlgorithm};

pub struct StorageKeyUnit {
    slot: TokenSlot,
}

impl StorageKeyUnit {
    pub fn new(token: impl CryptoToken + 'static) -> Self {
        Self::from_boxed(Box::new(token))
    }

    pub fn from_boxed(token: Box<dyn CryptoToken>) -> Self {
        StorageKeyUnit {
            slot: TokenSlot::new(token),
        }
    }

    pub fn token_name(&self) -> &str {
        &self.slot.name
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.slot.public_key
    }

    /// Log in to the storage token
    pub fn login(&self, password: &str) -> Result<()> {
        self.slot.with_token(|token| token.login(password))
    }

    /// Wrap a session key under the storage public key
    pub fn wrap_session_key(&self, session: &SessionKey, alg: WrapAlgorithm) -> Result<Vec<u8>> {
        let public_key = &self.slot.public_key;
        self.slot
            .with_token(|token| token.wrap_symmetric(session, public_key, alg))
    }

    /// Unwrap a session key with the storage private key
    pub fn unwrap_session_key(
        &self,
        wrapped: &[u8],
        alg: WrapAlgorithm,
        target_alg: SymmetricAlgorithm,
    ) -> Result<SessionKey> {
        self.slot
            .with_token(|token| token.unwrap_symmetric(wrapped, alg, target_alg))
    }

    /// Move an envelope from this storage key to `target_public_key`
    ///
    /// Only the session-key layer is unwrapped and wrapped again; the
    /// encrypted payload is copied byte for byte.
    pub fn rewrap(
        &self,
        envelope: &WrappedKeyEnvelope,
        source_alg: WrapAlgorithm,
        target_public_key: &RsaPublicKey,
        target_alg: WrapAlgorithm,
        unwrap_alg: SymmetricAlgorithm,
    ) -> Result<WrappedKeyEnvelope> {
        let rewrapped_session_key = self.slot.with_token(|token| {
            let session = token
                .unwrap_symmetric(&envelope.encrypted_session_key, source_alg, unwrap_alg)
                .map_err(|e| {
                    error!(token = %self.slot.name, error = %e, "unable to unwrap session key");
                    e
                })?;
            token.wrap_symmetric(&session, target_public_key, target_alg)
        })?;

        debug!(
            token = %self.slot.name,
            source = %source_alg,
            target = %target_alg,
            "rewrapped session key"
        );

        Ok(WrappedKeyEnvelope {
            encrypted_session_key: rewrapped_session_key,
            encrypted_payload: envelope.encrypted_payload.clone(),
        })
    }
}

impl std::fmt::Debug for StorageKeyUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageKeyUnit")
            .field("token", &self.slot.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher;
    use crate::envelope;
    use crate::test_support::{rsa_key, storage_unit};
    use crate::token::SoftwareToken;

    #[test]
    fn test_round_trip_all_pairs() {
        let unit = storage_unit(0);
        for wrap_alg in [WrapAlgorithm::RsaPkcs1, WrapAlgorithm::RsaOaep] {
            for sym_alg in [SymmetricAlgorithm::Aes, SymmetricAlgorithm::Des3] {
                let key = SessionKey::generate(sym_alg);
                let wrapped = unit.wrap_session_key(&key, wrap_alg).unwrap();
                let unwrapped = unit.unwrap_session_key(&wrapped, wrap_alg, sym_alg).unwrap();
                assert_eq!(unwrapped, key, "{:?}/{:?}", wrap_alg, sym_alg);
            }
        }
    }

    #[test]
    fn test_algorithm_mismatch_is_unwrap_error() {
        let unit = storage_unit(0);
        let key = SessionKey::generate(SymmetricAlgorithm::Aes);
        let wrapped = unit.wrap_session_key(&key, WrapAlgorithm::RsaOaep).unwrap();
        let result =
            unit.unwrap_session_key(&wrapped, WrapAlgorithm::RsaPkcs1, SymmetricAlgorithm::Aes);
        assert!(matches!(result, Err(KraError::UnwrapError)));
    }

    #[test]
    fn test_rewrap_preserves_payload() {
        let source = storage_unit(0);
        let target = storage_unit(1);

        let session = SessionKey::generate(SymmetricAlgorithm::Des3);
        let payload = cipher::encrypt(&session, b"archived private key").unwrap();
        let wrapped = source
            .wrap_session_key(&session, WrapAlgorithm::RsaPkcs1)
            .unwrap();
        let original = WrappedKeyEnvelope::new(wrapped, payload.clone());

        let rewrapped = source
            .rewrap(
                &original,
                WrapAlgorithm::RsaPkcs1,
                target.public_key(),
                WrapAlgorithm::RsaPkcs1,
                SymmetricAlgorithm::Des3,
            )
            .unwrap();

        assert_eq!(rewrapped.encrypted_payload, payload);
        assert_ne!(rewrapped.encrypted_session_key, original.encrypted_session_key);

        let via_new = target
            .unwrap_session_key(
                &rewrapped.encrypted_session_key,
                WrapAlgorithm::RsaPkcs1,
                SymmetricAlgorithm::Des3,
            )
            .unwrap();
        let via_old = source
            .unwrap_session_key(
                &original.encrypted_session_key,
                WrapAlgorithm::RsaPkcs1,
                SymmetricAlgorithm::Des3,
            )
            .unwrap();
        assert_eq!(
            cipher::decrypt(&via_new, &rewrapped.encrypted_payload).unwrap(),
            cipher::decrypt(&via_old, &original.encrypted_payload).unwrap()
        );

        // the source key can no longer open the rewrapped envelope
        assert!(source
            .unwrap_session_key(
                &rewrapped.encrypted_session_key,
                WrapAlgorithm::RsaPkcs1,
                SymmetricAlgorithm::Des3
            )
            .is_err());

        // re-encoding keeps the DER framing valid
        let blob = rewrapped.to_der().unwrap();
        assert_eq!(envelope::decode(&blob).unwrap(), rewrapped);
    }

    #[test]
    fn test_locked_token() {
        let unit = StorageKeyUnit::new(SoftwareToken::with_pin(
            "locked",
            rsa_key(0).clone(),
            "pin",
        ));
        let key = SessionKey::generate(SymmetricAlgorithm::Aes);
        let wrapped = unit.wrap_session_key(&key, WrapAlgorithm::RsaOaep).unwrap();

        let result = unit.unwrap_session_key(&wrapped, WrapAlgorithm::RsaOaep, SymmetricAlgorithm::Aes);
        assert!(matches!(result, Err(KraError::TokenUnavailable(_))));

        unit.login("pin").unwrap();
        assert_eq!(
            unit.unwrap_session_key(&wrapped, WrapAlgorithm::RsaOaep, SymmetricAlgorithm::Aes)
                .unwrap(),
            key
        );
    }
}
