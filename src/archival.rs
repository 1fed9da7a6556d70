//! Key archival
//!
//! Accepts secrets either in raw form or sealed under the transport key,
//! wraps their session key under the storage key and persists the envelope
//! as the owner's Active record. The previous Active record is superseded in
//! the same store commit.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use crate::cipher;
use crate::config::KraConfig;
use crate::envelope;
use crate::error::{KraError, Result};
use crate::store::{KeyFilter, RecordStore};
use crate::types::{
    KeyAlgorithm, KeyId, KeyRecord, KeyStatus, KeyUsage, PayloadKind, SessionKey,
    SymmetricAlgorithm,
};
use crate::unit::{ArchiveOptions, StorageKeyUnit, TransportKeyUnit};

/// Secret handed to [`ArchivalService::archive`]
pub enum ArchivalPayload {
    /// Plaintext secret; a fresh session key is generated for it
    Raw(Zeroizing<Vec<u8>>),
    /// Secret sealed by the client under the transport key
    ArchiveOptions(ArchiveOptions),
}

impl ArchivalPayload {
    pub fn raw(secret: &[u8]) -> Self {
        Self::Raw(Zeroizing::new(secret.to_vec()))
    }
}

impl std::fmt::Debug for ArchivalPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw(secret) => write!(f, "ArchivalPayload::Raw({} bytes)", secret.len()),
            Self::ArchiveOptions(_) => f.write_str("ArchivalPayload::ArchiveOptions(..)"),
        }
    }
}

pub struct ArchivalService {
    storage: Arc<StorageKeyUnit>,
    transport: Arc<TransportKeyUnit>,
    store: Arc<dyn RecordStore>,
    config: KraConfig,
}

impl ArchivalService {
    pub fn new(
        storage: Arc<StorageKeyUnit>,
        transport: Arc<TransportKeyUnit>,
        store: Arc<dyn RecordStore>,
        config: KraConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(ArchivalService {
            storage,
            transport,
            store,
            config,
        })
    }

    /// Archive a secret for `owner_id`
    ///
    /// On success the returned record is the owner's only Active record. On
    /// failure nothing is written.
    pub fn archive(
        &self,
        owner_id: &str,
        payload_kind: PayloadKind,
        payload: ArchivalPayload,
        algorithm: Option<KeyAlgorithm>,
        key_size_bits: Option<u32>,
    ) -> Result<KeyRecord> {
        let key_size_bits = validate(payload_kind, &payload, algorithm, key_size_bits)?;

        let (session, encrypted_payload) = match payload {
            ArchivalPayload::ArchiveOptions(options) => {
                let session = self.transport.unwrap_archive_options(&options)?;
                (session, options.encrypted_payload)
            }
            ArchivalPayload::Raw(secret) => {
                let session = SessionKey::generate(self.config.session_algorithm);
                let encrypted = cipher::encrypt(&session, &secret).map_err(|e| {
                    error!(owner = %owner_id, error = %e, "payload encryption failed");
                    archival_error(owner_id)
                })?;
                (session, encrypted)
            }
        };

        self.persist(
            owner_id,
            payload_kind,
            &session,
            encrypted_payload,
            algorithm,
            key_size_bits,
            Vec::new(),
        )
    }

    /// Generate a symmetric key server-side and archive it
    pub fn generate_symmetric_key(
        &self,
        owner_id: &str,
        algorithm: SymmetricAlgorithm,
        key_size_bits: u32,
        usages: &[KeyUsage],
    ) -> Result<KeyRecord> {
        if usages.is_empty() {
            return Err(KraError::MissingUsages);
        }
        let key_algorithm = match algorithm {
            SymmetricAlgorithm::Aes => KeyAlgorithm::Aes,
            SymmetricAlgorithm::Des3 => KeyAlgorithm::Des3,
        };
        let len = symmetric_key_len(key_algorithm, key_size_bits)?;
        let generated = SessionKey::generate_with_length(algorithm, len)?;

        let session = SessionKey::generate(self.config.session_algorithm);
        let encrypted = cipher::encrypt(&session, generated.as_slice()).map_err(|e| {
            error!(owner = %owner_id, error = %e, "payload encryption failed");
            archival_error(owner_id)
        })?;

        let mut usages = usages.to_vec();
        usages.sort_unstable();
        usages.dedup();
        let record = self.persist(
            owner_id,
            PayloadKind::SymmetricKey,
            &session,
            encrypted,
            Some(key_algorithm),
            Some(key_size_bits),
            usages,
        )?;
        info!(key_id = %record.id, owner = %owner_id, algorithm = %key_algorithm, "generated symmetric key");
        Ok(record)
    }

    /// Change the status of an archived record
    ///
    /// Activating a record deactivates the owner's other Active record.
    pub fn modify_status(&self, key_id: KeyId, status: KeyStatus) -> Result<KeyRecord> {
        let mut record = self.get_key(key_id)?;
        if record.status == status {
            return Ok(record);
        }
        record.status = status;

        for attempt in 1..=self.config.archival_retry_limit {
            let expected = match status {
                KeyStatus::Active => self
                    .store
                    .find_active_by_owner(&record.owner_id)?
                    .map(|active| active.id)
                    .filter(|id| *id != key_id),
                KeyStatus::Inactive => None,
            };
            match self.store.commit_key(record.clone(), expected) {
                Ok(()) => {
                    info!(key_id = %key_id, status = %status, "modified key status");
                    return Ok(record);
                }
                Err(KraError::StoreConflict(_)) => {
                    warn!(key_id = %key_id, attempt, "status change conflicted, retrying");
                }
                Err(e) => return Err(e),
            }
        }
        Err(KraError::StoreConflict(record.owner_id))
    }

    pub fn get_key(&self, key_id: KeyId) -> Result<KeyRecord> {
        self.store
            .get_key(key_id)?
            .ok_or(KraError::KeyNotFound(key_id))
    }

    pub fn find_keys(&self, filter: &KeyFilter) -> Result<Vec<KeyRecord>> {
        self.store.find_keys(filter)
    }

    #[allow(clippy::too_many_arguments)]
    fn persist(
        &self,
        owner_id: &str,
        payload_kind: PayloadKind,
        session: &SessionKey,
        encrypted_payload: Vec<u8>,
        algorithm: Option<KeyAlgorithm>,
        key_size_bits: Option<u32>,
        usages: Vec<KeyUsage>,
    ) -> Result<KeyRecord> {
        let wrap_algorithm = self.config.storage_wrap_algorithm;
        let wrapped = self
            .storage
            .wrap_session_key(session, wrap_algorithm)
            .map_err(|e| {
                error!(owner = %owner_id, error = %e, "session key wrap failed");
                archival_error(owner_id)
            })?;
        let wrapped_payload = envelope::encode(&wrapped, &encrypted_payload).map_err(|e| {
            error!(owner = %owner_id, error = %e, "envelope encoding failed");
            archival_error(owner_id)
        })?;

        let id = self.store.next_key_id().map_err(|e| {
            error!(owner = %owner_id, error = %e, "key id allocation failed");
            archival_error(owner_id)
        })?;
        let record = KeyRecord {
            id,
            owner_id: owner_id.to_string(),
            payload_kind,
            wrapped_payload,
            algorithm,
            key_size_bits,
            session_algorithm: session.algorithm(),
            wrap_algorithm,
            usages,
            status: KeyStatus::Active,
            created_at: Utc::now(),
        };

        for attempt in 1..=self.config.archival_retry_limit {
            let expected = self
                .store
                .find_active_by_owner(owner_id)
                .map_err(|e| {
                    error!(owner = %owner_id, error = %e, "active record lookup failed");
                    archival_error(owner_id)
                })?
                .map(|active| active.id);

            match self.store.commit_key(record.clone(), expected) {
                Ok(()) => {
                    if let Some(previous) = expected {
                        debug!(key_id = %previous, owner = %owner_id, "superseded active record");
                    }
                    info!(key_id = %id, owner = %owner_id, kind = ?payload_kind, "archived key");
                    return Ok(record);
                }
                Err(KraError::StoreConflict(_)) => {
                    warn!(owner = %owner_id, attempt, "concurrent archival, retrying commit");
                }
                Err(e) => {
                    error!(owner = %owner_id, error = %e, "record commit failed");
                    return Err(archival_error(owner_id));
                }
            }
        }

        error!(owner = %owner_id, "archival retries exhausted");
        Err(archival_error(owner_id))
    }
}

impl std::fmt::Debug for ArchivalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchivalService")
            .field("storage", &self.storage)
            .field("transport", &self.transport)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn archival_error(owner_id: &str) -> KraError {
    KraError::ArchivalError {
        owner_id: owner_id.to_string(),
    }
}

/// Byte length of a symmetric key of `bits`
fn symmetric_key_len(algorithm: KeyAlgorithm, bits: u32) -> Result<usize> {
    match (algorithm, bits) {
        (KeyAlgorithm::Aes, 128 | 192 | 256) => Ok(bits as usize / 8),
        (KeyAlgorithm::Des3, 168) => Ok(24),
        (KeyAlgorithm::Aes | KeyAlgorithm::Des3, _) => Err(KraError::InvalidKeySize {
            algorithm: algorithm.name().to_string(),
            bits,
        }),
        (other, _) => Err(KraError::UnsupportedAlgorithm(format!(
            "{} is not a symmetric algorithm",
            other
        ))),
    }
}

/// Check algorithm and size for the payload kind, returning the size to record
fn validate(
    payload_kind: PayloadKind,
    payload: &ArchivalPayload,
    algorithm: Option<KeyAlgorithm>,
    key_size_bits: Option<u32>,
) -> Result<Option<u32>> {
    let raw_len = match payload {
        ArchivalPayload::Raw(secret) => Some(secret.len()),
        ArchivalPayload::ArchiveOptions(_) => None,
    };

    match payload_kind {
        PayloadKind::Passphrase => {
            if let Some(algorithm) = algorithm {
                return Err(KraError::UnsupportedAlgorithm(format!(
                    "passphrases take no algorithm, got {}",
                    algorithm
                )));
            }
            if raw_len == Some(0) {
                return Err(KraError::InvalidKeySize {
                    algorithm: "passphrase".to_string(),
                    bits: 0,
                });
            }
            Ok(None)
        }
        PayloadKind::SymmetricKey => {
            let algorithm = algorithm.ok_or_else(|| {
                KraError::UnsupportedAlgorithm("symmetric key requires an algorithm".to_string())
            })?;
            let bits = match (key_size_bits, raw_len) {
                (Some(bits), _) => bits,
                (None, Some(len)) => match algorithm {
                    KeyAlgorithm::Des3 if len == 24 => 168,
                    _ => (len * 8) as u32,
                },
                (None, None) => {
                    return Err(KraError::InvalidKeySize {
                        algorithm: algorithm.name().to_string(),
                        bits: 0,
                    })
                }
            };
            let expected_len = symmetric_key_len(algorithm, bits)?;
            if let Some(len) = raw_len {
                if len != expected_len {
                    return Err(KraError::InvalidKeySize {
                        algorithm: algorithm.name().to_string(),
                        bits: (len * 8) as u32,
                    });
                }
            }
            Ok(Some(bits))
        }
        PayloadKind::AsymmetricPrivateKey => {
            let algorithm = algorithm.ok_or_else(|| {
                KraError::UnsupportedAlgorithm("private key requires an algorithm".to_string())
            })?;
            let valid = |bits: u32| match algorithm {
                KeyAlgorithm::Rsa => (1024..=16384).contains(&bits) && bits % 8 == 0,
                KeyAlgorithm::Ec => matches!(bits, 256 | 384 | 521),
                _ => false,
            };
            if algorithm.as_symmetric().is_some() {
                return Err(KraError::UnsupportedAlgorithm(format!(
                    "{} is not an asymmetric algorithm",
                    algorithm
                )));
            }
            match key_size_bits {
                Some(bits) if !valid(bits) => Err(KraError::InvalidKeySize {
                    algorithm: algorithm.name().to_string(),
                    bits,
                }),
                other => Ok(other),
            }
        }
    }
}
