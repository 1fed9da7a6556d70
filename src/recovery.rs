//! Key recovery
//!
//! A recovery request moves through `Created -> Approved -> Processed ->
//! Completed`; any state may fall to `Failed`. Processing unwraps the stored
//! session key with the storage key and delivers the secret protected by
//! material the caller supplied. Transitions on one request are serialized;
//! different requests proceed independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::authz::{Authorizer, Operation};
use crate::cipher;
use crate::config::KraConfig;
use crate::envelope;
use crate::error::{KraError, Result};
use crate::store::RecordStore;
use crate::types::{
    DeliveryPayload, KeyId, KeyRecord, RecoveryCredentials, RecoveryRequest, RecoveryState,
    RequestId,
};
use crate::unit::{StorageKeyUnit, TransportKeyUnit};

pub struct RecoveryService {
    storage: Arc<StorageKeyUnit>,
    transport: Arc<TransportKeyUnit>,
    store: Arc<dyn RecordStore>,
    authorizer: Arc<dyn Authorizer>,
    config: KraConfig,
    locks: Mutex<HashMap<RequestId, Arc<Mutex<()>>>>,
}

impl RecoveryService {
    pub fn new(
        storage: Arc<StorageKeyUnit>,
        transport: Arc<TransportKeyUnit>,
        store: Arc<dyn RecordStore>,
        authorizer: Arc<dyn Authorizer>,
        config: KraConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(RecoveryService {
            storage,
            transport,
            store,
            authorizer,
            config,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Open a recovery request for `key_id`
    ///
    /// The recovery method follows from the kind of `credentials`. A key
    /// whose stored envelope cannot be decoded yields a request that is
    /// already `Failed`.
    pub fn request_recovery(
        &self,
        key_id: KeyId,
        credentials: RecoveryCredentials,
    ) -> Result<RecoveryRequest> {
        let record = self
            .store
            .get_key(key_id)?
            .ok_or(KraError::KeyNotFound(key_id))?;
        check_credentials(&credentials)?;

        let now = Utc::now();
        let mut request = RecoveryRequest {
            id: self.store.next_request_id()?,
            key_id,
            method: credentials.method(),
            state: RecoveryState::Created,
            session_key_material: Some(credentials),
            approvals: Vec::new(),
            delivery: None,
            created_at: now,
            updated_at: now,
        };

        if let Err(e) = envelope::decode(&record.wrapped_payload) {
            warn!(request_id = %request.id, key_id = %key_id, error = %e, "stored envelope is malformed");
            request.clear_session_material();
            request.transition(RecoveryState::Failed);
            let request_id = request.id;
            self.store.put_request(request)?;
            return Err(KraError::RecoveryFailed { request_id });
        }
        self.store.put_request(request.clone())?;

        info!(request_id = %request.id, key_id = %key_id, method = ?request.method, "recovery requested");
        Ok(request)
    }

    /// Open a recovery request for the owner's Active key
    pub fn request_recovery_for_owner(
        &self,
        owner_id: &str,
        credentials: RecoveryCredentials,
    ) -> Result<RecoveryRequest> {
        let record = self
            .store
            .find_active_by_owner(owner_id)?
            .ok_or_else(|| KraError::NoActiveKey(owner_id.to_string()))?;
        self.request_recovery(record.id, credentials)
    }

    /// Record an agent approval
    ///
    /// Repeat approvals by the same agent count once. The request becomes
    /// `Approved` when enough distinct agents have approved it.
    pub fn approve(&self, request_id: RequestId, principal: &str) -> Result<RecoveryRequest> {
        self.authorize(principal, Operation::ApproveRecovery)?;

        self.with_request(request_id, |request| {
            match request.state {
                RecoveryState::Created => {}
                RecoveryState::Approved => return Ok(()),
                other => return Err(invalid_state(request_id, other, "approve")),
            }

            if request.approvals.iter().any(|agent| agent == principal) {
                debug!(request_id = %request_id, agent = %principal, "duplicate approval ignored");
                return Ok(());
            }
            request.approvals.push(principal.to_string());
            request.updated_at = Utc::now();

            let required = self.config.required_approvals as usize;
            if request.approvals.len() >= required {
                request.transition(RecoveryState::Approved);
                info!(request_id = %request_id, approvals = request.approvals.len(), "recovery approved");
            } else {
                info!(
                    request_id = %request_id,
                    approvals = request.approvals.len(),
                    required,
                    "recovery approval recorded"
                );
            }
            Ok(())
        })
    }

    /// Deliver the escrowed secret of an approved request
    ///
    /// A processed or completed request returns its cached delivery without
    /// touching a token.
    pub fn process(&self, request_id: RequestId) -> Result<DeliveryPayload> {
        self.serialized(request_id, || self.process_locked(request_id))
    }

    fn process_locked(&self, request_id: RequestId) -> Result<DeliveryPayload> {
        let mut request = self.load(request_id)?;
        match request.state {
            RecoveryState::Approved => {}
            RecoveryState::Processed | RecoveryState::Completed => {
                return request
                    .delivery
                    .clone()
                    .ok_or_else(|| invalid_state(request_id, request.state, "process"));
            }
            other => return Err(invalid_state(request_id, other, "process")),
        }

        let outcome = request
            .session_key_material
            .take()
            .ok_or_else(|| KraError::Store("recovery material already consumed".to_string()))
            .and_then(|credentials| {
                let record = self
                    .store
                    .get_key(request.key_id)?
                    .ok_or(KraError::KeyNotFound(request.key_id))?;
                self.deliver(&record, &credentials)
            });

        request.clear_session_material();
        match outcome {
            Ok(delivery) => {
                request.delivery = Some(delivery.clone());
                request.transition(RecoveryState::Processed);
                self.store.put_request(request)?;
                info!(request_id = %request_id, "recovery processed");
                Ok(delivery)
            }
            Err(e) => {
                error!(request_id = %request_id, error = %e, "recovery processing failed");
                request.transition(RecoveryState::Failed);
                self.store.put_request(request)?;
                Err(KraError::RecoveryFailed { request_id })
            }
        }
    }

    /// Confirm the caller received the delivery
    pub fn acknowledge(&self, request_id: RequestId) -> Result<RecoveryRequest> {
        self.with_request(request_id, |request| match request.state {
            RecoveryState::Processed => {
                request.transition(RecoveryState::Completed);
                info!(request_id = %request_id, "recovery completed");
                Ok(())
            }
            RecoveryState::Completed => Ok(()),
            other => Err(invalid_state(request_id, other, "acknowledge")),
        })
    }

    /// Abandon a request that has not been processed
    pub fn reject(&self, request_id: RequestId, principal: &str) -> Result<RecoveryRequest> {
        self.authorize(principal, Operation::RejectRecovery)?;

        self.with_request(request_id, |request| match request.state {
            RecoveryState::Created | RecoveryState::Approved => {
                request.clear_session_material();
                request.transition(RecoveryState::Failed);
                warn!(request_id = %request_id, agent = %principal, "recovery rejected");
                Ok(())
            }
            other => Err(invalid_state(request_id, other, "reject")),
        })
    }

    pub fn get_request(&self, request_id: RequestId) -> Result<RecoveryRequest> {
        self.load(request_id)
    }

    /// Requests in `state`, or all requests
    pub fn list_requests(&self, state: Option<RecoveryState>) -> Result<Vec<RecoveryRequest>> {
        self.store.find_requests(state)
    }

    fn deliver(
        &self,
        record: &KeyRecord,
        credentials: &RecoveryCredentials,
    ) -> Result<DeliveryPayload> {
        let env = envelope::decode(&record.wrapped_payload)?;
        let stored = self.storage.unwrap_session_key(
            &env.encrypted_session_key,
            record.wrap_algorithm,
            record.session_algorithm,
        )?;

        match credentials {
            RecoveryCredentials::SessionKey {
                wrapped_session_key,
                algorithm,
                wrap_algorithm,
            } => {
                let caller =
                    self.transport
                        .unwrap_session_key(wrapped_session_key, *wrap_algorithm, *algorithm)?;
                Ok(DeliveryPayload::SessionWrapped {
                    wrapped_session_key: cipher::encrypt(&caller, stored.as_slice())?,
                    session_algorithm: stored.algorithm(),
                    encrypted_payload: env.encrypted_payload,
                })
            }
            RecoveryCredentials::WrappedPassphrase {
                wrapped_session_key,
                algorithm,
                wrap_algorithm,
                encrypted_passphrase,
            } => {
                let caller =
                    self.transport
                        .unwrap_session_key(wrapped_session_key, *wrap_algorithm, *algorithm)?;
                let passphrase = cipher::decrypt(&caller, encrypted_passphrase)?;
                let plaintext = cipher::decrypt(&stored, &env.encrypted_payload)?;
                self.passphrase_delivery(&passphrase, &plaintext)
            }
            RecoveryCredentials::Passphrase { passphrase } => {
                let plaintext = cipher::decrypt(&stored, &env.encrypted_payload)?;
                self.passphrase_delivery(passphrase.as_bytes(), &plaintext)
            }
            RecoveryCredentials::AgentX509 => {
                let plaintext = cipher::decrypt(&stored, &env.encrypted_payload)?;
                Ok(DeliveryPayload::Base64 {
                    data: BASE64.encode(plaintext.as_slice()),
                })
            }
        }
    }

    fn passphrase_delivery(&self, passphrase: &[u8], plaintext: &[u8]) -> Result<DeliveryPayload> {
        let salt = cipher::generate_salt();
        let iterations = self.config.passphrase_kdf_iterations;
        let key = cipher::derive_passphrase_key(passphrase, &salt, iterations)?;
        Ok(DeliveryPayload::PassphraseEncrypted {
            ciphertext: cipher::encrypt(&key, plaintext)?,
            salt,
            iterations,
        })
    }

    fn authorize(&self, principal: &str, operation: Operation) -> Result<()> {
        if self.authorizer.is_authorized(principal, operation) {
            Ok(())
        } else {
            warn!(agent = %principal, operation = operation.name(), "unauthorized recovery operation");
            Err(KraError::NotAuthorized {
                principal: principal.to_string(),
                operation: operation.name(),
            })
        }
    }

    fn load(&self, request_id: RequestId) -> Result<RecoveryRequest> {
        self.store
            .get_request(request_id)?
            .ok_or(KraError::RequestNotFound(request_id))
    }

    fn lock_for(&self, request_id: RequestId) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| KraError::Store("request lock map poisoned".to_string()))?;
        Ok(locks.entry(request_id).or_default().clone())
    }

    /// Drop the lock entry once no caller holds or awaits it
    ///
    /// Clones are only handed out under the map lock, so a count of one
    /// means the map owns the sole reference.
    fn release_lock(&self, request_id: RequestId) {
        let Ok(mut locks) = self.locks.lock() else {
            return;
        };
        if locks
            .get(&request_id)
            .map_or(false, |lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&request_id);
        }
    }

    /// Run `f` while holding the lock of `request_id`
    fn serialized<T>(&self, request_id: RequestId, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.lock_for(request_id)?;
        let outcome = match lock.lock() {
            Ok(_guard) => f(),
            Err(_) => Err(KraError::Store("request lock poisoned".to_string())),
        };
        drop(lock);
        self.release_lock(request_id);
        outcome
    }

    /// Load, mutate and store a request under its lock
    fn with_request(
        &self,
        request_id: RequestId,
        f: impl FnOnce(&mut RecoveryRequest) -> Result<()>,
    ) -> Result<RecoveryRequest> {
        self.serialized(request_id, || {
            let mut request = self.load(request_id)?;
            f(&mut request)?;
            self.store.put_request(request.clone())?;
            Ok(request)
        })
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for RecoveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryService")
            .field("storage", &self.storage)
            .field("transport", &self.transport)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn invalid_state(request_id: RequestId, state: RecoveryState, operation: &'static str) -> KraError {
    KraError::InvalidState {
        request_id,
        state: state.to_string(),
        operation,
    }
}

fn check_credentials(credentials: &RecoveryCredentials) -> Result<()> {
    let empty = match credentials {
        RecoveryCredentials::SessionKey {
            wrapped_session_key,
            ..
        } => wrapped_session_key.is_empty(),
        RecoveryCredentials::WrappedPassphrase {
            wrapped_session_key,
            encrypted_passphrase,
            ..
        } => wrapped_session_key.is_empty() || encrypted_passphrase.is_empty(),
        RecoveryCredentials::Passphrase { passphrase } => passphrase.is_empty(),
        RecoveryCredentials::AgentX509 => false,
    };
    if empty {
        return Err(KraError::InvalidConfig(format!(
            "empty recovery material for {:?}",
            credentials.method()
        )));
    }
    Ok(())
}
