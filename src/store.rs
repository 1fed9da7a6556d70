//! Record persistence collaborator
//!
//! The KRA core treats persistence as a key-value store keyed by key and
//! request identifiers. Single-record writes are atomic; [`RecordStore::commit_key`]
//! additionally covers the two-record supersede step of archival.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::error::{KraError, Result};
use crate::types::{KeyId, KeyRecord, KeyStatus, RecoveryRequest, RecoveryState, RequestId};

/// Search criteria for [`RecordStore::find_keys`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFilter {
    pub owner_id: Option<String>,
    pub status: Option<KeyStatus>,
}

impl KeyFilter {
    pub fn owner(owner_id: impl Into<String>) -> Self {
        KeyFilter {
            owner_id: Some(owner_id.into()),
            status: None,
        }
    }

    pub fn with_status(mut self, status: KeyStatus) -> Self {
        self.status = Some(status);
        self
    }

    fn matches(&self, record: &KeyRecord) -> bool {
        self.owner_id
            .as_deref()
            .map_or(true, |owner| owner == record.owner_id)
            && self.status.map_or(true, |status| status == record.status)
    }
}

pub trait RecordStore: Send + Sync {
    /// Allocate the next key identifier
    fn next_key_id(&self) -> Result<KeyId>;

    /// Allocate the next request identifier
    fn next_request_id(&self) -> Result<RequestId>;

    fn get_key(&self, id: KeyId) -> Result<Option<KeyRecord>>;

    /// The owner's Active record, if any
    fn find_active_by_owner(&self, owner_id: &str) -> Result<Option<KeyRecord>>;

    /// Records matching `filter`, ordered by id
    fn find_keys(&self, filter: &KeyFilter) -> Result<Vec<KeyRecord>>;

    /// Insert or replace `record` atomically
    ///
    /// When `record` is Active, `expected_active` must name the owner's
    /// current Active record (or be `None` if there is none); that record is
    /// set Inactive in the same step. A mismatch yields
    /// [`KraError::StoreConflict`] and nothing is written.
    fn commit_key(&self, record: KeyRecord, expected_active: Option<KeyId>) -> Result<()>;

    fn get_request(&self, id: RequestId) -> Result<Option<RecoveryRequest>>;

    fn put_request(&self, request: RecoveryRequest) -> Result<()>;

    /// Requests in `state`, ordered by id
    fn find_requests(&self, state: Option<RecoveryState>) -> Result<Vec<RecoveryRequest>>;
}

/// Volatile [`RecordStore`] for tests and embedding
#[derive(Debug)]
pub struct InMemoryRecordStore {
    keys: RwLock<BTreeMap<KeyId, KeyRecord>>,
    requests: RwLock<BTreeMap<RequestId, RecoveryRequest>>,
    next_key: AtomicU64,
    next_request: AtomicU64,
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        InMemoryRecordStore {
            keys: RwLock::new(BTreeMap::new()),
            requests: RwLock::new(BTreeMap::new()),
            next_key: AtomicU64::new(1),
            next_request: AtomicU64::new(1),
        }
    }

    pub fn key_count(&self) -> usize {
        self.keys.read().map(|keys| keys.len()).unwrap_or(0)
    }
}

fn poisoned<T>(_: T) -> KraError {
    KraError::Store("lock poisoned".to_string())
}

impl RecordStore for InMemoryRecordStore {
    fn next_key_id(&self) -> Result<KeyId> {
        Ok(self.next_key.fetch_add(1, Ordering::SeqCst))
    }

    fn next_request_id(&self) -> Result<RequestId> {
        Ok(self.next_request.fetch_add(1, Ordering::SeqCst))
    }

    fn get_key(&self, id: KeyId) -> Result<Option<KeyRecord>> {
        let keys = self.keys.read().map_err(poisoned)?;
        Ok(keys.get(&id).cloned())
    }

    fn find_active_by_owner(&self, owner_id: &str) -> Result<Option<KeyRecord>> {
        let keys = self.keys.read().map_err(poisoned)?;
        Ok(keys
            .values()
            .find(|record| record.owner_id == owner_id && record.status == KeyStatus::Active)
            .cloned())
    }

    fn find_keys(&self, filter: &KeyFilter) -> Result<Vec<KeyRecord>> {
        let keys = self.keys.read().map_err(poisoned)?;
        Ok(keys
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect())
    }

    fn commit_key(&self, record: KeyRecord, expected_active: Option<KeyId>) -> Result<()> {
        let mut keys = self.keys.write().map_err(poisoned)?;

        if record.status == KeyStatus::Active {
            let current = keys
                .values()
                .find(|existing| {
                    existing.owner_id == record.owner_id
                        && existing.status == KeyStatus::Active
                        && existing.id != record.id
                })
                .map(|existing| existing.id);

            if current != expected_active {
                return Err(KraError::StoreConflict(record.owner_id.clone()));
            }
            if let Some(previous) = current.and_then(|id| keys.get_mut(&id)) {
                previous.status = KeyStatus::Inactive;
            }
        }

        keys.insert(record.id, record);
        Ok(())
    }

    fn get_request(&self, id: RequestId) -> Result<Option<RecoveryRequest>> {
        let requests = self.requests.read().map_err(poisoned)?;
        Ok(requests.get(&id).cloned())
    }

    fn put_request(&self, request: RecoveryRequest) -> Result<()> {
        let mut requests = self.requests.write().map_err(poisoned)?;
        requests.insert(request.id, request);
        Ok(())
    }

    fn find_requests(&self, state: Option<RecoveryState>) -> Result<Vec<RecoveryRequest>> {
        let requests = self.requests.read().map_err(poisoned)?;
        Ok(requests
            .values()
            .filter(|request| state.map_or(true, |s| s == request.state))
            .cloned()
            .collect())
    }
}
