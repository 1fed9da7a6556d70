//! Shared fixtures for kra-core integration tests

#![allow(dead_code)]

use std::sync::Arc;

use kra_core::rsa::{RsaPrivateKey, RsaPublicKey};
use kra_core::{
    ArchivalService, InMemoryRecordStore, KraConfig, RecordStore, RecoveryService, SoftwareToken,
    StaticAuthorizer, StorageKeyUnit, TransportKeyUnit,
};
use lazy_static::lazy_static;

lazy_static! {
    static ref STORAGE_KEY: RsaPrivateKey = generate();
    static ref TRANSPORT_KEY: RsaPrivateKey = generate();
    static ref TARGET_STORAGE_KEY: RsaPrivateKey = generate();
}

fn generate() -> RsaPrivateKey {
    RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("RSA key generation")
}

/// Agents allowed to approve recoveries
pub const AGENTS: [&str; 3] = ["agent-1", "agent-2", "agent-3"];

pub fn storage_key() -> &'static RsaPrivateKey {
    &STORAGE_KEY
}

pub fn target_storage_key() -> &'static RsaPrivateKey {
    &TARGET_STORAGE_KEY
}

pub fn transport_public_key() -> RsaPublicKey {
    TRANSPORT_KEY.to_public_key()
}

pub fn storage_unit() -> Arc<StorageKeyUnit> {
    Arc::new(StorageKeyUnit::new(SoftwareToken::new(
        "storage",
        STORAGE_KEY.clone(),
    )))
}

pub fn target_storage_unit() -> StorageKeyUnit {
    StorageKeyUnit::new(SoftwareToken::new(
        "target storage",
        TARGET_STORAGE_KEY.clone(),
    ))
}

pub fn transport_unit() -> Arc<TransportKeyUnit> {
    Arc::new(TransportKeyUnit::new(SoftwareToken::new(
        "transport",
        TRANSPORT_KEY.clone(),
    )))
}

/// Archival and recovery services sharing one store and one pair of units
pub struct Kra {
    pub store: Arc<InMemoryRecordStore>,
    pub archival: ArchivalService,
    pub recovery: RecoveryService,
}

/// Services with a low PBKDF2 iteration count for fast tests
pub fn kra(required_approvals: u32) -> Kra {
    let config = KraConfig {
        required_approvals,
        passphrase_kdf_iterations: 1_000,
        ..KraConfig::default()
    };
    let storage = storage_unit();
    let transport = transport_unit();
    let store = Arc::new(InMemoryRecordStore::new());
    let shared: Arc<dyn RecordStore> = store.clone();

    let mut authorizer = StaticAuthorizer::new();
    for agent in AGENTS {
        authorizer = authorizer.agent(agent);
    }

    Kra {
        archival: ArchivalService::new(
            storage.clone(),
            transport.clone(),
            shared.clone(),
            config.clone(),
        )
        .unwrap(),
        recovery: RecoveryService::new(storage, transport, shared, Arc::new(authorizer), config)
            .unwrap(),
        store,
    }
}
