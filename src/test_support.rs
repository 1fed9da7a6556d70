//! Shared fixtures for unit tests

use lazy_static::lazy_static;
use rand::rngs::OsRng;
use rsa::RsaPrivateKey;

use crate::token::SoftwareToken;
use crate::unit::{StorageKeyUnit, TransportKeyUnit};

lazy_static! {
    static ref RSA_KEYS: Vec<RsaPrivateKey> = (0..3)
        .map(|_| RsaPrivateKey::new(&mut OsRng, 2048).expect("RSA key generation"))
        .collect();
}

/// One of three cached 2048-bit RSA keys
pub(crate) fn rsa_key(index: usize) -> &'static RsaPrivateKey {
    &RSA_KEYS[index]
}

/// Storage unit over cached key `index` (0 or 1)
pub(crate) fn storage_unit(index: usize) -> StorageKeyUnit {
    StorageKeyUnit::new(SoftwareToken::new(
        format!("storage-{}", index),
        rsa_key(index).clone(),
    ))
}

/// Transport unit over cached key 2
pub(crate) fn transport_unit() -> TransportKeyUnit {
    TransportKeyUnit::new(SoftwareToken::new("transport", rsa_key(2).clone()))
}
