mod archival;
mod authz;
pub mod cipher;
mod config;
pub mod envelope;
mod error;
pub mod migrate;
pub mod prelude;
mod recovery;
mod store;
mod token;
mod types;
mod unit;
pub mod wrap;

#[cfg(test)]
mod test_support;

pub use archival::{ArchivalPayload, ArchivalService};
pub use authz::{Authorizer, Operation, StaticAuthorizer};
pub use config::KraConfig;
pub use envelope::WrappedKeyEnvelope;
pub use error::{KraError, Result};
pub use recovery::RecoveryService;
pub use store::{InMemoryRecordStore, KeyFilter, RecordStore};
pub use token::{CryptoToken, SoftwareToken};
pub use types::{
    DeliveryPayload, KeyAlgorithm, KeyId, KeyRecord, KeyStatus, KeyUsage, PayloadKind,
    RecoveryCredentials, RecoveryMethod, RecoveryRequest, RecoveryState, RequestId, SessionKey,
    SymmetricAlgorithm, WrapAlgorithm,
};
pub use unit::{ArchiveOptions, StorageKeyUnit, TransportKeyUnit};

pub use rsa;
