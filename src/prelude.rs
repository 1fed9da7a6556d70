//! KRA Prelude
//!
//! Commonly used services, units and domain types in one import.
//!
//! # Example
//!
//! ```rust
//! use kra_core::prelude::*;
//!
//! # fn example() -> Result<()> {
//! let config = KraConfig::from_json_str(r#"{"requiredApprovals": 2}"#)?;
//! assert_eq!(config.storage_wrap_algorithm, WrapAlgorithm::RsaOaep);
//! # Ok(())
//! # }
//! ```

// Services
pub use crate::archival::{ArchivalPayload, ArchivalService};
pub use crate::recovery::RecoveryService;

// Key units and tokens
pub use crate::token::{CryptoToken, SoftwareToken};
pub use crate::unit::{ArchiveOptions, StorageKeyUnit, TransportKeyUnit};

// Collaborators
pub use crate::authz::{Authorizer, Operation, StaticAuthorizer};
pub use crate::store::{InMemoryRecordStore, KeyFilter, RecordStore};

// Domain types
pub use crate::config::KraConfig;
pub use crate::envelope::WrappedKeyEnvelope;
pub use crate::error::{KraError, Result};
pub use crate::types::{
    DeliveryPayload, KeyAlgorithm, KeyRecord, KeyStatus, KeyUsage, PayloadKind,
    RecoveryCredentials, RecoveryMethod, RecoveryRequest, RecoveryState, SessionKey,
    SymmetricAlgorithm, WrapAlgorithm,
};

// Record migration
pub use crate::migrate::{
    transform, FieldPolicy, IdOffset, NamingContextRewrite, RewrapOptions, TargetPublicKey,
    TransformOptions, TransformReport,
};
