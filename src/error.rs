//! Unified error type for the KRA core
//!
//! Every operation in this crate returns [`KraError`]. Cryptographic
//! primitives raise the fine-grained variants (`WrapError`, `UnwrapError`,
//! ...); the archival and recovery services collapse those into the coarse
//! `ArchivalError` / `RecoveryFailed` variants before they reach a caller, so
//! no padding or algorithm detail crosses the service boundary.
//!
//! # Example
//!
//! ```no_run
//! use kra_core::KraError;
//!
//! fn handle(err: KraError) {
//!     if let Some(hint) = err.suggestion() {
//!         eprintln!("{err}: {hint}");
//!     }
//! }
//! ```

use thiserror::Error;

/// Convenience alias used throughout the crate
pub type Result<T> = std::result::Result<T, KraError>;

/// Errors raised by the KRA core
///
/// # Error Categories
///
/// - **Envelope / crypto**: `MalformedEnvelope`, `WrapError`, `UnwrapError`,
///   `TransportUnwrapFailure`, `TokenUnavailable`, `InvalidPublicKey`
/// - **Validation**: `UnsupportedAlgorithm`, `InvalidKeySize`, `MissingUsages`
/// - **Service boundary**: `ArchivalError`, `RecoveryFailed`, `KeyNotFound`,
///   `NoActiveKey`, `RequestNotFound`, `InvalidState`, `NotAuthorized`
/// - **Migration**: `OffsetUnderflow`, `OffsetPolicyViolation`,
///   `InvalidIndexedValue`, `IndexedOverflow`
/// - **Plumbing**: `Store`, `StoreConflict`, `InvalidConfig`, `Io`, `Base64`,
///   `Json`
#[derive(Debug, Error)]
pub enum KraError {
    /// Blob is not a DER `SEQUENCE { OCTET STRING, OCTET STRING }`
    #[error("malformed key envelope: {0}")]
    MalformedEnvelope(String),

    /// Session key could not be wrapped
    #[error("key wrap failed: {0}")]
    WrapError(String),

    /// Session key could not be unwrapped
    #[error("key unwrap failed")]
    UnwrapError,

    /// Material received under the transport key could not be opened
    #[error("transport unwrap failed")]
    TransportUnwrapFailure,

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("invalid key size for {algorithm}: {bits} bits")]
    InvalidKeySize { algorithm: String, bits: u32 },

    /// Key generation requested without any key usage
    #[error("key generation requires at least one usage")]
    MissingUsages,

    /// Archival could not be completed; nothing was persisted
    #[error("archival failed for owner '{owner_id}'")]
    ArchivalError { owner_id: String },

    /// Recovery could not be completed; the request is now failed
    #[error("recovery failed for request {request_id}")]
    RecoveryFailed { request_id: u64 },

    /// Remove-mode offset is larger than the stored value
    #[error("offset {offset} exceeds value {value} of '{attribute}'")]
    OffsetUnderflow {
        attribute: String,
        value: String,
        offset: String,
    },

    /// Append-mode offset is not strictly greater than the stored value
    #[error("value {value} of '{attribute}' is not below append offset {offset}")]
    OffsetPolicyViolation {
        attribute: String,
        value: String,
        offset: String,
    },

    /// Token is not logged in or its private key is inaccessible
    #[error("token '{0}' unavailable")]
    TokenUnavailable(String),

    #[error("key {0} not found")]
    KeyNotFound(u64),

    #[error("no active key for owner '{0}'")]
    NoActiveKey(String),

    #[error("recovery request {0} not found")]
    RequestNotFound(u64),

    /// Operation not permitted in the current request state
    #[error("request {request_id} is {state}; cannot {operation}")]
    InvalidState {
        request_id: u64,
        state: String,
        operation: &'static str,
    },

    #[error("principal '{principal}' is not authorized to {operation}")]
    NotAuthorized {
        principal: String,
        operation: &'static str,
    },

    /// Stored indexed value whose length prefix does not match its digits
    #[error("invalid indexed value: {0}")]
    InvalidIndexedValue(String),

    /// Offset result too long for the two-digit length prefix
    #[error("indexed value of {digits} digits exceeds the limit of {limit}")]
    IndexedOverflow { digits: usize, limit: usize },

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Record store rejected a commit because the owner's active record changed
    #[error("record store conflict for owner '{0}'")]
    StoreConflict(String),

    #[error("record store error: {0}")]
    Store(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KraError {
    /// Returns true for errors raised by a cryptographic primitive
    pub fn is_crypto_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedEnvelope(_)
                | Self::WrapError(_)
                | Self::UnwrapError
                | Self::TransportUnwrapFailure
                | Self::TokenUnavailable(_)
                | Self::InvalidPublicKey(_)
        )
    }

    /// Returns true for errors raised by the record migration transform
    pub fn is_migration_error(&self) -> bool {
        matches!(
            self,
            Self::OffsetUnderflow { .. }
                | Self::OffsetPolicyViolation { .. }
                | Self::InvalidIndexedValue(_)
                | Self::IndexedOverflow { .. }
        )
    }

    /// Returns true if retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreConflict(_) | Self::TokenUnavailable(_))
    }

    /// Returns a suggestion for resolving this error
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::TokenUnavailable(_) => Some("log in to the token before use"),
            Self::OffsetPolicyViolation { .. } => {
                Some("choose an append offset larger than every existing identifier")
            }
            Self::OffsetUnderflow { .. } => {
                Some("choose a remove offset no larger than the smallest identifier")
            }
            Self::IndexedOverflow { .. } => Some("choose a smaller ID offset"),
            Self::MissingUsages => Some("specify at least one key usage"),
            Self::InvalidState { .. } => Some("check the request state before retrying"),
            Self::InvalidPublicKey(_) => {
                Some("supply a PEM certificate, SubjectPublicKeyInfo or PKCS#1 RSA key")
            }
            _ => None,
        }
    }
}
