//! Domain types shared by the KRA services
//!
//! Algorithms, the zeroizing [`SessionKey`], persisted [`KeyRecord`]s and the
//! [`RecoveryRequest`] lifecycle types.

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::cipher;
use crate::error::{KraError, Result};

/// Numeric identifier of a [`KeyRecord`]
pub type KeyId = u64;

/// Numeric identifier of a [`RecoveryRequest`]
pub type RequestId = u64;

/// Asymmetric algorithm used to wrap a session key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WrapAlgorithm {
    /// RSA PKCS#1 v1.5 encryption
    RsaPkcs1,
    /// RSA-OAEP with SHA-256 and MGF1-SHA-256
    #[default]
    RsaOaep,
}

impl WrapAlgorithm {
    /// Parse a wrap algorithm name (`RSA`, `PKCS1`, `RSA_OAEP`, `OAEP`)
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "RSA" | "PKCS1" | "RSA_PKCS1" => Ok(Self::RsaPkcs1),
            "OAEP" | "RSA_OAEP" | "RSA-OAEP" => Ok(Self::RsaOaep),
            other => Err(KraError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RsaPkcs1 => "RSA",
            Self::RsaOaep => "RSA_OAEP",
        }
    }
}

impl fmt::Display for WrapAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Symmetric algorithm of a session key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SymmetricAlgorithm {
    #[default]
    Aes,
    Des3,
}

impl SymmetricAlgorithm {
    /// Parse a symmetric algorithm name, case-insensitively
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "AES" => Ok(Self::Aes),
            "DES3" | "DESEDE" | "3DES" => Ok(Self::Des3),
            other => Err(KraError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Aes => "AES",
            Self::Des3 => "DES3",
        }
    }

    /// Key lengths in bytes accepted for this algorithm
    pub fn key_lengths(&self) -> &'static [usize] {
        match self {
            Self::Aes => &[16, 24, 32],
            Self::Des3 => &[24],
        }
    }

    /// Key length used when generating a fresh session key
    pub fn default_key_length(&self) -> usize {
        match self {
            Self::Aes => 32,
            Self::Des3 => 24,
        }
    }
}

impl fmt::Display for SymmetricAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Algorithm of an escrowed secret
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyAlgorithm {
    Aes,
    Des3,
    Rsa,
    Ec,
}

impl KeyAlgorithm {
    pub fn parse(name: &str) -> Result<Self> {
        match name.to_ascii_uppercase().as_str() {
            "AES" => Ok(Self::Aes),
            "DES3" | "DESEDE" => Ok(Self::Des3),
            "RSA" => Ok(Self::Rsa),
            "EC" => Ok(Self::Ec),
            other => Err(KraError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Aes => "AES",
            Self::Des3 => "DES3",
            Self::Rsa => "RSA",
            Self::Ec => "EC",
        }
    }

    /// The session algorithm matching this key algorithm, if symmetric
    pub fn as_symmetric(&self) -> Option<SymmetricAlgorithm> {
        match self {
            Self::Aes => Some(SymmetricAlgorithm::Aes),
            Self::Des3 => Some(SymmetricAlgorithm::Des3),
            Self::Rsa | Self::Ec => None,
        }
    }
}

impl fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of secret held by a [`KeyRecord`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PayloadKind {
    SymmetricKey,
    Passphrase,
    AsymmetricPrivateKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyStatus {
    Active,
    Inactive,
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => f.write_str("active"),
            Self::Inactive => f.write_str("inactive"),
        }
    }
}

/// Permitted usage of a server-generated key
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyUsage {
    Encrypt,
    Decrypt,
    Wrap,
    Unwrap,
    Sign,
    Verify,
}

/// Symmetric session key that zeroizes on drop
///
/// Equality is constant-time.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    #[zeroize(skip)]
    algorithm: SymmetricAlgorithm,
    bytes: Vec<u8>,
}

impl SessionKey {
    /// Create a session key, checking the length against the algorithm
    pub fn new(algorithm: SymmetricAlgorithm, bytes: &[u8]) -> Result<Self> {
        if !algorithm.key_lengths().contains(&bytes.len()) {
            return Err(KraError::InvalidKeySize {
                algorithm: algorithm.name().to_string(),
                bits: (bytes.len() * 8) as u32,
            });
        }
        Ok(SessionKey {
            algorithm,
            bytes: bytes.to_vec(),
        })
    }

    /// Generate a random key of the algorithm's default length
    pub fn generate(algorithm: SymmetricAlgorithm) -> Self {
        let mut bytes = vec![0u8; algorithm.default_key_length()];
        OsRng.fill_bytes(&mut bytes);
        SessionKey { algorithm, bytes }
    }

    /// Generate a random key of `len` bytes
    pub fn generate_with_length(algorithm: SymmetricAlgorithm, len: usize) -> Result<Self> {
        let mut bytes = Zeroizing::new(vec![0u8; len]);
        OsRng.fill_bytes(&mut bytes);
        Self::new(algorithm, &bytes)
    }

    pub fn algorithm(&self) -> SymmetricAlgorithm {
        self.algorithm
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl PartialEq for SessionKey {
    fn eq(&self, other: &Self) -> bool {
        self.algorithm == other.algorithm && bool::from(self.bytes.ct_eq(&other.bytes))
    }
}

impl Eq for SessionKey {}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey")
            .field("algorithm", &self.algorithm)
            .field("len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}

/// Persisted escrowed secret
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRecord {
    pub id: KeyId,
    pub owner_id: String,
    pub payload_kind: PayloadKind,
    /// Encoded [`crate::envelope::WrappedKeyEnvelope`]
    pub wrapped_payload: Vec<u8>,
    pub algorithm: Option<KeyAlgorithm>,
    pub key_size_bits: Option<u32>,
    pub session_algorithm: SymmetricAlgorithm,
    pub wrap_algorithm: WrapAlgorithm,
    #[serde(default)]
    pub usages: Vec<KeyUsage>,
    pub status: KeyStatus,
    pub created_at: DateTime<Utc>,
}

/// Recovery request lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryState {
    Created,
    Approved,
    Processed,
    Completed,
    Failed,
}

impl fmt::Display for RecoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Approved => "approved",
            Self::Processed => "processed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RecoveryMethod {
    SessionKey,
    WrappedPassphrase,
    Passphrase,
    AgentX509,
}

/// Caller-supplied recovery material
///
/// Session keys arrive wrapped under the transport public key. The material
/// is transient: it is cleared from the request once consumed.
#[derive(Clone)]
pub enum RecoveryCredentials {
    SessionKey {
        wrapped_session_key: Vec<u8>,
        algorithm: SymmetricAlgorithm,
        wrap_algorithm: WrapAlgorithm,
    },
    WrappedPassphrase {
        wrapped_session_key: Vec<u8>,
        algorithm: SymmetricAlgorithm,
        wrap_algorithm: WrapAlgorithm,
        /// Passphrase encrypted under the caller's session key
        encrypted_passphrase: Vec<u8>,
    },
    Passphrase {
        passphrase: String,
    },
    AgentX509,
}

impl RecoveryCredentials {
    pub fn method(&self) -> RecoveryMethod {
        match self {
            Self::SessionKey { .. } => RecoveryMethod::SessionKey,
            Self::WrappedPassphrase { .. } => RecoveryMethod::WrappedPassphrase,
            Self::Passphrase { .. } => RecoveryMethod::Passphrase,
            Self::AgentX509 => RecoveryMethod::AgentX509,
        }
    }
}

impl Drop for RecoveryCredentials {
    fn drop(&mut self) {
        match self {
            Self::SessionKey {
                wrapped_session_key,
                ..
            } => wrapped_session_key.zeroize(),
            Self::WrappedPassphrase {
                wrapped_session_key,
                encrypted_passphrase,
                ..
            } => {
                wrapped_session_key.zeroize();
                encrypted_passphrase.zeroize();
            }
            Self::Passphrase { passphrase } => passphrase.zeroize(),
            Self::AgentX509 => {}
        }
    }
}

impl fmt::Debug for RecoveryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecoveryCredentials::{:?}(..)", self.method())
    }
}

/// Result of a processed recovery request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum DeliveryPayload {
    /// Stored session key encrypted under the caller's session key, plus the
    /// untouched session-encrypted payload
    SessionWrapped {
        wrapped_session_key: Vec<u8>,
        session_algorithm: SymmetricAlgorithm,
        encrypted_payload: Vec<u8>,
    },
    /// Plaintext encrypted with AES-256-GCM under a PBKDF2 passphrase key
    PassphraseEncrypted {
        salt: Vec<u8>,
        iterations: u32,
        ciphertext: Vec<u8>,
    },
    /// Base64 plaintext for an authenticated agent channel
    Base64 { data: String },
}

impl DeliveryPayload {
    /// Recover the escrowed secret using the caller's session key
    pub fn open_with_session_key(&self, caller_key: &SessionKey) -> Result<Zeroizing<Vec<u8>>> {
        match self {
            Self::SessionWrapped {
                wrapped_session_key,
                session_algorithm,
                encrypted_payload,
            } => {
                let raw = cipher::decrypt(caller_key, wrapped_session_key)?;
                let stored = SessionKey::new(*session_algorithm, &raw)?;
                cipher::decrypt(&stored, encrypted_payload)
            }
            _ => Err(KraError::UnsupportedAlgorithm(
                "delivery is not session-key wrapped".to_string(),
            )),
        }
    }

    /// Recover the escrowed secret using the recovery passphrase
    pub fn open_with_passphrase(&self, passphrase: &str) -> Result<Zeroizing<Vec<u8>>> {
        match self {
            Self::PassphraseEncrypted {
                salt,
                iterations,
                ciphertext,
            } => {
                let key = cipher::derive_passphrase_key(passphrase.as_bytes(), salt, *iterations)?;
                cipher::decrypt(&key, ciphertext)
            }
            _ => Err(KraError::UnsupportedAlgorithm(
                "delivery is not passphrase encrypted".to_string(),
            )),
        }
    }

    /// Decode a base64 agent delivery
    pub fn decode_base64(&self) -> Result<Zeroizing<Vec<u8>>> {
        match self {
            Self::Base64 { data } => Ok(Zeroizing::new(BASE64.decode(data)?)),
            _ => Err(KraError::UnsupportedAlgorithm(
                "delivery is not base64 encoded".to_string(),
            )),
        }
    }
}

/// Tracks a single recovery transaction
#[derive(Debug, Clone)]
pub struct RecoveryRequest {
    pub id: RequestId,
    pub key_id: KeyId,
    pub method: RecoveryMethod,
    pub state: RecoveryState,
    /// Transient caller material; `None` once consumed
    pub session_key_material: Option<RecoveryCredentials>,
    /// Distinct agents that approved the request
    pub approvals: Vec<String>,
    pub delivery: Option<DeliveryPayload>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecoveryRequest {
    /// Move to `state`, stamping the update time
    pub(crate) fn transition(&mut self, state: RecoveryState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    /// Drop the transient caller material
    pub(crate) fn clear_session_material(&mut self) {
        self.session_key_material = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_key_lengths() {
        assert!(SessionKey::new(SymmetricAlgorithm::Aes, &[0u8; 16]).is_ok());
        assert!(SessionKey::new(SymmetricAlgorithm::Aes, &[0u8; 24]).is_ok());
        assert!(SessionKey::new(SymmetricAlgorithm::Aes, &[0u8; 32]).is_ok());
        assert!(SessionKey::new(SymmetricAlgorithm::Des3, &[0u8; 24]).is_ok());

        let result = SessionKey::new(SymmetricAlgorithm::Aes, &[0u8; 20]);
        assert!(matches!(
            result,
            Err(KraError::InvalidKeySize { bits: 160, .. })
        ));
        assert!(SessionKey::new(SymmetricAlgorithm::Des3, &[0u8; 16]).is_err());
    }

    #[test]
    fn test_session_key_generate() {
        let a = SessionKey::generate(SymmetricAlgorithm::Aes);
        let b = SessionKey::generate(SymmetricAlgorithm::Aes);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
        assert_eq!(SessionKey::generate(SymmetricAlgorithm::Des3).len(), 24);
    }

    #[test]
    fn test_session_key_debug_is_redacted() {
        let key = SessionKey::new(SymmetricAlgorithm::Aes, &[0xAB; 16]).unwrap();
        let debug = format!("{:?}", key);
        assert!(!debug.contains("171"));
        assert!(debug.contains("len: 16"));
    }

    #[test]
    fn test_algorithm_parsing() {
        assert_eq!(WrapAlgorithm::parse("rsa").unwrap(), WrapAlgorithm::RsaPkcs1);
        assert_eq!(WrapAlgorithm::parse("RSA_OAEP").unwrap(), WrapAlgorithm::RsaOaep);
        assert_eq!(
            SymmetricAlgorithm::parse("des3").unwrap(),
            SymmetricAlgorithm::Des3
        );
        assert!(SymmetricAlgorithm::parse("RC4").is_err());
        assert_eq!(KeyAlgorithm::parse("aes").unwrap(), KeyAlgorithm::Aes);
        assert_eq!(
            KeyAlgorithm::Des3.as_symmetric(),
            Some(SymmetricAlgorithm::Des3)
        );
        assert_eq!(KeyAlgorithm::Rsa.as_symmetric(), None);
    }

    #[test]
    fn test_credentials_debug_hides_material() {
        let creds = RecoveryCredentials::Passphrase {
            passphrase: "hunter2".to_string(),
        };
        assert_eq!(creds.method(), RecoveryMethod::Passphrase);
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
