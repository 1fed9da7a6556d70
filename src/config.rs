//! Service configuration
//!
//! Loaded from camelCase JSON; every field has a default.
//!
//! ```json
//! {
//!   "storageWrapAlgorithm": "RSA_OAEP",
//!   "sessionAlgorithm": "AES",
//!   "requiredApprovals": 2
//! }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{KraError, Result};
use crate::types::{SymmetricAlgorithm, WrapAlgorithm};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KraConfig {
    /// Algorithm used to wrap session keys under the storage key
    pub storage_wrap_algorithm: WrapAlgorithm,
    /// Session algorithm for secrets archived in raw form
    pub session_algorithm: SymmetricAlgorithm,
    /// Distinct agents that must approve a recovery
    pub required_approvals: u32,
    /// PBKDF2 iterations for passphrase-protected deliveries
    pub passphrase_kdf_iterations: u32,
    /// Commit attempts when a concurrent archival supersedes the same owner
    pub archival_retry_limit: u32,
}

impl Default for KraConfig {
    fn default() -> Self {
        KraConfig {
            storage_wrap_algorithm: WrapAlgorithm::RsaOaep,
            session_algorithm: SymmetricAlgorithm::Aes,
            required_approvals: 1,
            passphrase_kdf_iterations: 600_000,
            archival_retry_limit: 3,
        }
    }
}

impl KraConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: KraConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.required_approvals == 0 {
            return Err(KraError::InvalidConfig(
                "requiredApprovals must be at least 1".to_string(),
            ));
        }
        if self.passphrase_kdf_iterations == 0 {
            return Err(KraError::InvalidConfig(
                "passphraseKdfIterations must be positive".to_string(),
            ));
        }
        if self.archival_retry_limit == 0 {
            return Err(KraError::InvalidConfig(
                "archivalRetryLimit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = KraConfig::from_json_str("{}").unwrap();
        assert_eq!(config, KraConfig::default());
        assert_eq!(config.storage_wrap_algorithm, WrapAlgorithm::RsaOaep);
    }

    #[test]
    fn test_partial_override() {
        let config = KraConfig::from_json_str(
            r#"{"storageWrapAlgorithm": "RSA_PKCS1", "sessionAlgorithm": "DES3", "requiredApprovals": 2}"#,
        )
        .unwrap();
        assert_eq!(config.storage_wrap_algorithm, WrapAlgorithm::RsaPkcs1);
        assert_eq!(config.session_algorithm, SymmetricAlgorithm::Des3);
        assert_eq!(config.required_approvals, 2);
        assert_eq!(config.archival_retry_limit, 3);
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            KraConfig::from_json_str(r#"{"requiredApprovals": 0}"#),
            Err(KraError::InvalidConfig(_))
        ));
        assert!(matches!(
            KraConfig::from_json_str("not json"),
            Err(KraError::Json(_))
        ));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"passphraseKdfIterations": 1000}}"#).unwrap();
        let config = KraConfig::from_file(file.path()).unwrap();
        assert_eq!(config.passphrase_kdf_iterations, 1000);
    }
}
