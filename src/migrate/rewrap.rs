//! Storage key rewrapping for migrated key records

use std::path::Path;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use der::{Decode, Encode};
use rsa::{pkcs1::DecodeRsaPublicKey, pkcs8::DecodePublicKey, RsaPublicKey};
use x509_cert::Certificate;

use crate::envelope;
use crate::error::{KraError, Result};
use crate::types::{SymmetricAlgorithm, WrapAlgorithm};
use crate::unit::StorageKeyUnit;
use crate::wrap::modulus_bits;

/// RSA public key of the target storage unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPublicKey {
    key: RsaPublicKey,
}

impl TargetPublicKey {
    pub fn new(key: RsaPublicKey) -> Self {
        TargetPublicKey { key }
    }

    /// Load from a PEM certificate, SubjectPublicKeyInfo or PKCS#1 key
    ///
    /// Input without PEM armor is read as base64 certificate DER.
    pub fn from_pem(input: &str) -> Result<Self> {
        let invalid = |e: &dyn std::fmt::Display| KraError::InvalidPublicKey(e.to_string());

        if !input.contains("-----BEGIN") {
            let compact: String = input.split_whitespace().collect();
            let der = BASE64.decode(compact).map_err(|e| invalid(&e))?;
            return Self::from_certificate_der(&der);
        }

        let block = pem::parse(input).map_err(|e| invalid(&e))?;
        let key = match block.tag() {
            "CERTIFICATE" => return Self::from_certificate_der(block.contents()),
            "PUBLIC KEY" => {
                RsaPublicKey::from_public_key_der(block.contents()).map_err(|e| invalid(&e))?
            }
            "RSA PUBLIC KEY" => {
                RsaPublicKey::from_pkcs1_der(block.contents()).map_err(|e| invalid(&e))?
            }
            other => return Err(KraError::InvalidPublicKey(format!("unexpected PEM block '{}'", other))),
        };
        Ok(TargetPublicKey { key })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let input = std::fs::read_to_string(path)?;
        Self::from_pem(&input)
    }

    fn from_certificate_der(der: &[u8]) -> Result<Self> {
        let invalid = |e: &dyn std::fmt::Display| KraError::InvalidPublicKey(e.to_string());
        let certificate = Certificate::from_der(der).map_err(|e| invalid(&e))?;
        let spki = certificate
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(|e| invalid(&e))?;
        let key = RsaPublicKey::from_public_key_der(&spki).map_err(|e| invalid(&e))?;
        Ok(TargetPublicKey { key })
    }

    pub fn key(&self) -> &RsaPublicKey {
        &self.key
    }

    /// Modulus size in bits
    pub fn bits(&self) -> usize {
        modulus_bits(&self.key)
    }
}

/// Moves archived envelopes from a source storage unit to a target key
#[derive(Debug, Clone)]
pub struct RewrapOptions {
    pub source: Arc<StorageKeyUnit>,
    pub target: TargetPublicKey,
    /// Wrap algorithm of both the source and the target session key
    pub wrap_algorithm: WrapAlgorithm,
    /// Algorithm of the session keys being moved
    pub unwrap_algorithm: SymmetricAlgorithm,
    /// Source token was unlocked from a password file
    pub used_password_file: bool,
}

impl RewrapOptions {
    /// PKCS#1 wrapping of DES3 session keys
    pub fn new(source: Arc<StorageKeyUnit>, target: TargetPublicKey) -> Self {
        RewrapOptions {
            source,
            target,
            wrap_algorithm: WrapAlgorithm::RsaPkcs1,
            unwrap_algorithm: SymmetricAlgorithm::Des3,
            used_password_file: false,
        }
    }

    pub fn with_wrap_algorithm(mut self, wrap_algorithm: WrapAlgorithm) -> Self {
        self.wrap_algorithm = wrap_algorithm;
        self
    }

    pub fn with_unwrap_algorithm(mut self, unwrap_algorithm: SymmetricAlgorithm) -> Self {
        self.unwrap_algorithm = unwrap_algorithm;
        self
    }

    pub fn with_password_file(mut self, used: bool) -> Self {
        self.used_password_file = used;
        self
    }

    /// Rewrap one encoded envelope
    pub fn rewrap_blob(&self, blob: &[u8]) -> Result<Vec<u8>> {
        let source = envelope::decode(blob)?;
        let target = self.source.rewrap(
            &source,
            self.wrap_algorithm,
            self.target.key(),
            self.wrap_algorithm,
            self.unwrap_algorithm,
        )?;
        target.to_der()
    }
}
