//! RSA key transport primitives
//!
//! Wraps and unwraps raw symmetric key bytes with RSA PKCS#1 v1.5 or
//! RSA-OAEP (SHA-256 digest, MGF1-SHA-256).

use rand::rngs::OsRng;
use rsa::{
    pkcs8::{EncodePublicKey, LineEnding},
    traits::PublicKeyParts,
    Oaep, Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey,
};
use sha2::Sha256;
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::{KraError, Result};
use crate::types::WrapAlgorithm;

/// Encrypt `key` under `public_key`
pub fn rsa_wrap(public_key: &RsaPublicKey, key: &[u8], alg: WrapAlgorithm) -> Result<Vec<u8>> {
    let wrapped = match alg {
        WrapAlgorithm::RsaPkcs1 => public_key.encrypt(&mut OsRng, Pkcs1v15Encrypt, key),
        WrapAlgorithm::RsaOaep => public_key.encrypt(&mut OsRng, Oaep::new::<Sha256>(), key),
    };
    wrapped.map_err(|e| KraError::WrapError(format!("{} encryption failed: {}", alg, e)))
}

/// Decrypt a wrapped key with `private_key`
///
/// The ciphertext must be exactly one modulus long. Every failure collapses
/// into [`KraError::UnwrapError`]; the cause is only logged at debug level.
pub fn rsa_unwrap(
    private_key: &RsaPrivateKey,
    wrapped: &[u8],
    alg: WrapAlgorithm,
) -> Result<Zeroizing<Vec<u8>>> {
    let modulus_len = private_key.size();
    if wrapped.len() != modulus_len {
        debug!(
            expected = modulus_len,
            got = wrapped.len(),
            "wrapped key length does not match modulus"
        );
        return Err(KraError::UnwrapError);
    }

    let key = match alg {
        WrapAlgorithm::RsaPkcs1 => private_key.decrypt(Pkcs1v15Encrypt, wrapped),
        WrapAlgorithm::RsaOaep => private_key.decrypt(Oaep::new::<Sha256>(), wrapped),
    };
    key.map(Zeroizing::new).map_err(|e| {
        debug!(algorithm = %alg, error = %e, "RSA unwrap failed");
        KraError::UnwrapError
    })
}

/// PEM-encoded SubjectPublicKeyInfo
pub fn public_key_pem(public_key: &RsaPublicKey) -> Result<String> {
    public_key
        .to_public_key_pem(LineEnding::LF)
        .map_err(|e| KraError::InvalidPublicKey(e.to_string()))
}

/// Modulus size in bits
pub fn modulus_bits(public_key: &RsaPublicKey) -> usize {
    public_key.n().bits()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::rsa_key;

    #[test]
    fn test_round_trip_both_algorithms() {
        let private_key = rsa_key(0);
        let public_key = RsaPublicKey::from(private_key);
        let key = [0x11u8; 32];

        for alg in [WrapAlgorithm::RsaPkcs1, WrapAlgorithm::RsaOaep] {
            let wrapped = rsa_wrap(&public_key, &key, alg).unwrap();
            assert_eq!(wrapped.len(), 256);
            let unwrapped = rsa_unwrap(private_key, &wrapped, alg).unwrap();
            assert_eq!(unwrapped.as_slice(), &key);
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let public_key = RsaPublicKey::from(rsa_key(0));
        let wrapped = rsa_wrap(&public_key, &[0x22u8; 16], WrapAlgorithm::RsaOaep).unwrap();
        let result = rsa_unwrap(rsa_key(1), &wrapped, WrapAlgorithm::RsaOaep);
        assert!(matches!(result, Err(KraError::UnwrapError)));
    }

    #[test]
    fn test_invalid_length() {
        let result = rsa_unwrap(rsa_key(0), &[0u8; 128], WrapAlgorithm::RsaPkcs1);
        assert!(matches!(result, Err(KraError::UnwrapError)));
    }

    #[test]
    fn test_public_key_pem() {
        let public_key = RsaPublicKey::from(rsa_key(0));
        let pem = public_key_pem(&public_key).unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
        assert_eq!(modulus_bits(&public_key), 2048);
    }
}
