//! Symmetric encryption under session keys
//!
//! AES session keys use AES-GCM with a random 96-bit nonce
//! (`nonce || ciphertext || tag`). DES3 session keys use CBC with PKCS#7
//! padding and a random 64-bit IV (`iv || ciphertext`).
//!
//! The same primitives encrypt escrowed payloads and wrap one session key
//! under another during recovery.

use aes_gcm::{
    aead::{consts::U12, Aead, KeyInit},
    aes::Aes192,
    Aes128Gcm, Aes256Gcm, AesGcm,
};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::Hmac;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::{KraError, Result};
use crate::types::{SessionKey, SymmetricAlgorithm};

type Aes192Gcm = AesGcm<Aes192, U12>;
type Des3CbcEnc = cbc::Encryptor<des::TdesEde3>;
type Des3CbcDec = cbc::Decryptor<des::TdesEde3>;

/// AES-GCM nonce length in bytes
pub const GCM_NONCE_LEN: usize = 12;

/// DES3-CBC IV length in bytes
pub const DES3_IV_LEN: usize = 8;

/// Salt length for passphrase key derivation
pub const PASSPHRASE_SALT_LEN: usize = 16;

/// Encrypt `plaintext` under a session key
pub fn encrypt(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    match key.algorithm() {
        SymmetricAlgorithm::Aes => match key.len() {
            16 => gcm_seal::<Aes128Gcm>(key.as_slice(), plaintext),
            24 => gcm_seal::<Aes192Gcm>(key.as_slice(), plaintext),
            32 => gcm_seal::<Aes256Gcm>(key.as_slice(), plaintext),
            other => Err(invalid_size(key.algorithm(), other)),
        },
        SymmetricAlgorithm::Des3 => {
            let mut iv = [0u8; DES3_IV_LEN];
            OsRng.fill_bytes(&mut iv);
            let encryptor = Des3CbcEnc::new_from_slices(key.as_slice(), &iv)
                .map_err(|_| invalid_size(key.algorithm(), key.len()))?;
            let ciphertext = encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
            Ok([iv.as_slice(), ciphertext.as_slice()].concat())
        }
    }
}

/// Decrypt data produced by [`encrypt`]
///
/// Any authentication, padding or framing failure is reported as
/// [`KraError::UnwrapError`].
pub fn decrypt(key: &SessionKey, data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    match key.algorithm() {
        SymmetricAlgorithm::Aes => match key.len() {
            16 => gcm_open::<Aes128Gcm>(key.as_slice(), data),
            24 => gcm_open::<Aes192Gcm>(key.as_slice(), data),
            32 => gcm_open::<Aes256Gcm>(key.as_slice(), data),
            other => Err(invalid_size(key.algorithm(), other)),
        },
        SymmetricAlgorithm::Des3 => {
            if data.len() < DES3_IV_LEN {
                return Err(KraError::UnwrapError);
            }
            let (iv, ciphertext) = data.split_at(DES3_IV_LEN);
            let decryptor = Des3CbcDec::new_from_slices(key.as_slice(), iv)
                .map_err(|_| invalid_size(key.algorithm(), key.len()))?;
            decryptor
                .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
                .map(Zeroizing::new)
                .map_err(|_| KraError::UnwrapError)
        }
    }
}

/// Derive an AES-256 key from a passphrase with PBKDF2-HMAC-SHA256
pub fn derive_passphrase_key(passphrase: &[u8], salt: &[u8], iterations: u32) -> Result<SessionKey> {
    if iterations == 0 {
        return Err(KraError::InvalidConfig(
            "passphrase KDF iterations must be positive".to_string(),
        ));
    }
    let mut derived = Zeroizing::new([0u8; 32]);
    pbkdf2::pbkdf2::<Hmac<Sha256>>(passphrase, salt, iterations, &mut derived[..])
        .map_err(|e| KraError::WrapError(format!("PBKDF2 failed: {}", e)))?;
    SessionKey::new(SymmetricAlgorithm::Aes, &derived[..])
}

/// Generate a random salt for [`derive_passphrase_key`]
pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; PASSPHRASE_SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

fn gcm_seal<C: Aead + KeyInit>(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = C::new_from_slice(key)
        .map_err(|_| invalid_size(SymmetricAlgorithm::Aes, key.len()))?;

    let mut nonce = [0u8; GCM_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(aes_gcm::aead::Nonce::<C>::from_slice(&nonce), plaintext)
        .map_err(|e| KraError::WrapError(format!("AES-GCM encryption failed: {}", e)))?;

    Ok([nonce.as_slice(), ciphertext.as_slice()].concat())
}

fn gcm_open<C: Aead + KeyInit>(key: &[u8], data: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if data.len() < GCM_NONCE_LEN {
        return Err(KraError::UnwrapError);
    }
    let cipher = C::new_from_slice(key)
        .map_err(|_| invalid_size(SymmetricAlgorithm::Aes, key.len()))?;

    let (nonce, ciphertext) = data.split_at(GCM_NONCE_LEN);
    cipher
        .decrypt(aes_gcm::aead::Nonce::<C>::from_slice(nonce), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| KraError::UnwrapError)
}

fn invalid_size(algorithm: SymmetricAlgorithm, len: usize) -> KraError {
    KraError::InvalidKeySize {
        algorithm: algorithm.name().to_string(),
        bits: (len * 8) as u32,
    }
}
