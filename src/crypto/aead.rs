//! AES-256-GCM with a random 96-bit IV per call
//!
//! Output layout is `iv (12) || ciphertext || tag (16)`, the same layout used
//! for payload segments, wrapped keys and encrypted metadata.

// Nonce::from_slice is the supported constructor in aes-gcm 0.10
#![allow(deprecated)]

use super::CryptoError;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::{rngs::OsRng, RngCore};

pub const GCM_IV_SIZE: usize = 12;
pub const GCM_TAG_SIZE: usize = 16;
/// Bytes added to every plaintext by [`aes_gcm_encrypt`]
pub const GCM_OVERHEAD: usize = GCM_IV_SIZE + GCM_TAG_SIZE;

fn cipher(key: &[u8]) -> Result<Aes256Gcm, CryptoError> {
    Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength {
        expected: 32,
        got: key.len(),
    })
}

/// Generate a random 96-bit nonce
pub fn generate_nonce() -> [u8; GCM_IV_SIZE] {
    let mut nonce = [0u8; GCM_IV_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `plaintext` under a 32-byte key, returning `iv || ct || tag`
pub fn aes_gcm_encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher(key)?;
    let iv = generate_nonce();
    let sealed = cipher
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| CryptoError::Auth)?;

    let mut out = Vec::with_capacity(GCM_IV_SIZE + sealed.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Inverse of [`aes_gcm_encrypt`]
pub fn aes_gcm_decrypt(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if data.len() < GCM_OVERHEAD {
        return Err(CryptoError::CiphertextTooShort(data.len()));
    }
    let cipher = cipher(key)?;
    let (iv, sealed) = data.split_at(GCM_IV_SIZE);
    cipher
        .decrypt(Nonce::from_slice(iv), sealed)
        .map_err(|_| CryptoError::Auth)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_layout_and_roundtrip() {
        let key = [7u8; 32];
        let sealed = aes_gcm_encrypt(&key, b"Virtru").unwrap();
        assert_eq!(sealed.len(), 6 + GCM_OVERHEAD);
        assert_eq!(aes_gcm_decrypt(&key, &sealed).unwrap(), b"Virtru");
    }

    #[test]
    fn test_empty_plaintext_is_iv_and_tag() {
        let key = [1u8; 32];
        let sealed = aes_gcm_encrypt(&key, b"").unwrap();
        assert_eq!(sealed.len(), 28);
        assert!(aes_gcm_decrypt(&key, &sealed).unwrap().is_empty());
    }

    #[test]
    fn test_fresh_iv_per_call() {
        let key = [3u8; 32];
        let a = aes_gcm_encrypt(&key, b"same").unwrap();
        let b = aes_gcm_encrypt(&key, b"same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_tag_mismatch_is_auth_error() {
        let key = [9u8; 32];
        let mut sealed = aes_gcm_encrypt(&key, b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            aes_gcm_decrypt(&key, &sealed),
            Err(CryptoError::Auth)
        ));
    }

    #[test]
    fn test_short_input_rejected() {
        assert!(matches!(
            aes_gcm_decrypt(&[0u8; 32], &[0u8; 10]),
            Err(CryptoError::CiphertextTooShort(10))
        ));
    }

    #[test]
    fn test_bad_key_length() {
        assert!(matches!(
            aes_gcm_encrypt(&[0u8; 16], b"x"),
            Err(CryptoError::InvalidKeyLength { got: 16, .. })
        ));
    }
}
