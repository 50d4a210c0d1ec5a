//! Cryptographic primitives used by the TDF container engine
//!
//! Everything in here is stateless: AES-256-GCM, HMAC-SHA256 based
//! integrity, RSA-OAEP and ECDH-HKDF key wrapping, compact JWS and JCS.
//! Key material is carried in zeroizing newtypes from [`types`].

pub mod aead;
pub mod hmac;
pub mod jcs;
pub mod jws;
pub mod kem;
pub mod types;

use thiserror::Error;

pub use aead::{aes_gcm_decrypt, aes_gcm_encrypt, GCM_IV_SIZE, GCM_OVERHEAD, GCM_TAG_SIZE};
pub use hmac::{hmac_sha256, IntegrityAlgorithm};
pub use jws::{JwsAlgorithm, JwsKey, KeyMaterial};
pub use kem::ec::{EcCurve, EcPrivateKey};
pub use kem::rsa::OaepHash;
pub use kem::KemError;
pub use types::{Dek, KeyError, KeyFragment};

/// Errors raised by the primitives in this module
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("AES-GCM authentication failed")]
    Auth,

    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),

    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),

    #[error("malformed JWS: {0}")]
    MalformedJws(String),

    #[error("JWS signature verification failed")]
    SignatureInvalid,

    #[error("JSON value cannot be canonicalized: {0}")]
    Canonicalization(String),

    #[error("key derivation failed")]
    KeyDerivation,

    #[error(transparent)]
    Kem(#[from] KemError),

    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
