//! Key Encapsulation Mechanisms (KEM)
//!
//! Split fragments are wrapped for a KAS either with RSA-OAEP or with an
//! ephemeral ECDH exchange feeding HKDF-SHA256 and AES-256-GCM.

use thiserror::Error;

pub mod ec;
pub mod rsa;

/// KEM-related errors
#[derive(Debug, Error)]
pub enum KemError {
    #[error("Key wrapping failed: {0}")]
    WrapError(String),

    #[error("Key unwrapping failed: {0}")]
    UnwrapError(String),

    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Key derivation failed")]
    KeyDerivationFailed,

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),
}

/// Trait for key encapsulation mechanisms
pub trait KeyEncapsulation {
    /// Public key type
    type PublicKey: ?Sized;

    /// Private key type
    type PrivateKey: ?Sized;

    /// Wrapped key type (ciphertext)
    type WrappedKey;

    /// Wrap a symmetric key with a public key
    fn wrap(&self, key: &[u8], public_key: &Self::PublicKey) -> Result<Self::WrappedKey, KemError>;

    /// Unwrap a symmetric key with a private key
    fn unwrap(
        &self,
        wrapped: &Self::WrappedKey,
        private_key: &Self::PrivateKey,
    ) -> Result<Vec<u8>, KemError>;
}
