//! Zeroizing key types
//!
//! The payload key (DEK) and the split fragments it is built from never
//! leave these wrappers in cleartext form; both clear their memory on drop.

use rand::{rngs::OsRng, RngCore};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const KEY_SIZE: usize = 32;

/// 32-byte data encryption key, reconstructed as the XOR of all split fragments
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Dek(pub(crate) [u8; KEY_SIZE]);

impl Dek {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Dek(key)
    }

    /// An all-zero key, used as the identity when XOR-ing fragments together
    pub(crate) fn zero() -> Self {
        Dek([0u8; KEY_SIZE])
    }

    /// Create a key from a 32-byte slice
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != KEY_SIZE {
            return Err(KeyError::InvalidLength {
                expected: KEY_SIZE,
                got: bytes.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(Dek(key))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Fold a split fragment into this key
    pub fn xor_in(&mut self, fragment: &KeyFragment) {
        for (k, f) in self.0.iter_mut().zip(fragment.0.iter()) {
            *k ^= f;
        }
    }
}

impl fmt::Debug for Dek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Dek(..)")
    }
}

/// One split of the DEK, wrapped for one or more KAS replicas
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyFragment(pub(crate) [u8; KEY_SIZE]);

impl KeyFragment {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        KeyFragment(key)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != KEY_SIZE {
            return Err(KeyError::InvalidLength {
                expected: KEY_SIZE,
                got: bytes.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(bytes);
        Ok(KeyFragment(key))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for KeyFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeyFragment(..)")
    }
}

/// Key-related errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },
}
