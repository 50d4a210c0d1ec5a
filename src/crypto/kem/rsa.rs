//! RSA-OAEP Key Encapsulation Mechanism
//!
//! SHA-1 is the default OAEP hash (manifest alg `RSA-OAEP`); SHA-256 is
//! selected by `RSA-OAEP-256`.

use super::{KemError, KeyEncapsulation};
use rand::rngs::OsRng;
use rsa::{
    pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    Oaep, RsaPrivateKey, RsaPublicKey,
};
use sha1::Sha1;
use sha2::Sha256;

/// OAEP hash algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OaepHash {
    #[default]
    Sha1,
    Sha256,
}

impl OaepHash {
    /// Map a key access object `alg` value to its OAEP hash
    pub fn from_manifest_alg(alg: &str) -> Result<Self, KemError> {
        match alg {
            "" | "RSA-OAEP" => Ok(OaepHash::Sha1),
            "RSA-OAEP-256" => Ok(OaepHash::Sha256),
            other => Err(KemError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    pub fn manifest_alg(&self) -> &'static str {
        match self {
            OaepHash::Sha1 => "RSA-OAEP",
            OaepHash::Sha256 => "RSA-OAEP-256",
        }
    }
}

/// RSA-OAEP key encapsulation mechanism
#[derive(Debug, Clone, Copy, Default)]
pub struct RsaOaepKem {
    pub hash: OaepHash,
}

impl RsaOaepKem {
    pub fn new(hash: OaepHash) -> Self {
        RsaOaepKem { hash }
    }

    pub fn with_sha1() -> Self {
        Self::new(OaepHash::Sha1)
    }

    pub fn with_sha256() -> Self {
        Self::new(OaepHash::Sha256)
    }
}

/// Parse an RSA public key from SPKI or PKCS#1 PEM
pub fn parse_public_key_pem(pem: &str) -> Result<RsaPublicKey, KemError> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| KemError::InvalidKey(format!("Failed to parse RSA public key: {}", e)))
}

/// Parse an RSA private key from PKCS#8 or PKCS#1 PEM
pub fn parse_private_key_pem(pem: &str) -> Result<RsaPrivateKey, KemError> {
    RsaPrivateKey::from_pkcs8_pem(pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
        .map_err(|e| KemError::InvalidKey(format!("Failed to parse RSA private key: {}", e)))
}

impl RsaOaepKem {
    pub fn wrap_with_key(&self, key: &[u8], public_key: &RsaPublicKey) -> Result<Vec<u8>, KemError> {
        let result = match self.hash {
            OaepHash::Sha1 => public_key.encrypt(&mut OsRng, Oaep::new::<Sha1>(), key),
            OaepHash::Sha256 => public_key.encrypt(&mut OsRng, Oaep::new::<Sha256>(), key),
        };
        result.map_err(|e| KemError::WrapError(format!("RSA-OAEP encryption failed: {}", e)))
    }

    pub fn unwrap_with_key(
        &self,
        wrapped: &[u8],
        private_key: &RsaPrivateKey,
    ) -> Result<Vec<u8>, KemError> {
        let result = match self.hash {
            OaepHash::Sha1 => private_key.decrypt(Oaep::new::<Sha1>(), wrapped),
            OaepHash::Sha256 => private_key.decrypt(Oaep::new::<Sha256>(), wrapped),
        };
        result.map_err(|e| KemError::UnwrapError(format!("RSA-OAEP decryption failed: {}", e)))
    }
}

impl KeyEncapsulation for RsaOaepKem {
    type PublicKey = str; // PEM
    type PrivateKey = str; // PEM
    type WrappedKey = Vec<u8>;

    fn wrap(&self, key: &[u8], public_key_pem: &str) -> Result<Vec<u8>, KemError> {
        let public_key = parse_public_key_pem(public_key_pem)?;
        self.wrap_with_key(key, &public_key)
    }

    fn unwrap(&self, wrapped: &Vec<u8>, private_key_pem: &str) -> Result<Vec<u8>, KemError> {
        let private_key = parse_private_key_pem(private_key_pem)?;
        self.unwrap_with_key(wrapped, &private_key)
    }
}
