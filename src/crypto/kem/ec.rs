//! ECDH + HKDF-SHA256 + AES-256-GCM key wrapping
//!
//! The wrapping side generates an ephemeral key on the recipient's curve,
//! derives a 32-byte key with `HKDF-SHA256(salt, ECDH(eph, recipient))` and
//! seals the fragment with AES-GCM. The ephemeral public key travels with
//! the wrapped bytes as PEM.

use super::{KemError, KeyEncapsulation};
use crate::crypto::aead::{aes_gcm_decrypt, aes_gcm_encrypt};
use hkdf::Hkdf;
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroizing;

/// Salt for HKDF when wrapping split fragments for a KAS
pub fn tdf_salt() -> [u8; 32] {
    Sha256::digest(b"TDF").into()
}

/// Derive a 32-byte AES key from an ECDH shared secret
pub fn derive_wrap_key(shared_secret: &[u8], salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, KemError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), shared_secret);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(&[], okm.as_mut())
        .map_err(|_| KemError::KeyDerivationFailed)?;
    Ok(okm)
}

/// Supported NIST curves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EcCurve {
    P256,
    P384,
    P521,
}

impl EcCurve {
    /// KAS key algorithm name, e.g. `ec:secp256r1`
    pub fn kas_algorithm(&self) -> &'static str {
        match self {
            EcCurve::P256 => "ec:secp256r1",
            EcCurve::P384 => "ec:secp384r1",
            EcCurve::P521 => "ec:secp521r1",
        }
    }

    pub fn from_kas_algorithm(alg: &str) -> Option<Self> {
        match alg {
            "ec:secp256r1" => Some(EcCurve::P256),
            "ec:secp384r1" => Some(EcCurve::P384),
            "ec:secp521r1" => Some(EcCurve::P521),
            _ => None,
        }
    }

    /// Identify the curve of an SPKI public key PEM
    pub fn detect_from_pem(pem: &str) -> Result<Self, KemError> {
        if p256::PublicKey::from_public_key_pem(pem).is_ok() {
            Ok(EcCurve::P256)
        } else if p384::PublicKey::from_public_key_pem(pem).is_ok() {
            Ok(EcCurve::P384)
        } else if p521::PublicKey::from_public_key_pem(pem).is_ok() {
            Ok(EcCurve::P521)
        } else {
            Err(KemError::InvalidPublicKey)
        }
    }
}

impl fmt::Display for EcCurve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EcCurve::P256 => "P-256",
            EcCurve::P384 => "P-384",
            EcCurve::P521 => "P-521",
        })
    }
}

/// An EC private key on one of the supported curves
#[derive(Clone)]
pub enum EcPrivateKey {
    P256(p256::SecretKey),
    P384(p384::SecretKey),
    P521(p521::SecretKey),
}

impl fmt::Debug for EcPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EcPrivateKey({})", self.curve())
    }
}

impl EcPrivateKey {
    pub fn generate(curve: EcCurve) -> Self {
        match curve {
            EcCurve::P256 => EcPrivateKey::P256(p256::SecretKey::random(&mut OsRng)),
            EcCurve::P384 => EcPrivateKey::P384(p384::SecretKey::random(&mut OsRng)),
            EcCurve::P521 => EcPrivateKey::P521(p521::SecretKey::random(&mut OsRng)),
        }
    }

    pub fn curve(&self) -> EcCurve {
        match self {
            EcPrivateKey::P256(_) => EcCurve::P256,
            EcPrivateKey::P384(_) => EcCurve::P384,
            EcPrivateKey::P521(_) => EcCurve::P521,
        }
    }

    /// Load a PKCS#8 or SEC1 private key PEM on any supported curve
    pub fn from_pem(pem: &str) -> Result<Self, KemError> {
        if let Ok(k) = p256::SecretKey::from_pkcs8_pem(pem).or_else(|_| p256::SecretKey::from_sec1_pem(pem)) {
            return Ok(EcPrivateKey::P256(k));
        }
        if let Ok(k) = p384::SecretKey::from_pkcs8_pem(pem).or_else(|_| p384::SecretKey::from_sec1_pem(pem)) {
            return Ok(EcPrivateKey::P384(k));
        }
        p521::SecretKey::from_pkcs8_pem(pem)
            .or_else(|_| p521::SecretKey::from_sec1_pem(pem))
            .map(EcPrivateKey::P521)
            .map_err(|_| KemError::InvalidKey("unrecognized EC private key PEM".into()))
    }

    /// PKCS#8 PEM of the private key
    pub fn to_pem(&self) -> Result<Zeroizing<String>, KemError> {
        let pem = match self {
            EcPrivateKey::P256(k) => k.to_pkcs8_pem(LineEnding::LF),
            EcPrivateKey::P384(k) => k.to_pkcs8_pem(LineEnding::LF),
            EcPrivateKey::P521(k) => k.to_pkcs8_pem(LineEnding::LF),
        };
        pem.map_err(|e| KemError::InvalidKey(e.to_string()))
    }

    /// SPKI PEM of the public key
    pub fn public_key_pem(&self) -> Result<String, KemError> {
        let pem = match self {
            EcPrivateKey::P256(k) => k.public_key().to_public_key_pem(LineEnding::LF),
            EcPrivateKey::P384(k) => k.public_key().to_public_key_pem(LineEnding::LF),
            EcPrivateKey::P521(k) => k.public_key().to_public_key_pem(LineEnding::LF),
        };
        pem.map_err(|e| KemError::InvalidKey(e.to_string()))
    }

    /// Raw ECDH shared secret with a peer public key given as SPKI PEM
    pub fn diffie_hellman(&self, peer_pem: &str) -> Result<Zeroizing<Vec<u8>>, KemError> {
        let secret = match self {
            EcPrivateKey::P256(k) => {
                let peer = p256::PublicKey::from_public_key_pem(peer_pem)
                    .map_err(|_| KemError::InvalidPublicKey)?;
                let shared = p256::ecdh::diffie_hellman(k.to_nonzero_scalar(), peer.as_affine());
                shared.raw_secret_bytes().to_vec()
            }
            EcPrivateKey::P384(k) => {
                let peer = p384::PublicKey::from_public_key_pem(peer_pem)
                    .map_err(|_| KemError::InvalidPublicKey)?;
                let shared = p384::ecdh::diffie_hellman(k.to_nonzero_scalar(), peer.as_affine());
                shared.raw_secret_bytes().to_vec()
            }
            EcPrivateKey::P521(k) => {
                let peer = p521::PublicKey::from_public_key_pem(peer_pem)
                    .map_err(|_| KemError::InvalidPublicKey)?;
                let shared = p521::ecdh::diffie_hellman(k.to_nonzero_scalar(), peer.as_affine());
                shared.raw_secret_bytes().to_vec()
            }
        };
        Ok(Zeroizing::new(secret))
    }
}

/// Output of an ECDH wrap: sealed key plus the ephemeral public key
#[derive(Debug, Clone)]
pub struct EcWrappedKey {
    pub ephemeral_public_key: String,
    pub wrapped: Vec<u8>,
}

/// ECDH-HKDF key encapsulation
#[derive(Debug, Clone)]
pub struct EcdhKem {
    salt: [u8; 32],
}

impl Default for EcdhKem {
    fn default() -> Self {
        EcdhKem { salt: tdf_salt() }
    }
}

impl EcdhKem {
    /// Use a custom HKDF salt
    pub fn with_salt(salt: [u8; 32]) -> Self {
        EcdhKem { salt }
    }
}

impl KeyEncapsulation for EcdhKem {
    type PublicKey = str; // SPKI PEM of the recipient
    type PrivateKey = EcPrivateKey;
    type WrappedKey = EcWrappedKey;

    fn wrap(&self, key: &[u8], recipient_pem: &str) -> Result<EcWrappedKey, KemError> {
        let curve = EcCurve::detect_from_pem(recipient_pem)?;
        let ephemeral = EcPrivateKey::generate(curve);
        let shared = ephemeral.diffie_hellman(recipient_pem)?;
        let wrap_key = derive_wrap_key(&shared, &self.salt)?;

        let wrapped = aes_gcm_encrypt(wrap_key.as_ref(), key)
            .map_err(|e| KemError::WrapError(e.to_string()))?;
        Ok(EcWrappedKey {
            ephemeral_public_key: ephemeral.public_key_pem()?,
            wrapped,
        })
    }

    fn unwrap(&self, wrapped: &EcWrappedKey, private_key: &EcPrivateKey) -> Result<Vec<u8>, KemError> {
        let shared = private_key.diffie_hellman(&wrapped.ephemeral_public_key)?;
        let wrap_key = derive_wrap_key(&shared, &self.salt)?;
        aes_gcm_decrypt(wrap_key.as_ref(), &wrapped.wrapped)
            .map_err(|e| KemError::UnwrapError(e.to_string()))
    }
}
