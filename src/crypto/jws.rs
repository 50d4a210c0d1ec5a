//! Compact JWS signing and verification
//!
//! Supports HS256, RS256 and ES256/384/512 with raw `r || s` ECDSA
//! signatures. The `alg` header must match the key's algorithm on
//! verification, so a token can never downgrade itself to a weaker scheme.

use super::hmac::{constant_time_eq, hmac_sha256};
use super::CryptoError;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use p256::elliptic_curve::{
    self,
    sec1::{EncodedPoint, ToEncodedPoint},
};
use rsa::pkcs1v15;
use rsa::signature::{SignatureEncoding as _, Signer as _, Verifier as _};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde_json::{json, Map, Value};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

/// JWS algorithms accepted by this crate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JwsAlgorithm {
    HS256,
    RS256,
    ES256,
    ES384,
    ES512,
}

impl JwsAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            JwsAlgorithm::HS256 => "HS256",
            JwsAlgorithm::RS256 => "RS256",
            JwsAlgorithm::ES256 => "ES256",
            JwsAlgorithm::ES384 => "ES384",
            JwsAlgorithm::ES512 => "ES512",
        }
    }
}

impl fmt::Display for JwsAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JwsAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HS256" => Ok(JwsAlgorithm::HS256),
            "RS256" => Ok(JwsAlgorithm::RS256),
            "ES256" => Ok(JwsAlgorithm::ES256),
            "ES384" => Ok(JwsAlgorithm::ES384),
            "ES512" => Ok(JwsAlgorithm::ES512),
            other => Err(CryptoError::UnsupportedAlg(other.to_string())),
        }
    }
}

/// Raw key material backing a [`JwsKey`]
#[derive(Clone)]
pub enum KeyMaterial {
    Hmac(Zeroizing<Vec<u8>>),
    RsaPrivate(RsaPrivateKey),
    RsaPublic(RsaPublicKey),
    P256Private(p256::SecretKey),
    P256Public(p256::PublicKey),
    P384Private(p384::SecretKey),
    P384Public(p384::PublicKey),
    P521Private(p521::SecretKey),
    P521Public(p521::PublicKey),
}

/// A signing or verification key bound to an algorithm name
///
/// The algorithm is kept as the caller supplied it; unsupported names such
/// as `none` are rejected when the key is used, not when it is built.
#[derive(Clone)]
pub struct JwsKey {
    alg: String,
    material: KeyMaterial,
}

impl fmt::Debug for JwsKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwsKey")
            .field("alg", &self.alg)
            .finish_non_exhaustive()
    }
}

impl JwsKey {
    pub fn new(alg: impl Into<String>, material: KeyMaterial) -> Self {
        JwsKey {
            alg: alg.into(),
            material,
        }
    }

    pub fn hs256(secret: &[u8]) -> Self {
        Self::new("HS256", KeyMaterial::Hmac(Zeroizing::new(secret.to_vec())))
    }

    pub fn rs256_private(key: RsaPrivateKey) -> Self {
        Self::new("RS256", KeyMaterial::RsaPrivate(key))
    }

    pub fn rs256_public(key: RsaPublicKey) -> Self {
        Self::new("RS256", KeyMaterial::RsaPublic(key))
    }

    pub fn es256_private(key: p256::SecretKey) -> Self {
        Self::new("ES256", KeyMaterial::P256Private(key))
    }

    pub fn es256_public(key: p256::PublicKey) -> Self {
        Self::new("ES256", KeyMaterial::P256Public(key))
    }

    pub fn es384_private(key: p384::SecretKey) -> Self {
        Self::new("ES384", KeyMaterial::P384Private(key))
    }

    pub fn es512_private(key: p521::SecretKey) -> Self {
        Self::new("ES512", KeyMaterial::P521Private(key))
    }

    /// Generate a fresh ES256 key, as used for DPoP proofs
    pub fn generate_es256() -> Self {
        Self::es256_private(p256::SecretKey::random(&mut rand::rngs::OsRng))
    }

    /// Load a key from PEM (PKCS#8, SEC1, PKCS#1 or SPKI) for the named algorithm
    pub fn from_pem(alg: &str, pem: &str) -> Result<Self, CryptoError> {
        use p256::pkcs8::{DecodePrivateKey, DecodePublicKey};
        use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
        use rsa::pkcs8::{DecodePrivateKey as _, DecodePublicKey as _};

        let parsed: JwsAlgorithm = alg.parse()?;
        let bad = |what: &str| CryptoError::InvalidKey(format!("{what} PEM for {alg}"));
        let material = match parsed {
            JwsAlgorithm::HS256 => {
                return Err(CryptoError::InvalidKey(
                    "HS256 keys are raw secrets, not PEM".to_string(),
                ))
            }
            JwsAlgorithm::RS256 => {
                if let Ok(key) = RsaPrivateKey::from_pkcs8_pem(pem) {
                    KeyMaterial::RsaPrivate(key)
                } else if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(pem) {
                    KeyMaterial::RsaPrivate(key)
                } else if let Ok(key) = RsaPublicKey::from_public_key_pem(pem) {
                    KeyMaterial::RsaPublic(key)
                } else {
                    KeyMaterial::RsaPublic(
                        RsaPublicKey::from_pkcs1_pem(pem).map_err(|_| bad("RSA"))?,
                    )
                }
            }
            JwsAlgorithm::ES256 => {
                if let Ok(key) = p256::SecretKey::from_pkcs8_pem(pem) {
                    KeyMaterial::P256Private(key)
                } else if let Ok(key) = p256::SecretKey::from_sec1_pem(pem) {
                    KeyMaterial::P256Private(key)
                } else {
                    KeyMaterial::P256Public(
                        p256::PublicKey::from_public_key_pem(pem).map_err(|_| bad("P-256"))?,
                    )
                }
            }
            JwsAlgorithm::ES384 => {
                if let Ok(key) = p384::SecretKey::from_pkcs8_pem(pem) {
                    KeyMaterial::P384Private(key)
                } else if let Ok(key) = p384::SecretKey::from_sec1_pem(pem) {
                    KeyMaterial::P384Private(key)
                } else {
                    KeyMaterial::P384Public(
                        p384::PublicKey::from_public_key_pem(pem).map_err(|_| bad("P-384"))?,
                    )
                }
            }
            JwsAlgorithm::ES512 => {
                if let Ok(key) = p521::SecretKey::from_pkcs8_pem(pem) {
                    KeyMaterial::P521Private(key)
                } else if let Ok(key) = p521::SecretKey::from_sec1_pem(pem) {
                    KeyMaterial::P521Private(key)
                } else {
                    KeyMaterial::P521Public(
                        p521::PublicKey::from_public_key_pem(pem).map_err(|_| bad("P-521"))?,
                    )
                }
            }
        };
        Ok(Self::new(alg, material))
    }

    pub fn alg(&self) -> &str {
        &self.alg
    }

    pub fn material(&self) -> &KeyMaterial {
        &self.material
    }

    fn algorithm(&self) -> Result<JwsAlgorithm, CryptoError> {
        let alg: JwsAlgorithm = self.alg.parse()?;
        let compatible = matches!(
            (alg, &self.material),
            (JwsAlgorithm::HS256, KeyMaterial::Hmac(_))
                | (
                    JwsAlgorithm::RS256,
                    KeyMaterial::RsaPrivate(_) | KeyMaterial::RsaPublic(_)
                )
                | (
                    JwsAlgorithm::ES256,
                    KeyMaterial::P256Private(_) | KeyMaterial::P256Public(_)
                )
                | (
                    JwsAlgorithm::ES384,
                    KeyMaterial::P384Private(_) | KeyMaterial::P384Public(_)
                )
                | (
                    JwsAlgorithm::ES512,
                    KeyMaterial::P521Private(_) | KeyMaterial::P521Public(_)
                )
        );
        if !compatible {
            return Err(CryptoError::InvalidKey(format!(
                "key material does not match algorithm {alg}"
            )));
        }
        Ok(alg)
    }

    /// Sign `claims` into a compact JWS with a `{alg, typ: "JWT"}` header
    pub fn sign(&self, claims: &Value) -> Result<String, CryptoError> {
        self.sign_with_headers(&Map::new(), claims)
    }

    /// Sign with additional protected header members
    pub fn sign_with_headers(
        &self,
        extra_headers: &Map<String, Value>,
        claims: &Value,
    ) -> Result<String, CryptoError> {
        let alg = self.algorithm()?;

        let mut header = Map::new();
        header.insert("alg".to_string(), json!(alg.as_str()));
        header.insert("typ".to_string(), json!("JWT"));
        for (k, v) in extra_headers {
            header.insert(k.clone(), v.clone());
        }

        let header_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?);
        let claims_b64 = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let signing_input = format!("{header_b64}.{claims_b64}");

        let signature = self.raw_sign(signing_input.as_bytes())?;
        Ok(format!(
            "{signing_input}.{}",
            URL_SAFE_NO_PAD.encode(signature)
        ))
    }

    fn raw_sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let not_private = || CryptoError::InvalidKey("a private key is required to sign".into());
        match &self.material {
            KeyMaterial::Hmac(secret) => hmac_sha256(secret, message),
            KeyMaterial::RsaPrivate(key) => {
                let signer = pkcs1v15::SigningKey::<Sha256>::new(key.clone());
                Ok(signer.sign(message).to_vec())
            }
            KeyMaterial::P256Private(key) => {
                let signer = p256::ecdsa::SigningKey::from(key);
                let sig: p256::ecdsa::Signature = signer.sign(message);
                Ok(sig.to_bytes().to_vec())
            }
            KeyMaterial::P384Private(key) => {
                let signer = p384::ecdsa::SigningKey::from(key);
                let sig: p384::ecdsa::Signature = signer.sign(message);
                Ok(sig.to_bytes().to_vec())
            }
            KeyMaterial::P521Private(key) => {
                let signer = p521::ecdsa::SigningKey::from_bytes(&key.to_bytes())
                    .map_err(|_| CryptoError::InvalidKey("P-521 scalar".into()))?;
                let sig: p521::ecdsa::Signature = signer.sign(message);
                Ok(sig.to_bytes().to_vec())
            }
            KeyMaterial::RsaPublic(_)
            | KeyMaterial::P256Public(_)
            | KeyMaterial::P384Public(_)
            | KeyMaterial::P521Public(_) => Err(not_private()),
        }
    }

    fn raw_verify(&self, message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let ok = match &self.material {
            KeyMaterial::Hmac(secret) => {
                constant_time_eq(&hmac_sha256(secret, message)?, signature)
            }
            KeyMaterial::RsaPrivate(key) => rsa_verify(&key.to_public_key(), message, signature),
            KeyMaterial::RsaPublic(key) => rsa_verify(key, message, signature),
            KeyMaterial::P256Private(key) => p256_verify(&key.public_key(), message, signature),
            KeyMaterial::P256Public(key) => p256_verify(key, message, signature),
            KeyMaterial::P384Private(key) => p384_verify(&key.public_key(), message, signature),
            KeyMaterial::P384Public(key) => p384_verify(key, message, signature),
            KeyMaterial::P521Private(key) => p521_verify(&key.public_key(), message, signature),
            KeyMaterial::P521Public(key) => p521_verify(key, message, signature),
        };
        if ok {
            Ok(())
        } else {
            Err(CryptoError::SignatureInvalid)
        }
    }

    /// Verify a compact JWS and return its claims
    pub fn verify(&self, token: &str) -> Result<Value, CryptoError> {
        let expected = self.algorithm()?;

        let mut parts = token.split('.');
        let (Some(header_b64), Some(claims_b64), Some(sig_b64), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CryptoError::MalformedJws(
                "expected three dot-separated parts".into(),
            ));
        };

        let header: Value = serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header_b64)?)?;
        let header_alg = header
            .get("alg")
            .and_then(Value::as_str)
            .ok_or_else(|| CryptoError::MalformedJws("missing alg header".into()))?;
        let header_alg: JwsAlgorithm = header_alg.parse()?;
        if header_alg != expected {
            return Err(CryptoError::MalformedJws(format!(
                "header alg {header_alg} does not match key alg {expected}"
            )));
        }

        let signature = URL_SAFE_NO_PAD.decode(sig_b64)?;
        let signing_input = &token[..header_b64.len() + 1 + claims_b64.len()];
        self.raw_verify(signing_input.as_bytes(), &signature)?;

        Ok(serde_json::from_slice(&URL_SAFE_NO_PAD.decode(claims_b64)?)?)
    }

    /// Public half of the key as a JWK, for DPoP `jwk` headers
    pub fn public_jwk(&self) -> Result<Value, CryptoError> {
        match &self.material {
            KeyMaterial::Hmac(_) => Err(CryptoError::InvalidKey(
                "symmetric keys have no public JWK".into(),
            )),
            KeyMaterial::RsaPrivate(key) => Ok(rsa_jwk(&key.to_public_key())),
            KeyMaterial::RsaPublic(key) => Ok(rsa_jwk(key)),
            KeyMaterial::P256Private(key) => ec_jwk::<p256::NistP256>("P-256", key.public_key().to_encoded_point(false)),
            KeyMaterial::P256Public(key) => ec_jwk::<p256::NistP256>("P-256", key.to_encoded_point(false)),
            KeyMaterial::P384Private(key) => ec_jwk::<p384::NistP384>("P-384", key.public_key().to_encoded_point(false)),
            KeyMaterial::P384Public(key) => ec_jwk::<p384::NistP384>("P-384", key.to_encoded_point(false)),
            KeyMaterial::P521Private(key) => ec_jwk::<p521::NistP521>("P-521", key.public_key().to_encoded_point(false)),
            KeyMaterial::P521Public(key) => ec_jwk::<p521::NistP521>("P-521", key.to_encoded_point(false)),
        }
    }
}

fn ec_jwk<C>(crv: &str, point: EncodedPoint<C>) -> Result<Value, CryptoError>
where
    C: elliptic_curve::Curve,
    elliptic_curve::FieldBytesSize<C>: elliptic_curve::sec1::ModulusSize,
{
    match (point.x(), point.y()) {
        (Some(x), Some(y)) => Ok(json!({
            "kty": "EC",
            "crv": crv,
            "x": URL_SAFE_NO_PAD.encode(x),
            "y": URL_SAFE_NO_PAD.encode(y),
        })),
        _ => Err(CryptoError::InvalidKey("EC point at infinity".into())),
    }
}

/// Decode the protected header of a compact JWS without verifying it
pub fn peek_header(token: &str) -> Result<Value, CryptoError> {
    let header_b64 = token
        .split('.')
        .next()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| CryptoError::MalformedJws("empty token".into()))?;
    Ok(serde_json::from_slice(&URL_SAFE_NO_PAD.decode(header_b64)?)?)
}

fn rsa_jwk(key: &RsaPublicKey) -> Value {
    json!({
        "kty": "RSA",
        "n": URL_SAFE_NO_PAD.encode(key.n().to_bytes_be()),
        "e": URL_SAFE_NO_PAD.encode(key.e().to_bytes_be()),
    })
}

fn rsa_verify(key: &RsaPublicKey, message: &[u8], signature: &[u8]) -> bool {
    let verifier = pkcs1v15::VerifyingKey::<Sha256>::new(key.clone());
    match pkcs1v15::Signature::try_from(signature) {
        Ok(sig) => verifier.verify(message, &sig).is_ok(),
        Err(_) => false,
    }
}

fn p256_verify(key: &p256::PublicKey, message: &[u8], signature: &[u8]) -> bool {
    let verifier = p256::ecdsa::VerifyingKey::from(key);
    match p256::ecdsa::Signature::from_slice(signature) {
        Ok(sig) => verifier.verify(message, &sig).is_ok(),
        Err(_) => false,
    }
}

fn p384_verify(key: &p384::PublicKey, message: &[u8], signature: &[u8]) -> bool {
    let verifier = p384::ecdsa::VerifyingKey::from(key);
    match p384::ecdsa::Signature::from_slice(signature) {
        Ok(sig) => verifier.verify(message, &sig).is_ok(),
        Err(_) => false,
    }
}

fn p521_verify(key: &p521::PublicKey, message: &[u8], signature: &[u8]) -> bool {
    let point = key.to_encoded_point(false);
    let Ok(verifier) = p521::ecdsa::VerifyingKey::from_sec1_bytes(point.as_bytes()) else {
        return false;
    };
    match p521::ecdsa::Signature::from_slice(signature) {
        Ok(sig) => verifier.verify(message, &sig).is_ok(),
        Err(_) => false,
    }
}
