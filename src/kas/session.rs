//! Client session keys for rewrap
//!
//! The KAS re-encrypts each fragment for the client's session key. With an
//! RSA session the fragment comes back RSA-OAEP (SHA-1) encrypted. With an
//! EC session the KAS answers with its own ephemeral public key; both sides
//! run ECDH, HKDF-SHA256 with the session salt, and AES-256-GCM.

use super::KasError;
use crate::crypto::kem::ec::derive_wrap_key;
use crate::crypto::kem::rsa::RsaOaepKem;
use crate::crypto::{aes_gcm_decrypt, CryptoError, EcCurve, EcPrivateKey, KeyFragment};
use rand::rngs::OsRng;
use rsa::pkcs8::{EncodePublicKey, LineEnding};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};
use std::fmt;

const RSA_SESSION_BITS: usize = 2048;

/// HKDF salt for rewrap session keys, `SHA-256("L1L")`
pub fn session_salt() -> [u8; 32] {
    Sha256::digest(b"L1L").into()
}

/// Kind of session key to generate when none is supplied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionKeyType {
    #[default]
    Rsa2048,
    Ec(EcCurve),
}

/// A client session private key
#[derive(Clone)]
pub enum SessionKey {
    Rsa(RsaPrivateKey),
    Ec(EcPrivateKey),
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKey::Rsa(_) => f.write_str("SessionKey::Rsa"),
            SessionKey::Ec(key) => write!(f, "SessionKey::Ec({})", key.curve()),
        }
    }
}

impl SessionKey {
    pub fn generate(key_type: SessionKeyType) -> Result<Self, KasError> {
        match key_type {
            SessionKeyType::Rsa2048 => RsaPrivateKey::new(&mut OsRng, RSA_SESSION_BITS)
                .map(SessionKey::Rsa)
                .map_err(|e| {
                    CryptoError::InvalidKey(format!("RSA session key generation failed: {e}"))
                        .into()
                }),
            SessionKeyType::Ec(curve) => Ok(SessionKey::Ec(EcPrivateKey::generate(curve))),
        }
    }

    pub fn key_type(&self) -> SessionKeyType {
        match self {
            SessionKey::Rsa(_) => SessionKeyType::Rsa2048,
            SessionKey::Ec(key) => SessionKeyType::Ec(key.curve()),
        }
    }

    /// SPKI PEM sent as `clientPublicKey`
    pub fn public_key_pem(&self) -> Result<String, KasError> {
        match self {
            SessionKey::Rsa(key) => key
                .to_public_key()
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| CryptoError::InvalidKey(e.to_string()).into()),
            SessionKey::Ec(key) => Ok(key.public_key_pem()?),
        }
    }

    /// Recover a fragment from a `kasWrappedKey`
    ///
    /// `session_public_key` is the KAS ephemeral key from the response; it is
    /// required for EC sessions and must be on the same curve as ours.
    pub fn unwrap_fragment(
        &self,
        wrapped: &[u8],
        session_public_key: Option<&str>,
    ) -> Result<KeyFragment, KasError> {
        let plain = match self {
            SessionKey::Rsa(key) => RsaOaepKem::with_sha1().unwrap_with_key(wrapped, key)?,
            SessionKey::Ec(key) => {
                let peer = session_public_key.filter(|k| !k.is_empty()).ok_or_else(|| {
                    KasError::InvalidResponse("EC rewrap response has no sessionPublicKey".into())
                })?;
                let curve = EcCurve::detect_from_pem(peer)?;
                if curve != key.curve() {
                    return Err(KasError::InvalidResponse(format!(
                        "session public key is {curve}, client key is {}",
                        key.curve()
                    )));
                }
                let shared = key.diffie_hellman(peer)?;
                let wrap_key = derive_wrap_key(&shared, &session_salt())?;
                aes_gcm_decrypt(wrap_key.as_ref(), wrapped)?
            }
        };
        Ok(KeyFragment::from_slice(&plain).map_err(CryptoError::from)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::aes_gcm_encrypt;
    use rsa::Oaep;
    use sha1::Sha1;

    fn kas_side_wrap(fragment: &[u8], client: &EcPrivateKey) -> (Vec<u8>, String) {
        let kas_session = EcPrivateKey::generate(client.curve());
        let shared = kas_session
            .diffie_hellman(&client.public_key_pem().unwrap())
            .unwrap();
        let key = derive_wrap_key(&shared, &session_salt()).unwrap();
        (
            aes_gcm_encrypt(key.as_ref(), fragment).unwrap(),
            kas_session.public_key_pem().unwrap(),
        )
    }

    #[test]
    fn test_session_salt_value() {
        assert_eq!(
            hex::encode(session_salt()),
            "3de3ca1e50cf62d8b6aba603a96fca6761387a7ac86c3d3afe85ae2d1812edfc"
        );
    }

    #[test]
    fn test_ec_session_unwrap_each_curve() {
        for curve in [EcCurve::P256, EcCurve::P384, EcCurve::P521] {
            let client = EcPrivateKey::generate(curve);
            let fragment = [7u8; 32];
            let (wrapped, session_pub) = kas_side_wrap(&fragment, &client);

            let session = SessionKey::Ec(client);
            assert_eq!(session.key_type(), SessionKeyType::Ec(curve));
            let recovered = session
                .unwrap_fragment(&wrapped, Some(&session_pub))
                .unwrap();
            assert_eq!(recovered.as_slice(), &fragment);
        }
    }

    #[test]
    fn test_ec_session_requires_matching_curve() {
        let client = EcPrivateKey::generate(EcCurve::P256);
        let other = EcPrivateKey::generate(EcCurve::P384);
        let (wrapped, session_pub) = kas_side_wrap(&[1u8; 32], &other);

        let session = SessionKey::Ec(client);
        assert!(matches!(
            session.unwrap_fragment(&wrapped, Some(&session_pub)),
            Err(KasError::InvalidResponse(_))
        ));
        assert!(matches!(
            session.unwrap_fragment(&wrapped, None),
            Err(KasError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_rsa_session_unwrap() {
        let key = RsaPrivateKey::new(&mut OsRng, 1024).unwrap();
        let wrapped = key
            .to_public_key()
            .encrypt(&mut OsRng, Oaep::new::<Sha1>(), &[9u8; 32])
            .unwrap();

        let session = SessionKey::Rsa(key);
        assert!(session
            .public_key_pem()
            .unwrap()
            .starts_with("-----BEGIN PUBLIC KEY-----"));
        let recovered = session.unwrap_fragment(&wrapped, None).unwrap();
        assert_eq!(recovered.as_slice(), &[9u8; 32]);
        assert_eq!(format!("{session:?}"), "SessionKey::Rsa");
    }
}
