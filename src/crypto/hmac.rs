//! HMAC-SHA256 and the two integrity algorithms used by TDF signatures

use super::CryptoError;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Compute HMAC-SHA256 over `data`
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| {
        CryptoError::InvalidKey("HMAC key rejected".to_string())
    })?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Compare two byte strings without leaking the position of the first difference
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

/// Signature algorithm used for segment hashes and the root signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IntegrityAlgorithm {
    /// HMAC-SHA256 keyed with the DEK
    #[default]
    #[serde(rename = "HS256")]
    Hs256,
    /// The trailing 16 bytes of the input, i.e. the GCM tag of a segment
    #[serde(rename = "GMAC")]
    Gmac,
}

impl IntegrityAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrityAlgorithm::Hs256 => "HS256",
            IntegrityAlgorithm::Gmac => "GMAC",
        }
    }

    /// Produce the raw signature of `data`
    ///
    /// GMAC ignores the key: for a segment the tag already authenticates the
    /// ciphertext under the DEK.
    pub fn sign(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        match self {
            IntegrityAlgorithm::Hs256 => hmac_sha256(key, data),
            IntegrityAlgorithm::Gmac => {
                const TAG: usize = super::GCM_TAG_SIZE;
                if data.len() < TAG {
                    return Err(CryptoError::CiphertextTooShort(data.len()));
                }
                Ok(data[data.len() - TAG..].to_vec())
            }
        }
    }

    /// Recompute and compare in constant time
    pub fn verify(&self, key: &[u8], data: &[u8], expected: &[u8]) -> Result<bool, CryptoError> {
        let actual = self.sign(key, data)?;
        Ok(constant_time_eq(&actual, expected))
    }
}

impl fmt::Display for IntegrityAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IntegrityAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("HS256") {
            Ok(IntegrityAlgorithm::Hs256)
        } else if s.eq_ignore_ascii_case("GMAC") {
            Ok(IntegrityAlgorithm::Gmac)
        } else {
            Err(CryptoError::UnsupportedAlg(s.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_rfc4231_case_2() {
        let mac = hmac_sha256(b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(
            hex::encode(mac),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn test_gmac_takes_trailing_tag() {
        let data: Vec<u8> = (0u8..40).collect();
        let sig = IntegrityAlgorithm::Gmac.sign(&[0u8; 32], &data).unwrap();
        assert_eq!(sig, (24u8..40).collect::<Vec<_>>());
        assert!(IntegrityAlgorithm::Gmac.sign(&[0u8; 32], &[1u8; 8]).is_err());
    }

    #[test]
    fn test_verify_detects_mismatch() {
        let key = [5u8; 32];
        let sig = IntegrityAlgorithm::Hs256.sign(&key, b"aggregate").unwrap();
        assert!(IntegrityAlgorithm::Hs256.verify(&key, b"aggregate", &sig).unwrap());
        assert!(!IntegrityAlgorithm::Hs256.verify(&key, b"aggregatf", &sig).unwrap());
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("HS256".parse::<IntegrityAlgorithm>().unwrap(), IntegrityAlgorithm::Hs256);
        assert_eq!("gmac".parse::<IntegrityAlgorithm>().unwrap(), IntegrityAlgorithm::Gmac);
        assert!(matches!(
            "SHA1".parse::<IntegrityAlgorithm>(),
            Err(CryptoError::UnsupportedAlg(_))
        ));
    }
}
