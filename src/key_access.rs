//! Split keys, policy binding and key access object construction
//!
//! The DEK is the XOR of one fragment per distinct split id. Every step of
//! the split plan wraps its split's fragment for one KAS; steps sharing a
//! split id wrap the same fragment, so any one of them is enough to recover
//! it.

use crate::config::{KasInfo, SplitStep, TdfConfig};
use crate::crypto::kem::ec::EcdhKem;
use crate::crypto::kem::rsa::RsaOaepKem;
use crate::crypto::kem::KeyEncapsulation;
use crate::crypto::{
    aes_gcm_decrypt, aes_gcm_encrypt, hmac::constant_time_eq, hmac_sha256, CryptoError, Dek,
    KeyFragment, OaepHash, GCM_IV_SIZE,
};
use crate::error::TdfError;
use crate::manifest::{
    KeyAccess, PolicyBinding, KAO_ALG_ECDH_HKDF, KAO_TYPE_EC_WRAPPED, KAO_TYPE_WRAPPED,
    KEY_ACCESS_SCHEMA_VERSION,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use tracing::debug;

pub const POLICY_BINDING_ALG: &str = "HS256";
pub const KAS_PROTOCOL: &str = "kas";

/// Split `dek` into one fragment per distinct split id, in first-seen order
pub fn split_key(dek: &Dek, plan: &[SplitStep]) -> Vec<(String, KeyFragment)> {
    let mut ids: Vec<&str> = Vec::new();
    for step in plan {
        if !ids.contains(&step.split_id.as_str()) {
            ids.push(&step.split_id);
        }
    }

    let mut remainder = dek.clone();
    let mut fragments = Vec::with_capacity(ids.len());
    for (i, id) in ids.iter().enumerate() {
        let fragment = if i + 1 == ids.len() {
            KeyFragment(remainder.0)
        } else {
            let random = KeyFragment::generate();
            remainder.xor_in(&random);
            random
        };
        fragments.push((id.to_string(), fragment));
    }
    fragments
}

/// XOR recovered fragments back into the DEK
pub fn reconstruct_dek<'a>(fragments: impl IntoIterator<Item = &'a KeyFragment>) -> Dek {
    let mut dek = Dek::zero();
    for fragment in fragments {
        dek.xor_in(fragment);
    }
    dek
}

/// `base64(hex(HMAC-SHA256(fragment, policy_b64)))`
pub fn policy_binding(fragment: &KeyFragment, policy_b64: &str) -> Result<PolicyBinding, CryptoError> {
    let mac = hmac_sha256(fragment.as_slice(), policy_b64.as_bytes())?;
    Ok(PolicyBinding {
        alg: POLICY_BINDING_ALG.to_string(),
        hash: BASE64.encode(hex::encode(mac)),
    })
}

/// Check a binding against a recovered fragment
///
/// Some writers store the raw MAC rather than its hex form; both are accepted.
pub fn verify_policy_binding(
    fragment: &KeyFragment,
    policy_b64: &str,
    binding: &PolicyBinding,
) -> Result<bool, CryptoError> {
    let mac = hmac_sha256(fragment.as_slice(), policy_b64.as_bytes())?;
    let Ok(stored) = BASE64.decode(&binding.hash) else {
        return Ok(false);
    };
    Ok(constant_time_eq(&stored, hex::encode(&mac).as_bytes()) || constant_time_eq(&stored, &mac))
}

#[derive(Debug, Serialize, Deserialize)]
struct EncryptedMetadata {
    ciphertext: String,
    iv: String,
}

/// Seal caller metadata under a fragment
pub fn encrypt_metadata(fragment: &KeyFragment, metadata: &str) -> Result<String, CryptoError> {
    let sealed = aes_gcm_encrypt(fragment.as_slice(), metadata.as_bytes())?;
    let envelope = EncryptedMetadata {
        ciphertext: BASE64.encode(&sealed),
        iv: BASE64.encode(&sealed[..GCM_IV_SIZE]),
    };
    Ok(BASE64.encode(serde_json::to_vec(&envelope)?))
}

pub fn decrypt_metadata(fragment: &KeyFragment, encoded: &str) -> Result<String, CryptoError> {
    let envelope: EncryptedMetadata = serde_json::from_slice(&BASE64.decode(encoded)?)?;
    let plain = aes_gcm_decrypt(fragment.as_slice(), &BASE64.decode(envelope.ciphertext)?)?;
    String::from_utf8(plain)
        .map_err(|_| CryptoError::InvalidKey("metadata is not UTF-8".into()))
}

/// Wrap one fragment for one KAS
pub fn build_key_access(
    step: &SplitStep,
    kas: &KasInfo,
    fragment: &KeyFragment,
    policy_b64: &str,
    metadata: Option<&str>,
) -> Result<KeyAccess, TdfError> {
    let public_key = kas.public_key.as_deref().ok_or_else(|| {
        TdfError::InvalidArgument(format!("no public key for KAS {}", kas.url))
    })?;

    let (access_type, alg, wrapped_key, ephemeral_public_key) = match kas.ec_curve() {
        Some(curve) => {
            let wrapped = EcdhKem::default().wrap(fragment.as_slice(), public_key)?;
            debug!(kas_url = %kas.url, %curve, "wrapped split with ECDH-HKDF");
            (
                KAO_TYPE_EC_WRAPPED,
                KAO_ALG_ECDH_HKDF.to_string(),
                wrapped.wrapped,
                Some(wrapped.ephemeral_public_key),
            )
        }
        None => {
            let kem = RsaOaepKem::with_sha1();
            let wrapped = kem.wrap(fragment.as_slice(), public_key)?;
            debug!(kas_url = %kas.url, "wrapped split with RSA-OAEP");
            (
                KAO_TYPE_WRAPPED,
                OaepHash::Sha1.manifest_alg().to_string(),
                wrapped,
                None,
            )
        }
    };

    let encrypted_metadata = metadata
        .map(|m| encrypt_metadata(fragment, m))
        .transpose()?;

    Ok(KeyAccess {
        access_type: access_type.to_string(),
        url: kas.url.clone(),
        protocol: KAS_PROTOCOL.to_string(),
        wrapped_key: BASE64.encode(wrapped_key),
        policy_binding: policy_binding(fragment, policy_b64)?,
        encrypted_metadata,
        kid: kas.kid.clone(),
        split_id: step.split_id.clone(),
        schema_version: Some(KEY_ACCESS_SCHEMA_VERSION.to_string()),
        ephemeral_public_key,
        alg: Some(alg),
        extra: Map::new(),
    })
}

/// Split `dek` along `plan` and build every key access object
pub fn wrap_dek(
    dek: &Dek,
    plan: &[SplitStep],
    config: &TdfConfig,
    policy_b64: &str,
) -> Result<Vec<KeyAccess>, TdfError> {
    let fragments = split_key(dek, plan);
    plan.iter()
        .map(|step| {
            let kas = config.kas_info(&step.kas_url).ok_or_else(|| {
                TdfError::InvalidArgument(format!("split plan names unknown KAS {}", step.kas_url))
            })?;
            let fragment = fragments
                .iter()
                .find(|(id, _)| *id == step.split_id)
                .map(|(_, f)| f)
                .ok_or_else(|| {
                    TdfError::InvalidArgument(format!("no fragment for split {}", step.split_id))
                })?;
            build_key_access(step, kas, fragment, policy_b64, config.metadata.as_deref())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::kem::ec::EcWrappedKey;
    use crate::crypto::{EcCurve, EcPrivateKey};

    fn plan(ids: &[(&str, &str)]) -> Vec<SplitStep> {
        ids.iter().map(|(u, s)| SplitStep::new(*u, *s)).collect()
    }

    #[test]
    fn test_split_fragments_xor_to_dek() {
        let dek = Dek::generate();
        let steps = plan(&[("a", "s-0"), ("b", "s-1"), ("c", "s-0"), ("d", "s-2")]);
        let fragments = split_key(&dek, &steps);

        let ids: Vec<&str> = fragments.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["s-0", "s-1", "s-2"]);

        let rebuilt = reconstruct_dek(fragments.iter().map(|(_, f)| f));
        assert_eq!(rebuilt.as_slice(), dek.as_slice());
    }

    #[test]
    fn test_single_split_fragment_is_dek() {
        let dek = Dek::generate();
        let fragments = split_key(&dek, &plan(&[("a", ""), ("b", "")]));
        assert_eq!(fragments.len(), 1);
        assert_eq!(fragments[0].1.as_slice(), dek.as_slice());
    }

    #[test]
    fn test_policy_binding_is_base64_hex() {
        let fragment = KeyFragment::from_slice(&[7u8; 32]).unwrap();
        let binding = policy_binding(&fragment, "eyJ1dWlkIjoieCJ9").unwrap();
        assert_eq!(binding.alg, "HS256");

        let decoded = BASE64.decode(&binding.hash).unwrap();
        assert_eq!(decoded.len(), 64);
        let mac = hmac_sha256(&[7u8; 32], b"eyJ1dWlkIjoieCJ9").unwrap();
        assert_eq!(decoded, hex::encode(&mac).into_bytes());

        assert!(verify_policy_binding(&fragment, "eyJ1dWlkIjoieCJ9", &binding).unwrap());
        assert!(!verify_policy_binding(&fragment, "eyJ1dWlkIjoieSJ9", &binding).unwrap());

        let raw = PolicyBinding {
            alg: "HS256".into(),
            hash: BASE64.encode(mac),
        };
        assert!(verify_policy_binding(&fragment, "eyJ1dWlkIjoieCJ9", &raw).unwrap());
    }

    #[test]
    fn test_metadata_envelope() {
        let fragment = KeyFragment::generate();
        let sealed = encrypt_metadata(&fragment, "hello metadata").unwrap();

        let envelope: serde_json::Value =
            serde_json::from_slice(&BASE64.decode(&sealed).unwrap()).unwrap();
        let ct = BASE64
            .decode(envelope["ciphertext"].as_str().unwrap())
            .unwrap();
        let iv = BASE64.decode(envelope["iv"].as_str().unwrap()).unwrap();
        assert_eq!(&ct[..12], iv.as_slice());

        assert_eq!(decrypt_metadata(&fragment, &sealed).unwrap(), "hello metadata");
        assert!(decrypt_metadata(&KeyFragment::generate(), &sealed).is_err());
    }

    #[test]
    fn test_ec_key_access_object() {
        let kas_key = EcPrivateKey::generate(EcCurve::P384);
        let kas = KasInfo::new("https://kas.example.com")
            .with_algorithm("ec:secp384r1")
            .with_kid("e1")
            .with_public_key(kas_key.public_key_pem().unwrap());
        let fragment = KeyFragment::generate();
        let step = SplitStep::new("https://kas.example.com", "s-0");

        let kao = build_key_access(&step, &kas, &fragment, "cG9saWN5", Some("m")).unwrap();
        assert_eq!(kao.access_type, "ec-wrapped");
        assert_eq!(kao.alg.as_deref(), Some("ECDH-HKDF"));
        assert_eq!(kao.split_id, "s-0");
        assert_eq!(kao.kid.as_deref(), Some("e1"));
        assert_eq!(kao.schema_version.as_deref(), Some("1.0"));
        assert!(kao.encrypted_metadata.is_some());

        let wrapped = EcWrappedKey {
            ephemeral_public_key: kao.ephemeral_public_key.clone().unwrap(),
            wrapped: BASE64.decode(&kao.wrapped_key).unwrap(),
        };
        let unwrapped = EcdhKem::default().unwrap(&wrapped, &kas_key).unwrap();
        assert_eq!(unwrapped, fragment.as_slice());
    }

    #[test]
    fn test_missing_public_key_rejected() {
        let kas = KasInfo::new("https://kas.example.com");
        let err = build_key_access(
            &SplitStep::new("https://kas.example.com", ""),
            &kas,
            &KeyFragment::generate(),
            "cG9saWN5",
            None,
        )
        .unwrap_err();
        assert!(matches!(err, TdfError::InvalidArgument(_)));
    }
}
