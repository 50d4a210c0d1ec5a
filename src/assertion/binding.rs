//! JWS bindings
//!
//! The binding token carries `assertionHash` (hex SHA-256 of the assertion),
//! `assertionSig` and `assertionSchema`. `assertionSig` is
//! `base64(aggregate || hash)`, with the hash as hex text in legacy
//! containers and raw bytes otherwise. Some writers put the root signature
//! there instead, which is accepted on read. Tokens that instead carry
//! `tdfPolicyHash` and `keyAccessDigest` are checked against the policy and
//! key access objects.

use super::{Assertion, AssertionError};
use crate::crypto::hmac::constant_time_eq;
use crate::crypto::{jcs, CryptoError, JwsKey};
use crate::manifest::Manifest;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

pub const BINDING_METHOD_JWS: &str = "jws";
pub const BINDING_VERSION: &str = "1.0";

const CLAIM_HASH: &str = "assertionHash";
const CLAIM_SIG: &str = "assertionSig";
const CLAIM_SCHEMA: &str = "assertionSchema";
const CLAIM_POLICY_HASH: &str = "tdfPolicyHash";
const CLAIM_KEY_ACCESS_DIGEST: &str = "keyAccessDigest";

fn key_error(id: &str, err: CryptoError) -> AssertionError {
    match err {
        CryptoError::UnsupportedAlg(alg) => AssertionError::UnsupportedAlg(alg),
        other => AssertionError::InvalidSignature {
            id: id.to_string(),
            reason: other.to_string(),
        },
    }
}

fn aggregated(aggregate: &[u8], tail: &[u8]) -> String {
    let mut complete = Vec::with_capacity(aggregate.len() + tail.len());
    complete.extend_from_slice(aggregate);
    complete.extend_from_slice(tail);
    BASE64.encode(complete)
}

/// Sign `assertion` in place, binding it to the segment `aggregate`
pub fn sign(
    assertion: &mut Assertion,
    key: &JwsKey,
    aggregate: &[u8],
    use_hex: bool,
) -> Result<(), AssertionError> {
    let hash = assertion.hash()?;
    let hash_hex = hex::encode(hash);
    let sig = if use_hex {
        aggregated(aggregate, hash_hex.as_bytes())
    } else {
        aggregated(aggregate, &hash)
    };

    let mut claims = Map::new();
    claims.insert(CLAIM_HASH.into(), Value::String(hash_hex));
    claims.insert(CLAIM_SIG.into(), Value::String(sig));
    claims.insert(
        CLAIM_SCHEMA.into(),
        Value::String(assertion.statement.schema.clone()),
    );

    let token = key
        .sign(&Value::Object(claims))
        .map_err(|e| key_error(&assertion.id, e))?;
    assertion.binding.method = BINDING_METHOD_JWS.to_string();
    assertion.binding.signature = token;
    assertion.binding.version = BINDING_VERSION.to_string();
    Ok(())
}

fn claim<'a>(claims: &'a Value, name: &str) -> Option<&'a str> {
    claims.get(name).and_then(Value::as_str)
}

fn matches_str(a: &str, b: &str) -> bool {
    constant_time_eq(a.as_bytes(), b.as_bytes())
}

fn assertion_sig_matches(
    sig: &str,
    hash: &[u8; 32],
    manifest: &Manifest,
    aggregate: &[u8],
) -> bool {
    if matches_str(sig, &manifest.integrity().root_signature.sig) {
        return true;
    }
    let hash_hex = hex::encode(hash);
    if manifest.use_hex() {
        matches_str(sig, &aggregated(aggregate, hash_hex.as_bytes()))
    } else {
        matches_str(sig, &aggregated(aggregate, &hash[..]))
            || matches_str(sig, &aggregated(aggregate, hash_hex.as_bytes()))
    }
}

fn secure_binding_matches(
    policy_hash: &str,
    key_access_digest: &str,
    manifest: &Manifest,
) -> Result<bool, AssertionError> {
    let expected_policy =
        BASE64.encode(Sha256::digest(manifest.encryption_information.policy.as_bytes()));
    let canonical = jcs::canonicalize(manifest.key_access())?;
    let expected_digest = BASE64.encode(Sha256::digest(canonical.as_bytes()));
    Ok(matches_str(policy_hash, &expected_policy)
        & matches_str(key_access_digest, &expected_digest))
}

/// Check the binding of `assertion` with `key` against this TDF
pub fn verify(
    assertion: &Assertion,
    key: &JwsKey,
    manifest: &Manifest,
    aggregate: &[u8],
) -> Result<(), AssertionError> {
    let id = assertion.id.as_str();
    if !assertion.is_signed() {
        return Err(AssertionError::MissingBinding { id: id.to_string() });
    }
    let claims = key
        .verify(&assertion.binding.signature)
        .map_err(|e| key_error(id, e))?;

    let stored_hash = claim(&claims, CLAIM_HASH).ok_or_else(|| AssertionError::InvalidSignature {
        id: id.to_string(),
        reason: format!("missing {CLAIM_HASH} claim"),
    })?;
    let hash = assertion.hash()?;
    if !matches_str(stored_hash, &hex::encode(hash)) {
        return Err(AssertionError::HashMismatch { id: id.to_string() });
    }

    if let Some(signed_schema) = claim(&claims, CLAIM_SCHEMA) {
        if signed_schema != assertion.statement.schema {
            return Err(AssertionError::SchemaMismatch {
                id: id.to_string(),
                expected: signed_schema.to_string(),
                found: assertion.statement.schema.clone(),
            });
        }
    }

    let bound = match (
        claim(&claims, CLAIM_SIG),
        claim(&claims, CLAIM_POLICY_HASH),
        claim(&claims, CLAIM_KEY_ACCESS_DIGEST),
    ) {
        (Some(sig), _, _) => assertion_sig_matches(sig, &hash, manifest, aggregate),
        (None, Some(policy_hash), Some(digest)) => {
            secure_binding_matches(policy_hash, digest, manifest)?
        }
        _ => {
            return Err(AssertionError::InvalidSignature {
                id: id.to_string(),
                reason: format!("missing {CLAIM_SIG} claim"),
            })
        }
    };
    if !bound {
        return Err(AssertionError::SignatureMismatch { id: id.to_string() });
    }
    Ok(())
}
