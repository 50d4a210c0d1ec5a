//! Manifest JSON model
//!
//! Field names follow the TDF wire format. Objects that other writers are
//! known to extend keep unrecognized members in an `extra` map so that a
//! parsed manifest serializes back with them intact.

use crate::assertion::Assertion;
use crate::crypto::IntegrityAlgorithm;
use crate::policy::{Policy, PolicyError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Version written to `schemaVersion` for non-legacy containers
pub const TDF_SPEC_VERSION: &str = "4.3.0";
/// Version written to every key access object
pub const KEY_ACCESS_SCHEMA_VERSION: &str = "1.0";
/// Payload encryption method name
pub const AES_256_GCM: &str = "AES-256-GCM";

pub const KAO_TYPE_WRAPPED: &str = "wrapped";
pub const KAO_TYPE_EC_WRAPPED: &str = "ec-wrapped";
pub const KAO_ALG_RSA_OAEP: &str = "RSA-OAEP";
pub const KAO_ALG_ECDH_HKDF: &str = "ECDH-HKDF";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid manifest: {0}")]
    Invalid(String),

    #[error("invalid policy: {0}")]
    Policy(#[from] PolicyError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub payload: Payload,
    #[serde(rename = "encryptionInformation")]
    pub encryption_information: EncryptionInformation,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub assertions: Vec<Assertion>,
    /// Empty for legacy containers, which also switches hash encoding to hex
    #[serde(
        rename = "schemaVersion",
        alias = "tdfVersion",
        default,
        skip_serializing_if = "String::is_empty"
    )]
    pub tdf_version: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "type")]
    pub payload_type: String,
    pub url: String,
    pub protocol: String,
    #[serde(rename = "mimeType", default, skip_serializing_if = "String::is_empty")]
    pub mime_type: String,
    #[serde(rename = "isEncrypted")]
    pub is_encrypted: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionInformation {
    #[serde(rename = "type")]
    pub encryption_type: String,
    pub policy: String,
    #[serde(rename = "keyAccess")]
    pub key_access: Vec<KeyAccess>,
    pub method: EncryptionMethod,
    #[serde(rename = "integrityInformation")]
    pub integrity_information: IntegrityInformation,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionMethod {
    pub algorithm: String,
    #[serde(default)]
    pub iv: String,
    #[serde(rename = "isStreamable", default)]
    pub is_streamable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityInformation {
    #[serde(rename = "rootSignature")]
    pub root_signature: RootSignature,
    #[serde(rename = "segmentHashAlg")]
    pub segment_hash_alg: String,
    #[serde(rename = "segmentSizeDefault")]
    pub segment_size_default: u64,
    #[serde(rename = "encryptedSegmentSizeDefault")]
    pub encrypted_segment_size_default: u64,
    pub segments: Vec<Segment>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootSignature {
    pub alg: String,
    pub sig: String,
}

/// Per-segment integrity entry; absent sizes fall back to the defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub hash: String,
    #[serde(rename = "segmentSize", default, skip_serializing_if = "Option::is_none")]
    pub segment_size: Option<u64>,
    #[serde(
        rename = "encryptedSegmentSize",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub encrypted_segment_size: Option<u64>,
}

/// HMAC binding between a key split and the policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PolicyBindingRepr")]
pub struct PolicyBinding {
    pub alg: String,
    pub hash: String,
}

/// Older writers store the binding as a bare base64 string
#[derive(Deserialize)]
#[serde(untagged)]
enum PolicyBindingRepr {
    Object { alg: String, hash: String },
    Legacy(String),
}

impl From<PolicyBindingRepr> for PolicyBinding {
    fn from(repr: PolicyBindingRepr) -> Self {
        match repr {
            PolicyBindingRepr::Object { alg, hash } => PolicyBinding { alg, hash },
            PolicyBindingRepr::Legacy(hash) => PolicyBinding {
                alg: "HS256".to_string(),
                hash,
            },
        }
    }
}

/// Key access object: one wrapped split for one KAS
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyAccess {
    #[serde(rename = "type")]
    pub access_type: String,
    pub url: String,
    pub protocol: String,
    #[serde(rename = "wrappedKey")]
    pub wrapped_key: String,
    #[serde(rename = "policyBinding")]
    pub policy_binding: PolicyBinding,
    #[serde(rename = "encryptedMetadata", default, skip_serializing_if = "Option::is_none")]
    pub encrypted_metadata: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(rename = "sid", default, skip_serializing_if = "String::is_empty")]
    pub split_id: String,
    #[serde(rename = "schemaVersion", default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    #[serde(
        rename = "ephemeralPublicKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub ephemeral_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl KeyAccess {
    /// Wrapping algorithm, inferred from `type` when `alg` is absent
    pub fn algorithm(&self) -> &str {
        match self.alg.as_deref() {
            Some(alg) if !alg.is_empty() => alg,
            _ if self.access_type == KAO_TYPE_EC_WRAPPED => KAO_ALG_ECDH_HKDF,
            _ => KAO_ALG_RSA_OAEP,
        }
    }

    pub fn is_ec_wrapped(&self) -> bool {
        self.access_type == KAO_TYPE_EC_WRAPPED
    }
}

impl Manifest {
    pub fn from_json(bytes: &[u8]) -> Result<Self, ManifestError> {
        let manifest: Manifest = serde_json::from_slice(bytes)?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn to_json(&self) -> Result<String, ManifestError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Legacy containers (no version) hex-encode signatures before base64
    pub fn use_hex(&self) -> bool {
        self.tdf_version.is_empty()
    }

    pub fn policy(&self) -> Result<Policy, ManifestError> {
        Ok(Policy::from_base64(&self.encryption_information.policy)?)
    }

    pub fn key_access(&self) -> &[KeyAccess] {
        &self.encryption_information.key_access
    }

    pub fn integrity(&self) -> &IntegrityInformation {
        &self.encryption_information.integrity_information
    }

    /// Distinct split ids in first-seen order
    pub fn split_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for kao in self.key_access() {
            if !ids.contains(&kao.split_id.as_str()) {
                ids.push(&kao.split_id);
            }
        }
        ids
    }

    pub fn root_algorithm(&self) -> Result<IntegrityAlgorithm, ManifestError> {
        self.integrity()
            .root_signature
            .alg
            .parse()
            .map_err(|_| ManifestError::Invalid(format!(
                "unsupported root signature algorithm {}",
                self.integrity().root_signature.alg
            )))
    }

    pub fn segment_algorithm(&self) -> Result<IntegrityAlgorithm, ManifestError> {
        self.integrity()
            .segment_hash_alg
            .parse()
            .map_err(|_| ManifestError::Invalid(format!(
                "unsupported segment hash algorithm {}",
                self.integrity().segment_hash_alg
            )))
    }

    /// Structural checks that do not need key material
    pub fn validate(&self) -> Result<(), ManifestError> {
        let info = &self.encryption_information;
        if info.key_access.is_empty() {
            return Err(ManifestError::Invalid("no key access objects".into()));
        }
        if !info.method.algorithm.eq_ignore_ascii_case(AES_256_GCM) {
            return Err(ManifestError::Invalid(format!(
                "unsupported encryption method {}",
                info.method.algorithm
            )));
        }
        let integrity = &info.integrity_information;
        if integrity.segments.is_empty() {
            return Err(ManifestError::Invalid("no segments".into()));
        }
        if integrity.segment_size_default == 0 {
            return Err(ManifestError::Invalid("segmentSizeDefault is zero".into()));
        }
        let expected_encrypted = integrity
            .segment_size_default
            .checked_add(crate::crypto::GCM_OVERHEAD as u64);
        if expected_encrypted != Some(integrity.encrypted_segment_size_default) {
            return Err(ManifestError::Invalid(format!(
                "encryptedSegmentSizeDefault {} does not match segmentSizeDefault {}",
                integrity.encrypted_segment_size_default, integrity.segment_size_default
            )));
        }
        self.root_algorithm()?;
        self.segment_algorithm()?;
        for kao in &info.key_access {
            if kao.url.is_empty() || kao.wrapped_key.is_empty() {
                return Err(ManifestError::Invalid(
                    "key access object missing url or wrappedKey".into(),
                ));
            }
            if kao.is_ec_wrapped() && kao.ephemeral_public_key.is_none() {
                return Err(ManifestError::Invalid(
                    "ec-wrapped key access object missing ephemeralPublicKey".into(),
                ));
            }
        }
        Ok(())
    }
}
