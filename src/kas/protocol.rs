//! KAS v2 rewrap protocol types
//!
//! The unsigned request is serialized to a string and carried as the
//! `requestBody` claim of the signed request token. Key access objects are
//! sent exactly as they appear in the manifest.

use crate::manifest::KeyAccess;
use serde::{Deserialize, Serialize};

/// Result status granting access to a key access object
pub const STATUS_PERMIT: &str = "permit";
/// Result status denying access to a key access object
pub const STATUS_FAIL: &str = "fail";

/// Unsigned rewrap request structure (before JWT signing)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsignedRewrapRequest {
    #[serde(rename = "clientPublicKey")]
    pub client_public_key: String,
    pub requests: Vec<PolicyRequest>,
}

/// Key access objects sharing one policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    pub policy: RequestPolicy,
    #[serde(rename = "keyAccessObjects")]
    pub key_access_objects: Vec<KeyAccessObjectWrapper>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestPolicy {
    pub id: String,
    /// Base64 policy JSON, exactly as stored in the manifest
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyAccessObjectWrapper {
    #[serde(rename = "keyAccessObjectId")]
    pub key_access_object_id: String,
    #[serde(rename = "keyAccessObject")]
    pub key_access_object: KeyAccess,
}

/// Body POSTed to `/v2/rewrap`
#[derive(Debug, Serialize, Deserialize)]
pub struct SignedRewrapRequest {
    #[serde(rename = "signedRequestToken")]
    pub signed_request_token: String,
}

/// Rewrap response structure
///
/// Version 1 servers answer a single-object request with a bare
/// `entityWrappedKey`; see [`RewrapResponse::upgrade_v1`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RewrapResponse {
    #[serde(default)]
    pub responses: Vec<PolicyRewrapResult>,
    #[serde(
        rename = "sessionPublicKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub session_public_key: Option<String>,
    #[serde(
        rename = "entityWrappedKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub entity_wrapped_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRewrapResult {
    #[serde(rename = "policyId", default)]
    pub policy_id: String,
    #[serde(default)]
    pub results: Vec<KeyAccessRewrapResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyAccessRewrapResult {
    #[serde(rename = "keyAccessObjectId")]
    pub key_access_object_id: String,
    pub status: String,
    #[serde(rename = "kasWrappedKey", default, skip_serializing_if = "Option::is_none")]
    pub kas_wrapped_key: Option<String>,
    #[serde(
        rename = "entityWrappedKey",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub entity_wrapped_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl KeyAccessRewrapResult {
    pub fn is_permit(&self) -> bool {
        self.status.eq_ignore_ascii_case(STATUS_PERMIT)
    }

    /// The rewrapped key, preferring the v2 field
    pub fn wrapped_key(&self) -> Option<&str> {
        self.kas_wrapped_key
            .as_deref()
            .or(self.entity_wrapped_key.as_deref())
            .filter(|k| !k.is_empty())
    }
}

impl RewrapResponse {
    /// Treat a v1 response as a permit for `kao_id`
    pub fn upgrade_v1(mut self, policy_id: &str, kao_id: &str) -> Self {
        if self.responses.is_empty() {
            if let Some(key) = self.entity_wrapped_key.take() {
                self.responses.push(PolicyRewrapResult {
                    policy_id: policy_id.to_string(),
                    results: vec![KeyAccessRewrapResult {
                        key_access_object_id: kao_id.to_string(),
                        status: STATUS_PERMIT.to_string(),
                        kas_wrapped_key: Some(key),
                        entity_wrapped_key: None,
                        error: None,
                    }],
                });
            }
        }
        self
    }

    /// All per-object results regardless of policy
    pub fn results(&self) -> impl Iterator<Item = &KeyAccessRewrapResult> {
        self.responses.iter().flat_map(|r| r.results.iter())
    }
}
