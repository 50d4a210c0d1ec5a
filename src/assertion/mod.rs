//! Signed assertions bound to a TDF
//!
//! An assertion is a statement (handling instructions, metadata, ...) plus a
//! JWS binding. The binding signs the SHA-256 of the JCS form of the
//! assertion, without its binding, together with the root signature of the
//! payload, so an assertion cannot be edited or moved to another TDF.
//!
//! On read, each assertion is routed by its statement schema through the
//! [`AssertionRegistry`]; assertions nobody claims are verified with a
//! caller key or, failing that, with the DEK. What happens to assertions
//! that cannot be verified at all depends on [`AssertionVerificationMode`].
//!
//! # Example
//!
//! ```
//! use ztdf::assertion::{AssertionConfig, AssertionType, Scope, Statement};
//!
//! let handling = AssertionConfig::new(
//!     "handling-1",
//!     AssertionType::Handling,
//!     Scope::Tdo,
//!     Statement::new("json", "urn:example:handling", r#"{"retain_days":90}"#),
//! );
//! assert_eq!(handling.to_assertion().statement.schema, "urn:example:handling");
//! ```

pub mod binding;
pub mod provider;
pub mod system_metadata;

use crate::config::ReaderConfig;
use crate::crypto::{jcs, jws, CryptoError, Dek, JwsKey};
use crate::error::TdfError;
use crate::manifest::Manifest;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, warn};

pub use binding::{BINDING_METHOD_JWS, BINDING_VERSION};
pub use provider::{
    AssertionRegistry, AssertionValidator, AssertionVerificationKeys, AssertionVerificationMode,
    Validator, VerificationContext, WILDCARD_SCHEMA,
};
pub use system_metadata::{
    system_metadata_assertion, SystemMetadata, SYSTEM_METADATA_ID, SYSTEM_METADATA_SCHEMA,
};

#[derive(Debug, Error)]
pub enum AssertionError {
    #[error("assertion {id} has no binding signature")]
    MissingBinding { id: String },

    #[error("assertion {id} does not match its signed hash")]
    HashMismatch { id: String },

    #[error("assertion {id} is not bound to this TDF")]
    SignatureMismatch { id: String },

    #[error("assertion {id} binding is invalid: {reason}")]
    InvalidSignature { id: String, reason: String },

    #[error("assertion {id} has schema {found} but was signed for {expected}")]
    SchemaMismatch {
        id: String,
        expected: String,
        found: String,
    },

    #[error("assertion {id} has unknown schema {schema:?}")]
    UnknownSchema { id: String, schema: String },

    #[error("no verification key for assertion {id}")]
    MissingKey { id: String },

    #[error("unsupported assertion signing algorithm: {0}")]
    UnsupportedAlg(String),

    #[error("assertion {id} failed validation: {reason}")]
    Validation { id: String, reason: String },

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl AssertionError {
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::MissingKey { .. } => Some(
                "Add a verification key for this assertion id, a default key, or use permissive mode",
            ),
            Self::UnknownSchema { .. } => {
                Some("Register a validator for the schema or use a non-strict verification mode")
            }
            Self::UnsupportedAlg(_) => Some("Sign assertions with HS256, RS256 or ES256/384/512"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssertionType {
    Handling,
    Other,
}

/// What the assertion applies to: the whole object or just the payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Tdo,
    Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppliesToState {
    Encrypted,
    Unencrypted,
}

/// The asserted content
///
/// `value` is always carried as a string. A JSON object found in a manifest
/// is re-encoded compactly, which is what its hash was computed over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub format: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub schema: String,
    #[serde(
        default,
        skip_serializing_if = "String::is_empty",
        deserialize_with = "statement_value"
    )]
    pub value: String,
}

fn statement_value<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Null => Ok(String::new()),
        other => serde_json::to_string(&other).map_err(serde::de::Error::custom),
    }
}

impl Statement {
    pub fn new(
        format: impl Into<String>,
        schema: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Statement {
            format: format.into(),
            schema: schema.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

/// An assertion as it appears in the manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assertion {
    pub id: String,
    #[serde(rename = "type")]
    pub assertion_type: AssertionType,
    pub scope: Scope,
    #[serde(
        rename = "appliesToState",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub applies_to_state: Option<AppliesToState>,
    pub statement: Statement,
    #[serde(default)]
    pub binding: Binding,
}

impl Assertion {
    /// SHA-256 over the JCS form of the assertion without its binding
    pub fn hash(&self) -> Result<[u8; 32], AssertionError> {
        let mut value = serde_json::to_value(self).map_err(CryptoError::from)?;
        if let Value::Object(map) = &mut value {
            map.remove("binding");
        }
        let canonical = jcs::canonicalize_value(&value)?;
        Ok(Sha256::digest(canonical.as_bytes()).into())
    }

    pub fn hash_hex(&self) -> Result<String, AssertionError> {
        Ok(hex::encode(self.hash()?))
    }

    pub fn is_signed(&self) -> bool {
        !self.binding.signature.is_empty()
    }
}

/// An assertion to attach at create time
///
/// Without a signing key the assertion is signed with the DEK (HS256), so
/// any reader able to decrypt can also verify it.
#[derive(Debug, Clone)]
pub struct AssertionConfig {
    pub id: String,
    pub assertion_type: AssertionType,
    pub scope: Scope,
    pub applies_to_state: Option<AppliesToState>,
    pub statement: Statement,
    pub signing_key: Option<JwsKey>,
}

impl AssertionConfig {
    pub fn new(
        id: impl Into<String>,
        assertion_type: AssertionType,
        scope: Scope,
        statement: Statement,
    ) -> Self {
        AssertionConfig {
            id: id.into(),
            assertion_type,
            scope,
            applies_to_state: None,
            statement,
            signing_key: None,
        }
    }

    #[must_use]
    pub fn applies_to_state(mut self, state: AppliesToState) -> Self {
        self.applies_to_state = Some(state);
        self
    }

    #[must_use]
    pub fn signing_key(mut self, key: JwsKey) -> Self {
        self.signing_key = Some(key);
        self
    }

    /// The unsigned assertion
    pub fn to_assertion(&self) -> Assertion {
        Assertion {
            id: self.id.clone(),
            assertion_type: self.assertion_type,
            scope: self.scope,
            applies_to_state: self.applies_to_state,
            statement: self.statement.clone(),
            binding: Binding::default(),
        }
    }
}

/// Build and sign every configured assertion against the segment `aggregate`
///
/// The result is ordered by assertion id.
pub(crate) fn sign_assertions(
    configs: &[AssertionConfig],
    dek: &Dek,
    aggregate: &[u8],
    use_hex: bool,
) -> Result<Vec<Assertion>, AssertionError> {
    let mut seen = HashSet::new();
    let dek_key = JwsKey::hs256(dek.as_slice());
    let mut ordered: Vec<&AssertionConfig> = configs.iter().collect();
    ordered.sort_by(|a, b| a.id.cmp(&b.id));

    ordered
        .into_iter()
        .map(|config| {
            if config.id.is_empty() {
                return Err(AssertionError::Validation {
                    id: String::new(),
                    reason: "assertion id is empty".into(),
                });
            }
            if !seen.insert(config.id.as_str()) {
                return Err(AssertionError::Validation {
                    id: config.id.clone(),
                    reason: "duplicate assertion id".into(),
                });
            }
            let mut assertion = config.to_assertion();
            let key = config.signing_key.as_ref().unwrap_or(&dek_key);
            binding::sign(&mut assertion, key, aggregate, use_hex)?;
            debug!(assertion_id = %assertion.id, alg = key.alg(), "signed assertion");
            Ok(assertion)
        })
        .collect()
}

enum Route<'a> {
    Registered(&'a Validator),
    Key(&'a JwsKey),
    Dek,
    MissingKey,
    Unknown,
}

fn route<'a>(assertion: &Assertion, config: &'a ReaderConfig) -> Route<'a> {
    if let Some(validator) = config.registry.get(&assertion.statement.schema) {
        return Route::Registered(validator);
    }
    if let Some(key) = config.verification_keys.get(&assertion.id) {
        return Route::Key(key);
    }
    // Only HS256 bindings can have been made with the DEK; anything else
    // was signed by a party this reader has no key for.
    match jws::peek_header(&assertion.binding.signature) {
        Ok(header) if header.get("alg").and_then(Value::as_str) != Some("HS256") => {
            if config.verification_keys.is_empty() {
                Route::Unknown
            } else {
                Route::MissingKey
            }
        }
        _ => Route::Dek,
    }
}

/// Verify every assertion of `manifest`, in ascending id order
///
/// `aggregate` is the concatenation of the decoded segment hashes, as
/// returned by root signature verification.
pub fn verify_assertions(
    manifest: &Manifest,
    dek: &Dek,
    aggregate: &[u8],
    config: &ReaderConfig,
) -> Result<(), TdfError> {
    let ctx = VerificationContext::new(manifest, aggregate, dek);
    let mode = config.verification_mode;

    let mut assertions: Vec<&Assertion> = manifest.assertions.iter().collect();
    assertions.sort_by(|a, b| a.id.cmp(&b.id));

    for assertion in assertions {
        let id = assertion.id.as_str();
        let schema = assertion.statement.schema.as_str();
        if !assertion.is_signed() {
            warn!(assertion_id = id, "assertion has no binding");
            return Err(AssertionError::MissingBinding { id: id.to_string() }.into());
        }

        let verified = match route(assertion, config) {
            Route::Registered(validator) => {
                validator.verify(assertion, &ctx).map(|()| Some(validator))
            }
            Route::Key(key) => ctx.verify_binding(assertion, key).map(|()| None),
            Route::Dek => ctx.verify_binding(assertion, &ctx.dek_key()).map(|()| None),
            Route::MissingKey => match mode {
                AssertionVerificationMode::Permissive => {
                    warn!(assertion_id = id, "no verification key; assertion skipped");
                    continue;
                }
                _ => Err(AssertionError::MissingKey { id: id.to_string() }),
            },
            Route::Unknown => match mode {
                AssertionVerificationMode::Strict => Err(AssertionError::UnknownSchema {
                    id: id.to_string(),
                    schema: schema.to_string(),
                }),
                _ => {
                    warn!(assertion_id = id, schema, "unknown assertion schema; skipped");
                    continue;
                }
            },
        };

        let validator = match verified {
            Ok(validator) => validator,
            Err(err) => {
                warn!(assertion_id = id, schema, error = %err, "assertion verification failed");
                return Err(err.into());
            }
        };

        if let Some(validator) = validator {
            if let Err(err) = validator.validate(assertion, &ctx) {
                if mode == AssertionVerificationMode::Permissive {
                    warn!(assertion_id = id, error = %err, "assertion validation failed; continuing");
                    continue;
                }
                return Err(err.into());
            }
        }
        debug!(assertion_id = id, schema, "assertion verified");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture() -> Assertion {
        Assertion {
            id: "424ff3a3-50ca-4f01-a2ae-ef851cd3cac0".into(),
            assertion_type: AssertionType::Handling,
            scope: Scope::Tdo,
            applies_to_state: Some(AppliesToState::Encrypted),
            statement: Statement::new(
                "json+stanag5636",
                "urn:nato:stanag:5636:A:1:elements:json",
                r#"{"ocl":{"pol":"62c76c68-d73d-4628-8ccc-4c1e18118c22","cls":"SECRET","catl":[{"type":"P","name":"Releasable To","vals":["usa"]}],"dcr":"2024-10-21T20:47:36Z"},"context":{"@base":"urn:nato:stanag:5636:A:1:elements:json"}}"#,
            ),
            binding: Binding::default(),
        }
    }

    #[test]
    fn test_fixture_hash() {
        assert_eq!(
            fixture().hash_hex().unwrap(),
            "4a447a13c5a32730d20bdf7feecb9ffe16649bc731914b574d80035a3927f860"
        );
    }

    #[test]
    fn test_hash_ignores_binding() {
        let mut signed = fixture();
        signed.binding = Binding {
            method: "jws".into(),
            signature: "a.b.c".into(),
            version: "1.0".into(),
        };
        assert_eq!(signed.hash().unwrap(), fixture().hash().unwrap());
    }

    #[test]
    fn test_json_object_value_is_reencoded() {
        let parsed: Assertion = serde_json::from_value(json!({
            "id": "a",
            "type": "other",
            "scope": "payload",
            "statement": {"format": "json", "schema": "s", "value": {"b": 1, "a": [true]}},
        }))
        .unwrap();
        assert_eq!(parsed.statement.value, r#"{"a":[true],"b":1}"#);
        assert!(!parsed.is_signed());
        assert_eq!(parsed.applies_to_state, None);

        let out = serde_json::to_value(&parsed).unwrap();
        assert_eq!(out["statement"]["value"], r#"{"a":[true],"b":1}"#);
        assert!(out.get("appliesToState").is_none());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let config = AssertionConfig::new(
            "dup",
            AssertionType::Other,
            Scope::Payload,
            Statement::new("text", "s", "v"),
        );
        let err = sign_assertions(&[config.clone(), config], &Dek::generate(), &[], false)
            .unwrap_err();
        assert!(matches!(err, AssertionError::Validation { ref id, .. } if id == "dup"));
    }

    #[test]
    fn test_signed_in_id_order() {
        let configs: Vec<AssertionConfig> = ["zeta", "alpha", "mid"]
            .iter()
            .map(|id| {
                AssertionConfig::new(
                    *id,
                    AssertionType::Handling,
                    Scope::Tdo,
                    Statement::new("text", "s", "v"),
                )
            })
            .collect();
        let signed = sign_assertions(&configs, &Dek::generate(), &[1, 2, 3], false).unwrap();
        let ids: Vec<&str> = signed.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "mid", "zeta"]);
        assert!(signed.iter().all(Assertion::is_signed));
    }
}
