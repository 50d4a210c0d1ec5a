//! Verification modes, keys and the validator registry

use super::system_metadata::{
    validate_system_metadata, SYSTEM_METADATA_SCHEMA, SYSTEM_METADATA_SCHEMA_V1,
};
use super::{binding, Assertion, AssertionError};
use crate::crypto::{Dek, JwsKey};
use crate::manifest::Manifest;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Matches every schema without a more specific validator
pub const WILDCARD_SCHEMA: &str = "*";

/// How strictly assertions are verified on read
///
/// | | unknown schema | no key | validation failure |
/// |---|---|---|---|
/// | `Permissive` | skip | skip | skip |
/// | `FailFast` | skip | error | error |
/// | `Strict` | error | error | error |
///
/// Cryptographic failures and unsigned assertions are errors in every mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AssertionVerificationMode {
    Permissive,
    #[default]
    FailFast,
    Strict,
}

/// Caller keys for verifying assertions not signed with the DEK
#[derive(Debug, Clone, Default)]
pub struct AssertionVerificationKeys {
    /// Used when no key is registered for the assertion id
    pub default_key: Option<JwsKey>,
    pub keys: HashMap<String, JwsKey>,
}

impl AssertionVerificationKeys {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_key(mut self, assertion_id: impl Into<String>, key: JwsKey) -> Self {
        self.keys.insert(assertion_id.into(), key);
        self
    }

    #[must_use]
    pub fn with_default_key(mut self, key: JwsKey) -> Self {
        self.default_key = Some(key);
        self
    }

    pub fn get(&self, assertion_id: &str) -> Option<&JwsKey> {
        self.keys.get(assertion_id).or(self.default_key.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.default_key.is_none() && self.keys.is_empty()
    }
}

/// What a validator gets to see of the TDF being read
pub struct VerificationContext<'a> {
    manifest: &'a Manifest,
    aggregate: &'a [u8],
    dek: &'a Dek,
}

impl<'a> VerificationContext<'a> {
    pub(crate) fn new(manifest: &'a Manifest, aggregate: &'a [u8], dek: &'a Dek) -> Self {
        VerificationContext {
            manifest,
            aggregate,
            dek,
        }
    }

    pub fn manifest(&self) -> &Manifest {
        self.manifest
    }

    /// Concatenated segment hashes covered by the root signature
    pub fn aggregate(&self) -> &[u8] {
        self.aggregate
    }

    /// HS256 key over the DEK, for assertions the writer signed without a key
    pub fn dek_key(&self) -> JwsKey {
        JwsKey::hs256(self.dek.as_slice())
    }

    /// Verify the binding of `assertion` with `key` against this TDF
    pub fn verify_binding(&self, assertion: &Assertion, key: &JwsKey) -> Result<(), AssertionError> {
        binding::verify(assertion, key, self.manifest, self.aggregate)
    }
}

/// Caller-supplied verification for one schema
///
/// `verify` checks the binding; its failures are always fatal. `validate`
/// judges the statement itself; in permissive mode its failures only warn.
pub trait AssertionValidator: Send + Sync {
    fn verify(&self, assertion: &Assertion, ctx: &VerificationContext<'_>)
        -> Result<(), AssertionError>;

    fn validate(
        &self,
        _assertion: &Assertion,
        _ctx: &VerificationContext<'_>,
    ) -> Result<(), AssertionError> {
        Ok(())
    }
}

/// A registry entry
#[derive(Clone)]
pub enum Validator {
    /// DEK-signed system metadata with a well-formed statement
    SystemMetadata,
    /// Binding signed with this key; the statement is not inspected
    Key(JwsKey),
    Custom(Arc<dyn AssertionValidator>),
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Validator::SystemMetadata => f.write_str("SystemMetadata"),
            Validator::Key(key) => f.debug_tuple("Key").field(&key.alg()).finish(),
            Validator::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl Validator {
    pub fn verify(
        &self,
        assertion: &Assertion,
        ctx: &VerificationContext<'_>,
    ) -> Result<(), AssertionError> {
        match self {
            Validator::SystemMetadata => ctx.verify_binding(assertion, &ctx.dek_key()),
            Validator::Key(key) => ctx.verify_binding(assertion, key),
            Validator::Custom(custom) => custom.verify(assertion, ctx),
        }
    }

    pub fn validate(
        &self,
        assertion: &Assertion,
        ctx: &VerificationContext<'_>,
    ) -> Result<(), AssertionError> {
        match self {
            Validator::SystemMetadata => validate_system_metadata(assertion),
            Validator::Key(_) => Ok(()),
            Validator::Custom(custom) => custom.validate(assertion, ctx),
        }
    }
}

/// Validators keyed by statement schema
#[derive(Debug, Clone, Default)]
pub struct AssertionRegistry {
    validators: HashMap<String, Validator>,
}

impl AssertionRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the system metadata validator
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(SYSTEM_METADATA_SCHEMA, Validator::SystemMetadata);
        registry.register(SYSTEM_METADATA_SCHEMA_V1, Validator::SystemMetadata);
        registry
    }

    /// Register `validator` for `schema`, returning the one it replaces
    pub fn register(&mut self, schema: impl Into<String>, validator: Validator) -> Option<Validator> {
        self.validators.insert(schema.into(), validator)
    }

    pub fn register_key(&mut self, schema: impl Into<String>, key: JwsKey) -> Option<Validator> {
        self.register(schema, Validator::Key(key))
    }

    pub fn register_custom(
        &mut self,
        schema: impl Into<String>,
        validator: Arc<dyn AssertionValidator>,
    ) -> Option<Validator> {
        self.register(schema, Validator::Custom(validator))
    }

    /// The validator for `schema`, falling back to the wildcard entry
    pub fn get(&self, schema: &str) -> Option<&Validator> {
        self.validators
            .get(schema)
            .or_else(|| self.validators.get(WILDCARD_SCHEMA))
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }
}
