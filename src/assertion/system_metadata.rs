//! The `system-metadata` assertion describing the writer

use super::{
    AppliesToState, Assertion, AssertionConfig, AssertionError, AssertionType, Scope, Statement,
};
use crate::crypto::CryptoError;
use crate::manifest::TDF_SPEC_VERSION;
use serde::{Deserialize, Serialize};

pub const SYSTEM_METADATA_ID: &str = "system-metadata";
pub const SYSTEM_METADATA_SCHEMA: &str = "system-metadata-v2";
/// Accepted on read only
pub const SYSTEM_METADATA_SCHEMA_V1: &str = "system-metadata-v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMetadata {
    pub tdf_spec_version: String,
    #[serde(default)]
    pub creation_date: String,
    #[serde(default)]
    pub operating_system: String,
    #[serde(default)]
    pub sdk_version: String,
    #[serde(default)]
    pub architecture: String,
}

impl SystemMetadata {
    /// Metadata for this process, dated now
    pub fn current() -> Self {
        SystemMetadata {
            tdf_spec_version: TDF_SPEC_VERSION.to_string(),
            creation_date: chrono::Utc::now().to_rfc3339(),
            operating_system: std::env::consts::OS.to_string(),
            sdk_version: format!("Rust-{}", env!("CARGO_PKG_VERSION")),
            architecture: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Unsigned system metadata assertion; it is signed with the DEK
pub fn system_metadata_assertion() -> Result<AssertionConfig, AssertionError> {
    let value =
        serde_json::to_string(&SystemMetadata::current()).map_err(CryptoError::from)?;
    Ok(AssertionConfig::new(
        SYSTEM_METADATA_ID,
        AssertionType::Other,
        Scope::Payload,
        Statement::new("json", SYSTEM_METADATA_SCHEMA, value),
    )
    .applies_to_state(AppliesToState::Unencrypted))
}

pub(crate) fn validate_system_metadata(assertion: &Assertion) -> Result<(), AssertionError> {
    let invalid = |reason: String| AssertionError::Validation {
        id: assertion.id.clone(),
        reason,
    };
    if assertion.statement.format != "json" {
        return Err(invalid(format!(
            "statement format {:?} is not json",
            assertion.statement.format
        )));
    }
    let metadata: SystemMetadata = serde_json::from_str(&assertion.statement.value)
        .map_err(|e| invalid(format!("statement is not system metadata: {e}")))?;
    if metadata.tdf_spec_version.is_empty() {
        return Err(invalid("tdf_spec_version is empty".into()));
    }
    Ok(())
}
