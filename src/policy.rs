//! Data policy embedded (base64 encoded) in the manifest
//!
//! The policy itself is opaque to the container engine: it is serialized
//! once, bound to every key split with an HMAC, and handed to the KAS
//! during rewrap. Only its shape matters here.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Policy is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Invalid attribute: {0}")]
    InvalidAttribute(String),
}

impl PolicyError {
    /// Returns a suggestion for how to fix this error, if available
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            PolicyError::InvalidAttribute(_) => {
                Some("Attribute FQNs look like https://<namespace>/attr/<name>/value/<value>")
            }
            PolicyError::Encoding(_) => Some("The manifest policy must be standard base64"),
            _ => None,
        }
    }
}

/// One attribute value the data is tagged with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeObject {
    pub attribute: String,
    #[serde(rename = "displayName", default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(rename = "isDefault", default, skip_serializing_if = "Option::is_none")]
    pub is_default: Option<bool>,
    #[serde(rename = "pubKey", default, skip_serializing_if = "Option::is_none")]
    pub pub_key: Option<String>,
    #[serde(rename = "kasURL", default, skip_serializing_if = "Option::is_none")]
    pub kas_url: Option<String>,
}

impl AttributeObject {
    pub fn new(attribute: impl Into<String>) -> Self {
        AttributeObject {
            attribute: attribute.into(),
            display_name: None,
            is_default: None,
            pub_key: None,
            kas_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub uuid: String,
    pub body: PolicyBody,
}

/// Attributes plus the dissemination list
///
/// Empty lists are written as `[]`; `null` is accepted on read since older
/// writers emit it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyBody {
    #[serde(
        rename = "dataAttributes",
        default,
        deserialize_with = "deserialize_null_as_empty_vec"
    )]
    pub data_attributes: Vec<AttributeObject>,
    #[serde(default, deserialize_with = "deserialize_null_as_empty_vec")]
    pub dissem: Vec<String>,
}

fn deserialize_null_as_empty_vec<'de, T, D>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    let opt = Option::<Vec<T>>::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

impl Policy {
    /// Create a policy with a fresh v4 UUID
    pub fn new(data_attributes: Vec<AttributeObject>, dissem: Vec<String>) -> Self {
        Policy {
            uuid: uuid::Uuid::new_v4().to_string(),
            body: PolicyBody {
                data_attributes,
                dissem,
            },
        }
    }

    pub fn to_json(&self) -> Result<String, PolicyError> {
        serde_json::to_string(self).map_err(PolicyError::from)
    }

    pub fn from_json(json: &str) -> Result<Self, PolicyError> {
        serde_json::from_str(json).map_err(PolicyError::from)
    }

    /// Base64 of the JSON form, as stored in `encryptionInformation.policy`
    pub fn to_base64(&self) -> Result<String, PolicyError> {
        Ok(BASE64.encode(self.to_json()?))
    }

    pub fn from_base64(encoded: &str) -> Result<Self, PolicyError> {
        let raw = BASE64.decode(encoded)?;
        serde_json::from_slice(&raw).map_err(PolicyError::from)
    }

    /// Attribute FQNs the data is tagged with
    pub fn attribute_fqns(&self) -> Vec<&str> {
        self.body
            .data_attributes
            .iter()
            .map(|a| a.attribute.as_str())
            .collect()
    }
}

impl Default for Policy {
    fn default() -> Self {
        Policy::new(Vec::new(), Vec::new())
    }
}

#[derive(Debug, Default)]
pub struct PolicyBuilder {
    uuid: Option<String>,
    data_attributes: Vec<AttributeObject>,
    dissem: Vec<String>,
}

impl PolicyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a specific UUID for the policy
    #[must_use]
    pub fn id(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    #[must_use]
    pub fn attribute(mut self, attribute: AttributeObject) -> Self {
        self.data_attributes.push(attribute);
        self
    }

    /// Add an attribute value by FQN
    pub fn attribute_fqn(mut self, fqn: impl AsRef<str>) -> Result<Self, PolicyError> {
        let fqn = fqn.as_ref();
        let parsed = url::Url::parse(fqn)
            .map_err(|e| PolicyError::InvalidAttribute(format!("{fqn}: {e}")))?;
        if !matches!(parsed.scheme(), "https" | "http") || !parsed.path().contains("/attr/") {
            return Err(PolicyError::InvalidAttribute(fqn.to_string()));
        }
        self.data_attributes.push(AttributeObject::new(fqn));
        Ok(self)
    }

    /// Add a dissemination target (entity authorized to access)
    #[must_use]
    pub fn dissem(mut self, target: impl Into<String>) -> Self {
        self.dissem.push(target.into());
        self
    }

    #[must_use]
    pub fn dissemination(mut self, targets: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dissem.extend(targets.into_iter().map(|t| t.into()));
        self
    }

    /// Build the Policy, generating a UUID if none was set
    pub fn build(self) -> Policy {
        Policy {
            uuid: self
                .uuid
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            body: PolicyBody {
                data_attributes: self.data_attributes,
                dissem: self.dissem,
            },
        }
    }
}
