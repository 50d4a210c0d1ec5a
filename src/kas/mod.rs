//! KAS (Key Access Service) client
//!
//! Everything the reader needs to turn the key access objects of a manifest
//! back into a DEK:
//!
//! - [`protocol`]: the v2 rewrap request and response bodies
//! - [`client`]: the HTTP client (`/v2/rewrap`, `/v2/kas_public_key`)
//! - [`session`]: the ephemeral key the KAS rewraps fragments for
//! - [`token`]: bearer tokens and DPoP proofs
//! - [`allowlist`]: URL normalization and the reader allowlist
//! - [`key_cache`]: the process-wide KAS public key cache
//! - [`rewrap`]: fan-out over every KAS in a manifest and split recombination

pub mod allowlist;
pub mod client;
pub mod key_cache;
pub mod protocol;
pub mod rewrap;
pub mod session;
pub mod token;

pub use allowlist::{normalize_kas_url, KasAllowlist};
pub use client::{KasClient, KasPublicKey};
pub use key_cache::KasKeyCache;
pub use rewrap::UnwrappedKey;
pub use session::{SessionKey, SessionKeyType};
pub use token::{AccessTokenSource, StaticTokenSource};

use crate::crypto::{CryptoError, KemError};
use std::time::Duration;
use thiserror::Error;

/// KAS client errors
#[derive(Debug, Error)]
pub enum KasError {
    #[error("KAS request failed: {0}")]
    Transport(String),

    #[error("KAS request timed out after {0:?}")]
    Timeout(Duration),

    #[error("KAS rejected the access token")]
    Unauthorized,

    #[error("KAS denied access: {0}")]
    Forbidden(String),

    #[error("KAS rejected the request: {0}")]
    BadRequest(String),

    #[error("KAS returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Invalid response from KAS: {0}")]
    InvalidResponse(String),

    #[error("KAS denied key access object {kao_id}: {reason}")]
    Denied { kao_id: String, reason: String },

    #[error("Invalid KAS URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Access token error: {0}")]
    Token(String),

    #[error("No key access object could be unwrapped for split(s) {splits:?}: {}", reasons.join("; "))]
    MissingSplits {
        splits: Vec<String>,
        reasons: Vec<String>,
    },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Kem(#[from] KemError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KasError {
    /// Returns true if this error might be resolved by retrying the operation
    pub fn is_retryable(&self) -> bool {
        match self {
            KasError::Transport(_) | KasError::Timeout(_) => true,
            KasError::Http { status, .. } => (500..600).contains(status),
            _ => false,
        }
    }

    /// Returns a suggestion for how to fix this error, if available
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            KasError::Unauthorized => Some("Verify the access token is valid and not expired"),
            KasError::Forbidden(_) | KasError::Denied { .. } => {
                Some("Check that the caller is entitled to the attributes in the policy")
            }
            KasError::Timeout(_) => {
                Some("Check network connectivity or increase ReaderConfig::kas_timeout")
            }
            KasError::InvalidResponse(_) => Some("Verify KAS server version compatibility"),
            KasError::InvalidUrl { .. } => Some("Use a URL of the form scheme://host[:port]"),
            KasError::MissingSplits { .. } => {
                Some("Every split needs at least one reachable KAS that grants access")
            }
            _ => None,
        }
    }
}
