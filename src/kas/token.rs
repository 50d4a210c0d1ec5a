//! Access tokens and DPoP proofs for KAS requests
//!
//! Obtaining the bearer token is the caller's business. The source also owns
//! the DPoP key, which signs both the proof header and the rewrap request
//! token so the KAS can bind the two together.

use super::KasError;
use crate::crypto::JwsKey;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

/// Supplies the bearer token and DPoP key for KAS calls
pub trait AccessTokenSource: Send + Sync {
    fn access_token(&self) -> Result<String, KasError>;

    fn dpop_key(&self) -> &JwsKey;

    /// DPoP proof JWT for one request
    fn dpop_proof(&self, method: &str, url: &str, access_token: &str) -> Result<String, KasError> {
        let key = self.dpop_key();
        let jwk = key.public_jwk()?;

        let mut headers = Map::new();
        headers.insert("typ".to_string(), json!("dpop+jwt"));
        headers.insert("jwk".to_string(), jwk);

        let claims = json!({
            "htm": method,
            "htu": url,
            "iat": chrono::Utc::now().timestamp(),
            "jti": uuid::Uuid::new_v4().to_string(),
            "ath": URL_SAFE_NO_PAD.encode(Sha256::digest(access_token.as_bytes())),
        });
        Ok(key.sign_with_headers(&headers, &claims)?)
    }
}

/// A fixed bearer token plus a DPoP key
#[derive(Clone)]
pub struct StaticTokenSource {
    token: String,
    dpop_key: JwsKey,
}

impl fmt::Debug for StaticTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticTokenSource")
            .field("dpop_alg", &self.dpop_key.alg())
            .finish_non_exhaustive()
    }
}

impl StaticTokenSource {
    pub fn new(token: impl Into<String>, dpop_key: JwsKey) -> Self {
        StaticTokenSource {
            token: token.into(),
            dpop_key,
        }
    }

    /// Use a freshly generated ES256 DPoP key
    pub fn with_generated_key(token: impl Into<String>) -> Self {
        Self::new(token, JwsKey::generate_es256())
    }
}

impl AccessTokenSource for StaticTokenSource {
    fn access_token(&self) -> Result<String, KasError> {
        if self.token.is_empty() {
            return Err(KasError::Token("access token is empty".into()));
        }
        Ok(self.token.clone())
    }

    fn dpop_key(&self) -> &JwsKey {
        &self.dpop_key
    }
}

/// Signed request token carrying `request_body` as a string claim
pub(crate) fn signed_request_token(
    key: &JwsKey,
    request_body: &str,
) -> Result<String, KasError> {
    let now = chrono::Utc::now().timestamp();
    let claims: Value = json!({
        "requestBody": request_body,
        "iat": now,
        "exp": now + 60,
    });
    Ok(key.sign(&claims)?)
}
