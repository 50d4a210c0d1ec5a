//! HTTP client for the KAS v2 endpoints
//!
//! # Example
//!
//! ```no_run
//! use ztdf::kas::KasClient;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = KasClient::with_token("oauth_token_here")?;
//! let key = client
//!     .public_key("https://kas.example.com", "rsa:2048", Duration::from_secs(30))
//!     .await?;
//! println!("kid = {:?}", key.kid);
//! # Ok(())
//! # }
//! ```

use super::key_cache::KasKeyCache;
use super::protocol::{RewrapResponse, SignedRewrapRequest, UnsignedRewrapRequest};
use super::token::{signed_request_token, AccessTokenSource, StaticTokenSource};
use super::KasError;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A KAS public key as returned by `/v2/kas_public_key`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KasPublicKey {
    pub url: String,
    pub algorithm: String,
    pub kid: Option<String>,
    /// SPKI PEM
    pub pem: String,
}

#[derive(Debug, Deserialize)]
struct KasPublicKeyResponse {
    #[serde(rename = "publicKey")]
    public_key: String,
    #[serde(default)]
    kid: Option<String>,
}

/// KAS client for the rewrap protocol
///
/// Cloning is cheap; clones share the HTTP connection pool, the token
/// source and the public key cache.
#[derive(Clone)]
pub struct KasClient {
    http: Client,
    tokens: Arc<dyn AccessTokenSource>,
    cache: KasKeyCache,
}

impl fmt::Debug for KasClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KasClient")
            .field("cached_keys", &self.cache.len())
            .finish_non_exhaustive()
    }
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

impl KasClient {
    pub fn new(tokens: Arc<dyn AccessTokenSource>) -> Result<Self, KasError> {
        let http = Client::builder()
            .build()
            .map_err(|e| KasError::Transport(e.to_string()))?;
        Ok(KasClient {
            http,
            tokens,
            cache: KasKeyCache::new(),
        })
    }

    /// Client with a fixed bearer token and a generated DPoP key
    pub fn with_token(token: impl Into<String>) -> Result<Self, KasError> {
        Self::new(Arc::new(StaticTokenSource::with_generated_key(token)))
    }

    #[must_use]
    pub fn with_http_client(mut self, http: Client) -> Self {
        self.http = http;
        self
    }

    /// Share a public key cache with other clients
    #[must_use]
    pub fn with_key_cache(mut self, cache: KasKeyCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn key_cache(&self) -> &KasKeyCache {
        &self.cache
    }

    async fn send(
        &self,
        request: RequestBuilder,
        method: &str,
        url: &str,
        timeout: Duration,
    ) -> Result<Response, KasError> {
        let token = self.tokens.access_token()?;
        let proof = self.tokens.dpop_proof(method, url, &token)?;
        let response = request
            .bearer_auth(&token)
            .header("DPoP", proof)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(e, timeout))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        debug!(kas_url = url, status = status.as_u16(), "KAS request failed");
        Err(match status {
            StatusCode::BAD_REQUEST => KasError::BadRequest(body),
            StatusCode::UNAUTHORIZED => KasError::Unauthorized,
            StatusCode::FORBIDDEN => KasError::Forbidden(body),
            _ => KasError::Http {
                status: status.as_u16(),
                body,
            },
        })
    }

    /// Fetch the KAS public key for `algorithm`, consulting the cache first
    pub async fn public_key(
        &self,
        kas_url: &str,
        algorithm: &str,
        timeout: Duration,
    ) -> Result<KasPublicKey, KasError> {
        if let Some(key) = self.cache.get(kas_url, algorithm) {
            debug!(kas_url, algorithm, "KAS public key cache hit");
            return Ok(key);
        }

        let url = endpoint(kas_url, "v2/kas_public_key");
        let request = self.http.get(&url).query(&[("algorithm", algorithm)]);
        let response = self.send(request, "GET", &url, timeout).await?;
        let body: KasPublicKeyResponse = response
            .json()
            .await
            .map_err(|e| KasError::InvalidResponse(e.to_string()))?;
        if body.public_key.trim().is_empty() {
            return Err(KasError::InvalidResponse("empty publicKey".into()));
        }

        let key = KasPublicKey {
            url: kas_url.to_string(),
            algorithm: algorithm.to_string(),
            kid: body.kid.filter(|k| !k.is_empty()),
            pem: body.public_key,
        };
        self.cache.insert(key.clone());
        debug!(kas_url, algorithm, kid = ?key.kid, "fetched KAS public key");
        Ok(key)
    }

    /// POST one signed rewrap request to `{kas_url}/v2/rewrap`
    pub async fn rewrap(
        &self,
        kas_url: &str,
        request: &UnsignedRewrapRequest,
        timeout: Duration,
    ) -> Result<RewrapResponse, KasError> {
        let body = serde_json::to_string(request)?;
        let signed = SignedRewrapRequest {
            signed_request_token: signed_request_token(self.tokens.dpop_key(), &body)?,
        };

        let url = endpoint(kas_url, "v2/rewrap");
        let objects: usize = request
            .requests
            .iter()
            .map(|r| r.key_access_objects.len())
            .sum();
        debug!(kas_url, objects, "sending rewrap request");

        let http_request = self.http.post(&url).json(&signed);
        let response = self.send(http_request, "POST", &url, timeout).await?;
        response
            .json()
            .await
            .map_err(|e| KasError::InvalidResponse(e.to_string()))
    }
}

fn transport_error(err: reqwest::Error, timeout: Duration) -> KasError {
    if err.is_timeout() {
        KasError::Timeout(timeout)
    } else {
        KasError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kas::protocol::{PolicyRequest, RequestPolicy};
    use mockito::{Matcher, Server};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn request() -> UnsignedRewrapRequest {
        UnsignedRewrapRequest {
            client_public_key: "pem".into(),
            requests: vec![PolicyRequest {
                algorithm: None,
                policy: RequestPolicy {
                    id: "policy".into(),
                    body: "e30=".into(),
                },
                key_access_objects: vec![],
            }],
        }
    }

    #[test]
    fn test_endpoint_join() {
        assert_eq!(endpoint("http://a/kas/", "v2/rewrap"), "http://a/kas/v2/rewrap");
        assert_eq!(endpoint("http://a", "v2/rewrap"), "http://a/v2/rewrap");
    }

    #[tokio::test]
    async fn test_public_key_fetched_once() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/v2/kas_public_key")
            .match_query(Matcher::UrlEncoded("algorithm".into(), "ec:secp256r1".into()))
            .match_header("authorization", "Bearer token")
            .match_header("dpop", Matcher::Regex("^eyJ".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"publicKey":"-----BEGIN PUBLIC KEY-----","kid":"e1"}"#)
            .expect(1)
            .create_async()
            .await;

        let client = KasClient::with_token("token").unwrap();
        let first = client
            .public_key(&server.url(), "ec:secp256r1", TIMEOUT)
            .await
            .unwrap();
        let second = client
            .public_key(&server.url(), "ec:secp256r1", TIMEOUT)
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(first, second);
        assert_eq!(first.kid.as_deref(), Some("e1"));
    }

    #[tokio::test]
    async fn test_rewrap_status_mapping() {
        let client = KasClient::with_token("token").unwrap();

        for (status, body) in [(400, "bad"), (401, "who"), (403, "no"), (503, "busy")] {
            let mut server = Server::new_async().await;
            let _mock = server
                .mock("POST", "/v2/rewrap")
                .with_status(status)
                .with_body(body)
                .create_async()
                .await;
            let err = client
                .rewrap(&server.url(), &request(), TIMEOUT)
                .await
                .unwrap_err();
            match status {
                400 => assert!(matches!(err, KasError::BadRequest(ref b) if b == "bad")),
                401 => assert!(matches!(err, KasError::Unauthorized)),
                403 => assert!(matches!(err, KasError::Forbidden(ref b) if b == "no")),
                _ => assert!(err.is_retryable()),
            }
        }
    }

    #[tokio::test]
    async fn test_rewrap_sends_signed_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/kas/v2/rewrap")
            .match_header("authorization", "Bearer token")
            .match_body(Matcher::Regex(r#""signedRequestToken":"eyJ"#.into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"responses":[]}"#)
            .create_async()
            .await;

        let client = KasClient::with_token("token").unwrap();
        let response = client
            .rewrap(&format!("{}/kas", server.url()), &request(), TIMEOUT)
            .await
            .unwrap();
        mock.assert_async().await;
        assert!(response.responses.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_is_transport() {
        let client = KasClient::with_token("token").unwrap();
        let err = client
            .rewrap("http://127.0.0.1:1", &request(), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, KasError::Transport(_) | KasError::Timeout(_)));
        assert!(err.is_retryable());
    }
}
