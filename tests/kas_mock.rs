//! Mock KAS tests covering the client side of the rewrap protocol

mod common;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use common::*;
use mockito::Matcher;
use serde_json::json;
use std::io::Cursor;
use ztdf::crypto::{EcCurve, EcPrivateKey};
use ztdf::kas::KasError;
use ztdf::prelude::*;

async fn sealed(kas: &MockKas) -> (Vec<u8>, Manifest) {
    let bytes = Tdf::encrypt(TEST_PLAINTEXT.to_vec())
        .config(TdfConfig::new().kas(kas.kas_info()))
        .to_bytes()
        .await
        .unwrap();
    let manifest = TdfReader::new(Cursor::new(bytes.clone()))
        .unwrap()
        .manifest()
        .clone();
    (bytes, manifest)
}

fn missing_split_reasons(err: TdfError) -> Vec<String> {
    match err {
        TdfError::KasFailure(KasError::MissingSplits { reasons, .. }) => reasons,
        other => panic!("expected a missing split, got {other:?}"),
    }
}

#[tokio::test]
async fn test_rewrap_request_is_signed_jws() {
    let mut kas = MockKas::start().await;
    let (bytes, manifest) = sealed(&kas).await;
    let (session, config) = session_config(&[&kas]);

    let mock = kas
        .server
        .mock("POST", "/v2/rewrap")
        .match_header("content-type", "application/json")
        .match_header("authorization", "Bearer test-token")
        .match_body(Matcher::Regex(
            r#"^\{"signedRequestToken":"[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+"\}$"#.into(),
        ))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(kas.permit_body(&manifest, &session))
        .expect(1)
        .create_async()
        .await;

    let mut reader = TdfReader::new(Cursor::new(bytes)).unwrap();
    reader.unlock(&kas_client(), &config).await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn test_v1_response_is_upgraded() {
    let mut kas = MockKas::start().await;
    let (bytes, manifest) = sealed(&kas).await;
    let (session, config) = session_config(&[&kas]);

    // Reshape a v2 grant into the single-key v1 form.
    let v2: serde_json::Value = serde_json::from_str(&kas.permit_body(&manifest, &session)).unwrap();
    let body = json!({
        "entityWrappedKey": v2["responses"][0]["results"][0]["kasWrappedKey"],
        "sessionPublicKey": v2["sessionPublicKey"],
    });
    let _mock = kas.mock_rewrap(200, body.to_string()).await;

    let plaintext = Tdf::decrypt(bytes)
        .kas_client(kas_client())
        .config(config)
        .to_bytes()
        .await
        .unwrap();
    assert_eq!(plaintext, TEST_PLAINTEXT);
}

#[tokio::test]
async fn test_unauthorized() {
    let mut kas = MockKas::start().await;
    let (bytes, _) = sealed(&kas).await;
    let (_, config) = session_config(&[&kas]);
    let _mock = kas
        .mock_rewrap(401, r#"{"error":"Unauthorized"}"#.into())
        .await;

    let err = Tdf::decrypt(bytes)
        .kas_client(kas_client())
        .config(config)
        .to_bytes()
        .await
        .unwrap_err();
    assert!(err.is_kas_error());
    let reasons = missing_split_reasons(err);
    assert_eq!(reasons.len(), 1);
    assert!(reasons[0].starts_with("kao-0"));
    assert!(reasons[0].contains("access token"));
}

#[tokio::test]
async fn test_denied_object() {
    let mut kas = MockKas::start().await;
    let (bytes, manifest) = sealed(&kas).await;
    let (_, config) = session_config(&[&kas]);
    let _mock = kas.mock_rewrap(200, kas.deny_body(&manifest)).await;

    let err = Tdf::decrypt(bytes)
        .kas_client(kas_client())
        .config(config)
        .to_bytes()
        .await
        .unwrap_err();
    let reasons = missing_split_reasons(err);
    assert!(reasons[0].contains("forbidden"));
}

#[tokio::test]
async fn test_session_curve_mismatch() {
    let mut kas = MockKas::start().await;
    let (bytes, manifest) = sealed(&kas).await;
    let (_, config) = session_config(&[&kas]);

    // Wrapped for a P-384 session the client never offered.
    let stranger = EcPrivateKey::generate(EcCurve::P384);
    let _mock = kas
        .mock_rewrap(200, kas.permit_body(&manifest, &stranger))
        .await;

    let err = Tdf::decrypt(bytes)
        .kas_client(kas_client())
        .config(config)
        .to_bytes()
        .await
        .unwrap_err();
    let reasons = missing_split_reasons(err);
    assert!(reasons[0].contains("P-384") || reasons[0].contains("session public key"));
}

#[tokio::test]
async fn test_garbled_wrapped_key() {
    let mut kas = MockKas::start().await;
    let (bytes, _) = sealed(&kas).await;
    let (session, config) = session_config(&[&kas]);
    let body = json!({
        "responses": [{"policyId": "policy", "results": [{
            "keyAccessObjectId": "kao-0",
            "status": "permit",
            "kasWrappedKey": BASE64.encode([0u8; 60]),
        }]}],
        "sessionPublicKey": session.public_key_pem().unwrap(),
    });
    let _mock = kas.mock_rewrap(200, body.to_string()).await;

    let err = Tdf::decrypt(bytes)
        .kas_client(kas_client())
        .config(config)
        .to_bytes()
        .await
        .unwrap_err();
    assert!(matches!(err, TdfError::KasFailure(_)));
}

#[tokio::test]
async fn test_public_key_endpoint() {
    let mut kas = MockKas::start().await;
    let pem = kas.public_key_pem();
    let _ok = kas
        .server
        .mock("GET", "/v2/kas_public_key")
        .match_query(Matcher::UrlEncoded("algorithm".into(), "ec:secp256r1".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!({"publicKey": pem, "kid": "e1"}).to_string())
        .create_async()
        .await;
    let _empty = kas
        .server
        .mock("GET", "/v2/kas_public_key")
        .match_query(Matcher::UrlEncoded("algorithm".into(), "rsa:2048".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"publicKey":""}"#)
        .create_async()
        .await;

    let client = kas_client();
    let timeout = std::time::Duration::from_secs(5);
    let key = client
        .public_key(&kas.url(), "ec:secp256r1", timeout)
        .await
        .unwrap();
    assert_eq!(key.pem, pem);
    assert_eq!(key.kid.as_deref(), Some("e1"));
    assert!(client.key_cache().get(&kas.url(), "ec:secp256r1").is_some());

    assert!(matches!(
        client.public_key(&kas.url(), "rsa:2048", timeout).await,
        Err(KasError::InvalidResponse(_))
    ));
}

#[tokio::test]
async fn test_public_key_fetch_honours_timeout() {
    // Accepts connections but never answers.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stall = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let timeout = std::time::Duration::from_millis(200);
    let config = TdfConfig::new()
        .kas(KasInfo::new(format!("http://{addr}")).with_algorithm("ec:secp256r1"))
        .kas_timeout(timeout);
    let started = std::time::Instant::now();
    let err = Tdf::encrypt(TEST_PLAINTEXT.to_vec())
        .config(config)
        .kas_client(kas_client())
        .to_bytes()
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TdfError::KasFailure(KasError::Timeout(t)) if t == timeout
    ));
    assert!(started.elapsed() < std::time::Duration::from_secs(10));
    stall.abort();
}
