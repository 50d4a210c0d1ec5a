//! Assertion signing, verification modes and the validator registry

mod common;

use common::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use ztdf::assertion::AssertionError;
use ztdf::prelude::*;

const SCHEMA: &str = "urn:example:handling:v1";

fn handling(id: &str, value: &str) -> AssertionConfig {
    AssertionConfig::new(
        id,
        AssertionType::Handling,
        Scope::Tdo,
        Statement::new("json", SCHEMA, value),
    )
    .applies_to_state(AppliesToState::Encrypted)
}

/// Create a TDF carrying `assertions` and return it with its DEK
async fn create(assertions: Vec<AssertionConfig>, target: &str) -> (Vec<u8>, Dek) {
    let kas = MockKas::start().await;
    let mut config = TdfConfig::new()
        .kas(kas.kas_info())
        .target_mode(TargetMode::parse(target).unwrap());
    for assertion in assertions {
        config = config.assertion(assertion);
    }
    let bytes = Tdf::encrypt(TEST_PLAINTEXT.to_vec())
        .config(config)
        .to_bytes()
        .await
        .unwrap();
    let (_, manifest) = split_tdf(&bytes);
    let dek = dek_from(&kas, &manifest);
    (bytes, dek)
}

fn mode(mode: AssertionVerificationMode) -> ReaderConfig {
    ReaderConfig::new().assertion_verification_mode(mode)
}

#[tokio::test]
async fn test_dek_signed_assertions_both_targets() {
    for target in ["4.3.0", "v4.2.2"] {
        let (bytes, dek) = create(
            vec![handling("b", r#"{"cls":"SECRET"}"#), handling("a", "plain text")],
            target,
        )
        .await;
        let (_, manifest) = split_tdf(&bytes);
        let ids: Vec<&str> = manifest.assertions.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let config = mode(AssertionVerificationMode::Strict);
        assert_eq!(decrypt_with_dek(bytes, dek, &config).unwrap(), TEST_PLAINTEXT);
    }
}

#[tokio::test]
async fn test_caller_key_verification() {
    let signer = JwsKey::generate_es256();
    let (bytes, dek) = create(
        vec![handling("signed", "{}").signing_key(signer.clone())],
        "4.3.0",
    )
    .await;

    let good = ReaderConfig::new().verification_key("signed", signer);
    assert!(decrypt_with_dek(bytes.clone(), dek.clone(), &good).is_ok());

    let wrong = ReaderConfig::new().default_verification_key(JwsKey::generate_es256());
    assert!(matches!(
        decrypt_with_dek(bytes, dek, &wrong),
        Err(TdfError::Tampered(TamperKind::AssertionSignature))
    ));
}

#[tokio::test]
async fn test_unknown_signer_by_mode() {
    let (bytes, dek) = create(
        vec![handling("foreign", "{}").signing_key(JwsKey::generate_es256())],
        "4.3.0",
    )
    .await;

    for m in [
        AssertionVerificationMode::Permissive,
        AssertionVerificationMode::FailFast,
    ] {
        assert!(decrypt_with_dek(bytes.clone(), dek.clone(), &mode(m)).is_ok());
    }
    assert!(matches!(
        decrypt_with_dek(bytes, dek, &mode(AssertionVerificationMode::Strict)),
        Err(TdfError::Assertion(AssertionError::UnknownSchema { .. }))
    ));
}

#[tokio::test]
async fn test_missing_key_by_mode() {
    let (bytes, dek) = create(
        vec![handling("foreign", "{}").signing_key(JwsKey::generate_es256())],
        "4.3.0",
    )
    .await;
    let keys = AssertionVerificationKeys::new().with_key("other", JwsKey::hs256(b"unused"));

    let fail_fast = ReaderConfig::new().verification_keys(keys.clone());
    let err = decrypt_with_dek(bytes.clone(), dek.clone(), &fail_fast).unwrap_err();
    assert!(matches!(
        &err,
        TdfError::Assertion(AssertionError::MissingKey { id }) if id == "foreign"
    ));
    assert!(err.suggestion().is_some());

    let permissive = fail_fast.assertion_verification_mode(AssertionVerificationMode::Permissive);
    assert!(decrypt_with_dek(bytes, dek, &permissive).is_ok());
}

struct RequireClassification {
    calls: AtomicUsize,
}

impl AssertionValidator for RequireClassification {
    fn verify(
        &self,
        assertion: &Assertion,
        ctx: &VerificationContext<'_>,
    ) -> Result<(), AssertionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        ctx.verify_binding(assertion, &ctx.dek_key())
    }

    fn validate(
        &self,
        assertion: &Assertion,
        _ctx: &VerificationContext<'_>,
    ) -> Result<(), AssertionError> {
        if assertion.statement.value.contains("\"cls\"") {
            Ok(())
        } else {
            Err(AssertionError::Validation {
                id: assertion.id.clone(),
                reason: "no classification".into(),
            })
        }
    }
}

#[tokio::test]
async fn test_custom_validator() {
    let (bytes, dek) = create(
        vec![
            handling("classified", r#"{"cls":"SECRET"}"#),
            handling("unclassified", r#"{"note":"hi"}"#),
        ],
        "4.3.0",
    )
    .await;

    let validator = Arc::new(RequireClassification {
        calls: AtomicUsize::new(0),
    });
    let mut registry = AssertionRegistry::with_defaults();
    registry.register_custom(SCHEMA, validator.clone());

    let strict = mode(AssertionVerificationMode::FailFast).assertion_registry(registry.clone());
    assert!(matches!(
        decrypt_with_dek(bytes.clone(), dek.clone(), &strict),
        Err(TdfError::Assertion(AssertionError::Validation { id, .. })) if id == "unclassified"
    ));
    assert_eq!(validator.calls.load(Ordering::SeqCst), 2);

    let permissive =
        mode(AssertionVerificationMode::Permissive).assertion_registry(registry);
    assert_eq!(
        decrypt_with_dek(bytes, dek, &permissive).unwrap(),
        TEST_PLAINTEXT
    );
    assert_eq!(validator.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_registry_key_and_wildcard() {
    let signer = JwsKey::hs256(b"schema-wide signing secret");
    let (bytes, dek) = create(
        vec![
            handling("one", "{}").signing_key(signer.clone()),
            AssertionConfig::new(
                "two",
                AssertionType::Other,
                Scope::Payload,
                Statement::new("text", "urn:example:other", "note"),
            )
            .signing_key(signer.clone()),
        ],
        "4.3.0",
    )
    .await;

    let mut registry = AssertionRegistry::new();
    registry.register_key(SCHEMA, signer.clone());
    let config = ReaderConfig::new().assertion_registry(registry.clone());
    // "two" is HS256 but not DEK-signed, so it fails without a wildcard entry.
    assert!(matches!(
        decrypt_with_dek(bytes.clone(), dek.clone(), &config),
        Err(TdfError::Tampered(TamperKind::AssertionSignature))
    ));

    registry.register_key("*", signer);
    let config = ReaderConfig::new().assertion_registry(registry);
    assert!(decrypt_with_dek(bytes, dek, &config).is_ok());
}

#[tokio::test]
async fn test_unsupported_signing_alg() {
    let kas = MockKas::start().await;
    let config = TdfConfig::new()
        .kas(kas.kas_info())
        .assertion(handling("bad", "{}").signing_key(JwsKey::new(
            "none",
            ztdf::crypto::KeyMaterial::Hmac(zeroize::Zeroizing::new(vec![1u8; 32])),
        )));
    let err = Tdf::encrypt(TEST_PLAINTEXT.to_vec())
        .config(config)
        .to_bytes()
        .await
        .unwrap_err();
    assert!(matches!(err, TdfError::UnsupportedAlg(_)));
}

#[test]
fn test_hash_ignores_key_order() {
    let a: Assertion = serde_json::from_str(
        r#"{"id":"x","type":"handling","scope":"tdo","appliesToState":"encrypted",
            "statement":{"format":"json","schema":"s","value":{"b":2,"a":{"d":1,"c":[1,2]}}}}"#,
    )
    .unwrap();
    let b: Assertion = serde_json::from_str(
        r#"{"statement":{"value":{"a":{"c":[1,2],"d":1},"b":2},"schema":"s","format":"json"},
            "appliesToState":"encrypted","scope":"tdo","type":"handling","id":"x"}"#,
    )
    .unwrap();
    assert_eq!(a.hash().unwrap(), b.hash().unwrap());
}
