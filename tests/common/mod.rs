//! Shared helpers for the integration tests
//!
//! [`MockKas`] plays the KAS side of the protocol on top of a mockito
//! server: it holds the KAS private key, so a test can compute the exact
//! rewrap response for a manifest before registering the mock.

#![allow(dead_code)]

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use mockito::{Mock, Server, ServerGuard};
use serde_json::json;
use std::io::Cursor;
use ztdf::archive::{TdfArchive, ZipWriter, MANIFEST_MEMBER, PAYLOAD_MEMBER};
use ztdf::crypto::kem::ec::{derive_wrap_key, EcWrappedKey, EcdhKem};
use ztdf::crypto::kem::KeyEncapsulation;
use ztdf::crypto::{aes_gcm_encrypt, EcCurve, EcPrivateKey, KeyFragment};
use ztdf::kas::session::{session_salt, SessionKey};
use ztdf::prelude::*;

pub const TEST_PLAINTEXT: &[u8] = b"Hello, TDF! This is test data for encryption.";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A KAS with an EC P-256 key behind a mockito server
pub struct MockKas {
    pub server: ServerGuard,
    pub key: EcPrivateKey,
}

impl MockKas {
    pub async fn start() -> Self {
        MockKas {
            server: Server::new_async().await,
            key: EcPrivateKey::generate(EcCurve::P256),
        }
    }

    pub fn url(&self) -> String {
        self.server.url()
    }

    pub fn public_key_pem(&self) -> String {
        self.key.public_key_pem().unwrap()
    }

    /// Writer-side description of this KAS, public key included
    pub fn kas_info(&self) -> KasInfo {
        KasInfo::new(self.url())
            .with_algorithm("ec:secp256r1")
            .with_public_key(self.public_key_pem())
    }

    /// Recover the split fragment wrapped in `kao`
    pub fn unwrap_kao(&self, kao: &KeyAccess) -> KeyFragment {
        let wrapped = EcWrappedKey {
            ephemeral_public_key: kao.ephemeral_public_key.clone().unwrap(),
            wrapped: BASE64.decode(&kao.wrapped_key).unwrap(),
        };
        let plain = EcdhKem::default().unwrap(&wrapped, &self.key).unwrap();
        KeyFragment::from_slice(&plain).unwrap()
    }

    /// Rewrap response granting every object of `manifest` that names this KAS
    pub fn permit_body(&self, manifest: &Manifest, session: &EcPrivateKey) -> String {
        let client_pem = session.public_key_pem().unwrap();
        let kas_session = EcPrivateKey::generate(session.curve());
        let shared = kas_session.diffie_hellman(&client_pem).unwrap();
        let wrap_key = derive_wrap_key(&shared, &session_salt()).unwrap();

        let results: Vec<_> = self
            .own_objects(manifest)
            .map(|(index, kao)| {
                let fragment = self.unwrap_kao(kao);
                let sealed = aes_gcm_encrypt(wrap_key.as_ref(), fragment.as_slice()).unwrap();
                json!({
                    "keyAccessObjectId": format!("kao-{index}"),
                    "status": "permit",
                    "kasWrappedKey": BASE64.encode(sealed),
                })
            })
            .collect();

        json!({
            "responses": [{"policyId": "policy", "results": results}],
            "sessionPublicKey": kas_session.public_key_pem().unwrap(),
        })
        .to_string()
    }

    /// Rewrap response denying every object of `manifest` that names this KAS
    pub fn deny_body(&self, manifest: &Manifest) -> String {
        let results: Vec<_> = self
            .own_objects(manifest)
            .map(|(index, _)| {
                json!({
                    "keyAccessObjectId": format!("kao-{index}"),
                    "status": "fail",
                    "error": "forbidden",
                })
            })
            .collect();
        json!({"responses": [{"policyId": "policy", "results": results}]}).to_string()
    }

    pub async fn mock_rewrap(&mut self, status: usize, body: String) -> Mock {
        self.server
            .mock("POST", "/v2/rewrap")
            .match_header("authorization", "Bearer test-token")
            .match_header("dpop", mockito::Matcher::Any)
            .match_body(mockito::Matcher::Regex(r#""signedRequestToken":"ey"#.into()))
            .with_status(status)
            .with_header("content-type", "application/json")
            .with_body(body)
            .create_async()
            .await
    }

    fn own_objects<'a>(
        &'a self,
        manifest: &'a Manifest,
    ) -> impl Iterator<Item = (usize, &'a KeyAccess)> + 'a {
        let url = self.url();
        manifest
            .key_access()
            .iter()
            .enumerate()
            .filter(move |(_, kao)| kao.url == url)
    }
}

pub fn kas_client() -> KasClient {
    KasClient::with_token("test-token").unwrap()
}

/// An EC session key and a reader configuration that uses it
pub fn session_config(allow: &[&MockKas]) -> (EcPrivateKey, ReaderConfig) {
    let session = EcPrivateKey::generate(EcCurve::P256);
    let config = ReaderConfig::new()
        .kas_allowlist(allow.iter().map(|kas| kas.url()))
        .session_key(SessionKey::Ec(session.clone()));
    (session, config)
}

/// Recombine the DEK of a single-KAS TDF without going through HTTP
pub fn dek_from(kas: &MockKas, manifest: &Manifest) -> Dek {
    let mut dek = Dek::from_slice(&[0u8; 32]).unwrap();
    let mut seen: Vec<&str> = Vec::new();
    for kao in manifest.key_access() {
        if seen.contains(&kao.split_id.as_str()) {
            continue;
        }
        seen.push(&kao.split_id);
        dek.xor_in(&kas.unwrap_kao(kao));
    }
    dek
}

/// Open and unlock `bytes` with a known DEK, returning the plaintext
pub fn decrypt_with_dek(
    bytes: Vec<u8>,
    dek: Dek,
    config: &ReaderConfig,
) -> Result<Vec<u8>, TdfError> {
    let mut reader = TdfReader::new(Cursor::new(bytes))?;
    reader.unlock_with_key(dek, config)?;
    let mut out = Vec::new();
    reader.write_to(&mut out)?;
    Ok(out)
}

/// Payload bytes and manifest of a TDF
pub fn split_tdf(bytes: &[u8]) -> (Vec<u8>, Manifest) {
    let mut archive = TdfArchive::open(Cursor::new(bytes.to_vec())).unwrap();
    let manifest = Manifest::from_json(archive.manifest_bytes()).unwrap();
    let mut payload = vec![0u8; archive.payload_len() as usize];
    archive.read_payload_at(0, &mut payload).unwrap();
    (payload, manifest)
}

/// Re-pack a TDF after editing its payload or manifest
///
/// The archive itself stays well formed, so only the TDF integrity checks
/// can notice the edit.
pub fn rebuild_tdf(
    bytes: &[u8],
    edit_payload: impl FnOnce(&mut Vec<u8>),
    edit_manifest: impl FnOnce(&mut Manifest),
) -> Vec<u8> {
    let (mut payload, mut manifest) = split_tdf(bytes);
    edit_payload(&mut payload);
    edit_manifest(&mut manifest);
    repack(&payload, &manifest.to_json().unwrap())
}

/// Re-pack a TDF after editing the raw manifest JSON
pub fn rebuild_tdf_json(bytes: &[u8], edit: impl FnOnce(&mut serde_json::Value)) -> Vec<u8> {
    let (payload, manifest) = split_tdf(bytes);
    let mut json = serde_json::to_value(&manifest).unwrap();
    edit(&mut json);
    repack(&payload, &json.to_string())
}

fn repack(payload: &[u8], manifest_json: &str) -> Vec<u8> {
    let mut zip = ZipWriter::new(Vec::new(), Zip64Mode::Auto);
    zip.start_entry(PAYLOAD_MEMBER, Some(payload.len() as u64))
        .unwrap();
    zip.write_data(payload).unwrap();
    zip.finish_entry().unwrap();
    zip.add_entry(MANIFEST_MEMBER, manifest_json.as_bytes())
        .unwrap();
    zip.finish().unwrap()
}
