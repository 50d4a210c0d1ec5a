//! High-level TDF API
//!
//! [`Tdf`] wraps the streaming [`TdfWriter`] and [`TdfReader`] in builders
//! for the common whole-buffer and whole-file cases. Callers that need to
//! stream or seek use [`encrypt`] and [`TdfReader`] directly.
//!
//! # Examples
//!
//! ```no_run
//! use ztdf::{KasClient, KasInfo, ReaderConfig, Tdf, TdfConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let kas = KasClient::with_token("access-token")?;
//! let config = TdfConfig::new().kas(KasInfo::new("https://kas.example.com"));
//!
//! let tdf = Tdf::encrypt(b"Hello, TDF!".to_vec())
//!     .config(config)
//!     .kas_client(kas.clone())
//!     .to_bytes()
//!     .await?;
//!
//! let plaintext = Tdf::decrypt(tdf)
//!     .kas_client(kas)
//!     .config(ReaderConfig::new().kas_allowlist(["https://kas.example.com"]))
//!     .to_bytes()
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::archive::PAYLOAD_MEMBER;
use crate::assertion::{sign_assertions, system_metadata_assertion};
use crate::config::{ReaderConfig, TdfConfig};
use crate::crypto::Dek;
use crate::error::TdfError;
use crate::kas::KasClient;
use crate::key_access::wrap_dek;
use crate::manifest::{
    EncryptionInformation, EncryptionMethod, Manifest, Payload, AES_256_GCM,
};
use crate::policy::Policy;
use crate::segment::{TdfReader, TdfWriter};
use serde_json::Map;
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Encrypt `input` into a TDF written to `output`
///
/// Every configured KAS must already carry a public key; see
/// [`Tdf::encrypt`] for fetching them. `size_hint` is the plaintext length
/// when known and only affects ZIP64 selection.
pub fn encrypt<R: Read, W: Write>(
    config: &TdfConfig,
    input: R,
    output: W,
    size_hint: Option<u64>,
) -> Result<(W, Manifest), TdfError> {
    encrypt_with_dek(config, Dek::generate(), input, output, size_hint)
}

pub(crate) fn encrypt_with_dek<R: Read, W: Write>(
    config: &TdfConfig,
    dek: Dek,
    input: R,
    output: W,
    size_hint: Option<u64>,
) -> Result<(W, Manifest), TdfError> {
    let plan = config.resolve_split_plan()?;
    let policy_b64 = config.policy.to_base64()?;
    let key_access = wrap_dek(&dek, &plan, config, &policy_b64)?;

    let mut writer = TdfWriter::new(output, dek.clone(), config, size_hint)?;
    writer.copy_from(input)?;
    let sealed = writer.seal()?;

    let mut configs = config.assertions.clone();
    if config.system_metadata_assertion {
        configs.push(system_metadata_assertion()?);
    }
    let assertions = sign_assertions(
        &configs,
        &dek,
        sealed.aggregate_hash(),
        config.target_mode.use_hex(),
    )?;

    let manifest = Manifest {
        payload: Payload {
            payload_type: "reference".to_string(),
            url: PAYLOAD_MEMBER.to_string(),
            protocol: "zip".to_string(),
            mime_type: config.mime_type.clone(),
            is_encrypted: true,
            extra: Map::new(),
        },
        encryption_information: EncryptionInformation {
            encryption_type: "split".to_string(),
            policy: policy_b64,
            key_access,
            method: EncryptionMethod {
                algorithm: AES_256_GCM.to_string(),
                iv: String::new(),
                is_streamable: true,
            },
            integrity_information: sealed.integrity_information().clone(),
            extra: Map::new(),
        },
        assertions,
        tdf_version: config.target_mode.manifest_version().to_string(),
        extra: Map::new(),
    };

    info!(
        segments = manifest.integrity().segments.len(),
        plaintext_size = sealed.plaintext_size(),
        key_access = manifest.key_access().len(),
        assertions = manifest.assertions.len(),
        "created TDF"
    );
    let output = sealed.finish(&manifest)?;
    Ok((output, manifest))
}

/// Fill in missing KAS public keys from the KAS itself
async fn fetch_public_keys(config: &mut TdfConfig, kas: Option<&KasClient>) -> Result<(), TdfError> {
    let missing: Vec<(String, String)> = config
        .kas
        .iter()
        .filter(|k| k.public_key.is_none())
        .map(|k| (k.url.clone(), k.algorithm.clone()))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    let kas = kas.ok_or_else(|| {
        TdfError::InvalidArgument(format!(
            "no public key for KAS {} and no KAS client to fetch it",
            missing[0].0
        ))
    })?;

    let timeout = config.kas_timeout;
    for (url, algorithm) in missing {
        let key = kas.public_key(&url, &algorithm, timeout).await?;
        if let Some(info) = config.kas_info_mut(&url) {
            info.public_key = Some(key.pem);
            if info.kid.is_none() {
                info.kid = key.kid;
            }
        }
    }
    Ok(())
}

/// Write to a temporary file beside `path` and move it into place on success
fn write_file_atomically<F>(path: &Path, write: F) -> Result<(), TdfError>
where
    F: FnOnce(&mut BufWriter<&mut tempfile::NamedTempFile>) -> Result<(), TdfError>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut out = BufWriter::new(&mut tmp);
        write(&mut out)?;
        out.flush()?;
    }
    tmp.persist(path).map_err(|e| TdfError::Io(e.error))?;
    debug!(path = %path.display(), "persisted TDF output");
    Ok(())
}

/// Main entry point for TDF operations
pub struct Tdf;

impl Tdf {
    /// Encrypt an in-memory buffer
    pub fn encrypt(data: impl Into<Vec<u8>>) -> TdfEncryptBuilder {
        TdfEncryptBuilder::new(data.into())
    }

    /// Encrypt a file into another file
    pub fn encrypt_file(input: impl AsRef<Path>, output: impl AsRef<Path>) -> TdfEncryptFileBuilder {
        TdfEncryptFileBuilder::new(input.as_ref().to_path_buf(), output.as_ref().to_path_buf())
    }

    /// Decrypt an in-memory TDF
    pub fn decrypt(data: impl Into<Vec<u8>>) -> TdfDecryptBuilder {
        TdfDecryptBuilder::new(data.into())
    }

    /// Decrypt a TDF file
    pub fn decrypt_file(path: impl AsRef<Path>) -> TdfDecryptFileBuilder {
        TdfDecryptFileBuilder::new(path.as_ref().to_path_buf())
    }
}

/// Builder for encrypting data to TDF format
pub struct TdfEncryptBuilder {
    data: Vec<u8>,
    config: TdfConfig,
    kas_client: Option<KasClient>,
}

impl TdfEncryptBuilder {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            config: TdfConfig::new(),
            kas_client: None,
        }
    }

    /// Replace the whole create configuration
    #[must_use]
    pub fn config(mut self, config: TdfConfig) -> Self {
        self.config = config;
        self
    }

    /// Used to fetch public keys the configuration lacks
    #[must_use]
    pub fn kas_client(mut self, client: KasClient) -> Self {
        self.kas_client = Some(client);
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: Policy) -> Self {
        self.config = self.config.policy(policy);
        self
    }

    #[must_use]
    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.config = self.config.mime_type(mime_type);
        self
    }

    /// Plaintext bytes per segment (default 2 MiB)
    #[must_use]
    pub fn segment_size(mut self, size: usize) -> Self {
        self.config = self.config.segment_size(size);
        self
    }

    /// Build and return the encrypted TDF as bytes
    pub async fn to_bytes(mut self) -> Result<Vec<u8>, TdfError> {
        fetch_public_keys(&mut self.config, self.kas_client.as_ref()).await?;
        let size = self.data.len() as u64;
        let (out, _) = encrypt(&self.config, self.data.as_slice(), Vec::new(), Some(size))?;
        Ok(out)
    }

    /// Build and write the encrypted TDF to `path`
    ///
    /// Nothing is left at `path` if encryption fails or is cancelled.
    pub async fn to_file(mut self, path: impl AsRef<Path>) -> Result<Manifest, TdfError> {
        fetch_public_keys(&mut self.config, self.kas_client.as_ref()).await?;
        let size = self.data.len() as u64;
        let mut manifest = None;
        write_file_atomically(path.as_ref(), |out| {
            let (_, m) = encrypt(&self.config, self.data.as_slice(), out, Some(size))?;
            manifest = Some(m);
            Ok(())
        })?;
        manifest.ok_or_else(|| TdfError::InvalidArgument("no manifest produced".into()))
    }
}

/// Builder for encrypting files to TDF format
pub struct TdfEncryptFileBuilder {
    input_path: PathBuf,
    output_path: PathBuf,
    config: TdfConfig,
    kas_client: Option<KasClient>,
}

impl TdfEncryptFileBuilder {
    pub(crate) fn new(input_path: PathBuf, output_path: PathBuf) -> Self {
        Self {
            input_path,
            output_path,
            config: TdfConfig::new(),
            kas_client: None,
        }
    }

    #[must_use]
    pub fn config(mut self, config: TdfConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn kas_client(mut self, client: KasClient) -> Self {
        self.kas_client = Some(client);
        self
    }

    /// Stream the input file through the writer into the output file
    pub async fn build(mut self) -> Result<Manifest, TdfError> {
        fetch_public_keys(&mut self.config, self.kas_client.as_ref()).await?;
        let input = File::open(&self.input_path)?;
        let size = input.metadata()?.len();
        let mut manifest = None;
        write_file_atomically(&self.output_path, |out| {
            let (_, m) = encrypt(&self.config, BufReader::new(input), out, Some(size))?;
            manifest = Some(m);
            Ok(())
        })?;
        manifest.ok_or_else(|| TdfError::InvalidArgument("no manifest produced".into()))
    }
}

/// Open `source` and unlock it through `kas`
pub async fn open<R: Read + Seek>(
    source: R,
    kas: &KasClient,
    config: &ReaderConfig,
) -> Result<TdfReader<R>, TdfError> {
    let mut reader = TdfReader::new(source)?;
    reader.unlock(kas, config).await?;
    Ok(reader)
}

/// Builder for decrypting TDF data
pub struct TdfDecryptBuilder {
    data: Vec<u8>,
    kas_client: Option<KasClient>,
    config: ReaderConfig,
}

impl TdfDecryptBuilder {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            kas_client: None,
            config: ReaderConfig::new(),
        }
    }

    /// Set the KAS client for key unwrapping
    #[must_use]
    pub fn kas_client(mut self, client: KasClient) -> Self {
        self.kas_client = Some(client);
        self
    }

    #[must_use]
    pub fn config(mut self, config: ReaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Unlock and return a reader over the buffer
    pub async fn reader(self) -> Result<TdfReader<Cursor<Vec<u8>>>, TdfError> {
        let kas = self
            .kas_client
            .ok_or_else(|| TdfError::InvalidArgument("kas_client is required".into()))?;
        open(Cursor::new(self.data), &kas, &self.config).await
    }

    /// Decrypt and return plaintext as bytes
    pub async fn to_bytes(self) -> Result<Vec<u8>, TdfError> {
        let mut reader = self.reader().await?;
        let mut plaintext = Vec::with_capacity(reader.payload_size() as usize);
        reader.write_to(&mut plaintext)?;
        Ok(plaintext)
    }

    /// Decrypt and write plaintext to `path`
    pub async fn to_file(self, path: impl AsRef<Path>) -> Result<(), TdfError> {
        let mut reader = self.reader().await?;
        write_file_atomically(path.as_ref(), |out| {
            reader.write_to(out)?;
            Ok(())
        })
    }
}

/// Builder for decrypting TDF files
pub struct TdfDecryptFileBuilder {
    input_path: PathBuf,
    kas_client: Option<KasClient>,
    config: ReaderConfig,
}

impl TdfDecryptFileBuilder {
    pub(crate) fn new(input_path: PathBuf) -> Self {
        Self {
            input_path,
            kas_client: None,
            config: ReaderConfig::new(),
        }
    }

    #[must_use]
    pub fn kas_client(mut self, client: KasClient) -> Self {
        self.kas_client = Some(client);
        self
    }

    #[must_use]
    pub fn config(mut self, config: ReaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Unlock and return a reader over the file
    pub async fn reader(self) -> Result<TdfReader<BufReader<File>>, TdfError> {
        let kas = self
            .kas_client
            .ok_or_else(|| TdfError::InvalidArgument("kas_client is required".into()))?;
        let file = BufReader::new(File::open(&self.input_path)?);
        open(file, &kas, &self.config).await
    }

    pub async fn to_bytes(self) -> Result<Vec<u8>, TdfError> {
        let mut reader = self.reader().await?;
        let mut plaintext = Vec::new();
        reader.write_to(&mut plaintext)?;
        Ok(plaintext)
    }

    /// Decrypt into `output_path`, leaving nothing behind on failure
    pub async fn to_file(self, output_path: impl AsRef<Path>) -> Result<(), TdfError> {
        let mut reader = self.reader().await?;
        write_file_atomically(output_path.as_ref(), |out| {
            reader.write_to(out)?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::TdfArchive;
    use crate::assertion::{AssertionConfig, AssertionType, Scope, Statement};
    use crate::config::{KasInfo, SplitStep, TargetMode, MIN_SEGMENT_SIZE};
    use crate::crypto::{EcCurve, EcPrivateKey, JwsKey};
    use crate::policy::AttributeObject;
    use tokio_util::sync::CancellationToken;

    fn kas(url: &str) -> KasInfo {
        let key = EcPrivateKey::generate(EcCurve::P256);
        KasInfo::new(url)
            .with_algorithm("ec:secp256r1")
            .with_public_key(key.public_key_pem().unwrap())
    }

    fn config() -> TdfConfig {
        TdfConfig::new().kas(kas("https://kas.example.com"))
    }

    fn unlock(bytes: Vec<u8>, dek: Dek, config: &ReaderConfig) -> Result<Vec<u8>, TdfError> {
        let mut reader = TdfReader::new(Cursor::new(bytes))?;
        reader.unlock_with_key(dek, config)?;
        let mut out = Vec::new();
        reader.write_to(&mut out)?;
        Ok(out)
    }

    #[test]
    fn test_smallest_tdf() {
        let dek = Dek::generate();
        let (bytes, manifest) =
            encrypt_with_dek(&config(), dek.clone(), &b"Virtru"[..], Vec::new(), None).unwrap();

        let integrity = manifest.integrity();
        assert_eq!(integrity.segments.len(), 1);
        assert_eq!(integrity.segments[0].segment_size, Some(6));
        assert_eq!(integrity.segments[0].encrypted_segment_size, Some(34));
        assert_eq!(manifest.payload.url, "0.payload");
        assert_eq!(manifest.encryption_information.encryption_type, "split");
        assert_eq!(manifest.tdf_version, "4.3.0");
        assert!(manifest.policy().unwrap().body.data_attributes.is_empty());

        assert_eq!(unlock(bytes, dek, &ReaderConfig::new()).unwrap(), b"Virtru");
    }

    #[test]
    fn test_manifest_matches_archive() {
        let (bytes, manifest) =
            encrypt(&config().mime_type("text/plain"), &b"abc"[..], Vec::new(), None).unwrap();
        let archive = TdfArchive::open(Cursor::new(bytes)).unwrap();
        let stored = Manifest::from_json(archive.manifest_bytes()).unwrap();
        assert_eq!(stored, manifest);
        assert_eq!(stored.payload.mime_type, "text/plain");
    }

    #[test]
    fn test_legacy_target_omits_version() {
        let dek = Dek::generate();
        let config = config().target_mode(TargetMode::parse("v4.2.2").unwrap());
        let (bytes, manifest) =
            encrypt_with_dek(&config, dek.clone(), &b"legacy"[..], Vec::new(), None).unwrap();
        assert!(manifest.tdf_version.is_empty());
        assert!(manifest.use_hex());
        assert_eq!(unlock(bytes, dek, &ReaderConfig::new()).unwrap(), b"legacy");
    }

    #[test]
    fn test_policy_binding_per_kao() {
        let policy = Policy::new(
            vec![AttributeObject::new("https://example.com/attr/a/value/b")],
            vec!["user@example.com".into()],
        );
        let dek = Dek::generate();
        let config = TdfConfig::new()
            .kas(kas("https://a.example.com"))
            .kas(kas("https://b.example.com"))
            .split_plan(vec![
                SplitStep::new("https://a.example.com", "s-0"),
                SplitStep::new("https://b.example.com", "s-1"),
            ])
            .policy(policy.clone());
        let (_, manifest) = encrypt_with_dek(&config, dek, &b"x"[..], Vec::new(), None).unwrap();

        assert_eq!(manifest.policy().unwrap(), policy);
        assert_eq!(manifest.key_access().len(), 2);
        for kao in manifest.key_access() {
            assert_eq!(kao.policy_binding.alg, "HS256");
            assert!(!kao.wrapped_key.is_empty());
        }
        assert_ne!(
            manifest.key_access()[0].split_id,
            manifest.key_access()[1].split_id
        );
    }

    #[test]
    fn test_assertions_signed_and_verified() {
        let dek = Dek::generate();
        let signer = JwsKey::hs256(b"a separate assertion key");
        let config = config()
            .system_metadata_assertion(true)
            .assertion(AssertionConfig::new(
                "handling",
                AssertionType::Handling,
                Scope::Tdo,
                Statement::new("json+stanag5636", "urn:nato:stanag:5636:A:1:elements:json", "{}"),
            ))
            .assertion(
                AssertionConfig::new(
                    "keyed",
                    AssertionType::Other,
                    Scope::Payload,
                    Statement::new("text", "urn:example", "hello"),
                )
                .signing_key(signer.clone()),
            );
        let (bytes, manifest) =
            encrypt_with_dek(&config, dek.clone(), &b"data"[..], Vec::new(), None).unwrap();

        let ids: Vec<&str> = manifest.assertions.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["handling", "keyed", "system-metadata"]);
        assert!(manifest.assertions.iter().all(|a| a.is_signed()));

        let reader_config = ReaderConfig::new().verification_key("keyed", signer);
        assert_eq!(unlock(bytes, dek, &reader_config).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_missing_public_key_without_client() {
        let result = Tdf::encrypt(b"x".to_vec())
            .config(TdfConfig::new().kas(KasInfo::new("https://kas.example.com")))
            .to_bytes()
            .await;
        assert!(matches!(result, Err(TdfError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn test_encrypt_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("plain.bin");
        let output = dir.path().join("plain.bin.tdf");
        let data: Vec<u8> = (0..MIN_SEGMENT_SIZE * 2 + 17).map(|i| i as u8).collect();
        std::fs::write(&input, &data).unwrap();

        let manifest = Tdf::encrypt_file(&input, &output)
            .config(config().segment_size(MIN_SEGMENT_SIZE))
            .build()
            .await
            .unwrap();
        assert_eq!(manifest.integrity().segments.len(), 3);

        let reader = TdfReader::new(BufReader::new(File::open(&output).unwrap())).unwrap();
        assert_eq!(reader.payload_size(), data.len() as u64);
        assert_eq!(reader.manifest(), &manifest);
    }

    #[tokio::test]
    async fn test_cancelled_create_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.tdf");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = Tdf::encrypt(vec![0u8; MIN_SEGMENT_SIZE * 2])
            .config(
                config()
                    .segment_size(MIN_SEGMENT_SIZE)
                    .cancellation_token(cancel),
            )
            .to_file(&output)
            .await;
        assert!(matches!(result, Err(TdfError::Cancelled)));
        assert!(!output.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_decrypt_requires_kas_client() {
        let (bytes, _) = encrypt(&config(), &b"x"[..], Vec::new(), None).unwrap();
        let result = Tdf::decrypt(bytes).to_bytes().await;
        assert!(matches!(result, Err(TdfError::InvalidArgument(_))));
    }
}
