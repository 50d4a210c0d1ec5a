//! Create-side and read-side configuration
//!
//! [`TdfConfig`] drives the writer, [`ReaderConfig`] drives unlocking and
//! verification. Both are plain builders; nothing here touches the network.

use crate::archive::Zip64Mode;
use crate::assertion::{
    AssertionConfig, AssertionRegistry, AssertionVerificationKeys, AssertionVerificationMode,
};
use crate::crypto::{EcCurve, IntegrityAlgorithm, JwsKey};
use crate::error::TdfError;
use crate::kas::session::{SessionKey, SessionKeyType};
use crate::manifest::TDF_SPEC_VERSION;
use crate::policy::Policy;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const DEFAULT_SEGMENT_SIZE: usize = 2 * 1024 * 1024;
pub const MIN_SEGMENT_SIZE: usize = 128 * 1024;
pub const MAX_SEGMENT_SIZE: usize = 4 * 1024 * 1024;
pub const DEFAULT_KAS_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// Container format version to write
///
/// Versions below 4.3.0 produce legacy containers: hex-encoded signatures
/// and no `schemaVersion` in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetMode {
    version: String,
    parsed: (u64, u64, u64),
}

impl TargetMode {
    /// Parse `"v4.2.2"`, `"4.3.0"`, `"4.3"` and similar
    pub fn parse(version: &str) -> Result<Self, TdfError> {
        let trimmed = version.trim().trim_start_matches(['v', 'V']);
        let invalid = || TdfError::InvalidArgument(format!("invalid target version {version:?}"));

        let mut parts = trimmed.split('.');
        let mut next = |required: bool| -> Result<u64, TdfError> {
            match parts.next() {
                Some(p) => p.parse().map_err(|_| invalid()),
                None if required => Err(invalid()),
                None => Ok(0),
            }
        };
        let parsed = (next(true)?, next(false)?, next(false)?);
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(TargetMode {
            version: format!("{}.{}.{}", parsed.0, parsed.1, parsed.2),
            parsed,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn is_legacy(&self) -> bool {
        self.parsed < (4, 3, 0)
    }

    /// Hex-encode signatures before base64
    pub fn use_hex(&self) -> bool {
        self.is_legacy()
    }

    /// Value written to the manifest `schemaVersion`, empty when omitted
    pub fn manifest_version(&self) -> &str {
        if self.is_legacy() {
            ""
        } else {
            &self.version
        }
    }
}

impl Default for TargetMode {
    fn default() -> Self {
        TargetMode {
            version: TDF_SPEC_VERSION.to_string(),
            parsed: (4, 3, 0),
        }
    }
}

impl std::str::FromStr for TargetMode {
    type Err = TdfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TargetMode::parse(s)
    }
}

/// What the writer knows about a KAS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KasInfo {
    pub url: String,
    /// Key algorithm as named by the KAS, e.g. `rsa:2048` or `ec:secp256r1`
    pub algorithm: String,
    pub kid: Option<String>,
    /// SPKI PEM; fetched from the KAS when absent
    pub public_key: Option<String>,
}

impl KasInfo {
    pub fn new(url: impl Into<String>) -> Self {
        KasInfo {
            url: url.into(),
            algorithm: "rsa:2048".to_string(),
            kid: None,
            public_key: None,
        }
    }

    #[must_use]
    pub fn with_public_key(mut self, pem: impl Into<String>) -> Self {
        self.public_key = Some(pem.into());
        self
    }

    #[must_use]
    pub fn with_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.algorithm = algorithm.into();
        self
    }

    #[must_use]
    pub fn with_kid(mut self, kid: impl Into<String>) -> Self {
        self.kid = Some(kid.into());
        self
    }

    /// The EC curve when the key is an EC key
    pub fn ec_curve(&self) -> Option<EcCurve> {
        EcCurve::from_kas_algorithm(&self.algorithm).or_else(|| {
            if self.algorithm.is_empty() {
                self.public_key
                    .as_deref()
                    .and_then(|pem| EcCurve::detect_from_pem(pem).ok())
            } else {
                None
            }
        })
    }
}

/// One entry of a split plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitStep {
    pub kas_url: String,
    pub split_id: String,
}

impl SplitStep {
    pub fn new(kas_url: impl Into<String>, split_id: impl Into<String>) -> Self {
        SplitStep {
            kas_url: kas_url.into(),
            split_id: split_id.into(),
        }
    }
}

/// Resolves a policy into a split plan
///
/// Attribute lookup lives outside this crate; implementors typically consult
/// a policy service and map attribute values to KAS grants.
pub trait SplitPlanResolver: Send + Sync {
    fn resolve(&self, policy: &Policy) -> Result<Vec<SplitStep>, TdfError>;
}

/// Options for creating a TDF
#[derive(Clone)]
pub struct TdfConfig {
    pub(crate) segment_size: usize,
    pub(crate) integrity_algorithm: IntegrityAlgorithm,
    pub(crate) segment_integrity_algorithm: IntegrityAlgorithm,
    pub(crate) mime_type: String,
    pub(crate) kas: Vec<KasInfo>,
    pub(crate) split_plan: Vec<SplitStep>,
    pub(crate) resolver: Option<Arc<dyn SplitPlanResolver>>,
    pub(crate) policy: Policy,
    pub(crate) metadata: Option<String>,
    pub(crate) assertions: Vec<AssertionConfig>,
    pub(crate) target_mode: TargetMode,
    pub(crate) zip64: Zip64Mode,
    pub(crate) system_metadata_assertion: bool,
    pub(crate) kas_timeout: Duration,
    pub(crate) cancel: CancellationToken,
}

impl fmt::Debug for TdfConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TdfConfig")
            .field("segment_size", &self.segment_size)
            .field("integrity_algorithm", &self.integrity_algorithm)
            .field("segment_integrity_algorithm", &self.segment_integrity_algorithm)
            .field("mime_type", &self.mime_type)
            .field("kas", &self.kas)
            .field("split_plan", &self.split_plan)
            .field("autoconfigure", &self.resolver.is_some())
            .field("assertions", &self.assertions.len())
            .field("target_mode", &self.target_mode)
            .field("zip64", &self.zip64)
            .field("kas_timeout", &self.kas_timeout)
            .finish_non_exhaustive()
    }
}

impl Default for TdfConfig {
    fn default() -> Self {
        TdfConfig {
            segment_size: DEFAULT_SEGMENT_SIZE,
            integrity_algorithm: IntegrityAlgorithm::Hs256,
            segment_integrity_algorithm: IntegrityAlgorithm::Gmac,
            mime_type: DEFAULT_MIME_TYPE.to_string(),
            kas: Vec::new(),
            split_plan: Vec::new(),
            resolver: None,
            policy: Policy::default(),
            metadata: None,
            assertions: Vec::new(),
            target_mode: TargetMode::default(),
            zip64: Zip64Mode::Auto,
            system_metadata_assertion: false,
            kas_timeout: DEFAULT_KAS_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }
}

impl TdfConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plaintext bytes per segment, clamped to the supported range
    #[must_use]
    pub fn segment_size(mut self, size: usize) -> Self {
        let clamped = size.clamp(MIN_SEGMENT_SIZE, MAX_SEGMENT_SIZE);
        if clamped != size {
            warn!(requested = size, used = clamped, "segment size clamped");
        }
        self.segment_size = clamped;
        self
    }

    /// Algorithm for the root signature
    #[must_use]
    pub fn integrity_algorithm(mut self, alg: IntegrityAlgorithm) -> Self {
        self.integrity_algorithm = alg;
        self
    }

    /// Algorithm for per-segment signatures
    #[must_use]
    pub fn segment_integrity_algorithm(mut self, alg: IntegrityAlgorithm) -> Self {
        self.segment_integrity_algorithm = alg;
        self
    }

    #[must_use]
    pub fn mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    /// Add a KAS. Without an explicit split plan every KAS gets its own split.
    #[must_use]
    pub fn kas(mut self, info: KasInfo) -> Self {
        self.kas.push(info);
        self
    }

    #[must_use]
    pub fn split_plan(mut self, plan: Vec<SplitStep>) -> Self {
        self.split_plan = plan;
        self
    }

    /// Derive the split plan from the policy instead of supplying one
    #[must_use]
    pub fn autoconfigure(mut self, resolver: Arc<dyn SplitPlanResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Caller string encrypted under every key split
    #[must_use]
    pub fn metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    #[must_use]
    pub fn assertion(mut self, assertion: AssertionConfig) -> Self {
        self.assertions.push(assertion);
        self
    }

    #[must_use]
    pub fn target_mode(mut self, mode: TargetMode) -> Self {
        self.target_mode = mode;
        self
    }

    #[must_use]
    pub fn zip64(mut self, mode: Zip64Mode) -> Self {
        self.zip64 = mode;
        self
    }

    /// Attach the `system-metadata` assertion
    #[must_use]
    pub fn system_metadata_assertion(mut self, enabled: bool) -> Self {
        self.system_metadata_assertion = enabled;
        self
    }

    /// Timeout for KAS public key requests
    #[must_use]
    pub fn kas_timeout(mut self, timeout: Duration) -> Self {
        self.kas_timeout = timeout;
        self
    }

    #[must_use]
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn get_kas_timeout(&self) -> Duration {
        self.kas_timeout
    }

    pub fn get_segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn get_policy(&self) -> &Policy {
        &self.policy
    }

    pub fn get_target_mode(&self) -> &TargetMode {
        &self.target_mode
    }

    pub fn kas_info(&self, url: &str) -> Option<&KasInfo> {
        self.kas.iter().find(|k| k.url == url)
    }

    pub(crate) fn kas_info_mut(&mut self, url: &str) -> Option<&mut KasInfo> {
        self.kas.iter_mut().find(|k| k.url == url)
    }

    /// The split plan the writer will use
    ///
    /// An explicit plan wins; otherwise the resolver runs; otherwise each
    /// configured KAS becomes its own split (or the single split `""` when
    /// there is only one).
    pub fn resolve_split_plan(&self) -> Result<Vec<SplitStep>, TdfError> {
        match (&self.resolver, self.split_plan.is_empty()) {
            (Some(_), false) => Err(TdfError::InvalidArgument(
                "autoconfigure cannot be combined with an explicit split plan".into(),
            )),
            (Some(resolver), true) => {
                let plan = resolver.resolve(&self.policy)?;
                if plan.is_empty() {
                    return Err(TdfError::InvalidArgument(
                        "split plan resolver returned no steps".into(),
                    ));
                }
                Ok(plan)
            }
            (None, false) => Ok(self.split_plan.clone()),
            (None, true) => {
                if self.kas.is_empty() {
                    return Err(TdfError::InvalidArgument("no KAS configured".into()));
                }
                let single = self.kas.len() == 1;
                Ok(self
                    .kas
                    .iter()
                    .enumerate()
                    .map(|(i, k)| {
                        let split_id = if single { String::new() } else { format!("s-{i}") };
                        SplitStep::new(k.url.clone(), split_id)
                    })
                    .collect())
            }
        }
    }
}

/// Options for opening, unlocking and verifying a TDF
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub(crate) kas_allowlist: Vec<String>,
    pub(crate) ignore_allowlist: bool,
    pub(crate) verification_mode: AssertionVerificationMode,
    pub(crate) verification_keys: AssertionVerificationKeys,
    pub(crate) disable_assertion_verification: bool,
    pub(crate) session_key_type: SessionKeyType,
    pub(crate) session_key: Option<SessionKey>,
    pub(crate) kas_timeout: Duration,
    pub(crate) registry: Arc<AssertionRegistry>,
    pub(crate) cancel: CancellationToken,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            kas_allowlist: Vec::new(),
            ignore_allowlist: false,
            verification_mode: AssertionVerificationMode::default(),
            verification_keys: AssertionVerificationKeys::default(),
            disable_assertion_verification: false,
            session_key_type: SessionKeyType::default(),
            session_key: None,
            kas_timeout: DEFAULT_KAS_TIMEOUT,
            registry: Arc::new(AssertionRegistry::with_defaults()),
            cancel: CancellationToken::new(),
        }
    }
}

impl ReaderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// KAS endpoints the reader may contact, as URLs or `host[:port]`
    #[must_use]
    pub fn kas_allowlist(mut self, urls: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.kas_allowlist = urls.into_iter().map(Into::into).collect();
        self
    }

    /// Contact any KAS named in the manifest
    #[must_use]
    pub fn ignore_allowlist(mut self, ignore: bool) -> Self {
        self.ignore_allowlist = ignore;
        self
    }

    #[must_use]
    pub fn assertion_verification_mode(mut self, mode: AssertionVerificationMode) -> Self {
        self.verification_mode = mode;
        self
    }

    #[must_use]
    pub fn verification_keys(mut self, keys: AssertionVerificationKeys) -> Self {
        self.verification_keys = keys;
        self
    }

    /// Verification key for one assertion id
    #[must_use]
    pub fn verification_key(mut self, assertion_id: impl Into<String>, key: JwsKey) -> Self {
        self.verification_keys.keys.insert(assertion_id.into(), key);
        self
    }

    #[must_use]
    pub fn default_verification_key(mut self, key: JwsKey) -> Self {
        self.verification_keys.default_key = Some(key);
        self
    }

    #[must_use]
    pub fn disable_assertion_verification(mut self, disable: bool) -> Self {
        self.disable_assertion_verification = disable;
        self
    }

    #[must_use]
    pub fn session_key_type(mut self, key_type: SessionKeyType) -> Self {
        self.session_key_type = key_type;
        self
    }

    /// Use this session key for rewrap instead of generating one
    #[must_use]
    pub fn session_key(mut self, key: SessionKey) -> Self {
        self.session_key = Some(key);
        self
    }

    #[must_use]
    pub fn kas_timeout(mut self, timeout: Duration) -> Self {
        self.kas_timeout = timeout;
        self
    }

    #[must_use]
    pub fn assertion_registry(mut self, registry: AssertionRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    #[must_use]
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn get_verification_mode(&self) -> AssertionVerificationMode {
        self.verification_mode
    }

    pub fn get_kas_timeout(&self) -> Duration {
        self.kas_timeout
    }

    pub fn get_cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}
