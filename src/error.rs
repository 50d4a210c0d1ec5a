//! Unified error type for the public API
//!
//! Internal modules keep their domain errors (`CryptoError`, `ArchiveError`,
//! `ManifestError`, `KasError`, `AssertionError`). Conversions into
//! [`TdfError`] sort them into the categories callers match on, most
//! importantly [`TdfError::Tampered`] for every integrity failure.
//!
//! # Example
//!
//! ```no_run
//! use ztdf::{TdfError, TamperKind};
//!
//! fn classify(err: &TdfError) -> &'static str {
//!     match err {
//!         TdfError::Tampered(TamperKind::PolicyBinding) => "policy was swapped",
//!         e if e.is_tampered() => "reject the object",
//!         e if e.is_retryable() => "try again later",
//!         _ => "fail",
//!     }
//! }
//! ```

use crate::archive::ArchiveError;
use crate::assertion::AssertionError;
use crate::crypto::{CryptoError, KemError};
use crate::kas::KasError;
use crate::manifest::ManifestError;
use crate::policy::PolicyError;
use std::fmt;
use thiserror::Error;

/// Which integrity check failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TamperKind {
    RootSignature,
    SegmentSignature,
    SegmentSize,
    AggregateHash,
    AssertionHash,
    AssertionSignature,
    PolicyBinding,
}

impl fmt::Display for TamperKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TamperKind::RootSignature => "root signature mismatch",
            TamperKind::SegmentSignature => "segment signature mismatch",
            TamperKind::SegmentSize => "segment size mismatch",
            TamperKind::AggregateHash => "aggregate hash mismatch",
            TamperKind::AssertionHash => "assertion hash mismatch",
            TamperKind::AssertionSignature => "assertion signature invalid",
            TamperKind::PolicyBinding => "policy binding mismatch",
        })
    }
}

/// Unified error type for all TDF operations
#[derive(Debug, Error)]
pub enum TdfError {
    /// An integrity check failed; the object must be rejected
    #[error("TDF integrity check failed: {0}")]
    Tampered(TamperKind),

    #[error("KAS failure: {0}")]
    KasFailure(#[source] KasError),

    #[error("KAS {0} is not on the allowlist")]
    KasNotAllowed(String),

    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlg(String),

    #[error("Malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("Corrupt ZIP archive: {0}")]
    ZipCorrupt(String),

    #[error("Archive member not found: {0}")]
    MemberNotFound(String),

    #[error("Payload requires ZIP64 but ZIP64 is disabled")]
    Zip64Required,

    #[error("Invalid offset {offset} for payload of {size} bytes")]
    InvalidOffset { offset: i128, size: u64 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Crypto error: {0}")]
    Crypto(#[source] CryptoError),

    /// Assertion failures that are not integrity violations
    #[error("Assertion error: {0}")]
    Assertion(#[source] AssertionError),

    #[error("Policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TdfError {
    pub fn is_tampered(&self) -> bool {
        matches!(self, Self::Tampered(_))
    }

    /// The failed integrity check, if this is a tamper error
    pub fn tamper_kind(&self) -> Option<TamperKind> {
        match self {
            Self::Tampered(kind) => Some(*kind),
            _ => None,
        }
    }

    /// Returns true if the error is potentially retryable
    ///
    /// Only transport-level KAS failures qualify; integrity failures never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::KasFailure(e) => e.is_retryable(),
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Returns a suggestion for resolving this error
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Tampered(_) => Some("The TDF was modified after creation; do not trust its contents"),
            Self::KasFailure(e) => e.suggestion(),
            Self::KasNotAllowed(_) => {
                Some("Add the KAS URL to the reader allowlist or set ignore_allowlist")
            }
            Self::Zip64Required => Some("Use Zip64Mode::Auto or Zip64Mode::Always for large payloads"),
            Self::UnsupportedAlg(_) => Some("Supported JWS algorithms are HS256, RS256, ES256, ES384 and ES512"),
            Self::Policy(e) => e.suggestion(),
            Self::Assertion(e) => e.suggestion(),
            _ => None,
        }
    }

    pub fn is_kas_error(&self) -> bool {
        matches!(self, Self::KasFailure(_) | Self::KasNotAllowed(_))
    }

    pub fn is_archive_error(&self) -> bool {
        matches!(
            self,
            Self::ZipCorrupt(_) | Self::MemberNotFound(_) | Self::Zip64Required
        )
    }
}

impl From<CryptoError> for TdfError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::UnsupportedAlg(alg) => Self::UnsupportedAlg(alg),
            CryptoError::Kem(KemError::UnsupportedAlgorithm(alg)) => Self::UnsupportedAlg(alg),
            other => Self::Crypto(other),
        }
    }
}

impl From<KemError> for TdfError {
    fn from(err: KemError) -> Self {
        CryptoError::Kem(err).into()
    }
}

impl From<ArchiveError> for TdfError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::Io(e) => Self::Io(e),
            ArchiveError::Corrupt(msg) => Self::ZipCorrupt(msg),
            ArchiveError::MemberNotFound(name) => Self::MemberNotFound(name),
            ArchiveError::Zip64Required => Self::Zip64Required,
            ArchiveError::InvalidState(msg) => Self::InvalidArgument(msg.to_string()),
            e @ ArchiveError::OutOfRange { .. } => Self::ZipCorrupt(e.to_string()),
        }
    }
}

impl From<ManifestError> for TdfError {
    fn from(err: ManifestError) -> Self {
        Self::MalformedManifest(err.to_string())
    }
}

impl From<KasError> for TdfError {
    fn from(err: KasError) -> Self {
        match err {
            KasError::Crypto(CryptoError::UnsupportedAlg(alg)) => Self::UnsupportedAlg(alg),
            other => Self::KasFailure(other),
        }
    }
}

impl From<AssertionError> for TdfError {
    fn from(err: AssertionError) -> Self {
        match err {
            AssertionError::HashMismatch { .. } => Self::Tampered(TamperKind::AssertionHash),
            AssertionError::MissingBinding { .. }
            | AssertionError::SignatureMismatch { .. }
            | AssertionError::InvalidSignature { .. } => {
                Self::Tampered(TamperKind::AssertionSignature)
            }
            AssertionError::UnsupportedAlg(alg) => Self::UnsupportedAlg(alg),
            other => Self::Assertion(other),
        }
    }
}

/// Streaming readers surface failures through `std::io`; this keeps the
/// original error reachable via `get_ref().downcast_ref::<TdfError>()`.
impl From<TdfError> for std::io::Error {
    fn from(err: TdfError) -> Self {
        match err {
            TdfError::Io(e) => e,
            TdfError::InvalidOffset { .. } | TdfError::InvalidArgument(_) => {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, err)
            }
            TdfError::Tampered(_) => std::io::Error::new(std::io::ErrorKind::InvalidData, err),
            other => std::io::Error::other(other),
        }
    }
}
