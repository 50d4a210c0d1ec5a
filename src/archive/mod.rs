//! TDF ZIP container
//!
//! A TDF archive holds exactly two stored (uncompressed) members, the
//! encrypted payload followed by the manifest. Writing is done by a small
//! streaming writer that never seeks backwards; reading goes through the
//! `zip` crate and then switches to random access on the payload bytes.

pub mod reader;
pub mod writer;

pub use reader::TdfArchive;
pub use writer::{Zip64Mode, ZipWriter};

use thiserror::Error;

/// Archive member holding the encrypted segments
pub const PAYLOAD_MEMBER: &str = "0.payload";
/// Archive member holding the JSON manifest
pub const MANIFEST_MEMBER: &str = "0.manifest.json";

/// Upper bound on manifest size accepted by the reader
pub const MAX_MANIFEST_SIZE: u64 = 10 * 1024 * 1024;

/// Errors that can occur during archive operations
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid archive: {0}")]
    Corrupt(String),

    #[error("Archive member not found: {0}")]
    MemberNotFound(String),

    #[error("ZIP64 is required but disabled")]
    Zip64Required,

    #[error("Archive writer misuse: {0}")]
    InvalidState(&'static str),

    #[error("Read out of range: offset {offset} length {len} exceeds payload of {size} bytes")]
    OutOfRange { offset: u64, len: usize, size: u64 },
}

impl ArchiveError {
    pub(crate) fn from_zip(err: zip::result::ZipError, member: &str) -> Self {
        match err {
            zip::result::ZipError::FileNotFound => ArchiveError::MemberNotFound(member.to_string()),
            zip::result::ZipError::Io(e) => ArchiveError::Io(e),
            other => ArchiveError::Corrupt(other.to_string()),
        }
    }
}
