//! Random-access view over a TDF archive
//!
//! The central directory is parsed once with the `zip` crate. After that the
//! payload member is addressed directly by its data offset, so segments can
//! be fetched in any order without re-reading the archive.

use super::{ArchiveError, MANIFEST_MEMBER, MAX_MANIFEST_SIZE, PAYLOAD_MEMBER};
use std::io::{Read, Seek, SeekFrom};
use tracing::debug;
use zip::{CompressionMethod, ZipArchive};

pub struct TdfArchive<R: Read + Seek> {
    source: R,
    manifest: Vec<u8>,
    payload_start: u64,
    payload_len: u64,
}

impl<R: Read + Seek> std::fmt::Debug for TdfArchive<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TdfArchive")
            .field("manifest_len", &self.manifest.len())
            .field("payload_start", &self.payload_start)
            .field("payload_len", &self.payload_len)
            .finish()
    }
}

impl<R: Read + Seek> TdfArchive<R> {
    /// Locate the manifest and payload members
    pub fn open(source: R) -> Result<Self, ArchiveError> {
        let mut archive = ZipArchive::new(source)
            .map_err(|e| ArchiveError::from_zip(e, "central directory"))?;

        let manifest = {
            let mut file = archive
                .by_name(MANIFEST_MEMBER)
                .map_err(|e| ArchiveError::from_zip(e, MANIFEST_MEMBER))?;
            if file.size() > MAX_MANIFEST_SIZE {
                return Err(ArchiveError::Corrupt(format!(
                    "manifest of {} bytes exceeds limit of {}",
                    file.size(),
                    MAX_MANIFEST_SIZE
                )));
            }
            let mut buf = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut buf)
                .map_err(|e| ArchiveError::Corrupt(format!("manifest unreadable: {e}")))?;
            buf
        };

        let (payload_start, payload_len) = {
            let file = archive
                .by_name(PAYLOAD_MEMBER)
                .map_err(|e| ArchiveError::from_zip(e, PAYLOAD_MEMBER))?;
            if file.compression() != CompressionMethod::Stored {
                return Err(ArchiveError::Corrupt(format!(
                    "payload must be stored, found {:?}",
                    file.compression()
                )));
            }
            (file.data_start(), file.compressed_size())
        };

        debug!(
            manifest_len = manifest.len(),
            payload_start, payload_len, "opened TDF archive"
        );
        Ok(TdfArchive {
            source: archive.into_inner(),
            manifest,
            payload_start,
            payload_len,
        })
    }

    pub fn manifest_bytes(&self) -> &[u8] {
        &self.manifest
    }

    /// Length of the stored payload member
    pub fn payload_len(&self) -> u64 {
        self.payload_len
    }

    /// Fill `buf` with payload bytes starting at `offset`
    pub fn read_payload_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), ArchiveError> {
        let end = offset.checked_add(buf.len() as u64);
        if end.map_or(true, |end| end > self.payload_len) {
            return Err(ArchiveError::OutOfRange {
                offset,
                len: buf.len(),
                size: self.payload_len,
            });
        }
        self.source
            .seek(SeekFrom::Start(self.payload_start + offset))?;
        self.source.read_exact(buf)?;
        Ok(())
    }

    pub fn into_inner(self) -> R {
        self.source
    }
}
