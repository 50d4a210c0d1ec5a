//! Random-access TDF reader
//!
//! A reader starts out [`ReaderState::Opened`]: the archive is indexed and
//! the manifest parsed, but nothing can be decrypted. Unlocking recovers the
//! DEK, checks segment sizes, the root signature and the assertions, and
//! moves it to [`ReaderState::Validated`]. From there segments are fetched
//! on demand and verified before decryption. The first integrity failure
//! parks the reader in [`ReaderState::Fault`] for good.

use super::integrity::{segment_signature, verify_root_signature, SegmentLayout};
use crate::archive::TdfArchive;
use crate::assertion::verify_assertions;
use crate::config::ReaderConfig;
use crate::crypto::hmac::constant_time_eq;
use crate::crypto::{aes_gcm_decrypt, Dek, IntegrityAlgorithm};
use crate::error::{TamperKind, TdfError};
use crate::kas::KasClient;
use crate::manifest::Manifest;
use crate::policy::Policy;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::io::{self, Read, Seek, SeekFrom, Write};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Manifest parsed, DEK unknown
    Opened,
    /// Root signature and assertions verified
    Validated,
    /// The given segment was the last one decrypted
    Streaming { segment: usize },
    /// The streaming cursor reached the end of the payload
    Eof,
    /// An integrity check failed; terminal
    Fault(TamperKind),
}

pub struct TdfReader<R: Read + Seek> {
    archive: TdfArchive<R>,
    manifest: Manifest,
    layout: SegmentLayout,
    segment_alg: IntegrityAlgorithm,
    dek: Option<Dek>,
    metadata: Option<String>,
    state: ReaderState,
    position: u64,
    current: Option<(usize, Zeroizing<Vec<u8>>)>,
    cancel: CancellationToken,
}

impl<R: Read + Seek> std::fmt::Debug for TdfReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TdfReader")
            .field("state", &self.state)
            .field("segments", &self.layout.len())
            .field("payload_size", &self.layout.plaintext_size())
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

impl<R: Read + Seek> TdfReader<R> {
    /// Index the archive and parse the manifest
    pub fn new(source: R) -> Result<Self, TdfError> {
        let archive = TdfArchive::open(source)?;
        let manifest = Manifest::from_json(archive.manifest_bytes())?;
        let layout = SegmentLayout::from_integrity(manifest.integrity());
        let segment_alg = manifest.segment_algorithm()?;

        debug!(
            segments = layout.len(),
            payload_size = layout.plaintext_size(),
            legacy = manifest.use_hex(),
            "opened TDF"
        );
        Ok(TdfReader {
            archive,
            manifest,
            layout,
            segment_alg,
            dek: None,
            metadata: None,
            state: ReaderState::Opened,
            position: 0,
            current: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Recover the DEK from the KAS servers named in the manifest, then validate
    pub async fn unlock(&mut self, kas: &KasClient, config: &ReaderConfig) -> Result<(), TdfError> {
        self.check_unlockable()?;
        let unwrapped = kas.unwrap_dek(&self.manifest, config).await?;
        self.metadata = unwrapped.metadata;
        self.unlock_with_key(unwrapped.dek, config)
    }

    /// Validate with a DEK obtained out of band
    pub fn unlock_with_key(&mut self, dek: Dek, config: &ReaderConfig) -> Result<(), TdfError> {
        self.check_unlockable()?;
        if let Err(err) = self.validate(&dek, config) {
            if let Some(kind) = err.tamper_kind() {
                warn!(%kind, "TDF failed validation");
                self.state = ReaderState::Fault(kind);
            }
            return Err(err);
        }
        self.dek = Some(dek);
        self.cancel = config.cancel.clone();
        self.state = ReaderState::Validated;
        debug!("TDF unlocked");
        Ok(())
    }

    fn check_unlockable(&self) -> Result<(), TdfError> {
        match self.state {
            ReaderState::Opened => Ok(()),
            ReaderState::Fault(kind) => Err(TdfError::Tampered(kind)),
            _ => Err(TdfError::InvalidArgument("TDF is already unlocked".into())),
        }
    }

    fn validate(&self, dek: &Dek, config: &ReaderConfig) -> Result<(), TdfError> {
        self.layout
            .validate(self.archive.payload_len())
            .map_err(TdfError::Tampered)?;
        let aggregate = verify_root_signature(&self.manifest, dek.as_slice())?;
        if config.disable_assertion_verification {
            debug!("assertion verification disabled");
        } else {
            verify_assertions(&self.manifest, dek, &aggregate, config)?;
        }
        Ok(())
    }

    fn ensure_readable(&self) -> Result<(), TdfError> {
        match self.state {
            ReaderState::Opened => Err(TdfError::InvalidArgument(
                "TDF is locked; unlock it before reading".into(),
            )),
            ReaderState::Fault(kind) => Err(TdfError::Tampered(kind)),
            _ => Ok(()),
        }
    }

    fn decrypt_segment(&mut self, index: usize) -> Result<Zeroizing<Vec<u8>>, TdfError> {
        let entry = *self
            .layout
            .get(index)
            .ok_or_else(|| TdfError::InvalidArgument(format!("no segment {index}")))?;
        let dek = self
            .dek
            .as_ref()
            .ok_or_else(|| TdfError::InvalidArgument("TDF is locked".into()))?;

        let mut encrypted = vec![0u8; entry.encrypted_size as usize];
        self.archive
            .read_payload_at(entry.encrypted_offset, &mut encrypted)?;

        let expected = BASE64
            .decode(&self.manifest.integrity().segments[index].hash)
            .map_err(|_| TdfError::Tampered(TamperKind::SegmentSignature))?;
        let actual = segment_signature(
            self.segment_alg,
            dek.as_slice(),
            &encrypted,
            self.manifest.use_hex(),
        )
        .map_err(|_| TdfError::Tampered(TamperKind::SegmentSignature))?;
        if !constant_time_eq(&actual, &expected) {
            return Err(TdfError::Tampered(TamperKind::SegmentSignature));
        }

        let plain = aes_gcm_decrypt(dek.as_slice(), &encrypted)
            .map_err(|_| TdfError::Tampered(TamperKind::SegmentSignature))?;
        if plain.len() as u64 != entry.plaintext_size {
            return Err(TdfError::Tampered(TamperKind::SegmentSize));
        }
        Ok(Zeroizing::new(plain))
    }

    fn load_segment(&mut self, index: usize) -> Result<(), TdfError> {
        if matches!(&self.current, Some((i, _)) if *i == index) {
            return Ok(());
        }
        if self.cancel.is_cancelled() {
            return Err(TdfError::Cancelled);
        }
        match self.decrypt_segment(index) {
            Ok(plain) => {
                self.current = Some((index, plain));
                self.state = ReaderState::Streaming { segment: index };
                Ok(())
            }
            Err(err) => {
                if let Some(kind) = err.tamper_kind() {
                    warn!(segment = index, %kind, "segment failed verification");
                    self.state = ReaderState::Fault(kind);
                    self.current = None;
                }
                Err(err)
            }
        }
    }

    /// Copy plaintext starting at `offset` into `buf`, returning the count
    ///
    /// Reads may span segments; fewer bytes than requested are returned only
    /// at the end of the payload.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, TdfError> {
        self.ensure_readable()?;
        let size = self.layout.plaintext_size();
        if offset >= size {
            return Err(TdfError::InvalidOffset {
                offset: offset as i128,
                size,
            });
        }

        let mut written = 0;
        let mut pos = offset;
        while written < buf.len() && pos < size {
            let index = self
                .layout
                .segment_for_offset(pos)
                .ok_or(TdfError::InvalidOffset {
                    offset: pos as i128,
                    size,
                })?;
            self.load_segment(index)?;

            let start = self
                .layout
                .get(index)
                .map_or(0, |e| (pos - e.plaintext_offset) as usize);
            let Some((_, plain)) = self.current.as_ref() else {
                return Err(TdfError::InvalidArgument("segment not loaded".into()));
            };
            let n = (plain.len() - start).min(buf.len() - written);
            buf[written..written + n].copy_from_slice(&plain[start..start + n]);
            written += n;
            pos += n as u64;
        }
        Ok(written)
    }

    /// Decrypt everything from the cursor to the end into `out`
    pub fn write_to<W: Write>(&mut self, mut out: W) -> Result<u64, TdfError> {
        self.ensure_readable()?;
        let size = self.layout.plaintext_size();
        let mut total = 0u64;
        while self.position < size {
            let index = self
                .layout
                .segment_for_offset(self.position)
                .ok_or(TdfError::InvalidOffset {
                    offset: self.position as i128,
                    size,
                })?;
            self.load_segment(index)?;

            let start = self
                .layout
                .get(index)
                .map_or(0, |e| (self.position - e.plaintext_offset) as usize);
            let Some((_, plain)) = self.current.as_ref() else {
                return Err(TdfError::InvalidArgument("segment not loaded".into()));
            };
            out.write_all(&plain[start..])?;
            let n = (plain.len() - start) as u64;
            self.position += n;
            total += n;
        }
        self.state = ReaderState::Eof;
        Ok(total)
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Plaintext length
    pub fn payload_size(&self) -> u64 {
        self.layout.plaintext_size()
    }

    pub fn segment_count(&self) -> usize {
        self.layout.len()
    }

    pub fn policy(&self) -> Result<Policy, TdfError> {
        Ok(self.manifest.policy()?)
    }

    /// Attribute FQNs from the embedded policy
    pub fn data_attributes(&self) -> Result<Vec<String>, TdfError> {
        Ok(self
            .policy()?
            .attribute_fqns()
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    /// Metadata decrypted during [`unlock`](Self::unlock), if the writer stored any
    pub fn unencrypted_metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }

    pub fn into_inner(self) -> R {
        self.archive.into_inner()
    }
}

impl<R: Read + Seek> Read for TdfReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.ensure_readable()?;
        if buf.is_empty() {
            return Ok(0);
        }
        if self.position >= self.layout.plaintext_size() {
            self.state = ReaderState::Eof;
            return Ok(0);
        }
        let n = self.read_at(self.position, buf)?;
        self.position += n as u64;
        if self.position >= self.layout.plaintext_size() {
            self.state = ReaderState::Eof;
        }
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for TdfReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.layout.plaintext_size();
        let target = match pos {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(delta) => size as i128 + delta as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
        };
        let position = u64::try_from(target)
            .map_err(|_| TdfError::InvalidOffset { offset: target, size })?;
        self.position = position;
        Ok(position)
    }
}
