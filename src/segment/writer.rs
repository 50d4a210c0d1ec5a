//! Streaming TDF writer
//!
//! Plaintext is buffered one segment at a time. Each full segment is sealed
//! with AES-256-GCM under the DEK, signed, and appended to the payload
//! member. [`TdfWriter::seal`] closes the payload and yields the integrity
//! information the manifest needs; [`SealedPayload::finish`] appends the
//! manifest and the central directory.

use super::integrity::{root_signature, segment_signature};
use crate::archive::{ZipWriter, MANIFEST_MEMBER, PAYLOAD_MEMBER};
use crate::config::TdfConfig;
use crate::crypto::{aes_gcm_encrypt, Dek, IntegrityAlgorithm, GCM_OVERHEAD};
use crate::error::TdfError;
use crate::manifest::{IntegrityInformation, Manifest, RootSignature, Segment};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::Map;
use std::io::{self, Read, Write};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use zeroize::Zeroizing;

/// Payload member size for `plaintext_size` bytes, used as the ZIP64 hint
pub fn encrypted_payload_size(plaintext_size: u64, segment_size: usize) -> u64 {
    let segment_size = segment_size.max(1) as u64;
    let segments = plaintext_size.div_ceil(segment_size).max(1);
    plaintext_size.saturating_add((GCM_OVERHEAD as u64).saturating_mul(segments))
}

pub struct TdfWriter<W: Write> {
    zip: ZipWriter<W>,
    dek: Dek,
    segment_size: usize,
    segment_alg: IntegrityAlgorithm,
    root_alg: IntegrityAlgorithm,
    use_hex: bool,
    buffer: Zeroizing<Vec<u8>>,
    segments: Vec<Segment>,
    aggregate: Vec<u8>,
    plaintext_size: u64,
    cancel: CancellationToken,
}

impl<W: Write> std::fmt::Debug for TdfWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TdfWriter")
            .field("segment_size", &self.segment_size)
            .field("segments", &self.segments.len())
            .field("plaintext_size", &self.plaintext_size)
            .finish_non_exhaustive()
    }
}

impl<W: Write> TdfWriter<W> {
    /// Start the payload member
    ///
    /// `size_hint` is the plaintext length when known up front; it lets
    /// [`Zip64Mode::Auto`](crate::archive::Zip64Mode::Auto) pick ZIP64
    /// headers before any data is written.
    pub fn new(
        inner: W,
        dek: Dek,
        config: &TdfConfig,
        size_hint: Option<u64>,
    ) -> Result<Self, TdfError> {
        let segment_size = config.segment_size;
        let mut zip = ZipWriter::new(inner, config.zip64);
        zip.start_entry(
            PAYLOAD_MEMBER,
            size_hint.map(|size| encrypted_payload_size(size, segment_size)),
        )?;

        Ok(TdfWriter {
            zip,
            dek,
            segment_size,
            segment_alg: config.segment_integrity_algorithm,
            root_alg: config.integrity_algorithm,
            use_hex: config.target_mode.use_hex(),
            buffer: Zeroizing::new(Vec::with_capacity(segment_size)),
            segments: Vec::new(),
            aggregate: Vec::new(),
            plaintext_size: 0,
            cancel: config.cancel.clone(),
        })
    }

    /// Buffer plaintext, sealing every segment that fills up
    pub fn write_plaintext(&mut self, mut data: &[u8]) -> Result<(), TdfError> {
        while !data.is_empty() {
            let take = (self.segment_size - self.buffer.len()).min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buffer.len() == self.segment_size {
                self.seal_segment()?;
            }
        }
        Ok(())
    }

    /// Drain `reader` into the payload, returning the bytes consumed
    pub fn copy_from<R: Read>(&mut self, mut reader: R) -> Result<u64, TdfError> {
        let mut chunk = Zeroizing::new(vec![0u8; self.segment_size]);
        let mut total = 0u64;
        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            self.write_plaintext(&chunk[..n])?;
            total += n as u64;
        }
        Ok(total)
    }

    fn seal_segment(&mut self) -> Result<(), TdfError> {
        if self.cancel.is_cancelled() {
            return Err(TdfError::Cancelled);
        }
        let encrypted = aes_gcm_encrypt(self.dek.as_slice(), &self.buffer)?;
        let signature =
            segment_signature(self.segment_alg, self.dek.as_slice(), &encrypted, self.use_hex)?;
        self.zip.write_data(&encrypted)?;

        trace!(
            segment = self.segments.len(),
            size = self.buffer.len(),
            "sealed segment"
        );
        self.segments.push(Segment {
            hash: BASE64.encode(&signature),
            segment_size: Some(self.buffer.len() as u64),
            encrypted_segment_size: Some(encrypted.len() as u64),
        });
        self.aggregate.extend_from_slice(&signature);
        self.plaintext_size += self.buffer.len() as u64;
        self.buffer.clear();
        Ok(())
    }

    /// Flush the final (possibly short or empty) segment and close the payload
    pub fn seal(mut self) -> Result<SealedPayload<W>, TdfError> {
        if !self.buffer.is_empty() || self.segments.is_empty() {
            self.seal_segment()?;
        }
        self.zip.finish_entry()?;

        let sig = root_signature(
            self.root_alg,
            self.dek.as_slice(),
            &self.aggregate,
            self.use_hex,
        )?;
        debug!(
            segments = self.segments.len(),
            plaintext_size = self.plaintext_size,
            "payload sealed"
        );

        let integrity = IntegrityInformation {
            root_signature: RootSignature {
                alg: self.root_alg.as_str().to_string(),
                sig,
            },
            segment_hash_alg: self.segment_alg.as_str().to_string(),
            segment_size_default: self.segment_size as u64,
            encrypted_segment_size_default: (self.segment_size + GCM_OVERHEAD) as u64,
            segments: std::mem::take(&mut self.segments),
            extra: Map::new(),
        };
        Ok(SealedPayload {
            zip: self.zip,
            integrity,
            aggregate: std::mem::take(&mut self.aggregate),
            plaintext_size: self.plaintext_size,
        })
    }
}

impl<W: Write> Write for TdfWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_plaintext(buf)?;
        Ok(buf.len())
    }

    /// Segments are only emitted when full; see [`TdfWriter::seal`]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A closed payload member waiting for its manifest
pub struct SealedPayload<W: Write> {
    zip: ZipWriter<W>,
    integrity: IntegrityInformation,
    aggregate: Vec<u8>,
    plaintext_size: u64,
}

impl<W: Write> SealedPayload<W> {
    pub fn integrity_information(&self) -> &IntegrityInformation {
        &self.integrity
    }

    pub fn root_signature(&self) -> &str {
        &self.integrity.root_signature.sig
    }

    /// Concatenated segment signatures, in segment order
    pub fn aggregate_hash(&self) -> &[u8] {
        &self.aggregate
    }

    pub fn plaintext_size(&self) -> u64 {
        self.plaintext_size
    }

    /// Append the manifest and the central directory
    pub fn finish(mut self, manifest: &Manifest) -> Result<W, TdfError> {
        let json = manifest.to_json()?;
        self.zip.add_entry(MANIFEST_MEMBER, json.as_bytes())?;
        Ok(self.zip.finish()?)
    }
}
