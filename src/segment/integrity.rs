//! Segment signatures, the aggregate hash and the root signature
//!
//! Signatures are stored as `base64(encode(sig))`, where `encode` is hex in
//! legacy containers and the identity otherwise. The aggregate is the
//! concatenation of the base64-decoded segment hashes, so in legacy mode it
//! is already the hex text the root signature was computed over.

use crate::crypto::hmac::constant_time_eq;
use crate::crypto::{CryptoError, IntegrityAlgorithm, GCM_OVERHEAD};
use crate::error::{TamperKind, TdfError};
use crate::manifest::{IntegrityInformation, Manifest, Segment};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

/// Apply the mode's encoding to a raw signature
pub fn encode_signature(sig: &[u8], use_hex: bool) -> Vec<u8> {
    if use_hex {
        hex::encode(sig).into_bytes()
    } else {
        sig.to_vec()
    }
}

/// Encoded signature over one encrypted segment (`iv || ct || tag`)
pub fn segment_signature(
    alg: IntegrityAlgorithm,
    key: &[u8],
    encrypted_segment: &[u8],
    use_hex: bool,
) -> Result<Vec<u8>, CryptoError> {
    Ok(encode_signature(&alg.sign(key, encrypted_segment)?, use_hex))
}

/// Concatenate the decoded segment hashes in index order
pub fn aggregate_hash(segments: &[Segment]) -> Result<Vec<u8>, TdfError> {
    let mut aggregate = Vec::with_capacity(segments.len() * 32);
    for (index, segment) in segments.iter().enumerate() {
        let decoded = BASE64.decode(&segment.hash).map_err(|e| {
            TdfError::MalformedManifest(format!("segment {index} hash is not base64: {e}"))
        })?;
        aggregate.extend_from_slice(&decoded);
    }
    Ok(aggregate)
}

/// `base64(encode(alg(key, aggregate)))`
pub fn root_signature(
    alg: IntegrityAlgorithm,
    key: &[u8],
    aggregate: &[u8],
    use_hex: bool,
) -> Result<String, CryptoError> {
    let sig = alg.sign(key, aggregate)?;
    Ok(BASE64.encode(encode_signature(&sig, use_hex)))
}

/// Check the stored root signature and return the aggregate it covers
pub fn verify_root_signature(manifest: &Manifest, key: &[u8]) -> Result<Vec<u8>, TdfError> {
    let integrity = manifest.integrity();
    let alg = manifest.root_algorithm()?;
    let aggregate = aggregate_hash(&integrity.segments)?;

    let expected = root_signature(alg, key, &aggregate, manifest.use_hex())
        .map_err(|_| TdfError::Tampered(TamperKind::AggregateHash))?;
    if !constant_time_eq(expected.as_bytes(), integrity.root_signature.sig.as_bytes()) {
        return Err(TdfError::Tampered(TamperKind::RootSignature));
    }
    Ok(aggregate)
}

/// Position of one segment in the plaintext and in the payload member
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentEntry {
    pub index: usize,
    pub plaintext_offset: u64,
    pub plaintext_size: u64,
    pub encrypted_offset: u64,
    pub encrypted_size: u64,
}

/// Offsets of every segment, derived from the manifest
#[derive(Debug, Clone)]
pub struct SegmentLayout {
    entries: Vec<SegmentEntry>,
    default_size: u64,
    default_encrypted_size: u64,
    plaintext_size: u64,
    encrypted_size: u64,
}

impl SegmentLayout {
    /// Build the layout; absent per-segment sizes fall back to the defaults
    pub fn from_integrity(info: &IntegrityInformation) -> Self {
        let mut entries = Vec::with_capacity(info.segments.len());
        let (mut plain_offset, mut enc_offset) = (0u64, 0u64);
        for (index, segment) in info.segments.iter().enumerate() {
            let plaintext_size = segment.segment_size.unwrap_or(info.segment_size_default);
            let encrypted_size = segment
                .encrypted_segment_size
                .unwrap_or(info.encrypted_segment_size_default);
            entries.push(SegmentEntry {
                index,
                plaintext_offset: plain_offset,
                plaintext_size,
                encrypted_offset: enc_offset,
                encrypted_size,
            });
            plain_offset = plain_offset.saturating_add(plaintext_size);
            enc_offset = enc_offset.saturating_add(encrypted_size);
        }
        SegmentLayout {
            entries,
            default_size: info.segment_size_default,
            default_encrypted_size: info.encrypted_segment_size_default,
            plaintext_size: plain_offset,
            encrypted_size: enc_offset,
        }
    }

    /// Enforce the size invariants against the actual payload length
    ///
    /// Every segment but the last must have the default sizes, every
    /// segment must carry exactly the GCM overhead, and the encrypted sizes
    /// must add up to the payload member.
    pub fn validate(&self, payload_len: u64) -> Result<(), TamperKind> {
        let last = self.entries.len().saturating_sub(1);
        for entry in &self.entries {
            if entry.plaintext_size.checked_add(GCM_OVERHEAD as u64) != Some(entry.encrypted_size) {
                return Err(TamperKind::SegmentSize);
            }
            if entry.index < last
                && (entry.plaintext_size != self.default_size
                    || entry.encrypted_size != self.default_encrypted_size)
            {
                return Err(TamperKind::SegmentSize);
            }
            if entry.plaintext_size > self.default_size {
                return Err(TamperKind::SegmentSize);
            }
        }
        if self.encrypted_size != payload_len {
            return Err(TamperKind::SegmentSize);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&SegmentEntry> {
        self.entries.get(index)
    }

    pub fn entries(&self) -> &[SegmentEntry] {
        &self.entries
    }

    /// Total plaintext bytes
    pub fn plaintext_size(&self) -> u64 {
        self.plaintext_size
    }

    pub fn encrypted_size(&self) -> u64 {
        self.encrypted_size
    }

    /// Segment holding plaintext byte `offset`
    ///
    /// Only the final segment may be short, so the index is a division.
    pub fn segment_for_offset(&self, offset: u64) -> Option<usize> {
        if offset >= self.plaintext_size || self.default_size == 0 {
            return None;
        }
        let index = (offset / self.default_size) as usize;
        (index < self.entries.len()).then_some(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::RootSignature;
    use serde_json::Map;

    fn info(sizes: &[(u64, u64)], default: u64) -> IntegrityInformation {
        IntegrityInformation {
            root_signature: RootSignature {
                alg: "HS256".into(),
                sig: String::new(),
            },
            segment_hash_alg: "GMAC".into(),
            segment_size_default: default,
            encrypted_segment_size_default: default + 28,
            segments: sizes
                .iter()
                .map(|&(p, e)| Segment {
                    hash: BASE64.encode([0u8; 16]),
                    segment_size: Some(p),
                    encrypted_segment_size: Some(e),
                })
                .collect(),
            extra: Map::new(),
        }
    }

    #[test]
    fn test_legacy_encoding_is_hex_text() {
        let sig = [0xABu8, 0x01];
        assert_eq!(encode_signature(&sig, true), b"ab01".to_vec());
        assert_eq!(encode_signature(&sig, false), sig.to_vec());
    }

    #[test]
    fn test_root_signature_depends_on_order() {
        let key = [3u8; 32];
        let a = BASE64.encode([1u8; 16]);
        let b = BASE64.encode([2u8; 16]);
        let seg = |hash: &str| Segment {
            hash: hash.to_string(),
            segment_size: None,
            encrypted_segment_size: None,
        };

        let forward = aggregate_hash(&[seg(&a), seg(&b)]).unwrap();
        let reverse = aggregate_hash(&[seg(&b), seg(&a)]).unwrap();
        assert_eq!(forward.len(), 32);

        let alg = IntegrityAlgorithm::Hs256;
        assert_ne!(
            root_signature(alg, &key, &forward, false).unwrap(),
            root_signature(alg, &key, &reverse, false).unwrap()
        );
    }

    #[test]
    fn test_layout_offsets_and_lookup() {
        let layout = SegmentLayout::from_integrity(&info(&[(10, 38), (10, 38), (4, 32)], 10));
        assert_eq!(layout.len(), 3);
        assert_eq!(layout.plaintext_size(), 24);
        assert_eq!(layout.encrypted_size(), 108);
        assert_eq!(layout.get(2).unwrap().encrypted_offset, 76);
        assert_eq!(layout.segment_for_offset(0), Some(0));
        assert_eq!(layout.segment_for_offset(19), Some(1));
        assert_eq!(layout.segment_for_offset(23), Some(2));
        assert_eq!(layout.segment_for_offset(24), None);
        assert!(layout.validate(108).is_ok());
    }

    #[test]
    fn test_layout_rejects_short_middle_segment() {
        let layout = SegmentLayout::from_integrity(&info(&[(10, 38), (4, 32), (10, 38)], 10));
        assert_eq!(layout.validate(108), Err(TamperKind::SegmentSize));
    }

    #[test]
    fn test_layout_rejects_wrong_overhead_and_length() {
        let layout = SegmentLayout::from_integrity(&info(&[(10, 39)], 10));
        assert_eq!(layout.validate(39), Err(TamperKind::SegmentSize));

        let layout = SegmentLayout::from_integrity(&info(&[(10, 38)], 10));
        assert_eq!(layout.validate(40), Err(TamperKind::SegmentSize));
    }

    #[test]
    fn test_layout_rejects_overflowing_sizes() {
        let layout = SegmentLayout::from_integrity(&info(&[(u64::MAX, 27)], 10));
        assert_eq!(layout.validate(27), Err(TamperKind::SegmentSize));

        let layout = SegmentLayout::from_integrity(&info(&[(10, 38), (u64::MAX, 27)], 10));
        assert_eq!(layout.validate(65), Err(TamperKind::SegmentSize));
    }

    #[test]
    fn test_bad_base64_hash_is_malformed() {
        let segment = Segment {
            hash: "***".into(),
            segment_size: None,
            encrypted_segment_size: None,
        };
        assert!(matches!(
            aggregate_hash(&[segment]),
            Err(TdfError::MalformedManifest(_))
        ));
    }
}
