//! Stateless wrapper around a dictionary-based compressor.
//!
//! The dictionary is pretrained and loaded once at startup; this crate
//! never mutates it and never silently truncates an oversized result — a
//! packet that cannot be compressed below [`relay_types::MAX_COMPRESSED`]
//! is reported as [`CodecError::TooLarge`] and the caller drops it.

use relay_types::MAX_COMPRESSED;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to load compression dictionary: {0}")]
    DictionaryInit(String),
    #[error("compressed size {actual} exceeds the {limit}-byte ceiling")]
    TooLarge { actual: usize, limit: usize },
    #[error("malformed compressed payload: {0}")]
    Malformed(String),
}

/// Thin, clonable handle to a pretrained dictionary. Compression and
/// decompression are both stateless with respect to prior calls.
pub struct Codec {
    dictionary: Vec<u8>,
    level: i32,
}

impl Codec {
    /// Load the pretrained dictionary once. Compression level defaults to
    /// zstd's balanced level 3; callers needing a different ceiling can
    /// use [`Codec::with_level`].
    pub fn new(dictionary: Vec<u8>) -> Self {
        Self::with_level(dictionary, 3)
    }

    pub fn with_level(dictionary: Vec<u8>, level: i32) -> Self {
        Codec { dictionary, level }
    }

    /// Compresses `raw` against the loaded dictionary. Never truncates:
    /// a result over [`MAX_COMPRESSED`] bytes is an error, not a
    /// truncated payload.
    pub fn compress(&self, raw: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut compressor = zstd::bulk::Compressor::with_dictionary(self.level, &self.dictionary)
            .map_err(|err| CodecError::DictionaryInit(err.to_string()))?;
        let compressed = compressor
            .compress(raw)
            .map_err(|err| CodecError::Malformed(err.to_string()))?;
        if compressed.len() > MAX_COMPRESSED {
            return Err(CodecError::TooLarge { actual: compressed.len(), limit: MAX_COMPRESSED });
        }
        Ok(compressed)
    }

    pub fn decompress(&self, compressed: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut decompressor = zstd::bulk::Decompressor::with_dictionary(&self.dictionary)
            .map_err(|err| CodecError::DictionaryInit(err.to_string()))?;
        // Application packets (CoT) are small; bound the decompress buffer
        // generously relative to the compressed ceiling rather than trusting
        // an embedded size header.
        decompressor
            .decompress(compressed, MAX_COMPRESSED * 64)
            .map_err(|err| CodecError::Malformed(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dictionary() -> Vec<u8> {
        // A trained dictionary needs real sample data; for unit tests a
        // dictionary built from repeated CoT-shaped XML is enough to
        // exercise the compress/decompress path deterministically.
        let samples: Vec<Vec<u8>> = (0..16)
            .map(|i| {
                format!(
                    "<event version=\"2.0\" uid=\"unit-{i}\" type=\"a-f-G-U-C\" time=\"2026-07-31T00:00:00Z\"><point lat=\"1.0\" lon=\"2.0\"/></event>"
                )
                .into_bytes()
            })
            .collect();
        zstd::dict::from_samples(&samples, 8 * 1024).expect("train dictionary")
    }

    #[test]
    fn round_trip_preserves_bytes() {
        let codec = Codec::new(test_dictionary());
        let raw = b"<event uid=\"unit-99\" type=\"a-f-G-U-C\"/>".to_vec();
        let compressed = codec.compress(&raw).expect("compress");
        assert!(compressed.len() <= MAX_COMPRESSED);
        let decompressed = codec.decompress(&compressed).expect("decompress");
        assert_eq!(decompressed, raw);
    }

    #[test]
    fn oversized_payload_is_rejected_not_truncated() {
        let codec = Codec::new(test_dictionary());
        // xorshift keeps this deterministic without pulling in `rand`; the
        // dictionary (trained on CoT XML) gives it no help compressing
        // this, so it stays well past MAX_COMPRESSED.
        let mut state: u32 = 0x1234_5678;
        let raw: Vec<u8> = (0..8192)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state & 0xFF) as u8
            })
            .collect();
        let result = codec.compress(&raw);
        assert!(matches!(result, Err(CodecError::TooLarge { .. })));
    }

    #[test]
    fn malformed_compressed_bytes_fail_decompress() {
        let codec = Codec::new(test_dictionary());
        let garbage = vec![0xFFu8; 32];
        let result = codec.decompress(&garbage);
        assert!(matches!(result, Err(CodecError::Malformed(_))));
    }
}
