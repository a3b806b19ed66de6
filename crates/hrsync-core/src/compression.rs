//! gzip codec for request and response bodies

use std::io::{Read, Write};

use flate2::{bufread::GzDecoder, write::GzEncoder, Compression};

use crate::error::{Error, Result};

/// First two bytes of every gzip stream
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Whether `bytes` start with the gzip magic number
pub fn is_gzip(bytes: &[u8]) -> bool {
    bytes.starts_with(&GZIP_MAGIC)
}

pub fn compress(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
    encoder
        .write_all(bytes)
        .map_err(|error| Error::Compression(error.to_string()))?;
    encoder
        .finish()
        .map_err(|error| Error::Compression(error.to_string()))
}

/// Decompress gzip input; anything without the magic passes through untouched.
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>> {
    if !is_gzip(bytes) {
        return Ok(bytes.to_vec());
    }
    let mut decoded = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut decoded)
        .map_err(|error| Error::Compression(error.to_string()))?;
    Ok(decoded)
}

/// Outgoing body, possibly compressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBody {
    pub bytes: Vec<u8>,
    pub gzipped: bool,
}

/// Compress `bytes` when enabled and at least `threshold` long.
pub fn encode_body(bytes: Vec<u8>, enabled: bool, threshold: usize) -> Result<EncodedBody> {
    if !enabled || bytes.len() < threshold {
        return Ok(EncodedBody {
            bytes,
            gzipped: false,
        });
    }
    Ok(EncodedBody {
        bytes: compress(&bytes)?,
        gzipped: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_payload_is_compressed_and_restored() {
        let payload = serde_json::json!({ "reason": "family leave ".repeat(200) }).to_string();
        let encoded = encode_body(payload.clone().into_bytes(), true, 1_024).unwrap();

        assert!(encoded.gzipped);
        assert!(is_gzip(&encoded.bytes));
        assert!(encoded.bytes.len() < payload.len());
        assert_eq!(decompress(&encoded.bytes).unwrap(), payload.into_bytes());
    }

    #[test]
    fn small_or_disabled_payloads_are_untouched() {
        let small = b"{\"id\":1}".to_vec();
        let encoded = encode_body(small.clone(), true, 1_024).unwrap();
        assert!(!encoded.gzipped);
        assert_eq!(encoded.bytes, small);

        let large = vec![b'a'; 4_096];
        let encoded = encode_body(large.clone(), false, 1_024).unwrap();
        assert!(!encoded.gzipped);
        assert_eq!(encoded.bytes, large);
    }

    #[test]
    fn plain_input_passes_through_decoder() {
        let plain = b"{\"ok\":true}";
        assert_eq!(decompress(plain).unwrap(), plain.to_vec());
    }

    #[test]
    fn truncated_gzip_is_an_error() {
        let compressed = compress(&vec![b'x'; 2_048]).unwrap();
        let truncated = &compressed[..compressed.len() / 2];
        assert!(matches!(
            decompress(truncated),
            Err(Error::Compression(_))
        ));
    }
}
