//! Chat-sync payload codec: gzip + base64 with a literal `gzip:` prefix.
//!
//! Legacy payloads were stored without compression; `decompress` passes
//! anything un-prefixed through untouched, so old rows keep decoding.

use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use cortex_domain::error::{Error, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

const PREFIX: &str = "gzip:";

pub fn compress(payload: &str) -> Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload.as_bytes())?;
    let compressed = encoder.finish()?;
    Ok(format!("{PREFIX}{}", BASE64.encode(compressed)))
}

pub fn decompress(payload: &str) -> Result<String> {
    let Some(encoded) = payload.strip_prefix(PREFIX) else {
        // Legacy un-prefixed payload.
        return Ok(payload.to_owned());
    };
    let compressed = BASE64
        .decode(encoded)
        .map_err(|e| Error::Validation(format!("invalid base64 payload: {e}")))?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut out = String::new();
    decoder.read_to_string(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let original = "encrypted-blob-".repeat(200);
        let packed = compress(&original).unwrap();
        assert!(packed.starts_with("gzip:"));
        assert_eq!(decompress(&packed).unwrap(), original);
    }

    #[test]
    fn empty_roundtrip() {
        let packed = compress("").unwrap();
        assert_eq!(decompress(&packed).unwrap(), "");
    }

    #[test]
    fn legacy_payload_passes_through() {
        assert_eq!(decompress("plain old data").unwrap(), "plain old data");
        assert_eq!(decompress("").unwrap(), "");
    }

    #[test]
    fn corrupt_prefixed_payload_is_an_error() {
        assert!(decompress("gzip:!!!not-base64!!!").is_err());
        // Valid base64 but not gzip.
        let bogus = format!("gzip:{}", BASE64.encode(b"not gzip"));
        assert!(decompress(&bogus).is_err());
    }

    #[test]
    fn compression_shrinks_repetitive_payloads() {
        let original = "a".repeat(10_000);
        let packed = compress(&original).unwrap();
        assert!(packed.len() < original.len() / 10);
    }
}
