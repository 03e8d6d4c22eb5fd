//! Deterministic encode -> compress -> frame -> checksum pipeline for
//! values passed through the ORM facade, grounded on the original Python
//! `FileProcessor`: canonical JSON, then zlib or zstd compression, then a
//! base64 frame, with a SHA-256 checksum taken over the compressed bytes.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{CResult, Error};

/// Which compression codec a value was (or should be) compressed with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgo {
    Zlib,
    Zstd,
}

impl Default for CompressionAlgo {
    fn default() -> Self {
        CompressionAlgo::Zstd
    }
}

/// Options steering `process`/`unprocess`; supplied by ORM configuration.
#[derive(Clone, Copy, Debug)]
pub struct CodecOptions {
    pub algo: CompressionAlgo,
    /// zstd compression level, or the zlib `Compression` level (0-9); the
    /// zlib path clamps this into range.
    pub level: i32,
}

impl Default for CodecOptions {
    fn default() -> Self {
        CodecOptions { algo: CompressionAlgo::default(), level: 3 }
    }
}

/// The result of running a value through the codec pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, serde::Deserialize)]
pub struct ProcessedValue {
    pub content_type: String,
    pub payload: String,
    pub checksum: String,
}

/// Canonical JSON encoding. `serde_json::Value`'s `Object` variant is
/// backed by a `BTreeMap` (absent the `preserve_order` feature, which this
/// crate does not enable), so key order is already deterministic without
/// an extra sort pass.
pub fn encode(value: &Value) -> CResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn decode(bytes: &[u8]) -> CResult<Value> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn compress(bytes: &[u8], algo: CompressionAlgo, level: i32) -> CResult<Vec<u8>> {
    match algo {
        CompressionAlgo::Zlib => {
            use flate2::write::ZlibEncoder;
            use flate2::Compression;
            use std::io::Write;

            let clamped = level.clamp(0, 9) as u32;
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(clamped));
            encoder.write_all(bytes)?;
            Ok(encoder.finish()?)
        }
        CompressionAlgo::Zstd => {
            zstd::stream::encode_all(bytes, level).map_err(Error::Io)
        }
    }
}

pub fn decompress(bytes: &[u8], algo: CompressionAlgo) -> CResult<Vec<u8>> {
    match algo {
        CompressionAlgo::Zlib => {
            use flate2::read::ZlibDecoder;
            use std::io::Read;

            let mut decoder = ZlibDecoder::new(bytes);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            Ok(out)
        }
        CompressionAlgo::Zstd => zstd::stream::decode_all(bytes).map_err(Error::Io),
    }
}

pub fn frame(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn unframe(frame: &str) -> CResult<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(frame)
        .map_err(|e| Error::CodecError(e.to_string()))
}

pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Runs a value through the full pipeline: JSON encode, compress, base64
/// frame, and checksum the compressed bytes (matching the original's
/// `FileProcessor.process`, which checksums after compression and before
/// framing).
pub fn process(value: &Value, opts: CodecOptions) -> CResult<ProcessedValue> {
    let encoded = encode(value)?;
    let compressed = compress(&encoded, opts.algo, opts.level)?;
    Ok(ProcessedValue {
        content_type: "text/json".to_string(),
        payload: frame(&compressed),
        checksum: checksum(&compressed),
    })
}

/// Inverse of `process`; returns an error if the checksum of the decoded
/// payload doesn't match what was recorded.
pub fn unprocess(processed: &ProcessedValue, algo: CompressionAlgo) -> CResult<Value> {
    let compressed = unframe(&processed.payload)?;
    if checksum(&compressed) != processed.checksum {
        return Err(Error::CodecError("checksum mismatch".to_string()));
    }
    let encoded = decompress(&compressed, algo)?;
    decode(&encoded)
}
