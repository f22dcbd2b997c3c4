//! Blob encodings
//!
//! Checkpoints and history records are JSON, optionally gzip-compressed. The
//! compression is part of the key (`.json.gz`), but reads also sniff the
//! gzip magic bytes so a mislabelled blob still decodes.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

/// Serialization extension of stack and history blobs
pub const JSON_EXT: &str = ".json";

/// Extension appended to compressed blobs
pub const GZIP_EXT: &str = ".gz";

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

pub fn is_gzip_key(key: &str) -> bool {
    key.ends_with(GZIP_EXT)
}

/// Compress data with gzip
pub fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    encoder.finish()
}

/// Decompress gzip data
pub fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder.read_to_end(&mut decompressed)?;
    Ok(decompressed)
}

/// Encode `data` for storage under `key`
pub fn encode_for_key(key: &str, data: Vec<u8>) -> std::io::Result<Vec<u8>> {
    if is_gzip_key(key) {
        compress(&data)
    } else {
        Ok(data)
    }
}

/// Decode a blob read from `key`
pub fn decode_blob(key: &str, data: Vec<u8>) -> std::io::Result<Vec<u8>> {
    if is_gzip_key(key) || data.starts_with(&GZIP_MAGIC) {
        decompress(&data)
    } else {
        Ok(data)
    }
}

/// Name of the stack stored in `file_name`, if it is a stack file
///
/// `.gz` is stripped before checking for the serialization extension.
pub fn stack_name_from_file(file_name: &str) -> Option<&str> {
    let base = file_name.strip_suffix(GZIP_EXT).unwrap_or(file_name);
    base.strip_suffix(JSON_EXT).filter(|name| !name.is_empty())
}

/// `<base>.json`, or `<base>.json.gz` when compressing
pub fn json_key(base: &str, gzip: bool) -> String {
    if gzip {
        format!("{base}{JSON_EXT}{GZIP_EXT}")
    } else {
        format!("{base}{JSON_EXT}")
    }
}

/// The same key in the other encoding
pub fn toggle_gzip(key: &str) -> String {
    match key.strip_suffix(GZIP_EXT) {
        Some(plain) => plain.to_string(),
        None => format!("{key}{GZIP_EXT}"),
    }
}
