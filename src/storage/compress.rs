//! zstd framing for snapshot and cold-storage payloads.

use std::io;

/// Default compression level (zstd level 3).
const LEVEL: i32 = 0;

pub fn compress(data: &[u8]) -> io::Result<Vec<u8>> {
    zstd::encode_all(data, LEVEL)
}

pub fn decompress(data: &[u8]) -> io::Result<Vec<u8>> {
    zstd::decode_all(data)
}
