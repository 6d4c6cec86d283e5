// src/utils/compression.rs
use std::io::{Read, Write};

use bytes::Bytes;
use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};

use crate::error::{DecodeError, DecodeResult};

/// Inflates a zlib stream carried by a `Compressed` event. Output longer than
/// `limit` bytes is rejected.
pub fn decompress(data: &[u8], limit: usize) -> DecodeResult<Bytes> {
    let mut out = Vec::new();
    ZlibDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| DecodeError::Decompress {
            reason: e.to_string(),
        })?;
    if out.len() > limit {
        return Err(DecodeError::Decompress {
            reason: format!("inflated payload exceeds {limit} bytes"),
        });
    }
    Ok(Bytes::from(out))
}

pub fn compress(data: &[u8]) -> std::io::Result<Bytes> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data)?;
    Ok(Bytes::from(enc.finish()?))
}
