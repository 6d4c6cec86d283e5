// src/protocol/codec.rs
//! Little-endian primitives shared by every event payload.
//!
//! Layout rules: blobs and strings are `u32` length + bytes, optionals carry a
//! `u8` presence flag, timestamps are `i64` milliseconds since the epoch.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

use crate::error::{DecodeError, DecodeResult};

pub struct WireReader {
    buf: Bytes,
}

impl WireReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::new(Bytes::copy_from_slice(bytes))
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, what: &'static str, need: usize) -> DecodeResult<()> {
        let have = self.buf.remaining();
        if have < need {
            return Err(DecodeError::Truncated { what, need, have });
        }
        Ok(())
    }

    pub fn u8(&mut self, what: &'static str) -> DecodeResult<u8> {
        self.need(what, 1)?;
        Ok(self.buf.get_u8())
    }

    pub fn bool(&mut self, what: &'static str) -> DecodeResult<bool> {
        match self.u8(what)? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(DecodeError::UnknownTag { what, tag }),
        }
    }

    pub fn u32(&mut self, what: &'static str) -> DecodeResult<u32> {
        self.need(what, 4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn u64(&mut self, what: &'static str) -> DecodeResult<u64> {
        self.need(what, 8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn i64(&mut self, what: &'static str) -> DecodeResult<i64> {
        self.need(what, 8)?;
        Ok(self.buf.get_i64_le())
    }

    pub fn f32(&mut self, what: &'static str) -> DecodeResult<f32> {
        self.need(what, 4)?;
        Ok(self.buf.get_f32_le())
    }

    /// Length-prefixed blob; shares the underlying buffer.
    pub fn blob(&mut self, what: &'static str) -> DecodeResult<Bytes> {
        let len = self.u32(what)? as usize;
        self.need(what, len)?;
        Ok(self.buf.split_to(len))
    }

    pub fn string(&mut self, what: &'static str) -> DecodeResult<String> {
        let raw = self.blob(what)?;
        String::from_utf8(raw.to_vec()).map_err(|e| DecodeError::Invalid {
            what,
            reason: e.to_string(),
        })
    }

    pub fn timestamp(&mut self, what: &'static str) -> DecodeResult<DateTime<Utc>> {
        let ms = self.i64(what)?;
        DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| DecodeError::Invalid {
            what,
            reason: format!("timestamp {ms}ms out of range"),
        })
    }

    pub fn optional<T>(
        &mut self,
        what: &'static str,
        read: impl FnOnce(&mut Self) -> DecodeResult<T>,
    ) -> DecodeResult<Option<T>> {
        if self.bool(what)? {
            Ok(Some(read(self)?))
        } else {
            Ok(None)
        }
    }

    pub fn vec_u32(&mut self, what: &'static str) -> DecodeResult<Vec<u32>> {
        let n = self.u32(what)? as usize;
        self.need(what, n.saturating_mul(4))?;
        Ok((0..n).map(|_| self.buf.get_u32_le()).collect())
    }

    pub fn vec_u64(&mut self, what: &'static str) -> DecodeResult<Vec<u64>> {
        let n = self.u32(what)? as usize;
        self.need(what, n.saturating_mul(8))?;
        Ok((0..n).map(|_| self.buf.get_u64_le()).collect())
    }

    pub fn vec_f32(&mut self, what: &'static str) -> DecodeResult<Vec<f32>> {
        let n = self.u32(what)? as usize;
        self.need(what, n.saturating_mul(4))?;
        Ok((0..n).map(|_| self.buf.get_f32_le()).collect())
    }
}

#[derive(Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }

    pub fn bool(&mut self, v: bool) -> &mut Self {
        self.u8(u8::from(v))
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64_le(v);
        self
    }

    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.buf.put_i64_le(v);
        self
    }

    pub fn f32(&mut self, v: f32) -> &mut Self {
        self.buf.put_f32_le(v);
        self
    }

    pub fn blob(&mut self, v: &[u8]) -> &mut Self {
        self.u32(len_u32(v.len()));
        self.buf.put_slice(v);
        self
    }

    pub fn string(&mut self, v: &str) -> &mut Self {
        self.blob(v.as_bytes())
    }

    pub fn timestamp(&mut self, v: &DateTime<Utc>) -> &mut Self {
        self.i64(v.timestamp_millis())
    }

    pub fn optional<T>(&mut self, v: Option<&T>, write: impl FnOnce(&mut Self, &T)) -> &mut Self
    where
        T: ?Sized,
    {
        match v {
            Some(inner) => {
                self.bool(true);
                write(self, inner);
            }
            None => {
                self.bool(false);
            }
        }
        self
    }

    pub fn vec_u32(&mut self, v: &[u32]) -> &mut Self {
        self.u32(len_u32(v.len()));
        for x in v {
            self.buf.put_u32_le(*x);
        }
        self
    }

    pub fn vec_u64(&mut self, v: &[u64]) -> &mut Self {
        self.u32(len_u32(v.len()));
        for x in v {
            self.buf.put_u64_le(*x);
        }
        self
    }

    pub fn vec_f32(&mut self, v: &[f32]) -> &mut Self {
        self.u32(len_u32(v.len()));
        for x in v {
            self.buf.put_f32_le(*x);
        }
        self
    }
}

// Lengths above u32::MAX cannot be framed; callers never build such payloads.
fn len_u32(len: usize) -> u32 {
    u32::try_from(len).unwrap_or(u32::MAX)
}

/// Encode/decode pair for a self-contained wire record.
pub trait WireCodec: Sized {
    fn encode_to(&self, w: &mut WireWriter);
    fn decode_from(r: &mut WireReader) -> DecodeResult<Self>;

    fn encode(&self) -> Bytes {
        let mut w = WireWriter::new();
        self.encode_to(&mut w);
        w.finish()
    }

    fn decode(bytes: &[u8]) -> DecodeResult<Self> {
        Self::decode_bytes(Bytes::copy_from_slice(bytes))
    }

    fn decode_bytes(bytes: Bytes) -> DecodeResult<Self> {
        let mut r = WireReader::new(bytes);
        Self::decode_from(&mut r)
    }
}
