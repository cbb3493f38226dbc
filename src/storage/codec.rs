//! Little-endian binary primitives shared by the snapshot writer and reader.
//!
//! Layouts, leaf first:
//! - string: `u16` length + UTF-8 bytes
//! - stat records: `u32` count, then per record `u32` id, `i32` views,
//!   `i32` clicks, `i32` ftr
//! - bitmap: `u32` length + portable roaring serialization
//! - fingerprint record: `i64` last-seen unix nanos, viewed bitmap, clicked
//!   bitmap, stat records

use std::collections::HashMap;
use std::io;

use chrono::DateTime;
use roaring::RoaringBitmap;
use thiserror::Error;

use crate::model::fingerprint::FingerprintRecord;
use crate::model::StatRecord;

/// Magic prefix of binary snapshot files.
pub const MAGIC: [u8; 4] = *b"SSD5";

/// Format version written by this build.
pub const VERSION: u8 = 5;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unexpected end of snapshot data")]
    UnexpectedEof,
    #[error("bad snapshot magic")]
    BadMagic,
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid UTF-8 in snapshot string")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("corrupt bitmap payload: {0}")]
    Bitmap(io::Error),
}

// --- Writers ---

pub fn write_u16(w: &mut impl io::Write, v: u16) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_u32(w: &mut impl io::Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_i32(w: &mut impl io::Write, v: i32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_i64(w: &mut impl io::Write, v: i64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

/// Writes a u16 length-prefixed UTF-8 string.
pub fn write_string(w: &mut impl io::Write, s: &str) -> io::Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "string exceeds u16 length")
    })?;
    write_u16(w, len)?;
    w.write_all(s.as_bytes())
}

/// Writes a stat-record table.
pub fn write_stat_records(
    w: &mut impl io::Write,
    data: &HashMap<u32, StatRecord>,
) -> io::Result<()> {
    write_u32(w, data.len() as u32)?;
    for (id, rec) in data {
        write_u32(w, *id)?;
        write_i32(w, rec.views)?;
        write_i32(w, rec.clicks)?;
        write_i32(w, rec.ftr)?;
    }
    Ok(())
}

/// Writes a bitmap as a u32 length prefix plus its portable serialization.
pub fn write_bitmap(w: &mut impl io::Write, bm: &RoaringBitmap) -> io::Result<()> {
    write_u32(w, bm.serialized_size() as u32)?;
    bm.serialize_into(w)
}

// --- Reader ---

/// Cursor over a decompressed snapshot buffer.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        let b = self.take(8)?;
        Ok(i64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_u16()? as usize;
        let bytes = self.take(len)?;
        Ok(String::from_utf8(bytes.to_vec())?)
    }

    pub fn read_stat_records(&mut self) -> Result<HashMap<u32, StatRecord>, CodecError> {
        let count = self.read_u32()? as usize;
        // Clamp pre-allocation so a corrupt count cannot balloon memory.
        let mut data = HashMap::with_capacity(count.min(self.remaining() / 16));
        for _ in 0..count {
            let id = self.read_u32()?;
            let views = self.read_i32()?;
            let clicks = self.read_i32()?;
            let ftr = self.read_i32()?;
            data.insert(id, StatRecord { views, clicks, ftr });
        }
        Ok(data)
    }

    pub fn read_bitmap(&mut self) -> Result<RoaringBitmap, CodecError> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        RoaringBitmap::deserialize_from(bytes).map_err(CodecError::Bitmap)
    }

    /// Reads one fingerprint record: timestamp, bitmaps, overflow table.
    pub fn read_fingerprint_record(&mut self) -> Result<FingerprintRecord, CodecError> {
        let nanos = self.read_i64()?;
        let viewed = self.read_bitmap()?;
        let clicked = self.read_bitmap()?;
        let counts = self.read_stat_records()?;
        Ok(FingerprintRecord::from_parts(
            viewed,
            clicked,
            counts,
            DateTime::from_timestamp_nanos(nanos),
        ))
    }

    /// Reads a fingerprint directory: count, then name + record pairs.
    pub fn read_personal_records(
        &mut self,
    ) -> Result<HashMap<String, FingerprintRecord>, CodecError> {
        let count = self.read_u32()? as usize;
        let mut records = HashMap::with_capacity(count.min(self.remaining() / 16));
        for _ in 0..count {
            let name = self.read_string()?;
            let rec = self.read_fingerprint_record()?;
            records.insert(name, rec);
        }
        Ok(records)
    }
}

/// Validates the file header and returns a reader positioned at the payload.
pub fn open_snapshot(buf: &[u8]) -> Result<ByteReader<'_>, CodecError> {
    let mut r = ByteReader::new(buf);
    if r.take(4)? != MAGIC {
        return Err(CodecError::BadMagic);
    }
    let version = r.read_u8()?;
    if version != VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    Ok(r)
}
