//! Primitive field encoders shared by every marshaller.
//!
//! Tight encoding compacts small longs behind a three-bit size tag in the
//! boolean stream and splits strings into short (two-byte length) and long
//! (four-byte length) forms. Loose encoding spends a full byte per presence
//! flag and never compacts. All multi-byte scalars are big-endian.

use std::collections::HashMap;

use bytes::BufMut;

use crate::codec::boolean_stream::BooleanStream;
use crate::error::CodecError;

/// Bounds-checked cursor over a received frame.
///
/// Every read that would run past the end reports how many bytes were
/// missing, which the connection surfaces as a truncated frame.
#[derive(Debug)]
pub struct DataReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> DataReader<'a> {
    /// Wraps a frame body.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left unread.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::TruncatedFrame {
                needed: len - self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Reads a raw byte slice.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.take(len)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        let b = self.take(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        let b = self.take(8)?;
        Ok(i64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_bits(self.read_i64()? as u64))
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_bits(self.read_u32()?))
    }
}

/// Size tag codes for the tight long encoding: index selects the body width.
const LONG_SIZES: [usize; 6] = [0, 1, 2, 4, 6, 8];

fn long_size_tag(value: i64) -> usize {
    let bits = value as u64;
    if bits == 0 {
        0
    } else if bits <= 0xFF {
        1
    } else if bits <= 0xFFFF {
        2
    } else if bits <= 0xFFFF_FFFF {
        3
    } else if bits <= 0xFFFF_FFFF_FFFF {
        4
    } else {
        5
    }
}

/// Pass one of the tight long encoding: three tag bits, LSB first.
///
/// Returns the number of body bytes pass two will write.
pub fn tight_marshal_long1(value: i64, bs: &mut BooleanStream) -> usize {
    let tag = long_size_tag(value);
    bs.write_boolean(tag & 0b001 != 0);
    bs.write_boolean(tag & 0b010 != 0);
    bs.write_boolean(tag & 0b100 != 0);
    LONG_SIZES[tag]
}

/// Pass two of the tight long encoding: the low `n` bytes, big-endian.
pub fn tight_marshal_long2(
    value: i64,
    out: &mut impl BufMut,
    bs: &mut BooleanStream,
) -> Result<(), CodecError> {
    let tag = read_long_tag(bs)?;
    let width = LONG_SIZES[tag];
    let bytes = (value as u64).to_be_bytes();
    out.put_slice(&bytes[8 - width..]);
    Ok(())
}

/// Decodes a tight long: tag bits from the stream, body from the reader.
pub fn tight_unmarshal_long(
    reader: &mut DataReader<'_>,
    bs: &mut BooleanStream,
) -> Result<i64, CodecError> {
    let tag = read_long_tag(bs)?;
    let width = LONG_SIZES[tag];
    let mut bytes = [0u8; 8];
    bytes[8 - width..].copy_from_slice(reader.read_bytes(width)?);
    Ok(u64::from_be_bytes(bytes) as i64)
}

fn read_long_tag(bs: &mut BooleanStream) -> Result<usize, CodecError> {
    let mut tag = 0usize;
    if bs.read_boolean()? {
        tag |= 0b001;
    }
    if bs.read_boolean()? {
        tag |= 0b010;
    }
    if bs.read_boolean()? {
        tag |= 0b100;
    }
    if tag >= LONG_SIZES.len() {
        return Err(CodecError::InvalidField {
            field: "long size tag",
            value: tag as i64,
        });
    }
    Ok(tag)
}

/// Pass one for an optional UTF-8 string: presence bit, short-form bit.
pub fn tight_marshal_string1(value: Option<&str>, bs: &mut BooleanStream) -> usize {
    bs.write_boolean(value.is_some());
    match value {
        None => 0,
        Some(s) => {
            let short = s.len() < u16::MAX as usize;
            bs.write_boolean(short);
            if short { 2 + s.len() } else { 4 + s.len() }
        }
    }
}

/// Pass two for an optional UTF-8 string.
pub fn tight_marshal_string2(
    value: Option<&str>,
    out: &mut impl BufMut,
    bs: &mut BooleanStream,
) -> Result<(), CodecError> {
    if !bs.read_boolean()? {
        return Ok(());
    }
    let s = value.unwrap_or_default();
    if bs.read_boolean()? {
        out.put_u16(s.len() as u16);
    } else {
        out.put_u32(s.len() as u32);
    }
    out.put_slice(s.as_bytes());
    Ok(())
}

/// Decodes an optional tight string.
pub fn tight_unmarshal_string(
    reader: &mut DataReader<'_>,
    bs: &mut BooleanStream,
) -> Result<Option<String>, CodecError> {
    if !bs.read_boolean()? {
        return Ok(None);
    }
    let len = if bs.read_boolean()? {
        reader.read_u16()? as usize
    } else {
        reader.read_u32()? as usize
    };
    let bytes = reader.read_bytes(len)?;
    String::from_utf8(bytes.to_vec())
        .map(Some)
        .map_err(|_| CodecError::InvalidUtf8)
}

/// Loose form: presence byte, four-byte length, bytes.
pub fn loose_marshal_string(value: Option<&str>, out: &mut impl BufMut) {
    out.put_u8(u8::from(value.is_some()));
    if let Some(s) = value {
        out.put_u32(s.len() as u32);
        out.put_slice(s.as_bytes());
    }
}

/// Decodes a loose optional string.
pub fn loose_unmarshal_string(reader: &mut DataReader<'_>) -> Result<Option<String>, CodecError> {
    if !reader.read_bool()? {
        return Ok(None);
    }
    let len = reader.read_u32()? as usize;
    let bytes = reader.read_bytes(len)?;
    String::from_utf8(bytes.to_vec())
        .map(Some)
        .map_err(|_| CodecError::InvalidUtf8)
}

/// Pass one for an optional byte array.
pub fn tight_marshal_bytes1(value: Option<&[u8]>, bs: &mut BooleanStream) -> usize {
    bs.write_boolean(value.is_some());
    value.map_or(0, |b| 4 + b.len())
}

/// Pass two for an optional byte array.
pub fn tight_marshal_bytes2(
    value: Option<&[u8]>,
    out: &mut impl BufMut,
    bs: &mut BooleanStream,
) -> Result<(), CodecError> {
    if bs.read_boolean()? {
        let b = value.unwrap_or_default();
        out.put_u32(b.len() as u32);
        out.put_slice(b);
    }
    Ok(())
}

/// Decodes an optional tight byte array.
pub fn tight_unmarshal_bytes(
    reader: &mut DataReader<'_>,
    bs: &mut BooleanStream,
) -> Result<Option<Vec<u8>>, CodecError> {
    if !bs.read_boolean()? {
        return Ok(None);
    }
    let len = reader.read_u32()? as usize;
    Ok(Some(reader.read_bytes(len)?.to_vec()))
}

/// Loose form for an optional byte array.
pub fn loose_marshal_bytes(value: Option<&[u8]>, out: &mut impl BufMut) {
    out.put_u8(u8::from(value.is_some()));
    if let Some(b) = value {
        out.put_u32(b.len() as u32);
        out.put_slice(b);
    }
}

/// Decodes a loose optional byte array.
pub fn loose_unmarshal_bytes(reader: &mut DataReader<'_>) -> Result<Option<Vec<u8>>, CodecError> {
    if !reader.read_bool()? {
        return Ok(None);
    }
    let len = reader.read_u32()? as usize;
    Ok(Some(reader.read_bytes(len)?.to_vec()))
}

/// One direction of the negotiated string cache.
///
/// The broker and client mirror each other's assignments in-band: the first
/// marshal of a string carries both the assigned index and the inline bytes;
/// later marshals send only the index. Indices wrap at the negotiated cache
/// size, evicting the previous occupant on both sides in the same order.
#[derive(Debug)]
pub struct WireCache {
    by_value: HashMap<String, u16>,
    by_index: Vec<Option<String>>,
    next: u16,
    capacity: u16,
}

impl WireCache {
    /// Creates a cache with the negotiated entry capacity.
    pub fn new(capacity: u16) -> Self {
        Self {
            by_value: HashMap::new(),
            by_index: vec![None; capacity.max(1) as usize],
            next: 0,
            capacity: capacity.max(1),
        }
    }

    /// Looks up the index assigned to a string, if any.
    pub fn index_of(&self, value: &str) -> Option<u16> {
        self.by_value.get(value).copied()
    }

    /// Assigns the next index to a string, evicting any previous occupant.
    pub fn assign(&mut self, value: &str) -> u16 {
        let index = self.next % self.capacity;
        self.next = self.next.wrapping_add(1);
        if let Some(old) = self.by_index[index as usize].take() {
            self.by_value.remove(&old);
        }
        self.by_index[index as usize] = Some(value.to_string());
        self.by_value.insert(value.to_string(), index);
        index
    }

    /// Records a peer-side assignment observed during decode.
    pub fn learn(&mut self, index: u16, value: &str) {
        let slot = (index % self.capacity) as usize;
        if let Some(old) = self.by_index[slot].take() {
            self.by_value.remove(&old);
        }
        self.by_index[slot] = Some(value.to_string());
        self.by_value.insert(value.to_string(), index % self.capacity);
    }

    /// Resolves an index previously learned from the peer.
    pub fn value_of(&self, index: u16) -> Result<&str, CodecError> {
        self.by_index
            .get((index % self.capacity) as usize)
            .and_then(|slot| slot.as_deref())
            .ok_or(CodecError::UnknownCacheIndex { index })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn round_trip_long(value: i64) -> (i64, usize) {
        let mut bs = BooleanStream::new();
        let size = tight_marshal_long1(value, &mut bs);
        let mut out = BytesMut::new();
        bs.reset_read();
        tight_marshal_long2(value, &mut out, &mut bs).unwrap();
        assert_eq!(out.len(), size);

        bs.reset_read();
        let frozen = out.freeze();
        let mut reader = DataReader::new(&frozen);
        (tight_unmarshal_long(&mut reader, &mut bs).unwrap(), size)
    }

    #[test]
    fn tight_long_widths() {
        assert_eq!(round_trip_long(0), (0, 0));
        assert_eq!(round_trip_long(200), (200, 1));
        assert_eq!(round_trip_long(40_000), (40_000, 2));
        assert_eq!(round_trip_long(4_000_000_000), (4_000_000_000, 4));
        assert_eq!(round_trip_long(1 << 45), (1 << 45, 6));
        assert_eq!(round_trip_long(i64::MAX), (i64::MAX, 8));
        assert_eq!(round_trip_long(-1), (-1, 8));
    }

    #[test]
    fn tight_string_round_trip() {
        for case in [None, Some(""), Some("queue://orders"), Some("héllo")] {
            let mut bs = BooleanStream::new();
            let size = tight_marshal_string1(case, &mut bs);
            let mut out = BytesMut::new();
            bs.reset_read();
            tight_marshal_string2(case, &mut out, &mut bs).unwrap();
            assert_eq!(out.len(), size);

            bs.reset_read();
            let frozen = out.freeze();
            let mut reader = DataReader::new(&frozen);
            let decoded = tight_unmarshal_string(&mut reader, &mut bs).unwrap();
            assert_eq!(decoded.as_deref(), case);
        }
    }

    #[test]
    fn loose_string_round_trip() {
        let mut out = BytesMut::new();
        loose_marshal_string(Some("topic://prices"), &mut out);
        loose_marshal_string(None, &mut out);
        let frozen = out.freeze();
        let mut reader = DataReader::new(&frozen);
        assert_eq!(
            loose_unmarshal_string(&mut reader).unwrap().as_deref(),
            Some("topic://prices")
        );
        assert_eq!(loose_unmarshal_string(&mut reader).unwrap(), None);
    }

    #[test]
    fn truncated_reads_report_missing_bytes() {
        let buf = [0u8, 1];
        let mut reader = DataReader::new(&buf);
        match reader.read_i64() {
            Err(CodecError::TruncatedFrame { needed }) => assert_eq!(needed, 6),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn cache_wraps_and_evicts_in_lockstep() {
        let mut encode = WireCache::new(2);
        let mut decode = WireCache::new(2);

        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            let idx = encode.assign(name);
            decode.learn(idx, name);
            assert_eq!(idx as usize, i % 2);
        }

        // "a" was evicted when "c" wrapped onto index 0.
        assert_eq!(encode.index_of("a"), None);
        assert_eq!(encode.index_of("b"), Some(1));
        assert_eq!(decode.value_of(1).unwrap(), "b");
        assert_eq!(decode.value_of(0).unwrap(), "c");
    }
}
