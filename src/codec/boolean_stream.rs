//! Packed boolean side-channel used by the tight encoding.
//!
//! Tight marshalling runs in two passes over a command tree. Pass one writes
//! presence flags and short-scalar size tags into a `BooleanStream`; pass two
//! reads the same bits back in traversal order while emitting the data body.
//! On the wire the stream precedes the body, prefixed by its own byte count:
//! a single byte when under 64, `0xC0` plus a byte when under 256, and `0x80`
//! plus a big-endian short otherwise.

use bytes::BufMut;

use crate::codec::primitives::DataReader;
use crate::error::CodecError;

/// Booleans packed eight per byte, least-significant bit first.
#[derive(Debug, Default, Clone)]
pub struct BooleanStream {
    data: Vec<u8>,
    write_pos: usize,
    read_pos: usize,
}

impl BooleanStream {
    /// Creates an empty stream ready for pass-one writes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one boolean to the stream.
    pub fn write_boolean(&mut self, value: bool) {
        let byte = self.write_pos / 8;
        if byte == self.data.len() {
            self.data.push(0);
        }
        if value {
            self.data[byte] |= 1 << (self.write_pos % 8);
        }
        self.write_pos += 1;
    }

    /// Reads the next boolean in write order.
    ///
    /// Pass two and unmarshalling both consume bits with this; running off
    /// the end means the two passes disagreed about the traversal.
    pub fn read_boolean(&mut self) -> Result<bool, CodecError> {
        let byte = self.read_pos / 8;
        if byte >= self.data.len() {
            return Err(CodecError::BooleanStreamExhausted);
        }
        let value = self.data[byte] & (1 << (self.read_pos % 8)) != 0;
        self.read_pos += 1;
        Ok(value)
    }

    /// Rewinds the read cursor so pass two can replay pass one's bits.
    pub fn reset_read(&mut self) {
        self.read_pos = 0;
    }

    /// Bytes this stream occupies on the wire, including its length prefix.
    pub fn marshalled_size(&self) -> usize {
        let len = self.data.len();
        if len < 64 {
            1 + len
        } else if len < 256 {
            2 + len
        } else {
            3 + len
        }
    }

    /// Writes the length prefix and packed bytes.
    pub fn marshal(&self, out: &mut impl BufMut) {
        let len = self.data.len();
        if len < 64 {
            out.put_u8(len as u8);
        } else if len < 256 {
            out.put_u8(0xC0);
            out.put_u8(len as u8);
        } else {
            out.put_u8(0x80);
            out.put_u16(len as u16);
        }
        out.put_slice(&self.data);
    }

    /// Reads a marshalled stream back, leaving the read cursor at the start.
    pub fn unmarshal(reader: &mut DataReader<'_>) -> Result<Self, CodecError> {
        let first = reader.read_u8()?;
        let len = match first {
            0xC0 => reader.read_u8()? as usize,
            0x80 => reader.read_u16()? as usize,
            n if n < 64 => n as usize,
            n => {
                return Err(CodecError::InvalidField {
                    field: "boolean stream length marker",
                    value: i64::from(n),
                });
            }
        };
        let data = reader.read_bytes(len)?.to_vec();
        Ok(Self {
            write_pos: data.len() * 8,
            data,
            read_pos: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn bits_round_trip_in_write_order() {
        let mut bs = BooleanStream::new();
        let pattern: Vec<bool> = (0..19).map(|i| i % 3 == 0).collect();
        for &bit in &pattern {
            bs.write_boolean(bit);
        }
        for &bit in &pattern {
            assert_eq!(bs.read_boolean().unwrap(), bit);
        }
    }

    #[test]
    fn reading_past_the_end_fails() {
        let mut bs = BooleanStream::new();
        bs.write_boolean(true);
        bs.read_boolean().unwrap();
        // A second byte was never written.
        for _ in 0..7 {
            bs.read_boolean().unwrap();
        }
        assert!(matches!(
            bs.read_boolean(),
            Err(CodecError::BooleanStreamExhausted)
        ));
    }

    #[test]
    fn short_stream_uses_single_byte_prefix() {
        let mut bs = BooleanStream::new();
        bs.write_boolean(true);
        bs.write_boolean(false);
        bs.write_boolean(true);

        let mut out = BytesMut::new();
        bs.marshal(&mut out);
        assert_eq!(out[0], 1);
        assert_eq!(out[1], 0b0000_0101);
        assert_eq!(out.len(), bs.marshalled_size());
    }

    #[test]
    fn long_stream_uses_marker_prefix() {
        let mut bs = BooleanStream::new();
        for i in 0..(64 * 8 + 3) {
            bs.write_boolean(i % 2 == 0);
        }
        let mut out = BytesMut::new();
        bs.marshal(&mut out);
        assert_eq!(out[0], 0xC0);
        assert_eq!(out[1], 65);
        assert_eq!(out.len(), bs.marshalled_size());

        let frozen = out.freeze();
        let mut reader = DataReader::new(&frozen);
        let mut decoded = BooleanStream::unmarshal(&mut reader).unwrap();
        for i in 0..(64 * 8 + 3) {
            assert_eq!(decoded.read_boolean().unwrap(), i % 2 == 0);
        }
    }
}
