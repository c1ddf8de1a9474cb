//! Big-endian binary codec shared by every tier
//!
//! All multi-byte primitives are written big-endian with a fixed width.
//! Variable length data (strings, nested payloads) carries an `i32` length
//! prefix. Readers never panic: running past the end of the buffer or reading
//! a negative length yields [`ProfileError::MalformedPayload`].

use crate::error::{ProfileError, ProfileResult};
use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Operation tag of a collection update log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOp {
    Set = 0,
    Remove = 1,
    Insert = 2,
}

impl TryFrom<u8> for UpdateOp {
    type Error = ProfileError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(UpdateOp::Set),
            1 => Ok(UpdateOp::Remove),
            2 => Ok(UpdateOp::Insert),
            other => Err(ProfileError::malformed(format!(
                "unknown update operation {}",
                other
            ))),
        }
    }
}

/// Growable output buffer
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn put_i16(&mut self, value: i16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_f64(&mut self, value: f64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Writes a count or length prefix.
    ///
    /// Collections larger than `i32::MAX` cannot be represented on the wire;
    /// the length saturates, which the reader then rejects as truncated.
    pub fn put_len(&mut self, len: usize) {
        self.put_i32(i32::try_from(len).unwrap_or(i32::MAX));
    }

    /// Writes an `i32` length prefix followed by the raw bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_len(bytes.len());
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_str(&mut self, value: &str) {
        self.put_bytes(value.as_bytes());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a received payload
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, count: usize) -> ProfileResult<&'a [u8]> {
        if count > self.remaining() {
            return Err(ProfileError::malformed(format!(
                "needed {} bytes at offset {}, only {} left",
                count,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> ProfileResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn get_u8(&mut self) -> ProfileResult<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn get_bool(&mut self) -> ProfileResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    pub fn get_i16(&mut self) -> ProfileResult<i16> {
        Ok(i16::from_be_bytes(self.take_array()?))
    }

    pub fn get_i32(&mut self) -> ProfileResult<i32> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn get_i64(&mut self) -> ProfileResult<i64> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn get_f32(&mut self) -> ProfileResult<f32> {
        Ok(f32::from_be_bytes(self.take_array()?))
    }

    pub fn get_f64(&mut self) -> ProfileResult<f64> {
        Ok(f64::from_be_bytes(self.take_array()?))
    }

    /// Reads a count or length prefix, rejecting negative values.
    pub fn get_len(&mut self) -> ProfileResult<usize> {
        let raw = self.get_i32()?;
        usize::try_from(raw).map_err(|_| ProfileError::malformed(format!("negative length {}", raw)))
    }

    /// Reads a length prefix and validates it against the remaining buffer
    /// before taking the bytes.
    pub fn get_bytes(&mut self) -> ProfileResult<&'a [u8]> {
        let len = self.get_len()?;
        if len > self.remaining() {
            return Err(ProfileError::malformed(format!(
                "length prefix {} exceeds remaining {} bytes",
                len,
                self.remaining()
            )));
        }
        self.take(len)
    }

    pub fn get_string(&mut self) -> ProfileResult<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ProfileError::malformed(format!("invalid utf-8 string: {}", e)))
    }

    /// Fails when unread bytes are left over after a complete payload.
    pub fn expect_end(&self) -> ProfileResult<()> {
        if self.is_exhausted() {
            Ok(())
        } else {
            Err(ProfileError::malformed(format!(
                "{} trailing bytes after payload",
                self.remaining()
            )))
        }
    }
}

/// A value that can live inside an observable property.
///
/// Implementations define the fixed binary encoding and the human-readable
/// string form used by admin tooling.
pub trait WireValue: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Short type name used in diagnostics.
    const TYPE_NAME: &'static str;

    fn encode(&self, w: &mut WireWriter);
    fn decode(r: &mut WireReader<'_>) -> ProfileResult<Self>;
    fn to_wire_string(&self) -> String;
    fn parse_wire_string(input: &str) -> ProfileResult<Self>;
}

impl WireValue for bool {
    const TYPE_NAME: &'static str = "bool";

    fn encode(&self, w: &mut WireWriter) {
        w.put_bool(*self);
    }

    fn decode(r: &mut WireReader<'_>) -> ProfileResult<Self> {
        r.get_bool()
    }

    fn to_wire_string(&self) -> String {
        self.to_string()
    }

    fn parse_wire_string(input: &str) -> ProfileResult<Self> {
        match input.trim() {
            "true" | "True" | "1" => Ok(true),
            "false" | "False" | "0" => Ok(false),
            _ => Err(ProfileError::invalid_value(input, "expected a boolean")),
        }
    }
}

macro_rules! numeric_wire_value {
    ($ty:ty, $name:literal, $put:ident, $get:ident) => {
        impl WireValue for $ty {
            const TYPE_NAME: &'static str = $name;

            fn encode(&self, w: &mut WireWriter) {
                w.$put(*self);
            }

            fn decode(r: &mut WireReader<'_>) -> ProfileResult<Self> {
                r.$get()
            }

            fn to_wire_string(&self) -> String {
                self.to_string()
            }

            fn parse_wire_string(input: &str) -> ProfileResult<Self> {
                input
                    .trim()
                    .parse::<$ty>()
                    .map_err(|e| ProfileError::invalid_value(input, e))
            }
        }
    };
}

numeric_wire_value!(i32, "int", put_i32, get_i32);
numeric_wire_value!(i64, "long", put_i64, get_i64);
numeric_wire_value!(f32, "float", put_f32, get_f32);
numeric_wire_value!(f64, "double", put_f64, get_f64);

impl WireValue for String {
    const TYPE_NAME: &'static str = "string";

    fn encode(&self, w: &mut WireWriter) {
        w.put_str(self);
    }

    fn decode(r: &mut WireReader<'_>) -> ProfileResult<Self> {
        r.get_string()
    }

    fn to_wire_string(&self) -> String {
        self.clone()
    }

    fn parse_wire_string(input: &str) -> ProfileResult<Self> {
        Ok(input.to_string())
    }
}

/// Date-times travel as unix milliseconds; sub-millisecond precision is
/// truncated on encode.
impl WireValue for OffsetDateTime {
    const TYPE_NAME: &'static str = "datetime";

    fn encode(&self, w: &mut WireWriter) {
        let millis = self.unix_timestamp_nanos() / 1_000_000;
        w.put_i64(i64::try_from(millis).unwrap_or(i64::MAX));
    }

    fn decode(r: &mut WireReader<'_>) -> ProfileResult<Self> {
        let millis = r.get_i64()?;
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
            .map_err(|e| ProfileError::malformed(format!("date-time out of range: {}", e)))
    }

    fn to_wire_string(&self) -> String {
        self.format(&Rfc3339)
            .unwrap_or_else(|_| self.unix_timestamp().to_string())
    }

    fn parse_wire_string(input: &str) -> ProfileResult<Self> {
        OffsetDateTime::parse(input.trim(), &Rfc3339).map_err(|e| ProfileError::invalid_value(input, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn test_big_endian_layout() {
        let mut w = WireWriter::new();
        w.put_i16(0x0102);
        w.put_i32(0x0A0B0C0D);
        assert_eq!(w.into_bytes(), vec![0x01, 0x02, 0x0A, 0x0B, 0x0C, 0x0D]);
    }

    #[test]
    fn test_reader_reads_back_primitives() {
        let mut w = WireWriter::new();
        w.put_bool(true);
        w.put_i64(-42);
        w.put_f32(1.5);
        w.put_f64(-2.25);
        w.put_str("héllo");
        let bytes = w.into_bytes();

        let mut r = WireReader::new(&bytes);
        assert!(r.get_bool().unwrap());
        assert_eq!(r.get_i64().unwrap(), -42);
        assert_approx_eq!(r.get_f32().unwrap(), 1.5);
        assert_approx_eq!(r.get_f64().unwrap(), -2.25);
        assert_eq!(r.get_string().unwrap(), "héllo");
        assert!(r.expect_end().is_ok());
    }

    #[test]
    fn test_truncated_read_is_malformed() {
        let bytes = [0x00, 0x01];
        let mut r = WireReader::new(&bytes);
        let err = r.get_i32().unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn test_length_prefix_exceeding_buffer() {
        let mut w = WireWriter::new();
        w.put_i32(100);
        w.put_u8(1);
        let bytes = w.into_bytes();
        let mut r = WireReader::new(&bytes);
        assert!(matches!(
            r.get_bytes(),
            Err(ProfileError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn test_negative_length_rejected() {
        let mut w = WireWriter::new();
        w.put_i32(-1);
        let bytes = w.into_bytes();
        assert!(WireReader::new(&bytes).get_len().is_err());
    }

    #[test]
    fn test_update_op_tags() {
        assert_eq!(UpdateOp::try_from(0).unwrap(), UpdateOp::Set);
        assert_eq!(UpdateOp::try_from(1).unwrap(), UpdateOp::Remove);
        assert_eq!(UpdateOp::try_from(2).unwrap(), UpdateOp::Insert);
        assert!(UpdateOp::try_from(3).is_err());
        assert_eq!(UpdateOp::Remove as u8, 1);
    }

    #[test]
    fn test_datetime_millisecond_encoding() {
        let when = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let mut w = WireWriter::new();
        when.encode(&mut w);
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), 8);
        assert_eq!(
            i64::from_be_bytes(bytes.clone().try_into().unwrap()),
            1_700_000_000_000
        );
        let decoded = OffsetDateTime::decode(&mut WireReader::new(&bytes)).unwrap();
        assert_eq!(decoded, when);
    }

    #[test]
    fn test_string_forms() {
        assert_eq!(true.to_wire_string(), "true");
        assert!(!bool::parse_wire_string("0").unwrap());
        assert_eq!(i32::parse_wire_string(" 17 ").unwrap(), 17);
        assert!(i32::parse_wire_string("abc").is_err());

        let when = OffsetDateTime::from_unix_timestamp(0).unwrap();
        let text = when.to_wire_string();
        assert_eq!(text, "1970-01-01T00:00:00Z");
        assert_eq!(OffsetDateTime::parse_wire_string(&text).unwrap(), when);
    }

    #[test]
    fn test_invalid_utf8_is_malformed() {
        let mut w = WireWriter::new();
        w.put_bytes(&[0xFF, 0xFE]);
        let bytes = w.into_bytes();
        assert!(WireReader::new(&bytes).get_string().is_err());
    }
}
