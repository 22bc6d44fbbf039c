//! Tagged binary stream used for staged and persisted artifact blobs.
//!
//! # Responsibility
//! - Provide the primitive writer/reader pair every blob encoder builds on.
//! - Encode artifacts and folder trees (see submodules).
//!
//! # Invariants
//! - Each field is preceded by a LEB128 varint tag; tag `0` ends an object.
//! - Payload integers are fixed-width little-endian.
//! - Strings are varint-length-prefixed UTF-8.
//! - An unknown tag is a hard decode error; there is no skip path.

pub mod artifact;
pub mod folder;

pub use artifact::{decode_artifact, encode_artifact, BlobScope};
pub use folder::{decode_folder_tree, encode_folder_tree};

use thiserror::Error;
use uuid::Uuid;

/// Tag that terminates an object.
pub const END_TAG: u32 = 0;

pub type WireResult<T> = Result<T, WireError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("unexpected end of buffer: needed {needed} bytes, {remaining} left")]
    UnexpectedEof { needed: usize, remaining: usize },
    #[error("varint tag does not fit in 32 bits")]
    VarintOverflow,
    #[error("string payload is not valid utf-8")]
    InvalidUtf8,
    #[error("unknown tag {tag} while reading {context}")]
    UnknownTag { context: &'static str, tag: u32 },
    #[error("missing `{field}` while reading {context}")]
    MissingField {
        context: &'static str,
        field: &'static str,
    },
    #[error("invalid value while reading {context}: {detail}")]
    InvalidValue {
        context: &'static str,
        detail: String,
    },
    #[error("{0} trailing bytes after object end")]
    TrailingBytes(usize),
    #[error("payload of {0} bytes does not fit a 32-bit length prefix")]
    LengthOverflow(usize),
}

impl WireError {
    pub(crate) fn invalid(context: &'static str, detail: impl ToString) -> Self {
        Self::InvalidValue {
            context,
            detail: detail.to_string(),
        }
    }
}

/// Append-only encoder.
///
/// Writes never fail individually; the first oversized payload is kept and
/// reported by [`WireWriter::finish`].
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
    overflow: Option<usize>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> WireResult<Vec<u8>> {
        match self.overflow {
            Some(len) => Err(WireError::LengthOverflow(len)),
            None => Ok(self.buf),
        }
    }

    pub fn write_tag(&mut self, tag: u32) {
        self.write_varint(tag);
    }

    pub fn write_end(&mut self) {
        self.write_varint(END_TAG);
    }

    fn write_varint(&mut self, mut value: u32) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_str(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        if self.write_len(value.len()) {
            self.buf.extend_from_slice(value);
        }
    }

    fn write_len(&mut self, len: usize) -> bool {
        match u32::try_from(len) {
            Ok(len) => {
                self.write_varint(len);
                true
            }
            Err(_) => {
                self.overflow.get_or_insert(len);
                false
            }
        }
    }

    pub fn write_uuid(&mut self, value: Uuid) {
        self.buf.extend_from_slice(value.as_bytes());
    }

    /// Writes `tag` followed by the payload written by `field`.
    pub fn field(&mut self, tag: u32, field: impl FnOnce(&mut Self)) {
        self.write_tag(tag);
        field(self);
    }
}

/// Cursor-based decoder over a borrowed buffer.
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

    /// Fails unless the whole buffer was consumed.
    pub fn finish(&self) -> WireResult<()> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(WireError::TrailingBytes(extra)),
        }
    }

    fn take(&mut self, len: usize) -> WireResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(WireError::UnexpectedEof {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> WireResult<[u8; N]> {
        let mut array = [0u8; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    pub fn read_tag(&mut self) -> WireResult<u32> {
        self.read_varint()
    }

    fn read_varint(&mut self) -> WireResult<u32> {
        let mut value: u32 = 0;
        for index in 0..5 {
            let byte = self.read_u8()?;
            let chunk = u32::from(byte & 0x7F);
            if index == 4 && chunk > 0x0F {
                return Err(WireError::VarintOverflow);
            }
            value |= chunk << (7 * index);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(WireError::VarintOverflow)
    }

    pub fn read_u8(&mut self) -> WireResult<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> WireResult<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(WireError::invalid("bool", other)),
        }
    }

    pub fn read_u16(&mut self) -> WireResult<u16> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> WireResult<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> WireResult<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> WireResult<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_bytes(&mut self) -> WireResult<&'a [u8]> {
        let len = self.read_varint()? as usize;
        self.take(len)
    }

    pub fn read_string(&mut self) -> WireResult<String> {
        let bytes = self.read_bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| WireError::InvalidUtf8)
    }

    pub fn read_uuid(&mut self) -> WireResult<Uuid> {
        Ok(Uuid::from_bytes(self.take_array()?))
    }
}

/// Unwraps a required decoded field.
pub(crate) fn required<T>(
    value: Option<T>,
    context: &'static str,
    field: &'static str,
) -> WireResult<T> {
    value.ok_or(WireError::MissingField { context, field })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_tags_use_minimal_bytes() {
        let mut writer = WireWriter::new();
        writer.write_tag(1);
        writer.write_tag(300);
        let bytes = writer.finish().unwrap();
        assert_eq!(bytes, vec![0x01, 0xAC, 0x02]);

        let mut reader = WireReader::new(&bytes);
        assert_eq!(reader.read_tag().unwrap(), 1);
        assert_eq!(reader.read_tag().unwrap(), 300);
        reader.finish().unwrap();
    }

    #[test]
    fn payload_integers_are_fixed_width() {
        let mut writer = WireWriter::new();
        writer.write_u32(1);
        writer.write_u64(2);
        assert_eq!(writer.finish().unwrap().len(), 12);
    }

    #[test]
    fn oversized_varint_is_rejected() {
        let bytes = [0xFF, 0xFF, 0xFF, 0xFF, 0x7F];
        let mut reader = WireReader::new(&bytes);
        assert_eq!(reader.read_tag(), Err(WireError::VarintOverflow));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn length_beyond_u32_fails_on_finish() {
        let mut writer = WireWriter::new();
        writer.write_tag(1);
        let len = u32::MAX as usize + 1;
        assert!(!writer.write_len(len));
        writer.write_str("after");
        assert_eq!(writer.finish(), Err(WireError::LengthOverflow(len)));
    }

    #[test]
    fn truncated_payload_reports_eof() {
        let mut reader = WireReader::new(&[1, 2]);
        assert_eq!(
            reader.read_u32(),
            Err(WireError::UnexpectedEof {
                needed: 4,
                remaining: 2
            })
        );
    }

    #[test]
    fn strings_are_length_prefixed_utf8() {
        let mut writer = WireWriter::new();
        writer.write_str("Grüße");
        let bytes = writer.finish().unwrap();
        assert_eq!(bytes[0] as usize, "Grüße".len());
        assert_eq!(WireReader::new(&bytes).read_string().unwrap(), "Grüße");

        let invalid = [2u8, 0xC3, 0x28];
        assert_eq!(
            WireReader::new(&invalid).read_string(),
            Err(WireError::InvalidUtf8)
        );
    }
}
