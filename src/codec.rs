//! Little-endian primitive cursors and the ed2k tag codec.
//!
//! Tags are the protocol's extensible (type, key, value) triples. Two wire
//! variants exist: the original "old-style" form with a length-prefixed key,
//! and the Lugdunum "new-style" form signaled by the high bit of the type
//! byte, with a single opcode byte as the key and a compact inline form for
//! short strings.

use std::fmt;

/// Tag type byte: 16-byte identifier.
pub const TAGTYPE_HASH: u8 = 0x01;
/// Tag type byte: UTF-8 text with a `u16` length prefix.
pub const TAGTYPE_STRING: u8 = 0x02;
/// Tag type byte: unsigned 32-bit integer.
pub const TAGTYPE_UINT32: u8 = 0x03;
/// Tag type byte: IEEE-754 binary32.
pub const TAGTYPE_FLOAT32: u8 = 0x04;
/// Tag type byte: boolean. Recognized and discarded.
pub const TAGTYPE_BOOL: u8 = 0x05;
/// Tag type byte: boolean array. Recognized and discarded.
pub const TAGTYPE_BOOLARRAY: u8 = 0x06;
/// Tag type byte: opaque bytes with a `u32` length prefix.
pub const TAGTYPE_BLOB: u8 = 0x07;
/// Tag type byte: unsigned 16-bit integer (new-style only on encode).
pub const TAGTYPE_UINT16: u8 = 0x08;
/// Tag type byte: unsigned 8-bit integer (new-style only on encode).
pub const TAGTYPE_UINT8: u8 = 0x09;
/// Tag type byte: BSOB. Recognized and discarded.
pub const TAGTYPE_BSOB: u8 = 0x0A;
/// Tag type byte: unsigned 64-bit integer.
pub const TAGTYPE_UINT64: u8 = 0x0B;

/// First of the new-style inline string types; `0x11..=0x20` carry their
/// length in the type byte itself (`type - 0x10` bytes, no length prefix).
pub const TAGTYPE_STR1: u8 = 0x11;
/// Last of the new-style inline string types (16 bytes).
pub const TAGTYPE_STR16: u8 = 0x20;

/// High bit of the type byte; set on new-style tags.
const NEW_STYLE_BIT: u8 = 0x80;

/// Longest string eligible for the inline short-string encoding.
const SHORT_STR_MAX: usize = (TAGTYPE_STR16 - TAGTYPE_STR1 + 1) as usize;

/// Errors produced while decoding primitives or tags.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The buffer ended before the value did. Terminal for the current
    /// packet, not for the connection.
    #[error("truncated value: needed {needed} more bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    /// A tag type byte this implementation cannot size. Parsing of the
    /// surrounding list stops here.
    #[error("unknown tag type 0x{0:02x}")]
    UnknownTagType(u8),
}

/// Errors produced while encoding tags.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// The string key does not fit the requested wire form.
    #[error("tag name of {0} bytes exceeds the u16 key length field")]
    NameTooLong(usize),
    /// The payload exceeds what its length prefix can express.
    #[error("value of {0} bytes exceeds the length prefix")]
    ValueTooLong(usize),
}

/// Little-endian read cursor over a borrowed byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Takes `n` raw bytes off the cursor.
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n - self.remaining(),
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes(b.try_into().expect("8 bytes")))
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    /// Reads a 16-byte identifier.
    pub fn read_hash(&mut self) -> Result<[u8; 16], CodecError> {
        let b = self.read_bytes(16)?;
        Ok(b.try_into().expect("16 bytes"))
    }
}

/// Little-endian append helpers. The sink is a plain `Vec` so writes never
/// fail; only value-shape problems surface as errors.
pub fn put_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn put_f32(out: &mut Vec<u8>, v: f32) {
    out.extend_from_slice(&v.to_bits().to_le_bytes());
}

/// A tag key: either a numeric opcode or a short name.
///
/// Old-style keys of length 1 collapse to the numeric form; new-style keys
/// are always numeric.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TagKey {
    Id(u8),
    Name(Vec<u8>),
}

impl From<u8> for TagKey {
    fn from(id: u8) -> Self {
        Self::Id(id)
    }
}

impl From<&str> for TagKey {
    fn from(name: &str) -> Self {
        Self::Name(name.as_bytes().to_vec())
    }
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TagKey::Id(id) => write!(f, "0x{id:02x}"),
            TagKey::Name(name) => write!(f, "{}", String::from_utf8_lossy(name)),
        }
    }
}

/// A decoded tag value.
///
/// All integer widths collapse into [`TagValue::Uint`]; the encoder picks
/// the narrowest wire width the numeric value fits in, so a round trip
/// through the wire preserves the value rather than the width.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Uint(u64),
    Float(f32),
    String(String),
    Blob(Vec<u8>),
    Hash([u8; 16]),
}

/// One decoded (key, value) pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    pub key: TagKey,
    pub value: TagValue,
}

impl Tag {
    pub fn new(key: impl Into<TagKey>, value: TagValue) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

/// Encodes one tag.
///
/// `new_style` requests the compact form: the type byte's high bit is set,
/// numeric keys shrink to a single byte, sub-u32 integers keep their narrow
/// width and short strings go inline. Named keys have no new-style form and
/// always emit the length-prefixed key.
pub fn write_tag(
    out: &mut Vec<u8>,
    tag: &Tag,
    new_style: bool,
) -> Result<(), EncodeError> {
    // Named keys have no new-style key field; the whole tag demotes.
    let new_style = new_style && matches!(tag.key, TagKey::Id(_));

    let ty = match (&tag.value, new_style) {
        (TagValue::Uint(v), true) if *v <= u8::MAX as u64 => TAGTYPE_UINT8,
        (TagValue::Uint(v), true) if *v <= u16::MAX as u64 => TAGTYPE_UINT16,
        (TagValue::Uint(v), _) if *v <= u32::MAX as u64 => TAGTYPE_UINT32,
        (TagValue::Uint(_), _) => TAGTYPE_UINT64,
        (TagValue::Float(_), _) => TAGTYPE_FLOAT32,
        (TagValue::String(s), true) if (1..=SHORT_STR_MAX).contains(&s.len()) => {
            TAGTYPE_STR1 + (s.len() as u8 - 1)
        }
        (TagValue::String(_), _) => TAGTYPE_STRING,
        (TagValue::Blob(_), _) => TAGTYPE_BLOB,
        (TagValue::Hash(_), _) => TAGTYPE_HASH,
    };

    if new_style {
        put_u8(out, ty | NEW_STYLE_BIT);
        match tag.key {
            TagKey::Id(id) => put_u8(out, id),
            TagKey::Name(_) => unreachable!("new_style implies numeric key"),
        }
    } else {
        put_u8(out, ty);
        match &tag.key {
            TagKey::Id(id) => {
                put_u16(out, 1);
                put_u8(out, *id);
            }
            TagKey::Name(name) => {
                let len = u16::try_from(name.len())
                    .map_err(|_| EncodeError::NameTooLong(name.len()))?;
                put_u16(out, len);
                out.extend_from_slice(name);
            }
        }
    }

    match &tag.value {
        TagValue::Uint(v) => match ty {
            TAGTYPE_UINT8 => put_u8(out, *v as u8),
            TAGTYPE_UINT16 => put_u16(out, *v as u16),
            TAGTYPE_UINT32 => put_u32(out, *v as u32),
            _ => put_u64(out, *v),
        },
        TagValue::Float(v) => put_f32(out, *v),
        TagValue::String(s) => {
            if ty == TAGTYPE_STRING {
                let len = u16::try_from(s.len())
                    .map_err(|_| EncodeError::ValueTooLong(s.len()))?;
                put_u16(out, len);
            }
            out.extend_from_slice(s.as_bytes());
        }
        TagValue::Blob(b) => {
            let len =
                u32::try_from(b.len()).map_err(|_| EncodeError::ValueTooLong(b.len()))?;
            put_u32(out, len);
            out.extend_from_slice(b);
        }
        TagValue::Hash(h) => out.extend_from_slice(h),
    }

    Ok(())
}

/// Decodes one tag off the cursor.
///
/// Returns `Ok(None)` for types that are recognized well enough to size and
/// step over but carry nothing we keep (BOOL, BOOL-ARRAY, BSOB).
pub fn read_tag(reader: &mut Reader<'_>) -> Result<Option<Tag>, CodecError> {
    let raw_ty = reader.read_u8()?;
    let new_style = raw_ty & NEW_STYLE_BIT != 0;
    let ty = raw_ty & !NEW_STYLE_BIT;

    let key = if new_style {
        TagKey::Id(reader.read_u8()?)
    } else {
        let len = reader.read_u16()? as usize;
        let bytes = reader.read_bytes(len)?;
        if len == 1 {
            TagKey::Id(bytes[0])
        } else {
            TagKey::Name(bytes.to_vec())
        }
    };

    let value = match ty {
        TAGTYPE_HASH => TagValue::Hash(reader.read_hash()?),
        TAGTYPE_STRING => {
            let len = reader.read_u16()? as usize;
            let bytes = reader.read_bytes(len)?;
            TagValue::String(String::from_utf8_lossy(bytes).into_owned())
        }
        TAGTYPE_UINT8 => TagValue::Uint(reader.read_u8()? as u64),
        TAGTYPE_UINT16 => TagValue::Uint(reader.read_u16()? as u64),
        TAGTYPE_UINT32 => TagValue::Uint(reader.read_u32()? as u64),
        TAGTYPE_UINT64 => TagValue::Uint(reader.read_u64()?),
        TAGTYPE_FLOAT32 => TagValue::Float(reader.read_f32()?),
        TAGTYPE_BLOB => {
            let len = reader.read_u32()? as usize;
            TagValue::Blob(reader.read_bytes(len)?.to_vec())
        }
        TAGTYPE_BOOL => {
            reader.read_u8()?;
            return Ok(None);
        }
        TAGTYPE_BOOLARRAY => {
            // Length is a bit count; the wire stores count/8 + 1 bytes.
            let bits = reader.read_u16()? as usize;
            reader.read_bytes(bits / 8 + 1)?;
            return Ok(None);
        }
        TAGTYPE_BSOB => {
            let len = reader.read_u8()? as usize;
            reader.read_bytes(len)?;
            return Ok(None);
        }
        TAGTYPE_STR1..=TAGTYPE_STR16 => {
            let len = (ty - TAGTYPE_STR1 + 1) as usize;
            let bytes = reader.read_bytes(len)?;
            TagValue::String(String::from_utf8_lossy(bytes).into_owned())
        }
        other => return Err(CodecError::UnknownTagType(other)),
    };

    Ok(Some(Tag { key, value }))
}

/// Decodes a `u32`-counted tag list.
///
/// Forward compatibility over strictness: an unknown type or a count that
/// overruns the payload stops the walk and yields the tags parsed so far.
/// Neither condition is an error to the caller.
pub fn read_tag_list(reader: &mut Reader<'_>) -> Vec<Tag> {
    let count = match reader.read_u32() {
        Ok(count) => count,
        Err(_) => return Vec::new(),
    };

    let mut tags = Vec::with_capacity(count.min(64) as usize);
    for n in 0..count {
        if reader.is_empty() {
            log::debug!("tag list claims {count} tags, payload ended after {n}");
            break;
        }
        match read_tag(reader) {
            Ok(Some(tag)) => tags.push(tag),
            Ok(None) => {}
            Err(CodecError::UnknownTagType(ty)) => {
                log::debug!("tag list: stopping at unknown tag type 0x{ty:02x}");
                break;
            }
            Err(err) => {
                log::debug!("tag list: stopping at tag {n}: {err}");
                break;
            }
        }
    }
    tags
}

/// Encodes a `u32`-counted tag list.
pub fn write_tag_list(
    out: &mut Vec<u8>,
    tags: &[Tag],
    new_style: bool,
) -> Result<(), EncodeError> {
    put_u32(out, tags.len() as u32);
    for tag in tags {
        write_tag(out, tag, new_style)?;
    }
    Ok(())
}
