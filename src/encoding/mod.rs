//! Deterministic binary encoding for the catalog snapshot and journal.
//!
//! The catalog owns its wire format outright, so the on-disk bytes never
//! shift under a dependency upgrade. Values are appended to a `Vec<u8>`
//! with [`Encode`] and read back through a [`Decoder`] cursor with
//! [`Decode`].
//!
//! # Wire format
//!
//! | Rust type          | Encoding                                     |
//! |--------------------|----------------------------------------------|
//! | `u8`               | 1 byte                                       |
//! | `u32`              | 4 bytes, little-endian                       |
//! | `u64`              | 8 bytes, little-endian                       |
//! | `bool`             | 1 byte (`0x00` = false, `0x01` = true)       |
//! | `[u8; N]`          | `N` raw bytes                                |
//! | `String`           | `[u32 len][utf-8 bytes]`                     |
//! | `PathBuf`          | `[u32 len][raw OS bytes]`                    |
//! | `Option<T>`        | `[u8 tag: 0=None, 1=Some][T if Some]`        |
//! | `(A, B)`           | `[A][B]`                                     |
//! | `Vec<T>`           | `[u32 count][T₁][T₂]…` via [`encode_vec`]    |
//! | `enum`             | `[u32 variant][fields…]` (hand-written)      |
//!
//! Decoders never panic: every read is bounds-checked and variable-length
//! fields are capped by [`MAX_BYTE_LEN`] and [`MAX_VEC_ELEMENTS`].


use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use thiserror::Error;

/// Maximum decoded length of a string or path (64 MiB).
pub const MAX_BYTE_LEN: u32 = 64 * 1024 * 1024;

/// Maximum decoded element count of a vector (64 M).
pub const MAX_VEC_ELEMENTS: u32 = 64 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced during encoding or decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof { needed: usize, available: usize },

    /// An enum discriminant was not recognised.
    #[error("invalid tag {tag} for {type_name}")]
    InvalidTag { tag: u32, type_name: &'static str },

    /// A bool field contained a byte other than `0x00` or `0x01`.
    #[error("invalid bool byte: 0x{0:02X}")]
    InvalidBool(u8),

    /// A string field was not valid UTF-8.
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A length or count exceeded its limit.
    #[error("length overflow: {0}")]
    LengthOverflow(String),

    /// Bytes were left over after a value that must fill its buffer.
    #[error("{0} trailing bytes after decoded value")]
    TrailingBytes(usize),
}

// ------------------------------------------------------------------------------------------------
// Core traits
// ------------------------------------------------------------------------------------------------

/// Serialize `self` by appending to a byte buffer.
///
/// Implementations must be deterministic: equal values produce equal bytes.
pub trait Encode {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Deserialize a value from the current position of a [`Decoder`].
pub trait Decode: Sized {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, EncodingError>;
}

/// Forward-only read cursor over an encoded buffer.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Consumes exactly `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], EncodingError> {
        if self.remaining() < n {
            return Err(EncodingError::UnexpectedEof {
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], EncodingError> {
        let mut arr = [0u8; N];
        arr.copy_from_slice(self.take(N)?);
        Ok(arr)
    }

    /// Reads a `u32` length prefix and checks it against `limit`.
    fn take_len(&mut self, limit: u32, what: &str) -> Result<usize, EncodingError> {
        let len = u32::decode(self)?;
        if len > limit {
            return Err(EncodingError::LengthOverflow(format!(
                "{what} length {len} exceeds {limit}"
            )));
        }
        Ok(len as usize)
    }
}

// ------------------------------------------------------------------------------------------------
// Convenience functions
// ------------------------------------------------------------------------------------------------

/// Encodes a value into a freshly allocated buffer.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Decodes a value that must occupy the whole of `buf`.
pub fn decode_exact<T: Decode>(buf: &[u8]) -> Result<T, EncodingError> {
    let mut dec = Decoder::new(buf);
    let value = T::decode(&mut dec)?;
    match dec.remaining() {
        0 => Ok(value),
        n => Err(EncodingError::TrailingBytes(n)),
    }
}

#[inline]
fn len_to_u32(len: usize) -> Result<u32, EncodingError> {
    u32::try_from(len)
        .map_err(|_| EncodingError::LengthOverflow(format!("length {len} exceeds u32::MAX")))
}

/// Writes `[u32 len][bytes]`.
fn encode_bytes(raw: &[u8], buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    len_to_u32(raw.len())?.encode_to(buf)?;
    buf.extend_from_slice(raw);
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Primitives
// ------------------------------------------------------------------------------------------------

impl Encode for u8 {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(*self);
        Ok(())
    }
}

impl Decode for u8 {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, EncodingError> {
        Ok(dec.take(1)?[0])
    }
}

impl Encode for u32 {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u32 {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, EncodingError> {
        Ok(u32::from_le_bytes(dec.take_array()?))
    }
}

impl Encode for u64 {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u64 {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, EncodingError> {
        Ok(u64::from_le_bytes(dec.take_array()?))
    }
}

impl Encode for bool {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(u8::from(*self));
        Ok(())
    }
}

impl Decode for bool {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, EncodingError> {
        match u8::decode(dec)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(EncodingError::InvalidBool(other)),
        }
    }
}

impl<const N: usize> Encode for [u8; N] {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl<const N: usize> Decode for [u8; N] {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, EncodingError> {
        dec.take_array()
    }
}

// ------------------------------------------------------------------------------------------------
// Strings and paths
// ------------------------------------------------------------------------------------------------

impl Encode for String {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encode_bytes(self.as_bytes(), buf)
    }
}

impl Encode for &str {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encode_bytes(self.as_bytes(), buf)
    }
}

impl Decode for String {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, EncodingError> {
        let len = dec.take_len(MAX_BYTE_LEN, "string")?;
        Ok(String::from_utf8(dec.take(len)?.to_vec())?)
    }
}

// Paths are stored as raw OS bytes, so they round-trip exactly on the
// platform that wrote them.
impl Encode for PathBuf {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encode_bytes(self.as_os_str().as_bytes(), buf)
    }
}

impl Decode for PathBuf {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, EncodingError> {
        let len = dec.take_len(MAX_BYTE_LEN, "path")?;
        Ok(PathBuf::from(OsStr::from_bytes(dec.take(len)?)))
    }
}

// ------------------------------------------------------------------------------------------------
// Composites
// ------------------------------------------------------------------------------------------------

impl<T: Encode> Encode for Option<T> {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            None => buf.push(0),
            Some(val) => {
                buf.push(1);
                val.encode_to(buf)?;
            }
        }
        Ok(())
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, EncodingError> {
        match u8::decode(dec)? {
            0 => Ok(None),
            1 => Ok(Some(T::decode(dec)?)),
            other => Err(EncodingError::InvalidTag {
                tag: u32::from(other),
                type_name: "Option<T>",
            }),
        }
    }
}

impl<A: Encode, B: Encode> Encode for (A, B) {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.0.encode_to(buf)?;
        self.1.encode_to(buf)
    }
}

impl<A: Decode, B: Decode> Decode for (A, B) {
    fn decode(dec: &mut Decoder<'_>) -> Result<Self, EncodingError> {
        let a = A::decode(dec)?;
        let b = B::decode(dec)?;
        Ok((a, b))
    }
}

/// Encodes a slice as `[u32 count][T₁][T₂]…`.
pub fn encode_vec<T: Encode>(items: &[T], buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    len_to_u32(items.len())?.encode_to(buf)?;
    for item in items {
        item.encode_to(buf)?;
    }
    Ok(())
}

/// Decodes a `Vec<T>` written by [`encode_vec`].
pub fn decode_vec<T: Decode>(dec: &mut Decoder<'_>) -> Result<Vec<T>, EncodingError> {
    let count = dec.take_len(MAX_VEC_ELEMENTS, "vector")?;
    // Each element takes at least one byte, so a corrupt count cannot
    // reserve more than the buffer could ever hold.
    let mut items = Vec::with_capacity(count.min(dec.remaining()));
    for _ in 0..count {
        items.push(T::decode(dec)?);
    }
    Ok(items)
}
