//! Binary wire schema shared by every job and result.
//!
//! Layout rules:
//! - booleans and enumeration tags are single bytes;
//! - integers are fixed-width little-endian;
//! - strings are a `u32` byte length followed by UTF-8 bytes;
//! - collections are a `u32` element count followed by the elements;
//! - optional values are a presence byte followed by the value when present.
//!
//! Types describe their layout once by implementing [`Wire`], usually through
//! the `wire_record!` and `wire_enum!` macros, and every job reuses the same
//! reader and writer.

use crate::error::WireError;

/// A type with an explicit binary wire representation.
pub trait Wire: Sized {
    /// Appends the encoded value to the writer.
    fn encode(&self, writer: &mut WireWriter);

    /// Reads one value from the reader.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is truncated or malformed.
    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError>;
}

/// Append-only encoder.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
    overflow: Option<usize>,
}

/// Cursor over an encoded buffer.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl WireWriter {
    /// Creates an empty writer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            buf: Vec::new(),
            overflow: None,
        }
    }

    /// Creates a writer with a preallocated buffer.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            overflow: None,
        }
    }

    /// Writes a single byte.
    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Writes a boolean as `0` or `1`.
    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    /// Writes a little-endian `u16`.
    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a little-endian `u32`.
    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a little-endian `i32`.
    pub fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a little-endian `u64`.
    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a little-endian `i64`.
    pub fn put_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes a `u32` length or count prefix.
    pub fn put_len(&mut self, len: usize) {
        if let Ok(len32) = u32::try_from(len) {
            self.put_u32(len32);
        } else {
            // Recorded and reported by `finish`.
            self.overflow.get_or_insert(len);
            self.put_u32(u32::MAX);
        }
    }

    /// Writes length-prefixed raw bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_len(bytes.len());
        self.buf.extend_from_slice(bytes);
    }

    /// Writes a length-prefixed UTF-8 string.
    pub fn put_str(&mut self, value: &str) {
        self.put_bytes(value.as_bytes());
    }

    /// Returns the number of bytes written so far.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been written.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finishes encoding and returns the buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if any length exceeded the `u32` prefix.
    pub fn finish(self) -> Result<Vec<u8>, WireError> {
        match self.overflow {
            Some(length) => Err(WireError::LengthOverflow { length }),
            None => Ok(self.buf),
        }
    }
}

impl<'a> WireReader<'a> {
    /// Creates a reader over a buffer.
    #[must_use]
    pub const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Returns the number of unread bytes.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Consumes exactly `n` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if fewer than `n` bytes remain.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(WireError::UnexpectedEof {
                needed: n,
                remaining,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let slice = self.take(N)?;
        let mut array = [0u8; N];
        array.copy_from_slice(slice);
        Ok(array)
    }

    /// Reads a single byte.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is exhausted.
    pub fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take_array::<1>()?[0])
    }

    /// Reads a boolean; any byte other than `0` or `1` is rejected.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is exhausted or the byte is not a flag.
    pub fn get_bool(&mut self) -> Result<bool, WireError> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            tag => Err(WireError::InvalidTag {
                type_name: "bool",
                tag,
            }),
        }
    }

    /// Reads a little-endian `u16`.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is exhausted.
    pub fn get_u16(&mut self) -> Result<u16, WireError> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    /// Reads a little-endian `u32`.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is exhausted.
    pub fn get_u32(&mut self) -> Result<u32, WireError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    /// Reads a little-endian `i32`.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is exhausted.
    pub fn get_i32(&mut self) -> Result<i32, WireError> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    /// Reads a little-endian `u64`.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is exhausted.
    pub fn get_u64(&mut self) -> Result<u64, WireError> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    /// Reads a little-endian `i64`.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is exhausted.
    pub fn get_i64(&mut self) -> Result<i64, WireError> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    /// Reads a `u32` length or count prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is exhausted.
    pub fn get_len(&mut self) -> Result<usize, WireError> {
        let len = self.get_u32()?;
        usize::try_from(len).map_err(|_| WireError::LengthOverflow {
            length: usize::MAX,
        })
    }

    /// Reads length-prefixed raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is truncated.
    pub fn get_bytes(&mut self) -> Result<&'a [u8], WireError> {
        let len = self.get_len()?;
        self.take(len)
    }

    /// Reads a length-prefixed UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns an error if the input is truncated or not UTF-8.
    pub fn get_string(&mut self) -> Result<String, WireError> {
        let bytes = self.get_bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| WireError::InvalidUtf8)
    }

    /// Verifies the whole buffer was consumed.
    ///
    /// # Errors
    ///
    /// Returns an error if unread bytes remain.
    pub const fn finish(&self) -> Result<(), WireError> {
        match self.remaining() {
            0 => Ok(()),
            count => Err(WireError::TrailingBytes { count }),
        }
    }
}

/// Encodes a value into a fresh buffer.
///
/// # Errors
///
/// Returns an error if a length exceeds the `u32` prefix.
pub fn to_bytes<T: Wire>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut writer = WireWriter::new();
    value.encode(&mut writer);
    writer.finish()
}

/// Decodes a value that must span the entire buffer.
///
/// # Errors
///
/// Returns an error if the buffer is malformed or has trailing bytes.
pub fn from_bytes<T: Wire>(bytes: &[u8]) -> Result<T, WireError> {
    let mut reader = WireReader::new(bytes);
    let value = T::decode(&mut reader)?;
    reader.finish()?;
    Ok(value)
}

macro_rules! wire_int {
    ($($ty:ty => $put:ident, $get:ident;)*) => {
        $(
            impl Wire for $ty {
                fn encode(&self, writer: &mut WireWriter) {
                    writer.$put(*self);
                }

                fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
                    reader.$get()
                }
            }
        )*
    };
}

wire_int! {
    u8 => put_u8, get_u8;
    bool => put_bool, get_bool;
    u16 => put_u16, get_u16;
    u32 => put_u32, get_u32;
    i32 => put_i32, get_i32;
    u64 => put_u64, get_u64;
    i64 => put_i64, get_i64;
}

impl Wire for String {
    fn encode(&self, writer: &mut WireWriter) {
        writer.put_str(self);
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        reader.get_string()
    }
}

impl<T: Wire> Wire for Option<T> {
    fn encode(&self, writer: &mut WireWriter) {
        match self {
            Some(value) => {
                writer.put_bool(true);
                value.encode(writer);
            }
            None => writer.put_bool(false),
        }
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        if reader.get_bool()? {
            Ok(Some(T::decode(reader)?))
        } else {
            Ok(None)
        }
    }
}

impl<T: Wire> Wire for Vec<T> {
    fn encode(&self, writer: &mut WireWriter) {
        writer.put_len(self.len());
        for item in self {
            item.encode(writer);
        }
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        let count = reader.get_len()?;
        // Every element takes at least one byte, so a count larger than the
        // remaining input is malformed and must not drive the allocation.
        if count > reader.remaining() {
            return Err(WireError::UnexpectedEof {
                needed: count,
                remaining: reader.remaining(),
            });
        }
        let mut items = Self::with_capacity(count);
        for _ in 0..count {
            items.push(T::decode(reader)?);
        }
        Ok(items)
    }
}

/// Implements [`Wire`] for a struct by listing its fields in wire order.
macro_rules! wire_record {
    ($ty:ident { $($field:ident),* $(,)? }) => {
        impl $crate::job::wire::Wire for $ty {
            fn encode(&self, writer: &mut $crate::job::wire::WireWriter) {
                $( $crate::job::wire::Wire::encode(&self.$field, writer); )*
            }

            fn decode(
                reader: &mut $crate::job::wire::WireReader<'_>,
            ) -> ::std::result::Result<Self, $crate::error::WireError> {
                Ok(Self {
                    $( $field: $crate::job::wire::Wire::decode(reader)?, )*
                })
            }
        }
    };
}

/// Implements [`Wire`] for a fieldless enum as a single tag byte.
macro_rules! wire_enum {
    ($ty:ident { $($variant:ident = $tag:literal),* $(,)? }) => {
        impl $crate::job::wire::Wire for $ty {
            fn encode(&self, writer: &mut $crate::job::wire::WireWriter) {
                let tag: u8 = match self {
                    $( Self::$variant => $tag, )*
                };
                writer.put_u8(tag);
            }

            fn decode(
                reader: &mut $crate::job::wire::WireReader<'_>,
            ) -> ::std::result::Result<Self, $crate::error::WireError> {
                match reader.get_u8()? {
                    $( $tag => Ok(Self::$variant), )*
                    tag => Err($crate::error::WireError::InvalidTag {
                        type_name: stringify!($ty),
                        tag,
                    }),
                }
            }
        }
    };
}

pub(crate) use wire_enum;
pub(crate) use wire_record;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Color {
        Red,
        Blue,
    }

    wire_enum!(Color { Red = 1, Blue = 2 });

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Sample {
        flag: bool,
        count: u32,
        name: String,
        tags: Vec<String>,
        color: Option<Color>,
    }

    wire_record!(Sample {
        flag,
        count,
        name,
        tags,
        color,
    });

    #[test]
    fn test_fixed_layout() {
        let sample = Sample {
            flag: true,
            count: 0x0102_0304,
            name: String::from("ab"),
            tags: vec![],
            color: Some(Color::Blue),
        };

        let bytes = to_bytes(&sample).expect("encode");
        assert_eq!(
            bytes,
            vec![
                1, // flag
                0x04, 0x03, 0x02, 0x01, // count, little-endian
                2, 0, 0, 0, b'a', b'b', // name
                0, 0, 0, 0, // empty tags
                1, 2, // Some(Blue)
            ]
        );
    }

    #[test]
    fn test_empty_and_absent_values_survive() {
        let sample = Sample {
            flag: false,
            count: 0,
            name: String::new(),
            tags: vec![String::new(), String::from("x")],
            color: None,
        };

        let decoded: Sample = from_bytes(&to_bytes(&sample).expect("encode")).expect("decode");
        assert_eq!(decoded, sample);
    }

    #[test]
    fn test_truncated_input_fails() {
        let bytes = to_bytes(&String::from("hello")).expect("encode");
        let result: Result<String, _> = from_bytes(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(WireError::UnexpectedEof { .. })));
    }

    #[test]
    fn test_trailing_bytes_fail() {
        let mut bytes = to_bytes(&7u32).expect("encode");
        bytes.push(0);
        let result: Result<u32, _> = from_bytes(&bytes);
        assert!(matches!(result, Err(WireError::TrailingBytes { count: 1 })));
    }

    #[test]
    fn test_invalid_tags_fail() {
        assert!(matches!(
            from_bytes::<bool>(&[2]),
            Err(WireError::InvalidTag { type_name: "bool", tag: 2 })
        ));
        assert!(matches!(
            from_bytes::<Color>(&[9]),
            Err(WireError::InvalidTag { type_name: "Color", tag: 9 })
        ));
    }

    #[test]
    fn test_invalid_utf8_fails() {
        let bytes = [2, 0, 0, 0, 0xff, 0xfe];
        assert!(matches!(
            from_bytes::<String>(&bytes),
            Err(WireError::InvalidUtf8)
        ));
    }

    #[test]
    fn test_oversized_count_is_rejected() {
        let bytes = [0xff, 0xff, 0xff, 0x7f];
        assert!(matches!(
            from_bytes::<Vec<u8>>(&bytes),
            Err(WireError::UnexpectedEof { .. })
        ));
    }
}
