// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Codec registry. Codecs are selected by
// explicit, build-time registration rather than runtime type
// inspection: each map is generic over a `Codec<K>` and a `Codec<V>`
// chosen by the caller, either one of the built-in kinds below or a
// user's own implementation of the trait.
//
// `CodecKind` is a small tag persisted in the map header purely so a
// reopened map can refuse to proceed if the codec in use no longer
// matches the one the file was created with — it carries no behavior
// of its own.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::byte_store::{ReadCursor, WriteCursor};

/// Translates an in-memory value to/from the byte cursor.
/// `read_reusing` lets the map avoid allocating on read by reusing
/// a caller-owned instance; the default just delegates to `read`.
pub trait Codec<T>: Send + Sync {
    /// A short tag identifying this codec kind, stored in the header so
    /// a reopened map can be validated against it.
    fn kind(&self) -> CodecKind;

    /// Write `value`, advancing the cursor by the number of bytes
    /// written.
    fn write(&self, cursor: &mut WriteCursor, value: &T);

    /// Read a value, advancing the cursor by the number of bytes read.
    fn read(&self, cursor: &mut ReadCursor) -> T;

    /// Read a value into an existing instance instead of allocating a
    /// new one.
    fn read_reusing(&self, cursor: &mut ReadCursor, reusable: &mut T) {
        *reusable = self.read(cursor);
    }

    /// Encoded length of `value`, or `None` if it is not constant-size
    /// (variable-length codecs return `None` and the caller measures by
    /// encoding).
    fn fixed_size(&self) -> Option<usize> {
        None
    }

    /// Exact number of bytes `write` will produce for `value`. The
    /// entry layout (`entry.rs`) needs this *before* writing, to size
    /// the key/value fields and the chunk span to allocate.
    fn encoded_len(&self, value: &T) -> usize;
}

/// Encode `value` through `codec` into a heap scratch buffer and return
/// the bytes. Used by `segment.rs` to get a key's byte representation
/// for hashing and for byte-comparison against entries already in the
/// arena — the only place outside the arena itself that needs an
/// encoded key as plain bytes rather than written through a cursor at a
/// specific offset.
pub fn encode<T>(codec: &dyn Codec<T>, value: &T) -> Vec<u8> {
    let len = codec.encoded_len(value);
    let scratch = crate::byte_store::ByteStore::scratch(len);
    {
        let mut cursor = WriteCursor::new(&scratch, 0);
        codec.write(&mut cursor, value);
    }
    scratch.read_bytes(0, len).to_vec()
}

/// Tag for the built-in codec kinds, persisted in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CodecKind {
    U32 = 1,
    I32 = 2,
    U64 = 3,
    I64 = 4,
    F64 = 5,
    Utf8 = 6,
    ByteableByLayout = 7,
    GenericSerializing = 8,
    Custom = 0xff,
}

impl CodecKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::U32,
            2 => Self::I32,
            3 => Self::U64,
            4 => Self::I64,
            5 => Self::F64,
            6 => Self::Utf8,
            7 => Self::ByteableByLayout,
            8 => Self::GenericSerializing,
            0xff => Self::Custom,
            _ => return None,
        })
    }
}

macro_rules! fixed_width_codec {
    ($name:ident, $ty:ty, $kind:ident, $size:expr, $write:ident, $read:ident) => {
        /// Fixed-width numeric codec.
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl Codec<$ty> for $name {
            fn kind(&self) -> CodecKind {
                CodecKind::$kind
            }

            fn write(&self, cursor: &mut WriteCursor, value: &$ty) {
                cursor.$write(*value);
            }

            fn read(&self, cursor: &mut ReadCursor) -> $ty {
                cursor.$read()
            }

            fn fixed_size(&self) -> Option<usize> {
                Some($size)
            }

            fn encoded_len(&self, _value: &$ty) -> usize {
                $size
            }
        }
    };
}

fixed_width_codec!(U32Codec, u32, U32, 4, write_u32, read_u32);
fixed_width_codec!(I32Codec, i32, I32, 4, write_i32, read_i32);
fixed_width_codec!(U64Codec, u64, U64, 8, write_u64, read_u64);
fixed_width_codec!(I64Codec, i64, I64, 8, write_i64, read_i64);
fixed_width_codec!(F64Codec, f64, F64, 8, write_f64, read_f64);

/// Length-prefixed UTF-8 string codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct Utf8Codec;

impl Codec<String> for Utf8Codec {
    fn kind(&self) -> CodecKind {
        CodecKind::Utf8
    }

    fn write(&self, cursor: &mut WriteCursor, value: &String) {
        cursor.write_utf(value);
    }

    fn read(&self, cursor: &mut ReadCursor) -> String {
        cursor.read_utf()
    }

    fn encoded_len(&self, value: &String) -> usize {
        4 + value.len()
    }
}

/// A value whose on-disk image is byte-identical to its in-memory
/// representation: a `#[repr(C)]`, `Copy` struct with no padding the
/// caller cares about preserving. The codec just blits the bytes.
///
/// # Safety
/// Implementors must guarantee that every bit pattern produced by
/// `to_bytes`/consumed by `from_bytes` is a valid instance of `Self` —
/// i.e. no padding bytes are read as meaningful data and no invariant
/// can be violated by an arbitrary byte pattern of the right length.
pub unsafe trait Byteable: Copy {
    /// Size in bytes of the on-disk image.
    const SIZE: usize;

    fn to_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts((self as *const Self) as *const u8, Self::SIZE) }
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        assert_eq!(bytes.len(), Self::SIZE, "Byteable::from_bytes: size mismatch");
        unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const Self) }
    }
}

/// Codec for any [`Byteable`] type: the on-disk image is the struct's
/// raw memory image, byteable by layout rather than by serialization.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteableCodec<T>(std::marker::PhantomData<T>);

impl<T> ByteableCodec<T> {
    pub fn new() -> Self {
        Self(std::marker::PhantomData)
    }
}

impl<T: Byteable + Send + Sync> Codec<T> for ByteableCodec<T> {
    fn kind(&self) -> CodecKind {
        CodecKind::ByteableByLayout
    }

    fn write(&self, cursor: &mut WriteCursor, value: &T) {
        cursor.write_bytes(value.to_bytes());
    }

    fn read(&self, cursor: &mut ReadCursor) -> T {
        T::from_bytes(cursor.read_bytes(T::SIZE))
    }

    fn fixed_size(&self) -> Option<usize> {
        Some(T::SIZE)
    }

    fn encoded_len(&self, _value: &T) -> usize {
        T::SIZE
    }
}

/// Generic-serializing codec: any `Serialize + DeserializeOwned` type,
/// encoded with `bincode` and a `u32` length prefix so variable-length
/// values can be read back without knowing their size in advance.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerdeCodec<T>(std::marker::PhantomData<T>);

impl<T> SerdeCodec<T> {
    pub fn new() -> Self {
        Self(std::marker::PhantomData)
    }
}

impl<T: Serialize + DeserializeOwned + Send + Sync> Codec<T> for SerdeCodec<T> {
    fn kind(&self) -> CodecKind {
        CodecKind::GenericSerializing
    }

    fn write(&self, cursor: &mut WriteCursor, value: &T) {
        let bytes = bincode::serialize(value).expect("SerdeCodec: serialization failed");
        cursor.write_u32(bytes.len() as u32);
        cursor.write_bytes(&bytes);
    }

    fn read(&self, cursor: &mut ReadCursor) -> T {
        let len = cursor.read_u32() as usize;
        let bytes = cursor.read_bytes(len);
        bincode::deserialize(bytes).expect("SerdeCodec: deserialization failed")
    }

    fn encoded_len(&self, value: &T) -> usize {
        4 + bincode::serialized_size(value).expect("SerdeCodec: size computation failed") as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_store::ByteStore;
    use serde::{Deserialize, Serialize};

    #[test]
    fn fixed_width_round_trip() {
        let store = ByteStore::anonymous(64).unwrap();
        {
            let mut w = WriteCursor::new(&store, 0);
            U64Codec.write(&mut w, &123456789);
        }
        let mut r = ReadCursor::new(&store, 0);
        assert_eq!(U64Codec.read(&mut r), 123456789);
    }

    #[test]
    fn encode_helper_matches_manual_write() {
        let bytes = encode(&Utf8Codec, &"café".to_string());
        assert_eq!(bytes, {
            let store = ByteStore::anonymous(16).unwrap();
            let written = store.write_utf(0, "café");
            store.read_bytes(0, written).to_vec()
        });
    }

    #[test]
    fn utf8_round_trip() {
        let store = ByteStore::anonymous(64).unwrap();
        {
            let mut w = WriteCursor::new(&store, 0);
            Utf8Codec.write(&mut w, &"aye".to_string());
        }
        let mut r = ReadCursor::new(&store, 0);
        assert_eq!(Utf8Codec.read(&mut r), "aye");
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn serde_round_trip() {
        let store = ByteStore::anonymous(64).unwrap();
        let codec = SerdeCodec::<Point>::new();
        let p = Point { x: 3, y: -7 };
        {
            let mut w = WriteCursor::new(&store, 0);
            codec.write(&mut w, &p);
        }
        let mut r = ReadCursor::new(&store, 0);
        assert_eq!(codec.read(&mut r), p);
    }

    #[derive(Clone, Copy, Debug, PartialEq)]
    #[repr(C)]
    struct Vec2 {
        x: f64,
        y: f64,
    }

    unsafe impl Byteable for Vec2 {
        const SIZE: usize = std::mem::size_of::<Vec2>();
    }

    #[test]
    fn byteable_round_trip() {
        let store = ByteStore::anonymous(64).unwrap();
        let codec = ByteableCodec::<Vec2>::new();
        let v = Vec2 { x: 1.5, y: -2.5 };
        {
            let mut w = WriteCursor::new(&store, 0);
            codec.write(&mut w, &v);
        }
        let mut r = ReadCursor::new(&store, 0);
        assert_eq!(codec.read(&mut r), v);
    }
}
