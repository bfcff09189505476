// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Byte-oriented archive with endianness tagging.
//!
//! Every archive carries the producing side's endianness in its first byte.
//! A consumer whose endianness matches decodes bitwise-serializable arrays
//! with a bulk copy; a consumer on the other endianness decodes them
//! element-wise. The flag travels with the data, not with the build.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::byteorder::{
    BigEndian,
    ByteOrder,
    LittleEndian,
};
use ::std::collections::BTreeMap;

//======================================================================================================================
// Enumerations
//======================================================================================================================

/// Byte order of the side that produced an archive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Endianness {
    Little,
    Big,
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Growable output archive.
pub struct WriteArchive {
    bytes: Vec<u8>,
    endian: Endianness,
}

/// Input archive over a byte slice.
pub struct ReadArchive<'a> {
    bytes: &'a [u8],
    pos: usize,
    endian: Endianness,
}

//======================================================================================================================
// Traits
//======================================================================================================================

/// Fixed-width scalar whose in-memory representation is its wire
/// representation up to byte order. Arrays of these travel as raw bytes
/// between same-endian hosts.
pub trait BitwiseSerializable: Copy + 'static {
    const WIDTH: usize;
    fn write(self, endian: Endianness, out: &mut Vec<u8>);
    fn read(endian: Endianness, bytes: &[u8]) -> Self;
}

/// A type that knows how to move through an archive.
pub trait Serializable: Sized {
    fn serialize(&self, archive: &mut WriteArchive);
    fn deserialize(archive: &mut ReadArchive) -> Result<Self, Fail>;
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Endianness {
    /// Byte order of this host.
    pub fn host() -> Self {
        if cfg!(target_endian = "big") {
            Endianness::Big
        } else {
            Endianness::Little
        }
    }

    fn to_flag(self) -> u8 {
        match self {
            Endianness::Little => 0,
            Endianness::Big => 1,
        }
    }

    fn from_flag(flag: u8) -> Result<Self, Fail> {
        match flag {
            0 => Ok(Endianness::Little),
            1 => Ok(Endianness::Big),
            _ => {
                let cause: String = format!("invalid endianness flag (flag={:?})", flag);
                error!("from_flag(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }
}

impl WriteArchive {
    /// Creates an archive tagged with the host's endianness.
    pub fn new() -> Self {
        Self::with_endianness(Endianness::host())
    }

    /// Creates an archive tagged with an explicit endianness. Values are
    /// written in that byte order; used by tests to fabricate foreign-host
    /// archives.
    pub fn with_endianness(endian: Endianness) -> Self {
        let mut bytes: Vec<u8> = Vec::new();
        bytes.push(endian.to_flag());
        Self { bytes, endian }
    }

    pub fn write_u8(&mut self, value: u8) {
        value.write(self.endian, &mut self.bytes);
    }

    pub fn write_u16(&mut self, value: u16) {
        value.write(self.endian, &mut self.bytes);
    }

    pub fn write_u32(&mut self, value: u32) {
        value.write(self.endian, &mut self.bytes);
    }

    pub fn write_u64(&mut self, value: u64) {
        value.write(self.endian, &mut self.bytes);
    }

    pub fn write_i64(&mut self, value: i64) {
        value.write(self.endian, &mut self.bytes);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.bytes.extend_from_slice(bytes);
    }

    /// Writes a length-prefixed array of bitwise-serializable elements. On
    /// the producer this is always a bulk write when the archive's byte order
    /// matches the host's.
    pub fn write_array<T: BitwiseSerializable>(&mut self, values: &[T]) {
        self.write_u64(values.len() as u64);
        if self.endian == Endianness::host() {
            // Same byte order: the in-memory representation is the wire
            // representation.
            let raw: &[u8] =
                unsafe { std::slice::from_raw_parts(values.as_ptr() as *const u8, values.len() * T::WIDTH) };
            self.bytes.extend_from_slice(raw);
        } else {
            for value in values {
                value.write(self.endian, &mut self.bytes);
            }
        }
    }

    /// Consumes the archive, yielding the wire bytes (flag byte included).
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl<'a> ReadArchive<'a> {
    /// Opens an archive, decoding the endianness flag.
    pub fn new(bytes: &'a [u8]) -> Result<Self, Fail> {
        if bytes.is_empty() {
            let cause: &str = "archive is empty";
            error!("new(): {}", cause);
            return Err(Fail::new(libc::EINVAL, cause));
        }
        let endian: Endianness = Endianness::from_flag(bytes[0])?;
        Ok(Self { bytes, pos: 1, endian })
    }

    /// Byte order the producer wrote this archive with.
    pub fn endianness(&self) -> Endianness {
        self.endian
    }

    pub fn read_u8(&mut self) -> Result<u8, Fail> {
        self.read_scalar::<u8>()
    }

    pub fn read_u16(&mut self) -> Result<u16, Fail> {
        self.read_scalar::<u16>()
    }

    pub fn read_u32(&mut self) -> Result<u32, Fail> {
        self.read_scalar::<u32>()
    }

    pub fn read_u64(&mut self) -> Result<u64, Fail> {
        self.read_scalar::<u64>()
    }

    pub fn read_i64(&mut self) -> Result<i64, Fail> {
        self.read_scalar::<i64>()
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], Fail> {
        let bytes: &'a [u8] = self.take(len)?;
        Ok(bytes)
    }

    /// Reads a length-prefixed array of bitwise-serializable elements. The
    /// bulk path is taken only when the archive's byte order matches this
    /// host's; otherwise elements are decoded one by one.
    pub fn read_array<T: BitwiseSerializable>(&mut self) -> Result<Vec<T>, Fail> {
        let count: usize = self.read_u64()? as usize;
        let byte_len: usize = count.checked_mul(T::WIDTH).ok_or_else(|| {
            let cause: &str = "array length overflow";
            error!("read_array(): {}", cause);
            Fail::new(libc::EINVAL, cause)
        })?;
        let raw: &[u8] = self.take(byte_len)?;

        if self.endian == Endianness::host() {
            let mut values: Vec<T> = Vec::with_capacity(count);
            // Safety: raw holds exactly `count` elements of `T::WIDTH` bytes
            // in this host's byte order, and `T` is a plain fixed-width
            // scalar.
            unsafe {
                std::ptr::copy_nonoverlapping(raw.as_ptr(), values.as_mut_ptr() as *mut u8, byte_len);
                values.set_len(count);
            }
            Ok(values)
        } else {
            let mut values: Vec<T> = Vec::with_capacity(count);
            for chunk in raw.chunks_exact(T::WIDTH) {
                values.push(T::read(self.endian, chunk));
            }
            Ok(values)
        }
    }

    fn read_scalar<T: BitwiseSerializable>(&mut self) -> Result<T, Fail> {
        let bytes: &[u8] = self.take(T::WIDTH)?;
        Ok(T::read(self.endian, bytes))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], Fail> {
        if self.pos + len > self.bytes.len() {
            let cause: String = format!(
                "archive underrun (pos={:?}, len={:?}, size={:?})",
                self.pos,
                len,
                self.bytes.len()
            );
            error!("take(): {}", cause);
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let slice: &'a [u8] = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for WriteArchive {
    fn default() -> Self {
        Self::new()
    }
}

impl BitwiseSerializable for u8 {
    const WIDTH: usize = 1;

    fn write(self, _endian: Endianness, out: &mut Vec<u8>) {
        out.push(self);
    }

    fn read(_endian: Endianness, bytes: &[u8]) -> Self {
        bytes[0]
    }
}

impl BitwiseSerializable for i8 {
    const WIDTH: usize = 1;

    fn write(self, _endian: Endianness, out: &mut Vec<u8>) {
        out.push(self as u8);
    }

    fn read(_endian: Endianness, bytes: &[u8]) -> Self {
        bytes[0] as i8
    }
}

macro_rules! bitwise_serializable {
    ($t:ty, $width:expr, $write_le:path, $write_be:path, $read_le:path, $read_be:path) => {
        impl BitwiseSerializable for $t {
            const WIDTH: usize = $width;

            fn write(self, endian: Endianness, out: &mut Vec<u8>) {
                let mut buf: [u8; $width] = [0; $width];
                match endian {
                    Endianness::Little => $write_le(&mut buf, self),
                    Endianness::Big => $write_be(&mut buf, self),
                }
                out.extend_from_slice(&buf);
            }

            fn read(endian: Endianness, bytes: &[u8]) -> Self {
                match endian {
                    Endianness::Little => $read_le(bytes),
                    Endianness::Big => $read_be(bytes),
                }
            }
        }
    };
}

bitwise_serializable!(u16, 2, LittleEndian::write_u16, BigEndian::write_u16, LittleEndian::read_u16, BigEndian::read_u16);
bitwise_serializable!(u32, 4, LittleEndian::write_u32, BigEndian::write_u32, LittleEndian::read_u32, BigEndian::read_u32);
bitwise_serializable!(u64, 8, LittleEndian::write_u64, BigEndian::write_u64, LittleEndian::read_u64, BigEndian::read_u64);
bitwise_serializable!(i16, 2, LittleEndian::write_i16, BigEndian::write_i16, LittleEndian::read_i16, BigEndian::read_i16);
bitwise_serializable!(i32, 4, LittleEndian::write_i32, BigEndian::write_i32, LittleEndian::read_i32, BigEndian::read_i32);
bitwise_serializable!(i64, 8, LittleEndian::write_i64, BigEndian::write_i64, LittleEndian::read_i64, BigEndian::read_i64);

macro_rules! serializable_scalar {
    ($t:ty) => {
        impl Serializable for $t {
            fn serialize(&self, archive: &mut WriteArchive) {
                BitwiseSerializable::write(*self, archive.endian, &mut archive.bytes);
            }

            fn deserialize(archive: &mut ReadArchive) -> Result<Self, Fail> {
                archive.read_scalar::<$t>()
            }
        }
    };
}

serializable_scalar!(u8);
serializable_scalar!(u16);
serializable_scalar!(u32);
serializable_scalar!(u64);
serializable_scalar!(i8);
serializable_scalar!(i16);
serializable_scalar!(i32);
serializable_scalar!(i64);

impl Serializable for bool {
    fn serialize(&self, archive: &mut WriteArchive) {
        archive.write_u8(u8::from(*self));
    }

    fn deserialize(archive: &mut ReadArchive) -> Result<Self, Fail> {
        Ok(archive.read_u8()? != 0)
    }
}

impl Serializable for char {
    fn serialize(&self, archive: &mut WriteArchive) {
        archive.write_u32(*self as u32);
    }

    fn deserialize(archive: &mut ReadArchive) -> Result<Self, Fail> {
        let raw: u32 = archive.read_u32()?;
        match char::from_u32(raw) {
            Some(c) => Ok(c),
            None => {
                let cause: String = format!("invalid character (raw={:?})", raw);
                error!("deserialize(): {}", cause);
                Err(Fail::new(libc::EINVAL, &cause))
            },
        }
    }
}

impl Serializable for String {
    fn serialize(&self, archive: &mut WriteArchive) {
        archive.write_u64(self.len() as u64);
        archive.write_bytes(self.as_bytes());
    }

    fn deserialize(archive: &mut ReadArchive) -> Result<Self, Fail> {
        let len: usize = archive.read_u64()? as usize;
        let bytes: &[u8] = archive.read_bytes(len)?;
        match std::str::from_utf8(bytes) {
            Ok(s) => Ok(s.to_string()),
            Err(_) => {
                let cause: &str = "string is not valid UTF-8";
                error!("deserialize(): {}", cause);
                Err(Fail::new(libc::EINVAL, cause))
            },
        }
    }
}

impl<T: Serializable> Serializable for Vec<T> {
    fn serialize(&self, archive: &mut WriteArchive) {
        archive.write_u64(self.len() as u64);
        for value in self {
            value.serialize(archive);
        }
    }

    fn deserialize(archive: &mut ReadArchive) -> Result<Self, Fail> {
        let len: usize = archive.read_u64()? as usize;
        let mut values: Vec<T> = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            values.push(T::deserialize(archive)?);
        }
        Ok(values)
    }
}

impl<K: Serializable + Ord, V: Serializable> Serializable for BTreeMap<K, V> {
    fn serialize(&self, archive: &mut WriteArchive) {
        archive.write_u64(self.len() as u64);
        for (key, value) in self {
            key.serialize(archive);
            value.serialize(archive);
        }
    }

    fn deserialize(archive: &mut ReadArchive) -> Result<Self, Fail> {
        let len: usize = archive.read_u64()? as usize;
        let mut map: BTreeMap<K, V> = BTreeMap::new();
        for _ in 0..len {
            let key: K = K::deserialize(archive)?;
            let value: V = V::deserialize(archive)?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
