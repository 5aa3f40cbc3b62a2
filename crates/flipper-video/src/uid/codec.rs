//! Fixed-width little-endian encoding for identities.
//!
//! Every identity type has a constant serialized length so identity logs can use fixed-size
//! records. Absent optional parts are written as zero bytes of the same length.

use thiserror::Error;

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum UidDecodeError {
    #[error("expected {expected} bytes of identity data, got {found}")]
    Length { expected: usize, found: usize },
    #[error("unexpected end of identity data")]
    UnexpectedEof,
    #[error("invalid value {value} for {field}")]
    InvalidField { field: &'static str, value: u64 },
}

pub(crate) trait WireEnum: Sized + Copy {
    fn from_raw(raw: u8) -> Option<Self>;
    fn raw(self) -> u8;
}

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:expr),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl $name {
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];
        }

        impl $crate::uid::codec::WireEnum for $name {
            fn from_raw(raw: u8) -> Option<Self> {
                match raw {
                    $(x if x == $value => Some(Self::$variant),)+
                    _ => None,
                }
            }

            fn raw(self) -> u8 {
                self as u8
            }
        }
    };
}
pub(crate) use wire_enum;

/// Identity types with a stable, fixed-size binary form.
pub trait FixedCodec: Sized {
    const SERIALIZED_LEN: usize;

    fn encode(&self, w: &mut UidWriter);
    fn decode(r: &mut UidReader<'_>) -> Result<Self, UidDecodeError>;

    fn to_bytes(&self) -> Vec<u8> {
        let mut w = UidWriter::with_capacity(Self::SERIALIZED_LEN);
        self.encode(&mut w);
        debug_assert_eq!(w.len(), Self::SERIALIZED_LEN);
        w.into_inner()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, UidDecodeError> {
        if bytes.len() != Self::SERIALIZED_LEN {
            return Err(UidDecodeError::Length {
                expected: Self::SERIALIZED_LEN,
                found: bytes.len(),
            });
        }
        let mut r = UidReader::new(bytes);
        Self::decode(&mut r)
    }
}

#[derive(Debug, Default)]
pub struct UidWriter {
    buf: Vec<u8>,
}

impl UidWriter {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn bool(&mut self, v: bool) {
        self.buf.push(v as u8);
    }

    pub fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub(crate) fn enumeration<T: WireEnum>(&mut self, v: T) {
        self.buf.push(v.raw());
    }

    pub fn zeroes(&mut self, len: usize) {
        self.buf.resize(self.buf.len() + len, 0);
    }

    /// Writes a presence byte followed by either the value or `T::SERIALIZED_LEN` zero bytes.
    pub fn optional<T: FixedCodec>(&mut self, v: Option<&T>) {
        match v {
            Some(v) => {
                self.bool(true);
                v.encode(self);
            }
            None => {
                self.bool(false);
                self.zeroes(T::SERIALIZED_LEN);
            }
        }
    }
}

#[derive(Debug)]
pub struct UidReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> UidReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], UidDecodeError> {
        let end = self.pos.checked_add(N).ok_or(UidDecodeError::UnexpectedEof)?;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(UidDecodeError::UnexpectedEof)?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, UidDecodeError> {
        Ok(self.take::<1>()?[0])
    }

    pub fn bool(&mut self, field: &'static str) -> Result<bool, UidDecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(UidDecodeError::InvalidField {
                field,
                value: value.into(),
            }),
        }
    }

    pub fn u16(&mut self) -> Result<u16, UidDecodeError> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    pub fn u32(&mut self) -> Result<u32, UidDecodeError> {
        Ok(u32::from_le_bytes(self.take()?))
    }

    pub fn u64(&mut self) -> Result<u64, UidDecodeError> {
        Ok(u64::from_le_bytes(self.take()?))
    }

    pub(crate) fn enumeration<T: WireEnum>(
        &mut self,
        field: &'static str,
    ) -> Result<T, UidDecodeError> {
        let raw = self.u8()?;
        T::from_raw(raw).ok_or(UidDecodeError::InvalidField {
            field,
            value: raw.into(),
        })
    }

    /// Counterpart of [`UidWriter::optional`]; the zero padding of an absent value must be zero.
    pub fn optional<T: FixedCodec>(
        &mut self,
        field: &'static str,
    ) -> Result<Option<T>, UidDecodeError> {
        if self.bool(field)? {
            return T::decode(self).map(Some);
        }
        for _ in 0..T::SERIALIZED_LEN {
            let value = self.u8()?;
            if value != 0 {
                return Err(UidDecodeError::InvalidField {
                    field,
                    value: value.into(),
                });
            }
        }
        Ok(None)
    }
}
