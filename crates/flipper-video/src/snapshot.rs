//! Tag-length-value encoding for save states.
//!
//! Layout: 4-byte device id, device major/minor (u16 each), then `tag: u16, len: u32, bytes`
//! fields in ascending tag order. Unknown tags are skipped on load so minor versions can add
//! fields.

use std::collections::BTreeMap;

use crate::error::{SnapshotError, SnapshotResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotVersion {
    pub major: u16,
    pub minor: u16,
}

impl SnapshotVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub device_id: [u8; 4],
    pub device_version: SnapshotVersion,
}

const HEADER_LEN: usize = 8;

/// State owners that can be written into and restored from a save state.
pub trait StateSnapshot {
    const DEVICE_ID: [u8; 4];
    const DEVICE_VERSION: SnapshotVersion;
}

pub struct SnapshotWriter {
    header: SnapshotHeader,
    fields: BTreeMap<u16, Vec<u8>>,
}

impl SnapshotWriter {
    pub fn new(device_id: [u8; 4], device_version: SnapshotVersion) -> Self {
        Self {
            header: SnapshotHeader {
                device_id,
                device_version,
            },
            fields: BTreeMap::new(),
        }
    }

    pub fn field_bytes(&mut self, tag: u16, bytes: Vec<u8>) {
        let previous = self.fields.insert(tag, bytes);
        debug_assert!(previous.is_none(), "snapshot tag {tag} written twice");
    }

    pub fn field_u8(&mut self, tag: u16, v: u8) {
        self.field_bytes(tag, vec![v]);
    }

    pub fn field_bool(&mut self, tag: u16, v: bool) {
        self.field_u8(tag, u8::from(v));
    }

    pub fn field_u16(&mut self, tag: u16, v: u16) {
        self.field_bytes(tag, v.to_le_bytes().to_vec());
    }

    pub fn field_u32(&mut self, tag: u16, v: u32) {
        self.field_bytes(tag, v.to_le_bytes().to_vec());
    }

    pub fn field_u64(&mut self, tag: u16, v: u64) {
        self.field_bytes(tag, v.to_le_bytes().to_vec());
    }

    pub fn field_f32(&mut self, tag: u16, v: f32) {
        self.field_bytes(tag, v.to_le_bytes().to_vec());
    }

    pub fn finish(self) -> Vec<u8> {
        let body: usize = self.fields.values().map(|v| 6 + v.len()).sum();
        let mut out = Vec::with_capacity(HEADER_LEN + body);
        out.extend_from_slice(&self.header.device_id);
        out.extend_from_slice(&self.header.device_version.major.to_le_bytes());
        out.extend_from_slice(&self.header.device_version.minor.to_le_bytes());
        for (tag, value) in self.fields {
            out.extend_from_slice(&tag.to_le_bytes());
            out.extend_from_slice(&(value.len() as u32).to_le_bytes());
            out.extend_from_slice(&value);
        }
        out
    }
}

pub struct SnapshotReader<'a> {
    header: SnapshotHeader,
    fields: BTreeMap<u16, &'a [u8]>,
}

impl<'a> SnapshotReader<'a> {
    pub fn parse(bytes: &'a [u8], device_id: [u8; 4]) -> SnapshotResult<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(SnapshotError::UnexpectedEof);
        }
        let found: [u8; 4] = [bytes[0], bytes[1], bytes[2], bytes[3]];
        if found != device_id {
            return Err(SnapshotError::InvalidDeviceId {
                found,
                expected: device_id,
            });
        }
        let header = SnapshotHeader {
            device_id,
            device_version: SnapshotVersion::new(
                u16::from_le_bytes([bytes[4], bytes[5]]),
                u16::from_le_bytes([bytes[6], bytes[7]]),
            ),
        };

        let mut fields = BTreeMap::new();
        let mut rest = &bytes[HEADER_LEN..];
        while !rest.is_empty() {
            if rest.len() < 6 {
                return Err(SnapshotError::UnexpectedEof);
            }
            let tag = u16::from_le_bytes([rest[0], rest[1]]);
            let len = u32::from_le_bytes([rest[2], rest[3], rest[4], rest[5]]) as usize;
            let value = rest
                .get(6..6 + len)
                .ok_or(SnapshotError::UnexpectedEof)?;
            if fields.insert(tag, value).is_some() {
                return Err(SnapshotError::DuplicateFieldTag(tag));
            }
            rest = &rest[6 + len..];
        }

        Ok(Self { header, fields })
    }

    pub fn header(&self) -> &SnapshotHeader {
        &self.header
    }

    pub fn ensure_device_major(&self, major: u16) -> SnapshotResult<()> {
        let found = self.header.device_version.major;
        if found != major {
            return Err(SnapshotError::UnsupportedDeviceMajorVersion {
                found,
                expected: major,
            });
        }
        Ok(())
    }

    pub fn bytes(&self, tag: u16) -> Option<&'a [u8]> {
        self.fields.get(&tag).copied()
    }

    fn fixed<const N: usize>(&self, tag: u16, name: &'static str) -> SnapshotResult<Option<[u8; N]>> {
        match self.bytes(tag) {
            None => Ok(None),
            Some(raw) => raw
                .try_into()
                .map(Some)
                .map_err(|_| SnapshotError::InvalidFieldEncoding(name)),
        }
    }

    pub fn u8(&self, tag: u16) -> SnapshotResult<Option<u8>> {
        Ok(self.fixed::<1>(tag, "u8")?.map(|b| b[0]))
    }

    pub fn bool(&self, tag: u16) -> SnapshotResult<Option<bool>> {
        match self.u8(tag)? {
            None => Ok(None),
            Some(0) => Ok(Some(false)),
            Some(1) => Ok(Some(true)),
            Some(_) => Err(SnapshotError::InvalidFieldEncoding("bool")),
        }
    }

    pub fn u16(&self, tag: u16) -> SnapshotResult<Option<u16>> {
        Ok(self.fixed(tag, "u16")?.map(u16::from_le_bytes))
    }

    pub fn u32(&self, tag: u16) -> SnapshotResult<Option<u32>> {
        Ok(self.fixed(tag, "u32")?.map(u32::from_le_bytes))
    }

    pub fn u64(&self, tag: u16) -> SnapshotResult<Option<u64>> {
        Ok(self.fixed(tag, "u64")?.map(u64::from_le_bytes))
    }

    pub fn f32(&self, tag: u16) -> SnapshotResult<Option<f32>> {
        Ok(self.fixed(tag, "f32")?.map(f32::from_le_bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fields_are_written_in_tag_order() {
        let mut w = SnapshotWriter::new(*b"TEST", SnapshotVersion::new(1, 2));
        w.field_u32(7, 0xAABB_CCDD);
        w.field_bool(3, true);
        let bytes = w.finish();

        assert_eq!(&bytes[..8], b"TEST\x01\x00\x02\x00");
        assert_eq!(u16::from_le_bytes([bytes[8], bytes[9]]), 3);

        let r = SnapshotReader::parse(&bytes, *b"TEST").unwrap();
        assert_eq!(r.header().device_version, SnapshotVersion::new(1, 2));
        assert_eq!(r.bool(3).unwrap(), Some(true));
        assert_eq!(r.u32(7).unwrap(), Some(0xAABB_CCDD));
        assert_eq!(r.u32(8).unwrap(), None);
    }

    #[test]
    fn wrong_width_is_an_encoding_error() {
        let mut w = SnapshotWriter::new(*b"TEST", SnapshotVersion::new(1, 0));
        w.field_u8(1, 5);
        let bytes = w.finish();
        let r = SnapshotReader::parse(&bytes, *b"TEST").unwrap();
        assert_eq!(r.u32(1), Err(SnapshotError::InvalidFieldEncoding("u32")));
    }

    #[test]
    fn truncated_and_foreign_snapshots_are_rejected() {
        let mut w = SnapshotWriter::new(*b"TEST", SnapshotVersion::new(1, 0));
        w.field_bytes(1, vec![1, 2, 3, 4]);
        let bytes = w.finish();

        assert_eq!(
            SnapshotReader::parse(&bytes[..bytes.len() - 1], *b"TEST").err(),
            Some(SnapshotError::UnexpectedEof)
        );
        assert!(matches!(
            SnapshotReader::parse(&bytes, *b"OTHR"),
            Err(SnapshotError::InvalidDeviceId { .. })
        ));
        let r = SnapshotReader::parse(&bytes, *b"TEST").unwrap();
        assert!(r.ensure_device_major(2).is_err());
    }
}
