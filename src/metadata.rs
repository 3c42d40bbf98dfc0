//! Per-frame metadata blob with typed accessors.
//!
//! Layout, little endian:
//!
//! ```text
//! magic "IPPM" | version u16 | entry count u16
//! entry count x (kind u32 | offset u32 | len u32)
//! payloads
//! ```
//!
//! Structured kinds are bincode-encoded. Embedded sensor lines are stored raw
//! and only present when the sensor produced them.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::capture::frame::{FrameMetadata, ImageInfo};
use crate::control::{ControlProperties, DynamicProperties};
use crate::error::{IppError, Result};

const MAGIC: &[u8; 4] = b"IPPM";
const VERSION: u16 = 1;
const HEADER_LEN: usize = 8;
const ENTRY_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetadataKind {
    ImageInfo,
    ControlProperties,
    DynamicProperties,
    EmbeddedDataTop,
    EmbeddedDataBottom,
}

impl MetadataKind {
    pub const ALL: [MetadataKind; 5] = [
        MetadataKind::ImageInfo,
        MetadataKind::ControlProperties,
        MetadataKind::DynamicProperties,
        MetadataKind::EmbeddedDataTop,
        MetadataKind::EmbeddedDataBottom,
    ];

    fn code(self) -> u32 {
        match self {
            MetadataKind::ImageInfo => 1,
            MetadataKind::ControlProperties => 2,
            MetadataKind::DynamicProperties => 3,
            MetadataKind::EmbeddedDataTop => 4,
            MetadataKind::EmbeddedDataBottom => 5,
        }
    }

    fn from_code(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    kind: MetadataKind,
    offset: usize,
    len: usize,
}

/// Immutable serialized [`FrameMetadata`].
#[derive(Debug, Clone)]
pub struct MetadataBlob {
    bytes: Bytes,
    entries: Vec<Entry>,
}

impl MetadataBlob {
    pub fn encode(meta: &FrameMetadata) -> Result<Self> {
        let mut payloads: Vec<(MetadataKind, Vec<u8>)> = vec![
            (MetadataKind::ImageInfo, bincode::serialize(&meta.image_info)?),
            (MetadataKind::ControlProperties, bincode::serialize(&meta.control)?),
            (MetadataKind::DynamicProperties, bincode::serialize(&meta.dynamic)?),
        ];
        if !meta.embedded_top.is_empty() {
            payloads.push((MetadataKind::EmbeddedDataTop, meta.embedded_top.clone()));
        }
        if !meta.embedded_bottom.is_empty() {
            payloads.push((MetadataKind::EmbeddedDataBottom, meta.embedded_bottom.clone()));
        }

        let table_len = HEADER_LEN + ENTRY_LEN * payloads.len();
        let total = table_len + payloads.iter().map(|(_, p)| p.len()).sum::<usize>();
        let mut buf = BytesMut::with_capacity(total);
        buf.put_slice(MAGIC);
        buf.put_u16_le(VERSION);
        buf.put_u16_le(payloads.len() as u16);

        let mut entries = Vec::with_capacity(payloads.len());
        let mut offset = table_len;
        for (kind, payload) in &payloads {
            buf.put_u32_le(kind.code());
            buf.put_u32_le(offset as u32);
            buf.put_u32_le(payload.len() as u32);
            entries.push(Entry {
                kind: *kind,
                offset,
                len: payload.len(),
            });
            offset += payload.len();
        }
        for (_, payload) in &payloads {
            buf.put_slice(payload);
        }

        Ok(Self {
            bytes: buf.freeze(),
            entries,
        })
    }

    /// Parse and bounds-check a blob produced by [`MetadataBlob::encode`].
    pub fn from_bytes(bytes: Bytes) -> Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
            return Err(IppError::MetadataCorrupt("bad header".into()));
        }
        let mut header = &bytes[4..];
        let version = header.get_u16_le();
        if version != VERSION {
            return Err(IppError::MetadataCorrupt(format!("unsupported version {version}")));
        }
        let count = header.get_u16_le() as usize;
        let table_len = HEADER_LEN + ENTRY_LEN * count;
        if bytes.len() < table_len {
            return Err(IppError::MetadataCorrupt("truncated entry table".into()));
        }

        let mut table = &bytes[HEADER_LEN..table_len];
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let code = table.get_u32_le();
            let offset = table.get_u32_le() as usize;
            let len = table.get_u32_le() as usize;
            let kind = MetadataKind::from_code(code)
                .ok_or_else(|| IppError::MetadataCorrupt(format!("unknown kind {code}")))?;
            if offset < table_len || offset.saturating_add(len) > bytes.len() {
                return Err(IppError::MetadataCorrupt(format!("{kind:?} out of bounds")));
            }
            entries.push(Entry { kind, offset, len });
        }
        Ok(Self { bytes, entries })
    }

    fn entry(&self, kind: MetadataKind) -> Result<Entry> {
        self.entries
            .iter()
            .find(|e| e.kind == kind)
            .copied()
            .ok_or(IppError::MetadataNotPresent(kind))
    }

    pub fn contains(&self, kind: MetadataKind) -> bool {
        self.entries.iter().any(|e| e.kind == kind)
    }

    pub fn get_size(&self, kind: MetadataKind) -> Result<usize> {
        Ok(self.entry(kind)?.len)
    }

    /// Copy the payload of `kind` into `dst`, returning the bytes written.
    pub fn get(&self, kind: MetadataKind, dst: &mut [u8]) -> Result<usize> {
        let src = self.get_address(kind)?;
        if dst.len() < src.len() {
            return Err(IppError::BufferTooSmall {
                needed: src.len(),
                got: dst.len(),
            });
        }
        dst[..src.len()].copy_from_slice(src);
        Ok(src.len())
    }

    /// Borrow the payload of `kind` in place.
    pub fn get_address(&self, kind: MetadataKind) -> Result<&[u8]> {
        let e = self.entry(kind)?;
        Ok(&self.bytes[e.offset..e.offset + e.len])
    }

    pub fn image_info(&self) -> Result<ImageInfo> {
        Ok(bincode::deserialize(self.get_address(MetadataKind::ImageInfo)?)?)
    }

    pub fn control_properties(&self) -> Result<ControlProperties> {
        Ok(bincode::deserialize(self.get_address(MetadataKind::ControlProperties)?)?)
    }

    pub fn dynamic_properties(&self) -> Result<DynamicProperties> {
        Ok(bincode::deserialize(self.get_address(MetadataKind::DynamicProperties)?)?)
    }

    pub fn decode(&self) -> Result<FrameMetadata> {
        let embedded = |kind| match self.get_address(kind) {
            Ok(bytes) => Ok(bytes.to_vec()),
            Err(IppError::MetadataNotPresent(_)) => Ok(Vec::new()),
            Err(e) => Err(e),
        };
        Ok(FrameMetadata {
            image_info: self.image_info()?,
            control: self.control_properties()?,
            dynamic: self.dynamic_properties()?,
            embedded_top: embedded(MetadataKind::EmbeddedDataTop)?,
            embedded_bottom: embedded(MetadataKind::EmbeddedDataBottom)?,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}
