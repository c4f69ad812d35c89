use qfs_types::{
    INODE_SIZE, InodeId, ParseError, S_IFEXT, S_IFMT, ensure_slice, read_le_u16, read_le_u32,
    write_bytes, write_le_u16, write_le_u32,
};
use serde::{Deserialize, Serialize};

const PAYLOAD_OFFSET: usize = 0x20;
/// Bytes available for extension payload.
pub const EXT_PAYLOAD_SIZE: usize = INODE_SIZE - PAYLOAD_OFFSET;

const ACL_ENTRY_SIZE: usize = 12;
const VSN_ENTRY_SIZE: usize = 32;
const PARENT_ENTRY_SIZE: usize = 8;

/// What an extension inode holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtensionKind {
    /// Symlink target too long for the base inode.
    Symlink,
    /// Removable-media attributes of a stub file.
    RemovableMedia,
    Acl,
    /// Multivolume-archive VSN list.
    Mva,
    /// Additional hard-link parents.
    HardLinkParents,
}

impl ExtensionKind {
    fn from_raw(raw: u16) -> Result<Self, ParseError> {
        match raw {
            1 => Ok(Self::Symlink),
            2 => Ok(Self::RemovableMedia),
            3 => Ok(Self::Acl),
            4 => Ok(Self::Mva),
            5 => Ok(Self::HardLinkParents),
            _ => Err(ParseError::InvalidField {
                field: "ext_kind",
                reason: "unknown extension kind",
            }),
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u16 {
        match self {
            Self::Symlink => 1,
            Self::RemovableMedia => 2,
            Self::Acl => 3,
            Self::Mva => 4,
            Self::HardLinkParents => 5,
        }
    }

    /// Maximum `count` for this kind.
    #[must_use]
    pub fn capacity(self) -> u16 {
        let entries = match self {
            Self::Symlink => EXT_PAYLOAD_SIZE,
            Self::RemovableMedia => 1,
            Self::Acl => EXT_PAYLOAD_SIZE / ACL_ENTRY_SIZE,
            Self::Mva => EXT_PAYLOAD_SIZE / VSN_ENTRY_SIZE,
            Self::HardLinkParents => EXT_PAYLOAD_SIZE / PARENT_ENTRY_SIZE,
        };
        u16::try_from(entries).unwrap_or(u16::MAX)
    }
}

/// Extension inode chained off a base inode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtensionInode {
    pub id: InodeId,
    /// Owning base inode.
    pub base: InodeId,
    /// Next extension in the chain, [`InodeId::NONE`] at the tail.
    pub next: InodeId,
    pub kind: ExtensionKind,
    pub count: u16,
    pub payload: Vec<u8>,
}

impl ExtensionInode {
    #[must_use]
    pub fn new(id: InodeId, base: InodeId, kind: ExtensionKind) -> Self {
        Self {
            id,
            base,
            next: InodeId::NONE,
            kind,
            count: 0,
            payload: vec![0; EXT_PAYLOAD_SIZE],
        }
    }

    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(bytes, 0, INODE_SIZE)?;
        if read_le_u32(bytes, 0x00)? & S_IFMT != S_IFEXT {
            return Err(ParseError::InvalidField {
                field: "ext_mode",
                reason: "not an extension inode",
            });
        }
        let kind = ExtensionKind::from_raw(read_le_u16(bytes, 0x1C)?)?;
        let count = read_le_u16(bytes, 0x1E)?;
        if count > kind.capacity() {
            return Err(ParseError::InvalidField {
                field: "ext_count",
                reason: "exceeds extension capacity",
            });
        }
        Ok(Self {
            id: InodeId::new(read_le_u32(bytes, 0x04)?, read_le_u32(bytes, 0x08)?),
            base: InodeId::new(read_le_u32(bytes, 0x0C)?, read_le_u32(bytes, 0x10)?),
            next: InodeId::new(read_le_u32(bytes, 0x14)?, read_le_u32(bytes, 0x18)?),
            kind,
            count,
            payload: ensure_slice(bytes, PAYLOAD_OFFSET, EXT_PAYLOAD_SIZE)?.to_vec(),
        })
    }

    pub fn write_into(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        write_bytes(bytes, 0, &[0_u8; INODE_SIZE])?;
        write_le_u32(bytes, 0x00, S_IFEXT)?;
        write_le_u32(bytes, 0x04, self.id.ino.0)?;
        write_le_u32(bytes, 0x08, self.id.generation.0)?;
        write_le_u32(bytes, 0x0C, self.base.ino.0)?;
        write_le_u32(bytes, 0x10, self.base.generation.0)?;
        write_le_u32(bytes, 0x14, self.next.ino.0)?;
        write_le_u32(bytes, 0x18, self.next.generation.0)?;
        write_le_u16(bytes, 0x1C, self.kind.to_raw())?;
        write_le_u16(bytes, 0x1E, self.count)?;
        let len = self.payload.len().min(EXT_PAYLOAD_SIZE);
        write_bytes(bytes, PAYLOAD_OFFSET, &self.payload[..len])?;
        Ok(())
    }

    /// Parent ids held by a hard-link-parents extension.
    pub fn hard_link_parents(&self) -> Result<Vec<InodeId>, ParseError> {
        if self.kind != ExtensionKind::HardLinkParents {
            return Ok(Vec::new());
        }
        (0..usize::from(self.count))
            .map(|i| {
                let off = i * PARENT_ENTRY_SIZE;
                Ok(InodeId::new(
                    read_le_u32(&self.payload, off)?,
                    read_le_u32(&self.payload, off + 4)?,
                ))
            })
            .collect()
    }

    /// Replace the parent list; ids beyond capacity are dropped.
    pub fn set_hard_link_parents(&mut self, parents: &[InodeId]) -> Result<(), ParseError> {
        let keep = parents.len().min(usize::from(self.kind.capacity()));
        self.payload = vec![0; EXT_PAYLOAD_SIZE];
        for (i, parent) in parents[..keep].iter().enumerate() {
            let off = i * PARENT_ENTRY_SIZE;
            write_le_u32(&mut self.payload, off, parent.ino.0)?;
            write_le_u32(&mut self.payload, off + 4, parent.generation.0)?;
        }
        self.count = u16::try_from(keep).map_err(|_| ParseError::IntegerConversion {
            field: "ext_count",
        })?;
        Ok(())
    }

    /// Symlink target bytes held by a symlink extension.
    #[must_use]
    pub fn symlink_target(&self) -> Option<&[u8]> {
        (self.kind == ExtensionKind::Symlink)
            .then(|| &self.payload[..usize::from(self.count).min(self.payload.len())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_round_trips() {
        let mut ext = ExtensionInode::new(
            InodeId::new(40, 2),
            InodeId::new(12, 5),
            ExtensionKind::HardLinkParents,
        );
        ext.next = InodeId::new(41, 1);
        ext.set_hard_link_parents(&[InodeId::new(2, 1), InodeId::new(9, 4)])
            .expect("set parents");

        let mut buf = vec![0_u8; INODE_SIZE];
        ext.write_into(&mut buf).expect("write");
        let parsed = ExtensionInode::parse_from_bytes(&buf).expect("parse");
        assert_eq!(parsed, ext);
        assert_eq!(
            parsed.hard_link_parents().expect("parents"),
            vec![InodeId::new(2, 1), InodeId::new(9, 4)]
        );
    }

    #[test]
    fn count_over_capacity_rejected() {
        let ext = ExtensionInode::new(InodeId::new(40, 1), InodeId::new(12, 1), ExtensionKind::Mva);
        let mut buf = vec![0_u8; INODE_SIZE];
        ext.write_into(&mut buf).expect("write");
        buf[0x1E..0x20].copy_from_slice(&16_u16.to_le_bytes());
        assert!(matches!(
            ExtensionInode::parse_from_bytes(&buf),
            Err(ParseError::InvalidField {
                field: "ext_count",
                ..
            })
        ));
    }

    #[test]
    fn non_extension_mode_rejected() {
        let buf = vec![0_u8; INODE_SIZE];
        assert!(ExtensionInode::parse_from_bytes(&buf).is_err());
    }

    #[test]
    fn capacities() {
        assert_eq!(ExtensionKind::Acl.capacity(), 40);
        assert_eq!(ExtensionKind::Mva.capacity(), 15);
        assert_eq!(ExtensionKind::HardLinkParents.capacity(), 60);
        assert_eq!(ExtensionKind::RemovableMedia.capacity(), 1);
    }
}
