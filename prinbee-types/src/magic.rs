//! The 4-byte ASCII magics recognized at the start of every persistent
//! structure (spec.md section 6).

use num_enum::{FromPrimitive, IntoPrimitive};

/// A recognized file or block magic, stored on disk as a little-endian
/// `u32` built from 4 ASCII bytes (spec.md section 6).
///
/// Unlike [`crate::scalar::ScalarType`], a magic genuinely is wire data --
/// it is the first thing read from any file or block -- so it leans on
/// `num_enum` the way `apfs-core` leans on it for `ObjectType`, with an
/// explicit fallback variant for anything unrecognized rather than a
/// parse error: spec.md section 6 lists `????` ("unknown / uninitialised")
/// as a first-class member of the table, not an error case.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive)]
#[repr(u32)]
pub enum Magic {
    /// Context file (`context.pb`).
    Context = Magic::tag(b"CTXT"),
    /// Complex-type definitions (`complex-types.pb`).
    ComplexType = Magic::tag(b"CXTP"),
    /// Table schema, per table, per version.
    Schema = Magic::tag(b"SCHM"),
    /// Table data.
    Table = Magic::tag(b"PTBL"),
    /// Primary index (OID -> offset).
    PrimaryIndex = Magic::tag(b"PIDX"),
    /// Secondary index (key -> OID).
    Index = Magic::tag(b"INDX"),
    /// Bloom filter.
    BloomFilter = Magic::tag(b"BLMF"),
    /// Blob block.
    Blob = Magic::tag(b"BLOB"),
    /// Data block.
    Data = Magic::tag(b"DATA"),
    /// Entry index block.
    EntryIndex = Magic::tag(b"EIDX"),
    /// Free block.
    FreeBlock = Magic::tag(b"FREE"),
    /// Free space block.
    FreeSpace = Magic::tag(b"FSPC"),
    /// Index pointers block.
    IndexPointers = Magic::tag(b"IDXP"),
    /// Indirect index block.
    IndirectIndex = Magic::tag(b"INDR"),
    /// Secondary index block.
    SecondaryIndex = Magic::tag(b"SIDX"),
    /// Schema list block.
    SchemaList = Magic::tag(b"SCHL"),
    /// Top index block.
    TopIndex = Magic::tag(b"TIDX"),
    /// Top indirect index block.
    TopIndirectIndex = Magic::tag(b"TIND"),
    /// Unknown / uninitialized (`????`).
    #[num_enum(default)]
    Unknown = Magic::tag(b"????"),
}

impl Magic {
    const fn tag(s: &[u8; 4]) -> u32 {
        // All Prinbee hosts are assumed little-endian byte order for the
        // in-memory representation of the 4-character tag (spec.md
        // section 6: "stored as a little-endian 32-bit integer").
        (s[0] as u32) | ((s[1] as u32) << 8) | ((s[2] as u32) << 16) | ((s[3] as u32) << 24)
    }

    /// The 4 ASCII bytes this magic is made of.
    pub fn as_bytes(self) -> [u8; 4] {
        let v: u32 = self.into();
        v.to_le_bytes()
    }

    /// The 4 ASCII characters as a `str`, when valid UTF-8 (they always are
    /// for the recognized table; `????` included).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Context => "CTXT",
            Self::ComplexType => "CXTP",
            Self::Schema => "SCHM",
            Self::Table => "PTBL",
            Self::PrimaryIndex => "PIDX",
            Self::Index => "INDX",
            Self::BloomFilter => "BLMF",
            Self::Blob => "BLOB",
            Self::Data => "DATA",
            Self::EntryIndex => "EIDX",
            Self::FreeBlock => "FREE",
            Self::FreeSpace => "FSPC",
            Self::IndexPointers => "IDXP",
            Self::IndirectIndex => "INDR",
            Self::SecondaryIndex => "SIDX",
            Self::SchemaList => "SCHL",
            Self::TopIndex => "TIDX",
            Self::TopIndirectIndex => "TIND",
            Self::Unknown => "????",
        }
    }
}

impl core::fmt::Display for Magic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_known_magics() {
        for m in [Magic::Context, Magic::Schema, Magic::BloomFilter, Magic::Table] {
            let raw: u32 = m.into();
            assert_eq!(Magic::from(raw), m);
        }
    }

    #[test]
    fn unrecognized_tag_is_unknown() {
        assert_eq!(Magic::from(0u32), Magic::Unknown);
    }

    #[test]
    fn context_bytes_are_ascii_ctxt() {
        assert_eq!(Magic::Context.as_bytes(), *b"CTXT");
    }
}
