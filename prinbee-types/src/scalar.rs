//! The closed enumeration of scalar field types (spec.md section 3) and the
//! per-type size table (spec.md section 4.3).

use crate::error::TypeError;

/// One of the frozen, on-disk scalar types a field descriptor can name.
///
/// The discriminant values are part of the on-disk format only insofar as
/// user complex-type registries may need to serialize them; ordinary field
/// descriptors are Rust-side static data, not wire data, so changing the
/// enum's numeric values does not break file compatibility by itself (the
/// wire format never stores a `ScalarType` tag directly -- a field's type
/// is implied by its position in the static descriptor, per spec.md
/// section 4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ScalarType {
    End,
    Void,

    Bits8,
    Bits16,
    Bits32,
    Bits64,
    Bits128,
    Bits256,
    Bits512,

    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Int128,
    Uint128,
    Int256,
    Uint256,
    Int512,
    Uint512,

    Float32,
    Float64,
    Float128,

    Magic,
    StructureVersion,
    Version,

    Time,
    MsTime,
    UsTime,
    NsTime,

    Char,
    P8String,
    P16String,
    P32String,

    Structure,

    Array8,
    Array16,
    Array32,

    Buffer8,
    Buffer16,
    Buffer32,

    Reference,
    Oid,

    Renamed,
}

impl TryFrom<u16> for ScalarType {
    type Error = TypeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        // num_enum's derive only implements `TryFromPrimitive` on an enum
        // whose variants are all unit and whose discriminants it controls;
        // we instead enumerate explicitly so new variants cannot silently
        // shift the numbering a file on disk might depend on.
        Ok(match value {
            0 => Self::End,
            1 => Self::Void,
            2 => Self::Bits8,
            3 => Self::Bits16,
            4 => Self::Bits32,
            5 => Self::Bits64,
            6 => Self::Bits128,
            7 => Self::Bits256,
            8 => Self::Bits512,
            9 => Self::Int8,
            10 => Self::Uint8,
            11 => Self::Int16,
            12 => Self::Uint16,
            13 => Self::Int32,
            14 => Self::Uint32,
            15 => Self::Int64,
            16 => Self::Uint64,
            17 => Self::Int128,
            18 => Self::Uint128,
            19 => Self::Int256,
            20 => Self::Uint256,
            21 => Self::Int512,
            22 => Self::Uint512,
            23 => Self::Float32,
            24 => Self::Float64,
            25 => Self::Float128,
            26 => Self::Magic,
            27 => Self::StructureVersion,
            28 => Self::Version,
            29 => Self::Time,
            30 => Self::MsTime,
            31 => Self::UsTime,
            32 => Self::NsTime,
            33 => Self::Char,
            34 => Self::P8String,
            35 => Self::P16String,
            36 => Self::P32String,
            37 => Self::Structure,
            38 => Self::Array8,
            39 => Self::Array16,
            40 => Self::Array32,
            41 => Self::Buffer8,
            42 => Self::Buffer16,
            43 => Self::Buffer32,
            44 => Self::Reference,
            45 => Self::Oid,
            46 => Self::Renamed,
            other => {
                return Err(TypeError::InvalidType(alloc::format!(
                    "struct_type_t({other})"
                )))
            }
        })
    }
}

/// The static byte size of a scalar type, per spec.md section 4.3.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StaticSize {
    /// Always occupies exactly this many bytes.
    Fixed(usize),
    /// Occupies a length prefix plus a runtime-determined payload.
    Variable,
    /// Cannot appear as a standalone value (e.g. `END`, `CHAR`, `RENAMED`).
    Invalid,
}

/// The length-prefix size prepended to a variable-size field's payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LengthPrefixSize {
    None,
    One,
    Two,
    Four,
}

impl LengthPrefixSize {
    pub fn bytes(self) -> usize {
        match self {
            Self::None => 0,
            Self::One => 1,
            Self::Two => 2,
            Self::Four => 4,
        }
    }
}

impl ScalarType {
    /// The static byte size table from spec.md section 4.3.
    pub fn static_size(self) -> StaticSize {
        use StaticSize::{Fixed, Invalid, Variable};
        match self {
            Self::End => Invalid,
            Self::Void => Fixed(0),

            Self::Bits8 => Fixed(1),
            Self::Bits16 => Fixed(2),
            Self::Bits32 => Fixed(4),
            Self::Bits64 => Fixed(8),
            Self::Bits128 => Fixed(16),
            Self::Bits256 => Fixed(32),
            Self::Bits512 => Fixed(64),

            Self::Int8 | Self::Uint8 => Fixed(1),
            Self::Int16 | Self::Uint16 => Fixed(2),
            Self::Int32 | Self::Uint32 => Fixed(4),
            Self::Int64 | Self::Uint64 => Fixed(8),
            Self::Int128 | Self::Uint128 => Fixed(16),
            Self::Int256 | Self::Uint256 => Fixed(32),
            Self::Int512 | Self::Uint512 => Fixed(64),

            Self::Float32 => Fixed(4),
            Self::Float64 => Fixed(8),
            Self::Float128 => Fixed(16),

            Self::Magic => Fixed(4),
            Self::StructureVersion | Self::Version => Fixed(4),

            Self::Time | Self::MsTime | Self::UsTime => Fixed(8),
            Self::NsTime => Fixed(16),

            Self::Char => Invalid, // fixed, but size comes from the field name, not the type
            Self::P8String | Self::P16String | Self::P32String => Variable,

            Self::Structure => Variable, // fixed in practice, but summed from sub-fields
            Self::Array8 | Self::Array16 | Self::Array32 => Variable,
            Self::Buffer8 | Self::Buffer16 | Self::Buffer32 => Variable,

            Self::Reference | Self::Oid => Fixed(8),

            Self::Renamed => Invalid,
        }
    }

    /// The length-prefix size table from spec.md section 4.3.
    pub fn length_prefix_size(self) -> LengthPrefixSize {
        match self {
            Self::P8String | Self::Array8 | Self::Buffer8 => LengthPrefixSize::One,
            Self::P16String | Self::Array16 | Self::Buffer16 => LengthPrefixSize::Two,
            Self::P32String | Self::Array32 | Self::Buffer32 => LengthPrefixSize::Four,
            _ => LengthPrefixSize::None,
        }
    }

    /// True if this type's descriptor must carry a sub-description.
    pub fn requires_sub_description(self) -> bool {
        matches!(
            self,
            Self::Structure | Self::Array8 | Self::Array16 | Self::Array32 | Self::Renamed
        )
    }

    /// True if this type's descriptor must carry the inline bit-field name
    /// grammar (`name=flag:size/...`).
    pub fn is_bit_field(self) -> bool {
        matches!(
            self,
            Self::Bits8 | Self::Bits16 | Self::Bits32 | Self::Bits64 | Self::Bits128 | Self::Bits256 | Self::Bits512
        )
    }

    /// The bit width of a `BITS*` container, for flag range checks.
    pub fn bit_field_width(self) -> Option<usize> {
        match self {
            Self::Bits8 => Some(8),
            Self::Bits16 => Some(16),
            Self::Bits32 => Some(32),
            Self::Bits64 => Some(64),
            Self::Bits128 => Some(128),
            Self::Bits256 => Some(256),
            Self::Bits512 => Some(512),
            _ => None,
        }
    }

    /// True if this is one of the `INT*`/`UINT*` large-integer family
    /// (including `BITS*`, `REFERENCE`, `OID`, `MAGIC`, `VERSION`).
    pub fn is_integer_like(self) -> bool {
        !matches!(
            self,
            Self::End
                | Self::Void
                | Self::Float32
                | Self::Float64
                | Self::Float128
                | Self::Char
                | Self::P8String
                | Self::P16String
                | Self::P32String
                | Self::Structure
                | Self::Array8
                | Self::Array16
                | Self::Array32
                | Self::Buffer8
                | Self::Buffer16
                | Self::Buffer32
                | Self::Renamed
        )
    }

    /// True for signed integer types.
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64 | Self::Int128 | Self::Int256 | Self::Int512
        )
    }
}

impl core::fmt::Display for ScalarType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Self::End => "END",
            Self::Void => "VOID",
            Self::Bits8 => "BITS8",
            Self::Bits16 => "BITS16",
            Self::Bits32 => "BITS32",
            Self::Bits64 => "BITS64",
            Self::Bits128 => "BITS128",
            Self::Bits256 => "BITS256",
            Self::Bits512 => "BITS512",
            Self::Int8 => "INT8",
            Self::Uint8 => "UINT8",
            Self::Int16 => "INT16",
            Self::Uint16 => "UINT16",
            Self::Int32 => "INT32",
            Self::Uint32 => "UINT32",
            Self::Int64 => "INT64",
            Self::Uint64 => "UINT64",
            Self::Int128 => "INT128",
            Self::Uint128 => "UINT128",
            Self::Int256 => "INT256",
            Self::Uint256 => "UINT256",
            Self::Int512 => "INT512",
            Self::Uint512 => "UINT512",
            Self::Float32 => "FLOAT32",
            Self::Float64 => "FLOAT64",
            Self::Float128 => "FLOAT128",
            Self::Magic => "MAGIC",
            Self::StructureVersion => "STRUCTURE_VERSION",
            Self::Version => "VERSION",
            Self::Time => "TIME",
            Self::MsTime => "MSTIME",
            Self::UsTime => "USTIME",
            Self::NsTime => "NSTIME",
            Self::Char => "CHAR",
            Self::P8String => "P8STRING",
            Self::P16String => "P16STRING",
            Self::P32String => "P32STRING",
            Self::Structure => "STRUCTURE",
            Self::Array8 => "ARRAY8",
            Self::Array16 => "ARRAY16",
            Self::Array32 => "ARRAY32",
            Self::Buffer8 => "BUFFER8",
            Self::Buffer16 => "BUFFER16",
            Self::Buffer32 => "BUFFER32",
            Self::Reference => "REFERENCE",
            Self::Oid => "OID",
            Self::Renamed => "RENAMED",
        };
        f.write_str(name)
    }
}
