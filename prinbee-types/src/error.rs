//! Errors raised while describing or naming a field, independent of any
//! particular buffer contents.

use core::fmt::{Display, Formatter};

/// Failures that can occur while building or resolving descriptors,
/// scalar types, magics, and versions.
///
/// These correspond to the `invalid_parameter`, `invalid_type`, and
/// `field_not_found` kinds of spec.md section 7 that are detectable
/// without a virtual buffer in hand. Errors that require reading buffer
/// contents (`corrupted_data`, `out_of_range` on a read, `type_mismatch`)
/// live in `prinbee-core::error` instead.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeError {
    /// Not enough input bytes to decode a fixed-width value.
    InputTooSmall,
    /// A field name does not conform to `[A-Za-z_][A-Za-z0-9_]*`.
    InvalidFieldName(alloc::string::String),
    /// A `_magic`/`_structure_version` field was given the wrong name.
    InvalidSystemFieldName(alloc::string::String),
    /// A descriptor is missing a mandatory sub-description, or carries one
    /// that is forbidden for its type.
    InvalidSubDescription(alloc::string::String),
    /// `min_version > max_version`, or a field requiring a full-range
    /// version did not get one.
    InvalidVersionRange,
    /// The inline `name=flag:size/...` bit-field grammar did not parse, or
    /// flags overlap / overflow the container width.
    InvalidBitFieldGrammar(alloc::string::String),
    /// A `CHAR=N` field name did not carry a valid size suffix.
    InvalidCharFieldSize(alloc::string::String),
    /// A raw `u16` or `u32` tag does not map to a known scalar type / magic.
    InvalidType(alloc::string::String),
    /// A named field, flag, or complex type was not found.
    FieldNotFound(alloc::string::String),
    /// A complex type registry entry shadows a built-in type or is declared
    /// twice, or its field references form a cycle.
    InvalidParameter(alloc::string::String),
}

impl Display for TypeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InputTooSmall => f.write_str("input too small"),
            Self::InvalidFieldName(name) => write!(f, "invalid field name: {name:?}"),
            Self::InvalidSystemFieldName(name) => {
                write!(f, "invalid system field name: {name:?}")
            }
            Self::InvalidSubDescription(name) => {
                write!(f, "invalid sub-description for field {name:?}")
            }
            Self::InvalidVersionRange => f.write_str("min_version must be <= max_version"),
            Self::InvalidBitFieldGrammar(name) => {
                write!(f, "invalid bit-field grammar in {name:?}")
            }
            Self::InvalidCharFieldSize(name) => {
                write!(f, "invalid CHAR field size in {name:?}")
            }
            Self::InvalidType(what) => write!(f, "unrecognized type: {what}"),
            Self::FieldNotFound(name) => write!(f, "field not found: {name:?}"),
            Self::InvalidParameter(message) => write!(f, "invalid parameter: {message}"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for TypeError {}
