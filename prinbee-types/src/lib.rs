// SPDX-License-Identifier: MIT OR Apache-2.0

#![cfg_attr(not(feature = "std"), no_std)]

//! Prinbee binary record engine: scalar types, field descriptors, and the
//! handful of on-disk constants shared by every layer above.
//!
//! This crate defines the vocabulary of the format: the closed set of
//! scalar field types, the `struct_description_t`-equivalent field
//! descriptor, the registry of user-declared complex types, and the
//! recognized file/block magics. It purposefully does not know how to
//! read or write a virtual buffer, a big integer, or a context file --
//! those live in `prinbee-core`, which depends on this crate the way a
//! query engine depends on its type system.
//!
//! # Note on Endianness
//!
//! Every multi-byte field in a Prinbee file is little-endian. This crate's
//! [`le`] module provides the small decode helpers used throughout the
//! codec; encoding back to bytes is a responsibility of `prinbee-core`
//! since it requires the virtual buffer.

extern crate alloc;
extern crate core;

pub mod complex_type;
pub mod descriptor;
pub mod error;
pub mod le;
pub mod magic;
pub mod scalar;
pub mod version;

pub use complex_type::{ComplexType, ComplexTypeRegistry};
pub use descriptor::{FieldDescriptor, FieldDescriptorFlags, FlagDefinition};
pub use error::TypeError;
pub use magic::Magic;
pub use scalar::{LengthPrefixSize, ScalarType, StaticSize};
pub use version::{MinMaxVersion, Version};

/// Name reserved for the mandatory leading [`ScalarType::Magic`] field.
pub const SYSTEM_FIELD_NAME_MAGIC: &str = "_magic";

/// Name reserved for the mandatory second [`ScalarType::StructureVersion`] field.
pub const SYSTEM_FIELD_NAME_STRUCTURE_VERSION: &str = "_structure_version";

/// Maximum depth a complex type's field references may recurse before the
/// registry assumes a cycle and rejects the schema.
pub const MAX_COMPLEX_TYPE_REFERENCE_DEPTH: usize = 100;
