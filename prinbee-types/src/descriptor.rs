//! The field descriptor: a compile-time-constructible record naming a
//! field's type, flags, default value, version window, and (for
//! `STRUCTURE`/`ARRAY*`/`RENAMED`) its sub-description (spec.md section 3).

use alloc::format;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::error::TypeError;
use crate::scalar::ScalarType;
use crate::version::{MinMaxVersion, Version};

bitflags::bitflags! {
    /// Descriptor-level flags. Prinbee's C++ original reserves the low 6
    /// bits for "optional bit" use by a field named `flags` and a single
    /// `OPTIONAL` bit above them; we keep the same split since user
    /// descriptors may combine them, even though the core codec itself
    /// only consults [`FieldDescriptorFlags::OPTIONAL`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct FieldDescriptorFlags: u16 {
        const OPTIONAL_BIT_MASK = 0x003F;
        const OPTIONAL          = 0x0040;
    }
}

/// One parsed flag inside a `BITS*` field's inline grammar
/// (`name=flag1:size1/flag2:size2/flag3/...`, spec.md section 4.4 step 4).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlagDefinition {
    name: String,
    pos: usize,
    size: usize,
}

impl FlagDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bit position of the flag's low bit, counting from the field's own
    /// least-significant bit.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Width of the flag in bits.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The unsigned mask covering exactly this flag's bits, shifted into
    /// position. Only meaningful for flags whose `pos + size <= 64`; wider
    /// containers still address their flags by `pos`/`size` pairs, since a
    /// single flag never spans a whole `BITS256`/`BITS512` field in
    /// practice (spec.md section 4.4: `get_bits`/`set_bits` return `u64`).
    pub fn mask_u64(&self) -> u64 {
        if self.size >= 64 {
            u64::MAX
        } else {
            ((1u64 << self.size) - 1) << self.pos
        }
    }
}

/// A static, compile-time-constructible field description.
///
/// `sub_description` is `&'static` because the natural Rust encoding of
/// the C++ original's `constexpr` static arrays is a `'static` slice built
/// once (see `prinbee-core`'s schema modules, which assemble these behind
/// a `std::sync::OnceLock`).
#[derive(Clone, Debug)]
pub struct FieldDescriptor {
    name: String,
    scalar_type: ScalarType,
    flags: FieldDescriptorFlags,
    default_value: Option<String>,
    version: MinMaxVersion,
    sub_description: Option<&'static [FieldDescriptor]>,
    char_size: Option<u32>,
    bit_flags: Vec<FlagDefinition>,
}

/// `[A-Za-z_][A-Za-z0-9_]*`, the general field-name grammar (spec.md
/// section 3). System fields (`_magic`, `_structure_version`) are the only
/// names permitted to start with an underscore (spec.md section 9); that
/// restriction is enforced by [`FieldDescriptor::new`], not here.
fn validate_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn split_name_grammar(full_name: &str) -> (&str, Option<&str>) {
    match full_name.split_once('=') {
        Some((base, rest)) => (base, Some(rest)),
        None => (full_name, None),
    }
}

fn parse_char_size(base_name: &str, suffix: &str) -> Result<u32, TypeError> {
    if !validate_name(base_name) {
        return Err(TypeError::InvalidFieldName(base_name.to_string()));
    }
    suffix
        .parse::<u32>()
        .map_err(|_| TypeError::InvalidCharFieldSize(full_name(base_name, suffix)))
}

fn full_name(base: &str, suffix: &str) -> String {
    format!("{base}={suffix}")
}

/// Parse the `flag1:size1/flag2:size2/flag3/...` grammar and validate that
/// the flags do not overlap and fit the container width (spec.md sections
/// 3 and 4.4 step 4).
fn parse_bit_flags(
    base_name: &str,
    grammar: &str,
    container_bits: usize,
) -> Result<Vec<FlagDefinition>, TypeError> {
    if !validate_name(base_name) {
        return Err(TypeError::InvalidFieldName(base_name.to_string()));
    }

    let mut flags = Vec::new();
    let mut pos = 0usize;
    for segment in grammar.split('/') {
        let (flag_name, size) = match segment.split_once(':') {
            Some((name, size_str)) => {
                let size: usize = size_str.parse().map_err(|_| {
                    TypeError::InvalidBitFieldGrammar(full_name(base_name, grammar))
                })?;
                (name, size)
            }
            None => (segment, 1),
        };

        if !validate_name(flag_name) {
            return Err(TypeError::InvalidBitFieldGrammar(full_name(base_name, grammar)));
        }
        if size == 0 {
            return Err(TypeError::InvalidBitFieldGrammar(full_name(base_name, grammar)));
        }
        if flags.iter().any(|f: &FlagDefinition| f.name == flag_name) {
            return Err(TypeError::InvalidBitFieldGrammar(full_name(base_name, grammar)));
        }

        flags.push(FlagDefinition {
            name: flag_name.to_string(),
            pos,
            size,
        });
        pos += size;
    }

    if pos > container_bits {
        return Err(TypeError::InvalidBitFieldGrammar(full_name(base_name, grammar)));
    }

    Ok(flags)
}

impl FieldDescriptor {
    /// Construct and validate a descriptor, enforcing every invariant
    /// listed in spec.md section 3.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        full_name: &str,
        scalar_type: ScalarType,
        flags: FieldDescriptorFlags,
        default_value: Option<&str>,
        version: MinMaxVersion,
        sub_description: Option<&'static [FieldDescriptor]>,
    ) -> Result<Self, TypeError> {
        if matches!(scalar_type, ScalarType::End) {
            if !full_name.is_empty() {
                return Err(TypeError::InvalidFieldName(
                    "the END field cannot have a field name".to_string(),
                ));
            }
            return Ok(Self {
                name: String::new(),
                scalar_type,
                flags,
                default_value: None,
                version: MinMaxVersion::full_range(),
                sub_description: None,
                char_size: None,
                bit_flags: Vec::new(),
            });
        }

        if full_name.is_empty() {
            return Err(TypeError::InvalidFieldName(
                "this structure field must have a field name".to_string(),
            ));
        }

        let (base_name, suffix) = split_name_grammar(full_name);

        let mut char_size = None;
        let mut bit_flags = Vec::new();

        if scalar_type.is_bit_field() {
            let grammar = suffix.ok_or_else(|| {
                TypeError::InvalidBitFieldGrammar(full_name.to_string())
            })?;
            let width = scalar_type
                .bit_field_width()
                .expect("is_bit_field implies bit_field_width");
            bit_flags = parse_bit_flags(base_name, grammar, width)?;
        } else if matches!(scalar_type, ScalarType::Char) {
            let suffix = suffix.ok_or_else(|| {
                TypeError::InvalidCharFieldSize(full_name.to_string())
            })?;
            char_size = Some(parse_char_size(base_name, suffix)?);
        } else if !validate_name(full_name) {
            return Err(TypeError::InvalidFieldName(full_name.to_string()));
        }

        match scalar_type {
            ScalarType::Magic if base_name != crate::SYSTEM_FIELD_NAME_MAGIC => {
                return Err(TypeError::InvalidSystemFieldName(full_name.to_string()));
            }
            ScalarType::StructureVersion if base_name != crate::SYSTEM_FIELD_NAME_STRUCTURE_VERSION => {
                return Err(TypeError::InvalidSystemFieldName(full_name.to_string()));
            }
            _ => {}
        }

        if scalar_type.requires_sub_description() {
            if sub_description.is_none() {
                return Err(TypeError::InvalidSubDescription(full_name.to_string()));
            }
        } else if sub_description.is_some() {
            return Err(TypeError::InvalidSubDescription(full_name.to_string()));
        }

        if version.min() > version.max() {
            return Err(TypeError::InvalidVersionRange);
        }

        Ok(Self {
            name: base_name.to_string(),
            scalar_type,
            flags,
            default_value: default_value.map(str::to_string),
            version,
            sub_description,
            char_size,
            bit_flags,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scalar_type(&self) -> ScalarType {
        self.scalar_type
    }

    pub fn flags(&self) -> FieldDescriptorFlags {
        self.flags
    }

    pub fn default_value(&self) -> Option<&str> {
        self.default_value.as_deref()
    }

    pub fn version(&self) -> MinMaxVersion {
        self.version
    }

    pub fn sub_description(&self) -> Option<&'static [FieldDescriptor]> {
        self.sub_description
    }

    /// `Some(N)` for a `CHAR=N` field.
    pub fn char_size(&self) -> Option<u32> {
        self.char_size
    }

    /// The parsed flags of a `BITS*` field, empty otherwise.
    pub fn bit_flags(&self) -> &[FlagDefinition] {
        &self.bit_flags
    }

    pub fn find_flag(&self, flag_name: &str) -> Option<&FlagDefinition> {
        self.bit_flags.iter().find(|f| f.name == flag_name)
    }

    /// True if this field is visible at `version` (spec.md section 3,
    /// invariant 4: `min_version <= structure_version <= max_version`).
    ///
    /// For the `_structure_version` field itself, `version()`'s `min()` is
    /// the descriptor's own current/declared version rather than a
    /// visibility window (grounded on
    /// `original_source/prinbee/data/structure.cpp`'s `set_defaults()`,
    /// which stamps a freshly-initialized buffer's structure version from
    /// `def->f_min_version`); `max()` bounds how old an on-disk version this
    /// descriptor still knows how to load.
    pub fn visible_at(&self, version: Version) -> bool {
        self.version.min() <= version && version <= self.version.max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_name() {
        assert!(FieldDescriptor::new(
            "",
            ScalarType::Uint32,
            FieldDescriptorFlags::empty(),
            None,
            MinMaxVersion::full_range(),
            None,
        )
        .is_err());
    }

    #[test]
    fn magic_field_must_be_named_magic() {
        assert!(FieldDescriptor::new(
            "oops",
            ScalarType::Magic,
            FieldDescriptorFlags::empty(),
            None,
            MinMaxVersion::full_range(),
            None,
        )
        .is_err());

        assert!(FieldDescriptor::new(
            "_magic",
            ScalarType::Magic,
            FieldDescriptorFlags::empty(),
            None,
            MinMaxVersion::full_range(),
            None,
        )
        .is_ok());
    }

    #[test]
    fn bit_field_grammar_parses_flags_in_order() {
        let d = FieldDescriptor::new(
            "flags=null/advance:4/performent:2/sign",
            ScalarType::Bits8,
            FieldDescriptorFlags::empty(),
            None,
            MinMaxVersion::full_range(),
            None,
        )
        .unwrap();
        assert_eq!(d.name(), "flags");
        let names: Vec<&str> = d.bit_flags().iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["null", "advance", "performent", "sign"]);
        assert_eq!(d.find_flag("advance").unwrap().pos(), 1);
        assert_eq!(d.find_flag("advance").unwrap().size(), 4);
    }

    #[test]
    fn bit_field_grammar_rejects_overflow() {
        let err = FieldDescriptor::new(
            "flags=a:4/b:4/c:1",
            ScalarType::Bits8,
            FieldDescriptorFlags::empty(),
            None,
            MinMaxVersion::full_range(),
            None,
        );
        assert!(err.is_err());
    }

    #[test]
    fn char_field_size_is_parsed() {
        let d = FieldDescriptor::new(
            "description=128",
            ScalarType::Char,
            FieldDescriptorFlags::empty(),
            None,
            MinMaxVersion::full_range(),
            None,
        )
        .unwrap();
        assert_eq!(d.name(), "description");
        assert_eq!(d.char_size(), Some(128));
    }

    #[test]
    fn structure_requires_sub_description() {
        assert!(FieldDescriptor::new(
            "child",
            ScalarType::Structure,
            FieldDescriptorFlags::empty(),
            None,
            MinMaxVersion::full_range(),
            None,
        )
        .is_err());
    }
}
