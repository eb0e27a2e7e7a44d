//! The registry of user-declared complex types: named, reusable field
//! lists a schema can reference instead of repeating a sub-description
//! inline (spec.md section 3; grounded on
//! `original_source/prinbee/database/context.cpp`'s
//! `verify_complex_types()`/`find_loop()`, which walk the same kind of
//! named-reference graph for cycles before a context is allowed to load).

use alloc::collections::BTreeMap;
use alloc::string::{String, ToString};
use alloc::vec::Vec;

use crate::descriptor::FieldDescriptor;
use crate::error::TypeError;
use crate::MAX_COMPLEX_TYPE_REFERENCE_DEPTH;

/// A single named, user-declared complex type: a reusable field list a
/// [`ScalarType::Renamed`](crate::scalar::ScalarType::Renamed) field can
/// point at instead of repeating its sub-description inline.
#[derive(Clone, Debug)]
pub struct ComplexType {
    name: String,
    fields: &'static [FieldDescriptor],
}

impl ComplexType {
    pub fn new(name: &str, fields: &'static [FieldDescriptor]) -> Self {
        Self {
            name: name.to_string(),
            fields,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &'static [FieldDescriptor] {
        self.fields
    }

    /// The complex-type names this type's own `STRUCTURE`/`ARRAY*` fields
    /// reference, in declaration order. `RENAMED` is an old-name alias
    /// within the *same* structure (spec.md section 4.4 step 6), not a
    /// cross-type reference, so it plays no part in the cycle graph; a
    /// `STRUCTURE`/`ARRAY*` field names the complex type its layout was
    /// copied from via `default_value` (see [`ComplexTypeRegistry`]'s
    /// loader), which is exactly the edge `find_loop` needs to walk.
    fn references(&self) -> impl Iterator<Item = &str> {
        use crate::scalar::ScalarType;
        self.fields.iter().filter_map(|f| {
            if matches!(
                f.scalar_type(),
                ScalarType::Structure | ScalarType::Array8 | ScalarType::Array16 | ScalarType::Array32
            ) {
                f.default_value()
            } else {
                None
            }
        })
    }
}

/// A schema's table of user-declared complex types, keyed by name.
///
/// Registration rejects a name that shadows a built-in
/// [`ScalarType`](crate::scalar::ScalarType) keyword, a name declared
/// twice, and (once every entry is in) any reference cycle among the
/// registered types, deepening the search no further than
/// [`MAX_COMPLEX_TYPE_REFERENCE_DEPTH`].
#[derive(Clone, Debug, Default)]
pub struct ComplexTypeRegistry {
    types: BTreeMap<String, ComplexType>,
}

const BUILTIN_TYPE_NAMES: &[&str] = &[
    "VOID", "BITS8", "BITS16", "BITS32", "BITS64", "BITS128", "BITS256", "BITS512", "INT8",
    "UINT8", "INT16", "UINT16", "INT32", "UINT32", "INT64", "UINT64", "INT128", "UINT128",
    "INT256", "UINT256", "INT512", "UINT512", "FLOAT32", "FLOAT64", "FLOAT128", "MAGIC",
    "STRUCTURE_VERSION", "VERSION", "TIME", "MSTIME", "USTIME", "NSTIME", "CHAR", "P8STRING",
    "P16STRING", "P32STRING", "STRUCTURE", "ARRAY8", "ARRAY16", "ARRAY32", "BUFFER8", "BUFFER16",
    "BUFFER32", "REFERENCE", "OID", "RENAMED",
];

impl ComplexTypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `complex_type`, rejecting a name that collides with a
    /// built-in scalar keyword or an already-registered complex type.
    pub fn register(&mut self, complex_type: ComplexType) -> Result<(), TypeError> {
        let upper = complex_type.name.to_ascii_uppercase();
        if BUILTIN_TYPE_NAMES.contains(&upper.as_str()) {
            return Err(TypeError::InvalidParameter(alloc::format!(
                "complex type {:?} shadows a built-in type",
                complex_type.name
            )));
        }
        if self.types.contains_key(&complex_type.name) {
            return Err(TypeError::InvalidParameter(alloc::format!(
                "complex type {:?} is already registered",
                complex_type.name
            )));
        }
        self.types.insert(complex_type.name.clone(), complex_type);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ComplexType> {
        self.types.get(name)
    }

    /// Walk every registered type's reference graph, failing if any path
    /// loops back on itself within
    /// [`MAX_COMPLEX_TYPE_REFERENCE_DEPTH`] hops.
    pub fn verify(&self) -> Result<(), TypeError> {
        for name in self.types.keys() {
            let mut path = Vec::with_capacity(MAX_COMPLEX_TYPE_REFERENCE_DEPTH);
            self.find_loop(name, &mut path)?;
        }
        Ok(())
    }

    fn find_loop(&self, name: &str, path: &mut Vec<String>) -> Result<(), TypeError> {
        if path.iter().any(|p| p == name) {
            return Err(TypeError::InvalidParameter(alloc::format!(
                "complex type reference loop detected at {:?}",
                name
            )));
        }
        if path.len() >= MAX_COMPLEX_TYPE_REFERENCE_DEPTH {
            return Err(TypeError::InvalidParameter(alloc::format!(
                "complex type reference depth exceeds {MAX_COMPLEX_TYPE_REFERENCE_DEPTH} at {name:?}"
            )));
        }

        let Some(complex_type) = self.types.get(name) else {
            // A dangling RENAMED reference is reported by schema
            // validation elsewhere; it is not itself a loop.
            return Ok(());
        };

        path.push(name.to_string());
        for reference in complex_type.references() {
            self.find_loop(reference, path)?;
        }
        path.pop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::FieldDescriptorFlags;
    use crate::scalar::ScalarType;
    use crate::version::MinMaxVersion;

    /// A `STRUCTURE` field whose layout was copied from the complex type
    /// named `target`, the shape `ComplexTypeRegistry`'s loader produces.
    fn complex_type_reference(target: &'static str) -> FieldDescriptor {
        FieldDescriptor::new(
            "next",
            ScalarType::Structure,
            FieldDescriptorFlags::empty(),
            Some(target),
            MinMaxVersion::full_range(),
            Some(&[]),
        )
        .unwrap()
    }

    #[test]
    fn rejects_builtin_name() {
        let mut registry = ComplexTypeRegistry::new();
        let err = registry.register(ComplexType::new("INT32", &[]));
        assert!(err.is_err());
    }

    #[test]
    fn rejects_duplicate_name() {
        let mut registry = ComplexTypeRegistry::new();
        registry.register(ComplexType::new("point", &[])).unwrap();
        assert!(registry.register(ComplexType::new("point", &[])).is_err());
    }

    #[test]
    fn detects_direct_cycle() {
        let a_fields: &'static [FieldDescriptor] = alloc::vec![complex_type_reference("b")].leak();
        let b_fields: &'static [FieldDescriptor] = alloc::vec![complex_type_reference("a")].leak();

        let mut registry = ComplexTypeRegistry::new();
        registry.register(ComplexType::new("a", a_fields)).unwrap();
        registry.register(ComplexType::new("b", b_fields)).unwrap();
        assert!(registry.verify().is_err());
    }

    #[test]
    fn renamed_fields_do_not_count_as_references() {
        let renamed: FieldDescriptor = FieldDescriptor::new(
            "old_name",
            ScalarType::Renamed,
            FieldDescriptorFlags::empty(),
            Some("self"),
            MinMaxVersion::full_range(),
            Some(&[]),
        )
        .unwrap();
        let fields: &'static [FieldDescriptor] = alloc::vec![renamed].leak();

        let mut registry = ComplexTypeRegistry::new();
        registry.register(ComplexType::new("self", fields)).unwrap();
        assert!(registry.verify().is_ok());
    }
}
