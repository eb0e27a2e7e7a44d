//! The structure codec (spec.md section 4.4): walks a static field
//! descriptor against a shared [`VirtualBuffer`], producing a linked,
//! named field map and a tree of typed accessors.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::bigint::{Int512, UInt512};
use crate::convert;
use crate::error::{PrinbeeError, Result};
use crate::vbuf::VirtualBuffer;
use prinbee_types::{le, FieldDescriptor, ScalarType, Version};

/// One parsed field: a descriptor plus its (absolute, shared-buffer)
/// offset and current runtime size (spec.md section 3, "Field (runtime)").
struct FieldNode {
    descriptor: &'static FieldDescriptor,
    offset: Cell<usize>,
    size: Cell<usize>,
    variable_size: bool,
    /// Non-empty for `STRUCTURE` (exactly one) and `ARRAY*` (any count).
    children: RefCell<Vec<Rc<Structure>>>,
}

/// A parsed structure: a descriptor, the shared buffer it reads/writes,
/// and the resulting field map (spec.md section 3, "Structure").
pub struct Structure {
    descriptor: &'static [FieldDescriptor],
    buffer: Rc<RefCell<VirtualBuffer>>,
    start_offset: Cell<usize>,
    fields: RefCell<Vec<Rc<FieldNode>>>,
    by_name: RefCell<HashMap<String, usize>>,
    /// Old name -> current name, for `RENAMED` aliases (spec.md section
    /// 4.4 step 6: looking a field up by its old name logs a warning).
    deprecated_names: RefCell<HashMap<String, String>>,
    parent: RefCell<Option<Weak<Structure>>>,
}

fn length_prefix_bytes(scalar_type: ScalarType) -> usize {
    scalar_type.length_prefix_size().bytes()
}

fn read_length_prefix(buffer: &VirtualBuffer, offset: usize, width: usize) -> Result<usize> {
    let bytes = buffer.pread(width, offset, true)?;
    Ok(match width {
        1 => bytes[0] as usize,
        2 => le::read_u16(&bytes)? as usize,
        4 => le::read_u32(&bytes)? as usize,
        _ => unreachable!("length prefixes are 1, 2, or 4 bytes"),
    })
}

fn write_length_prefix(buffer: &mut VirtualBuffer, offset: usize, width: usize, value: usize) -> Result<()> {
    let bytes: Vec<u8> = match width {
        1 => vec![value as u8],
        2 => (value as u16).to_le_bytes().to_vec(),
        4 => (value as u32).to_le_bytes().to_vec(),
        _ => unreachable!("length prefixes are 1, 2, or 4 bytes"),
    };
    buffer.pwrite(&bytes, offset, true)
}

/// `&'static` names for the handful of scalar types [`Structure::expect_type`]
/// checks against; kept separate from [`ScalarType`]'s `Display` impl, which
/// returns through a `Formatter` and cannot hand back a `&'static str`.
fn expected_name(scalar_type: ScalarType) -> &'static str {
    match scalar_type {
        ScalarType::Float32 => "FLOAT32",
        ScalarType::Float64 => "FLOAT64",
        ScalarType::Float128 => "FLOAT128",
        ScalarType::NsTime => "NSTIME",
        ScalarType::Structure => "STRUCTURE",
        _ => "<unexpected>",
    }
}

fn type_mismatch(field: &str, expected: &'static str, found: ScalarType) -> PrinbeeError {
    PrinbeeError::TypeMismatch {
        field: field.to_string(),
        expected,
        found: found.to_string(),
    }
}

impl Structure {
    /// Construct and parse a root structure. The descriptor's first two
    /// entries must be `MAGIC` then `STRUCTURE_VERSION` (spec.md section
    /// 4.4).
    pub fn new_root(
        descriptor: &'static [FieldDescriptor],
        buffer: Rc<RefCell<VirtualBuffer>>,
    ) -> Result<Rc<Self>> {
        if descriptor.len() < 2
            || !matches!(descriptor[0].scalar_type(), ScalarType::Magic)
            || !matches!(descriptor[1].scalar_type(), ScalarType::StructureVersion)
        {
            return Err(PrinbeeError::InvalidParameter(
                "a root structure's descriptor must start with MAGIC then STRUCTURE_VERSION".into(),
            ));
        }
        let structure = Rc::new(Self {
            descriptor,
            buffer,
            start_offset: Cell::new(0),
            fields: RefCell::new(Vec::new()),
            by_name: RefCell::new(HashMap::new()),
            deprecated_names: RefCell::new(HashMap::new()),
            parent: RefCell::new(None),
        });
        structure.parse()?;
        Ok(structure)
    }

    fn new_child(
        descriptor: &'static [FieldDescriptor],
        buffer: Rc<RefCell<VirtualBuffer>>,
        start_offset: usize,
        parent: &Rc<Structure>,
    ) -> Result<Rc<Self>> {
        let structure = Rc::new(Self {
            descriptor,
            buffer,
            start_offset: Cell::new(start_offset),
            fields: RefCell::new(Vec::new()),
            by_name: RefCell::new(HashMap::new()),
            deprecated_names: RefCell::new(HashMap::new()),
            parent: RefCell::new(Some(Rc::downgrade(parent))),
        });
        structure.parse()?;
        Ok(structure)
    }

    fn root(self: &Rc<Self>) -> Rc<Structure> {
        match self.parent.borrow().as_ref().and_then(Weak::upgrade) {
            Some(parent) => parent.root(),
            None => self.clone(),
        }
    }

    /// The structure version governing field visibility for this node
    /// (spec.md section 3, invariant 4), read straight off the root's
    /// buffer rather than through `find`/`by_name` -- those aren't
    /// populated yet while `parse` is still running.
    fn structure_version_for_parsing(&self) -> Result<Version> {
        match self.parent.borrow().as_ref().and_then(Weak::upgrade) {
            Some(parent) => parent.structure_version_for_parsing(),
            None => {
                let bytes = self.buffer.borrow().pread(4, self.start_offset.get() + 4, true)?;
                let raw_version = Version::from_binary(le::read_u32(&bytes)?);
                if raw_version == Version::new(0, 0) && self.descriptor.len() >= 2 {
                    // An all-zero `_structure_version` means the buffer
                    // hasn't been stamped with its defaults yet (it is
                    // about to be, by `init_buffer`); treat it as already
                    // at the descriptor's own declared version rather than
                    // a real on-disk 0.0, matching
                    // `original_source/prinbee/data/structure.cpp`'s
                    // `set_defaults()`, which stamps a fresh buffer's
                    // version from the descriptor's own `f_min_version`.
                    return Ok(self.descriptor[1].version().min());
                }
                Ok(raw_version)
            }
        }
    }

    fn parse(self: &Rc<Self>) -> Result<()> {
        let mut cursor = self.start_offset.get();
        let mut fields = Vec::new();
        let mut by_name = HashMap::new();
        let structure_version = self.structure_version_for_parsing()?;

        let is_root_descriptor = matches!(
            self.descriptor.first().map(FieldDescriptor::scalar_type),
            Some(ScalarType::Magic)
        );
        if is_root_descriptor {
            let version_descriptor = &self.descriptor[1];
            if !version_descriptor.visible_at(structure_version) {
                return Err(PrinbeeError::InvalidParameter(format!(
                    "on-disk structure version {structure_version} is outside this descriptor's declared range {}..{}",
                    version_descriptor.version().min(),
                    version_descriptor.version().max()
                )));
            }
        }

        for descriptor in self.descriptor {
            if matches!(descriptor.scalar_type(), ScalarType::End) {
                break;
            }
            if matches!(descriptor.scalar_type(), ScalarType::Renamed) {
                // spec.md section 4.4 step 6: the sub-description names the
                // field under its current name; the renamed entry itself
                // consumes no bytes and just aliases the old name to it.
                let sub = descriptor.sub_description().ok_or_else(|| {
                    PrinbeeError::InvalidParameter(format!("{} has no sub-description", descriptor.name()))
                })?;
                let target_name = sub
                    .first()
                    .map(FieldDescriptor::name)
                    .ok_or_else(|| PrinbeeError::InvalidParameter(format!("{} has an empty sub-description", descriptor.name())))?;
                match by_name.get(target_name) {
                    Some(&index) => {
                        by_name.insert(descriptor.name().to_string(), index);
                        self.deprecated_names
                            .borrow_mut()
                            .insert(descriptor.name().to_string(), target_name.to_string());
                    }
                    None => log::warn!(
                        "RENAMED field {:?} targets {target_name:?}, which has not been parsed yet",
                        descriptor.name()
                    ),
                }
                continue;
            }
            if !matches!(descriptor.scalar_type(), ScalarType::Magic | ScalarType::StructureVersion)
                && !descriptor.visible_at(structure_version)
            {
                // spec.md section 3, invariant 4: a field outside its
                // declared version window doesn't exist in this structure
                // at this version and consumes no bytes.
                continue;
            }

            let field = self.parse_one_field(descriptor, &mut cursor)?;
            by_name.insert(descriptor.name().to_string(), fields.len());
            fields.push(field);
        }

        *self.fields.borrow_mut() = fields;
        *self.by_name.borrow_mut() = by_name;
        Ok(())
    }

    fn parse_one_field(
        self: &Rc<Self>,
        descriptor: &'static FieldDescriptor,
        cursor: &mut usize,
    ) -> Result<Rc<FieldNode>> {
        use prinbee_types::StaticSize;

        let scalar_type = descriptor.scalar_type();
        let offset = *cursor;

        if matches!(scalar_type, ScalarType::Char) {
            let size = descriptor.char_size().unwrap_or(0) as usize;
            *cursor += size;
            return Ok(Rc::new(FieldNode {
                descriptor,
                offset: Cell::new(offset),
                size: Cell::new(size),
                variable_size: false,
                children: RefCell::new(Vec::new()),
            }));
        }

        if matches!(scalar_type, ScalarType::Structure) {
            let sub = descriptor
                .sub_description()
                .ok_or_else(|| PrinbeeError::InvalidParameter(format!("{} has no sub-description", descriptor.name())))?;
            let child = Self::new_child(sub, self.buffer.clone(), offset, self)?;
            let size = child.current_size();
            *cursor += size;
            return Ok(Rc::new(FieldNode {
                descriptor,
                offset: Cell::new(offset),
                size: Cell::new(size),
                variable_size: child.is_variable_size(),
                children: RefCell::new(vec![child]),
            }));
        }

        if matches!(scalar_type, ScalarType::Array8 | ScalarType::Array16 | ScalarType::Array32) {
            let prefix_width = length_prefix_bytes(scalar_type);
            let count = read_length_prefix(&self.buffer.borrow(), offset, prefix_width)?;
            let sub = descriptor
                .sub_description()
                .ok_or_else(|| PrinbeeError::InvalidParameter(format!("{} has no sub-description", descriptor.name())))?;

            let mut item_cursor = offset + prefix_width;
            let mut children = Vec::with_capacity(count);
            for _ in 0..count {
                let child = Self::new_child(sub, self.buffer.clone(), item_cursor, self)?;
                item_cursor += child.current_size();
                children.push(child);
            }

            let size = item_cursor - offset;
            *cursor = item_cursor;
            return Ok(Rc::new(FieldNode {
                descriptor,
                offset: Cell::new(offset),
                size: Cell::new(size),
                variable_size: true,
                children: RefCell::new(children),
            }));
        }

        match scalar_type.static_size() {
            StaticSize::Fixed(size) => {
                *cursor += size;
                Ok(Rc::new(FieldNode {
                    descriptor,
                    offset: Cell::new(offset),
                    size: Cell::new(size),
                    variable_size: false,
                    children: RefCell::new(Vec::new()),
                }))
            }
            StaticSize::Variable => {
                let prefix_width = length_prefix_bytes(scalar_type);
                let payload_len = read_length_prefix(&self.buffer.borrow(), offset, prefix_width)?;
                let total = self.buffer.borrow().size();
                if offset + prefix_width + payload_len > total {
                    return Err(PrinbeeError::CorruptedData(format!(
                        "{}: length prefix {payload_len} exceeds buffer size {total}",
                        descriptor.name()
                    )));
                }
                *cursor += prefix_width + payload_len;
                Ok(Rc::new(FieldNode {
                    descriptor,
                    offset: Cell::new(offset),
                    size: Cell::new(prefix_width + payload_len),
                    variable_size: true,
                    children: RefCell::new(Vec::new()),
                }))
            }
            StaticSize::Invalid => Err(PrinbeeError::InvalidParameter(format!(
                "{} cannot appear as a standalone value",
                descriptor.name()
            ))),
        }
    }

    fn find(&self, name: &str) -> Result<Rc<FieldNode>> {
        if let Some(current) = self.deprecated_names.borrow().get(name) {
            log::warn!("field {name:?} was renamed to {current:?}; update callers to use the new name");
        }
        let index = *self
            .by_name
            .borrow()
            .get(name)
            .ok_or_else(|| PrinbeeError::FieldNotFound(name.to_string()))?;
        Ok(self.fields.borrow()[index].clone())
    }

    fn check_not_system(&self, name: &str) -> Result<()> {
        if name == prinbee_types::SYSTEM_FIELD_NAME_MAGIC
            || name == prinbee_types::SYSTEM_FIELD_NAME_STRUCTURE_VERSION
        {
            return Err(PrinbeeError::LogicError(format!(
                "{name} cannot be written to after initialization"
            )));
        }
        Ok(())
    }

    /// Sum of static sizes, or `0` if any field in the tree is variable
    /// (spec.md section 4.4, "Static vs current size").
    pub fn static_size(&self) -> usize {
        if self.is_variable_size() {
            0
        } else {
            self.fields.borrow().iter().map(|f| f.size.get()).sum()
        }
    }

    fn is_variable_size(&self) -> bool {
        self.fields.borrow().iter().any(|f| f.variable_size)
    }

    /// Exact current byte count, walking the tree (spec.md section 4.4).
    pub fn current_size(&self) -> usize {
        self.fields.borrow().iter().map(Self::field_current_size).sum()
    }

    /// A field's current byte extent. For `STRUCTURE`/`ARRAY*` this is
    /// recomputed from the children's own current sizes rather than
    /// trusting the cached [`FieldNode::size`], since a variable-size edit
    /// deep in one child only updates that child's own field -- nothing
    /// walks back up fixing every ancestor's cached composite size.
    fn field_current_size(field: &Rc<FieldNode>) -> usize {
        match field.descriptor.scalar_type() {
            ScalarType::Structure => field.children.borrow()[0].current_size(),
            ScalarType::Array8 | ScalarType::Array16 | ScalarType::Array32 => {
                let prefix_width = length_prefix_bytes(field.descriptor.scalar_type());
                prefix_width + field.children.borrow().iter().map(|c| c.current_size()).sum::<usize>()
            }
            _ => field.size.get(),
        }
    }

    /// Debug-only post-condition check for invariant 1 of spec.md section
    /// 3: the sum of field sizes equals the buffer size for a non-child
    /// root structure (spec.md section 4.4 step 4, "verify_buffer_size").
    #[cfg(debug_assertions)]
    fn verify_buffer_size(self: &Rc<Self>) {
        let root = self.root();
        if root.parent.borrow().is_none() {
            debug_assert_eq!(
                root.current_size(),
                root.buffer.borrow().size(),
                "structure field sizes must sum to the buffer size"
            );
        }
    }

    #[cfg(not(debug_assertions))]
    fn verify_buffer_size(self: &Rc<Self>) {}

    /// Propagate an edit's net byte delta to every field whose offset was
    /// strictly greater than `cutoff` (spec.md section 4.4 step 3 / section
    /// 3 invariant 2).
    fn propagate_offsets(self: &Rc<Self>, cutoff: usize, delta: isize) {
        let root = self.root();
        root.shift_offsets_from(cutoff, delta);
        self.verify_buffer_size();
    }

    fn shift_offsets_from(&self, cutoff: usize, delta: isize) {
        for field in self.fields.borrow().iter() {
            if field.offset.get() > cutoff {
                field.offset.set((field.offset.get() as isize + delta) as usize);
            }
            for child in field.children.borrow().iter() {
                if child.start_offset.get() > cutoff {
                    child
                        .start_offset
                        .set((child.start_offset.get() as isize + delta) as usize);
                }
                child.shift_offsets_from(cutoff, delta);
            }
        }
    }

    fn apply_variable_edit(
        self: &Rc<Self>,
        field: &Rc<FieldNode>,
        new_payload: &[u8],
        prefix_width: usize,
    ) -> Result<()> {
        let old_size = field.size.get();
        let new_size = prefix_width + new_payload.len();
        let cutoff = field.offset.get();

        {
            let mut buffer = self.buffer.borrow_mut();
            if new_size > old_size {
                buffer.pinsert(&vec![0u8; new_size - old_size], cutoff + old_size)?;
            } else if new_size < old_size {
                buffer.perase(old_size - new_size, cutoff + new_size)?;
            }
            write_length_prefix(&mut buffer, cutoff, prefix_width, new_payload.len())?;
            buffer.pwrite(new_payload, cutoff + prefix_width, true)?;
        }

        field.size.set(new_size);
        let delta = new_size as isize - old_size as isize;
        if delta != 0 {
            self.propagate_offsets(cutoff, delta);
        }
        Ok(())
    }

    // -- integer family --------------------------------------------------

    pub fn get_integer(self: &Rc<Self>, name: &str) -> Result<i64> {
        let field = self.find(name)?;
        if !matches!(
            field.descriptor.scalar_type(),
            ScalarType::Int8 | ScalarType::Int16 | ScalarType::Int32 | ScalarType::Int64
                | ScalarType::Time | ScalarType::MsTime | ScalarType::UsTime
        ) {
            return Err(type_mismatch(name, "INT8/16/32/64", field.descriptor.scalar_type()));
        }
        let bytes = self.buffer.borrow().pread(field.size.get(), field.offset.get(), true)?;
        Ok(sign_extend_i64(&bytes))
    }

    pub fn set_integer(self: &Rc<Self>, name: &str, value: i64) -> Result<()> {
        self.check_not_system(name)?;
        let field = self.find(name)?;
        if !matches!(
            field.descriptor.scalar_type(),
            ScalarType::Int8 | ScalarType::Int16 | ScalarType::Int32 | ScalarType::Int64
                | ScalarType::Time | ScalarType::MsTime | ScalarType::UsTime
        ) {
            return Err(type_mismatch(name, "INT8/16/32/64", field.descriptor.scalar_type()));
        }
        let size = field.size.get();
        let bytes = value.to_le_bytes();
        if sign_extend_i64(&bytes[..size]) != value {
            return Err(PrinbeeError::OutOfRange(format!("{value} does not fit in {size} bytes")));
        }
        self.buffer.borrow_mut().pwrite(&bytes[..size], field.offset.get(), true)
    }

    pub fn get_uinteger(self: &Rc<Self>, name: &str) -> Result<u64> {
        let field = self.find(name)?;
        if !field.descriptor.scalar_type().is_integer_like() || field.descriptor.scalar_type().is_signed() {
            return Err(type_mismatch(name, "an unsigned integer-like type", field.descriptor.scalar_type()));
        }
        let bytes = self.buffer.borrow().pread(field.size.get(), field.offset.get(), true)?;
        let mut buf = [0u8; 8];
        buf[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn set_uinteger(self: &Rc<Self>, name: &str, value: u64) -> Result<()> {
        self.check_not_system(name)?;
        let field = self.find(name)?;
        if !field.descriptor.scalar_type().is_integer_like() || field.descriptor.scalar_type().is_signed() {
            return Err(type_mismatch(name, "an unsigned integer-like type", field.descriptor.scalar_type()));
        }
        let size = field.size.get();
        let bytes = value.to_le_bytes();
        if size < 8 && value >> (size * 8) != 0 {
            return Err(PrinbeeError::OutOfRange(format!("{value} does not fit in {size} bytes")));
        }
        self.buffer.borrow_mut().pwrite(&bytes[..size.min(8)], field.offset.get(), true)
    }

    pub fn get_large_integer(self: &Rc<Self>, name: &str) -> Result<Int512> {
        let field = self.find(name)?;
        if !field.descriptor.scalar_type().is_signed() {
            return Err(type_mismatch(name, "a signed large-integer type", field.descriptor.scalar_type()));
        }
        let bytes = self.buffer.borrow().pread(field.size.get(), field.offset.get(), true)?;
        Ok(sign_extend_int512(&bytes))
    }

    pub fn set_large_integer(self: &Rc<Self>, name: &str, value: Int512) -> Result<()> {
        self.check_not_system(name)?;
        let field = self.find(name)?;
        if !field.descriptor.scalar_type().is_signed() {
            return Err(type_mismatch(name, "a signed large-integer type", field.descriptor.scalar_type()));
        }
        let size = field.size.get();
        if value.bit_size() > size * 8 - 1 {
            return Err(PrinbeeError::OutOfRange(format!("value too large for {size} bytes")));
        }
        let bytes = value.bits().to_bytes(size);
        self.buffer.borrow_mut().pwrite(&bytes, field.offset.get(), true)
    }

    pub fn get_large_uinteger(self: &Rc<Self>, name: &str) -> Result<UInt512> {
        let field = self.find(name)?;
        if !field.descriptor.scalar_type().is_integer_like() || field.descriptor.scalar_type().is_signed() {
            return Err(type_mismatch(name, "an unsigned large-integer type", field.descriptor.scalar_type()));
        }
        let bytes = self.buffer.borrow().pread(field.size.get(), field.offset.get(), true)?;
        Ok(UInt512::from_bytes(&bytes))
    }

    pub fn set_large_uinteger(self: &Rc<Self>, name: &str, value: UInt512) -> Result<()> {
        self.check_not_system(name)?;
        let field = self.find(name)?;
        if !field.descriptor.scalar_type().is_integer_like() || field.descriptor.scalar_type().is_signed() {
            return Err(type_mismatch(name, "an unsigned large-integer type", field.descriptor.scalar_type()));
        }
        let size = field.size.get();
        if value.bit_size() > size * 8 {
            return Err(PrinbeeError::OutOfRange(format!("value too large for {size} bytes")));
        }
        let bytes = value.to_bytes(size);
        self.buffer.borrow_mut().pwrite(&bytes, field.offset.get(), true)
    }

    // -- bit accessors ----------------------------------------------------

    fn split_flag_path(flag_path: &str) -> Result<(&str, &str)> {
        flag_path
            .split_once('.')
            .ok_or_else(|| PrinbeeError::InvalidParameter(format!("not a field.flag path: {flag_path:?}")))
    }

    pub fn get_bits(self: &Rc<Self>, flag_path: &str) -> Result<u64> {
        let (field_name, flag_name) = Self::split_flag_path(flag_path)?;
        let field = self.find(field_name)?;
        if !field.descriptor.scalar_type().is_bit_field() {
            return Err(type_mismatch(field_name, "a BITS* type", field.descriptor.scalar_type()));
        }
        let flag = field
            .descriptor
            .find_flag(flag_name)
            .ok_or_else(|| PrinbeeError::FieldNotFound(flag_path.to_string()))?;
        let bytes = self.buffer.borrow().pread(field.size.get(), field.offset.get(), true)?;
        let mut buf = [0u8; 8];
        buf[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
        let container = u64::from_le_bytes(buf);
        Ok((container >> flag.pos()) & mask_for(flag.size()))
    }

    pub fn set_bits(self: &Rc<Self>, flag_path: &str, value: u64) -> Result<()> {
        let (field_name, flag_name) = Self::split_flag_path(flag_path)?;
        self.check_not_system(field_name)?;
        let field = self.find(field_name)?;
        if !field.descriptor.scalar_type().is_bit_field() {
            return Err(type_mismatch(field_name, "a BITS* type", field.descriptor.scalar_type()));
        }
        let flag = field
            .descriptor
            .find_flag(flag_name)
            .ok_or_else(|| PrinbeeError::FieldNotFound(flag_path.to_string()))?;
        if value > mask_for(flag.size()) {
            return Err(PrinbeeError::InvalidNumber(format!(
                "{value} does not fit in {}-bit flag {flag_path:?}",
                flag.size()
            )));
        }

        let size = field.size.get();
        let bytes = self.buffer.borrow().pread(size, field.offset.get(), true)?;
        let mut buf = [0u8; 8];
        buf[..bytes.len().min(8)].copy_from_slice(&bytes[..bytes.len().min(8)]);
        let mut container = u64::from_le_bytes(buf);
        container &= !(mask_for(flag.size()) << flag.pos());
        container |= value << flag.pos();

        let out = container.to_le_bytes();
        self.buffer.borrow_mut().pwrite(&out[..size.min(8)], field.offset.get(), true)
    }

    // -- float accessors ---------------------------------------------------

    pub fn get_float32(self: &Rc<Self>, name: &str) -> Result<f32> {
        let field = self.expect_type(name, ScalarType::Float32)?;
        let bytes = self.buffer.borrow().pread(4, field.offset.get(), true)?;
        Ok(f32::from_le_bytes(bytes.try_into().expect("pread returned 4 bytes")))
    }

    pub fn set_float32(self: &Rc<Self>, name: &str, value: f32) -> Result<()> {
        self.check_not_system(name)?;
        let field = self.expect_type(name, ScalarType::Float32)?;
        self.buffer.borrow_mut().pwrite(&value.to_le_bytes(), field.offset.get(), true)
    }

    pub fn get_float64(self: &Rc<Self>, name: &str) -> Result<f64> {
        let field = self.expect_type(name, ScalarType::Float64)?;
        let bytes = self.buffer.borrow().pread(8, field.offset.get(), true)?;
        Ok(f64::from_le_bytes(bytes.try_into().expect("pread returned 8 bytes")))
    }

    pub fn set_float64(self: &Rc<Self>, name: &str, value: f64) -> Result<()> {
        self.check_not_system(name)?;
        let field = self.expect_type(name, ScalarType::Float64)?;
        self.buffer.borrow_mut().pwrite(&value.to_le_bytes(), field.offset.get(), true)
    }

    pub fn get_float128(self: &Rc<Self>, name: &str) -> Result<f64> {
        let field = self.expect_type(name, ScalarType::Float128)?;
        let bytes = self.buffer.borrow().pread(8, field.offset.get(), true)?;
        Ok(f64::from_le_bytes(bytes.try_into().expect("pread returned 8 bytes")))
    }

    pub fn set_float128(self: &Rc<Self>, name: &str, value: f64) -> Result<()> {
        self.check_not_system(name)?;
        let field = self.expect_type(name, ScalarType::Float128)?;
        let mut bytes = vec![0u8; 16];
        bytes[..8].copy_from_slice(&value.to_le_bytes());
        self.buffer.borrow_mut().pwrite(&bytes, field.offset.get(), true)
    }

    fn expect_type(&self, name: &str, expected: ScalarType) -> Result<Rc<FieldNode>> {
        let field = self.find(name)?;
        if field.descriptor.scalar_type() != expected {
            return Err(type_mismatch(name, expected_name(expected), field.descriptor.scalar_type()));
        }
        Ok(field)
    }

    // -- temporal -----------------------------------------------------------

    pub fn get_nstime(self: &Rc<Self>, name: &str) -> Result<(i64, u32)> {
        let field = self.expect_type(name, ScalarType::NsTime)?;
        let bytes = self.buffer.borrow().pread(16, field.offset.get(), true)?;
        let total = i128::from_le_bytes(bytes.try_into().expect("pread returned 16 bytes"));
        Ok((total.div_euclid(1_000_000_000) as i64, total.rem_euclid(1_000_000_000) as u32))
    }

    pub fn set_nstime(self: &Rc<Self>, name: &str, seconds: i64, nanos: u32) -> Result<()> {
        self.check_not_system(name)?;
        let field = self.expect_type(name, ScalarType::NsTime)?;
        let total = seconds as i128 * 1_000_000_000 + nanos as i128;
        self.buffer.borrow_mut().pwrite(&total.to_le_bytes(), field.offset.get(), true)
    }

    // -- string / buffer ----------------------------------------------------

    pub fn get_string(self: &Rc<Self>, name: &str) -> Result<String> {
        let field = self.find(name)?;
        match field.descriptor.scalar_type() {
            ScalarType::Char => {
                let bytes = self.buffer.borrow().pread(field.size.get(), field.offset.get(), true)?;
                let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
                Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
            }
            ScalarType::P8String | ScalarType::P16String | ScalarType::P32String => {
                let prefix_width = length_prefix_bytes(field.descriptor.scalar_type());
                let payload_len = field.size.get() - prefix_width;
                let bytes = self.buffer.borrow().pread(payload_len, field.offset.get() + prefix_width, true)?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            other => Err(type_mismatch(name, "CHAR or P*STRING", other)),
        }
    }

    pub fn set_string(self: &Rc<Self>, name: &str, value: &str) -> Result<()> {
        self.check_not_system(name)?;
        let field = self.find(name)?;
        match field.descriptor.scalar_type() {
            ScalarType::Char => {
                let capacity = field.size.get();
                if value.len() > capacity {
                    return Err(PrinbeeError::OutOfRange(format!(
                        "{value:?} does not fit in a {capacity}-byte CHAR field"
                    )));
                }
                let mut bytes = vec![0u8; capacity];
                bytes[..value.len()].copy_from_slice(value.as_bytes());
                self.buffer.borrow_mut().pwrite(&bytes, field.offset.get(), true)
            }
            ScalarType::P8String | ScalarType::P16String | ScalarType::P32String => {
                let prefix_width = length_prefix_bytes(field.descriptor.scalar_type());
                self.apply_variable_edit(&field, value.as_bytes(), prefix_width)
            }
            other => Err(type_mismatch(name, "CHAR or P*STRING", other)),
        }
    }

    pub fn get_buffer(self: &Rc<Self>, name: &str) -> Result<Vec<u8>> {
        let field = self.find(name)?;
        if !matches!(field.descriptor.scalar_type(), ScalarType::Buffer8 | ScalarType::Buffer16 | ScalarType::Buffer32) {
            return Err(type_mismatch(name, "BUFFER*", field.descriptor.scalar_type()));
        }
        let prefix_width = length_prefix_bytes(field.descriptor.scalar_type());
        let payload_len = field.size.get() - prefix_width;
        self.buffer.borrow().pread(payload_len, field.offset.get() + prefix_width, true)
    }

    pub fn set_buffer(self: &Rc<Self>, name: &str, value: &[u8]) -> Result<()> {
        self.check_not_system(name)?;
        let field = self.find(name)?;
        if !matches!(field.descriptor.scalar_type(), ScalarType::Buffer8 | ScalarType::Buffer16 | ScalarType::Buffer32) {
            return Err(type_mismatch(name, "BUFFER*", field.descriptor.scalar_type()));
        }
        let prefix_width = length_prefix_bytes(field.descriptor.scalar_type());
        self.apply_variable_edit(&field, value, prefix_width)
    }

    // -- nested ---------------------------------------------------------

    pub fn get_structure(self: &Rc<Self>, name: &str) -> Result<Rc<Structure>> {
        let field = self.expect_type(name, ScalarType::Structure)?;
        let child = field.children.borrow()[0].clone();
        Ok(child)
    }

    pub fn get_array(self: &Rc<Self>, name: &str) -> Result<Vec<Rc<Structure>>> {
        let field = self.find(name)?;
        if !matches!(field.descriptor.scalar_type(), ScalarType::Array8 | ScalarType::Array16 | ScalarType::Array32) {
            return Err(type_mismatch(name, "ARRAY*", field.descriptor.scalar_type()));
        }
        let children = field.children.borrow().clone();
        Ok(children)
    }

    pub fn new_array_item(self: &Rc<Self>, name: &str) -> Result<Rc<Structure>> {
        self.check_not_system(name)?;
        let field = self.find(name)?;
        let scalar_type = field.descriptor.scalar_type();
        if !matches!(scalar_type, ScalarType::Array8 | ScalarType::Array16 | ScalarType::Array32) {
            return Err(type_mismatch(name, "ARRAY*", scalar_type));
        }
        let sub = field
            .descriptor
            .sub_description()
            .ok_or_else(|| PrinbeeError::InvalidParameter(format!("{name} has no sub-description")))?;

        let prefix_width = length_prefix_bytes(scalar_type);
        let insert_at = field.offset.get() + Self::field_current_size(&field);
        let old_count = field.children.borrow().len();

        // Grow with a minimal instance built from defaults: init_buffer on
        // an empty, zero-length payload template and append it, then
        // re-derive the child's actual bytes by parsing after the insert.
        let template_size = Self::static_or_minimum_size(sub);
        self.buffer.borrow_mut().pinsert(&vec![0u8; template_size], insert_at)?;
        write_length_prefix(&mut self.buffer.borrow_mut(), field.offset.get(), prefix_width, old_count + 1)?;

        let child = Self::new_child(sub, self.buffer.clone(), insert_at, self)?;
        child.init_buffer()?;

        field.children.borrow_mut().push(child.clone());
        // The inserted region itself (`insert_at..insert_at+template_size`)
        // must not shift -- only whatever already sat past it.
        self.propagate_offsets(insert_at + template_size - 1, template_size as isize);
        Ok(child)
    }

    pub fn delete_array_item(self: &Rc<Self>, name: &str, index: usize) -> Result<()> {
        self.check_not_system(name)?;
        let field = self.find(name)?;
        let scalar_type = field.descriptor.scalar_type();
        if !matches!(scalar_type, ScalarType::Array8 | ScalarType::Array16 | ScalarType::Array32) {
            return Err(type_mismatch(name, "ARRAY*", scalar_type));
        }
        let prefix_width = length_prefix_bytes(scalar_type);

        let (removed_offset, removed_size, new_count) = {
            let mut children = field.children.borrow_mut();
            if index >= children.len() {
                return Err(PrinbeeError::OutOfBounds { index, len: children.len() });
            }
            let removed = children.remove(index);
            (removed.start_offset.get(), removed.current_size(), children.len())
        };

        self.buffer.borrow_mut().perase(removed_size, removed_offset)?;
        write_length_prefix(&mut self.buffer.borrow_mut(), field.offset.get(), prefix_width, new_count)?;
        self.propagate_offsets(removed_offset - 1, -(removed_size as isize));
        Ok(())
    }

    fn static_or_minimum_size(descriptor: &'static [FieldDescriptor]) -> usize {
        use prinbee_types::StaticSize;
        descriptor
            .iter()
            .take_while(|d| !matches!(d.scalar_type(), ScalarType::End))
            .map(|d| match d.scalar_type() {
                ScalarType::Char => d.char_size().unwrap_or(0) as usize,
                other => match other.static_size() {
                    StaticSize::Fixed(n) => n,
                    StaticSize::Variable => length_prefix_bytes(other),
                    StaticSize::Invalid => 0,
                },
            })
            .sum()
    }

    /// Write every field's default value, in descriptor order (spec.md
    /// section 4.4, "Default values"). Intended to be called once, right
    /// after a structure's buffer has been freshly zero-sized.
    pub fn init_buffer(self: &Rc<Self>) -> Result<()> {
        for descriptor in self.descriptor {
            let scalar_type = descriptor.scalar_type();
            if matches!(scalar_type, ScalarType::End | ScalarType::Renamed) {
                continue;
            }
            let name = descriptor.name();

            if matches!(scalar_type, ScalarType::StructureVersion) {
                let field = self.find(name)?;
                let bytes = descriptor.version().min().to_binary().to_le_bytes();
                self.buffer.borrow_mut().pwrite(&bytes, field.offset.get(), true)?;
                continue;
            }
            if matches!(scalar_type, ScalarType::Magic | ScalarType::Structure | ScalarType::Array8 | ScalarType::Array16 | ScalarType::Array32) {
                continue;
            }

            let Some(default_text) = descriptor.default_value() else { continue };
            let field = self.find(name)?;

            match scalar_type {
                ScalarType::P8String | ScalarType::P16String | ScalarType::P32String => {
                    self.set_string(name, default_text)?;
                }
                ScalarType::Char => {
                    self.set_string(name, default_text)?;
                }
                _ => {
                    let bytes = convert::text_to_buffer(scalar_type, default_text)?;
                    self.buffer.borrow_mut().pwrite(&bytes, field.offset.get(), true)?;
                }
            }
        }
        Ok(())
    }

    pub fn set_magic(self: &Rc<Self>, magic: prinbee_types::Magic) -> Result<()> {
        let field = self.find(prinbee_types::SYSTEM_FIELD_NAME_MAGIC)?;
        self.buffer.borrow_mut().pwrite(&magic.as_bytes(), field.offset.get(), true)
    }

    pub fn get_magic(self: &Rc<Self>) -> Result<prinbee_types::Magic> {
        let field = self.find(prinbee_types::SYSTEM_FIELD_NAME_MAGIC)?;
        let bytes = self.buffer.borrow().pread(4, field.offset.get(), true)?;
        Ok(prinbee_types::Magic::from(le::read_u32(&bytes)?))
    }

    pub fn get_version(self: &Rc<Self>) -> Result<Version> {
        let field = self.find(prinbee_types::SYSTEM_FIELD_NAME_STRUCTURE_VERSION)?;
        let bytes = self.buffer.borrow().pread(4, field.offset.get(), true)?;
        Ok(Version::from_binary(le::read_u32(&bytes)?))
    }

    /// The buffer backing this structure, shared by every node in its tree.
    /// Lets a caller persist the whole structure (e.g. [`VirtualBuffer::save_file`])
    /// without hand-rolling a byte encoder on top of the typed accessors.
    pub fn buffer(&self) -> Rc<RefCell<VirtualBuffer>> {
        self.buffer.clone()
    }
}

fn mask_for(bits: usize) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn sign_extend_i64(bytes: &[u8]) -> i64 {
    let negative = bytes.last().copied().unwrap_or(0) & 0x80 != 0;
    let mut buf = [if negative { 0xFF } else { 0 }; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    i64::from_le_bytes(buf)
}

fn sign_extend_int512(bytes: &[u8]) -> Int512 {
    let negative = bytes.last().copied().unwrap_or(0) & 0x80 != 0;
    let mut buf = [if negative { 0xFF } else { 0 }; 64];
    buf[..bytes.len()].copy_from_slice(bytes);
    Int512::from_bits(UInt512::from_bytes(&buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use prinbee_types::{FieldDescriptorFlags, MinMaxVersion};

    fn field(
        name: &'static str,
        scalar_type: ScalarType,
        default: Option<&'static str>,
    ) -> FieldDescriptor {
        FieldDescriptor::new(
            name,
            scalar_type,
            FieldDescriptorFlags::empty(),
            default,
            MinMaxVersion::full_range(),
            None,
        )
        .unwrap()
    }

    fn scenario_a_descriptor() -> &'static [FieldDescriptor] {
        vec![
            field("_magic", ScalarType::Magic, None),
            field("_structure_version", ScalarType::StructureVersion, None),
            field("count", ScalarType::Uint32, None),
            field("size", ScalarType::Uint32, None),
            field("next", ScalarType::Reference, None),
            field("previous", ScalarType::Reference, None),
        ]
        .leak()
    }

    fn new_root_with_zeroed_buffer(descriptor: &'static [FieldDescriptor], size: usize) -> Rc<Structure> {
        let buffer = Rc::new(RefCell::new(VirtualBuffer::from_bytes(vec![0u8; size])));
        Structure::new_root(descriptor, buffer).unwrap()
    }

    #[test]
    fn scenario_a_scalar_round_trip() {
        let descriptor = scenario_a_descriptor();
        let structure = new_root_with_zeroed_buffer(descriptor, 4 + 4 + 4 + 4 + 8 + 8);

        structure.set_magic(prinbee_types::Magic::Blob).unwrap();
        structure.set_uinteger("count", 123).unwrap();
        structure.set_uinteger("size", 900_000).unwrap();
        structure.set_uinteger("next", 0xFF00FF00FF00).unwrap();
        structure.set_uinteger("previous", 0xFF11FF11FF11).unwrap();

        assert_eq!(structure.get_uinteger("count").unwrap(), 123);
        assert_eq!(structure.get_uinteger("size").unwrap(), 900_000);
        assert_eq!(structure.get_uinteger("next").unwrap(), 0xFF00FF00FF00);
        assert_eq!(structure.get_uinteger("previous").unwrap(), 0xFF11FF11FF11);
        assert_eq!(structure.current_size(), 32);
        assert_eq!(structure.get_magic().unwrap(), prinbee_types::Magic::Blob);
    }

    fn scenario_b_descriptor() -> &'static [FieldDescriptor] {
        vec![
            field("_magic", ScalarType::Magic, None),
            field("_structure_version", ScalarType::StructureVersion, None),
            field("name", ScalarType::P8String, Some("Henri")),
            field("description", ScalarType::P16String, Some("")),
            field("essay", ScalarType::P32String, Some("")),
        ]
        .leak()
    }

    #[test]
    fn scenario_b_variable_string_expansion() {
        let descriptor = scenario_b_descriptor();
        // magic(4) + version(4) + name prefix(1) + description prefix(2) + essay prefix(4)
        let buffer = Rc::new(RefCell::new(VirtualBuffer::from_bytes(vec![0u8; 4 + 4 + 1 + 2 + 4])));
        let structure = Structure::new_root(descriptor, buffer).unwrap();
        structure.init_buffer().unwrap();

        assert_eq!(structure.get_string("name").unwrap(), "Henri");
        assert_eq!(structure.current_size(), 4 + 4 + (1 + 5) + 2 + 4);

        let description_offset_before = structure.find("description").unwrap().offset.get();
        let essay_offset_before = structure.find("essay").unwrap().offset.get();

        let long_value = "x".repeat(200);
        structure.set_string("name", &long_value).unwrap();

        assert_eq!(structure.get_string("name").unwrap(), long_value);
        let description_offset_after = structure.find("description").unwrap().offset.get();
        let essay_offset_after = structure.find("essay").unwrap().offset.get();
        assert_eq!(description_offset_after - description_offset_before, 195);
        assert_eq!(essay_offset_after - essay_offset_before, 195);
    }

    fn scenario_c_descriptor() -> &'static [FieldDescriptor] {
        vec![
            field("_magic", ScalarType::Magic, None),
            field("_structure_version", ScalarType::StructureVersion, None),
            field("flags=null/advance:4/performent:2/sign", ScalarType::Bits8, None),
        ]
        .leak()
    }

    #[test]
    fn scenario_c_bit_field_independence() {
        let descriptor = scenario_c_descriptor();
        let structure = new_root_with_zeroed_buffer(descriptor, 4 + 4 + 1);

        structure.set_bits("flags.advance", 13).unwrap();
        structure.set_bits("flags.performent", 2).unwrap();
        structure.set_bits("flags.null", 1).unwrap();
        structure.set_bits("flags.sign", 0).unwrap();

        assert_eq!(structure.get_bits("flags.advance").unwrap(), 13);
        assert_eq!(structure.get_bits("flags.performent").unwrap(), 2);
        assert_eq!(structure.get_bits("flags.null").unwrap(), 1);
        assert_eq!(structure.get_bits("flags.sign").unwrap(), 0);

        assert!(structure.set_bits("flags.advance", 16).is_err());
    }

    fn scenario_d_descriptor() -> &'static [FieldDescriptor] {
        let item_fields: &'static [FieldDescriptor] = vec![
            field("id", ScalarType::Uint32, None),
            field("label", ScalarType::P8String, Some("")),
        ]
        .leak();

        vec![
            field("_magic", ScalarType::Magic, None),
            field("_structure_version", ScalarType::StructureVersion, None),
            FieldDescriptor::new(
                "items",
                ScalarType::Array16,
                FieldDescriptorFlags::empty(),
                None,
                MinMaxVersion::full_range(),
                Some(item_fields),
            )
            .unwrap(),
        ]
        .leak()
    }

    #[test]
    fn scenario_d_array_grow_and_shrink() {
        let descriptor = scenario_d_descriptor();
        let buffer = Rc::new(RefCell::new(VirtualBuffer::from_bytes(vec![0u8; 4 + 4 + 2])));
        let structure = Structure::new_root(descriptor, buffer).unwrap();

        let item0 = structure.new_array_item("items").unwrap();
        item0.set_uinteger("id", 42).unwrap();
        item0.set_string("label", "a").unwrap();

        let item1 = structure.new_array_item("items").unwrap();
        item1.set_uinteger("id", 43).unwrap();
        item1.set_string("label", "bb").unwrap();

        assert_eq!(structure.get_array("items").unwrap().len(), 2);

        structure.delete_array_item("items", 0).unwrap();
        let remaining = structure.get_array("items").unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].get_uinteger("id").unwrap(), 43);
        assert_eq!(remaining[0].get_string("label").unwrap(), "bb");

        let prefix = structure.buffer.borrow().pread(2, structure.find("items").unwrap().offset.get(), true).unwrap();
        assert_eq!(u16::from_le_bytes([prefix[0], prefix[1]]), 1);
    }

    /// A descriptor whose `_structure_version` declares it knows versions
    /// 1.0 through 2.0, with one field (`extra`) that only exists from
    /// 2.0 onward.
    fn scenario_versioned_descriptor() -> &'static [FieldDescriptor] {
        vec![
            field("_magic", ScalarType::Magic, None),
            FieldDescriptor::new(
                "_structure_version",
                ScalarType::StructureVersion,
                FieldDescriptorFlags::empty(),
                None,
                MinMaxVersion::new(Version::new(1, 0), Version::new(2, 0)),
                None,
            )
            .unwrap(),
            field("count", ScalarType::Uint32, None),
            FieldDescriptor::new(
                "extra",
                ScalarType::Uint32,
                FieldDescriptorFlags::empty(),
                None,
                MinMaxVersion::new(Version::new(2, 0), Version::max()),
                None,
            )
            .unwrap(),
        ]
        .leak()
    }

    #[test]
    fn structure_version_gates_field_visibility() {
        let descriptor = scenario_versioned_descriptor();
        let mut raw = VirtualBuffer::from_bytes(vec![0u8; 4 + 4 + 4]);
        raw.pwrite(&Version::new(1, 0).to_binary().to_le_bytes(), 4, true).unwrap();
        raw.pwrite(&123u32.to_le_bytes(), 8, true).unwrap();
        let buffer = Rc::new(RefCell::new(raw));

        let structure = Structure::new_root(descriptor, buffer).unwrap();
        assert_eq!(structure.get_uinteger("count").unwrap(), 123);
        assert_eq!(structure.current_size(), 12);
        assert!(structure.find("extra").is_err());
    }

    #[test]
    fn rejects_structure_version_outside_declared_range() {
        let descriptor = scenario_versioned_descriptor();
        let mut raw = VirtualBuffer::from_bytes(vec![0u8; 4 + 4 + 4 + 4]);
        raw.pwrite(&Version::new(3, 0).to_binary().to_le_bytes(), 4, true).unwrap();
        let buffer = Rc::new(RefCell::new(raw));

        assert!(Structure::new_root(descriptor, buffer).is_err());
    }

    /// Single-bit flag names, declared in the same order as the
    /// `BITS8` field's grammar below, so [`StatusFlag::mask`] lines up
    /// with `get_bits`/`set_bits`'s own bit position for each flag.
    #[derive(prinbee_derive::BitMask, Clone, Copy)]
    enum StatusFlag {
        Null,
        Ready,
        Error,
        Done,
    }

    fn scenario_status_flags_descriptor() -> &'static [FieldDescriptor] {
        vec![
            field("_magic", ScalarType::Magic, None),
            field("_structure_version", ScalarType::StructureVersion, None),
            field("flags=null/ready/error/done", ScalarType::Bits8, None),
        ]
        .leak()
    }

    #[test]
    fn bit_mask_variants_match_structure_bit_positions() {
        let descriptor = scenario_status_flags_descriptor();
        let structure = new_root_with_zeroed_buffer(descriptor, 4 + 4 + 1);

        structure.set_bits("flags.ready", 1).unwrap();
        structure.set_bits("flags.done", 1).unwrap();

        let bytes = structure.buffer.borrow().pread(1, structure.find("flags").unwrap().offset.get(), true).unwrap();
        let raw = bytes[0] as u64;
        assert_eq!(raw, StatusFlag::Ready.mask() | StatusFlag::Done.mask());
        assert_eq!(raw, StatusFlag::combine(&[StatusFlag::Ready, StatusFlag::Done]));

        assert_eq!(structure.get_bits("flags.null").unwrap(), 0);
        assert_eq!(structure.get_bits("flags.ready").unwrap(), 1);
        assert_eq!(structure.get_bits("flags.error").unwrap(), 0);
        assert_eq!(structure.get_bits("flags.done").unwrap(), 1);

        assert_eq!(StatusFlag::Null.mask(), 0b0001);
        assert_eq!(StatusFlag::Ready.mask(), 0b0010);
        assert_eq!(StatusFlag::Error.mask(), 0b0100);
        assert_eq!(StatusFlag::Done.mask(), 0b1000);
    }
}
