//! The context lifecycle (spec.md section 4.5): directory layout,
//! `context.pb`/`complex-types.pb` persistence, and the `update()`
//! monotonic-schema-version rule.
//!
//! Both files are themselves C4 structures over a [`VirtualBuffer`] --
//! `context.pb`'s layout is [`context_descriptor`], `complex-types.pb`'s is
//! [`complex_types_descriptor`] -- rather than hand-rolled byte encoders,
//! the same way every other persistent record in this crate is read and
//! written.

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use prinbee_types::{
    ComplexType, ComplexTypeRegistry, FieldDescriptor, FieldDescriptorFlags, Magic, MinMaxVersion,
    ScalarType, Version,
};

use crate::error::{PrinbeeError, Result};
use crate::structure::Structure;
use crate::vbuf::VirtualBuffer;

/// `<root>/contexts/<name>/` setup parameters (spec.md section 4.5 step 1).
#[derive(Clone, Debug)]
pub struct ContextSetup {
    pub root: PathBuf,
    pub name: String,
    pub owner: Option<String>,
    pub group: Option<String>,
}

/// The mutable fields of `context.pb` (spec.md section 4.5, `update()`).
#[derive(Clone, Debug, Default)]
pub struct ContextInfo {
    pub id: Option<u64>,
    pub schema_version: Version,
    pub description: String,
    pub created_on: Option<DateTime<Utc>>,
    pub last_updated_on: Option<DateTime<Utc>>,
}

/// One of `tables/`'s entries: a directory whose per-version schema files
/// are loaded later, once a table is actually opened (spec.md section 4.5
/// step 4).
#[derive(Clone, Debug)]
pub struct TableEntry {
    pub name: String,
}

pub struct Context {
    setup: ContextSetup,
    path: PathBuf,
    structure: RefCell<Rc<Structure>>,
    complex_types: RefCell<ComplexTypeRegistry>,
    tables: RefCell<Vec<TableEntry>>,
}

/// `[A-Za-z0-9_-]{1,100}(/[A-Za-z0-9_-]{1,100}){0,2}` -- up to 3
/// `/`-separated segments, each capped well short of common filesystem
/// name limits (spec.md section 4.5: "a multi-segment name").
fn validate_context_name(name: &str) -> bool {
    const MAX_SEGMENT_LEN: usize = 100;
    let segments: Vec<&str> = name.split('/').collect();
    if segments.is_empty() || segments.len() > 3 {
        return false;
    }
    segments.iter().all(|s| {
        !s.is_empty()
            && s.len() <= MAX_SEGMENT_LEN
            && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    })
}

/// The magic a raw file buffer starts with, public so `prinbee-cli dump`
/// can classify a file before deciding how to decode the rest of it.
pub fn file_magic(bytes: &[u8]) -> Result<Magic> {
    if bytes.len() < 4 {
        return Err(PrinbeeError::CorruptedData("file shorter than its magic".into()));
    }
    let raw = u32::from_le_bytes(bytes[..4].try_into().expect("checked len >= 4"));
    Ok(Magic::from(raw))
}

const EMPTY_FIELDS: &[FieldDescriptor] = &[];

/// `context.pb`'s structure: a fixed header plus a `P16STRING`
/// description, matching the field-for-field layout `prinbee-cli dump`
/// has always reported (spec.md section 4.5).
fn context_descriptor() -> &'static [FieldDescriptor] {
    static DESCRIPTOR: OnceLock<Vec<FieldDescriptor>> = OnceLock::new();
    DESCRIPTOR.get_or_init(|| {
        vec![
            FieldDescriptor::new(
                "_magic",
                ScalarType::Magic,
                FieldDescriptorFlags::empty(),
                None,
                MinMaxVersion::full_range(),
                None,
            )
            .unwrap(),
            FieldDescriptor::new(
                "_structure_version",
                ScalarType::StructureVersion,
                FieldDescriptorFlags::empty(),
                None,
                MinMaxVersion::new(Version::new(1, 0), Version::new(1, 0)),
                None,
            )
            .unwrap(),
            FieldDescriptor::new(
                "id",
                ScalarType::Oid,
                FieldDescriptorFlags::empty(),
                Some("0"),
                MinMaxVersion::full_range(),
                None,
            )
            .unwrap(),
            FieldDescriptor::new(
                "schema_version",
                ScalarType::Uint32,
                FieldDescriptorFlags::empty(),
                Some("0"),
                MinMaxVersion::full_range(),
                None,
            )
            .unwrap(),
            FieldDescriptor::new(
                "created_on",
                ScalarType::NsTime,
                FieldDescriptorFlags::empty(),
                None,
                MinMaxVersion::full_range(),
                None,
            )
            .unwrap(),
            FieldDescriptor::new(
                "last_updated_on",
                ScalarType::NsTime,
                FieldDescriptorFlags::empty(),
                None,
                MinMaxVersion::full_range(),
                None,
            )
            .unwrap(),
            FieldDescriptor::new(
                "description",
                ScalarType::P16String,
                FieldDescriptorFlags::empty(),
                Some(""),
                MinMaxVersion::full_range(),
                None,
            )
            .unwrap(),
        ]
    })
    .as_slice()
}

/// One field entry inside a registered complex type: its name, its raw
/// `ScalarType` discriminant, and (for `STRUCTURE`/`ARRAY*` fields) the
/// name of the complex type it references.
fn complex_type_field_entry_descriptor() -> &'static [FieldDescriptor] {
    static DESCRIPTOR: OnceLock<Vec<FieldDescriptor>> = OnceLock::new();
    DESCRIPTOR.get_or_init(|| {
        vec![
            FieldDescriptor::new(
                "name",
                ScalarType::P8String,
                FieldDescriptorFlags::empty(),
                None,
                MinMaxVersion::full_range(),
                None,
            )
            .unwrap(),
            FieldDescriptor::new(
                "scalar_type",
                ScalarType::Uint16,
                FieldDescriptorFlags::empty(),
                None,
                MinMaxVersion::full_range(),
                None,
            )
            .unwrap(),
            FieldDescriptor::new(
                "reference",
                ScalarType::P8String,
                FieldDescriptorFlags::empty(),
                Some(""),
                MinMaxVersion::full_range(),
                None,
            )
            .unwrap(),
        ]
    })
    .as_slice()
}

/// One registered complex type: its name and its list of field entries.
fn complex_type_entry_descriptor() -> &'static [FieldDescriptor] {
    static DESCRIPTOR: OnceLock<Vec<FieldDescriptor>> = OnceLock::new();
    DESCRIPTOR.get_or_init(|| {
        vec![
            FieldDescriptor::new(
                "name",
                ScalarType::P8String,
                FieldDescriptorFlags::empty(),
                None,
                MinMaxVersion::full_range(),
                None,
            )
            .unwrap(),
            FieldDescriptor::new(
                "fields",
                ScalarType::Array16,
                FieldDescriptorFlags::empty(),
                None,
                MinMaxVersion::full_range(),
                Some(complex_type_field_entry_descriptor()),
            )
            .unwrap(),
        ]
    })
    .as_slice()
}

/// `complex-types.pb`'s structure: a header plus the array of registered
/// complex types (spec.md section 3: "the registry of user-declared
/// complex types"). No ground-truth binary format survives in
/// `original_source` for this file (only `context.cpp`/`context.h` were
/// retrieved, not `schema_complex_type`'s implementation), so this layout
/// is this crate's own judgment call -- see DESIGN.md.
fn complex_types_descriptor() -> &'static [FieldDescriptor] {
    static DESCRIPTOR: OnceLock<Vec<FieldDescriptor>> = OnceLock::new();
    DESCRIPTOR.get_or_init(|| {
        vec![
            FieldDescriptor::new(
                "_magic",
                ScalarType::Magic,
                FieldDescriptorFlags::empty(),
                None,
                MinMaxVersion::full_range(),
                None,
            )
            .unwrap(),
            FieldDescriptor::new(
                "_structure_version",
                ScalarType::StructureVersion,
                FieldDescriptorFlags::empty(),
                None,
                MinMaxVersion::new(Version::new(1, 0), Version::new(1, 0)),
                None,
            )
            .unwrap(),
            FieldDescriptor::new(
                "types",
                ScalarType::Array16,
                FieldDescriptorFlags::empty(),
                None,
                MinMaxVersion::full_range(),
                Some(complex_type_entry_descriptor()),
            )
            .unwrap(),
        ]
    })
    .as_slice()
}

/// Minimum byte size of a freshly initialized `context.pb`: every fixed
/// field plus a zero-length description payload.
const FRESH_CONTEXT_SIZE: usize = 4 + 4 + 8 + 4 + 16 + 16 + 2;

fn fresh_context_structure() -> Result<Rc<Structure>> {
    let buffer = Rc::new(RefCell::new(VirtualBuffer::from_bytes(vec![0u8; FRESH_CONTEXT_SIZE])));
    let structure = Structure::new_root(context_descriptor(), buffer)?;
    structure.init_buffer()?;
    structure.set_magic(Magic::Context)?;
    Ok(structure)
}

fn nstime_to_datetime(seconds: i64, nanos: u32) -> Option<DateTime<Utc>> {
    if seconds == 0 && nanos == 0 {
        None
    } else {
        DateTime::from_timestamp(seconds, nanos)
    }
}

fn context_info_from_structure(structure: &Rc<Structure>) -> Result<ContextInfo> {
    let id_raw = structure.get_uinteger("id")?;
    let schema_version = Version::from_binary(structure.get_uinteger("schema_version")? as u32);
    let description = structure.get_string("description")?;
    let (created_secs, created_nanos) = structure.get_nstime("created_on")?;
    let (updated_secs, updated_nanos) = structure.get_nstime("last_updated_on")?;

    Ok(ContextInfo {
        id: if id_raw == 0 { None } else { Some(id_raw) },
        schema_version,
        description,
        created_on: nstime_to_datetime(created_secs, created_nanos),
        last_updated_on: nstime_to_datetime(updated_secs, updated_nanos),
    })
}

/// Decode `context.pb`'s bytes into a [`ContextInfo`], independent of any
/// on-disk [`Context`] -- used both by [`Context::initialize`] and by
/// `prinbee-cli dump` to inspect a file without opening its context.
pub fn decode_context_info_bytes(bytes: &[u8]) -> Result<ContextInfo> {
    let buffer = Rc::new(RefCell::new(VirtualBuffer::from_bytes(bytes.to_vec())));
    let structure = Structure::new_root(context_descriptor(), buffer)?;
    context_info_from_structure(&structure)
}

#[cfg(unix)]
fn set_directory_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = std::fs::Permissions::from_mode(0o700);
    std::fs::set_permissions(path, permissions)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_directory_mode(_path: &Path) -> Result<()> {
    Ok(())
}

impl Context {
    /// Resolve paths, create the directory tree if missing, and load or
    /// create `context.pb`/`complex-types.pb` (spec.md section 4.5 steps
    /// 1-4).
    pub fn initialize(setup: ContextSetup) -> Result<Self> {
        if !validate_context_name(&setup.name) {
            return Err(PrinbeeError::InvalidParameter(format!(
                "invalid context name: {:?}",
                setup.name
            )));
        }

        let path = setup.root.join("contexts").join(&setup.name);
        let tables_path = path.join("tables");
        std::fs::create_dir_all(&tables_path)?;
        set_directory_mode(&path)?;
        apply_owner_group(&path, &setup);

        let structure = Self::load_or_create_context_structure(&path)?;

        let context = Self {
            setup,
            path,
            structure: RefCell::new(structure),
            complex_types: RefCell::new(ComplexTypeRegistry::new()),
            tables: RefCell::new(Vec::new()),
        };

        context.load_complex_types_file()?;
        context.enumerate_tables()?;
        Ok(context)
    }

    fn load_or_create_context_structure(path: &Path) -> Result<Rc<Structure>> {
        let file_path = path.join("context.pb");
        if !file_path.exists() {
            return fresh_context_structure();
        }
        let buffer = Rc::new(RefCell::new(VirtualBuffer::load_file(&file_path, true)?));
        let structure = Structure::new_root(context_descriptor(), buffer)?;
        if structure.get_magic()? != Magic::Context {
            return Err(PrinbeeError::InvalidType(format!(
                "{file_path:?} does not start with the CTXT magic"
            )));
        }
        Ok(structure)
    }

    fn context_file_path(&self) -> PathBuf {
        self.path.join("context.pb")
    }

    fn complex_types_file_path(&self) -> PathBuf {
        self.path.join("complex-types.pb")
    }

    /// Decode an existing `complex-types.pb` into real [`FieldDescriptor`]s
    /// and register each one, then verify the whole registry for reference
    /// cycles (spec.md section 3; grounded on
    /// `original_source/prinbee/database/context.cpp`'s
    /// `verify_complex_types()`). An absent file is an empty registry.
    fn load_complex_types_file(&self) -> Result<()> {
        let file_path = self.complex_types_file_path();
        if !file_path.exists() {
            return Ok(());
        }
        let buffer = Rc::new(RefCell::new(VirtualBuffer::load_file(&file_path, true)?));
        let structure = Structure::new_root(complex_types_descriptor(), buffer)?;
        if structure.get_magic()? != Magic::ComplexType {
            return Err(PrinbeeError::InvalidType(format!(
                "{file_path:?} does not start with the CXTP magic"
            )));
        }

        let mut registry = ComplexTypeRegistry::new();
        for type_entry in structure.get_array("types")? {
            let name = type_entry.get_string("name")?;
            let mut fields = Vec::new();
            for field_entry in type_entry.get_array("fields")? {
                let field_name = field_entry.get_string("name")?;
                let raw_scalar_type = field_entry.get_uinteger("scalar_type")? as u16;
                let scalar_type = ScalarType::try_from(raw_scalar_type).map_err(|_| {
                    PrinbeeError::InvalidType(format!(
                        "{file_path:?}: unknown scalar type {raw_scalar_type} in {name:?}"
                    ))
                })?;
                let reference = field_entry.get_string("reference")?;
                let default_value = if reference.is_empty() { None } else { Some(reference.as_str()) };
                let sub_description = scalar_type.requires_sub_description().then_some(EMPTY_FIELDS);

                fields.push(FieldDescriptor::new(
                    &field_name,
                    scalar_type,
                    FieldDescriptorFlags::empty(),
                    default_value,
                    MinMaxVersion::full_range(),
                    sub_description,
                )?);
            }
            registry.register(ComplexType::new(&name, fields.leak()))?;
        }
        registry.verify()?;

        *self.complex_types.borrow_mut() = registry;
        Ok(())
    }

    fn enumerate_tables(&self) -> Result<()> {
        let tables_path = self.path.join("tables");
        let mut tables = Vec::new();
        for entry in std::fs::read_dir(&tables_path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    tables.push(TableEntry { name: name.to_string() });
                }
            }
        }
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        *self.tables.borrow_mut() = tables;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The parameters this context was opened with.
    pub fn setup(&self) -> &ContextSetup {
        &self.setup
    }

    pub fn info(&self) -> Result<ContextInfo> {
        context_info_from_structure(&self.structure.borrow())
    }

    pub fn tables(&self) -> Vec<TableEntry> {
        self.tables.borrow().clone()
    }

    /// Renaming a context means moving `<root>/contexts/<old>` to
    /// `<root>/contexts/<new>` while every table and index file inside it
    /// stays open under its existing handles -- this crate doesn't yet
    /// track open file handles across a directory move, so it's refused
    /// rather than silently leaving readers pointed at the old path.
    pub fn rename(&self, new_name: &str) -> Result<()> {
        Err(PrinbeeError::NotYetImplemented(format!(
            "renaming context {:?} to {new_name:?}",
            self.setup.name
        )))
    }

    /// Apply `schema_version`/`description` changes (spec.md section 4.5,
    /// `update()`). Rejecting a stale `schema_version` is a silent no-op
    /// with a diagnostic, not an error, so concurrent racing clients never
    /// see each other's updates fail loudly.
    pub fn update(&self, new_schema_version: Version, new_description: &str) -> Result<()> {
        let structure = self.structure.borrow().clone();
        let current_schema_version = Version::from_binary(structure.get_uinteger("schema_version")? as u32);

        if new_schema_version < current_schema_version {
            log::warn!(
                "rejecting context update: schema_version {new_schema_version} is older than current {current_schema_version}"
            );
            return Ok(());
        }

        let current_description = structure.get_string("description")?;
        let changed = new_schema_version != current_schema_version || new_description != current_description;
        if !changed {
            return Ok(());
        }

        structure.set_uinteger("schema_version", new_schema_version.to_binary() as u64)?;
        structure.set_string("description", new_description)?;

        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let (now_secs, now_nanos) = (now.as_secs() as i64, now.subsec_nanos());

        let first_save = structure.get_uinteger("id")? == 0;
        if first_save {
            // A mandatory suspension guaranteeing the next context's id
            // assignment cannot land in the same tick (spec.md section 5).
            std::thread::sleep(Duration::from_secs(1));
            structure.set_uinteger("id", unique_id())?;
            structure.set_nstime("created_on", now_secs, now_nanos)?;
        }
        structure.set_nstime("last_updated_on", now_secs, now_nanos)?;

        self.save()
    }

    fn save(&self) -> Result<()> {
        let structure = self.structure.borrow();
        structure.buffer().borrow().save_file(&self.context_file_path())
    }
}

fn unique_id() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(unix)]
fn apply_owner_group(path: &Path, setup: &ContextSetup) {
    if setup.owner.is_none() && setup.group.is_none() {
        return;
    }
    // Resolving a configured owner/group to a uid/gid needs an NSS lookup
    // this crate's dependency stack has no crate for; best-effort log
    // instead of silently pretending the change happened.
    log::warn!(
        "context {:?} requested owner/group {:?}/{:?}, but uid/gid resolution is not implemented",
        setup.name,
        setup.owner,
        setup.group
    );
    let _ = path;
}

#[cfg(not(unix))]
fn apply_owner_group(_path: &Path, _setup: &ContextSetup) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup(root: &Path, name: &str) -> ContextSetup {
        ContextSetup {
            root: root.to_path_buf(),
            name: name.to_string(),
            owner: None,
            group: None,
        }
    }

    #[test]
    fn rejects_invalid_name() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Context::initialize(setup(dir.path(), "")).is_err());
        assert!(Context::initialize(setup(dir.path(), "a/b/c/d")).is_err());
        assert!(Context::initialize(setup(dir.path(), &"x".repeat(101))).is_err());
    }

    #[test]
    fn creates_directory_tree() {
        let dir = tempfile::tempdir().unwrap();
        let context = Context::initialize(setup(dir.path(), "org/team")).unwrap();
        assert!(context.path().join("tables").is_dir());
    }

    #[test]
    fn rename_is_not_yet_implemented() {
        let dir = tempfile::tempdir().unwrap();
        let context = Context::initialize(setup(dir.path(), "test_context")).unwrap();
        assert!(matches!(context.rename("moved"), Err(PrinbeeError::NotYetImplemented(_))));
    }

    #[test]
    fn first_update_assigns_id_and_matching_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let context = Context::initialize(setup(dir.path(), "test_context")).unwrap();

        context.update(Version::new(1, 0), "first").unwrap();
        let info = context.info().unwrap();
        assert!(info.id.is_some());
        assert_eq!(info.created_on, info.last_updated_on);
    }

    #[test]
    fn stale_schema_version_update_is_a_silent_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let context = Context::initialize(setup(dir.path(), "test_context")).unwrap();
        context.update(Version::new(2, 0), "v2").unwrap();

        context.update(Version::new(1, 0), "v1").unwrap();
        let info = context.info().unwrap();
        assert_eq!(info.schema_version, Version::new(2, 0));
        assert_eq!(info.description, "v2");
    }

    /// spec.md section 8, scenario E: a context's id is assigned once, on
    /// first save, and survives being closed and reopened from disk; a
    /// later update bumps `last_updated_on` but leaves `created_on` and
    /// `id` untouched. Timestamps round-trip at full nanosecond precision.
    #[test]
    fn scenario_e_context_lifecycle_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let context = Context::initialize(setup(dir.path(), "test_context")).unwrap();
        context.update(Version::new(5, 0), "first description").unwrap();
        let first = context.info().unwrap();
        assert!(first.id.is_some());
        assert_eq!(first.created_on, first.last_updated_on);
        drop(context);

        let reopened = Context::initialize(setup(dir.path(), "test_context")).unwrap();
        let reloaded = reopened.info().unwrap();
        assert_eq!(reloaded.id, first.id);
        assert_eq!(reloaded.schema_version, Version::new(5, 0));
        assert_eq!(reloaded.created_on, first.created_on);
        assert_eq!(reloaded.description, "first description");

        reopened.update(Version::new(6, 0), "second description").unwrap();
        let second = reopened.info().unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.schema_version, Version::new(6, 0));
        assert_eq!(second.created_on, first.created_on);
        assert!(second.last_updated_on.unwrap() >= second.created_on.unwrap());
        drop(reopened);

        let reopened_again = Context::initialize(setup(dir.path(), "test_context")).unwrap();
        let final_info = reopened_again.info().unwrap();
        assert_eq!(final_info.id, first.id);
        assert_eq!(final_info.schema_version, Version::new(6, 0));
        assert_eq!(final_info.description, "second description");
        assert_eq!(final_info.created_on, first.created_on);
        assert_eq!(final_info.last_updated_on, second.last_updated_on);
    }

    #[test]
    fn complex_types_file_round_trips_through_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("contexts").join("test_context");
        std::fs::create_dir_all(path.join("tables")).unwrap();

        // Hand-build a complex-types.pb declaring one type `point` with
        // two UINT32 fields, the way `load_complex_types_file` expects.
        let buffer = Rc::new(RefCell::new(VirtualBuffer::from_bytes(vec![0u8; 4 + 4 + 2])));
        let structure = Structure::new_root(complex_types_descriptor(), buffer).unwrap();
        structure.init_buffer().unwrap();
        structure.set_magic(Magic::ComplexType).unwrap();

        let point = structure.new_array_item("types").unwrap();
        point.set_string("name", "point").unwrap();

        let x = point.new_array_item("fields").unwrap();
        x.set_string("name", "x").unwrap();
        x.set_uinteger("scalar_type", ScalarType::Uint32 as u64).unwrap();

        let y = point.new_array_item("fields").unwrap();
        y.set_string("name", "y").unwrap();
        y.set_uinteger("scalar_type", ScalarType::Uint32 as u64).unwrap();

        structure.buffer().borrow().save_file(&path.join("complex-types.pb")).unwrap();

        let context = Context::initialize(setup(dir.path(), "test_context")).unwrap();
        let registry = context.complex_types.borrow();
        let point = registry.get("point").expect("point must be registered");
        assert_eq!(point.fields().len(), 2);
        assert_eq!(point.fields()[0].name(), "x");
        assert_eq!(point.fields()[1].name(), "y");
    }
}
