//! The unified error type raised by every engine in this crate (spec.md
//! section 7), composed from [`prinbee_types::TypeError`] the way
//! `apfs-core::block::BlockReadError` composes `std::io::Error`.

use thiserror::Error;

pub type Result<T, E = PrinbeeError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum PrinbeeError {
    /// Descriptor malformed, context name invalid, registry entry conflict.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A text literal could not be parsed at the declared type.
    #[error("invalid token: {0}")]
    InvalidToken(String),

    /// A text literal's digits parsed but are not a valid number.
    #[error("invalid number: {0}")]
    InvalidNumber(String),

    /// An operation's declared size disagrees with the field's.
    #[error("invalid size: expected {expected}, got {actual}")]
    InvalidSize { expected: usize, actual: usize },

    /// A file or buffer starts with an unrecognized magic.
    #[error("invalid type: unrecognized magic {0:?}")]
    InvalidType(String),

    /// Accessor called with a type that does not match the field.
    #[error("type mismatch on field {field}: expected {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: &'static str,
        found: String,
    },

    /// Numeric value exceeds the field width, or an offset/size is out of
    /// bounds.
    #[error("out of range: {0}")]
    OutOfRange(String),

    /// Array/sub-structure index out of range.
    #[error("out of bounds: index {index} (len {len})")]
    OutOfBounds { index: usize, len: usize },

    /// Named field or flag not present in the descriptor.
    #[error("field not found: {0}")]
    FieldNotFound(String),

    /// Length prefix disagrees with the runtime field size, or a field
    /// extends past the buffer.
    #[error("corrupted data: {0}")]
    CorruptedData(String),

    /// Internal precondition violated (e.g. accessor called before the
    /// buffer is set).
    #[error("logic error: {0}")]
    LogicError(String),

    /// File system access failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Reserved for partially-built surfaces (e.g. renaming a context).
    #[error("not yet implemented: {0}")]
    NotYetImplemented(String),
}

impl From<prinbee_types::TypeError> for PrinbeeError {
    fn from(err: prinbee_types::TypeError) -> Self {
        use prinbee_types::TypeError as T;
        match err {
            T::InputTooSmall => Self::CorruptedData("input too small".into()),
            T::InvalidFieldName(name) => Self::InvalidParameter(format!("invalid field name: {name}")),
            T::InvalidSystemFieldName(name) => {
                Self::InvalidParameter(format!("invalid system field name: {name}"))
            }
            T::InvalidSubDescription(name) => {
                Self::InvalidParameter(format!("invalid sub-description for {name}"))
            }
            T::InvalidVersionRange => Self::InvalidParameter("min_version must be <= max_version".into()),
            T::InvalidBitFieldGrammar(name) => {
                Self::InvalidParameter(format!("invalid bit-field grammar in {name}"))
            }
            T::InvalidCharFieldSize(name) => {
                Self::InvalidParameter(format!("invalid CHAR field size in {name}"))
            }
            T::InvalidType(what) => Self::InvalidType(what),
            T::FieldNotFound(name) => Self::FieldNotFound(name),
            T::InvalidParameter(message) => Self::InvalidParameter(message),
        }
    }
}
