//! Prinbee binary record engine core: the value converter, virtual
//! buffer, structure codec, and context lifecycle built on top of
//! `prinbee-types`'s vocabulary.

pub mod bigint;
pub mod context;
pub mod convert;
pub mod error;
pub mod structure;
pub mod vbuf;

pub use bigint::{Int512, UInt512};
pub use error::{PrinbeeError, Result};
pub use structure::Structure;
pub use vbuf::VirtualBuffer;
