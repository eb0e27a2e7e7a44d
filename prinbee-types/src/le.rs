//! Little-endian decode helpers shared by the scalar and descriptor modules.
//!
//! Every multi-byte integer in a Prinbee file is little-endian (spec.md
//! section 3). These are plain slice readers; the virtual buffer in
//! `prinbee-core` is what actually owns file-backed memory, so these take
//! `&[u8]` rather than anything buffer-shaped.

use crate::error::TypeError;

/// Read a `u16` at the start of `data`.
pub fn read_u16(data: &[u8]) -> Result<u16, TypeError> {
    let bytes: [u8; 2] = data
        .get(0..2)
        .ok_or(TypeError::InputTooSmall)?
        .try_into()
        .expect("slice of len 2");
    Ok(u16::from_le_bytes(bytes))
}

/// Read a `u32` at the start of `data`.
pub fn read_u32(data: &[u8]) -> Result<u32, TypeError> {
    let bytes: [u8; 4] = data
        .get(0..4)
        .ok_or(TypeError::InputTooSmall)?
        .try_into()
        .expect("slice of len 4");
    Ok(u32::from_le_bytes(bytes))
}

/// Read a `u64` at the start of `data`.
pub fn read_u64(data: &[u8]) -> Result<u64, TypeError> {
    let bytes: [u8; 8] = data
        .get(0..8)
        .ok_or(TypeError::InputTooSmall)?
        .try_into()
        .expect("slice of len 8");
    Ok(u64::from_le_bytes(bytes))
}
