//! Text <-> typed-buffer conversion (spec.md section 4.1), grounded on
//! `original_source/prinbee/data/convert.cpp`'s `string_to_int()`,
//! `size_to_multiplicator()`, `string_to_uinteger()`/`string_to_integer()`
//! and their `*_to_string()` counterparts.

use chrono::{DateTime, FixedOffset, TimeZone};

use crate::bigint::{Int512, UInt512};
use crate::error::{PrinbeeError, Result};
use prinbee_types::{ScalarType, Version};

/// One entry of the frozen, alphabetically-ordered unit suffix table
/// (spec.md section 4.1). Two-limb multiplicators cover entries whose
/// value exceeds 2^64 (`QUETTA`, `RONNAB`, ... per the original table).
struct UnitEntry {
    name: &'static str,
    low: u64,
    high: u64,
}

macro_rules! unit {
    ($name:literal, $low:expr) => {
        UnitEntry {
            name: $name,
            low: $low,
            high: 0,
        }
    };
    ($name:literal, $low:expr, $high:expr) => {
        UnitEntry {
            name: $name,
            low: $low,
            high: $high,
        }
    };
}

// WARNING: keep in alphabetical order -- looked up by binary search.
const UNIT_TABLE: &[UnitEntry] = &[
    unit!("EB", 1_000_000_000_000_000_000),
    unit!("EIB", 0x1000_0000_0000_0000),
    unit!("EXA", 1_000_000_000_000_000_000),
    unit!("EXBI", 0x1000_0000_0000_0000),
    unit!("GB", 1_000_000_000),
    unit!("GIB", 0x0000_0000_4000_0000),
    unit!("GIBI", 0x0000_0000_4000_0000),
    unit!("GIGA", 1_000_000_000),
    unit!("KB", 1_000),
    unit!("KIB", 0x0000_0000_0000_0400),
    unit!("KIBI", 0x0000_0000_0000_0400),
    unit!("KILO", 1_000),
    unit!("MB", 1_000_000),
    unit!("MEBI", 0x0000_0000_0010_0000),
    unit!("MEGA", 1_000_000),
    unit!("MIB", 0x0000_0000_0010_0000),
    unit!("PB", 1_000_000_000_000_000),
    unit!("PEBI", 0x0004_0000_0000_0000),
    unit!("PETA", 1_000_000_000_000_000),
    unit!("PIB", 0x0004_0000_0000_0000),
    unit!("QUETTA", 0x4674_EDEA_4000_0000, 0x0000_000C_9F2C_9CD0),
    unit!("QUETTAI", 0, 0x0000_0010_0000_0000),
    unit!("RONNAB", 0x9FD0_803C_E800_0000, 0x0000_0000_033B_2E3C),
    unit!("RONNAIB", 0, 0x0000_0000_0400_0000),
    unit!("TB", 1_000_000_000_000),
    unit!("TEBI", 0x0000_0100_0000_0000),
    unit!("TERA", 1_000_000_000_000),
    unit!("TIB", 0x0000_0100_0000_0000),
    unit!("YB", 0x1BCE_CCED_A100_0000, 0x0000_0000_0000_D3C2),
    unit!("YIB", 0, 0x0000_0000_0001_0000),
    unit!("YOBI", 0, 0x0000_0000_0001_0000),
    unit!("YOTTA", 0x1BCE_CCED_A100_0000, 0x0000_0000_0000_D3C2),
    unit!("ZB", 0x35C9_ADC5_DEA0_0000, 0x0000_0000_0000_0036),
    unit!("ZEBI", 0, 0x0000_0000_0000_0040),
    unit!("ZETTA", 0x35C9_ADC5_DEA0_0000, 0x0000_0000_0000_0036),
    unit!("ZIB", 0, 0x0000_0000_0000_0040),
];

/// Look up a unit suffix, stripping an optional trailing `BYTE`/`BYTES`
/// (spec.md section 4.1 / E3: the original strips this word before
/// matching the table).
fn size_to_multiplicator(raw: &str) -> Result<UInt512> {
    debug_assert!(
        UNIT_TABLE.windows(2).all(|pair| pair[0].name < pair[1].name),
        "UNIT_TABLE must stay alphabetically sorted for binary_search_by to find anything"
    );

    let upper = raw.to_ascii_uppercase();
    let trimmed = upper
        .strip_suffix("BYTES")
        .or_else(|| upper.strip_suffix("BYTE"))
        .unwrap_or(&upper);

    match UNIT_TABLE.binary_search_by(|entry| entry.name.cmp(trimmed)) {
        Ok(index) => {
            let entry = &UNIT_TABLE[index];
            Ok(UInt512::from_two_limbs(entry.low, entry.high))
        }
        Err(_) => Err(PrinbeeError::InvalidNumber(format!(
            "unrecognized size unit {raw:?}"
        ))),
    }
}

enum NumberBase {
    Binary,
    Octal,
    Decimal,
    Hexadecimal,
}

/// Parse a signed or unsigned literal into its 512-bit two's-complement
/// bit pattern, per the grammar in spec.md section 4.1.
pub fn string_to_int(text: &str, accept_negative: bool) -> Result<UInt512> {
    let trimmed = text.trim_start();
    let mut chars = trimmed.chars().peekable();
    let mut negative = false;

    match chars.peek() {
        Some('+') => {
            chars.next();
        }
        Some('-') => {
            if !accept_negative {
                return Err(PrinbeeError::InvalidNumber(format!(
                    "negative values are not accepted: {text:?}"
                )));
            }
            negative = true;
            chars.next();
        }
        _ => {}
    }

    let rest: String = chars.collect();
    let mut rest = rest.as_str();

    let mut expect_quote = false;
    let base = if let Some(stripped) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
        rest = stripped;
        NumberBase::Hexadecimal
    } else if let Some(stripped) = rest.strip_prefix("0b").or_else(|| rest.strip_prefix("0B")) {
        rest = stripped;
        NumberBase::Binary
    } else if let Some(stripped) = rest.strip_prefix("x'").or_else(|| rest.strip_prefix("X'")) {
        rest = stripped;
        expect_quote = true;
        NumberBase::Hexadecimal
    } else if rest.starts_with('0') && rest.len() > 1 {
        rest = &rest[1..];
        NumberBase::Octal
    } else {
        NumberBase::Decimal
    };

    let multiplier = match base {
        NumberBase::Binary => 2u64,
        NumberBase::Octal => 8,
        NumberBase::Decimal => 10,
        NumberBase::Hexadecimal => 16,
    };

    let mut result = UInt512::ZERO;
    let mut consumed = 0usize;
    for c in rest.chars() {
        let digit = match c.to_digit(16) {
            Some(d) if matches!(base, NumberBase::Hexadecimal) => d,
            Some(d) if matches!(base, NumberBase::Decimal) && d < 10 => d,
            Some(d) if matches!(base, NumberBase::Octal) && d < 8 => d,
            Some(d) if matches!(base, NumberBase::Binary) && d < 2 => d,
            _ => break,
        };
        // result = result * multiplier + digit, via repeated doubling --
        // mirrors the original's bit-by-bit / digit-by-digit scaling so
        // no native wide multiply is required while parsing.
        match multiplier {
            2 => result.double(),
            8 => {
                result.double();
                result.double();
                result.double();
            }
            16 => {
                result.double();
                result.double();
                result.double();
                result.double();
            }
            10 => {
                result.double();
                let mut eight = result;
                eight.double();
                eight.double();
                result.add_assign(&eight);
            }
            _ => unreachable!(),
        }
        result.add_assign(&UInt512::from_u64(digit as u64));
        consumed += c.len_utf8();
    }

    if consumed == 0 {
        return Err(PrinbeeError::InvalidNumber(format!(
            "no digits found in {text:?}"
        )));
    }

    rest = &rest[consumed..];

    if expect_quote {
        rest = rest
            .strip_prefix('\'')
            .ok_or_else(|| PrinbeeError::InvalidNumber(format!("closing quote missing in {text:?}")))?;
    }

    let rest = rest.trim_start();
    if !rest.is_empty() {
        let multiplicator = size_to_multiplicator(rest)?;
        result.mul_assign(&multiplicator);
    }

    Ok(if negative {
        result.wrapping_neg()
    } else {
        result
    })
}

/// `string_to_uinteger`: parse and truncate/validate to `max_bits`.
pub fn string_to_uinteger(text: &str, max_bits: usize) -> Result<Vec<u8>> {
    let n = string_to_int(text, false)?;
    if max_bits != 512 && n.bit_size() > max_bits {
        return Err(PrinbeeError::OutOfRange(format!(
            "number {text:?} too large for {max_bits} bits"
        )));
    }
    Ok(n.to_bytes(max_bits / 8))
}

/// `string_to_integer`: parse and validate to `max_bits`, allowing the
/// exact negative minimum of the range (spec.md section 4.1).
pub fn string_to_integer(text: &str, max_bits: usize) -> Result<Vec<u8>> {
    let n = Int512::from_bits(string_to_int(text, true)?);
    if max_bits != 512 && n.bit_size() > max_bits - 1 {
        let is_exact_minimum = n.bit_size() == max_bits && {
            let mut without_sign = n;
            without_sign.add_assign(&Int512::from_bits(UInt512::from_u64(1) .shifted_left(max_bits - 1)));
            without_sign.bits().is_zero()
        };
        if !is_exact_minimum {
            return Err(PrinbeeError::OutOfRange(format!(
                "number {text:?} too large for a signed {max_bits} bit value"
            )));
        }
    }
    Ok(n.bits().to_bytes(max_bits / 8))
}

/// `uinteger_to_string`/`integer_to_string`: render a little-endian buffer
/// back to text in the given base, sign-aware when `signed` is set.
pub fn buffer_to_string(buffer: &[u8], signed: bool, base: u32) -> String {
    let uppercase = base == 16;
    if signed {
        let top_byte = buffer.last().copied().unwrap_or(0);
        if top_byte & 0x80 != 0 {
            // Sign-extend to the full 512-bit width before negating, or
            // the unused high limbs (zero from `from_bytes`) would be
            // read as part of the magnitude instead of the sign.
            let mut extended = [0xFFu8; 64];
            extended[..buffer.len()].copy_from_slice(buffer);
            let magnitude = UInt512::from_bytes(&extended).wrapping_neg();
            return format!("-{}", magnitude.to_string_radix(base, uppercase));
        }
    }
    UInt512::from_bytes(buffer).to_string_radix(base, uppercase)
}

/// True for the integer-like types whose textual grammar is not the plain
/// numeric-literal grammar (spec.md section 6: `VERSION`/`STRUCTURE_VERSION`
/// use `v?MAJOR.MINOR`, the temporal types use ISO-8601) -- these must
/// bypass [`text_to_buffer`]/[`buffer_to_text`]'s generic integer fast path.
fn has_dedicated_text_format(scalar_type: ScalarType) -> bool {
    matches!(
        scalar_type,
        ScalarType::Version
            | ScalarType::StructureVersion
            | ScalarType::Time
            | ScalarType::MsTime
            | ScalarType::UsTime
            | ScalarType::NsTime
    )
}

/// Dispatch a field's declared [`ScalarType`] to the right text->buffer
/// converter (spec.md section 4.1: "a single dispatch function").
pub fn text_to_buffer(scalar_type: ScalarType, text: &str) -> Result<Vec<u8>> {
    use prinbee_types::StaticSize;

    if let StaticSize::Fixed(size) = scalar_type.static_size() {
        if scalar_type.is_integer_like() && !has_dedicated_text_format(scalar_type) {
            let bits = size * 8;
            return if scalar_type.is_signed() {
                string_to_integer(text, bits)
            } else {
                string_to_uinteger(text, bits)
            };
        }
    }

    match scalar_type {
        ScalarType::Float32 => Ok((text
            .parse::<f32>()
            .map_err(|_| PrinbeeError::InvalidNumber(text.to_string()))?)
        .to_le_bytes()
        .to_vec()),
        ScalarType::Float64 => Ok((text
            .parse::<f64>()
            .map_err(|_| PrinbeeError::InvalidNumber(text.to_string()))?)
        .to_le_bytes()
        .to_vec()),
        ScalarType::Float128 => {
            // No native f128 in stable Rust; stored as a zero-padded f64
            // in the low 8 bytes, matching how `NSTIME`'s sub-second
            // fraction is scaled below (best precision stable Rust can
            // offer without a third-party float128 dependency).
            let v: f64 = text
                .parse()
                .map_err(|_| PrinbeeError::InvalidNumber(text.to_string()))?;
            let mut bytes = vec![0u8; 16];
            bytes[..8].copy_from_slice(&v.to_le_bytes());
            Ok(bytes)
        }
        ScalarType::Time | ScalarType::MsTime | ScalarType::UsTime | ScalarType::NsTime => {
            temporal_to_buffer(scalar_type, text)
        }
        ScalarType::Version | ScalarType::StructureVersion => {
            let v = Version::parse(text).map_err(PrinbeeError::from)?;
            Ok(v.to_binary().to_le_bytes().to_vec())
        }
        _ => Err(PrinbeeError::LogicError(format!(
            "{scalar_type} is not convertible via the text dispatcher"
        ))),
    }
}

/// Dispatch a field's buffer bytes to the right text renderer (the
/// inverse of [`text_to_buffer`]).
pub fn buffer_to_text(scalar_type: ScalarType, buffer: &[u8], base: u32) -> Result<String> {
    use prinbee_types::StaticSize;

    if let StaticSize::Fixed(_) = scalar_type.static_size() {
        if scalar_type.is_integer_like() && !has_dedicated_text_format(scalar_type) {
            return Ok(buffer_to_string(buffer, scalar_type.is_signed(), base));
        }
    }

    match scalar_type {
        ScalarType::Float32 => {
            let bytes: [u8; 4] = buffer
                .try_into()
                .map_err(|_| PrinbeeError::InvalidSize { expected: 4, actual: buffer.len() })?;
            Ok(f32::from_le_bytes(bytes).to_string())
        }
        ScalarType::Float64 => {
            let bytes: [u8; 8] = buffer
                .try_into()
                .map_err(|_| PrinbeeError::InvalidSize { expected: 8, actual: buffer.len() })?;
            Ok(f64::from_le_bytes(bytes).to_string())
        }
        ScalarType::Float128 => {
            let bytes: [u8; 8] = buffer[..8]
                .try_into()
                .map_err(|_| PrinbeeError::InvalidSize { expected: 16, actual: buffer.len() })?;
            Ok(f64::from_le_bytes(bytes).to_string())
        }
        ScalarType::Time | ScalarType::MsTime | ScalarType::UsTime | ScalarType::NsTime => {
            temporal_to_string(scalar_type, buffer)
        }
        ScalarType::Version | ScalarType::StructureVersion => {
            let bytes: [u8; 4] = buffer
                .try_into()
                .map_err(|_| PrinbeeError::InvalidSize { expected: 4, actual: buffer.len() })?;
            Ok(Version::from_binary(u32::from_le_bytes(bytes)).to_display_string())
        }
        _ => Err(PrinbeeError::LogicError(format!(
            "{scalar_type} is not convertible via the text dispatcher"
        ))),
    }
}

/// ISO-8601 with optional fractional seconds, scaled to the type's
/// precision, and an optional `+-HHMM` timezone (spec.md section 4.1).
fn temporal_to_buffer(scalar_type: ScalarType, text: &str) -> Result<Vec<u8>> {
    let parsed = DateTime::parse_from_rfc3339(text)
        .or_else(|_| DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%z"))
        .map_err(|_| PrinbeeError::InvalidNumber(format!("not an ISO-8601 timestamp: {text:?}")))?;

    let seconds = parsed.timestamp();
    let nanos = parsed.timestamp_subsec_nanos() as i64;

    let value: i64 = match scalar_type {
        ScalarType::Time => seconds,
        ScalarType::MsTime => seconds * 1_000 + nanos / 1_000_000,
        ScalarType::UsTime => seconds * 1_000_000 + nanos / 1_000,
        ScalarType::NsTime => return Ok((seconds as i128 * 1_000_000_000 + nanos as i128).to_le_bytes().to_vec()),
        _ => unreachable!(),
    };
    Ok(value.to_le_bytes().to_vec())
}

fn temporal_to_string(scalar_type: ScalarType, buffer: &[u8]) -> Result<String> {
    let (seconds, nanos): (i64, u32) = if matches!(scalar_type, ScalarType::NsTime) {
        let bytes: [u8; 16] = buffer
            .try_into()
            .map_err(|_| PrinbeeError::InvalidSize { expected: 16, actual: buffer.len() })?;
        let total = i128::from_le_bytes(bytes);
        ((total.div_euclid(1_000_000_000)) as i64, total.rem_euclid(1_000_000_000) as u32)
    } else {
        let bytes: [u8; 8] = buffer
            .try_into()
            .map_err(|_| PrinbeeError::InvalidSize { expected: 8, actual: buffer.len() })?;
        let value = i64::from_le_bytes(bytes);
        match scalar_type {
            ScalarType::Time => (value, 0),
            ScalarType::MsTime => (value.div_euclid(1_000), (value.rem_euclid(1_000) * 1_000_000) as u32),
            ScalarType::UsTime => (value.div_euclid(1_000_000), (value.rem_euclid(1_000_000) * 1_000) as u32),
            _ => unreachable!(),
        }
    };

    let dt = FixedOffset::east_opt(0)
        .unwrap()
        .timestamp_opt(seconds, nanos)
        .single()
        .ok_or_else(|| PrinbeeError::OutOfRange(format!("timestamp out of range: {seconds}")))?;

    Ok(match scalar_type {
        ScalarType::Time => dt.format("%Y-%m-%dT%H:%M:%S+0000").to_string(),
        ScalarType::MsTime => dt.format("%Y-%m-%dT%H:%M:%S%.3f+0000").to_string(),
        ScalarType::UsTime => dt.format("%Y-%m-%dT%H:%M:%S%.6f+0000").to_string(),
        ScalarType::NsTime => dt.format("%Y-%m-%dT%H:%M:%S%.9f+0000").to_string(),
        _ => unreachable!(),
    })
}

/// The runtime byte size of a value already stored in a buffer, trimming
/// trailing `0x00` (or, for a negative signed value, trailing `0xFF`)
/// limbs the way the original's `value_byte_size()` does before comparing
/// against a narrower field width (spec.md section 9 / E3).
pub fn value_byte_size(buffer: &[u8], signed: bool) -> usize {
    let fill = if signed && buffer.last().copied().unwrap_or(0) & 0x80 != 0 {
        0xFF
    } else {
        0x00
    };
    let mut size = buffer.len();
    while size > 1 && buffer[size - 1] == fill {
        // Stop trimming once trimming further would flip the sign bit of
        // the remaining byte for a signed fill.
        if signed {
            let would_be_sign = buffer[size - 2] & 0x80 != 0;
            if (fill == 0xFF) != would_be_sign {
                break;
            }
        }
        size -= 1;
    }
    size
}

trait ShiftLeft {
    fn shifted_left(self, bits: usize) -> Self;
}

impl ShiftLeft for UInt512 {
    fn shifted_left(self, bits: usize) -> Self {
        let mut result = self;
        for _ in 0..bits {
            result.double();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_and_hex() {
        assert_eq!(string_to_int("123", false).unwrap(), UInt512::from_u64(123));
        assert_eq!(string_to_int("0x7f", false).unwrap(), UInt512::from_u64(0x7f));
        assert_eq!(string_to_int("0b101", false).unwrap(), UInt512::from_u64(0b101));
    }

    #[test]
    fn parses_unit_suffix() {
        let n = string_to_int("2 KB", false).unwrap();
        assert_eq!(n, UInt512::from_u64(2000));
    }

    #[test]
    fn rejects_negative_when_not_accepted() {
        assert!(string_to_int("-1", false).is_err());
    }

    #[test]
    fn uinteger_rejects_overflow() {
        assert!(string_to_uinteger("256", 8).is_err());
        assert!(string_to_uinteger("255", 8).is_ok());
    }

    #[test]
    fn integer_allows_exact_signed_minimum() {
        assert!(string_to_integer("-128", 8).is_ok());
        assert!(string_to_integer("-129", 8).is_err());
        assert!(string_to_integer("127", 8).is_ok());
        assert!(string_to_integer("128", 8).is_err());
    }

    #[test]
    fn round_trips_through_buffer() {
        let buf = text_to_buffer(ScalarType::Int32, "-42").unwrap();
        assert_eq!(buffer_to_text(ScalarType::Int32, &buf, 10).unwrap(), "-42");
    }

    #[test]
    fn version_round_trip() {
        let buf = text_to_buffer(ScalarType::Version, "v1.2").unwrap();
        assert_eq!(buffer_to_text(ScalarType::Version, &buf, 10).unwrap(), "1.2");
    }
}
