//! # Fixed-Slot Serialization
//!
//! Every scalar type serializes to a fixed number of little-endian bytes
//! (see the type table in [`crate::types`]). These routines fill the fixed
//! portion of a row slot, feed B-tree key bytes, and back the validators
//! repair runs over every stored payload.
//!
//! Validation accepts exactly the byte patterns the serializer can emit:
//! date component ranges, code-point legality, 0/1 booleans. Integer and
//! fixed-point types accept any bit pattern.

use std::cmp::Ordering;

use eyre::{ensure, Result};

use super::value::{ArrayValue, Date, DateTime, HiresTime, Real, RichReal};
use super::{FieldType, Value};
use crate::error::{fail, ErrorKind};

/// Serializes a non-null scalar into `out` (sized `ty.scalar_size()`).
pub fn serialize_scalar(value: &Value, out: &mut [u8]) -> Result<()> {
    use Value::*;

    match value {
        Bool(v) => out[0] = *v as u8,
        Char(v) => out[..4].copy_from_slice(&(*v as u32).to_le_bytes()),
        Date(v) => write_date(v, out),
        DateTime(v) => write_datetime(v, out),
        HiresTime(v) => {
            write_datetime(
                &super::value::DateTime::new(v.year, v.month, v.day, v.hour, v.minutes, v.seconds),
                out,
            );
            out[7..11].copy_from_slice(&v.microsec.to_le_bytes());
        }
        Int8(v) => out[0] = *v as u8,
        Int16(v) => out[..2].copy_from_slice(&v.to_le_bytes()),
        Int32(v) => out[..4].copy_from_slice(&v.to_le_bytes()),
        Int64(v) => out[..8].copy_from_slice(&v.to_le_bytes()),
        UInt8(v) => out[0] = *v,
        UInt16(v) => out[..2].copy_from_slice(&v.to_le_bytes()),
        UInt32(v) => out[..4].copy_from_slice(&v.to_le_bytes()),
        UInt64(v) => out[..8].copy_from_slice(&v.to_le_bytes()),
        Real(v) => out[..8].copy_from_slice(&v.units.to_le_bytes()),
        RichReal(v) => out[..16].copy_from_slice(&v.units.to_le_bytes()),
        Null | Text(_) | Array(_) => fail!(
            ErrorKind::GeneralControlError,
            "{value:?} has no fixed scalar form"
        ),
    }

    Ok(())
}

fn write_date(v: &Date, out: &mut [u8]) {
    out[..2].copy_from_slice(&v.year.to_le_bytes());
    out[2] = v.month;
    out[3] = v.day;
}

fn write_datetime(v: &DateTime, out: &mut [u8]) {
    out[..2].copy_from_slice(&v.year.to_le_bytes());
    out[2] = v.month;
    out[3] = v.day;
    out[4] = v.hour;
    out[5] = v.minutes;
    out[6] = v.seconds;
}

/// Deserializes a scalar of type `ty` from its fixed bytes.
pub fn deserialize_scalar(ty: FieldType, bytes: &[u8]) -> Result<Value> {
    ensure!(
        bytes.len() >= ty.scalar_size(),
        "buffer too small for {ty:?}: {} < {}",
        bytes.len(),
        ty.scalar_size()
    );

    Ok(match ty {
        FieldType::Bool => Value::Bool(bytes[0] != 0),
        FieldType::Char => {
            let cp = u32::from_le_bytes(bytes[..4].try_into().unwrap());
            let ch = char::from_u32(cp).ok_or_else(|| {
                eyre::Report::new(ErrorKind::InvalidUnicodeChar)
                    .wrap_err(format!("stored code point {cp:#x} is not a character"))
            })?;
            Value::Char(ch)
        }
        FieldType::Date => Value::Date(read_date(bytes)),
        FieldType::DateTime => Value::DateTime(read_datetime(bytes)),
        FieldType::HiresTime => {
            let dt = read_datetime(bytes);
            let microsec = u32::from_le_bytes(bytes[7..11].try_into().unwrap());
            Value::HiresTime(HiresTime::new(
                dt.year, dt.month, dt.day, dt.hour, dt.minutes, dt.seconds, microsec,
            ))
        }
        FieldType::Int8 => Value::Int8(bytes[0] as i8),
        FieldType::Int16 => Value::Int16(i16::from_le_bytes(bytes[..2].try_into().unwrap())),
        FieldType::Int32 => Value::Int32(i32::from_le_bytes(bytes[..4].try_into().unwrap())),
        FieldType::Int64 => Value::Int64(i64::from_le_bytes(bytes[..8].try_into().unwrap())),
        FieldType::UInt8 => Value::UInt8(bytes[0]),
        FieldType::UInt16 => Value::UInt16(u16::from_le_bytes(bytes[..2].try_into().unwrap())),
        FieldType::UInt32 => Value::UInt32(u32::from_le_bytes(bytes[..4].try_into().unwrap())),
        FieldType::UInt64 => Value::UInt64(u64::from_le_bytes(bytes[..8].try_into().unwrap())),
        FieldType::Real => Value::Real(Real::from_units(i64::from_le_bytes(
            bytes[..8].try_into().unwrap(),
        ))),
        FieldType::RichReal => Value::RichReal(RichReal::from_units(i128::from_le_bytes(
            bytes[..16].try_into().unwrap(),
        ))),
        FieldType::Text => fail!(
            ErrorKind::GeneralControlError,
            "text has no fixed scalar form"
        ),
    })
}

fn read_date(bytes: &[u8]) -> Date {
    Date::new(
        i16::from_le_bytes(bytes[..2].try_into().unwrap()),
        bytes[2],
        bytes[3],
    )
}

fn read_datetime(bytes: &[u8]) -> DateTime {
    let d = read_date(bytes);
    DateTime::new(d.year, d.month, d.day, bytes[4], bytes[5], bytes[6])
}

pub fn days_in_month(year: i16, month: u8) -> u8 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if is_leap_year(year) {
                29
            } else {
                28
            }
        }
        _ => 0,
    }
}

pub fn is_leap_year(year: i16) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn valid_date_bytes(bytes: &[u8]) -> bool {
    let d = read_date(bytes);
    (1..=12).contains(&d.month) && d.day >= 1 && d.day <= days_in_month(d.year, d.month)
}

fn valid_time_bytes(bytes: &[u8]) -> bool {
    bytes[4] < 24 && bytes[5] < 60 && bytes[6] < 60
}

/// True when `bytes` is a byte pattern the serializer could have produced
/// for a scalar of type `ty`. Used by repair on every stored payload.
pub fn validate_scalar(ty: FieldType, bytes: &[u8]) -> bool {
    if bytes.len() < ty.scalar_size() {
        return false;
    }

    match ty {
        FieldType::Bool => bytes[0] <= 1,
        FieldType::Char => {
            let cp = u32::from_le_bytes(bytes[..4].try_into().unwrap());
            cp != 0 && char::from_u32(cp).is_some()
        }
        FieldType::Date => valid_date_bytes(bytes),
        FieldType::DateTime => valid_date_bytes(bytes) && valid_time_bytes(bytes),
        FieldType::HiresTime => {
            valid_date_bytes(bytes)
                && valid_time_bytes(bytes)
                && u32::from_le_bytes(bytes[7..11].try_into().unwrap()) < 1_000_000
        }
        // Every bit pattern decodes to a value for these.
        FieldType::Int8
        | FieldType::Int16
        | FieldType::Int32
        | FieldType::Int64
        | FieldType::UInt8
        | FieldType::UInt16
        | FieldType::UInt32
        | FieldType::UInt64
        | FieldType::Real
        | FieldType::RichReal => true,
        FieldType::Text => false,
    }
}

/// Orders two serialized scalars of type `ty` without allocating.
pub fn compare_raw(ty: FieldType, a: &[u8], b: &[u8]) -> Ordering {
    use FieldType::*;

    let le_i = |x: &[u8], n: usize| -> i64 {
        let mut buf = [0u8; 8];
        buf[..n].copy_from_slice(&x[..n]);
        // Sign-extend from the top byte.
        if n < 8 && x[n - 1] & 0x80 != 0 {
            buf[n..].fill(0xFF);
        }
        i64::from_le_bytes(buf)
    };
    let le_u = |x: &[u8], n: usize| -> u64 {
        let mut buf = [0u8; 8];
        buf[..n].copy_from_slice(&x[..n]);
        u64::from_le_bytes(buf)
    };

    match ty {
        Bool | UInt8 => a[0].cmp(&b[0]),
        Int8 => (a[0] as i8).cmp(&(b[0] as i8)),
        Int16 => le_i(a, 2).cmp(&le_i(b, 2)),
        Int32 => le_i(a, 4).cmp(&le_i(b, 4)),
        Int64 | Real => le_i(a, 8).cmp(&le_i(b, 8)),
        UInt16 => le_u(a, 2).cmp(&le_u(b, 2)),
        Char | UInt32 => le_u(a, 4).cmp(&le_u(b, 4)),
        UInt64 => le_u(a, 8).cmp(&le_u(b, 8)),
        Date => read_date(a).cmp(&read_date(b)),
        DateTime => read_datetime(a).cmp(&read_datetime(b)),
        HiresTime => read_datetime(a).cmp(&read_datetime(b)).then_with(|| {
            let ma = u32::from_le_bytes(a[7..11].try_into().unwrap());
            let mb = u32::from_le_bytes(b[7..11].try_into().unwrap());
            ma.cmp(&mb)
        }),
        RichReal => {
            let ra = i128::from_le_bytes(a[..16].try_into().unwrap());
            let rb = i128::from_le_bytes(b[..16].try_into().unwrap());
            ra.cmp(&rb)
        }
        Text => a.cmp(b),
    }
}

/// Serializes every element of `array` back to back.
pub fn serialize_array(array: &ArrayValue) -> Result<Vec<u8>> {
    let elem_size = array.elem_type().scalar_size();
    let mut out = vec![0u8; elem_size * array.len()];

    for (i, item) in array.items().iter().enumerate() {
        serialize_scalar(item, &mut out[i * elem_size..(i + 1) * elem_size])?;
    }

    Ok(out)
}

/// Rebuilds an array of `elem_type` from its packed element bytes.
pub fn deserialize_array(elem_type: FieldType, bytes: &[u8]) -> Result<ArrayValue> {
    let elem_size = elem_type.scalar_size();
    ensure!(
        elem_size > 0 && bytes.len() % elem_size == 0,
        "array payload of {} bytes is not a multiple of {elem_size}",
        bytes.len()
    );

    let mut items = Vec::with_capacity(bytes.len() / elem_size);
    for chunk in bytes.chunks_exact(elem_size) {
        items.push(deserialize_scalar(elem_type, chunk)?);
    }

    ArrayValue::new(elem_type, items)
}

/// Validates a packed array payload: length alignment plus per-element
/// byte validation.
pub fn validate_array_payload(elem_type: FieldType, bytes: &[u8]) -> bool {
    let elem_size = elem_type.scalar_size();
    if elem_type == FieldType::Text || bytes.len() % elem_size != 0 {
        return false;
    }

    bytes
        .chunks_exact(elem_size)
        .all(|chunk| validate_scalar(elem_type, chunk))
}

/// Validates UTF-8 text payload bytes, rejecting interior NULs.
pub fn validate_text_payload(bytes: &[u8]) -> bool {
    match std::str::from_utf8(bytes) {
        Ok(s) => !s.chars().any(|c| c == '\0'),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: Value) {
        let ty = v.field_type().unwrap();
        let mut buf = vec![0u8; ty.scalar_size()];
        serialize_scalar(&v, &mut buf).unwrap();
        assert!(validate_scalar(ty, &buf), "{v:?} must self-validate");
        assert_eq!(deserialize_scalar(ty, &buf).unwrap(), v);
    }

    #[test]
    fn scalars_roundtrip_at_extremes() {
        roundtrip(Value::Bool(true));
        roundtrip(Value::Bool(false));
        roundtrip(Value::Char('\u{0001}'));
        roundtrip(Value::Char('\u{D7FF}'));
        roundtrip(Value::Char('\u{E000}'));
        roundtrip(Value::Char('\u{10FFFF}'));
        roundtrip(Value::Date(Date::new(i16::MIN, 1, 1)));
        roundtrip(Value::Date(Date::new(i16::MAX, 12, 31)));
        roundtrip(Value::DateTime(DateTime::new(1999, 2, 28, 23, 59, 59)));
        roundtrip(Value::HiresTime(HiresTime::new(2024, 2, 29, 0, 0, 0, 999_999)));
        roundtrip(Value::Int8(i8::MIN));
        roundtrip(Value::Int64(i64::MAX));
        roundtrip(Value::UInt64(u64::MAX));
        roundtrip(Value::Real(Real::from_units(i64::MIN)));
        roundtrip(Value::RichReal(RichReal::from_units(i128::MAX)));
    }

    #[test]
    fn date_validator_checks_component_ranges() {
        let mut buf = [0u8; 4];
        serialize_scalar(&Value::Date(Date::new(2023, 2, 28)), &mut buf).unwrap();
        assert!(validate_scalar(FieldType::Date, &buf));

        buf[3] = 29; // 2023-02-29 does not exist
        assert!(!validate_scalar(FieldType::Date, &buf));

        buf[2] = 0; // month 0
        assert!(!validate_scalar(FieldType::Date, &buf));
    }

    #[test]
    fn leap_year_february_is_accepted() {
        let mut buf = [0u8; 4];
        serialize_scalar(&Value::Date(Date::new(2024, 2, 29)), &mut buf).unwrap();
        assert!(validate_scalar(FieldType::Date, &buf));

        serialize_scalar(&Value::Date(Date::new(1900, 2, 28)), &mut buf).unwrap();
        buf[3] = 29; // 1900 is not a leap year
        assert!(!validate_scalar(FieldType::Date, &buf));

        serialize_scalar(&Value::Date(Date::new(2000, 2, 29)), &mut buf).unwrap();
        assert!(validate_scalar(FieldType::Date, &buf));
    }

    #[test]
    fn char_validator_rejects_surrogates_and_zero() {
        let mut buf = [0u8; 4];

        buf.copy_from_slice(&0u32.to_le_bytes());
        assert!(!validate_scalar(FieldType::Char, &buf));

        buf.copy_from_slice(&0xD800u32.to_le_bytes());
        assert!(!validate_scalar(FieldType::Char, &buf));

        buf.copy_from_slice(&0x110000u32.to_le_bytes());
        assert!(!validate_scalar(FieldType::Char, &buf));

        buf.copy_from_slice(&0x10FFFFu32.to_le_bytes());
        assert!(validate_scalar(FieldType::Char, &buf));
    }

    #[test]
    fn hirestime_validator_bounds_microseconds() {
        let mut buf = [0u8; 11];
        serialize_scalar(
            &Value::HiresTime(HiresTime::new(2020, 1, 1, 0, 0, 0, 999_999)),
            &mut buf,
        )
        .unwrap();
        assert!(validate_scalar(FieldType::HiresTime, &buf));

        buf[7..11].copy_from_slice(&1_000_000u32.to_le_bytes());
        assert!(!validate_scalar(FieldType::HiresTime, &buf));
    }

    #[test]
    fn raw_comparison_matches_value_comparison() {
        let pairs = [
            (Value::Int16(-5), Value::Int16(3)),
            (Value::Int64(i64::MIN), Value::Int64(i64::MAX)),
            (Value::UInt32(1), Value::UInt32(u32::MAX)),
            (
                Value::Date(Date::new(-10, 6, 6)),
                Value::Date(Date::new(10, 1, 1)),
            ),
            (
                Value::Real(Real::from_parts(-1, 500_000)),
                Value::Real(Real::from_parts(0, 1)),
            ),
            (Value::Char('a'), Value::Char('\u{10FFFF}')),
        ];

        for (a, b) in pairs {
            let ty = a.field_type().unwrap();
            let mut ba = vec![0u8; ty.scalar_size()];
            let mut bb = vec![0u8; ty.scalar_size()];
            serialize_scalar(&a, &mut ba).unwrap();
            serialize_scalar(&b, &mut bb).unwrap();

            assert_eq!(compare_raw(ty, &ba, &bb), Ordering::Less, "{a:?} < {b:?}");
            assert_eq!(compare_raw(ty, &bb, &ba), Ordering::Greater);
            assert_eq!(compare_raw(ty, &ba, &ba), Ordering::Equal);
        }
    }

    #[test]
    fn arrays_roundtrip_and_validate() {
        let array = ArrayValue::new(
            FieldType::Int32,
            vec![Value::Int32(-1), Value::Int32(0), Value::Int32(i32::MAX)],
        )
        .unwrap();

        let bytes = serialize_array(&array).unwrap();
        assert_eq!(bytes.len(), 12);
        assert!(validate_array_payload(FieldType::Int32, &bytes));
        assert_eq!(deserialize_array(FieldType::Int32, &bytes).unwrap(), array);

        // A truncated payload no longer aligns.
        assert!(!validate_array_payload(FieldType::Int32, &bytes[..10]));
    }

    #[test]
    fn text_payload_validation_rejects_bad_utf8() {
        assert!(validate_text_payload("héllo \u{10FFFF}".as_bytes()));
        assert!(!validate_text_payload(&[0xC0, 0x80])); // overlong NUL
        assert!(!validate_text_payload(&[0xED, 0xA0, 0x80])); // surrogate
        assert!(!validate_text_payload(b"a\0b"));
    }
}
