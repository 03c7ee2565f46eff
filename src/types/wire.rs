//! # Wire Value Codec
//!
//! NUL-terminated UTF-8 forms used by network collaborators. The engine
//! only needs them for round-trip testing; the encoder and decoder live
//! here so both sides agree on one byte-exact format.
//!
//! ## Forms
//!
//! | type        | encoding                              |
//! |-------------|---------------------------------------|
//! | null        | single `0x00`                         |
//! | bool        | `'0'` or `'1'`, then NUL              |
//! | char        | UTF-8 of one non-zero code point, NUL |
//! | date        | `[-]Y/M/D` (no zero padding), NUL     |
//! | datetime    | `[-]Y/M/D H:M:S`, NUL                 |
//! | hirestime   | `[-]Y/M/D H:M:S.micros` (6 digits)    |
//! | integers    | decimal, `-` only for signed, NUL     |
//! | real        | `[-]int.frac`, frac trailing zeros    |
//! |             | stripped but never empty, NUL         |
//! | text        | raw UTF-8 bytes, NUL                  |
//!
//! Arrays have no wire form at this layer.

use eyre::Result;

use super::value::{Date, DateTime, HiresTime, Real, RichReal};
use super::{FieldType, Value, REAL_PRECISION, RICHREAL_PRECISION};
use crate::error::{fail, ErrorKind};

/// Number of decimal fraction digits carried by each real type.
const REAL_FRAC_DIGITS: usize = 6;
const RICHREAL_FRAC_DIGITS: usize = 14;

/// Encodes `value` into its NUL-terminated wire form.
pub fn encode_value(value: &Value, out: &mut Vec<u8>) -> Result<()> {
    match value {
        Value::Null => {}
        Value::Bool(v) => out.push(if *v { b'1' } else { b'0' }),
        Value::Char(v) => {
            if *v == '\0' {
                fail!(ErrorKind::InvalidUnicodeChar, "NUL has no wire form");
            }
            let mut buf = [0u8; 4];
            out.extend_from_slice(v.encode_utf8(&mut buf).as_bytes());
        }
        Value::Date(v) => out.extend_from_slice(format_date(v).as_bytes()),
        Value::DateTime(v) => {
            out.extend_from_slice(
                format!(
                    "{} {}:{}:{}",
                    format_date(&Date::new(v.year, v.month, v.day)),
                    v.hour,
                    v.minutes,
                    v.seconds
                )
                .as_bytes(),
            );
        }
        Value::HiresTime(v) => {
            out.extend_from_slice(
                format!(
                    "{} {}:{}:{}.{:06}",
                    format_date(&Date::new(v.year, v.month, v.day)),
                    v.hour,
                    v.minutes,
                    v.seconds,
                    v.microsec
                )
                .as_bytes(),
            );
        }
        Value::Int8(v) => out.extend_from_slice(v.to_string().as_bytes()),
        Value::Int16(v) => out.extend_from_slice(v.to_string().as_bytes()),
        Value::Int32(v) => out.extend_from_slice(v.to_string().as_bytes()),
        Value::Int64(v) => out.extend_from_slice(v.to_string().as_bytes()),
        Value::UInt8(v) => out.extend_from_slice(v.to_string().as_bytes()),
        Value::UInt16(v) => out.extend_from_slice(v.to_string().as_bytes()),
        Value::UInt32(v) => out.extend_from_slice(v.to_string().as_bytes()),
        Value::UInt64(v) => out.extend_from_slice(v.to_string().as_bytes()),
        Value::Real(v) => {
            let frac = format!("{:0width$}", v.frac_part(), width = REAL_FRAC_DIGITS);
            out.extend_from_slice(
                format_real(v.is_negative(), &v.int_part().abs().to_string(), &frac).as_bytes(),
            );
        }
        Value::RichReal(v) => {
            let frac = format!("{:0width$}", v.frac_part(), width = RICHREAL_FRAC_DIGITS);
            out.extend_from_slice(
                format_real(
                    v.is_negative(),
                    &v.int_part().unsigned_abs().to_string(),
                    &frac,
                )
                .as_bytes(),
            );
        }
        Value::Text(v) => {
            if v.contains('\0') {
                fail!(
                    ErrorKind::InvalidParameters,
                    "text with embedded NUL has no wire form"
                );
            }
            out.extend_from_slice(v.as_bytes());
        }
        Value::Array(_) => fail!(
            ErrorKind::InvalidParameters,
            "arrays have no wire form at this layer"
        ),
    }

    out.push(0);
    Ok(())
}

fn format_date(d: &Date) -> String {
    format!("{}/{}/{}", d.year, d.month, d.day)
}

fn format_real(negative: bool, int_abs: &str, frac_padded: &str) -> String {
    let frac = frac_padded.trim_end_matches('0');
    let frac = if frac.is_empty() { "0" } else { frac };
    let sign = if negative { "-" } else { "" };
    format!("{sign}{int_abs}.{frac}")
}

/// Decodes one NUL-terminated value of type `ty` from the front of
/// `bytes`. Returns the value and the number of bytes consumed.
pub fn decode_value(ty: FieldType, bytes: &[u8]) -> Result<(Value, usize)> {
    let nul = match bytes.iter().position(|&b| b == 0) {
        Some(p) => p,
        None => fail!(
            ErrorKind::InvalidParameters,
            "wire value is not NUL-terminated"
        ),
    };
    let consumed = nul + 1;

    if nul == 0 {
        return Ok((Value::Null, consumed));
    }

    let body = std::str::from_utf8(&bytes[..nul]).map_err(|e| {
        eyre::Report::new(ErrorKind::InvalidUnicodeChar)
            .wrap_err(format!("wire bytes are not valid UTF-8: {e}"))
    })?;

    let value = match ty {
        FieldType::Bool => match body {
            "0" => Value::Bool(false),
            "1" => Value::Bool(true),
            _ => fail!(ErrorKind::InvalidParameters, "bad wire bool '{body}'"),
        },
        FieldType::Char => {
            let mut chars = body.chars();
            let c = chars.next().unwrap();
            if chars.next().is_some() {
                fail!(
                    ErrorKind::InvalidParameters,
                    "wire char '{body}' holds more than one code point"
                );
            }
            Value::Char(c)
        }
        FieldType::Date => Value::Date(parse_date(body)?),
        FieldType::DateTime => {
            let (date, time) = split_date_time(body)?;
            let (h, m, s) = parse_time(time)?;
            Value::DateTime(DateTime::new(date.year, date.month, date.day, h, m, s))
        }
        FieldType::HiresTime => {
            let (date, time) = split_date_time(body)?;
            let (time, frac) = match time.split_once('.') {
                Some((t, f)) => (t, f),
                None => (time, "0"),
            };
            let (h, m, s) = parse_time(time)?;
            let micro = parse_fraction(frac, REAL_FRAC_DIGITS)? as u32;
            Value::HiresTime(HiresTime::new(
                date.year, date.month, date.day, h, m, s, micro,
            ))
        }
        FieldType::Int8 => Value::Int8(parse_int(body)?),
        FieldType::Int16 => Value::Int16(parse_int(body)?),
        FieldType::Int32 => Value::Int32(parse_int(body)?),
        FieldType::Int64 => Value::Int64(parse_int(body)?),
        FieldType::UInt8 => Value::UInt8(parse_uint(body)?),
        FieldType::UInt16 => Value::UInt16(parse_uint(body)?),
        FieldType::UInt32 => Value::UInt32(parse_uint(body)?),
        FieldType::UInt64 => Value::UInt64(parse_uint(body)?),
        FieldType::Real => {
            let (neg, int_abs, frac) = split_real(body)?;
            let frac = parse_fraction(frac, REAL_FRAC_DIGITS)? as i64;
            let int_abs: i64 = int_abs
                .parse()
                .map_err(|e| invalid(format!("bad wire real '{body}': {e}")))?;
            let units = int_abs * REAL_PRECISION + frac;
            Value::Real(Real::from_units(if neg { -units } else { units }))
        }
        FieldType::RichReal => {
            let (neg, int_abs, frac) = split_real(body)?;
            let frac = parse_fraction(frac, RICHREAL_FRAC_DIGITS)? as i128;
            let int_abs: i128 = int_abs
                .parse()
                .map_err(|e| invalid(format!("bad wire richreal '{body}': {e}")))?;
            let units = int_abs * RICHREAL_PRECISION + frac;
            Value::RichReal(RichReal::from_units(if neg { -units } else { units }))
        }
        FieldType::Text => Value::Text(body.to_string()),
    };

    Ok((value, consumed))
}

fn invalid(msg: String) -> eyre::Report {
    eyre::Report::new(ErrorKind::InvalidParameters).wrap_err(msg)
}

fn parse_int<T: std::str::FromStr>(body: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    body.parse()
        .map_err(|e| invalid(format!("bad wire integer '{body}': {e}")))
}

fn parse_uint<T: std::str::FromStr>(body: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    if body.starts_with('-') {
        return Err(invalid(format!("unsigned wire value '{body}' is negative")));
    }
    parse_int(body)
}

fn parse_date(body: &str) -> Result<Date> {
    let (sign, rest) = match body.strip_prefix('-') {
        Some(rest) => (-1i32, rest),
        None => (1, body.strip_prefix('+').unwrap_or(body)),
    };

    let mut parts = rest.split('/');
    let (y, m, d) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(y), Some(m), Some(d), None) => (y, m, d),
        _ => return Err(invalid(format!("bad wire date '{body}'"))),
    };

    let year: i32 = y
        .parse()
        .map_err(|e| invalid(format!("bad wire year '{y}': {e}")))?;
    let year = i16::try_from(sign * year)
        .map_err(|_| invalid(format!("wire year '{body}' out of range")))?;
    let month: u8 = m
        .parse()
        .map_err(|e| invalid(format!("bad wire month '{m}': {e}")))?;
    let day: u8 = d
        .parse()
        .map_err(|e| invalid(format!("bad wire day '{d}': {e}")))?;

    if !(1..=12).contains(&month) || day < 1 || day > super::serial::days_in_month(year, month) {
        return Err(invalid(format!("wire date '{body}' has no calendar day")));
    }

    Ok(Date::new(year, month, day))
}

fn split_date_time(body: &str) -> Result<(Date, &str)> {
    match body.split_once(' ') {
        Some((date, time)) => Ok((parse_date(date)?, time)),
        None => Err(invalid(format!("bad wire timestamp '{body}'"))),
    }
}

fn parse_time(body: &str) -> Result<(u8, u8, u8)> {
    let mut parts = body.split(':');
    let (h, m, s) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(m), Some(s), None) => (h, m, s),
        _ => return Err(invalid(format!("bad wire time '{body}'"))),
    };

    let hour: u8 = h.parse().map_err(|e| invalid(format!("bad hour: {e}")))?;
    let minutes: u8 = m.parse().map_err(|e| invalid(format!("bad minutes: {e}")))?;
    let seconds: u8 = s.parse().map_err(|e| invalid(format!("bad seconds: {e}")))?;

    if hour >= 24 || minutes >= 60 || seconds >= 60 {
        return Err(invalid(format!("wire time '{body}' out of range")));
    }

    Ok((hour, minutes, seconds))
}

/// Parses a fraction written with up to `digits` places and scales it to
/// exactly `digits` places; the precision is implicitly 10^digits.
fn parse_fraction(frac: &str, digits: usize) -> Result<u64> {
    if frac.is_empty() || frac.len() > digits || !frac.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(format!("bad wire fraction '{frac}'")));
    }

    let parsed: u64 = frac
        .parse()
        .map_err(|e| invalid(format!("bad wire fraction '{frac}': {e}")))?;

    Ok(parsed * 10u64.pow((digits - frac.len()) as u32))
}

fn split_real(body: &str) -> Result<(bool, &str, &str)> {
    let (neg, rest) = match body.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, body),
    };

    match rest.split_once('.') {
        Some((int_abs, frac)) if !int_abs.is_empty() => Ok((neg, int_abs, frac)),
        _ => Err(invalid(format!("bad wire real '{body}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: Value) -> Vec<u8> {
        let ty = v.field_type().unwrap_or(FieldType::Bool);
        let mut wire = Vec::new();
        encode_value(&v, &mut wire).unwrap();

        let (decoded, consumed) = decode_value(ty, &wire).unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(decoded, v);
        wire
    }

    #[test]
    fn null_is_a_single_nul_byte() {
        let mut wire = Vec::new();
        encode_value(&Value::Null, &mut wire).unwrap();
        assert_eq!(wire, vec![0]);

        for ty in [FieldType::Bool, FieldType::Text, FieldType::HiresTime] {
            let (v, n) = decode_value(ty, &wire).unwrap();
            assert_eq!(v, Value::Null);
            assert_eq!(n, 1);
        }
    }

    #[test]
    fn scalar_forms_roundtrip() {
        roundtrip(Value::Bool(true));
        roundtrip(Value::Char('ß'));
        roundtrip(Value::Char('\u{10FFFF}'));
        roundtrip(Value::Date(Date::new(-50, 3, 2)));
        roundtrip(Value::DateTime(DateTime::new(2024, 12, 31, 0, 0, 1)));
        roundtrip(Value::Int64(i64::MIN));
        roundtrip(Value::UInt64(u64::MAX));
        roundtrip(Value::Text("naïve \u{E000} text".into()));
    }

    #[test]
    fn hirestime_wire_form_is_byte_exact() {
        let v = Value::HiresTime(HiresTime::new(1999, 12, 31, 23, 59, 59, 999_999));
        let wire = roundtrip(v);

        assert_eq!(wire, b"1999/12/31 23:59:59.999999\0");
        assert_eq!(wire.len(), 27);
    }

    #[test]
    fn date_has_no_zero_padding() {
        let mut wire = Vec::new();
        encode_value(&Value::Date(Date::new(5, 1, 9)), &mut wire).unwrap();
        assert_eq!(wire, b"5/1/9\0");
    }

    #[test]
    fn real_strips_trailing_fraction_zeros() {
        let mut wire = Vec::new();
        encode_value(&Value::Real(Real::from_parts(1, 500_000)), &mut wire).unwrap();
        assert_eq!(wire, b"1.5\0");

        wire.clear();
        encode_value(&Value::Real(Real::from_units(0)), &mut wire).unwrap();
        assert_eq!(wire, b"0.0\0");

        wire.clear();
        encode_value(&Value::Real(Real::from_units(-100_000)), &mut wire).unwrap();
        assert_eq!(wire, b"-0.1\0");
    }

    #[test]
    fn real_decodes_short_fractions_by_power_of_ten() {
        let (v, _) = decode_value(FieldType::Real, b"2.25\0").unwrap();
        assert_eq!(v, Value::Real(Real::from_parts(2, 250_000)));

        let (v, _) = decode_value(FieldType::RichReal, b"-3.5\0").unwrap();
        assert_eq!(
            v,
            Value::RichReal(RichReal::from_parts(-3, 50_000_000_000_000))
        );
    }

    #[test]
    fn real_rejects_overlong_fractions() {
        assert!(decode_value(FieldType::Real, b"1.1234567\0").is_err());
        assert!(decode_value(FieldType::Real, b"1.\0").is_err());
        assert!(decode_value(FieldType::Real, b".5\0").is_err());
    }

    #[test]
    fn unsigned_rejects_negative() {
        assert!(decode_value(FieldType::UInt32, b"-1\0").is_err());
        assert!(decode_value(FieldType::Int32, b"-1\0").is_ok());
    }

    #[test]
    fn decoder_rejects_malformed_utf8() {
        // Overlong encoding of '/'.
        let bad = [0xC0u8, 0xAF, 0x00];
        assert!(decode_value(FieldType::Text, &bad).is_err());

        // CESU-8 surrogate half.
        let bad = [0xEDu8, 0xA0, 0x80, 0x00];
        assert!(decode_value(FieldType::Char, &bad).is_err());
    }

    #[test]
    fn decoder_requires_terminator() {
        assert!(decode_value(FieldType::Int32, b"42").is_err());
    }

    #[test]
    fn bad_calendar_dates_are_rejected() {
        assert!(decode_value(FieldType::Date, b"2023/2/29\0").is_err());
        assert!(decode_value(FieldType::Date, b"2023/13/1\0").is_err());
        assert!(decode_value(FieldType::DateTime, b"2023/1/1 24:0:0\0").is_err());
    }
}
