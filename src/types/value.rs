//! # Runtime Values
//!
//! [`Value`] is the runtime representation handed across the table API.
//! Scalar carriers ([`Date`], [`DateTime`], [`HiresTime`], [`Real`],
//! [`RichReal`]) are plain ordered structs; reals are fixed-point scaled
//! integers so equality and ordering are exact.
//!
//! Nulls are first-class: `Value::Null` compares below every concrete
//! value, which is exactly the ordering secondary indexes use.

use std::cmp::Ordering;

use eyre::Result;

use super::{FieldType, REAL_PRECISION, RICHREAL_PRECISION};
use crate::error::{fail, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Date {
    pub year: i16,
    pub month: u8,
    pub day: u8,
}

impl Date {
    pub fn new(year: i16, month: u8, day: u8) -> Self {
        Self { year, month, day }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DateTime {
    pub year: i16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minutes: u8,
    pub seconds: u8,
}

impl DateTime {
    pub fn new(year: i16, month: u8, day: u8, hour: u8, minutes: u8, seconds: u8) -> Self {
        Self {
            year,
            month,
            day,
            hour,
            minutes,
            seconds,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct HiresTime {
    pub year: i16,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub microsec: u32,
}

impl HiresTime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        year: i16,
        month: u8,
        day: u8,
        hour: u8,
        minutes: u8,
        seconds: u8,
        microsec: u32,
    ) -> Self {
        Self {
            year,
            month,
            day,
            hour,
            minutes,
            seconds,
            microsec,
        }
    }
}

/// Fixed-point real: `units / 10^6`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Real {
    pub units: i64,
}

impl Real {
    pub fn from_units(units: i64) -> Self {
        Self { units }
    }

    pub fn from_parts(int_part: i64, frac_part: i64) -> Self {
        let frac = if int_part < 0 { -frac_part } else { frac_part };
        Self {
            units: int_part * REAL_PRECISION + frac,
        }
    }

    pub fn int_part(self) -> i64 {
        self.units / REAL_PRECISION
    }

    pub fn frac_part(self) -> i64 {
        (self.units % REAL_PRECISION).abs()
    }

    pub fn is_negative(self) -> bool {
        self.units < 0
    }
}

/// Fixed-point rich real: `units / 10^14`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RichReal {
    pub units: i128,
}

impl RichReal {
    pub fn from_units(units: i128) -> Self {
        Self { units }
    }

    pub fn from_parts(int_part: i64, frac_part: i128) -> Self {
        let frac = if int_part < 0 { -frac_part } else { frac_part };
        Self {
            units: int_part as i128 * RICHREAL_PRECISION + frac,
        }
    }

    pub fn int_part(self) -> i128 {
        self.units / RICHREAL_PRECISION
    }

    pub fn frac_part(self) -> i128 {
        (self.units % RICHREAL_PRECISION).abs()
    }

    pub fn is_negative(self) -> bool {
        self.units < 0
    }
}

/// An array value: a uniform run of non-null scalars.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayValue {
    elem_type: FieldType,
    items: Vec<Value>,
}

impl ArrayValue {
    pub fn new(elem_type: FieldType, items: Vec<Value>) -> Result<Self> {
        if elem_type == FieldType::Text {
            fail!(
                ErrorKind::FieldTypeInvalid,
                "arrays of text are not supported"
            );
        }
        for item in &items {
            if item.field_type() != Some(elem_type) {
                fail!(
                    ErrorKind::FieldTypeInvalid,
                    "array of {elem_type:?} cannot hold {item:?}"
                );
            }
        }
        Ok(Self { elem_type, items })
    }

    pub fn elem_type(&self) -> FieldType {
        self.elem_type
    }

    pub fn items(&self) -> &[Value] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Char(char),
    Date(Date),
    DateTime(DateTime),
    HiresTime(HiresTime),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Real(Real),
    RichReal(RichReal),
    Text(String),
    Array(ArrayValue),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The scalar type of this value, or `None` for null and arrays.
    pub fn field_type(&self) -> Option<FieldType> {
        use Value::*;

        Some(match self {
            Null | Array(_) => return None,
            Bool(_) => FieldType::Bool,
            Char(_) => FieldType::Char,
            Date(_) => FieldType::Date,
            DateTime(_) => FieldType::DateTime,
            HiresTime(_) => FieldType::HiresTime,
            Int8(_) => FieldType::Int8,
            Int16(_) => FieldType::Int16,
            Int32(_) => FieldType::Int32,
            Int64(_) => FieldType::Int64,
            UInt8(_) => FieldType::UInt8,
            UInt16(_) => FieldType::UInt16,
            UInt32(_) => FieldType::UInt32,
            UInt64(_) => FieldType::UInt64,
            Real(_) => FieldType::Real,
            RichReal(_) => FieldType::RichReal,
            Text(_) => FieldType::Text,
        })
    }

    /// Nulls-first ordering between same-typed scalars. Fails on type
    /// mismatch or on arrays, which have no ordering.
    pub fn cmp_scalar(&self, other: &Value) -> Result<Ordering> {
        use Value::*;

        Ok(match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Char(a), Char(b)) => a.cmp(b),
            (Date(a), Date(b)) => a.cmp(b),
            (DateTime(a), DateTime(b)) => a.cmp(b),
            (HiresTime(a), HiresTime(b)) => a.cmp(b),
            (Int8(a), Int8(b)) => a.cmp(b),
            (Int16(a), Int16(b)) => a.cmp(b),
            (Int32(a), Int32(b)) => a.cmp(b),
            (Int64(a), Int64(b)) => a.cmp(b),
            (UInt8(a), UInt8(b)) => a.cmp(b),
            (UInt16(a), UInt16(b)) => a.cmp(b),
            (UInt32(a), UInt32(b)) => a.cmp(b),
            (UInt64(a), UInt64(b)) => a.cmp(b),
            (Real(a), Real(b)) => a.cmp(b),
            (RichReal(a), RichReal(b)) => a.cmp(b),
            (Text(a), Text(b)) => a.cmp(b),
            (a, b) => fail!(
                ErrorKind::FieldTypeInvalid,
                "cannot order {a:?} against {b:?}"
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nulls_order_below_everything() {
        let v = Value::Int32(i32::MIN);

        assert_eq!(Value::Null.cmp_scalar(&v).unwrap(), Ordering::Less);
        assert_eq!(v.cmp_scalar(&Value::Null).unwrap(), Ordering::Greater);
        assert_eq!(Value::Null.cmp_scalar(&Value::Null).unwrap(), Ordering::Equal);
    }

    #[test]
    fn date_ordering_is_lexicographic_by_component() {
        let a = Date::new(2020, 5, 1);
        let b = Date::new(2020, 5, 2);
        let c = Date::new(2021, 1, 1);

        assert!(a < b);
        assert!(b < c);
        assert!(Date::new(-50, 12, 31) < Date::new(1, 1, 1));
    }

    #[test]
    fn real_parts_recompose() {
        let r = Real::from_parts(-3, 250_000);

        assert_eq!(r.int_part(), -3);
        assert_eq!(r.frac_part(), 250_000);
        assert!(r.is_negative());
        assert_eq!(r, Real::from_units(-3_250_000));
    }

    #[test]
    fn richreal_precision_is_fourteen_digits() {
        let r = RichReal::from_parts(1, 1);

        assert_eq!(r.units, RICHREAL_PRECISION + 1);
        assert_eq!(r.frac_part(), 1);
    }

    #[test]
    fn array_rejects_text_and_mixed_items() {
        assert!(ArrayValue::new(FieldType::Text, vec![]).is_err());
        assert!(ArrayValue::new(
            FieldType::Int8,
            vec![Value::Int8(1), Value::Int16(2)]
        )
        .is_err());

        let ok = ArrayValue::new(FieldType::Int8, vec![Value::Int8(1), Value::Int8(2)]).unwrap();
        assert_eq!(ok.len(), 2);
    }

    #[test]
    fn mismatched_scalar_comparison_fails() {
        let err = Value::Int8(1).cmp_scalar(&Value::Int16(1)).unwrap_err();

        assert_eq!(
            err.downcast_ref::<ErrorKind>(),
            Some(&ErrorKind::FieldTypeInvalid)
        );
    }
}
