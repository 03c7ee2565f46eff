//! # Field Types and Values
//!
//! The engine stores a closed set of scalar types plus arrays of any
//! scalar except `Text`. Every type has a fixed serialized size, so a
//! row's layout is fully determined by its field types.
//!
//! ## Type Table
//!
//! | Type      | id | fixed size | notes                               |
//! |-----------|----|------------|-------------------------------------|
//! | Bool      |  1 | 1          | 0 or 1                              |
//! | Char      |  2 | 4          | UTF-32 code point, non-zero         |
//! | Date      |  3 | 4          | year i16, month u8, day u8          |
//! | DateTime  |  4 | 7          | + hour, minutes, seconds            |
//! | HiresTime |  5 | 11         | + microseconds u32                  |
//! | Int8..64  | 6-9| 1/2/4/8    | little-endian two's complement      |
//! | UInt8..64 |10-13| 1/2/4/8   |                                     |
//! | Real      | 14 | 8          | i64 scaled by 10^6                  |
//! | RichReal  | 15 | 16         | i128 scaled by 10^14                |
//! | Text      | 16 | 16 (slot)  | inline or heap reference            |
//! | array     |  - | 16 (slot)  | inline or heap reference            |
//!
//! Text and array fields occupy a 16-byte slot in the row: either an
//! inline short value (at most 15 payload bytes, byte 15 = `0x80 | len`)
//! or a `(first_entry, size)` pair pointing into the variable-size heap.
//!
//! ## Modules
//!
//! - [`value`]: runtime [`Value`] enum and the scalar carrier structs
//! - [`serial`]: fixed-slot serialization, validation, raw comparison
//! - [`wire`]: NUL-terminated UTF-8 wire forms for client round-trips

pub mod serial;
pub mod value;
pub mod wire;

pub use value::{ArrayValue, Date, DateTime, HiresTime, Real, RichReal, Value};

use eyre::Result;

use crate::error::{fail, ErrorKind};

/// Decimal scale of [`Real`] values.
pub const REAL_PRECISION: i64 = 1_000_000;
/// Decimal scale of [`RichReal`] values.
pub const RICHREAL_PRECISION: i128 = 100_000_000_000_000;

/// Byte size of a text or array row slot.
pub const VAR_SLOT_SIZE: usize = 16;
/// Largest payload stored inline in a variable slot.
pub const VAR_INLINE_MAX: usize = VAR_SLOT_SIZE - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FieldType {
    Bool = 1,
    Char = 2,
    Date = 3,
    DateTime = 4,
    HiresTime = 5,
    Int8 = 6,
    Int16 = 7,
    Int32 = 8,
    Int64 = 9,
    UInt8 = 10,
    UInt16 = 11,
    UInt32 = 12,
    UInt64 = 13,
    Real = 14,
    RichReal = 15,
    Text = 16,
}

impl FieldType {
    pub fn from_id(id: u16) -> Result<Self> {
        use FieldType::*;

        Ok(match id {
            1 => Bool,
            2 => Char,
            3 => Date,
            4 => DateTime,
            5 => HiresTime,
            6 => Int8,
            7 => Int16,
            8 => Int32,
            9 => Int64,
            10 => UInt8,
            11 => UInt16,
            12 => UInt32,
            13 => UInt64,
            14 => Real,
            15 => RichReal,
            16 => Text,
            _ => fail!(ErrorKind::FieldTypeInvalid, "unknown field type id {id:#x}"),
        })
    }

    pub fn id(self) -> u16 {
        self as u16
    }

    /// Serialized size of one scalar of this type.
    pub fn scalar_size(self) -> usize {
        use FieldType::*;

        match self {
            Bool | Int8 | UInt8 => 1,
            Int16 | UInt16 => 2,
            Char | Int32 | UInt32 => 4,
            Date => 4,
            DateTime => 7,
            Int64 | UInt64 | Real => 8,
            HiresTime => 11,
            RichReal => 16,
            Text => VAR_SLOT_SIZE,
        }
    }

    /// Size of the fixed row portion of a field of this type.
    pub fn fixed_size(self, is_array: bool) -> usize {
        if is_array {
            VAR_SLOT_SIZE
        } else {
            self.scalar_size()
        }
    }

    /// True for types whose values live (partly) in the variable heap.
    pub fn is_variable(self, is_array: bool) -> bool {
        is_array || self == FieldType::Text
    }

    /// True for types a secondary index can be built over.
    pub fn is_indexable(self, is_array: bool) -> bool {
        !self.is_variable(is_array)
    }
}
