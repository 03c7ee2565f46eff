//! # Field Descriptors
//!
//! The descriptor area of a table container holds one 24-byte record per
//! field, followed by the NUL-terminated field names, in declaration
//! order.
//!
//! ```text
//! Offset  Size  Description
//! 0       4     Name offset (from descriptor area start)
//! 4       4     Row data offset of the field's fixed portion
//! 8       4     Null-bit index
//! 12      2     Type id; bit 15 set = array
//! 14      2     Reserved
//! 16      4     Index node size in KiB (0 = not indexed)
//! 20      4     Index container unit count
//! ```
//!
//! A [`Schema`] is the parsed, validated in-RAM form: it owns the
//! descriptors, knows the row layout (null bits first, then each field's
//! fixed portion), and can re-serialize itself byte-identically.

use eyre::Result;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::error::{fail, ErrorKind};
use crate::types::FieldType;

pub const DESCRIPTOR_SIZE: usize = 24;

const ARRAY_TYPE_MASK: u16 = 0x8000;

/// A field as callers declare it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    pub is_array: bool,
}

impl FieldSpec {
    pub fn new<N: Into<String>>(name: N, field_type: FieldType, is_array: bool) -> Self {
        Self {
            name: name.into(),
            field_type,
            is_array,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FieldDescriptor {
    name_offset: U32,
    row_offset: U32,
    null_bit: U32,
    type_id: U16,
    reserved: U16,
    index_node_kb: U32,
    index_units: U32,
}

const _: () = assert!(std::mem::size_of::<FieldDescriptor>() == DESCRIPTOR_SIZE);

impl FieldDescriptor {
    pub fn name_offset(&self) -> u32 {
        self.name_offset.get()
    }

    pub fn set_name_offset(&mut self, off: u32) {
        self.name_offset.set(off);
    }

    pub fn row_offset(&self) -> u32 {
        self.row_offset.get()
    }

    pub fn set_row_offset(&mut self, off: u32) {
        self.row_offset.set(off);
    }

    pub fn null_bit(&self) -> u32 {
        self.null_bit.get()
    }

    pub fn set_null_bit(&mut self, bit: u32) {
        self.null_bit.set(bit);
    }

    pub fn field_type(&self) -> Result<FieldType> {
        FieldType::from_id(self.type_id.get() & !ARRAY_TYPE_MASK)
    }

    pub fn is_array(&self) -> bool {
        self.type_id.get() & ARRAY_TYPE_MASK != 0
    }

    pub fn set_type(&mut self, ty: FieldType, is_array: bool) {
        let id = ty.id() | if is_array { ARRAY_TYPE_MASK } else { 0 };
        self.type_id.set(id);
    }

    pub fn index_node_kb(&self) -> u32 {
        self.index_node_kb.get()
    }

    pub fn set_index_node_kb(&mut self, kb: u32) {
        self.index_node_kb.set(kb);
    }

    pub fn index_units(&self) -> u32 {
        self.index_units.get()
    }

    pub fn set_index_units(&mut self, units: u32) {
        self.index_units.set(units);
    }
}

/// True for a non-empty ASCII identifier of `[A-Za-z0-9_]`.
pub fn valid_field_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// The parsed descriptor area of one table.
#[derive(Debug, Clone)]
pub struct Schema {
    descriptors: Vec<FieldDescriptor>,
    names: Vec<String>,
    row_size: u32,
}

impl Schema {
    /// Validates the declared fields and lays out the row: null bits
    /// first (one per field), then each field's fixed portion in
    /// declaration order.
    pub fn build(fields: &[FieldSpec]) -> Result<Self> {
        if fields.is_empty() || fields.len() > 0xFFFF {
            fail!(
                ErrorKind::InvalidParameters,
                "cannot create a table with {} fields",
                fields.len()
            );
        }

        for (i, field) in fields.iter().enumerate() {
            if !valid_field_name(&field.name) {
                fail!(
                    ErrorKind::FieldNameInvalid,
                    "cannot use '{}' as a field name",
                    field.name
                );
            }
            if field.is_array && field.field_type == FieldType::Text {
                fail!(
                    ErrorKind::FieldTypeInvalid,
                    "field '{}': arrays of text are not supported",
                    field.name
                );
            }
            for later in &fields[i + 1..] {
                if later.name == field.name {
                    fail!(
                        ErrorKind::FieldNameDuplicated,
                        "field name '{}' is duplicated",
                        field.name
                    );
                }
            }
        }

        let mut name_offset = (fields.len() * DESCRIPTOR_SIZE) as u32;
        let mut row_offset = fields.len().div_ceil(8) as u32;
        let mut descriptors = Vec::with_capacity(fields.len());
        let mut names = Vec::with_capacity(fields.len());

        for (i, field) in fields.iter().enumerate() {
            let mut desc = FieldDescriptor::new_zeroed();
            desc.set_name_offset(name_offset);
            desc.set_row_offset(row_offset);
            desc.set_null_bit(i as u32);
            desc.set_type(field.field_type, field.is_array);

            name_offset += field.name.len() as u32 + 1;
            row_offset += field.field_type.fixed_size(field.is_array) as u32;

            descriptors.push(desc);
            names.push(field.name.clone());
        }

        Ok(Self {
            descriptors,
            names,
            row_size: row_offset,
        })
    }

    /// Parses a descriptor area read back from a table container.
    pub fn from_bytes(raw: &[u8], fields_count: usize) -> Result<Self> {
        if fields_count == 0 || raw.len() < fields_count * DESCRIPTOR_SIZE {
            fail!(
                ErrorKind::TableInvalid,
                "descriptor area of {} bytes cannot hold {fields_count} fields",
                raw.len()
            );
        }

        let mut descriptors = Vec::with_capacity(fields_count);
        let mut names = Vec::with_capacity(fields_count);
        let mut row_size = fields_count.div_ceil(8) as u32;

        for i in 0..fields_count {
            let at = i * DESCRIPTOR_SIZE;
            let desc =
                FieldDescriptor::read_from_bytes(&raw[at..at + DESCRIPTOR_SIZE]).map_err(|_| {
                    eyre::Report::new(ErrorKind::TableInvalid).wrap_err("short descriptor")
                })?;

            let name_at = desc.name_offset() as usize;
            if name_at >= raw.len() {
                fail!(
                    ErrorKind::TableInvalid,
                    "field {i} name offset {name_at} is outside the descriptor area"
                );
            }
            let name_end = raw[name_at..]
                .iter()
                .position(|&b| b == 0)
                .map(|p| name_at + p)
                .ok_or_else(|| {
                    eyre::Report::new(ErrorKind::TableInvalid)
                        .wrap_err(format!("field {i} name is not NUL-terminated"))
                })?;

            let name = std::str::from_utf8(&raw[name_at..name_end])
                .map_err(|_| eyre::Report::new(ErrorKind::FieldNameInvalid))?;
            if !valid_field_name(name) {
                fail!(ErrorKind::FieldNameInvalid, "stored field name '{name}' is invalid");
            }

            row_size += desc.field_type()?.fixed_size(desc.is_array()) as u32;

            descriptors.push(desc);
            names.push(name.to_string());
        }

        Ok(Self {
            descriptors,
            names,
            row_size,
        })
    }

    /// Serializes descriptors followed by names.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_len());

        for desc in &self.descriptors {
            out.extend_from_slice(desc.as_bytes());
        }
        for name in &self.names {
            out.extend_from_slice(name.as_bytes());
            out.push(0);
        }
        out
    }

    pub fn serialized_len(&self) -> usize {
        self.descriptors.len() * DESCRIPTOR_SIZE
            + self.names.iter().map(|n| n.len() + 1).sum::<usize>()
    }

    pub fn fields_count(&self) -> usize {
        self.descriptors.len()
    }

    /// Bytes reserved at the start of each row for null bits.
    pub fn null_bits_size(&self) -> usize {
        self.fields_count().div_ceil(8)
    }

    pub fn row_size(&self) -> u32 {
        self.row_size
    }

    pub fn descriptor(&self, field: usize) -> &FieldDescriptor {
        &self.descriptors[field]
    }

    pub fn descriptor_mut(&mut self, field: usize) -> &mut FieldDescriptor {
        &mut self.descriptors[field]
    }

    pub fn name(&self, field: usize) -> &str {
        &self.names[field]
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn field_spec(&self, field: usize) -> Result<FieldSpec> {
        let desc = self.descriptor(field);
        Ok(FieldSpec::new(
            self.name(field),
            desc.field_type()?,
            desc.is_array(),
        ))
    }

    /// True when some field stores through the variable-size heap.
    pub fn has_variable_fields(&self) -> bool {
        self.descriptors
            .iter()
            .any(|d| d.is_array() || d.field_type().is_ok_and(|t| t == FieldType::Text))
    }
}
