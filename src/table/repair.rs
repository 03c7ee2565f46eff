//! # Table Repair
//!
//! Offline recovery for a persistent table that was not closed cleanly
//! (or whose files were damaged). Repair revalidates the header and
//! descriptors, re-bounds every container family, rebuilds the
//! row-removal tree and every secondary index from the surviving rows,
//! and validates every stored payload, nulling the ones that no longer
//! decode.
//!
//! ## Callback Protocol
//!
//! Every finding goes through the caller's callback:
//!
//! | severity      | meaning                                   | return |
//! |---------------|-------------------------------------------|--------|
//! | `Information` | progress note                             | ignored|
//! | `FixInfo`     | a value was nulled or trimmed             | ignored|
//! | `FixQuestion` | a destructive fix needs consent           | gates  |
//! | `Critical`    | the table cannot be repaired              | aborts |
//!
//! A refused `FixQuestion` or any `Critical` stops the pass with
//! `Ok(false)`; the table is left as far along as the last completed
//! step.
//!
//! ## Pass Structure
//!
//! 1. Header and descriptor normalization (offsets, null bits, row
//!    size), removal-tree metadata reset, heap size alignment, container
//!    family re-bounding.
//! 2. Full row walk: payload validation, index rebuild, all-null rows
//!    into the removal tree, heap storage check and free-list rebuild.
//! 3. Header rewrite with `MODIFIED` and `REPAIR_NEEDED` cleared.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use tracing::debug;

use super::descriptor::{valid_field_name, FieldDescriptor, Schema, DESCRIPTOR_SIZE};
use super::header::{TableHeader, TABLE_HEADER_SIZE, TABLE_MAGIC};
use super::table::{VarSlot, HEAP_SUFFIX, ROWS_SUFFIX};
use crate::btree::{BTree, BTreeKey, KeyLayout, NodeManager, NIL_NODE};
use crate::config::{DbSettings, RM_NODE_SIZE};
use crate::heap::{VariableHeap, ENTRY_RAW_SIZE};
use crate::storage::{share, Container, FileContainer};
use crate::types::serial::{validate_array_payload, validate_scalar, validate_text_payload};
use crate::types::serial;
use zerocopy::FromBytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Information,
    FixInfo,
    FixQuestion,
    Critical,
}

/// Decides whether a destructive step may proceed.
pub type FixCallback<'a> = &'a mut dyn FnMut(Severity, &str) -> bool;

fn suffixed(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Total byte size of the family rooted at `prefix`, probing unit files
/// without opening the container (the families under repair may violate
/// the size invariants the container would enforce).
fn family_size(prefix: &Path, unit_size: u64) -> u64 {
    let mut total = 0u64;
    let mut unit = 0usize;

    loop {
        let path = if unit == 0 {
            prefix.to_path_buf()
        } else {
            let mut name = prefix.as_os_str().to_os_string();
            name.push(unit.to_string());
            PathBuf::from(name)
        };

        match std::fs::metadata(&path) {
            Ok(meta) => total += meta.len().min(unit_size),
            Err(_) => return total,
        }
        unit += 1;
    }
}

/// Repairs the persistent table `<dir>/<name>`. Returns `Ok(false)` when
/// the pass was aborted by the callback or the damage is beyond repair.
pub fn repair_table(
    dir: &Path,
    name: &str,
    settings: &DbSettings,
    callback: FixCallback,
) -> Result<bool> {
    let prefix = dir.join(name);

    let Some((header, schema)) = normalize_header(&prefix, name, settings, callback)? else {
        return Ok(false);
    };

    rebuild_content(&prefix, name, header, schema, settings, callback)
}

/// Pass 1: bring the header and descriptor area back to a consistent
/// state, reset the removal-tree metadata, re-bound the table and heap
/// families.
fn normalize_header(
    prefix: &Path,
    name: &str,
    settings: &DbSettings,
    callback: FixCallback,
) -> Result<Option<(TableHeader, Schema)>> {
    let mut file = match std::fs::OpenOptions::new().read(true).write(true).open(prefix) {
        Ok(f) => f,
        Err(e) => {
            callback(
                Severity::Critical,
                &format!("table '{name}' cannot be repaired: cannot open its file: {e}"),
            );
            return Ok(None);
        }
    };

    let file_size = file.metadata().wrap_err("failed to stat table file")?.len();
    if file_size < TABLE_HEADER_SIZE as u64 {
        callback(
            Severity::Critical,
            &format!("table '{name}' cannot be repaired: its header file is too damaged"),
        );
        return Ok(None);
    }

    let mut raw = [0u8; TABLE_HEADER_SIZE];
    file.read_exact(&mut raw).wrap_err("failed to read header")?;

    if &raw[0..8] != TABLE_MAGIC {
        callback(
            Severity::Critical,
            &format!("table '{name}' cannot be repaired: cannot find the table file's signature"),
        );
        return Ok(None);
    }

    let mut header = TableHeader::parse(&raw)?;

    if header.fields_count == 0
        || header.fields_count > 0xFFFF
        || header.fields_count as usize * DESCRIPTOR_SIZE >= header.desc_size as usize
        || file_size < TABLE_HEADER_SIZE as u64 + header.desc_size as u64
    {
        callback(
            Severity::Critical,
            &format!("table '{name}' cannot be repaired: the field descriptors are too damaged"),
        );
        return Ok(None);
    }

    let mut desc = vec![0u8; header.desc_size as usize];
    file.read_exact(&mut desc)
        .wrap_err("failed to read descriptors")?;

    if !normalize_descriptors(name, &mut desc, header.fields_count as usize, callback)? {
        return Ok(None);
    }

    let schema = Schema::from_bytes(&desc, header.fields_count as usize)?;

    if schema.row_size() != header.row_size {
        let fix = callback(
            Severity::FixQuestion,
            &format!(
                "the row size of table '{name}' is set at {} bytes instead of {}",
                header.row_size,
                schema.row_size()
            ),
        );
        if !fix {
            return Ok(None);
        }
        header.row_size = schema.row_size();
    } else {
        callback(
            Severity::Information,
            &format!("the row size of table '{name}' is {} bytes long", header.row_size),
        );
    }

    // The recyclable-row structure is rebuilt from scratch; whatever the
    // header claims about it is unreliable.
    header.rm_root = NIL_NODE;
    header.rm_free_head = NIL_NODE;
    header.heap_size -= header.heap_size % ENTRY_RAW_SIZE as u64;
    header.max_unit_file_size = settings.max_unit_file_size;
    header.main_size = header.rm_base();

    file.seek(SeekFrom::Start(0)).wrap_err("seek failed")?;
    file.write_all(&header.serialize())
        .wrap_err("failed to rewrite header")?;
    file.write_all(&desc).wrap_err("failed to rewrite descriptors")?;
    drop(file);

    FileContainer::fix(prefix, settings.max_unit_file_size, header.main_size)?;
    FileContainer::fix(
        suffixed(prefix, HEAP_SUFFIX),
        settings.max_unit_file_size,
        header.heap_size,
    )?;

    Ok(Some((header, schema)))
}

/// Normalizes name offsets, null-bit indices, and row offsets inside the
/// raw descriptor area.
fn normalize_descriptors(
    name: &str,
    desc: &mut [u8],
    fields_count: usize,
    callback: FixCallback,
) -> Result<bool> {
    let mut name_offset = fields_count * DESCRIPTOR_SIZE;
    let mut row_offset = fields_count.div_ceil(8) as u32;

    for field in 0..fields_count {
        // Field names sit back to back after the descriptors; re-derive
        // each offset instead of trusting the stored one.
        if name_offset >= desc.len() {
            callback(
                Severity::Critical,
                &format!("table '{name}' cannot be repaired: its field descriptor is too damaged"),
            );
            return Ok(false);
        }

        let name_end = match desc[name_offset..].iter().position(|&b| b == 0) {
            Some(p) => name_offset + p,
            None => {
                callback(
                    Severity::Critical,
                    &format!("table '{name}' cannot be repaired: a field name is unterminated"),
                );
                return Ok(false);
            }
        };
        let field_name = String::from_utf8_lossy(&desc[name_offset..name_end]).into_owned();

        if !valid_field_name(&field_name) {
            callback(
                Severity::Critical,
                &format!("the restored name of field {field} is not a valid identifier"),
            );
            return Ok(false);
        }

        let at = field * DESCRIPTOR_SIZE;
        let descriptor = FieldDescriptor::mut_from_bytes(&mut desc[at..at + DESCRIPTOR_SIZE])
            .expect("descriptor slice has the exact size");

        let field_type = match descriptor.field_type() {
            Ok(ty) => ty,
            Err(_) => {
                callback(
                    Severity::Critical,
                    &format!("field '{field_name}' has an unknown type; cannot repair"),
                );
                return Ok(false);
            }
        };

        if descriptor.name_offset() as usize != name_offset {
            let fix = callback(
                Severity::FixQuestion,
                &format!("field {field} is damaged; its name should be '{field_name}'"),
            );
            if !fix {
                return Ok(false);
            }
            descriptor.set_name_offset(name_offset as u32);
        }

        if descriptor.null_bit() as usize != field {
            let fix = callback(
                Severity::FixQuestion,
                &format!("detected an invalid null bit index for field '{field_name}'"),
            );
            if !fix {
                return Ok(false);
            }
            descriptor.set_null_bit(field as u32);
        }

        if descriptor.row_offset() != row_offset {
            let fix = callback(
                Severity::FixQuestion,
                &format!(
                    "detected an invalid data offset for field '{field_name}'; it should be {row_offset}"
                ),
            );
            if !fix {
                return Ok(false);
            }
            descriptor.set_row_offset(row_offset);
        } else {
            callback(
                Severity::Information,
                &format!("field '{field_name}' data offset set at {row_offset}"),
            );
        }

        name_offset = name_end + 1;
        row_offset += field_type.fixed_size(descriptor.is_array()) as u32;
    }

    if name_offset != desc.len() {
        callback(
            Severity::Critical,
            &format!("table '{name}' cannot be repaired: the field descriptors are too damaged"),
        );
        return Ok(false);
    }

    Ok(true)
}

/// Pass 2 and 3: walk every row, validate payloads, rebuild indices and
/// the removal tree, conclude the heap check, rewrite the header clean.
fn rebuild_content(
    prefix: &Path,
    name: &str,
    mut header: TableHeader,
    mut schema: Schema,
    settings: &DbSettings,
    callback: FixCallback,
) -> Result<bool> {
    let unit_size = settings.max_unit_file_size;

    // Recreate one empty index per field that claims one.
    let mut index_mgrs: Vec<Option<NodeManager>> = Vec::with_capacity(schema.fields_count());
    for field in 0..schema.fields_count() {
        let desc = schema.descriptor(field);
        let kb = desc.index_node_kb();

        if kb == 0 || desc.index_units() == 0 || !kb.is_power_of_two() {
            let desc = schema.descriptor_mut(field);
            desc.set_index_node_kb(0);
            desc.set_index_units(0);
            index_mgrs.push(None);
            continue;
        }

        let field_name = schema.name(field).to_string();
        let index_path = suffixed(prefix, &format!("_{field_name}_bt"));
        FileContainer::fix(&index_path, unit_size, 0)?;

        let container = share(FileContainer::create(&index_path, unit_size)?);
        let mgr = NodeManager::create_index(
            container,
            kb as usize * 1024,
            schema.descriptor(field).field_type()?,
            settings.index_cache_budget,
        )?;
        index_mgrs.push(Some(mgr));
    }

    // Re-bound the rows family against the recorded row count.
    let rows_path = suffixed(prefix, ROWS_SUFFIX);
    let row_size = header.row_size as u64;
    let claimed = header.rows_count * row_size;
    let actual = family_size(&rows_path, unit_size);

    if actual != claimed {
        let fix = callback(
            Severity::FixQuestion,
            "the table's row data does not match the table header descriptions",
        );
        if !fix {
            return Ok(false);
        }

        header.rows_count = (actual / row_size).min(header.rows_count);
        callback(
            Severity::Information,
            &format!("set the table rows count at {}", header.rows_count),
        );
    } else {
        callback(
            Severity::Information,
            &format!("table '{name}' has {} row(s) allocated", header.rows_count),
        );
    }
    FileContainer::fix(&rows_path, unit_size, header.rows_count * row_size)?;

    let mut rows_data = FileContainer::open(
        &rows_path,
        unit_size,
        (header.rows_count * row_size).div_ceil(unit_size) as usize,
    )?;

    let heap = if schema.has_variable_fields() || header.heap_size > 0 {
        let heap = VariableHeap::open(suffixed(prefix, HEAP_SUFFIX), header.heap_size, settings)?;
        heap.prepare_storage_check();
        Some(heap)
    } else {
        None
    };

    let table_container = share(FileContainer::open(
        prefix,
        unit_size,
        header.main_size.div_ceil(unit_size) as usize,
    )?);
    let mut rm = NodeManager::new(
        table_container.clone(),
        header.rm_base(),
        RM_NODE_SIZE,
        KeyLayout::row_only(),
        NIL_NODE,
        NIL_NODE,
        16 * RM_NODE_SIZE,
    )?;

    let mut row_buf = vec![0u8; row_size as usize];
    for row in 0..header.rows_count {
        rows_data.read(row * row_size, &mut row_buf)?;

        let mut all_null = true;
        for field in 0..schema.fields_count() {
            let desc = schema.descriptor(field);
            let ty = desc.field_type()?;
            let is_array = desc.is_array();
            let bit = desc.null_bit() as usize;
            let at = desc.row_offset() as usize;
            let size = ty.fixed_size(is_array);
            let field_bytes = &row_buf[at..at + size];

            let mut is_null = row_buf[bit / 8] & (1 << (bit % 8)) != 0;

            if !is_null && ty.is_variable(is_array) {
                let ok = match VarSlot::decode(field_bytes) {
                    VarSlot::Inline { len } => {
                        len <= size - 1
                            && if is_array {
                                validate_array_payload(ty, &field_bytes[..len])
                            } else {
                                validate_text_payload(&field_bytes[..len])
                            }
                    }
                    VarSlot::Spilled { first_entry, size } => match &heap {
                        Some(heap) if is_array => heap.check_array_entry(first_entry, size, ty),
                        Some(heap) => heap.check_text_entry(first_entry, size),
                        None => false,
                    },
                };

                if !ok {
                    callback(
                        Severity::FixInfo,
                        &format!(
                            "detected an invalid value of field '{}' at row {row}; set to null",
                            schema.name(field)
                        ),
                    );
                    is_null = true;
                }
            } else if !is_null && !validate_scalar(ty, field_bytes) {
                callback(
                    Severity::FixInfo,
                    &format!(
                        "detected an invalid value of field '{}' at row {row}; set to null",
                        schema.name(field)
                    ),
                );
                is_null = true;
            }

            if !is_null {
                if let Some(mgr) = index_mgrs[field].as_mut() {
                    let value = serial::deserialize_scalar(ty, field_bytes)?;
                    BTree::new(mgr).insert_key(&BTreeKey::new(value, row))?;
                }
            }

            if is_null {
                row_buf[bit / 8] |= 1 << (bit % 8);
            }
            all_null &= is_null;
        }

        rows_data.write(row * row_size, &row_buf)?;

        if all_null {
            BTree::new(&mut rm).insert_key(&BTreeKey::row_only(row))?;
        }
    }

    if let Some(heap) = &heap {
        heap.conclude_storage_check()?;
        heap.flush()?;
        header.heap_size = heap.size();
    } else {
        header.heap_size = 0;
    }
    drop(heap);

    rows_data.flush()?;
    drop(rows_data);

    for field in 0..schema.fields_count() {
        if let Some(mut mgr) = index_mgrs[field].take() {
            mgr.flush()?;
            let units = mgr.raw_size().div_ceil(unit_size) as u32;
            schema.descriptor_mut(field).set_index_units(units.max(1));
        }
    }

    rm.flush()?;
    header.rm_root = rm.root_id();
    header.rm_free_head = rm.free_head();
    header.main_size = table_container.lock().size();
    header.flags = 0;

    let desc = schema.to_bytes();
    {
        let mut container = table_container.lock();
        container.write(0, &header.serialize())?;
        container.write(TABLE_HEADER_SIZE as u64, &desc)?;
        container.flush()?;
    }

    debug!(table = name, rows = header.rows_count, "table repaired");
    callback(
        Severity::Information,
        &format!("table '{name}' repaired: {} row(s) kept", header.rows_count),
    );

    Ok(true)
}
