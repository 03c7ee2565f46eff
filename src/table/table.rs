//! # Table
//!
//! A [`Table`] is a row store built from the engine's lower layers:
//!
//! - the **table container** (`<name>`): header, field descriptors, and
//!   the row-removal B-tree nodes;
//! - the **rows container** (`<name>_f`): fixed-width row slots, served
//!   through a block cache;
//! - the **variable-size heap** (`<name>_v`): text and array payloads,
//!   shared by every variable-typed field;
//! - one optional **field index** (`<name>_<field>_bt`) per scalar field.
//!
//! Temporal tables use the same layout over temporal containers and
//! disappear with the process; spawning a table yields a temporal
//! sibling with the same schema and no shared storage.
//!
//! ## Row Layout
//!
//! `[null bits | field 0 fixed | field 1 fixed | ...]`: bit *i* set means
//! field *i* is null (stale value bytes are left in place; the bit
//! dominates). Text and array fields store either a short inline value
//! or a `(first_entry, size)` heap reference in their 16-byte slot.
//!
//! ## Index Discipline
//!
//! A secondary index holds one key per row whose field is non-null.
//! `set` swaps the old key for the new one; assigning null only sets
//! the row's null bit and returns, leaving the stale value bytes (and
//! any index entry they fed) in place. The null bit dominates on every
//! read, and repair rebuilds each index from the surviving non-null
//! values. [`Table::mark_row_for_reuse`] nullifies properly: it removes
//! the index keys and releases the heap records before recording the
//! row in the removal tree.
//!
//! ## Locking
//!
//! Lock order is `meta → field index → row cache → heap`; every path
//! takes a prefix of that chain, with the inner locks taken one at a
//! time wherever possible.
//!
//! ## Persistence State Machine
//!
//! Opening a persistent table requires the header's `MODIFIED` flag to
//! be clear and immediately persists it set; a successful [`Table::flush`]
//! rewrites the header with the flag clear. A crash therefore leaves the
//! flag set and the next open fails with `TableInUse` until repair runs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use tracing::{debug, warn};

use super::descriptor::{FieldSpec, Schema};
use super::header::{TableHeader, FLAG_MODIFIED, TABLE_HEADER_SIZE};
use crate::btree::{BTree, BTreeKey, KeyLayout, NodeManager, NIL_NODE};
use crate::config::{DbSettings, RM_NODE_SIZE};
use crate::error::{fail, ErrorKind};
use crate::heap::VariableHeap;
use crate::storage::{
    container_cache, share, BlockCache, Container, ContainerStore, FileContainer, SharedContainer,
    TemporalContainer,
};
use crate::types::serial::{
    deserialize_array, deserialize_scalar, serialize_array, serialize_scalar,
};
use crate::types::{FieldType, Value, VAR_INLINE_MAX, VAR_SLOT_SIZE};

pub const ROWS_SUFFIX: &str = "_f";
pub const HEAP_SUFFIX: &str = "_v";
pub const INDEX_SUFFIX: &str = "_bt";

/// Cache budget for the row-removal tree's nodes.
const RM_CACHE_BUDGET: usize = 16 * RM_NODE_SIZE;

struct TableMeta {
    table_container: SharedContainer,
    rm: NodeManager,
    rows_count: u64,
    modified_on_disk: bool,
    removed: bool,
}

pub struct Table {
    name: String,
    settings: DbSettings,
    prefix: Option<PathBuf>,
    schema: RwLock<Schema>,
    meta: Mutex<TableMeta>,
    indexes: Vec<Mutex<Option<NodeManager>>>,
    row_cache: Mutex<BlockCache<ContainerStore>>,
    heap: Option<Arc<VariableHeap>>,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table").field("name", &self.name).finish()
    }
}

fn suffixed(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn index_prefix(prefix: &Path, field_name: &str) -> PathBuf {
    suffixed(prefix, &format!("_{field_name}{INDEX_SUFFIX}"))
}

/// Opens a striped family that may legitimately not exist yet (a table
/// that never grew the component).
fn open_or_create_family(prefix: &Path, unit_size: u64, content: u64) -> Result<FileContainer> {
    let units = content.div_ceil(unit_size) as usize;
    if units == 0 && !prefix.exists() {
        FileContainer::create(prefix, unit_size)
    } else {
        FileContainer::open(prefix, unit_size, units.max(1))
    }
}

impl Table {
    /// Creates the on-disk layout of a fresh persistent table and opens
    /// it.
    pub fn create_persistent(
        prefix: &Path,
        name: &str,
        fields: &[FieldSpec],
        settings: &DbSettings,
    ) -> Result<Self> {
        let schema = Schema::build(fields)?;
        let desc = schema.to_bytes();

        let mut header = TableHeader::new(
            schema.fields_count() as u32,
            desc.len() as u32,
            schema.row_size(),
            settings.max_unit_file_size,
        );
        header.main_size = header.rm_base();

        {
            let mut container = FileContainer::create(prefix, settings.max_unit_file_size)
                .wrap_err_with(|| format!("failed to create table '{name}'"))?;
            container.write(0, &header.serialize())?;
            container.write(TABLE_HEADER_SIZE as u64, &desc)?;

            let pad = header.main_size - container.size();
            container.write(container.size(), &vec![0u8; pad as usize])?;
            container.flush()?;
        }

        debug!(table = name, "created persistent table");
        Self::open_persistent(prefix, name, settings)
    }

    /// Opens an existing persistent table. The header must be clean; the
    /// `MODIFIED` flag is persisted set before this returns.
    pub fn open_persistent(prefix: &Path, name: &str, settings: &DbSettings) -> Result<Self> {
        use std::io::Read;

        let mut file = std::fs::File::open(prefix)
            .wrap_err_with(|| format!("failed to open table file '{}'", prefix.display()))?;

        let mut raw = [0u8; TABLE_HEADER_SIZE];
        file.read_exact(&mut raw)
            .wrap_err_with(|| format!("table file '{}' is too short", prefix.display()))?;
        let header = TableHeader::parse(&raw)?;

        if header.fields_count == 0
            || (header.desc_size as usize)
                < header.fields_count as usize * super::descriptor::DESCRIPTOR_SIZE
            || header.main_size < TABLE_HEADER_SIZE as u64
        {
            fail!(
                ErrorKind::TableInvalid,
                "table '{name}' has an impossible header"
            );
        }
        if header.flags & FLAG_MODIFIED != 0 {
            fail!(
                ErrorKind::TableInUse,
                "table '{name}' is already in use or was not closed properly"
            );
        }
        if header.max_unit_file_size != settings.max_unit_file_size {
            fail!(
                ErrorKind::TableInconsistency,
                "table '{name}' uses a max file size of {} but the database is set to {}",
                header.max_unit_file_size,
                settings.max_unit_file_size
            );
        }

        let mut desc_raw = vec![0u8; header.desc_size as usize];
        file.read_exact(&mut desc_raw)
            .wrap_err_with(|| format!("table '{name}' descriptor area is truncated"))?;
        drop(file);

        let schema = Schema::from_bytes(&desc_raw, header.fields_count as usize)?;
        if schema.row_size() != header.row_size {
            fail!(
                ErrorKind::TableInvalid,
                "table '{name}' declares a row size of {} but its fields need {}",
                header.row_size,
                schema.row_size()
            );
        }

        let unit_size = settings.max_unit_file_size;
        let table_container = share(FileContainer::open(
            prefix,
            unit_size,
            header.main_size.div_ceil(unit_size) as usize,
        )?);

        let rows_container = share(open_or_create_family(
            &suffixed(prefix, ROWS_SUFFIX),
            unit_size,
            header.rows_count * header.row_size as u64,
        )?);

        let heap = if schema.has_variable_fields() {
            Some(Arc::new(VariableHeap::open(
                suffixed(prefix, HEAP_SUFFIX),
                header.heap_size,
                settings,
            )?))
        } else {
            None
        };

        let mut indexes = Vec::with_capacity(schema.fields_count());
        for field in 0..schema.fields_count() {
            let desc = schema.descriptor(field);
            if desc.index_node_kb() == 0 {
                indexes.push(Mutex::new(None));
                continue;
            }

            let container = share(FileContainer::open(
                index_prefix(prefix, schema.name(field)),
                unit_size,
                desc.index_units() as usize,
            )?);
            let mgr = NodeManager::open_index(
                container,
                desc.field_type()?,
                settings.index_cache_budget,
            )?;
            indexes.push(Mutex::new(Some(mgr)));
        }

        let rm = NodeManager::new(
            table_container.clone(),
            header.rm_base(),
            RM_NODE_SIZE,
            KeyLayout::row_only(),
            header.rm_root,
            header.rm_free_head,
            RM_CACHE_BUDGET,
        )?;

        let mut row_cache = container_cache(
            rows_container,
            header.row_size as usize,
            settings.row_cache_block_size,
            settings.row_cache_block_count,
            false,
        )?;
        row_cache.set_item_limit(header.rows_count);

        // Claim the table: a second open (or a crash) now surfaces as
        // TableInUse until flush or repair clears the flag.
        table_container
            .lock()
            .write(60, &FLAG_MODIFIED.to_le_bytes())?;

        debug!(table = name, rows = header.rows_count, "opened persistent table");

        Ok(Self {
            name: name.to_string(),
            settings: settings.clone(),
            prefix: Some(prefix.to_path_buf()),
            schema: RwLock::new(schema),
            meta: Mutex::new(TableMeta {
                table_container,
                rm,
                rows_count: header.rows_count,
                modified_on_disk: true,
                removed: false,
            }),
            indexes,
            row_cache: Mutex::new(row_cache),
            heap,
        })
    }

    /// Creates a RAM-first table that lives only for the process.
    pub fn create_temporal(name: &str, fields: &[FieldSpec], settings: &DbSettings) -> Result<Self> {
        let schema = Schema::build(fields)?;

        let table_container = share(TemporalContainer::new(settings));
        let rows_container = share(TemporalContainer::new(settings));

        let heap = if schema.has_variable_fields() {
            Some(Arc::new(VariableHeap::create_temporal(settings)?))
        } else {
            None
        };

        let rm = NodeManager::new(
            table_container.clone(),
            0,
            RM_NODE_SIZE,
            KeyLayout::row_only(),
            NIL_NODE,
            NIL_NODE,
            RM_CACHE_BUDGET,
        )?;

        let row_cache = container_cache(
            rows_container,
            schema.row_size() as usize,
            settings.row_cache_block_size,
            settings.row_cache_block_count,
            true,
        )?;

        let indexes = (0..schema.fields_count()).map(|_| Mutex::new(None)).collect();

        Ok(Self {
            name: name.to_string(),
            settings: settings.clone(),
            prefix: None,
            schema: RwLock::new(schema),
            meta: Mutex::new(TableMeta {
                table_container,
                rm,
                rows_count: 0,
                modified_on_disk: false,
                removed: false,
            }),
            indexes,
            row_cache: Mutex::new(row_cache),
            heap,
        })
    }

    /// A temporal sibling with this table's schema and fresh storage.
    pub fn spawn(&self) -> Result<Table> {
        let schema = self.schema.read();
        let fields: Vec<FieldSpec> = (0..schema.fields_count())
            .map(|i| schema.field_spec(i))
            .collect::<Result<_>>()?;
        drop(schema);

        Table::create_temporal(&format!("{}_spawn", self.name), &fields, &self.settings)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_temporal(&self) -> bool {
        self.prefix.is_none()
    }

    pub fn fields_count(&self) -> usize {
        self.schema.read().fields_count()
    }

    pub fn describe_field(&self, field: usize) -> Result<FieldSpec> {
        let schema = self.schema.read();
        self.check_field(&schema, field)?;
        schema.field_spec(field)
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.schema.read().field_index(name)
    }

    pub fn is_field_indexed(&self, field: usize) -> bool {
        self.indexes
            .get(field)
            .is_some_and(|slot| slot.lock().is_some())
    }

    pub fn rows_count(&self) -> u64 {
        self.meta.lock().rows_count
    }

    fn check_field(&self, schema: &Schema, field: usize) -> Result<()> {
        if field >= schema.fields_count() {
            fail!(
                ErrorKind::InvalidParameters,
                "table '{}' has no field {field}",
                self.name
            );
        }
        Ok(())
    }

    fn check_row(&self, row: u64) -> Result<()> {
        let rows = self.rows_count();
        if row >= rows {
            fail!(
                ErrorKind::InvalidParameters,
                "row {row} outside table '{}' ({rows} rows)",
                self.name
            );
        }
        Ok(())
    }

    /// `(type, is_array, slot offset, null bit, slot size)` of a field.
    fn field_layout(&self, field: usize) -> Result<(FieldType, bool, usize, usize, usize)> {
        let schema = self.schema.read();
        self.check_field(&schema, field)?;
        let desc = schema.descriptor(field);
        let ty = desc.field_type()?;
        Ok((
            ty,
            desc.is_array(),
            desc.row_offset() as usize,
            desc.null_bit() as usize,
            ty.fixed_size(desc.is_array()),
        ))
    }

    /// Re-arms the on-disk MODIFIED flag after a flush cleared it.
    fn touch_modified(&self) -> Result<()> {
        if self.prefix.is_none() {
            return Ok(());
        }

        let mut meta = self.meta.lock();
        if !meta.modified_on_disk && !meta.removed {
            meta.table_container
                .lock()
                .write(60, &FLAG_MODIFIED.to_le_bytes())?;
            meta.modified_on_disk = true;
        }
        Ok(())
    }

    /// Allocates a row: the smallest tombstone when one exists, a fresh
    /// all-null slot otherwise.
    pub fn add_row(&self) -> Result<u64> {
        self.touch_modified()?;

        let mut meta = self.meta.lock();

        if let Some(key) = BTree::new(&mut meta.rm).pop_smallest()? {
            return Ok(key.row);
        }

        let row = meta.rows_count;
        meta.rows_count += 1;

        let schema = self.schema.read();
        let blank = blank_row(&schema);
        drop(schema);

        {
            let mut cache = self.row_cache.lock();
            cache.set_item_limit(meta.rows_count);
            cache.write_item(row, &blank)?;
        }

        Ok(row)
    }

    /// Nullifies every field of `row` (removing index keys and releasing
    /// heap records) and records it as reusable.
    pub fn mark_row_for_reuse(&self, row: u64) -> Result<()> {
        self.check_row(row)?;
        self.touch_modified()?;

        for field in 0..self.fields_count() {
            let (ty, is_array, slot_offset, null_bit, slot_size) = self.field_layout(field)?;

            let (was_null, old_slot) = {
                let mut cache = self.row_cache.lock();
                let item = cache.retrieve(row)?;
                let null = item[null_bit / 8] & (1 << (null_bit % 8)) != 0;
                let slot: SmallVec<[u8; VAR_SLOT_SIZE]> =
                    SmallVec::from_slice(&item[slot_offset..slot_offset + slot_size]);
                (null, slot)
            };
            if was_null {
                continue;
            }

            if self.is_field_indexed(field) {
                let old_value = deserialize_scalar(ty, &old_slot)?;
                let mut slot = self.indexes[field].lock();
                if let Some(mgr) = slot.as_mut() {
                    BTree::new(mgr).remove_key(&BTreeKey::new(old_value, row))?;
                }
            }

            if ty.is_variable(is_array) {
                if let VarSlot::Spilled { first_entry, .. } = VarSlot::decode(&old_slot) {
                    self.heap_ref()?.decref(first_entry)?;
                }
            }

            let mut cache = self.row_cache.lock();
            let mut item = cache.retrieve(row)?;
            item[null_bit / 8] |= 1 << (null_bit % 8);
        }

        let mut meta = self.meta.lock();
        BTree::new(&mut meta.rm).insert_key(&BTreeKey::row_only(row))?;
        Ok(())
    }

    /// Writes one field of one row. Assigning null only sets the null
    /// bit and returns; the stale slot bytes are left behind.
    pub fn set(&self, row: u64, field: usize, value: &Value) -> Result<()> {
        self.check_row(row)?;
        let (ty, is_array, slot_offset, null_bit, slot_size) = self.field_layout(field)?;

        match value {
            Value::Null => {}
            Value::Array(a) => {
                if !is_array || a.elem_type() != ty {
                    fail!(
                        ErrorKind::FieldTypeInvalid,
                        "field '{}' cannot hold {value:?}",
                        self.field_name(field)
                    );
                }
            }
            v => {
                if is_array || v.field_type() != Some(ty) {
                    fail!(
                        ErrorKind::FieldTypeInvalid,
                        "field '{}' cannot hold {value:?}",
                        self.field_name(field)
                    );
                }
            }
        }

        self.touch_modified()?;

        if value.is_null() {
            let mut cache = self.row_cache.lock();
            let mut item = cache.retrieve(row)?;
            item[null_bit / 8] |= 1 << (null_bit % 8);
            return Ok(());
        }

        // Snapshot the current slot under the row-cache lock.
        let (old_null, old_slot) = {
            let mut cache = self.row_cache.lock();
            let item = cache.retrieve(row)?;
            let null = item[null_bit / 8] & (1 << (null_bit % 8)) != 0;
            let slot: SmallVec<[u8; VAR_SLOT_SIZE]> =
                SmallVec::from_slice(&item[slot_offset..slot_offset + slot_size]);
            (null, slot)
        };

        // Swap out the old index key before the row changes. A null
        // field has no key to remove.
        let indexed = self.is_field_indexed(field);
        if indexed && !old_null {
            let old_value = deserialize_scalar(ty, &old_slot)?;
            let mut slot = self.indexes[field].lock();
            if let Some(mgr) = slot.as_mut() {
                BTree::new(mgr).remove_key(&BTreeKey::new(old_value, row))?;
            }
        }

        // Release the old heap record, if the slot held one.
        if ty.is_variable(is_array) && !old_null {
            if let VarSlot::Spilled { first_entry, .. } = VarSlot::decode(&old_slot) {
                self.heap_ref()?.decref(first_entry)?;
            }
        }

        // Build the new slot bytes.
        let mut new_slot = [0u8; VAR_SLOT_SIZE];
        match value {
            Value::Text(text) => {
                self.encode_variable(text.as_bytes(), &mut new_slot)?;
            }
            Value::Array(array) => {
                let payload = serialize_array(array)?;
                self.encode_variable(&payload, &mut new_slot)?;
            }
            scalar => serialize_scalar(scalar, &mut new_slot[..slot_size])?,
        }

        {
            let mut cache = self.row_cache.lock();
            let mut item = cache.retrieve(row)?;
            let bytes = &mut *item;
            bytes[null_bit / 8] &= !(1 << (null_bit % 8));
            bytes[slot_offset..slot_offset + slot_size].copy_from_slice(&new_slot[..slot_size]);
        }

        if indexed {
            let mut slot = self.indexes[field].lock();
            if let Some(mgr) = slot.as_mut() {
                BTree::new(mgr).insert_key(&BTreeKey::new(value.clone(), row))?;
            }
        }

        Ok(())
    }

    /// Reads one field of one row.
    pub fn get(&self, row: u64, field: usize) -> Result<Value> {
        self.check_row(row)?;
        let (ty, is_array, slot_offset, null_bit, slot_size) = self.field_layout(field)?;

        let slot: SmallVec<[u8; VAR_SLOT_SIZE]> = {
            let mut cache = self.row_cache.lock();
            let item = cache.retrieve(row)?;
            if item[null_bit / 8] & (1 << (null_bit % 8)) != 0 {
                return Ok(Value::Null);
            }
            SmallVec::from_slice(&item[slot_offset..slot_offset + slot_size])
        };

        if !ty.is_variable(is_array) {
            return deserialize_scalar(ty, &slot);
        }

        let payload = match VarSlot::decode(&slot) {
            VarSlot::Inline { len } => slot[..len].to_vec(),
            VarSlot::Spilled { first_entry, size } => {
                let mut payload = vec![0u8; size as usize];
                self.heap_ref()?.read_record(first_entry, 0, &mut payload)?;
                payload
            }
        };

        if is_array {
            Ok(Value::Array(deserialize_array(ty, &payload)?))
        } else {
            let text = String::from_utf8(payload).map_err(|e| {
                eyre::Report::new(ErrorKind::InvalidUnicodeChar)
                    .wrap_err(format!("stored text of row {row} is not UTF-8: {e}"))
            })?;
            Ok(Value::Text(text))
        }
    }

    /// Row indices whose `field` value lies in `[lo, hi]`, restricted to
    /// rows `[start_row, end_row]`. Serves from the field's index when
    /// one exists and the range starts at a concrete value, else scans.
    pub fn match_rows(
        &self,
        lo: &Value,
        hi: &Value,
        start_row: u64,
        end_row: u64,
        field: usize,
    ) -> Result<Vec<u64>> {
        {
            let schema = self.schema.read();
            self.check_field(&schema, field)?;
        }

        let rows = self.rows_count();
        if rows == 0 || start_row > end_row {
            return Ok(Vec::new());
        }
        let end_row = end_row.min(rows - 1);

        // Indexes carry no keys for null fields, so a range that starts
        // at null must scan.
        if !lo.is_null() {
            let mut slot = self.indexes[field].lock();
            if let Some(mgr) = slot.as_mut() {
                let lo_key = BTreeKey::new(lo.clone(), 0);
                let hi_key = BTreeKey::new(hi.clone(), u64::MAX);
                let hits = BTree::new(mgr).range_rows(&lo_key, &hi_key)?;
                return Ok(hits
                    .into_iter()
                    .filter(|&r| r >= start_row && r <= end_row)
                    .collect());
            }
        }

        let mut hits = Vec::new();
        for row in start_row..=end_row {
            let value = self.get(row, field)?;
            let ge_lo = lo.cmp_scalar(&value)? != std::cmp::Ordering::Greater;
            let le_hi = value.cmp_scalar(hi)? != std::cmp::Ordering::Greater;
            if ge_lo && le_hi {
                hits.push(row);
            }
        }
        Ok(hits)
    }

    /// Builds a secondary index over `field`. `node_kb` is the node size
    /// in KiB (a power of two). `progress` is invoked per row.
    pub fn create_index(
        &self,
        field: usize,
        node_kb: u32,
        mut progress: Option<&mut dyn FnMut(u64, u64)>,
    ) -> Result<()> {
        let (ty, field_name) = {
            let schema = self.schema.read();
            self.check_field(&schema, field)?;
            let desc = schema.descriptor(field);
            let ty = desc.field_type()?;
            if !ty.is_indexable(desc.is_array()) {
                fail!(
                    ErrorKind::FieldTypeInvalid,
                    "field '{}' of type {ty:?} cannot be indexed",
                    schema.name(field)
                );
            }
            (ty, schema.name(field).to_string())
        };

        if node_kb == 0 || !node_kb.is_power_of_two() {
            fail!(
                ErrorKind::InvalidParameters,
                "index node size of {node_kb} KiB is not a power of two"
            );
        }

        self.touch_modified()?;

        let mut slot = self.indexes[field].lock();
        if slot.is_some() {
            fail!(
                ErrorKind::InvalidParameters,
                "field '{field_name}' is already indexed"
            );
        }

        let container: SharedContainer = match &self.prefix {
            Some(prefix) => share(FileContainer::create(
                index_prefix(prefix, &field_name),
                self.settings.max_unit_file_size,
            )?),
            None => share(TemporalContainer::new(&self.settings)),
        };

        let mut mgr = NodeManager::create_index(
            container,
            node_kb as usize * 1024,
            ty,
            self.settings.index_cache_budget,
        )?;

        let total = self.rows_count();
        for row in 0..total {
            let value = self.get(row, field)?;
            if !value.is_null() {
                BTree::new(&mut mgr).insert_key(&BTreeKey::new(value, row))?;
            }
            if let Some(report) = progress.as_deref_mut() {
                report(row + 1, total);
            }
        }

        *slot = Some(mgr);
        drop(slot);

        self.schema
            .write()
            .descriptor_mut(field)
            .set_index_node_kb(node_kb);

        debug!(table = %self.name, field = %field_name, "created field index");
        Ok(())
    }

    /// Drops the secondary index of `field`, deleting its container.
    pub fn remove_index(&self, field: usize) -> Result<()> {
        {
            let schema = self.schema.read();
            self.check_field(&schema, field)?;
        }
        self.touch_modified()?;

        let mut slot = self.indexes[field].lock();
        let Some(mgr) = slot.take() else {
            fail!(
                ErrorKind::InvalidParameters,
                "field '{}' is not indexed",
                self.field_name(field)
            );
        };
        mgr.mark_for_removal();
        drop(mgr);
        drop(slot);

        let mut schema = self.schema.write();
        schema.descriptor_mut(field).set_index_node_kb(0);
        schema.descriptor_mut(field).set_index_units(0);
        Ok(())
    }

    /// Flushes caches, indices, heap, and (for persistent tables) the
    /// header with the `MODIFIED` flag cleared.
    pub fn flush(&self) -> Result<()> {
        let mut meta = self.meta.lock();
        if meta.removed {
            return Ok(());
        }

        meta.rm.flush()?;
        {
            let mut cache = self.row_cache.lock();
            cache.flush()?;
            cache.store().container().lock().flush()?;
        }

        let mut index_units: Vec<Option<u64>> = Vec::with_capacity(self.indexes.len());
        for slot in &self.indexes {
            let mut slot = slot.lock();
            match slot.as_mut() {
                Some(mgr) => {
                    mgr.flush()?;
                    index_units.push(Some(
                        mgr.raw_size().div_ceil(self.settings.max_unit_file_size),
                    ));
                }
                None => index_units.push(None),
            }
        }

        if let Some(heap) = &self.heap {
            heap.flush()?;
        }

        if self.prefix.is_some() {
            let mut schema = self.schema.write();
            for (field, units) in index_units.iter().enumerate() {
                if let Some(units) = units {
                    schema.descriptor_mut(field).set_index_units(*units as u32);
                }
            }

            let desc = schema.to_bytes();
            let mut header = TableHeader::new(
                schema.fields_count() as u32,
                desc.len() as u32,
                schema.row_size(),
                self.settings.max_unit_file_size,
            );
            drop(schema);

            header.rows_count = meta.rows_count;
            header.heap_size = self.heap.as_ref().map_or(0, |h| h.size());
            header.rm_root = meta.rm.root_id();
            header.rm_free_head = meta.rm.free_head();
            header.main_size = meta.table_container.lock().size();
            header.flags = 0;

            let mut container = meta.table_container.lock();
            container.write(0, &header.serialize())?;
            container.write(TABLE_HEADER_SIZE as u64, &desc)?;
            container.flush()?;
            drop(container);

            meta.modified_on_disk = false;
        }

        Ok(())
    }

    /// Marks every container of this table for deletion at drop.
    pub fn remove_from_database(&self) -> Result<()> {
        let mut meta = self.meta.lock();
        meta.removed = true;
        meta.table_container.lock().mark_for_removal();

        self.row_cache
            .lock()
            .store()
            .container()
            .lock()
            .mark_for_removal();

        if let Some(heap) = &self.heap {
            heap.mark_for_removal();
        }

        for slot in &self.indexes {
            if let Some(mgr) = slot.lock().as_ref() {
                mgr.mark_for_removal();
            }
        }

        debug!(table = %self.name, "table marked for removal");
        Ok(())
    }

    fn field_name(&self, field: usize) -> String {
        self.schema.read().name(field).to_string()
    }

    fn heap_ref(&self) -> Result<&Arc<VariableHeap>> {
        self.heap.as_ref().ok_or_else(|| {
            eyre::Report::new(ErrorKind::GeneralControlError)
                .wrap_err("table has no variable-size heap")
        })
    }

    /// Encodes a variable payload into a 16-byte slot: inline when it
    /// fits, a heap record otherwise.
    fn encode_variable(&self, payload: &[u8], slot: &mut [u8; VAR_SLOT_SIZE]) -> Result<()> {
        if payload.len() <= VAR_INLINE_MAX {
            slot[..payload.len()].copy_from_slice(payload);
            slot[VAR_SLOT_SIZE - 1] = 0x80 | payload.len() as u8;
        } else {
            let first_entry = self.heap_ref()?.add_record(payload)?;
            slot[..8].copy_from_slice(&first_entry.to_le_bytes());
            slot[8..16].copy_from_slice(&(payload.len() as u64).to_le_bytes());
        }
        Ok(())
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        let removed = self.meta.lock().removed;
        if !removed && self.prefix.is_some() {
            if let Err(e) = self.flush() {
                warn!(table = %self.name, error = %e, "flush on close failed; table left marked modified");
            }
        }
    }
}

/// Decoded form of a text/array row slot.
pub enum VarSlot {
    Inline { len: usize },
    Spilled { first_entry: u64, size: u64 },
}

impl VarSlot {
    pub fn decode(slot: &[u8]) -> VarSlot {
        if slot[VAR_SLOT_SIZE - 1] & 0x80 != 0 {
            VarSlot::Inline {
                len: (slot[VAR_SLOT_SIZE - 1] & 0x7F) as usize,
            }
        } else {
            VarSlot::Spilled {
                first_entry: u64::from_le_bytes(slot[..8].try_into().unwrap()),
                size: u64::from_le_bytes(slot[8..16].try_into().unwrap()),
            }
        }
    }
}

/// A fresh row image: every null bit set, value bytes zeroed.
pub fn blank_row(schema: &Schema) -> Vec<u8> {
    let mut row = vec![0u8; schema.row_size() as usize];
    for field in 0..schema.fields_count() {
        let bit = schema.descriptor(field).null_bit() as usize;
        row[bit / 8] |= 1 << (bit % 8);
    }
    row
}
