//! # Variable-Size Heap
//!
//! A [`VariableHeap`] is a durable chain allocator over 64-byte entries.
//! A *record* is a singly-linked chain of entries holding one logical
//! variable-length value (a text or an array payload). Deleted entries
//! form a doubly-linked free list threaded through the same slots,
//! anchored at the reserved sentinel entry 0.
//!
//! ## Allocation Locality
//!
//! `allocate_entry(prev)` prefers a free neighbor of `prev` (checking
//! `prev + 1`, then `prev - 1`) before falling back to the free-list
//! head, so records that grow linearly stay mostly contiguous. Freed
//! entries splice next to an address-adjacent free neighbor for the same
//! reason.
//!
//! ## Reference Counting
//!
//! The first entry of a record stores the record's refcount in its `prev`
//! slot. `decref` to zero returns the whole chain to the free list; the
//! next allocation reuses those slots.
//!
//! ## Storage Check
//!
//! Repair drives `prepare_storage_check` → per-row `check_array_entry` /
//! `check_text_entry` → `conclude_storage_check`. The check keeps a
//! bitmap of entries reachable from live rows; concluding frees every
//! unmarked entry and rebuilds the free list in address order.

use eyre::Result;
use parking_lot::Mutex;

use super::entry::{StoreEntry, ENTRY_PAYLOAD, ENTRY_RAW_SIZE, LAST_CHAINED, LAST_DELETED};
use crate::config::DbSettings;
use crate::error::{fail, ErrorKind};
use crate::storage::{
    container_cache, share, BlockCache, Container, ContainerStore, FileContainer,
    TemporalContainer,
};
use crate::types::FieldType;
use crate::types::serial::{validate_array_payload, validate_text_payload};

pub struct VariableHeap {
    inner: Mutex<HeapInner>,
}

struct HeapInner {
    cache: BlockCache<ContainerStore>,
    first_free: u64,
    entries_count: u64,
    check_map: Option<Vec<bool>>,
}

impl VariableHeap {
    /// A RAM-first heap for temporal tables.
    pub fn create_temporal(settings: &DbSettings) -> Result<Self> {
        let container = share(TemporalContainer::new(settings));
        Self::finish_init(container, settings)
    }

    /// Opens (or creates) the persistent heap family at `prefix`.
    /// `heap_size` is the byte size recorded in the table header.
    pub fn open<P: AsRef<std::path::Path>>(
        prefix: P,
        heap_size: u64,
        settings: &DbSettings,
    ) -> Result<Self> {
        let unit_size = settings.max_unit_file_size;
        let units = heap_size.div_ceil(unit_size) as usize;

        let container = if units == 0 && !prefix.as_ref().exists() {
            share(FileContainer::create(prefix, unit_size)?)
        } else {
            share(FileContainer::open(prefix, unit_size, units.max(1))?)
        };

        Self::finish_init(container, settings)
    }

    fn finish_init(
        container: crate::storage::SharedContainer,
        settings: &DbSettings,
    ) -> Result<Self> {
        let mut entries_count = container.lock().size() / ENTRY_RAW_SIZE as u64;

        if entries_count == 0 {
            let sentinel = StoreEntry::new_free();
            container
                .lock()
                .write(0, zerocopy::IntoBytes::as_bytes(&sentinel))?;
            entries_count = 1;
        }

        let mut cache = container_cache(
            container,
            ENTRY_RAW_SIZE,
            settings.heap_cache_block_size,
            settings.heap_cache_block_count,
            false,
        )?;
        cache.set_item_limit(entries_count);

        let mut inner = HeapInner {
            cache,
            first_free: 0,
            entries_count,
            check_map: None,
        };
        inner.first_free = inner.read_entry(0)?.next();

        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Allocates a fresh one-entry record with refcount 1 and writes
    /// `data` as its payload. Returns the record's first entry id.
    pub fn add_record(&self, data: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock();

        let first = inner.allocate_entry(0)?;
        let mut entry = inner.read_entry(first)?;
        entry.set_first(true);
        entry.set_next(LAST_CHAINED);
        entry.set_prev(1);
        inner.write_entry(first, &entry)?;

        if !data.is_empty() {
            inner.update_record(first, 0, data)?;
        }

        Ok(first)
    }

    /// Allocates a record and streams `count` bytes from a container.
    pub fn add_record_from_container(
        &self,
        source: &mut dyn Container,
        source_offset: u64,
        count: u64,
    ) -> Result<u64> {
        let mut inner = self.inner.lock();

        let first = inner.allocate_entry(0)?;
        let mut entry = inner.read_entry(first)?;
        entry.set_first(true);
        entry.set_next(LAST_CHAINED);
        entry.set_prev(1);
        inner.write_entry(first, &entry)?;

        inner.update_record_from_container(first, 0, source, source_offset, count)?;
        Ok(first)
    }

    /// Allocates a record copied out of another heap's record.
    pub fn add_record_from_heap(
        &self,
        source: &VariableHeap,
        source_first: u64,
        source_offset: u64,
        count: u64,
    ) -> Result<u64> {
        let first = self.add_record(&[])?;

        let mut bounce = [0u8; ENTRY_PAYLOAD];
        let mut copied = 0u64;
        while copied < count {
            let step = (count - copied).min(ENTRY_PAYLOAD as u64) as usize;
            source.read_record(source_first, source_offset + copied, &mut bounce[..step])?;
            self.update_record(first, copied, &bounce[..step])?;
            copied += step as u64;
        }

        Ok(first)
    }

    /// Copies `buf.len()` bytes of the record starting at byte `offset`.
    pub fn read_record(&self, first: u64, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.inner.lock().read_record(first, offset, buf)
    }

    /// Overwrites record bytes starting at `offset`, allocating entries
    /// past the chain's end as needed. `offset` may not exceed the
    /// record's current size.
    pub fn update_record(&self, first: u64, offset: u64, data: &[u8]) -> Result<()> {
        self.inner.lock().update_record(first, offset, data)
    }

    /// Streams `count` bytes from a container into the record.
    pub fn update_record_from_container(
        &self,
        first: u64,
        offset: u64,
        source: &mut dyn Container,
        source_offset: u64,
        count: u64,
    ) -> Result<()> {
        self.inner
            .lock()
            .update_record_from_container(first, offset, source, source_offset, count)
    }

    /// Adds one reference to the record.
    pub fn incref(&self, first: u64) -> Result<()> {
        let mut inner = self.inner.lock();

        let mut entry = inner.read_entry(first)?;
        debug_assert!(entry.is_first());
        debug_assert!(!entry.is_deleted());
        entry.set_prev(entry.prev() + 1);
        inner.write_entry(first, &entry)
    }

    /// Drops one reference; on zero the whole chain returns to the free
    /// list.
    pub fn decref(&self, first: u64) -> Result<()> {
        let mut inner = self.inner.lock();

        let mut entry = inner.read_entry(first)?;
        debug_assert!(entry.is_first());
        debug_assert!(!entry.is_deleted());

        let refs = entry.prev();
        if refs == 0 {
            fail!(
                ErrorKind::GeneralControlError,
                "record {first} is already unreferenced"
            );
        }
        entry.set_prev(refs - 1);
        inner.write_entry(first, &entry)?;

        if refs == 1 {
            inner.remove_record(first)?;
        }
        Ok(())
    }

    /// Total heap size in bytes (container size after a flush).
    pub fn size(&self) -> u64 {
        let inner = self.inner.lock();
        let size = inner.cache.store().container().lock().size();
        size
    }

    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.cache.flush()?;
        let result = inner.cache.store().container().lock().flush();
        result
    }

    pub fn mark_for_removal(&self) {
        let inner = self.inner.lock();
        inner.cache.store().container().lock().mark_for_removal();
    }

    /// Starts a storage check: every entry is presumed unreachable until
    /// a `check_*_entry` call marks it.
    pub fn prepare_storage_check(&self) {
        let mut inner = self.inner.lock();
        let count = inner.entries_count as usize;
        inner.check_map = Some(vec![false; count]);
    }

    /// Verifies that `(first, size)` addresses a live chain holding a
    /// valid packed array of `elem_type`, marking its entries reachable.
    pub fn check_array_entry(&self, first: u64, size: u64, elem_type: FieldType) -> bool {
        let mut inner = self.inner.lock();
        match inner.check_record(first, size) {
            Ok(Some(payload)) => validate_array_payload(elem_type, &payload),
            _ => false,
        }
    }

    /// Verifies that `(first, size)` addresses a live chain holding valid
    /// UTF-8 text, marking its entries reachable.
    pub fn check_text_entry(&self, first: u64, size: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.check_record(first, size) {
            Ok(Some(payload)) => validate_text_payload(&payload),
            _ => false,
        }
    }

    /// Frees every entry the check did not reach and rebuilds the free
    /// list in address order.
    pub fn conclude_storage_check(&self) -> Result<()> {
        let mut inner = self.inner.lock();

        let Some(seen) = inner.check_map.take() else {
            fail!(
                ErrorKind::GeneralControlError,
                "conclude_storage_check without prepare_storage_check"
            );
        };

        let mut sentinel = inner.read_entry(0)?;
        sentinel.set_next(LAST_DELETED);
        inner.write_entry(0, &sentinel)?;
        inner.first_free = LAST_DELETED;

        let mut tail = 0u64;
        for id in 1..inner.entries_count {
            if seen.get(id as usize).copied().unwrap_or(false) {
                continue;
            }

            let mut entry = StoreEntry::new_free();
            entry.set_prev(tail);
            inner.write_entry(id, &entry)?;

            let mut tail_entry = inner.read_entry(tail)?;
            tail_entry.set_next(id);
            inner.write_entry(tail, &tail_entry)?;

            if inner.first_free == LAST_DELETED {
                inner.first_free = id;
            }
            tail = id;
        }

        Ok(())
    }
}

impl HeapInner {
    fn read_entry(&mut self, id: u64) -> Result<StoreEntry> {
        let mut raw = [0u8; ENTRY_RAW_SIZE];
        self.cache.read_item(id, &mut raw)?;
        Ok(StoreEntry::from_bytes(&raw))
    }

    fn write_entry(&mut self, id: u64, entry: &StoreEntry) -> Result<()> {
        self.cache
            .write_item(id, zerocopy::IntoBytes::as_bytes(entry))
    }

    /// Walks a record chain to the entry containing byte `offset`;
    /// returns `(entry_id_before, entry_id, intra_offset)` where
    /// `entry_id` may be `LAST_CHAINED` when `offset` sits exactly at the
    /// record's end.
    fn seek(&mut self, mut entry_id: u64, mut offset: u64) -> Result<(u64, u64, usize)> {
        let mut prev = entry_id;

        loop {
            if entry_id == LAST_CHAINED {
                if offset != 0 {
                    fail!(
                        ErrorKind::GeneralControlError,
                        "offset {offset} lies past the record's end"
                    );
                }
                return Ok((prev, entry_id, 0));
            }

            let entry = self.read_entry(entry_id)?;
            debug_assert!(!entry.is_deleted());

            if offset < ENTRY_PAYLOAD as u64 {
                return Ok((prev, entry_id, offset as usize));
            }

            offset -= ENTRY_PAYLOAD as u64;
            prev = entry_id;
            entry_id = entry.next();
        }
    }

    fn read_record(&mut self, first: u64, offset: u64, buf: &mut [u8]) -> Result<()> {
        if first == LAST_CHAINED || first == 0 {
            fail!(ErrorKind::GeneralControlError, "invalid record id {first}");
        }

        let (_, mut entry_id, mut intra) = self.seek(first, offset)?;
        let mut read = 0usize;

        while read < buf.len() {
            if entry_id == LAST_CHAINED {
                fail!(
                    ErrorKind::GeneralControlError,
                    "record chain ended {} bytes early",
                    buf.len() - read
                );
            }

            let entry = self.read_entry(entry_id)?;
            debug_assert!(!entry.is_deleted());

            let n = entry.read(intra, &mut buf[read..]);
            read += n;
            intra = (intra + n) % ENTRY_PAYLOAD;
            if intra == 0 {
                entry_id = entry.next();
            }
        }

        Ok(())
    }

    fn update_record(&mut self, first: u64, offset: u64, data: &[u8]) -> Result<()> {
        if first == LAST_CHAINED || first == 0 {
            fail!(ErrorKind::GeneralControlError, "invalid record id {first}");
        }

        let (mut prev, mut entry_id, mut intra) = self.seek(first, offset)?;
        let mut written = 0usize;

        while written < data.len() {
            if entry_id == LAST_CHAINED {
                entry_id = self.allocate_entry(prev)?;
            }

            let mut entry = self.read_entry(entry_id)?;
            debug_assert!(!entry.is_deleted());

            let n = entry.write(intra, &data[written..]);
            self.write_entry(entry_id, &entry)?;

            written += n;
            intra = (intra + n) % ENTRY_PAYLOAD;
            if intra == 0 {
                prev = entry_id;
                entry_id = entry.next();
            }
        }

        Ok(())
    }

    fn update_record_from_container(
        &mut self,
        first: u64,
        offset: u64,
        source: &mut dyn Container,
        source_offset: u64,
        count: u64,
    ) -> Result<()> {
        let mut bounce = [0u8; ENTRY_PAYLOAD];
        let mut copied = 0u64;

        while copied < count {
            let step = (count - copied).min(ENTRY_PAYLOAD as u64) as usize;
            source.read(source_offset + copied, &mut bounce[..step])?;
            self.update_record(first, offset + copied, &bounce[..step])?;
            copied += step as u64;
        }

        Ok(())
    }

    /// Detaches a free entry and, when `prev != 0`, splices it into the
    /// record chain right after `prev` (which must be the chain's tail).
    fn allocate_entry(&mut self, prev_id: u64) -> Result<u64> {
        let mut found = self.first_free;

        // Prefer an address-adjacent free neighbor of the previous entry.
        if prev_id + 1 < self.entries_count {
            if self.read_entry(prev_id + 1)?.is_deleted() {
                found = prev_id + 1;
            }
        } else if prev_id > 1 && self.read_entry(prev_id - 1)?.is_deleted() {
            found = prev_id - 1;
        }

        if found == LAST_DELETED {
            found = self.extend_free_list()?;
        }

        self.extract_from_free_list(found)?;

        if prev_id != 0 {
            let mut prev = self.read_entry(prev_id)?;
            debug_assert!(!prev.is_deleted());
            debug_assert_eq!(prev.next(), LAST_CHAINED);
            prev.set_next(found);
            self.write_entry(prev_id, &prev)?;

            let mut entry = self.read_entry(found)?;
            entry.set_prev(prev_id);
            entry.set_first(false);
            entry.set_next(LAST_CHAINED);
            self.write_entry(found, &entry)?;
        } else {
            let mut entry = self.read_entry(found)?;
            entry.set_first(true);
            entry.set_prev(0);
            entry.set_next(LAST_CHAINED);
            self.write_entry(found, &entry)?;
        }

        Ok(found)
    }

    /// Grows the heap by one entry and pushes it onto the free list.
    fn extend_free_list(&mut self) -> Result<u64> {
        debug_assert_eq!(self.first_free, LAST_DELETED);

        let id = self.entries_count;
        self.entries_count += 1;
        self.cache.set_item_limit(self.entries_count);

        if let Some(map) = self.check_map.as_mut() {
            map.push(false);
        }

        self.write_entry(id, &StoreEntry::new_free())?;

        let mut sentinel = self.read_entry(0)?;
        sentinel.set_next(id);
        self.write_entry(0, &sentinel)?;

        self.first_free = id;
        Ok(id)
    }

    /// Unlinks `id` from the free list and marks it live (detached).
    fn extract_from_free_list(&mut self, id: u64) -> Result<()> {
        if id == 0 || id >= self.entries_count {
            fail!(ErrorKind::GeneralControlError, "bad free entry id {id}");
        }

        let mut entry = self.read_entry(id)?;
        debug_assert!(entry.is_deleted());
        debug_assert!(!entry.is_first());

        let prev = entry.prev();
        let next = entry.next();

        entry.set_deleted(false);
        entry.set_prev(0);
        entry.set_next(0);
        self.write_entry(id, &entry)?;

        let mut prev_entry = self.read_entry(prev)?;
        debug_assert!(prev_entry.is_deleted());
        prev_entry.set_next(next);
        self.write_entry(prev, &prev_entry)?;

        if id == self.first_free {
            self.first_free = next;
        }

        if next != LAST_DELETED {
            let mut next_entry = self.read_entry(next)?;
            debug_assert!(next_entry.is_deleted());
            next_entry.set_prev(prev);
            self.write_entry(next, &next_entry)?;
        }

        Ok(())
    }

    /// Returns every entry of a record chain to the free list.
    fn remove_record(&mut self, first: u64) -> Result<()> {
        let entry = self.read_entry(first)?;
        debug_assert!(!entry.is_deleted());
        debug_assert!(entry.is_first());

        let mut current = first;
        while current != LAST_CHAINED {
            let entry = self.read_entry(current)?;
            debug_assert!(!entry.is_deleted());

            let next = entry.next();
            self.add_to_free_list(current)?;
            current = next;
        }

        Ok(())
    }

    /// Pushes `id` onto the free list, splicing next to an
    /// address-adjacent free neighbor when one exists.
    fn add_to_free_list(&mut self, id: u64) -> Result<()> {
        if id == 0 || id >= self.entries_count {
            fail!(ErrorKind::GeneralControlError, "bad entry id {id}");
        }

        let mut entry = self.read_entry(id)?;
        debug_assert!(!entry.is_deleted());
        entry.set_deleted(true);
        entry.set_first(false);

        if id + 1 < self.entries_count {
            let mut right = self.read_entry(id + 1)?;
            if right.is_deleted() {
                debug_assert!(!right.is_first());

                let left_of_right = right.prev();
                right.set_prev(id);
                self.write_entry(id + 1, &right)?;

                entry.set_prev(left_of_right);
                entry.set_next(id + 1);
                self.write_entry(id, &entry)?;

                let mut before = self.read_entry(left_of_right)?;
                debug_assert!(before.is_deleted());
                before.set_next(id);
                self.write_entry(left_of_right, &before)?;

                if self.first_free == id + 1 {
                    self.first_free = id;
                }
                return Ok(());
            }
        } else if id > 1 {
            let mut left = self.read_entry(id - 1)?;
            if left.is_deleted() {
                debug_assert!(!left.is_first());

                let after_left = left.next();
                left.set_next(id);
                self.write_entry(id - 1, &left)?;

                entry.set_next(after_left);
                entry.set_prev(id - 1);
                self.write_entry(id, &entry)?;

                if after_left != LAST_DELETED {
                    let mut after = self.read_entry(after_left)?;
                    debug_assert!(after.is_deleted());
                    after.set_prev(id);
                    self.write_entry(after_left, &after)?;
                }
                return Ok(());
            }
        }

        // No free neighbor: push to the head of the free list.
        if self.first_free != LAST_DELETED {
            let mut head = self.read_entry(self.first_free)?;
            debug_assert!(head.is_deleted());
            head.set_prev(id);
            let head_id = self.first_free;
            self.write_entry(head_id, &head)?;
        }

        entry.set_prev(0);
        entry.set_next(self.first_free);
        self.write_entry(id, &entry)?;

        self.first_free = id;
        let mut sentinel = self.read_entry(0)?;
        sentinel.set_next(id);
        self.write_entry(0, &sentinel)
    }

    /// Walks a record chain of `size` bytes, marking entries in the check
    /// map. Returns the record's payload when the chain is structurally
    /// sound, `None` when it is not.
    fn check_record(&mut self, first: u64, size: u64) -> Result<Option<Vec<u8>>> {
        if self.check_map.is_none() {
            fail!(
                ErrorKind::GeneralControlError,
                "storage check was not prepared"
            );
        }

        if first == 0 || first >= self.entries_count || size == 0 {
            return Ok(None);
        }

        let head = self.read_entry(first)?;
        if head.is_deleted() || !head.is_first() || head.prev() == 0 {
            return Ok(None);
        }

        let max_entries = size.div_ceil(ENTRY_PAYLOAD as u64);
        let mut ids = Vec::with_capacity(max_entries as usize);
        let mut current = first;

        for walked in 0..max_entries {
            if current == LAST_CHAINED || current >= self.entries_count {
                return Ok(None);
            }

            let entry = self.read_entry(current)?;
            if entry.is_deleted() || (walked > 0 && entry.is_first()) {
                return Ok(None);
            }

            ids.push(current);
            current = entry.next();
        }

        if current != LAST_CHAINED {
            return Ok(None);
        }

        let mut payload = vec![0u8; size as usize];
        self.read_record(first, 0, &mut payload)?;

        let map = self.check_map.as_mut().unwrap();
        for id in ids {
            map[id as usize] = true;
        }

        Ok(Some(payload))
    }
}
