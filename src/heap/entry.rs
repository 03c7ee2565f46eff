//! # Heap Entry Layout
//!
//! Every slot of the variable-size heap is a 64-byte [`StoreEntry`]:
//! 16 bytes of chain header followed by 48 payload bytes.
//!
//! ```text
//! Offset  Size  Description
//! 0       8     prev_entry (or the record refcount on a first entry)
//! 8       8     next_entry, with two flag bits in the top byte:
//!                 bit 63  DELETED        entry is on the free list
//!                 bit 62  FIRST_OF_RECORD
//! 16      48    payload
//! ```
//!
//! `next == LAST_CHAINED` ends a record chain; `next == LAST_DELETED` ends
//! the free list. Entry 0 is reserved as the free-list sentinel: its `next`
//! is the first free entry and its `prev` is unused.

use zerocopy::byteorder::little_endian::U64;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Payload bytes carried by one entry.
pub const ENTRY_PAYLOAD: usize = 48;
/// On-disk size of one entry.
pub const ENTRY_RAW_SIZE: usize = 64;

/// Chain terminator for live records.
pub const LAST_CHAINED: u64 = 0x0FFF_FFFF_FFFF_FFFF;
/// Chain terminator for the free list.
pub const LAST_DELETED: u64 = 0x0FFF_FFFF_FFFF_FFFF;

const DELETED_MASK: u64 = 0x8000_0000_0000_0000;
const FIRST_MASK: u64 = 0x4000_0000_0000_0000;
const FLAGS_MASK: u64 = DELETED_MASK | FIRST_MASK;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct StoreEntry {
    prev: U64,
    next: U64,
    payload: [u8; ENTRY_PAYLOAD],
}

const _: () = assert!(std::mem::size_of::<StoreEntry>() == ENTRY_RAW_SIZE);

impl StoreEntry {
    /// A detached free entry terminating the free list.
    pub fn new_free() -> Self {
        let mut entry = Self {
            prev: U64::new(0),
            next: U64::new(0),
            payload: [0xFF; ENTRY_PAYLOAD],
        };
        entry.set_deleted(true);
        entry.set_first(false);
        entry.set_next(LAST_DELETED);
        entry
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut entry = Self::new_free();
        entry.as_mut_bytes().copy_from_slice(&bytes[..ENTRY_RAW_SIZE]);
        entry
    }

    pub fn is_deleted(&self) -> bool {
        self.next.get() & DELETED_MASK != 0
    }

    pub fn set_deleted(&mut self, deleted: bool) {
        let mut raw = self.next.get();
        if deleted {
            raw |= DELETED_MASK;
        } else {
            raw &= !DELETED_MASK;
        }
        self.next.set(raw);
    }

    pub fn is_first(&self) -> bool {
        self.next.get() & FIRST_MASK != 0
    }

    pub fn set_first(&mut self, first: bool) {
        let mut raw = self.next.get();
        if first {
            raw |= FIRST_MASK;
        } else {
            raw &= !FIRST_MASK;
        }
        self.next.set(raw);
    }

    /// Previous entry in the chain; on a first entry this is the record's
    /// reference count.
    pub fn prev(&self) -> u64 {
        self.prev.get()
    }

    pub fn set_prev(&mut self, prev: u64) {
        self.prev.set(prev);
    }

    pub fn next(&self) -> u64 {
        self.next.get() & !FLAGS_MASK
    }

    pub fn set_next(&mut self, next: u64) {
        let flags = self.next.get() & FLAGS_MASK;
        self.next.set(flags | (next & !FLAGS_MASK));
    }

    /// Copies payload bytes `[offset, offset + n)` into `buf`, clamped to
    /// the payload size; returns the bytes copied.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> usize {
        let n = buf.len().min(ENTRY_PAYLOAD.saturating_sub(offset));
        buf[..n].copy_from_slice(&self.payload[offset..offset + n]);
        n
    }

    /// Overwrites payload bytes starting at `offset`, clamped to the
    /// payload size; returns the bytes written.
    pub fn write(&mut self, offset: usize, buf: &[u8]) -> usize {
        let n = buf.len().min(ENTRY_PAYLOAD.saturating_sub(offset));
        self.payload[offset..offset + n].copy_from_slice(&buf[..n]);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_do_not_disturb_the_chain_index() {
        let mut e = StoreEntry::new_free();

        e.set_next(12345);
        e.set_deleted(true);
        e.set_first(true);

        assert_eq!(e.next(), 12345);
        assert!(e.is_deleted());
        assert!(e.is_first());

        e.set_deleted(false);
        assert_eq!(e.next(), 12345);
        assert!(e.is_first());
    }

    #[test]
    fn new_free_terminates_the_free_list() {
        let e = StoreEntry::new_free();

        assert!(e.is_deleted());
        assert!(!e.is_first());
        assert_eq!(e.next(), LAST_DELETED);
        assert_eq!(e.prev(), 0);
    }

    #[test]
    fn payload_io_clamps_at_entry_end() {
        let mut e = StoreEntry::new_free();
        let data = [7u8; 100];

        assert_eq!(e.write(0, &data), ENTRY_PAYLOAD);
        assert_eq!(e.write(40, &data), 8);

        let mut back = [0u8; 100];
        assert_eq!(e.read(0, &mut back), ENTRY_PAYLOAD);
        assert_eq!(e.read(44, &mut back), 4);
        assert_eq!(e.read(48, &mut back), 0);
    }

    #[test]
    fn entries_roundtrip_through_raw_bytes() {
        let mut e = StoreEntry::new_free();
        e.set_deleted(false);
        e.set_first(true);
        e.set_prev(3);
        e.set_next(LAST_CHAINED);
        e.write(0, b"hello");

        let bytes = e.as_bytes().to_vec();
        let back = StoreEntry::from_bytes(&bytes);

        assert!(!back.is_deleted());
        assert!(back.is_first());
        assert_eq!(back.prev(), 3);
        assert_eq!(back.next(), LAST_CHAINED);

        let mut payload = [0u8; 5];
        back.read(0, &mut payload);
        assert_eq!(&payload, b"hello");
    }
}
