//! # Variable-Size Heap Tests
//!
//! Record chains, reference counting, entry reuse, and persistence of
//! the heap across sessions.

use stratadb::config::DbSettings;
use stratadb::heap::{VariableHeap, ENTRY_RAW_SIZE};

fn settings(dir: &tempfile::TempDir) -> DbSettings {
    DbSettings {
        max_unit_file_size: 16 * 1024,
        ..DbSettings::with_temp_dir(dir.path())
    }
}

#[test]
fn chain_spans_three_entries_for_128_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let heap = VariableHeap::create_temporal(&settings(&dir)).unwrap();

    let payload: Vec<u8> = (0..128u32).map(|i| 0x11 + i as u8).collect();
    let first = heap.add_record(&payload).unwrap();

    // Sentinel + 3 chained entries (48 + 48 + 32 payload bytes).
    heap.flush().unwrap();
    assert_eq!(heap.size(), 4 * ENTRY_RAW_SIZE as u64);

    let mut back = vec![0u8; 128];
    heap.read_record(first, 0, &mut back).unwrap();
    assert_eq!(back, payload);

    // Dropping the only reference frees the chain; the next record of
    // one entry comes back at the same id.
    heap.decref(first).unwrap();
    let reused = heap.add_record(&[0u8; 48]).unwrap();
    assert_eq!(reused, first);

    heap.flush().unwrap();
    assert_eq!(heap.size(), 4 * ENTRY_RAW_SIZE as u64);
}

#[test]
fn refcount_controls_the_record_lifetime() {
    let dir = tempfile::tempdir().unwrap();
    let heap = VariableHeap::create_temporal(&settings(&dir)).unwrap();

    let first = heap.add_record(&[7u8; 200]).unwrap();
    heap.flush().unwrap();
    let size_before = heap.size();

    // n increfs + (n + 1) decrefs free everything without growing.
    for _ in 0..3 {
        heap.incref(first).unwrap();
    }
    for _ in 0..4 {
        heap.decref(first).unwrap();
    }

    heap.flush().unwrap();
    assert_eq!(heap.size(), size_before);

    let again = heap.add_record(&[9u8; 40]).unwrap();
    assert_eq!(again, first, "a freed entry must be reused");
}

#[test]
fn partial_reads_and_growing_updates() {
    let dir = tempfile::tempdir().unwrap();
    let heap = VariableHeap::create_temporal(&settings(&dir)).unwrap();

    let payload: Vec<u8> = (0..500u32).map(|i| (i % 256) as u8).collect();
    let first = heap.add_record(&payload).unwrap();

    let mut middle = vec![0u8; 100];
    heap.read_record(first, 133, &mut middle).unwrap();
    assert_eq!(&middle[..], &payload[133..233]);

    // Extend the record past its end and read it all back.
    heap.update_record(first, 500, &[0xCD; 250]).unwrap();
    let mut back = vec![0u8; 750];
    heap.read_record(first, 0, &mut back).unwrap();
    assert_eq!(&back[..500], &payload[..]);
    assert!(back[500..].iter().all(|&b| b == 0xCD));
}

#[test]
fn many_records_stay_isolated_under_churn() {
    let dir = tempfile::tempdir().unwrap();
    let heap = VariableHeap::create_temporal(&settings(&dir)).unwrap();

    let mut records = Vec::new();
    for i in 0..50u8 {
        let first = heap.add_record(&vec![i; 60 + i as usize]).unwrap();
        records.push((first, 60 + i as usize));
    }

    // Free every third record, then allocate more.
    for (i, (first, _)) in records.iter().enumerate() {
        if i % 3 == 0 {
            heap.decref(*first).unwrap();
        }
    }
    for i in 50..80u8 {
        heap.add_record(&vec![i; 100]).unwrap();
    }

    for (i, (first, len)) in records.iter().enumerate() {
        if i % 3 == 0 {
            continue;
        }
        let mut back = vec![0u8; *len];
        heap.read_record(*first, 0, &mut back).unwrap();
        assert!(back.iter().all(|&b| b == i as u8), "record {i} corrupted");
    }
}

#[test]
fn heap_contents_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings(&dir);
    let prefix = dir.path().join("payloads_v");

    let (a, b, heap_size);
    {
        let heap = VariableHeap::open(&prefix, 0, &settings).unwrap();
        a = heap.add_record(b"the first persistent record").unwrap();
        b = heap.add_record(&[0x42; 300]).unwrap();
        heap.flush().unwrap();
        heap_size = heap.size();
    }

    let heap = VariableHeap::open(&prefix, heap_size, &settings).unwrap();

    let mut text = vec![0u8; 27];
    heap.read_record(a, 0, &mut text).unwrap();
    assert_eq!(&text[..], b"the first persistent record");

    let mut blob = vec![0u8; 300];
    heap.read_record(b, 0, &mut blob).unwrap();
    assert!(blob.iter().all(|&x| x == 0x42));
}
