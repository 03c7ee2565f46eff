//! # B-Tree Index Tests
//!
//! Ordered range scans, duplicate handling, and persistence of field
//! index containers across sessions.

use stratadb::btree::{BTree, BTreeKey, NodeManager, NIL_NODE};
use stratadb::config::DbSettings;
use stratadb::storage::{share, FileContainer, TemporalContainer};
use stratadb::types::{FieldType, Value};

fn ram_manager() -> NodeManager {
    let dir = tempfile::tempdir().unwrap();
    let settings = DbSettings::with_temp_dir(dir.path());
    let container = share(TemporalContainer::new(&settings));
    NodeManager::new(
        container,
        0,
        256,
        stratadb::btree::KeyLayout::for_field(FieldType::Int64),
        NIL_NODE,
        NIL_NODE,
        64 * 1024,
    )
    .unwrap()
}

fn key(v: i64, row: u64) -> BTreeKey {
    BTreeKey::new(Value::Int64(v), row)
}

#[test]
fn duplicate_values_scan_in_row_order() {
    let mut mgr = ram_manager();
    let mut tree = BTree::new(&mut mgr);

    for (v, r) in [(7, 1), (3, 2), (7, 3), (7, 0), (9, 4)] {
        tree.insert_key(&key(v, r)).unwrap();
    }

    let sevens = tree
        .range_rows(&key(7, 0), &BTreeKey::new(Value::Int64(7), u64::MAX))
        .unwrap();
    assert_eq!(sevens, vec![0, 1, 3]);

    let all = tree
        .range_rows(
            &BTreeKey::new(Value::Int64(i64::MIN), 0),
            &BTreeKey::new(Value::Int64(i64::MAX), u64::MAX),
        )
        .unwrap();
    assert_eq!(all, vec![2, 0, 1, 3, 4]);
}

#[test]
fn thousands_of_keys_stay_sorted_and_complete() {
    let mut mgr = ram_manager();

    for row in 0..4000u64 {
        let v = (row as i64 * 2_654_435_761) % 10_007;
        BTree::new(&mut mgr).insert_key(&key(v, row)).unwrap();
    }

    let rows = BTree::new(&mut mgr)
        .range_rows(
            &BTreeKey::new(Value::Int64(i64::MIN), 0),
            &BTreeKey::new(Value::Int64(i64::MAX), u64::MAX),
        )
        .unwrap();

    assert_eq!(rows.len(), 4000);
    let mut unique = rows.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), 4000);
}

#[test]
fn removals_and_reinsertions_interleave() {
    let mut mgr = ram_manager();

    for row in 0..1000u64 {
        BTree::new(&mut mgr)
            .insert_key(&key(row as i64 % 50, row))
            .unwrap();
    }
    for row in (0..1000u64).filter(|r| r % 3 != 0) {
        BTree::new(&mut mgr)
            .remove_key(&key(row as i64 % 50, row))
            .unwrap();
    }
    for row in (0..1000u64).filter(|r| r % 3 == 1) {
        BTree::new(&mut mgr)
            .insert_key(&key(-1 - row as i64, row))
            .unwrap();
    }

    let all = BTree::new(&mut mgr)
        .range_rows(
            &BTreeKey::new(Value::Int64(i64::MIN), 0),
            &BTreeKey::new(Value::Int64(i64::MAX), u64::MAX),
        )
        .unwrap();
    // 334 survivors (row % 3 == 0) plus 333 reinsertions (row % 3 == 1).
    assert_eq!(all.len(), 334 + 333);
}

#[test]
fn index_container_persists_its_tree() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("age_bt");

    {
        let container = share(FileContainer::create(&path, 32 * 1024).unwrap());
        let mut mgr =
            NodeManager::create_index(container, 1024, FieldType::Int64, 64 * 1024).unwrap();

        for row in 0..500u64 {
            BTree::new(&mut mgr)
                .insert_key(&key(row as i64 / 5, row))
                .unwrap();
        }
        mgr.flush().unwrap();
    }

    let units = (std::fs::metadata(&path).unwrap().len() + 32 * 1024 - 1) / (32 * 1024);
    let container = share(FileContainer::open(&path, 32 * 1024, units as usize).unwrap());
    let mut mgr = NodeManager::open_index(container, FieldType::Int64, 64 * 1024).unwrap();

    let tens = BTree::new(&mut mgr)
        .range_rows(
            &BTreeKey::new(Value::Int64(10), 0),
            &BTreeKey::new(Value::Int64(10), u64::MAX),
        )
        .unwrap();
    assert_eq!(tens, vec![50, 51, 52, 53, 54]);
}
