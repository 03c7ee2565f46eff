//! # Table Row Store Tests
//!
//! Full table workflows over the public API: typed round-trips, row
//! recycling, index-served range queries, persistence across sessions,
//! and the open-state machine.

use stratadb::config::DbSettings;
use stratadb::types::value::{Date, HiresTime, Real};
use stratadb::{ArrayValue, Database, ErrorKind, FieldSpec, FieldType, Value};

fn settings(dir: &tempfile::TempDir) -> DbSettings {
    DbSettings {
        max_unit_file_size: 128 * 1024,
        ..DbSettings::with_temp_dir(dir.path())
    }
}

fn people_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec::new("id", FieldType::Int32, false),
        FieldSpec::new("name", FieldType::Text, false),
        FieldSpec::new("born", FieldType::Date, false),
        FieldSpec::new("score", FieldType::Real, false),
        FieldSpec::new("tags", FieldType::UInt16, true),
    ]
}

#[test]
fn every_type_roundtrips_through_a_persistent_table() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("db"), settings(&dir)).unwrap();

    let name = Value::Text("Grace Hopper \u{10FFFF}".into());
    let born = Value::Date(Date::new(1906, 12, 9));
    let score = Value::Real(Real::from_parts(99, 500_000));
    let tags = Value::Array(
        ArrayValue::new(
            FieldType::UInt16,
            (0..40u16).map(Value::UInt16).collect(),
        )
        .unwrap(),
    );

    {
        let table = db.add_table("people", &people_fields()).unwrap();
        let row = table.add_row().unwrap();
        table.set(row, 0, &Value::Int32(1)).unwrap();
        table.set(row, 1, &name).unwrap();
        table.set(row, 2, &born).unwrap();
        table.set(row, 3, &score).unwrap();
        table.set(row, 4, &tags).unwrap();
        table.flush().unwrap();
    }

    let table = db.open_table("people").unwrap();
    assert_eq!(table.rows_count(), 1);
    assert_eq!(table.get(0, 0).unwrap(), Value::Int32(1));
    assert_eq!(table.get(0, 1).unwrap(), name);
    assert_eq!(table.get(0, 2).unwrap(), born);
    assert_eq!(table.get(0, 3).unwrap(), score);
    assert_eq!(table.get(0, 4).unwrap(), tags);
}

#[test]
fn tombstoned_rows_are_recycled_smallest_first() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("db"), settings(&dir)).unwrap();
    let table = db
        .add_table("nums", &[FieldSpec::new("v", FieldType::Int32, false)])
        .unwrap();

    for i in 0..10 {
        let row = table.add_row().unwrap();
        assert_eq!(row, i);
        table.set(row, 0, &Value::Int32(i as i32)).unwrap();
    }

    table.mark_row_for_reuse(3).unwrap();
    table.mark_row_for_reuse(7).unwrap();

    assert_eq!(table.add_row().unwrap(), 3);
    assert_eq!(table.add_row().unwrap(), 7);
    assert_eq!(table.add_row().unwrap(), 10);

    // Recycled rows start out null again.
    assert_eq!(table.get(3, 0).unwrap(), Value::Null);
    assert_eq!(table.get(2, 0).unwrap(), Value::Int32(2));
}

#[test]
fn tombstones_survive_a_close_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("db"), settings(&dir)).unwrap();

    {
        let table = db
            .add_table("t", &[FieldSpec::new("v", FieldType::Int64, false)])
            .unwrap();
        for i in 0..5 {
            let row = table.add_row().unwrap();
            table.set(row, 0, &Value::Int64(i)).unwrap();
        }
        table.mark_row_for_reuse(1).unwrap();
        table.flush().unwrap();
    }

    let table = db.open_table("t").unwrap();
    assert_eq!(table.add_row().unwrap(), 1);
    assert_eq!(table.add_row().unwrap(), 5);
}

#[test]
fn match_rows_uses_an_index_and_respects_row_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("db"), settings(&dir)).unwrap();
    let table = db
        .add_table("evens", &[FieldSpec::new("v", FieldType::Int32, false)])
        .unwrap();

    for i in 0..100i32 {
        let row = table.add_row().unwrap();
        table.set(row, 0, &Value::Int32(i % 10)).unwrap();
    }

    let unindexed = table
        .match_rows(&Value::Int32(3), &Value::Int32(4), 10, 59, 0)
        .unwrap();

    table.create_index(0, 4, None).unwrap();
    let mut indexed = table
        .match_rows(&Value::Int32(3), &Value::Int32(4), 10, 59, 0)
        .unwrap();
    indexed.sort_unstable();

    let mut expected = unindexed;
    expected.sort_unstable();
    assert_eq!(indexed, expected);
    assert_eq!(indexed.len(), 10);
    assert!(indexed.iter().all(|&r| (10..=59).contains(&r)));
}

#[test]
fn indexed_tables_reopen_with_their_indexes() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("db"), settings(&dir)).unwrap();

    {
        let table = db
            .add_table("idx", &[FieldSpec::new("v", FieldType::UInt8, false)])
            .unwrap();
        table.create_index(0, 2, None).unwrap();
        for i in 0..50u8 {
            let row = table.add_row().unwrap();
            table.set(row, 0, &Value::UInt8(i % 4)).unwrap();
        }
        table.flush().unwrap();
    }

    let table = db.open_table("idx").unwrap();
    assert!(table.is_field_indexed(0));

    let twos = table
        .match_rows(&Value::UInt8(2), &Value::UInt8(2), 0, u64::MAX, 0)
        .unwrap();
    assert_eq!(twos.len(), 12);
    assert!(twos.iter().all(|&r| r % 4 == 2));
}

#[test]
fn hirestime_fields_keep_microseconds() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("db"), settings(&dir)).unwrap();
    let table = db
        .add_table("ts", &[FieldSpec::new("at", FieldType::HiresTime, false)])
        .unwrap();

    let v = Value::HiresTime(HiresTime::new(1999, 12, 31, 23, 59, 59, 999_999));
    let row = table.add_row().unwrap();
    table.set(row, 0, &v).unwrap();
    assert_eq!(table.get(row, 0).unwrap(), v);
}

#[test]
fn spawned_sibling_is_temporal_and_independent() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("db"), settings(&dir)).unwrap();
    let table = db.add_table("orig", &people_fields()).unwrap();

    let row = table.add_row().unwrap();
    table.set(row, 1, &Value::Text("only here".into())).unwrap();

    let sibling = table.spawn().unwrap();
    assert!(sibling.is_temporal());
    assert!(!table.is_temporal());
    assert_eq!(sibling.rows_count(), 0);

    let srow = sibling.add_row().unwrap();
    sibling
        .set(srow, 1, &Value::Text("only there".into()))
        .unwrap();

    assert_eq!(table.get(row, 1).unwrap(), Value::Text("only here".into()));
    assert_eq!(table.rows_count(), 1);
}

#[test]
fn unclean_shutdown_blocks_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("db"), settings(&dir)).unwrap();

    let table = db
        .add_table("crashy", &[FieldSpec::new("v", FieldType::Int32, false)])
        .unwrap();
    table.add_row().unwrap();

    // Simulate a crash: the table never flushes and never runs its drop.
    std::mem::forget(table);

    let err = db.open_table("crashy").unwrap_err();
    assert_eq!(
        err.downcast_ref::<ErrorKind>(),
        Some(&ErrorKind::TableInUse)
    );
}

#[test]
fn mismatched_unit_size_is_an_inconsistency() {
    let dir = tempfile::tempdir().unwrap();
    let db_dir = dir.path().join("db");

    {
        let db = Database::open(&db_dir, settings(&dir)).unwrap();
        drop(db.add_table("t", &[FieldSpec::new("v", FieldType::Bool, false)]).unwrap());
    }

    let other = DbSettings {
        max_unit_file_size: 256 * 1024,
        ..DbSettings::with_temp_dir(dir.path())
    };
    let db = Database::open(&db_dir, other).unwrap();
    let err = db.open_table("t").unwrap_err();
    assert_eq!(
        err.downcast_ref::<ErrorKind>(),
        Some(&ErrorKind::TableInconsistency)
    );
}
