//! # Repair Tests
//!
//! The offline pass against real damage: truncated rows containers,
//! unclean shutdowns, corrupted payloads, and the idempotency guarantee.

use stratadb::config::DbSettings;
use stratadb::table::Severity;
use stratadb::{Database, ErrorKind, FieldSpec, FieldType, Value};

fn settings(dir: &tempfile::TempDir) -> DbSettings {
    DbSettings {
        max_unit_file_size: 128 * 1024,
        ..DbSettings::with_temp_dir(dir.path())
    }
}

fn always_yes() -> impl FnMut(Severity, &str) -> bool {
    |severity, _| severity != Severity::Critical
}

#[test]
fn repair_after_rows_truncation_drops_the_torn_row() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("db"), settings(&dir)).unwrap();

    {
        let table = db
            .add_table("t", &[FieldSpec::new("v", FieldType::Int32, false)])
            .unwrap();
        table.create_index(0, 4, None).unwrap();
        for i in 0..100i32 {
            let row = table.add_row().unwrap();
            table.set(row, 0, &Value::Int32(i)).unwrap();
        }
        table.flush().unwrap();
    }

    // Chop one row slot off the rows container.
    let rows_path = dir.path().join("db").join("t_f");
    let len = std::fs::metadata(&rows_path).unwrap().len();
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&rows_path)
        .unwrap();
    file.set_len(len - 5).unwrap(); // row size for one i32 field: 1 + 4
    drop(file);

    let mut cb = always_yes();
    assert!(db.repair_table("t", &mut cb).unwrap());

    let table = db.open_table("t").unwrap();
    assert_eq!(table.rows_count(), 99);
    assert!(table.is_field_indexed(0));

    // The index reflects exactly the surviving 99 rows.
    let all = table
        .match_rows(&Value::Int32(0), &Value::Int32(i32::MAX), 0, u64::MAX, 0)
        .unwrap();
    assert_eq!(all.len(), 99);
    assert_eq!(table.get(98, 0).unwrap(), Value::Int32(98));
}

#[test]
fn repair_clears_the_in_use_flag() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("db"), settings(&dir)).unwrap();

    let table = db
        .add_table("crashed", &[FieldSpec::new("v", FieldType::Int64, false)])
        .unwrap();
    table.add_row().unwrap();
    std::mem::forget(table); // crash without a close

    let err = db.open_table("crashed").unwrap_err();
    assert_eq!(
        err.downcast_ref::<ErrorKind>(),
        Some(&ErrorKind::TableInUse)
    );

    let mut cb = always_yes();
    assert!(db.repair_table("crashed", &mut cb).unwrap());

    let table = db.open_table("crashed").unwrap();
    // The unflushed row never reached the header; repair keeps the
    // recorded count.
    assert_eq!(table.rows_count(), 0);
}

#[test]
fn repair_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("db"), settings(&dir)).unwrap();

    {
        let table = db
            .add_table(
                "twice",
                &[
                    FieldSpec::new("v", FieldType::Int32, false),
                    FieldSpec::new("note", FieldType::Text, false),
                ],
            )
            .unwrap();
        for i in 0..20 {
            let row = table.add_row().unwrap();
            table.set(row, 0, &Value::Int32(i)).unwrap();
            table
                .set(row, 1, &Value::Text(format!("note {i} {}", "x".repeat(i as usize * 10))))
                .unwrap();
        }
        table.flush().unwrap();
    }

    let mut cb = always_yes();
    assert!(db.repair_table("twice", &mut cb).unwrap());
    let first_pass = snapshot(&db, "twice");

    let mut cb = always_yes();
    assert!(db.repair_table("twice", &mut cb).unwrap());
    let second_pass = snapshot(&db, "twice");

    assert_eq!(first_pass, second_pass);
}

fn snapshot(db: &Database, name: &str) -> Vec<(Value, Value)> {
    let table = db.open_table(name).unwrap();
    let mut rows = Vec::new();
    for row in 0..table.rows_count() {
        rows.push((table.get(row, 0).unwrap(), table.get(row, 1).unwrap()));
    }
    rows
}

#[test]
fn corrupted_scalars_are_nulled_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("db"), settings(&dir)).unwrap();

    {
        let table = db
            .add_table("dates", &[FieldSpec::new("d", FieldType::Date, false)])
            .unwrap();
        for _ in 0..3 {
            let row = table.add_row().unwrap();
            table
                .set(
                    row,
                    0,
                    &Value::Date(stratadb::types::value::Date::new(2024, 6, 15)),
                )
                .unwrap();
        }
        table.flush().unwrap();
    }

    // Scribble an impossible month into row 1 (layout: 1 null byte,
    // then year i16, month, day).
    let rows_path = dir.path().join("db").join("dates_f");
    let mut raw = std::fs::read(&rows_path).unwrap();
    let row_size = 1 + 4;
    raw[row_size + 3] = 13;
    std::fs::write(&rows_path, &raw).unwrap();

    let mut fixes = 0;
    let mut cb = |severity: Severity, _msg: &str| {
        if severity == Severity::FixInfo {
            fixes += 1;
        }
        severity != Severity::Critical
    };
    assert!(db.repair_table("dates", &mut cb).unwrap());
    assert_eq!(fixes, 1);

    let table = db.open_table("dates").unwrap();
    assert_eq!(table.get(1, 0).unwrap(), Value::Null);
    assert_ne!(table.get(0, 0).unwrap(), Value::Null);
    assert_ne!(table.get(2, 0).unwrap(), Value::Null);
}

#[test]
fn fully_nulled_rows_become_reusable_after_repair() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("db"), settings(&dir)).unwrap();

    {
        let table = db
            .add_table("gaps", &[FieldSpec::new("v", FieldType::Int8, false)])
            .unwrap();
        for i in 0..6 {
            let row = table.add_row().unwrap();
            if i % 2 == 0 {
                table.set(row, 0, &Value::Int8(i as i8)).unwrap();
            }
        }
        table.flush().unwrap();
    }

    let mut cb = always_yes();
    assert!(db.repair_table("gaps", &mut cb).unwrap());

    let table = db.open_table("gaps").unwrap();
    assert_eq!(table.rows_count(), 6);

    // Rows 1, 3, 5 were all-null; add_row recycles them smallest-first.
    assert_eq!(table.add_row().unwrap(), 1);
    assert_eq!(table.add_row().unwrap(), 3);
    assert_eq!(table.add_row().unwrap(), 5);
    assert_eq!(table.add_row().unwrap(), 6);
}

#[test]
fn damaged_heap_references_are_nulled() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("db"), settings(&dir)).unwrap();

    {
        let table = db
            .add_table("texts", &[FieldSpec::new("t", FieldType::Text, false)])
            .unwrap();
        for i in 0..3 {
            let row = table.add_row().unwrap();
            table
                .set(row, 0, &Value::Text(format!("payload {i} {}", "y".repeat(200))))
                .unwrap();
        }
        table.flush().unwrap();
    }

    // Destroy the heap so every spilled reference dangles.
    let heap_path = dir.path().join("db").join("texts_v");
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&heap_path)
        .unwrap();
    file.set_len(64).unwrap(); // sentinel only
    drop(file);

    let mut cb = always_yes();
    assert!(db.repair_table("texts", &mut cb).unwrap());

    let table = db.open_table("texts").unwrap();
    for row in 0..3 {
        assert_eq!(table.get(row, 0).unwrap(), Value::Null);
    }
}
