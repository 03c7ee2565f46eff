//! # StrataDB - Paged Typed Table Store
//!
//! StrataDB is the storage engine of a database system: a paged, durable,
//! typed table store with secondary B-tree indices, a chained
//! variable-size heap for text and array payloads, a two-tier temporal
//! container used both as scratch space and as a persistence medium, and
//! a repair pass that rebuilds indices after an unclean shutdown.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │            Database (directory, settings)     │
//! ├───────────────────────────────────────────────┤
//! │  Table (rows, typed get/set, match, lifecycle)│
//! ├──────────────┬─────────────────┬──────────────┤
//! │ Row cache    │ Variable heap   │ Field B-trees│
//! ├──────────────┴─────────────────┴──────────────┤
//! │        Block cache (write-back, pinned refs)  │
//! ├───────────────────────────────────────────────┤
//! │  Containers: striped unit files / temporal    │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use stratadb::{Database, DbSettings, FieldSpec, FieldType, Value};
//!
//! let db = Database::open("./mydb", DbSettings::default())?;
//! let table = db.add_table(
//!     "people",
//!     &[
//!         FieldSpec::new("name", FieldType::Text, false),
//!         FieldSpec::new("age", FieldType::UInt8, false),
//!     ],
//! )?;
//!
//! let row = table.add_row()?;
//! table.set(row, 0, &Value::Text("ada".into()))?;
//! table.set(row, 1, &Value::UInt8(36))?;
//! table.create_index(1, 4, None)?;
//!
//! let adults = table.match_rows(&Value::UInt8(18), &Value::UInt8(u8::MAX), 0, u64::MAX, 1)?;
//! table.flush()?;
//! ```
//!
//! ## Durability Model
//!
//! Opening a persistent table marks it `MODIFIED` on disk; a successful
//! `flush` clears the mark. A crash leaves it set, and the next open
//! fails with [`ErrorKind::TableInUse`] until [`Database::repair_table`]
//! has validated the data and rebuilt the indices.
//!
//! ## Module Overview
//!
//! - [`storage`]: striped file containers, temporal containers, the
//!   write-back block cache
//! - [`heap`]: the chained variable-size heap with refcounted records
//! - [`btree`]: typed `(value, row)` B-trees and their node managers
//! - [`types`]: the closed field-type set, values, serialization, the
//!   wire codec
//! - [`table`]: tables and the repair pass
//! - [`database`]: the database handle
//! - [`config`]: injected settings
//! - [`error`]: typed error kinds carried inside `eyre` reports

pub mod btree;
pub mod config;
pub mod database;
pub mod error;
pub mod heap;
pub mod storage;
pub mod table;
pub mod types;

pub use config::DbSettings;
pub use database::Database;
pub use error::ErrorKind;
pub use table::{FieldSpec, FixCallback, Severity, Table};
pub use types::{ArrayValue, FieldType, Value};
