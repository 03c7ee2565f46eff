//! # Database Handle
//!
//! A [`Database`] owns one directory of persistent tables and the
//! settings every table in it shares. It is the surface the engine's
//! collaborators (compiler, server, shell) call into: open a database,
//! add or open tables, spawn temporal tables, enumerate, delete, and
//! run repair.
//!
//! ## Directory Layout
//!
//! ```text
//! database_dir/
//! ├── users            # table container (header, descriptors, rm tree)
//! ├── users_f          # rows container
//! ├── users_v          # variable-size heap
//! ├── users_age_bt     # index container for field "age"
//! └── users_f1, …      # unit files of each family, suffix k ≥ 1
//! ```
//!
//! There is no catalog file: tables are discovered by probing files for
//! the table signature.
//!
//! ## Exclusion
//!
//! Opening a table persists its `MODIFIED` flag set, so a second open of
//! the same table, from this process or another, fails with
//! `TableInUse` until the first instance flushes on close.

use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use tracing::debug;

use crate::config::DbSettings;
use crate::error::{fail, ErrorKind};
use crate::table::descriptor::valid_field_name;
use crate::table::{repair_table, FieldSpec, FixCallback, Table, TABLE_MAGIC};

pub struct Database {
    dir: PathBuf,
    settings: DbSettings,
}

impl Database {
    /// Opens (creating if needed) the database directory.
    pub fn open<P: AsRef<Path>>(dir: P, settings: DbSettings) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();

        std::fs::create_dir_all(&dir)
            .wrap_err_with(|| format!("failed to create database directory '{}'", dir.display()))?;

        debug!(dir = %dir.display(), "opened database");
        Ok(Self { dir, settings })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings(&self) -> &DbSettings {
        &self.settings
    }

    fn check_table_name(&self, name: &str) -> Result<()> {
        if !valid_field_name(name) {
            fail!(
                ErrorKind::InvalidParameters,
                "cannot use '{name}' as a table name"
            );
        }
        Ok(())
    }

    /// Creates a persistent table and opens it.
    pub fn add_table(&self, name: &str, fields: &[FieldSpec]) -> Result<Table> {
        self.check_table_name(name)?;
        Table::create_persistent(&self.dir.join(name), name, fields, &self.settings)
    }

    /// Opens an existing persistent table.
    pub fn open_table(&self, name: &str) -> Result<Table> {
        self.check_table_name(name)?;
        Table::open_persistent(&self.dir.join(name), name, &self.settings)
    }

    /// Creates a process-lifetime table under this database's settings.
    pub fn create_temporal_table(&self, name: &str, fields: &[FieldSpec]) -> Result<Table> {
        Table::create_temporal(name, fields, &self.settings)
    }

    /// Deletes a table and all its files. The table must be openable
    /// (a dirty table needs repair first).
    pub fn delete_table(&self, name: &str) -> Result<()> {
        let table = self.open_table(name)?;
        table.remove_from_database()?;
        drop(table);

        debug!(table = name, "table deleted");
        Ok(())
    }

    /// Names of the persistent tables in this database, sorted.
    pub fn table_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();

        for entry in std::fs::read_dir(&self.dir)
            .wrap_err_with(|| format!("failed to list '{}'", self.dir.display()))?
        {
            let entry = entry.wrap_err("failed to read directory entry")?;
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }

            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !valid_field_name(&name) {
                continue;
            }

            let mut magic = [0u8; 8];
            let readable = std::fs::File::open(entry.path())
                .and_then(|mut f| std::io::Read::read_exact(&mut f, &mut magic))
                .is_ok();
            if readable && &magic == TABLE_MAGIC {
                names.push(name);
            }
        }

        names.sort();
        Ok(names)
    }

    /// Runs the repair pass over one table. Returns `Ok(false)` when the
    /// callback aborted or the table is beyond repair.
    pub fn repair_table(&self, name: &str, callback: FixCallback) -> Result<bool> {
        self.check_table_name(name)?;
        repair_table(&self.dir, name, &self.settings, callback)
    }
}
