//! # Striped File Container
//!
//! A [`FileContainer`] presents one logical byte sequence striped over a
//! family of physical unit files named `<prefix>`, `<prefix>1`,
//! `<prefix>2`, … Unit *k* stores logical bytes `[k·S, (k+1)·S)` where *S*
//! is the family's maximum unit size.
//!
//! ## Family Invariants
//!
//! - every unit except the last has size exactly *S*
//! - the last unit has size ≤ *S*
//! - unit files are contiguous: no gaps in the numbering
//!
//! Opening an existing family re-verifies these invariants and fails with
//! `ContainerInvalid` if any unit violates them.
//!
//! ## Growth and Shrink
//!
//! Writes may extend the container only at its exact end; the next unit
//! file is allocated when a write starts at offset `units · S`. `collapse`
//! shifts the suffix down through a 1 KiB bounce buffer, truncates the new
//! last unit, and unlinks every unit file past it.
//!
//! ## Removal
//!
//! `mark_for_removal` defers deletion: when a marked container drops, every
//! unit file of the family is unlinked.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use tracing::{debug, warn};

use super::{Container, COLLAPSE_STEP};
use crate::error::{fail, ErrorKind};

#[derive(Debug)]
pub struct FileContainer {
    prefix: PathBuf,
    unit_size: u64,
    units: Vec<File>,
    truncate_mode: bool,
    to_remove: bool,
}

fn unit_path(prefix: &Path, unit: usize) -> PathBuf {
    if unit == 0 {
        prefix.to_path_buf()
    } else {
        let mut name = prefix.as_os_str().to_os_string();
        name.push(unit.to_string());
        PathBuf::from(name)
    }
}

fn file_size(file: &File) -> Result<u64> {
    Ok(file.metadata().wrap_err("failed to stat unit file")?.len())
}

impl FileContainer {
    /// Creates a fresh family. Fails if the base unit file already exists.
    pub fn create<P: AsRef<Path>>(prefix: P, unit_size: u64) -> Result<Self> {
        Self::new(prefix.as_ref(), unit_size, 0, false)
    }

    /// Creates a family, truncating any leftover base unit file. Used for
    /// spill files whose names may be recycled across process runs.
    pub fn create_truncating<P: AsRef<Path>>(prefix: P, unit_size: u64) -> Result<Self> {
        Self::new(prefix.as_ref(), unit_size, 0, true)
    }

    /// Opens an existing family claiming `units_count` unit files and
    /// verifies the size invariants of every unit.
    pub fn open<P: AsRef<Path>>(prefix: P, unit_size: u64, units_count: usize) -> Result<Self> {
        Self::new(prefix.as_ref(), unit_size, units_count, false)
    }

    fn new(prefix: &Path, unit_size: u64, units_count: usize, truncate: bool) -> Result<Self> {
        if unit_size == 0 {
            fail!(
                ErrorKind::InvalidParameters,
                "container '{}' cannot use a zero unit size",
                prefix.display()
            );
        }

        let mut units = Vec::with_capacity(units_count.max(1));

        if units_count > 0 {
            for unit in 0..units_count {
                let path = unit_path(prefix, unit);
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&path)
                    .wrap_err_with(|| format!("failed to open unit file '{}'", path.display()))?;
                units.push(file);
            }
        } else {
            let path = unit_path(prefix, 0);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .create_new(!truncate)
                .truncate(truncate)
                .open(&path)
                .wrap_err_with(|| format!("failed to create unit file '{}'", path.display()))?;
            units.push(file);
        }

        let container = Self {
            prefix: prefix.to_path_buf(),
            unit_size,
            units,
            truncate_mode: truncate,
            to_remove: false,
        };

        for unit in 0..container.units.len() {
            let size = file_size(&container.units[unit])?;
            let last = unit + 1 == container.units.len();

            if (!last && size != unit_size) || size > unit_size {
                fail!(
                    ErrorKind::ContainerInvalid,
                    "inconsistent container '{}': unit {unit} of {} has size {size} (max {unit_size})",
                    container.prefix.display(),
                    container.units.len()
                );
            }
        }

        debug!(
            prefix = %container.prefix.display(),
            units = container.units.len(),
            "opened container family"
        );

        Ok(container)
    }

    /// Truncates or extends the family rooted at `prefix` to exactly
    /// `desired_size` bytes, creating missing units and unlinking surplus
    /// ones. Used by repair before a family is reopened.
    pub fn fix<P: AsRef<Path>>(prefix: P, unit_size: u64, desired_size: u64) -> Result<()> {
        let prefix = prefix.as_ref();
        let units_needed = desired_size.div_ceil(unit_size) as usize;

        for unit in 0..units_needed {
            let path = unit_path(prefix, unit);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)
                .wrap_err_with(|| format!("failed to open unit file '{}'", path.display()))?;

            let this_unit = (desired_size - unit as u64 * unit_size).min(unit_size);
            file.set_len(this_unit)
                .wrap_err_with(|| format!("failed to resize unit file '{}'", path.display()))?;
        }

        // Unlink trailing units until the family numbering breaks.
        let mut unit = units_needed;
        while std::fs::remove_file(unit_path(prefix, unit)).is_ok() {
            unit += 1;
        }

        Ok(())
    }

    fn unit_count(&self) -> usize {
        self.units.len()
    }

    fn extend_family(&mut self) -> Result<()> {
        let unit = self.units.len();
        let path = unit_path(&self.prefix, unit);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .create_new(!self.truncate_mode)
            .truncate(self.truncate_mode)
            .open(&path)
            .wrap_err_with(|| format!("failed to allocate unit file '{}'", path.display()))?;

        debug!(prefix = %self.prefix.display(), unit, "extended container family");
        self.units.push(file);
        Ok(())
    }

    fn remove_unit_file(&mut self, unit: usize) -> Result<()> {
        let path = unit_path(&self.prefix, unit);
        if let Err(e) = std::fs::remove_file(&path) {
            fail!(
                ErrorKind::FileOsIoError,
                "failed to remove unit file '{}': {e}",
                path.display()
            );
        }
        Ok(())
    }
}

impl Container for FileContainer {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut offset = offset;
        let mut read = 0usize;

        if buf.is_empty() {
            return Ok(());
        }

        if offset + buf.len() as u64 > self.size() {
            fail!(
                ErrorKind::InvalidAccessPosition,
                "failed to read {} bytes at {offset} (of {}) from '{}'",
                buf.len(),
                self.size(),
                self.prefix.display()
            );
        }

        while read < buf.len() {
            let unit = (offset / self.unit_size) as usize;
            let unit_pos = offset % self.unit_size;
            let step = (buf.len() - read).min((self.unit_size - unit_pos) as usize);

            let file = &mut self.units[unit];
            file.seek(SeekFrom::Start(unit_pos))
                .wrap_err("seek failed")?;
            file.read_exact(&mut buf[read..read + step])
                .wrap_err_with(|| format!("short read in unit {unit}"))?;

            read += step;
            offset += step as u64;
        }

        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut offset = offset;
        let mut written = 0usize;

        while written < buf.len() {
            let unit = (offset / self.unit_size) as usize;
            let unit_pos = offset % self.unit_size;

            if unit > self.unit_count() || (unit == self.unit_count() && unit_pos != 0) {
                fail!(
                    ErrorKind::InvalidAccessPosition,
                    "failed to write at offset {offset}: unit {unit} of {} in '{}'",
                    self.unit_count(),
                    self.prefix.display()
                );
            }

            if unit == self.unit_count() {
                self.extend_family()?;
            }

            let step = (buf.len() - written).min((self.unit_size - unit_pos) as usize);

            let file = &mut self.units[unit];
            if file_size(file)? < unit_pos {
                fail!(
                    ErrorKind::InvalidAccessPosition,
                    "write at {offset} would leave a gap inside unit {unit} of '{}'",
                    self.prefix.display()
                );
            }

            file.seek(SeekFrom::Start(unit_pos))
                .wrap_err("seek failed")?;
            file.write_all(&buf[written..written + step])
                .wrap_err_with(|| format!("short write in unit {unit}"))?;

            written += step;
            offset += step as u64;
        }

        Ok(())
    }

    fn collapse(&mut self, from: u64, to: u64) -> Result<()> {
        let old_size = self.size();

        if to < from || to > old_size {
            fail!(
                ErrorKind::InvalidParameters,
                "failed to collapse [{from}, {to}) of {old_size} in '{}'",
                self.prefix.display()
            );
        }
        if from == to {
            return Ok(());
        }

        let mut src = to;
        let mut dst = from;
        let mut bounce = [0u8; COLLAPSE_STEP];

        while src < old_size {
            let step = ((old_size - src) as usize).min(bounce.len());
            self.read(src, &mut bounce[..step])?;
            self.write(dst, &bounce[..step])?;
            src += step as u64;
            dst += step as u64;
        }

        let new_size = old_size - (to - from);
        let keep = if new_size == 0 {
            0
        } else {
            ((new_size - 1) / self.unit_size) as usize + 1
        };

        if new_size > 0 {
            let last_unit_size = new_size - (keep as u64 - 1) * self.unit_size;
            self.units[keep - 1]
                .set_len(last_unit_size)
                .wrap_err("failed to truncate last unit")?;
        }

        while self.units.len() > keep {
            let unit = self.units.len() - 1;
            self.units.pop();
            self.remove_unit_file(unit)?;
        }

        Ok(())
    }

    fn size(&self) -> u64 {
        match self.units.last() {
            None => 0,
            Some(last) => {
                let last_size = last.metadata().map(|m| m.len()).unwrap_or(0);
                (self.units.len() as u64 - 1) * self.unit_size + last_size
            }
        }
    }

    fn mark_for_removal(&mut self) {
        self.to_remove = true;
    }

    fn flush(&mut self) -> Result<()> {
        for (unit, file) in self.units.iter().enumerate() {
            file.sync_all()
                .wrap_err_with(|| format!("failed to sync unit {unit}"))?;
        }
        Ok(())
    }
}

impl Drop for FileContainer {
    fn drop(&mut self) {
        if !self.to_remove {
            return;
        }

        let count = self.units.len();
        self.units.clear();

        for unit in 0..count {
            let path = unit_path(&self.prefix, unit);
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove unit file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn prefix(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempdir().unwrap();
        let mut c = FileContainer::create(prefix(&dir, "data"), 1024).unwrap();

        let payload: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        c.write(0, &payload).unwrap();

        let mut back = vec![0u8; payload.len()];
        c.read(0, &mut back).unwrap();

        assert_eq!(back, payload);
        assert_eq!(c.size(), payload.len() as u64);
    }

    #[test]
    fn writes_stripe_across_unit_files() {
        let dir = tempdir().unwrap();
        let base = prefix(&dir, "data");
        let mut c = FileContainer::create(&base, 1024).unwrap();

        c.write(0, &[0xAB; 2500]).unwrap();

        assert_eq!(c.size(), 2500);
        assert_eq!(std::fs::metadata(&base).unwrap().len(), 1024);
        assert_eq!(std::fs::metadata(unit_path(&base, 1)).unwrap().len(), 1024);
        assert_eq!(std::fs::metadata(unit_path(&base, 2)).unwrap().len(), 452);
    }

    #[test]
    fn collapse_shifts_suffix_and_drops_units() {
        let dir = tempdir().unwrap();
        let base = prefix(&dir, "data");
        let mut c = FileContainer::create(&base, 1024).unwrap();

        c.write(0, &[0xAB; 2500]).unwrap();
        c.collapse(500, 2000).unwrap();

        assert_eq!(c.size(), 2000);
        assert_eq!(std::fs::metadata(&base).unwrap().len(), 1024);
        assert_eq!(std::fs::metadata(unit_path(&base, 1)).unwrap().len(), 976);
        assert!(!unit_path(&base, 2).exists());
    }

    #[test]
    fn collapse_preserves_surrounding_bytes() {
        let dir = tempdir().unwrap();
        let mut c = FileContainer::create(prefix(&dir, "data"), 256).unwrap();

        let payload: Vec<u8> = (0..600u32).map(|i| (i % 256) as u8).collect();
        c.write(0, &payload).unwrap();
        c.collapse(100, 400).unwrap();

        let mut back = vec![0u8; 300];
        c.read(0, &mut back).unwrap();

        assert_eq!(&back[..100], &payload[..100]);
        assert_eq!(&back[100..], &payload[400..]);
    }

    #[test]
    fn read_past_end_is_rejected() {
        let dir = tempdir().unwrap();
        let mut c = FileContainer::create(prefix(&dir, "data"), 128).unwrap();
        c.write(0, &[1u8; 64]).unwrap();

        let err = c.read(32, &mut [0u8; 64]).unwrap_err();

        assert_eq!(
            err.downcast_ref::<ErrorKind>(),
            Some(&ErrorKind::InvalidAccessPosition)
        );
    }

    #[test]
    fn write_leaving_a_gap_is_rejected() {
        let dir = tempdir().unwrap();
        let mut c = FileContainer::create(prefix(&dir, "data"), 128).unwrap();
        c.write(0, &[1u8; 10]).unwrap();

        let err = c.write(11, &[2u8; 4]).unwrap_err();

        assert_eq!(
            err.downcast_ref::<ErrorKind>(),
            Some(&ErrorKind::InvalidAccessPosition)
        );
    }

    #[test]
    fn write_at_exact_end_grows() {
        let dir = tempdir().unwrap();
        let mut c = FileContainer::create(prefix(&dir, "data"), 128).unwrap();

        c.write(0, &[1u8; 128]).unwrap();
        c.write(128, &[2u8; 10]).unwrap();

        assert_eq!(c.size(), 138);
    }

    #[test]
    fn collapse_with_bad_range_is_rejected() {
        let dir = tempdir().unwrap();
        let mut c = FileContainer::create(prefix(&dir, "data"), 128).unwrap();
        c.write(0, &[1u8; 64]).unwrap();

        let err = c.collapse(40, 20).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ErrorKind>(),
            Some(&ErrorKind::InvalidParameters)
        );

        let err = c.collapse(0, 100).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ErrorKind>(),
            Some(&ErrorKind::InvalidParameters)
        );
    }

    #[test]
    fn reopen_verifies_unit_invariants() {
        let dir = tempdir().unwrap();
        let base = prefix(&dir, "data");
        {
            let mut c = FileContainer::create(&base, 512).unwrap();
            c.write(0, &[7u8; 1300]).unwrap();
        }

        let mut c = FileContainer::open(&base, 512, 3).unwrap();
        assert_eq!(c.size(), 1300);
        let mut back = vec![0u8; 1300];
        c.read(0, &mut back).unwrap();
        assert!(back.iter().all(|&b| b == 7));
    }

    #[test]
    fn reopen_with_short_middle_unit_fails() {
        let dir = tempdir().unwrap();
        let base = prefix(&dir, "data");
        {
            let mut c = FileContainer::create(&base, 512).unwrap();
            c.write(0, &[7u8; 1300]).unwrap();
        }
        // Damage unit 1 so it is no longer exactly one stripe long.
        let f = OpenOptions::new()
            .write(true)
            .open(unit_path(&base, 1))
            .unwrap();
        f.set_len(100).unwrap();

        let err = FileContainer::open(&base, 512, 3).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ErrorKind>(),
            Some(&ErrorKind::ContainerInvalid)
        );
    }

    #[test]
    fn marked_container_removes_family_on_drop() {
        let dir = tempdir().unwrap();
        let base = prefix(&dir, "data");
        {
            let mut c = FileContainer::create(&base, 256).unwrap();
            c.write(0, &[1u8; 600]).unwrap();
            c.mark_for_removal();
        }

        assert!(!base.exists());
        assert!(!unit_path(&base, 1).exists());
        assert!(!unit_path(&base, 2).exists());
    }

    #[test]
    fn fix_truncates_and_extends_to_desired_size() {
        let dir = tempdir().unwrap();
        let base = prefix(&dir, "data");
        {
            let mut c = FileContainer::create(&base, 256).unwrap();
            c.write(0, &[1u8; 1000]).unwrap();
        }

        FileContainer::fix(&base, 256, 300).unwrap();

        let c = FileContainer::open(&base, 256, 2).unwrap();
        assert_eq!(c.size(), 300);
        assert!(!unit_path(&base, 2).exists());
        assert!(!unit_path(&base, 3).exists());
    }

    #[test]
    fn fix_to_zero_leaves_no_files() {
        let dir = tempdir().unwrap();
        let base = prefix(&dir, "data");
        {
            let mut c = FileContainer::create(&base, 256).unwrap();
            c.write(0, &[1u8; 600]).unwrap();
        }

        FileContainer::fix(&base, 256, 0).unwrap();

        assert!(!base.exists());
        assert!(!unit_path(&base, 1).exists());
    }
}
