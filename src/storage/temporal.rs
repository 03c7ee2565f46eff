//! # Temporal Container
//!
//! A [`TemporalContainer`] is scratch storage that lives in RAM while small
//! and silently promotes itself to disk when it outgrows its reservation.
//! Tables use it for every transient store: temporal tables' rows, spawned
//! tables, temporal index containers.
//!
//! ## Three States
//!
//! With *C* = reserved bytes / 2:
//!
//! | size N        | storage                                               |
//! |---------------|-------------------------------------------------------|
//! | 0 ≤ N ≤ C     | cache 1 only                                          |
//! | C < N ≤ 2C    | cache 1 + cache 2                                     |
//! | N > 2C        | spill family + both caches as a two-way write cache   |
//!
//! Each cache covers one aligned *C*-byte window. After the spill, a miss
//! reloads the cache opposite the last-used one (a single-bit clock),
//! flushing it first when dirty. A collapse that brings the size back under
//! 2C demotes the container to a pure-RAM state and deletes the spill file.
//!
//! ## Spill Files
//!
//! Spill families are named `wtemp<N>.tmp` under the settings temp
//! directory; `N` comes from a process-wide counter. They are created in
//! truncating mode and marked for removal at birth, so they never survive
//! their container.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::Result;
use tracing::debug;

use super::{Container, FileContainer};
use crate::config::DbSettings;
use crate::error::{fail, ErrorKind};

/// Allocates unique spill-file names across every temporal container of
/// the process.
static TEMPORAL_SEQUENCE: AtomicU64 = AtomicU64::new(1);

pub struct TemporalContainer {
    temp_dir: PathBuf,
    unit_size: u64,
    cache_size: u64,

    cache_1: Vec<u8>,
    cache_2: Option<Vec<u8>>,
    start_1: u64,
    end_1: u64,
    start_2: u64,
    end_2: u64,
    dirty_1: bool,
    dirty_2: bool,
    cache_1_last_used: bool,

    spill: Option<FileContainer>,
}

impl TemporalContainer {
    pub fn new(settings: &DbSettings) -> Self {
        let cache_size = (settings.temporal_reserved / 2).max(128) as u64;

        Self {
            temp_dir: settings.temp_dir.clone(),
            unit_size: settings.max_unit_file_size,
            cache_size,
            cache_1: vec![0; cache_size as usize],
            cache_2: None,
            start_1: 0,
            end_1: 0,
            start_2: 0,
            end_2: 0,
            dirty_1: false,
            dirty_2: false,
            cache_1_last_used: true,
            spill: None,
        }
    }

    /// True while no spill file backs this container.
    pub fn is_in_memory(&self) -> bool {
        self.spill.is_none()
    }

    fn spill_path(&self) -> PathBuf {
        let id = TEMPORAL_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        self.temp_dir.join(format!("wtemp{id}.tmp"))
    }

    /// Repositions one of the caches over the aligned window containing
    /// `position`, allocating cache 2 or the spill family on first need.
    fn fill_cache(&mut self, position: u64) -> Result<()> {
        let window = position - position % self.cache_size;

        debug_assert_eq!(self.start_1 % self.cache_size, 0);
        debug_assert_eq!(self.start_2 % self.cache_size, 0);

        if self.start_1 == window {
            return Ok(());
        }
        if self.cache_2.is_some() && self.start_2 == window {
            return Ok(());
        }

        if self.cache_2.is_none() && window == self.cache_size {
            debug_assert!(self.spill.is_none());

            self.cache_2 = Some(vec![0; self.cache_size as usize]);
            self.start_2 = self.cache_size;
            self.end_2 = self.cache_size;
            self.dirty_2 = false;
            self.cache_1_last_used = false;
            return Ok(());
        }

        if self.spill.is_none() {
            // Both windows are full and the access falls outside them:
            // promote to a spill family and reuse the caches over it.
            debug_assert_eq!(self.start_1, 0);
            debug_assert_eq!(self.end_1, self.cache_size);
            debug_assert_eq!(self.start_2, self.cache_size);
            debug_assert_eq!(self.end_2, 2 * self.cache_size);
            debug_assert_eq!(window, 2 * self.cache_size);

            let path = self.spill_path();
            debug!(path = %path.display(), "temporal container spilling to disk");

            let mut spill = FileContainer::create_truncating(&path, self.unit_size)?;
            spill.mark_for_removal();
            spill.write(0, &self.cache_1)?;
            spill.write(self.cache_size, self.cache_2.as_ref().unwrap())?;

            self.spill = Some(spill);
            self.dirty_1 = false;
            self.dirty_2 = false;
            self.start_1 = window;
            self.end_1 = window;
            self.cache_1_last_used = true;
            return Ok(());
        }

        // Spilled: reload the cache opposite the last-used one.
        let spill_size = self.spill.as_ref().unwrap().size();
        if self.cache_1_last_used {
            if self.dirty_2 {
                let (start, end) = (self.start_2, self.end_2);
                let buf = self.cache_2.as_ref().unwrap()[..(end - start) as usize].to_vec();
                self.spill.as_mut().unwrap().write(start, &buf)?;
                self.dirty_2 = false;
            }
            if window >= spill_size && self.dirty_1 {
                let (start, end) = (self.start_1, self.end_1);
                let buf = self.cache_1[..(end - start) as usize].to_vec();
                self.spill.as_mut().unwrap().write(start, &buf)?;
                self.dirty_1 = false;
            }

            let spill_size = self.spill.as_ref().unwrap().size();
            let to_read = self.cache_size.min(spill_size.saturating_sub(window)) as usize;
            let cache_2 = self.cache_2.as_mut().unwrap();
            self.spill
                .as_mut()
                .unwrap()
                .read(window, &mut cache_2[..to_read])?;

            self.start_2 = window;
            self.end_2 = window + to_read as u64;
            self.cache_1_last_used = false;
        } else {
            if self.dirty_1 {
                let (start, end) = (self.start_1, self.end_1);
                let buf = self.cache_1[..(end - start) as usize].to_vec();
                self.spill.as_mut().unwrap().write(start, &buf)?;
                self.dirty_1 = false;
            }
            if window >= spill_size && self.dirty_2 {
                let (start, end) = (self.start_2, self.end_2);
                let buf = self.cache_2.as_ref().unwrap()[..(end - start) as usize].to_vec();
                self.spill.as_mut().unwrap().write(start, &buf)?;
                self.dirty_2 = false;
            }

            let spill_size = self.spill.as_ref().unwrap().size();
            let to_read = self.cache_size.min(spill_size.saturating_sub(window)) as usize;
            self.spill
                .as_mut()
                .unwrap()
                .read(window, &mut self.cache_1[..to_read])?;

            self.start_1 = window;
            self.end_1 = window + to_read as u64;
            self.cache_1_last_used = true;
        }

        Ok(())
    }

    /// After a collapse, demotes a spilled container back to RAM when its
    /// content fits the caches again, or re-anchors both caches over the
    /// shrunken spill family.
    fn settle_after_collapse(&mut self, from: u64) -> Result<()> {
        let Some(spill) = self.spill.as_mut() else {
            return Ok(());
        };
        let spill_size = spill.size();

        if spill_size <= 2 * self.cache_size {
            if spill_size > self.cache_size {
                let cache_2 = self.cache_2.as_mut().unwrap();
                self.start_2 = self.cache_size;
                self.end_2 = spill_size;
                spill.read(self.start_2, &mut cache_2[..(spill_size - self.cache_size) as usize])?;
                self.dirty_2 = false;
            } else if self.cache_2.is_some() {
                self.start_2 = 0;
                self.end_2 = 0;
                self.dirty_2 = false;
                self.cache_1_last_used = true;
                self.cache_2 = None;
            }

            self.start_1 = 0;
            self.end_1 = spill_size.min(self.cache_size);
            spill.read(0, &mut self.cache_1[..self.end_1 as usize])?;
            self.dirty_1 = false;

            debug!("temporal container demoted back to RAM");
            self.spill = None;
        } else {
            // Refill both caches: one at the front, one around the seam.
            self.start_1 = 0;
            self.end_1 = self.cache_size;
            let cache_size = self.cache_size;
            spill.read(0, &mut self.cache_1[..cache_size as usize])?;
            self.dirty_1 = false;

            let mut window = from - from % self.cache_size;
            if window == 0 {
                window = self.cache_size;
            }

            let cache_2 = self.cache_2.as_mut().unwrap();
            self.start_2 = window;
            self.end_2 = spill_size.min(window + cache_size);
            spill.read(window, &mut cache_2[..(self.end_2 - window) as usize])?;
            self.dirty_2 = false;

            self.cache_1_last_used = false;
        }

        Ok(())
    }
}

impl Container for TemporalContainer {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.size() {
            fail!(
                ErrorKind::InvalidAccessPosition,
                "failed to read {} bytes at {offset} (of {}) from temporal container",
                buf.len(),
                self.size()
            );
        }

        let mut offset = offset;
        let mut read = 0usize;

        while read < buf.len() {
            if self.start_1 <= offset && offset < self.end_1 {
                let step = (buf.len() - read).min((self.end_1 - offset) as usize);
                let at = (offset - self.start_1) as usize;
                buf[read..read + step].copy_from_slice(&self.cache_1[at..at + step]);
                offset += step as u64;
                read += step;
            } else if self.cache_2.is_some() && self.start_2 <= offset && offset < self.end_2 {
                let step = (buf.len() - read).min((self.end_2 - offset) as usize);
                let at = (offset - self.start_2) as usize;
                let cache_2 = self.cache_2.as_ref().unwrap();
                buf[read..read + step].copy_from_slice(&cache_2[at..at + step]);
                offset += step as u64;
                read += step;
            } else {
                self.fill_cache(offset)?;
            }
        }

        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        if offset > self.size() {
            fail!(
                ErrorKind::InvalidAccessPosition,
                "failed to write {} bytes at {offset} (of {}) in temporal container",
                buf.len(),
                self.size()
            );
        }

        let mut offset = offset;
        let mut written = 0usize;

        while written < buf.len() {
            if self.start_1 <= offset && offset < self.start_1 + self.cache_size {
                let step = (buf.len() - written).min((self.start_1 + self.cache_size - offset) as usize);
                let at = (offset - self.start_1) as usize;
                self.cache_1[at..at + step].copy_from_slice(&buf[written..written + step]);
                self.end_1 = self.end_1.max(offset + step as u64);
                self.dirty_1 = true;
                offset += step as u64;
                written += step;
            } else if self.cache_2.is_some()
                && self.start_2 <= offset
                && offset < self.start_2 + self.cache_size
            {
                let step = (buf.len() - written).min((self.start_2 + self.cache_size - offset) as usize);
                let at = (offset - self.start_2) as usize;
                let cache_2 = self.cache_2.as_mut().unwrap();
                cache_2[at..at + step].copy_from_slice(&buf[written..written + step]);
                self.end_2 = self.end_2.max(offset + step as u64);
                self.dirty_2 = true;
                offset += step as u64;
                written += step;
            } else {
                self.fill_cache(offset)?;
            }
        }

        Ok(())
    }

    fn collapse(&mut self, from: u64, to: u64) -> Result<()> {
        let old_size = self.size();

        if to < from || to > old_size {
            fail!(
                ErrorKind::InvalidParameters,
                "failed to collapse [{from}, {to}) of {old_size} in temporal container"
            );
        }
        if from == to {
            return Ok(());
        }

        if self.spill.is_some() {
            // Push both caches down, let the spill family do the shifting,
            // then re-seat the caches over the result.
            if self.dirty_1 {
                let (start, end) = (self.start_1, self.end_1);
                let buf = self.cache_1[..(end - start) as usize].to_vec();
                self.spill.as_mut().unwrap().write(start, &buf)?;
                self.dirty_1 = false;
            }
            if self.dirty_2 {
                let (start, end) = (self.start_2, self.end_2);
                let buf = self.cache_2.as_ref().unwrap()[..(end - start) as usize].to_vec();
                self.spill.as_mut().unwrap().write(start, &buf)?;
                self.dirty_2 = false;
            }

            self.spill.as_mut().unwrap().collapse(from, to)?;
            self.settle_after_collapse(from)?;
        } else if self.cache_2.is_some() {
            let mut bounce = [0u8; 128];
            let mut src = to;
            let mut dst = from;

            while src < old_size {
                let step = ((old_size - src) as usize).min(bounce.len());
                self.read(src, &mut bounce[..step])?;
                self.write(dst, &bounce[..step])?;
                src += step as u64;
                dst += step as u64;
            }

            self.end_2 -= to - from;
            if self.end_2 <= self.cache_size {
                self.end_1 = self.end_2;
                self.start_2 = 0;
                self.end_2 = 0;
                self.cache_2 = None;
                self.cache_1_last_used = true;
            }
        } else {
            let remain = (self.end_1 - to) as usize;
            self.cache_1
                .copy_within(to as usize..(to as usize + remain), from as usize);
            self.end_1 -= to - from;
        }

        Ok(())
    }

    fn size(&self) -> u64 {
        debug_assert_eq!(self.start_1 % self.cache_size, 0);
        debug_assert_eq!(self.start_2 % self.cache_size, 0);

        let cached = self.end_1.max(self.end_2);
        match &self.spill {
            Some(spill) => cached.max(spill.size()),
            None => cached,
        }
    }

    fn mark_for_removal(&mut self) {
        // Spill files are born marked; the RAM caches vanish with the value.
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(spill) = self.spill.as_mut() {
            spill.flush()?;
        }
        Ok(())
    }
}
