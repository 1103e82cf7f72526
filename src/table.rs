// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The persistent table of installed applications.
//!
//! The table lives in its own flash partition as an array of fixed-size
//! `AppRecord` slots. Valid records always form a prefix of the array; the
//! first slot without the record magic ends the table. Updates rewrite the
//! whole region: it is small, and NOR flash can't be patched in place anyway.
//!
//! `AppTable` owns both the in-memory copy and the flash device, so every
//! other component reaches flash through it.

use alloc::vec;
use alloc::vec::Vec;
use core::cmp::Ordering;
use log::{debug, info};
use zerocopy::{AsBytes, FromBytes};

use crate::config::Region;
use crate::error::{Area, Error};
use crate::low_level::{self, *};

/// Orderings supported by `AppTable::sort`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SortMode {
    /// By extent start. Allocation and defragmentation need this order.
    Offset,
    /// By install sequence, i.e. oldest first.
    Sequence,
    /// By description, ignoring ASCII case.
    Description,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Ascending,
    Descending,
}

pub struct AppTable<F> {
    flash: F,
    region: Region,
    first_app_offset: u32,
    capacity: usize,
    apps: Vec<AppRecord>,
    next_seq: u32,
    /// Configured end of the application area, if below the device's.
    flash_limit: Option<u32>,
}

impl<F: Flash> AppTable<F> {
    /// Reads the table stored in `region`.
    ///
    /// Scanning stops at the first slot that does not hold a valid record;
    /// anything after it is ignored and will be overwritten by the next
    /// `save`.
    pub fn load(mut flash: F, region: Region) -> Result<Self, Error<F::Error>> {
        let capacity = region.size as usize / AppRecord::SIZE;
        let first_app_offset = align_up(region.end(), FLASH_BLOCK_SIZE)
            .ok_or(Error::NoAppTable)?;
        if capacity == 0 || first_app_offset > flash.capacity() {
            return Err(Error::NoAppTable);
        }

        let mut apps = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let mut rec = AppRecord::new_zeroed();
            let offset = region.offset + (i * AppRecord::SIZE) as u32;
            low_level::read(&mut flash, Area::AppTable, offset, rec.as_bytes_mut())?;
            if !rec.is_valid() {
                break;
            }
            apps.push(rec);
        }
        let next_seq = apps.iter()
            .map(|r| r.install_seq.get().wrapping_add(1))
            .max()
            .unwrap_or(0);

        info!("app table: {} of {} slots used, apps from {:#x}",
            apps.len(), capacity, first_app_offset);
        Ok(Self { flash, region, first_app_offset, capacity, apps, next_seq, flash_limit: None })
    }

    /// Writes the in-memory table back, replacing the whole region.
    pub fn save(&mut self) -> Result<(), Error<F::Error>> {
        let mut image = vec![ERASED_BYTE; self.capacity * AppRecord::SIZE];
        for (slot, rec) in image.chunks_exact_mut(AppRecord::SIZE).zip(&self.apps) {
            slot.copy_from_slice(rec.as_bytes());
        }

        debug!("saving app table ({} records)", self.apps.len());
        low_level::erase(&mut self.flash, Area::AppTable, self.region.offset, self.region.size)?;
        low_level::write(&mut self.flash, Area::AppTable, self.region.offset, &image)
    }

    /// Moves the extent of record `index` down to `new_start`, one flash
    /// block at a time starting from the low end, and updates the record.
    /// The table is not saved.
    ///
    /// `new_start` must be block-aligned and below the current start. The
    /// source and destination may overlap; each destination block is erased
    /// only once its contents have already been copied lower.
    ///
    /// `progress` is called with the number of bytes moved after each chunk.
    pub fn relocate(
        &mut self,
        index: usize,
        new_start: u32,
        scratch: &mut [u8],
        mut progress: impl FnMut(u32),
    ) -> Result<(), Error<F::Error>> {
        let rec = &self.apps[index];
        let (old_start, len) = (rec.start(), rec.extent_len());
        debug_assert!(new_start < old_start);
        debug_assert!(is_aligned(new_start, FLASH_BLOCK_SIZE));
        info!("moving '{}' {:#x} -> {:#x} ({:#x} bytes)",
            rec.description(), old_start, new_start, len);

        let chunk = usize::min(scratch.len(), FLASH_BLOCK_SIZE as usize);
        let mut moved = 0;
        while moved < len {
            let block = u32::min(FLASH_BLOCK_SIZE, len - moved);
            let dest = new_start + moved;
            low_level::erase(&mut self.flash, Area::AppData, dest, block)?;
            let mut done = 0;
            while done < block {
                let n = usize::min(chunk, (block - done) as usize);
                let buf = &mut scratch[..n];
                low_level::read(&mut self.flash, Area::AppData, old_start + moved + done, buf)?;
                low_level::write(&mut self.flash, Area::AppData, dest + done, buf)?;
                done += n as u32;
                progress(moved + done);
            }
            moved += block;
        }

        let rec = &mut self.apps[index];
        rec.start_offset = new_start.into();
        rec.end_offset = (new_start + len - 1).into();
        Ok(())
    }
}

impl<F> AppTable<F> {
    /// Reorders the in-memory table. Not saved.
    pub fn sort(&mut self, mode: SortMode, direction: Direction) {
        let cmp: fn(&AppRecord, &AppRecord) -> Ordering = match mode {
            SortMode::Offset => |a, b| a.start().cmp(&b.start()),
            SortMode::Sequence => |a, b| a.install_seq.get().cmp(&b.install_seq.get()),
            SortMode::Description => |a, b| {
                let a = a.description().bytes().map(|c| c.to_ascii_lowercase());
                let b = b.description().bytes().map(|c| c.to_ascii_lowercase());
                a.cmp(b)
            },
        };
        self.apps.sort_by(cmp);
        if direction == Direction::Descending {
            self.apps.reverse();
        }
    }

    /// Drops record `index`, shifting later records down. The application's
    /// flash is left alone and simply becomes free. Not saved.
    pub fn remove_at(&mut self, index: usize) -> AppRecord {
        let rec = self.apps.remove(index);
        info!("removed '{}' at {:#x}", rec.description(), rec.start());
        rec
    }

    /// Forgets every application. Not saved.
    pub fn clear(&mut self) {
        self.apps.clear();
    }

    pub fn apps(&self) -> &[AppRecord] {
        &self.apps
    }

    pub fn get(&self, index: usize) -> Option<&AppRecord> {
        self.apps.get(index)
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    /// Number of slots in the table region.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.apps.len() >= self.capacity
    }

    /// Lowest offset an application may occupy.
    pub fn first_app_offset(&self) -> u32 {
        self.first_app_offset
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    pub fn region(&self) -> Region {
        self.region
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn into_inner(self) -> F {
        self.flash
    }
}

impl<F: Flash> AppTable<F> {
    /// Adds `record` to the end of the table, stamping it valid with the
    /// next install sequence number. Returns its index. Not saved.
    pub fn append(&mut self, mut record: AppRecord) -> Result<usize, Error<F::Error>> {
        if self.is_full() {
            return Err(Error::TableFull);
        }
        debug_assert!(record.start() >= self.first_app_offset);
        debug_assert!(!self.apps.iter().any(|r| r.overlaps(&record)));

        record.magic = AppRecord::EXPECTED_MAGIC.into();
        record.install_seq = self.next_seq.into();
        self.next_seq = self.next_seq.wrapping_add(1);
        self.apps.push(record);
        Ok(self.apps.len() - 1)
    }

    /// One past the last byte applications may use.
    pub fn flash_capacity(&self) -> u32 {
        let device = self.flash.capacity();
        self.flash_limit.map_or(device, |limit| limit.min(device))
    }

    /// Keeps applications below `end`. Never raises the bound past the
    /// device's own capacity.
    pub fn limit_flash(&mut self, end: u32) {
        self.flash_limit = Some(end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    fn table_with(records: &[AppRecord]) -> AppTable<FakeFlash> {
        let mut table = AppTable::load(FakeFlash::new(TEST_CAPACITY), TEST_APP_TABLE).unwrap();
        for r in records {
            table.append(r.clone()).unwrap();
        }
        table.save().unwrap();
        table
    }

    /// Every slot past the valid records must read back as erased.
    fn check_prefix(table: &mut AppTable<FakeFlash>) {
        let count = table.len();
        let flash = table.flash_mut();
        for slot in 0..TEST_APP_TABLE.size as usize / AppRecord::SIZE {
            let offset = TEST_APP_TABLE.offset + (slot * AppRecord::SIZE) as u32;
            let bytes = flash.bytes(offset, AppRecord::SIZE as u32);
            let valid = u16::from_le_bytes([bytes[0], bytes[1]]) == AppRecord::EXPECTED_MAGIC;
            assert_eq!(valid, slot < count, "slot {slot}");
            if slot >= count {
                assert!(bytes.iter().all(|&b| b == ERASED_BYTE), "slot {slot}");
            }
        }
    }

    #[test]
    fn empty_flash_loads_empty() {
        let table = AppTable::load(FakeFlash::new(TEST_CAPACITY), TEST_APP_TABLE).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.capacity(), 7);
        assert_eq!(table.first_app_offset(), TEST_FIRST_APP);
        assert_eq!(table.next_seq(), 0);
    }

    #[test]
    fn flash_limit_never_exceeds_device() {
        let mut table = AppTable::load(FakeFlash::new(TEST_CAPACITY), TEST_APP_TABLE).unwrap();
        assert_eq!(table.flash_capacity(), TEST_CAPACITY);
        table.limit_flash(0x100000);
        assert_eq!(table.flash_capacity(), 0x100000);
        table.limit_flash(2 * TEST_CAPACITY);
        assert_eq!(table.flash_capacity(), TEST_CAPACITY);
    }

    #[test]
    fn table_region_too_small() {
        let r = AppTable::load(FakeFlash::new(TEST_CAPACITY), Region::new(0x20000, 0x1000));
        assert!(matches!(r, Err(Error::NoAppTable)));
    }

    #[test]
    fn save_then_load() {
        let mut table = table_with(&[
            record(0x30000, 0x10000, "A", 0),
            record(0x40000, 0x20000, "B", 0),
        ]);
        check_prefix(&mut table);

        let flash = table.into_inner();
        let table = AppTable::load(flash, TEST_APP_TABLE).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.apps()[1].description(), "B");
        assert_eq!(table.apps()[1].extent_len(), 0x20000);
        assert_eq!(table.apps()[1].install_seq.get(), 1);
        assert_eq!(table.next_seq(), 2);
    }

    #[test]
    fn load_stops_at_first_empty_slot() {
        let mut flash = FakeFlash::new(TEST_CAPACITY);
        let a = record(0x30000, 0x10000, "A", 4);
        let c = record(0x50000, 0x10000, "C", 9);
        flash.poke(TEST_APP_TABLE.offset, a.as_bytes());
        flash.poke(TEST_APP_TABLE.offset + 2 * AppRecord::SIZE as u32, c.as_bytes());

        let table = AppTable::load(flash, TEST_APP_TABLE).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.next_seq(), 5);
    }

    #[test]
    fn remove_middle_record() {
        let mut table = table_with(&[
            record(0x30000, 0x10000, "A", 0),
            record(0x40000, 0x10000, "B", 0),
            record(0x50000, 0x10000, "C", 0),
        ]);
        let removed = table.remove_at(1);
        assert_eq!(removed.description(), "B");
        table.save().unwrap();

        let names: Vec<&str> = table.apps().iter().map(|r| r.description()).collect();
        assert_eq!(names, ["A", "C"]);
        assert_eq!(table.len(), 2);
        check_prefix(&mut table);

        // The removed application's flash is not touched.
        let flash = table.flash_mut();
        assert!(flash.ops.iter().all(|&(_, off, _)| off < 0x40000 || off >= 0x50000));
    }

    #[test]
    fn append_when_full() {
        let records: Vec<AppRecord> = (0..7)
            .map(|i| record(0x30000 + i * 0x10000, 0x10000, "x", 0))
            .collect();
        let mut table = table_with(&records);
        assert!(table.is_full());
        check_prefix(&mut table);
        assert_eq!(
            table.append(record(0x100000, 0x10000, "y", 0)).unwrap_err(),
            Error::TableFull,
        );
    }

    #[test]
    fn sort_orders() {
        let mut table = table_with(&[
            record(0x50000, 0x10000, "beta", 0),
            record(0x30000, 0x10000, "Gamma", 0),
            record(0x40000, 0x10000, "alpha", 0),
        ]);
        let names = |t: &AppTable<FakeFlash>| -> Vec<String> {
            t.apps().iter().map(|r| r.description().to_string()).collect()
        };

        table.sort(SortMode::Offset, Direction::Ascending);
        assert_eq!(names(&table), ["Gamma", "alpha", "beta"]);
        table.sort(SortMode::Description, Direction::Ascending);
        assert_eq!(names(&table), ["alpha", "beta", "Gamma"]);
        table.sort(SortMode::Sequence, Direction::Descending);
        assert_eq!(names(&table), ["alpha", "Gamma", "beta"]);
        table.sort(SortMode::Offset, Direction::Descending);
        assert_eq!(names(&table), ["beta", "alpha", "Gamma"]);

        table.save().unwrap();
        check_prefix(&mut table);
    }

    #[test]
    fn relocate_overlapping() {
        let mut table = table_with(&[record(0x50000, 0x30000, "A", 0)]);
        let payload = pattern(0x30000, 3);
        table.flash_mut().poke(0x50000, &payload);

        let mut last = 0;
        table.relocate(0, 0x30000, &mut [0; 0x4000], |moved| last = moved).unwrap();

        assert_eq!(last, 0x30000);
        assert_eq!(table.apps()[0].start(), 0x30000);
        assert_eq!(table.apps()[0].end(), 0x5FFFF);
        assert_eq!(table.flash_mut().bytes(0x30000, 0x30000), &payload[..]);
    }

    #[test]
    fn relocate_failure_is_reported() {
        let mut table = table_with(&[record(0x50000, 0x20000, "A", 0)]);
        table.flash_mut().fail = Some((crate::error::FlashOp::Write, 0x40000));

        let err = table.relocate(0, 0x30000, &mut [0; 0x10000], |_| ()).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, Error::Flash { area: Area::AppData, offset: 0x40000, .. }));
    }

    #[test]
    fn save_failure_is_fatal() {
        let mut table = table_with(&[]);
        table.flash_mut().fail = Some((crate::error::FlashOp::Erase, TEST_APP_TABLE.offset));
        let err = table.save().unwrap_err();
        assert_eq!(err.message(), "APP TABLE ERASE ERROR");
        assert!(err.is_fatal());
    }
}
