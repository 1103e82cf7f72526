// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The device partition table read by the bootloader.
//!
//! The launcher exposes exactly one installed application at a time by
//! rewriting this table: system partitions stay, and the chosen application's
//! partitions are appended at their real flash offsets.

use alloc::vec;
use alloc::vec::Vec;
use core::mem::size_of;
use log::{debug, info};
use zerocopy::AsBytes;

use crate::config::{Layout, Region};
use crate::error::{Area, Error};
use crate::low_level::{self, *};

/// Bytes of the table the bootloader reads.
pub const TABLE_LENGTH: usize = 0xC00;

/// Entries that fit in `TABLE_LENGTH`.
pub const MAX_ENTRIES: usize = TABLE_LENGTH / size_of::<PartitionEntry>();

/// Reads the partitions listed in the device table, in order, stopping at
/// the first unprogrammed entry. Entries that aren't partitions (such as an
/// MD5 entry) are skipped.
pub fn read<F: Flash>(flash: &mut F, layout: &Layout) -> Result<Vec<PartitionEntry>, Error<F::Error>> {
    let mut raw = vec![0u8; TABLE_LENGTH];
    low_level::read(flash, Area::PartitionTable, layout.partition_table_offset, &mut raw)?;

    let mut entries = Vec::new();
    let mut rest = &raw[..];
    while !rest.is_empty() {
        let (entry, tail) = cast_prefix::<PartitionEntry>(rest);
        rest = tail;
        if entry.magic.get() == PartitionEntry::END_MAGIC {
            break;
        }
        if entry.is_partition() {
            entries.push(*entry);
        } else {
            debug!("skipping table entry with magic {:#06x}", entry.magic.get());
        }
    }
    Ok(entries)
}

/// The partition reserved for the application table.
pub fn find_app_table(entries: &[PartitionEntry]) -> Option<Region> {
    entries.iter()
        .find(|e| e.is_data(DataSubtype::AppTable))
        .map(|e| Region::new(e.offset.get(), e.size.get()))
}

/// The system settings partition, which lives below the applications.
pub fn find_nvs(entries: &[PartitionEntry], first_app_offset: u32) -> Option<Region> {
    entries.iter()
        .find(|e| e.is_data(DataSubtype::Nvs) && e.offset.get() < first_app_offset)
        .map(|e| Region::new(e.offset.get(), e.size.get()))
}

/// Builds the new table image: every entry below `first_app_offset`, then
/// `app`'s partitions, then erased entries.
pub fn build<E>(
    entries: &[PartitionEntry],
    first_app_offset: u32,
    app: Option<&AppRecord>,
) -> Result<Vec<u8>, Error<E>> {
    let system = entries.iter().filter(|e| e.offset.get() < first_app_offset);
    let exposed = app.into_iter().flat_map(|a| {
        partition_offsets(a.start(), a.partitions())
            .map(|(offset, part)| PartitionEntry::from_descriptor(offset, part))
    });

    let mut image = vec![ERASED_BYTE; TABLE_LENGTH];
    let mut n = 0;
    for entry in system.copied().chain(exposed) {
        if n == MAX_ENTRIES {
            return Err(Error::PartitionTableFull);
        }
        let at = n * size_of::<PartitionEntry>();
        image[at..at + size_of::<PartitionEntry>()].copy_from_slice(entry.as_bytes());
        n += 1;
    }
    Ok(image)
}

/// Rewrites the device table to expose `app`, or no application at all.
///
/// The current table is read and the new one fully built before the table
/// sector is erased, so a table that can't hold `app` leaves flash alone.
pub fn apply<F: Flash>(
    flash: &mut F,
    layout: &Layout,
    first_app_offset: u32,
    app: Option<&AppRecord>,
) -> Result<(), Error<F::Error>> {
    let entries = read(flash, layout)?;
    let image = build(&entries, first_app_offset, app)?;

    match app {
        Some(a) => info!("partition table -> '{}' at {:#x}", a.description(), a.start()),
        None => info!("partition table -> launcher only"),
    }
    low_level::erase(flash, Area::PartitionTable, layout.partition_table_offset, ERASE_BLOCK_SIZE)?;
    low_level::write(flash, Area::PartitionTable, layout.partition_table_offset, &image)
}
