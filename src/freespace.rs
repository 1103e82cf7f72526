// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Free-space accounting, allocation and defragmentation.
//!
//! Free space is never stored. It is the complement of the installed
//! applications' extents within `[first_app_offset, flash capacity)`, so
//! anything not claimed by a valid record (including the remains of an
//! install that never committed) is free.

use alloc::vec::Vec;
use log::{debug, info};

use crate::error::Error;
use crate::low_level::{AppRecord, Flash};
use crate::table::{AppTable, Direction, SortMode};

/// A gap between applications.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FreeBlock {
    pub offset: u32,
    pub size: u32,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct FreeSpace {
    /// Gaps in ascending offset order.
    pub blocks: Vec<FreeBlock>,
    pub total: u32,
}

/// Where a new application will go.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Placement {
    /// A gap at this offset is already big enough.
    Direct(u32),
    /// Only after defragmenting, which leaves one gap starting here.
    AfterDefrag(u32),
}

impl Placement {
    pub fn offset(self) -> u32 {
        match self {
            Self::Direct(o) | Self::AfterDefrag(o) => o,
        }
    }
}

/// Walks `apps`, which must be sorted by offset, and collects the gaps
/// between them within `[lower, upper)`.
pub fn free_blocks(apps: &[AppRecord], lower: u32, upper: u32) -> FreeSpace {
    fn gap(space: &mut FreeSpace, from: u32, to: u32) {
        if to > from {
            space.blocks.push(FreeBlock { offset: from, size: to - from });
            space.total += to - from;
        }
    }

    let mut space = FreeSpace::default();
    let mut cursor = lower;
    for rec in apps {
        debug_assert!(rec.start() >= cursor, "records out of order or overlapping");
        gap(&mut space, cursor, rec.start());
        cursor = u32::max(cursor, rec.end().saturating_add(1));
    }
    gap(&mut space, cursor, upper);
    space
}

/// First block of at least `size` bytes, in offset order.
pub fn first_fit(blocks: &[FreeBlock], size: u32) -> Option<u32> {
    blocks.iter().find(|b| b.size >= size).map(|b| b.offset)
}

/// Sorts the table by offset and returns its free space.
pub fn find_free_blocks<F: Flash>(table: &mut AppTable<F>) -> FreeSpace {
    table.sort(SortMode::Offset, Direction::Ascending);
    free_blocks(table.apps(), table.first_app_offset(), table.flash_capacity())
}

/// Decides where `size` bytes would go without touching flash. Sorts the
/// table by offset.
pub fn plan<F: Flash>(
    table: &mut AppTable<F>,
    size: u32,
) -> Result<Placement, Error<F::Error>> {
    let space = find_free_blocks(table);
    if let Some(offset) = first_fit(&space.blocks, size) {
        return Ok(Placement::Direct(offset));
    }
    if space.total < size {
        return Err(Error::NoSpace { needed: size, free: space.total });
    }
    // Compaction packs every application against the bottom.
    let used: u32 = table.apps().iter().map(AppRecord::extent_len).sum();
    Ok(Placement::AfterDefrag(table.first_app_offset() + used))
}

/// Finds room for `size` bytes, first-fit. If no single gap is big enough
/// but the total is, and `allow_defrag` is set, defragments once and tries
/// again.
pub fn find_free_block<F: Flash>(
    table: &mut AppTable<F>,
    size: u32,
    allow_defrag: bool,
    scratch: &mut [u8],
    progress: impl FnMut(u32, u32),
) -> Result<u32, Error<F::Error>> {
    let space = find_free_blocks(table);
    if let Some(offset) = first_fit(&space.blocks, size) {
        return Ok(offset);
    }
    if !allow_defrag || space.total < size {
        return Err(Error::NoSpace { needed: size, free: space.total });
    }

    debug!("no gap of {:#x} in {:#x} free, defragmenting", size, space.total);
    defragment(table, scratch, progress)?;
    let space = find_free_blocks(table);
    first_fit(&space.blocks, size)
        .ok_or(Error::NoSpace { needed: size, free: space.total })
}

/// Moves applications down to close every gap, lowest first, then saves
/// the table if anything moved. Returns the number of applications moved.
///
/// `progress` gets bytes moved so far and the total to move.
pub fn defragment<F: Flash>(
    table: &mut AppTable<F>,
    scratch: &mut [u8],
    mut progress: impl FnMut(u32, u32),
) -> Result<usize, Error<F::Error>> {
    table.sort(SortMode::Offset, Direction::Ascending);

    // Dry run to size the job.
    let mut expected = table.first_app_offset();
    let mut total = 0;
    for rec in table.apps() {
        if rec.start() > expected {
            total += rec.extent_len();
        }
        expected += rec.extent_len();
    }
    if total == 0 {
        debug!("nothing to defragment");
        return Ok(0);
    }
    info!("defragmenting, {:#x} bytes to move", total);

    let mut expected = table.first_app_offset();
    let mut done = 0;
    let mut moved = 0;
    for i in 0..table.len() {
        let (start, len) = match table.get(i) {
            Some(rec) => (rec.start(), rec.extent_len()),
            None => break,
        };
        if start > expected {
            table.relocate(i, expected, scratch, |m| progress(done + m, total))?;
            done += len;
            moved += 1;
        }
        expected += len;
    }
    table.save()?;
    Ok(moved)
}
