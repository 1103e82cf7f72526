// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Installing a firmware container into free flash.
//!
//! Installation runs through a fixed sequence of `Stage`s. Nothing touches
//! flash until the user has confirmed and the whole container has passed its
//! checksum; after that every failure is fatal, since there is no way to
//! undo a partial write. The application record is appended and saved only
//! once every partition is on flash, so the table never points at a
//! half-written application.

use alloc::format;
use alloc::vec::Vec;
use log::{debug, info};

use crate::config::Layout;
use crate::container::{self, ContainerPartition, FirmwareInfo};
use crate::error::{Area, Error};
use crate::freespace::{self, Placement};
use crate::hal::{file_name, Button, FirmwareFile, Hal};
use crate::low_level::{self, *};
use crate::partition_table;
use crate::table::AppTable;

/// Steps of an installation, in order.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Stage {
    ParseHeader,
    ChooseDestination,
    AwaitConfirm,
    VerifyChecksum,
    EraseAndWrite,
    CommitAppRecord,
    AwaitBootChoice,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum InstallOutcome {
    /// The user backed out before anything was written.
    Cancelled,
    /// The application is installed at table index `index`. `boot` is set
    /// if the user asked to start it right away.
    Installed { index: usize, boot: bool },
}

/// Progress bar value for `done` out of `total`.
pub fn percent(done: u32, total: u32) -> u8 {
    if total == 0 {
        100
    } else {
        (u64::from(done.min(total)) * 100 / u64::from(total)) as u8
    }
}

fn enter(stage: Stage) {
    debug!("install: {:?}", stage);
}

/// Installs the container at `path`.
///
/// `scratch` is the staging buffer for reads and block moves; one flash
/// block is ideal.
pub fn install<F: Flash, H: Hal>(
    table: &mut AppTable<F>,
    hal: &mut H,
    layout: &Layout,
    path: &str,
    scratch: &mut [u8],
) -> Result<InstallOutcome, Error<F::Error>> {
    enter(Stage::ParseHeader);
    hal.title("Install Application", "Size: N/A");
    hal.present();
    let info = container::parse(hal, path, layout.reserved_nvs_size)?;

    enter(Stage::ChooseDestination);
    if table.is_full() {
        return Err(Error::TableFull);
    }
    let extent = align_up(info.flash_size, FLASH_BLOCK_SIZE)
        .ok_or(Error::NoSpace { needed: info.flash_size, free: 0 })?;
    let placement = freespace::plan(table, extent)?;
    check_partition_table(table, layout, info.partitions.len())?;
    info!("'{}' needs {:#x}, placing {:?}", info.description(), extent, placement);

    enter(Stage::AwaitConfirm);
    let footer = format!("Size: {:#x}   Destination: {:#x}", extent, placement.offset());
    hal.title("Install Application", &footer);
    hal.header(info.description());
    hal.tile(&info.header.tile);
    hal.message("[START]");
    hal.footer("[B] Cancel");
    hal.present();
    loop {
        match hal.wait_for_press(None) {
            Some(Button::Start) => break,
            Some(Button::B) => {
                info!("install of '{}' cancelled", info.description());
                return Ok(InstallOutcome::Cancelled);
            }
            _ => (),
        }
    }

    enter(Stage::VerifyChecksum);
    hal.footer("");
    hal.message("Verifying ...");
    hal.present();
    let mut file = hal.open(path).map_err(Error::DataRead)?;
    let actual = container::compute_checksum(&mut file, &info, scratch, |done, total| {
        hal.progress(percent(done, total));
        hal.present();
    }).map_err(Error::DataRead)?;
    if actual != info.checksum {
        return Err(Error::ChecksumMismatch { expected: info.checksum, actual });
    }

    let start = match placement {
        Placement::Direct(offset) => offset,
        Placement::AfterDefrag(_) => {
            hal.message("Defragmenting ...");
            hal.present();
            freespace::find_free_block(table, extent, true, scratch, |done, total| {
                hal.progress(percent(done, total));
                hal.present();
            })?
        }
    };

    enter(Stage::EraseAndWrite);
    hal.set_led(true);
    let descriptors: Vec<PartitionDescriptor> = info.descriptors().copied().collect();
    let placed = partition_offsets(start, &descriptors).zip(&info.partitions);
    for (index, ((offset, _), part)) in placed.enumerate() {
        write_partition(table.flash_mut(), hal, &mut file, index, offset, part, scratch)?;
    }
    hal.set_led(false);

    enter(Stage::CommitAppRecord);
    let record = build_record(&info, file_name(path), start, extent);
    let index = table.append(record)?;
    table.save()?;
    info!("installed '{}' at {:#x}..{:#x}", info.description(), start, start + extent);

    enter(Stage::AwaitBootChoice);
    hal.message("Ready !");
    hal.footer("[B] Go Back   |   [A] Boot");
    hal.present();
    loop {
        match hal.wait_for_press(None) {
            Some(Button::A) => return Ok(InstallOutcome::Installed { index, boot: true }),
            Some(Button::B) => return Ok(InstallOutcome::Installed { index, boot: false }),
            _ => (),
        }
    }
}

/// Fails if the device partition table couldn't list the system partitions
/// plus `parts` more.
fn check_partition_table<F: Flash>(
    table: &mut AppTable<F>,
    layout: &Layout,
    parts: usize,
) -> Result<(), Error<F::Error>> {
    let first_app = table.first_app_offset();
    let entries = partition_table::read(table.flash_mut(), layout)?;
    let system = entries.iter().filter(|e| e.offset.get() < first_app).count();
    if system + parts > partition_table::MAX_ENTRIES {
        return Err(Error::PartitionTableFull);
    }
    Ok(())
}

fn write_partition<F: Flash, H: Hal>(
    flash: &mut F,
    hal: &mut H,
    file: &mut H::File,
    index: usize,
    offset: u32,
    part: &ContainerPartition,
    scratch: &mut [u8],
) -> Result<(), Error<F::Error>> {
    let d = &part.descriptor;
    let data_length = d.data_length.get();
    debug!("partition {} '{}' at {:#x}, {:#x} of {:#x} bytes",
        index, d.label(), offset, data_length, d.length.get());

    hal.message(&format!("Erasing ... ({})", index));
    hal.progress(0);
    hal.present();
    if d.length.get() != 0 {
        low_level::erase(flash, Area::AppData, offset, d.length.get())?;
    }

    let mut written = 0u32;
    while written < data_length {
        let want = usize::min(scratch.len(), (data_length - written) as usize);
        let buf = &mut scratch[..want];
        let n = file.read_at(part.data_offset + written, buf)
            .map_err(Error::DataRead)?;
        if n == 0 {
            break;
        }
        low_level::write(flash, Area::AppData, offset + written, &buf[..n])?;
        written += n as u32;

        hal.message(&format!("Writing ({})", index));
        hal.progress(percent(written, data_length));
        hal.present();
    }
    if written != data_length {
        return Err(Error::SizeMismatch { expected: data_length, actual: written });
    }
    hal.progress(100);
    hal.present();
    Ok(())
}

fn build_record(info: &FirmwareInfo, filename: &str, start: u32, extent: u32) -> AppRecord {
    let mut rec: AppRecord = erased();
    rec.flags = 0.into();
    rec.start_offset = start.into();
    rec.end_offset = (start + extent - 1).into();
    rec.description = info.header.description;
    set_c_str(&mut rec.filename, filename);
    rec.tile = info.header.tile;
    for (slot, d) in rec.parts.iter_mut().zip(info.descriptors()) {
        *slot = *d;
    }
    rec.parts_count = info.partitions.len() as u8;
    rec
}
