// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device layout: where everything the launcher touches lives in flash.

use log::info;

use crate::error::Error;
use crate::low_level::{align_up, Flash, FLASH_BLOCK_SIZE};
use crate::partition_table;

/// A contiguous byte range of flash.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Region {
    pub offset: u32,
    pub size: u32,
}

impl Region {
    pub const fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }

    /// First byte past the region.
    pub fn end(&self) -> u32 {
        self.offset.saturating_add(self.size)
    }

    pub fn contains(&self, offset: u32) -> bool {
        offset >= self.offset && offset < self.end()
    }
}

/// Addresses, sizes and paths for one device.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Layout {
    /// Size of the flash device. Applications are placed below this, or
    /// below the device's reported capacity if that is smaller.
    pub flash_capacity: u32,
    /// Where the bootloader looks for the partition table.
    pub partition_table_offset: u32,
    /// Region holding the application table. `None` until found with
    /// `discover`.
    pub app_table: Option<Region>,
    /// The two `otadata` sectors holding the boot selector.
    pub boot_selector: Region,
    /// Size of the private settings partition given to each application.
    pub reserved_nvs_size: u32,
    /// Directory scanned for `.fw` containers.
    pub firmware_dir: &'static str,
}

impl Layout {
    pub const DEFAULT_FLASH_CAPACITY: u32 = 16 * 1024 * 1024;
    pub const DEFAULT_PARTITION_TABLE_OFFSET: u32 = 0x8000;
    pub const DEFAULT_BOOT_SELECTOR: Region = Region::new(0xD000, 0x2000);
    pub const DEFAULT_RESERVED_NVS_SIZE: u32 = 0x3000;
    pub const DEFAULT_FIRMWARE_DIR: &'static str = "/sd/odroid/firmware";
    /// Extension of firmware container files.
    pub const FIRMWARE_EXTENSION: &'static str = ".fw";

    /// Fills in `app_table` from the device partition table, unless it is
    /// already set.
    pub fn discover<F: Flash>(mut self, flash: &mut F) -> Result<Self, Error<F::Error>> {
        if self.app_table.is_none() {
            let entries = partition_table::read(flash, &self)?;
            let region = partition_table::find_app_table(&entries)
                .ok_or(Error::NoAppTable)?;
            info!("app table at {:#x}+{:#x}", region.offset, region.size);
            self.app_table = Some(region);
        }
        Ok(self)
    }

    /// Lowest offset an application may occupy: the end of the application
    /// table, rounded up to the block alignment.
    pub fn first_app_offset(&self) -> Option<u32> {
        align_up(self.app_table?.end(), FLASH_BLOCK_SIZE)
    }
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            flash_capacity: Self::DEFAULT_FLASH_CAPACITY,
            partition_table_offset: Self::DEFAULT_PARTITION_TABLE_OFFSET,
            app_table: None,
            boot_selector: Self::DEFAULT_BOOT_SELECTOR,
            reserved_nvs_size: Self::DEFAULT_RESERVED_NVS_SIZE,
            firmware_dir: Self::DEFAULT_FIRMWARE_DIR,
        }
    }
}
