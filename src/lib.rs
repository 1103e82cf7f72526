// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware launcher core: keeps a table of applications installed side by
//! side in flash, installs new ones from firmware containers on an SD card,
//! and points the bootloader at the one the user picks.
//!
//! Everything board-specific sits behind two seams: `Flash` for the flash
//! device and `hal::Hal` for screen, buttons, card and power. `Launcher`
//! drives the whole thing.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod boot;
pub mod config;
pub mod container;
pub mod error;
pub mod freespace;
pub mod hal;
#[cfg(feature = "std")]
pub mod host;
pub mod install;
pub mod low_level;
pub mod menu;
pub mod nor;
pub mod partition_table;
pub mod table;

#[cfg(test)]
pub(crate) mod testutil;

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use log::{error, info, warn};

pub use crate::config::{Layout, Region};
pub use crate::error::{Area, Error, FileError, FlashOp, ParseError};
pub use crate::install::InstallOutcome;
pub use crate::low_level::{AppRecord, Flash};
pub use crate::table::{AppTable, Direction, SortMode};

use crate::freespace::FreeSpace;
use crate::hal::{Button, Hal};
use crate::low_level::FLASH_BLOCK_SIZE;
use crate::menu::{Cursor, FileChoice, LauncherOption};

/// The launcher: application table, board and layout, plus the user's
/// preferred display order.
pub struct Launcher<F, H> {
    table: AppTable<F>,
    hal: H,
    layout: Layout,
    scratch: Vec<u8>,
    order: (SortMode, Direction),
}

impl<F, H> Launcher<F, H>
where
    F: Flash,
    F::Error: fmt::Debug,
    H: Hal,
{
    /// Finds the application table through the device partition table (if
    /// `layout` doesn't already name it) and loads it.
    pub fn start(mut flash: F, hal: H, layout: Layout) -> Result<Self, Error<F::Error>> {
        let layout = layout.discover(&mut flash)?;
        let region = layout.app_table.ok_or(Error::NoAppTable)?;
        let mut table = AppTable::load(flash, region)?;
        table.limit_flash(layout.flash_capacity);
        info!("{} of {} app slots in use", table.len(), table.capacity());

        let mut launcher = Self {
            table,
            hal,
            layout,
            scratch: vec![0; FLASH_BLOCK_SIZE as usize],
            order: (SortMode::Sequence, Direction::Ascending),
        };
        launcher.reorder();
        Ok(launcher)
    }

    pub fn table(&self) -> &AppTable<F> {
        &self.table
    }

    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn into_parts(self) -> (F, H) {
        (self.table.into_inner(), self.hal)
    }

    pub fn order(&self) -> (SortMode, Direction) {
        self.order
    }

    /// Changes the display order. Not persisted; the table on flash keeps
    /// whatever order it was last saved in.
    pub fn set_order(&mut self, mode: SortMode, direction: Direction) {
        self.order = (mode, direction);
        self.reorder();
    }

    fn reorder(&mut self) {
        let (mode, direction) = self.order;
        self.table.sort(mode, direction);
    }

    pub fn free_space(&mut self) -> FreeSpace {
        let space = freespace::find_free_blocks(&mut self.table);
        self.reorder();
        space
    }

    /// Installs the container at `path`, interacting with the user through
    /// the board. On success the returned index is in display order.
    pub fn install(&mut self, path: &str) -> Result<InstallOutcome, Error<F::Error>> {
        let r = install::install(
            &mut self.table,
            &mut self.hal,
            &self.layout,
            path,
            &mut self.scratch,
        );
        let start = match r {
            Ok(InstallOutcome::Installed { index, .. }) => self.table.get(index).map(AppRecord::start),
            _ => None,
        };
        self.reorder();
        match (r, start) {
            (Ok(InstallOutcome::Installed { boot, .. }), Some(start)) => {
                let index = self.index_of(start).unwrap_or(0);
                Ok(InstallOutcome::Installed { index, boot })
            }
            (r, _) => r,
        }
    }

    fn index_of(&self, start: u32) -> Option<usize> {
        self.table.apps().iter().position(|a| a.start() == start)
    }

    /// Forgets the application at `index` and saves the table. Its flash is
    /// not erased; it just becomes free.
    pub fn remove(&mut self, index: usize) -> Result<AppRecord, Error<F::Error>> {
        if index >= self.table.len() {
            return Err(Error::NoSuchApp { index });
        }
        let rec = self.table.remove_at(index);
        info!("removing '{}' at {:#x}", rec.description(), rec.start());
        self.table.save()?;
        Ok(rec)
    }

    /// Forgets every application.
    pub fn erase_all(&mut self) -> Result<(), Error<F::Error>> {
        info!("removing all {} apps", self.table.len());
        self.table.clear();
        self.table.save()
    }

    /// Erases the shared settings partition below the applications. Returns
    /// `false` if the device has none.
    pub fn erase_nvm(&mut self) -> Result<bool, Error<F::Error>> {
        let first_app = self.table.first_app_offset();
        let entries = partition_table::read(self.table.flash_mut(), &self.layout)?;
        let nvs = match partition_table::find_nvs(&entries, first_app) {
            Some(r) => r,
            None => {
                warn!("no nvs partition below {:#x}", first_app);
                return Ok(false);
            }
        };
        info!("erasing nvs at {:#x}+{:#x}", nvs.offset, nvs.size);
        low_level::erase(self.table.flash_mut(), Area::Nvs, nvs.offset, nvs.size)?;
        Ok(true)
    }

    /// Packs every application towards the start of the application area.
    pub fn defragment(&mut self) -> Result<usize, Error<F::Error>> {
        let hal = &mut self.hal;
        hal.title("Defragmenting", "");
        hal.message("Defragmenting ...");
        hal.present();
        let r = freespace::defragment(&mut self.table, &mut self.scratch, |done, total| {
            hal.progress(install::percent(done, total));
            hal.present();
        });
        self.reorder();
        r
    }

    /// Rewrites the partition table and boot selector so the next reset
    /// starts the application at `index`, or the launcher itself for `None`.
    pub fn prepare_boot(&mut self, index: Option<usize>) -> Result<(), Error<F::Error>> {
        let first_app = self.table.first_app_offset();
        let app = match index {
            Some(i) => Some(self.table.get(i).cloned().ok_or(Error::NoSuchApp { index: i })?),
            None => None,
        };
        let flash = self.table.flash_mut();
        partition_table::apply(flash, &self.layout, first_app, app.as_ref())?;
        match app {
            Some(app) => boot::select_ota(flash, self.layout.boot_selector, boot::boot_slot(&app)),
            None => boot::clear(flash, self.layout.boot_selector),
        }
    }

    /// Prepares the boot and resets into it.
    pub fn boot(&mut self, index: Option<usize>) -> ! {
        if let Err(e) = self.prepare_boot(index) {
            self.fail(e);
        }
        self.hal.restart()
    }

    /// Shows `err` and stops for good.
    pub fn fail(&mut self, err: Error<F::Error>) -> ! {
        error!("fatal: {}", err);
        self.hal.set_led(false);
        self.hal.error(err.message());
        self.hal.present();
        self.hal.halt()
    }

    /// Shows a recoverable error and waits for a button before going back.
    /// Fatal errors go to `fail`.
    pub fn report(&mut self, err: Error<F::Error>) {
        if err.is_fatal() {
            self.fail(err);
        }
        warn!("{}", err);
        self.hal.error(err.message());
        self.hal.present();
        self.hal.wait_for_press(None);
    }

    fn check<T>(&mut self, r: Result<T, Error<F::Error>>) -> Option<T> {
        match r {
            Ok(v) => Some(v),
            Err(e) => {
                self.report(e);
                None
            }
        }
    }

    /// The application list. A boots the highlighted application, START
    /// opens the options dialog.
    pub fn run(&mut self) -> ! {
        let mut cursor = Cursor::new(self.table.len());
        loop {
            cursor.set_len(self.table.len());
            let free = self.free_space().total;
            menu::draw_app_page(&mut self.hal, self.table.apps(), &cursor, free);

            let button = match self.hal.wait_for_press(Some(100)) {
                Some(b) => b,
                None => continue,
            };
            if cursor.handle(button) {
                continue;
            }
            match button {
                Button::A if !cursor.is_empty() => self.boot(Some(cursor.index())),
                Button::Start => self.options(&cursor),
                _ => (),
            }
        }
    }

    fn options(&mut self, cursor: &Cursor) {
        let choice = match LauncherOption::choose(&mut self.hal) {
            Some(c) => c,
            None => return,
        };
        info!("option: {:?}", choice);
        match choice {
            LauncherOption::Install => self.install_from_card(),
            LauncherOption::EraseSelected => {
                if !cursor.is_empty() {
                    let r = self.remove(cursor.index());
                    self.check(r);
                }
            }
            LauncherOption::EraseAll => {
                let r = self.erase_all();
                self.check(r);
            }
            LauncherOption::EraseNvm => {
                let r = self.erase_nvm();
                if self.check(r) == Some(false) {
                    self.hal.error("NO NVS PARTITION");
                    self.hal.present();
                    self.hal.wait_for_press(None);
                }
            }
            LauncherOption::Sort => {
                if let Some((mode, direction)) = menu::choose_sort(&mut self.hal) {
                    self.set_order(mode, direction);
                }
            }
            LauncherOption::Restart => self.hal.restart(),
        }
    }

    fn install_from_card(&mut self) {
        let path = match menu::choose_file(&mut self.hal, &self.layout) {
            Ok(FileChoice::File(path)) => path,
            Ok(FileChoice::Back) => return,
            Ok(FileChoice::BootLauncher) => self.boot(None),
            Err(e) => return self.report(e.into()),
        };
        let r = self.install(&path);
        if let Some(InstallOutcome::Installed { index, boot: true }) = self.check(r) {
            self.boot(Some(index));
        }
    }
}
