// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Button-driven menus: paged lists and modal option dialogs.

use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;
use core::ops::Range;
use log::debug;

use crate::config::Layout;
use crate::container;
use crate::error::FileError;
use crate::hal::{join_path, Button, Display, Hal, Input, Row};
use crate::low_level::AppRecord;
use crate::table::{Direction, SortMode};

/// Rows per list page.
pub const ITEM_COUNT: usize = 4;

/// Selection within a paged list of `len` items. Movement wraps around at
/// both ends.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Cursor {
    index: usize,
    len: usize,
}

impl Cursor {
    pub fn new(len: usize) -> Self {
        Self { index: 0, len }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First index of the page holding the selection.
    pub fn page_start(&self) -> usize {
        self.index / ITEM_COUNT * ITEM_COUNT
    }

    /// Indices shown on the current page.
    pub fn visible(&self) -> Range<usize> {
        let start = self.page_start();
        start..usize::min(start + ITEM_COUNT, self.len)
    }

    /// Follows a list that grew or shrank, keeping the selection in range.
    pub fn set_len(&mut self, len: usize) {
        self.len = len;
        self.index = self.index.min(len.saturating_sub(1));
    }

    /// Applies a navigation button. Returns whether it was one.
    pub fn handle(&mut self, button: Button) -> bool {
        if self.len == 0 {
            return false;
        }
        let page = self.page_start();
        match button {
            Button::Down => {
                self.index = if self.index + 1 < self.len { self.index + 1 } else { 0 };
            }
            Button::Up => {
                self.index = if self.index > 0 { self.index - 1 } else { self.len - 1 };
            }
            Button::Right => {
                self.index = if page + ITEM_COUNT < self.len { page + ITEM_COUNT } else { 0 };
            }
            Button::Left => {
                self.index = if page >= ITEM_COUNT {
                    page - ITEM_COUNT
                } else {
                    // Wrap to the start of the last page.
                    (self.len - 1) / ITEM_COUNT * ITEM_COUNT
                };
            }
            _ => return false,
        }
        true
    }
}

/// Shows a modal list of `options` and waits for a choice. UP and DOWN move,
/// A picks, and B backs out when `cancellable`.
pub fn choose<U: Display + Input>(ui: &mut U, options: &[&str], cancellable: bool) -> Option<usize> {
    let mut selected = 0;
    loop {
        ui.dialog(options, selected);
        ui.present();
        match ui.wait_for_press(None) {
            Some(Button::Down) => selected = (selected + 1) % options.len(),
            Some(Button::Up) => selected = selected.checked_sub(1).unwrap_or(options.len() - 1),
            Some(Button::A) => return Some(selected),
            Some(Button::B) if cancellable => return None,
            _ => (),
        }
    }
}

/// Entries of the START dialog on the application list.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LauncherOption {
    Install,
    EraseSelected,
    EraseAll,
    EraseNvm,
    Sort,
    Restart,
}

impl LauncherOption {
    pub const ALL: [Self; 6] = [
        Self::Install,
        Self::EraseSelected,
        Self::EraseAll,
        Self::EraseNvm,
        Self::Sort,
        Self::Restart,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::Install => "Install from SD card",
            Self::EraseSelected => "Erase selected app",
            Self::EraseAll => "Erase all apps",
            Self::EraseNvm => "Erase NVM",
            Self::Sort => "Sort apps",
            Self::Restart => "Restart system",
        }
    }

    pub fn choose<U: Display + Input>(ui: &mut U) -> Option<Self> {
        let labels = Self::ALL.map(Self::label);
        choose(ui, &labels, true).map(|i| Self::ALL[i])
    }
}

/// Display orders offered by "Sort apps".
pub const SORT_OPTIONS: [(&str, SortMode, Direction); 5] = [
    ("Newest first", SortMode::Sequence, Direction::Descending),
    ("Oldest first", SortMode::Sequence, Direction::Ascending),
    ("Name A-Z", SortMode::Description, Direction::Ascending),
    ("Name Z-A", SortMode::Description, Direction::Descending),
    ("Flash order", SortMode::Offset, Direction::Ascending),
];

pub fn choose_sort<U: Display + Input>(ui: &mut U) -> Option<(SortMode, Direction)> {
    let labels = SORT_OPTIONS.map(|(label, _, _)| label);
    choose(ui, &labels, true).map(|i| (SORT_OPTIONS[i].1, SORT_OPTIONS[i].2))
}

/// Size in megabytes with two decimals, e.g. "1.25 MB", without floating
/// point.
pub fn format_size(bytes: u32) -> String {
    let hundredths = u64::from(bytes) * 100 / (1024 * 1024);
    format!("{}.{:02} MB", hundredths / 100, hundredths % 100)
}

/// Draws one page of the installed-application list.
pub fn draw_app_page<U: Display>(ui: &mut U, apps: &[AppRecord], cursor: &Cursor, free: u32) {
    ui.title("Applications", &format!("Free space: {}", format_size(free)));
    if apps.is_empty() {
        ui.message("No applications installed");
        ui.footer("[START] Menu");
    } else {
        for (line, i) in cursor.visible().enumerate() {
            let app = &apps[i];
            let detail = format!("{:#x} - {:#x}", app.start(), app.end());
            ui.row(line, i == cursor.index(), &Row {
                tile: Some(&app.tile[..]),
                title: app.description(),
                detail: &detail,
                warn: false,
            });
        }
    }
    ui.present();
}

/// Result of the file picker.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FileChoice {
    /// Full path of the chosen container.
    File(String),
    Back,
    /// MENU: leave for the launcher's own partition layout.
    BootLauncher,
}

/// Lists the containers in `layout.firmware_dir` and lets the user pick one.
pub fn choose_file<H: Hal>(hal: &mut H, layout: &Layout) -> Result<FileChoice, FileError> {
    let files = hal.list(layout.firmware_dir, Layout::FIRMWARE_EXTENSION)?;
    debug!("{} containers in {}", files.len(), layout.firmware_dir);
    let mut cursor = Cursor::new(files.len());
    loop {
        draw_file_page(hal, layout, &files, &cursor);
        let button = match hal.wait_for_press(None) {
            Some(b) => b,
            None => continue,
        };
        if cursor.handle(button) {
            continue;
        }
        match button {
            Button::A if !files.is_empty() => {
                return Ok(FileChoice::File(join_path(layout.firmware_dir, &files[cursor.index()])));
            }
            Button::B => return Ok(FileChoice::Back),
            Button::Menu => return Ok(FileChoice::BootLauncher),
            _ => (),
        }
    }
}

fn draw_file_page<H: Hal>(hal: &mut H, layout: &Layout, files: &[String], cursor: &Cursor) {
    hal.title("Select a file", "[A] Install   [B] Back   [MENU] Exit");
    if files.is_empty() {
        hal.message("SD Card Empty");
        hal.present();
        return;
    }

    // Only the visible page is parsed; each row shows what installing the
    // file would take.
    let mut rows: Vec<(usize, String)> = Vec::new();
    for i in cursor.visible() {
        let path = join_path(layout.firmware_dir, &files[i]);
        let detail = match container::parse(hal, &path, layout.reserved_nvs_size) {
            Ok(info) => format_size(info.flash_size),
            Err(_) => String::from("Invalid firmware"),
        };
        rows.push((i, detail));
    }
    for (line, (i, detail)) in rows.iter().enumerate() {
        hal.row(line, *i == cursor.index(), &Row {
            tile: None,
            title: &files[*i],
            detail,
            warn: detail.starts_with("Invalid"),
        });
    }
    hal.present();
}
