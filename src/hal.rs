// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interfaces to the board: screen, buttons, SD card and power control.
//!
//! None of these are implemented in this crate for real hardware. The core
//! only ever calls into them; nothing here calls back.

use alloc::string::String;
use alloc::vec::Vec;

use crate::error::FileError;

//////////////////////////////////////////////////////////////////////////////
// Display.

/// One line of a list page.
#[derive(Copy, Clone, Debug)]
pub struct Row<'a> {
    pub tile: Option<&'a [u8]>,
    pub title: &'a str,
    pub detail: &'a str,
    /// Draw the detail line in the warning colour.
    pub warn: bool,
}

/// Fire-and-forget drawing primitives. Drawing happens into a back buffer;
/// nothing is visible until `present`.
pub trait Display {
    /// Clears the screen and draws the title bar and footer.
    fn title(&mut self, title: &str, footer: &str);
    fn header(&mut self, text: &str);
    fn footer(&mut self, text: &str);
    fn message(&mut self, text: &str);
    /// Progress bar, 0 to 100.
    fn progress(&mut self, percent: u8);
    /// Draws the centered preview tile for a container.
    fn tile(&mut self, tile: &[u8]);
    /// Draws line `line` of a list page.
    fn row(&mut self, line: usize, selected: bool, row: &Row<'_>);
    /// Draws a modal list of options with `selected` highlighted.
    fn dialog(&mut self, options: &[&str], selected: usize);
    /// Shows an error in the error style.
    fn error(&mut self, text: &str);
    fn present(&mut self);
}

//////////////////////////////////////////////////////////////////////////////
// Input.

/// Buttons, numbered by their bit in `ButtonState`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
pub enum Button {
    Up = 0,
    Right = 1,
    Down = 2,
    Left = 3,
    Select = 4,
    Start = 5,
    A = 6,
    B = 7,
    Menu = 8,
    Volume = 9,
}

impl Button {
    pub const COUNT: u32 = 10;

    pub fn mask(self) -> u16 {
        1 << self as u16
    }
}

/// Debounced snapshot of every button, one bit per `Button`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ButtonState(pub u16);

impl ButtonState {
    pub fn is_pressed(self, b: Button) -> bool {
        self.0 & b.mask() != 0
    }

    /// Lowest-numbered button that is down in `self` but was up in
    /// `previous`.
    pub fn first_edge(self, previous: ButtonState) -> Option<Button> {
        let edges = self.0 & !previous.0;
        (0..Button::COUNT)
            .find(|&i| edges & (1 << i) != 0)
            .and_then(|i| num_traits::FromPrimitive::from_u32(i))
    }
}

/// The debounced button state, maintained by some other execution context.
///
/// The state is read without synchronization; it is only ever polled, so a
/// stale read costs at most one more tick.
pub trait Input {
    fn state(&mut self) -> ButtonState;

    /// Yields for one polling tick.
    fn sleep_tick(&mut self);

    /// Blocks until a button goes from released to pressed, or until
    /// `timeout_ticks` ticks have elapsed. `None` waits forever.
    fn wait_for_press(&mut self, timeout_ticks: Option<u32>) -> Option<Button> {
        let mut previous = self.state();
        let mut elapsed = 0u32;
        loop {
            self.sleep_tick();
            let state = self.state();
            if let Some(b) = state.first_edge(previous) {
                return Some(b);
            }
            elapsed = elapsed.saturating_add(1);
            if timeout_ticks.map_or(false, |t| elapsed >= t) {
                return None;
            }
            previous = state;
        }
    }
}

//////////////////////////////////////////////////////////////////////////////
// Storage.

/// A readable, seekable file.
pub trait FirmwareFile {
    /// Total size in bytes.
    fn size(&mut self) -> Result<u32, FileError>;

    /// Reads up to `buf.len()` bytes at `offset`, returning how many were
    /// read. Returns fewer only at end of file.
    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize, FileError>;

    /// Fills `buf` from `offset`, or fails with `UnexpectedEof`.
    fn read_exact_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FileError> {
        let n = self.read_at(offset, buf)?;
        if n == buf.len() {
            Ok(())
        } else {
            Err(FileError::UnexpectedEof)
        }
    }
}

impl FirmwareFile for &[u8] {
    fn size(&mut self) -> Result<u32, FileError> {
        u32::try_from(self.len()).map_err(|_| FileError::Io)
    }

    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize, FileError> {
        let data = self.get(offset as usize..).unwrap_or(&[]);
        let n = usize::min(data.len(), buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }
}

/// The removable card holding firmware containers.
pub trait FileSystem {
    type File: FirmwareFile;

    fn open(&mut self, path: &str) -> Result<Self::File, FileError>;

    /// Names (not paths) of the non-hidden files in `dir` whose name ends in
    /// `extension`, compared case-insensitively, sorted.
    fn list(&mut self, dir: &str, extension: &str) -> Result<Vec<String>, FileError>;
}

/// Joins a directory and a file name.
pub fn join_path(dir: &str, name: &str) -> String {
    let mut s = String::with_capacity(dir.len() + 1 + name.len());
    s.push_str(dir.trim_end_matches('/'));
    s.push('/');
    s.push_str(name);
    s
}

/// Strips the directory part of a path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Case-insensitive suffix check used when filtering listings.
pub fn has_extension(name: &str, extension: &str) -> bool {
    name.len() >= extension.len()
        && !name.starts_with('.')
        && name.as_bytes()[name.len() - extension.len()..]
            .eq_ignore_ascii_case(extension.as_bytes())
}

//////////////////////////////////////////////////////////////////////////////
// Power.

pub trait Platform {
    /// Resets the device. Does not return.
    fn restart(&mut self) -> !;

    /// Stops in a visible error state until the user power-cycles.
    fn halt(&mut self) -> !;

    /// Status LED, on while flash is being written.
    fn set_led(&mut self, _on: bool) {}
}

/// Everything the launcher needs from the board, as one value.
pub trait Hal: Display + Input + FileSystem + Platform {}

impl<T: Display + Input + FileSystem + Platform> Hal for T {}
