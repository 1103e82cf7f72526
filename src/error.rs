// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types.
//!
//! There are exactly two tiers. Recoverable errors leave flash untouched and
//! send the user back to the previous menu. Fatal errors mean flash may be in
//! a state we can't reason about, and halt the device until it is reset; see
//! `Error::is_fatal`.

use core::fmt;

/// Which part of flash an access was aimed at, for reporting.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Area {
    AppTable,
    AppData,
    PartitionTable,
    BootSelector,
    Nvs,
}

/// Kind of raw flash access.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FlashOp {
    Read,
    Write,
    Erase,
}

/// Failures of the storage collaborator (SD card or host filesystem).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FileError {
    /// No card, or it could not be mounted.
    NoMedia,
    NotFound,
    /// The file ended before the requested bytes.
    UnexpectedEof,
    Io,
}

impl FileError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::NoMedia => "SD CARD ERROR",
            Self::NotFound => "FILE OPEN ERROR",
            Self::UnexpectedEof => "FILE READ ERROR",
            Self::Io => "FILE READ ERROR",
        }
    }
}

/// Reasons a firmware container is rejected.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ParseError {
    /// Signature mismatch, or the file is too short to hold a header.
    HeaderInvalid,
    /// A partition descriptor is truncated, uses the reserved type, or
    /// claims more data than it reserves or than the file holds.
    PartitionInvalid,
    /// More partitions than an application record can hold.
    PartitionLimitExceeded,
    /// The file could not be opened or read.
    Io(FileError),
}

impl From<FileError> for ParseError {
    fn from(e: FileError) -> Self {
        Self::Io(e)
    }
}

impl ParseError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::HeaderInvalid => "HEADER MATCH ERROR",
            Self::PartitionInvalid => "PARTITION ERROR",
            Self::PartitionLimitExceeded => "PARTITION COUNT ERROR",
            Self::Io(e) => e.message(),
        }
    }
}

/// Everything that can go wrong in the launcher. `E` is the flash device's
/// error type.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Error<E> {
    /// The chosen container is malformed. Recoverable.
    Parse(ParseError),
    /// Listing or opening files failed. Recoverable.
    File(FileError),
    /// Not enough free flash, even counting what defragmentation would
    /// recover. Recoverable.
    NoSpace { needed: u32, free: u32 },
    /// Every application table slot is in use. Recoverable.
    TableFull,
    /// No installed application at this index. Recoverable.
    NoSuchApp { index: usize },
    /// The application would not fit in the device partition table.
    /// Recoverable: detected before anything is erased.
    PartitionTableFull,
    /// The device partition table has no application-table partition, or it
    /// is too small to hold a single record. Fatal.
    NoAppTable,
    /// A raw flash access failed. Fatal.
    Flash { area: Area, op: FlashOp, offset: u32, cause: E },
    /// The container's trailing checksum disagrees with its contents. Fatal.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// Fewer bytes reached flash than the container promised. Fatal.
    SizeMismatch { expected: u32, actual: u32 },
    /// The container could not be read once installation was under way.
    /// Fatal.
    DataRead(FileError),
}

impl<E> From<ParseError> for Error<E> {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl<E> From<FileError> for Error<E> {
    fn from(e: FileError) -> Self {
        Self::File(e)
    }
}

impl<E> Error<E> {
    /// Whether this error must halt the device.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Parse(_)
            | Self::File(_)
            | Self::NoSpace { .. }
            | Self::TableFull
            | Self::NoSuchApp { .. }
            | Self::PartitionTableFull => false,
            Self::NoAppTable
            | Self::Flash { .. }
            | Self::ChecksumMismatch { .. }
            | Self::SizeMismatch { .. }
            | Self::DataRead(_) => true,
        }
    }

    /// Fixed short text shown to the user, naming the failing stage.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Parse(e) => e.message(),
            Self::File(e) => e.message(),
            Self::NoSpace { .. } => "NOT ENOUGH FLASH SPACE",
            Self::TableFull => "APP TABLE FULL",
            Self::NoSuchApp { .. } => "APP NOT FOUND",
            Self::PartitionTableFull => "TABLE SIZE ERROR",
            Self::NoAppTable => "NO APP TABLE ERROR",
            Self::Flash { area, op, .. } => flash_message(*area, *op),
            Self::ChecksumMismatch { .. } => "CHECKSUM MISMATCH ERROR",
            Self::SizeMismatch { .. } => "DATA SIZE ERROR",
            Self::DataRead(_) => "DATA READ ERROR",
        }
    }
}

fn flash_message(area: Area, op: FlashOp) -> &'static str {
    use Area::*;
    use FlashOp::*;
    match (area, op) {
        (AppTable, Read) => "APP TABLE READ ERROR",
        (AppTable, Write) => "APP TABLE WRITE ERROR",
        (AppTable, Erase) => "APP TABLE ERASE ERROR",
        (AppData, Read) => "READ ERROR",
        (AppData, Write) => "WRITE ERROR",
        (AppData, Erase) => "ERASE ERROR",
        (PartitionTable, Read) => "TABLE READ ERROR",
        (PartitionTable, Write) => "TABLE WRITE ERROR",
        (PartitionTable, Erase) => "TABLE ERASE ERROR",
        (BootSelector, _) => "BOOT SET ERROR",
        (Nvs, _) => "NVS ERASE ERROR",
    }
}

impl<E: fmt::Debug> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())?;
        match self {
            Self::NoSpace { needed, free } => {
                write!(f, " (need {needed:#x}, {free:#x} free)")
            }
            Self::NoSuchApp { index } => write!(f, " ({index})"),
            Self::Flash { offset, cause, .. } => {
                write!(f, " at {offset:#x}: {cause:?}")
            }
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, " (expected {expected:#010x}, got {actual:#010x})")
            }
            Self::SizeMismatch { expected, actual } => {
                write!(f, " (expected {expected:#x}, wrote {actual:#x})")
            }
            Self::DataRead(e) | Self::File(e) | Self::Parse(ParseError::Io(e)) => {
                write!(f, " ({e:?})")
            }
            _ => Ok(()),
        }
    }
}

#[cfg(any(test, feature = "std"))]
impl<E: fmt::Debug> std::error::Error for Error<E> {}
