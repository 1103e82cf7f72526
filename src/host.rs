// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host implementations of the collaborators, for tools and simulation:
//! the local filesystem as the SD card, and a flash image file as the flash
//! device.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::debug;

use crate::error::FileError;
use crate::hal::{has_extension, FileSystem, FirmwareFile};
use crate::low_level::{is_aligned, Flash, ERASED_BYTE, ERASE_BLOCK_SIZE};

fn file_error(e: io::Error) -> FileError {
    match e.kind() {
        io::ErrorKind::NotFound => FileError::NotFound,
        io::ErrorKind::UnexpectedEof => FileError::UnexpectedEof,
        _ => FileError::Io,
    }
}

/// Paths are used as given.
#[derive(Copy, Clone, Debug, Default)]
pub struct StdFileSystem;

pub struct StdFile(fs::File);

impl FirmwareFile for StdFile {
    fn size(&mut self) -> Result<u32, FileError> {
        let len = self.0.metadata().map_err(file_error)?.len();
        u32::try_from(len).map_err(|_| FileError::Io)
    }

    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize, FileError> {
        self.0.seek(SeekFrom::Start(offset.into())).map_err(file_error)?;
        let mut n = 0;
        while n < buf.len() {
            match self.0.read(&mut buf[n..]) {
                Ok(0) => break,
                Ok(k) => n += k,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
                Err(e) => return Err(file_error(e)),
            }
        }
        Ok(n)
    }
}

impl FileSystem for StdFileSystem {
    type File = StdFile;

    fn open(&mut self, path: &str) -> Result<StdFile, FileError> {
        fs::File::open(path).map(StdFile).map_err(file_error)
    }

    fn list(&mut self, dir: &str, extension: &str) -> Result<Vec<String>, FileError> {
        let entries = fs::read_dir(dir).map_err(|e| match file_error(e) {
            FileError::NotFound => FileError::NoMedia,
            other => other,
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(file_error)?;
            if !entry.file_type().map_err(file_error)?.is_file() {
                continue;
            }
            if let Ok(name) = entry.file_name().into_string() {
                if has_extension(&name, extension) {
                    names.push(name);
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// A flash device backed by an image file, with NOR semantics: writes can
/// only clear bits, and erase sets whole 4 KiB sectors back to `0xFF`.
pub struct FileFlash {
    file: fs::File,
    capacity: u32,
}

impl FileFlash {
    /// Opens (or creates) an image of `capacity` bytes. A new or short image
    /// is padded with erased bytes.
    pub fn open(path: impl AsRef<Path>, capacity: u32) -> io::Result<Self> {
        let mut file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        if len < u64::from(capacity) {
            debug!("padding flash image from {:#x} to {:#x}", len, capacity);
            file.seek(SeekFrom::Start(len))?;
            let pad = vec![ERASED_BYTE; (u64::from(capacity) - len) as usize];
            file.write_all(&pad)?;
        }
        Ok(Self { file, capacity })
    }

    fn check(&self, offset: u32, len: usize) -> io::Result<()> {
        if u64::from(offset) + len as u64 > u64::from(self.capacity) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "access past end of flash"));
        }
        Ok(())
    }
}

impl Flash for FileFlash {
    type Error = io::Error;

    fn capacity(&self) -> u32 {
        self.capacity
    }

    fn read(&mut self, offset: u32, dest: &mut [u8]) -> io::Result<()> {
        self.check(offset, dest.len())?;
        self.file.seek(SeekFrom::Start(offset.into()))?;
        self.file.read_exact(dest)
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> io::Result<()> {
        let mut cells = vec![0; data.len()];
        self.read(offset, &mut cells)?;
        for (cell, &b) in cells.iter_mut().zip(data) {
            *cell &= b;
        }
        self.file.seek(SeekFrom::Start(offset.into()))?;
        self.file.write_all(&cells)
    }

    fn erase(&mut self, offset: u32, length: u32) -> io::Result<()> {
        if !is_aligned(offset, ERASE_BLOCK_SIZE) || !is_aligned(length, ERASE_BLOCK_SIZE) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "unaligned erase"));
        }
        self.check(offset, length as usize)?;
        self.file.seek(SeekFrom::Start(offset.into()))?;
        self.file.write_all(&vec![ERASED_BYTE; length as usize])
    }
}
