// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! `Flash` on top of any `embedded_storage` NOR flash driver.
//!
//! The launcher reads and writes at byte granularity. Drivers with a larger
//! write unit get partial units padded with `0xFF`, which leaves the padded
//! bytes unchanged on NOR flash. Parts that forbid programming a unit twice
//! need writes aligned to their unit, which the launcher's block-sized
//! writes are.

use embedded_storage::nor_flash::{NorFlash, ReadNorFlash};

use crate::low_level::{Flash, ERASED_BYTE};

/// Largest read or write unit this adapter can pad.
pub const MAX_UNIT: usize = 32;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NorError<E> {
    Device(E),
    /// Erase range not aligned to the driver's erase size, or a unit size
    /// above `MAX_UNIT`.
    Unaligned,
}

pub struct NorFlashAdapter<T> {
    inner: T,
}

impl<T: NorFlash> NorFlashAdapter<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: NorFlash> Flash for NorFlashAdapter<T> {
    type Error = NorError<T::Error>;

    fn capacity(&self) -> u32 {
        u32::try_from(self.inner.capacity()).unwrap_or(u32::MAX)
    }

    fn read(&mut self, offset: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
        let unit = T::READ_SIZE;
        if unit <= 1 {
            return self.inner.read(offset, dest).map_err(NorError::Device);
        }
        if unit > MAX_UNIT {
            return Err(NorError::Unaligned);
        }
        let inner = &mut self.inner;
        for_units(offset, dest.len(), unit, |addr, range, whole| {
            if whole {
                inner.read(addr, &mut dest[range])
            } else {
                let mut buf = [0; MAX_UNIT];
                let skip = (offset as usize + range.start) % unit;
                inner.read(addr, &mut buf[..unit])?;
                let n = range.len();
                dest[range].copy_from_slice(&buf[skip..skip + n]);
                Ok(())
            }
        }).map_err(NorError::Device)
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), Self::Error> {
        let unit = T::WRITE_SIZE;
        if unit > MAX_UNIT {
            return Err(NorError::Unaligned);
        }
        let inner = &mut self.inner;
        for_units(offset, data.len(), unit, |addr, range, whole| {
            if whole {
                inner.write(addr, &data[range])
            } else {
                let mut buf = [ERASED_BYTE; MAX_UNIT];
                let skip = (offset as usize + range.start) % unit;
                buf[skip..skip + range.len()].copy_from_slice(&data[range]);
                inner.write(addr, &buf[..unit])
            }
        }).map_err(NorError::Device)
    }

    fn erase(&mut self, offset: u32, length: u32) -> Result<(), Self::Error> {
        let unit = T::ERASE_SIZE as u32;
        if offset % unit != 0 || length % unit != 0 {
            return Err(NorError::Unaligned);
        }
        self.inner.erase(offset, offset + length).map_err(NorError::Device)
    }
}

/// Splits `len` bytes at `offset` into a partial leading unit, a run of whole
/// units and a partial trailing unit, calling `f` with the device address,
/// the byte range within the caller's buffer, and whether the range covers
/// whole units exactly. For partial units the address is the unit's start.
fn for_units<E>(
    offset: u32,
    len: usize,
    unit: usize,
    mut f: impl FnMut(u32, core::ops::Range<usize>, bool) -> Result<(), E>,
) -> Result<(), E> {
    let mut pos = 0;
    let head = offset as usize % unit;
    if head != 0 && len > 0 {
        let n = usize::min(unit - head, len);
        f(offset - head as u32, 0..n, false)?;
        pos = n;
    }
    let whole = (len - pos) / unit * unit;
    if whole > 0 {
        f(offset + pos as u32, pos..pos + whole, true)?;
        pos += whole;
    }
    if pos < len {
        f(offset + pos as u32, pos..len, false)?;
    }
    Ok(())
}
