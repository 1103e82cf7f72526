// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Firmware container (`.fw`) parsing and verification.
//!
//! A container is a `FirmwareHeader`, then any number of
//! `PartitionDescriptor`s each followed by its payload, then a little-endian
//! CRC-32 of everything before it. Parsing reads descriptors only and seeks
//! over payloads; the file is never loaded whole.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem::size_of;
use log::{debug, warn};
use zerocopy::{AsBytes, FromBytes};

use crate::error::{FileError, ParseError};
use crate::hal::{FileSystem, FirmwareFile};
use crate::low_level::*;

/// Leading bytes of every container.
pub const SIGNATURE: &[u8; SIGNATURE_SIZE] = b"ODROIDGO_FIRMWARE_V00_01";

/// Size of the trailing checksum.
pub const CHECKSUM_SIZE: u32 = 4;

/// Checksum used over container files (zlib's `crc32`).
pub static CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Checksum of an in-memory byte string, as stored in a container trailer.
pub fn checksum(bytes: &[u8]) -> u32 {
    CRC.checksum(bytes)
}

/// One partition as found in a container.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ContainerPartition {
    /// The descriptor with `length` already rounded up to the erase
    /// granularity (and possibly shrunk to make room for settings).
    pub descriptor: PartitionDescriptor,
    /// File offset of the first payload byte.
    pub data_offset: u32,
}

/// Everything the installer needs to know about a container, gathered in one
/// parsing pass.
#[derive(Clone, Debug)]
pub struct FirmwareInfo {
    pub header: Box<FirmwareHeader>,
    /// Partitions in file order, plus the synthetic settings partition when
    /// one was added.
    pub partitions: Vec<ContainerPartition>,
    /// Flash space needed by all partitions together.
    pub flash_size: u32,
    /// The trailing checksum as stored in the file.
    pub checksum: u32,
    /// File offset of the first partition descriptor.
    pub data_start_offset: u32,
    pub file_size: u32,
}

impl FirmwareInfo {
    pub fn description(&self) -> &str {
        self.header.description()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &PartitionDescriptor> + '_ {
        self.partitions.iter().map(|p| &p.descriptor)
    }

    /// Bytes of payload the container carries.
    pub fn data_size(&self) -> u32 {
        self.partitions.iter().map(|p| p.descriptor.data_length.get()).sum()
    }
}

/// Opens `path` on `fs` and parses it; see `parse_file`.
pub fn parse<S: FileSystem>(
    fs: &mut S,
    path: &str,
    reserved_nvs_size: u32,
) -> Result<FirmwareInfo, ParseError> {
    let mut file = fs.open(path)?;
    parse_file(&mut file, reserved_nvs_size)
}

/// Validates and indexes a container.
///
/// Every application gets a private settings partition of
/// `reserved_nvs_size` bytes, rounded up to the erase block, appended after
/// its own partitions. When the
/// last partition is an application with at least that much unused space,
/// the space is taken from it instead of growing the total.
pub fn parse_file<F: FirmwareFile>(
    file: &mut F,
    reserved_nvs_size: u32,
) -> Result<FirmwareInfo, ParseError> {
    const DESCRIPTOR_SIZE: u32 = size_of::<PartitionDescriptor>() as u32;

    let file_size = file.size()?;
    let header_size = FirmwareHeader::SIZE as u32;
    if file_size < header_size + CHECKSUM_SIZE {
        return Err(ParseError::HeaderInvalid);
    }

    let mut header = Box::new(FirmwareHeader::new_zeroed());
    file.read_exact_at(0, header.as_bytes_mut())?;
    if &header.signature != SIGNATURE {
        return Err(ParseError::HeaderInvalid);
    }
    header.description[DESCRIPTION_SIZE - 1] = 0;
    debug!("container '{}', {:#x} bytes", header.description(), file_size);

    let data_end = file_size - CHECKSUM_SIZE;
    let mut partitions: Vec<ContainerPartition> = Vec::new();
    let mut pos = header_size;
    while pos < data_end {
        if partitions.len() == PARTS_MAX {
            return Err(ParseError::PartitionLimitExceeded);
        }
        if data_end - pos < DESCRIPTOR_SIZE {
            return Err(ParseError::PartitionInvalid);
        }
        let mut descriptor = PartitionDescriptor::new_zeroed();
        file.read_exact_at(pos, descriptor.as_bytes_mut())?;
        pos += DESCRIPTOR_SIZE;

        let data_length = descriptor.data_length.get();
        let fits_file = pos.checked_add(data_length)
            .map_or(false, |end| end <= file_size);
        if descriptor.kind == PARTITION_TYPE_ERASED
            || !fits_file
            || data_length > descriptor.length.get()
        {
            warn!("bad partition {} in container: {:?}", partitions.len(), descriptor);
            return Err(ParseError::PartitionInvalid);
        }
        let length = align_up(descriptor.length.get(), ERASE_BLOCK_SIZE)
            .ok_or(ParseError::PartitionInvalid)?;
        descriptor.length = length.into();

        partitions.push(ContainerPartition { descriptor, data_offset: pos });
        pos += data_length;
    }
    if partitions.is_empty() {
        return Err(ParseError::PartitionInvalid);
    }

    add_settings_partition(&mut partitions, reserved_nvs_size, data_end);

    let flash_size = partitions.iter()
        .try_fold(0u32, |sum, p| sum.checked_add(p.descriptor.length.get()))
        .ok_or(ParseError::PartitionInvalid)?;

    let mut trailer = [0; CHECKSUM_SIZE as usize];
    file.read_exact_at(data_end, &mut trailer)?;

    Ok(FirmwareInfo {
        header,
        partitions,
        flash_size,
        checksum: u32::from_le_bytes(trailer),
        data_start_offset: header_size,
        file_size,
    })
}

fn add_settings_partition(
    partitions: &mut Vec<ContainerPartition>,
    reserved_nvs_size: u32,
    data_end: u32,
) {
    // Partitions are erased whole, so the settings size is too.
    let nvs_size = match align_up(reserved_nvs_size, ERASE_BLOCK_SIZE) {
        Some(n) if n > 0 => n,
        _ => return,
    };
    if partitions.len() >= PARTS_MAX
        || partitions.iter().any(|p| p.descriptor.is_nvs())
    {
        return;
    }
    if let Some(last) = partitions.last_mut() {
        let d = &mut last.descriptor;
        let slack = d.length.get() - d.data_length.get();
        if d.is_app() && slack >= nvs_size {
            debug!("taking settings space from '{}'", d.label());
            d.length = (d.length.get() - nvs_size).into();
        }
    }
    partitions.push(ContainerPartition {
        descriptor: PartitionDescriptor::nvs(nvs_size),
        data_offset: data_end,
    });
}

/// Streams the whole container, except its trailer, through the checksum.
///
/// `scratch` sets the read size. `progress` is called with the number of
/// bytes summed so far and the total.
pub fn compute_checksum<F: FirmwareFile>(
    file: &mut F,
    info: &FirmwareInfo,
    scratch: &mut [u8],
    mut progress: impl FnMut(u32, u32),
) -> Result<u32, FileError> {
    let total = info.file_size - CHECKSUM_SIZE;
    let mut digest = CRC.digest();
    let mut offset = 0;
    while offset < total {
        let n = usize::min(scratch.len(), (total - offset) as usize);
        file.read_exact_at(offset, &mut scratch[..n])?;
        digest.update(&scratch[..n]);
        offset += n as u32;
        progress(offset, total);
    }
    Ok(digest.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    fn parse_bytes(bytes: &[u8], nvs: u32) -> Result<FirmwareInfo, ParseError> {
        let mut f = bytes;
        parse_file(&mut f, nvs)
    }

    #[test]
    fn settings_partition_appended_without_shrink() {
        let file = build_container("Game", &[app_part(0x9000, 0x8000, 1)]);
        let info = parse_bytes(&file, 0x3000).unwrap();

        assert_eq!(info.description(), "Game");
        assert_eq!(info.partitions.len(), 2);
        assert_eq!(info.partitions[0].descriptor.length.get(), 0x9000);
        assert!(info.partitions[1].descriptor.is_nvs());
        assert_eq!(info.partitions[1].descriptor.length.get(), 0x3000);
        assert_eq!(info.flash_size, 0xC000);
        assert_eq!(info.data_start_offset, FirmwareHeader::SIZE as u32);
        assert_eq!(info.partitions[0].data_offset, FirmwareHeader::SIZE as u32 + 32);
    }

    #[test]
    fn slack_in_last_app_partition_is_reused() {
        let file = build_container("Game", &[app_part(0x10000, 0x8000, 1)]);
        let info = parse_bytes(&file, 0x3000).unwrap();

        assert_eq!(info.partitions[0].descriptor.length.get(), 0xD000);
        assert_eq!(info.flash_size, 0x10000);
    }

    #[test]
    fn lengths_round_up_to_erase_blocks() {
        let file = build_container("Game", &[
            app_part(0x8001, 0x100, 1),
            data_part(0x81, "data", 0x10, 0x10),
        ]);
        let info = parse_bytes(&file, 0x3000).unwrap();

        assert_eq!(info.partitions[0].descriptor.length.get(), 0x9000);
        assert_eq!(info.partitions[1].descriptor.length.get(), 0x1000);
        assert_eq!(info.flash_size, 0x9000 + 0x1000 + 0x3000);
        assert_eq!(info.data_size(), 0x110);
    }

    #[test]
    fn settings_size_rounds_up_to_erase_blocks() {
        let file = build_container("Game", &[app_part(0x9000, 0x8000, 1)]);
        let info = parse_bytes(&file, 0x2800).unwrap();
        assert_eq!(info.partitions[1].descriptor.length.get(), 0x3000);
        assert_eq!(info.flash_size, 0xC000);

        // Slack is compared against the rounded size.
        let file = build_container("Game", &[app_part(0x10000, 0xD000, 1)]);
        let info = parse_bytes(&file, 0x2800).unwrap();
        assert_eq!(info.partitions[0].descriptor.length.get(), 0xD000);
        assert_eq!(info.partitions[1].descriptor.length.get(), 0x3000);
        assert_eq!(info.flash_size, 0x10000);
        for p in &info.partitions {
            assert!(is_aligned(p.descriptor.length.get(), ERASE_BLOCK_SIZE));
        }
    }

    #[test]
    fn existing_settings_partition_is_kept() {
        let file = build_container("Game", &[
            app_part(0x10000, 0x100, 1),
            data_part(DataSubtype::Nvs as u8, "nvs", 0x4000, 0),
        ]);
        let info = parse_bytes(&file, 0x3000).unwrap();

        assert_eq!(info.partitions.len(), 2);
        assert_eq!(info.flash_size, 0x14000);
    }

    #[test]
    fn checksum_round_trip() {
        let file = build_container("Game", &[app_part(0x20000, 0x18000, 7)]);
        let info = parse_bytes(&file, 0x3000).unwrap();

        let body = &file[..file.len() - 4];
        assert_eq!(checksum(body), info.checksum);

        let mut f = &file[..];
        let mut scratch = [0; 0x1000];
        let mut calls = 0;
        let sum = compute_checksum(&mut f, &info, &mut scratch, |done, total| {
            assert!(done <= total);
            calls += 1;
        }).unwrap();
        assert_eq!(sum, info.checksum);
        assert_eq!(calls, (body.len() + 0xFFF) / 0x1000);
    }

    #[test]
    fn corrupted_payload_changes_checksum() {
        let mut file = build_container("Game", &[app_part(0x10000, 0x1000, 7)]);
        let info = parse_bytes(&file, 0x3000).unwrap();
        file[FirmwareHeader::SIZE + 40] ^= 1;

        let mut f = &file[..];
        let sum = compute_checksum(&mut f, &info, &mut [0; 512], |_, _| ()).unwrap();
        assert_ne!(sum, info.checksum);
    }

    #[test]
    fn bad_signature() {
        let mut file = build_container("Game", &[app_part(0x10000, 0x10, 1)]);
        file[SIGNATURE_SIZE - 1] = b'2';
        assert_eq!(parse_bytes(&file, 0x3000).unwrap_err(), ParseError::HeaderInvalid);

        let short = &file[..FirmwareHeader::SIZE];
        assert_eq!(parse_bytes(short, 0x3000).unwrap_err(), ParseError::HeaderInvalid);
    }

    #[test]
    fn description_is_always_terminated() {
        let mut file = build_container("Game", &[app_part(0x10000, 0x10, 1)]);
        file[SIGNATURE_SIZE..SIGNATURE_SIZE + DESCRIPTION_SIZE].fill(b'x');
        let info = parse_bytes(&file, 0x3000).unwrap();
        assert_eq!(info.description().len(), DESCRIPTION_SIZE - 1);
    }

    #[test]
    fn erased_partition_type_rejected() {
        let mut part = app_part(0x10000, 0x10, 1);
        part.kind = PARTITION_TYPE_ERASED;
        let file = build_container("Game", &[part]);
        assert_eq!(parse_bytes(&file, 0x3000).unwrap_err(), ParseError::PartitionInvalid);
    }

    #[test]
    fn data_longer_than_partition_rejected() {
        let file = build_container("Game", &[app_part(0x1000, 0x1001, 1)]);
        assert_eq!(parse_bytes(&file, 0x3000).unwrap_err(), ParseError::PartitionInvalid);
    }

    #[test]
    fn data_past_end_of_file_rejected() {
        let mut file = build_container("Game", &[app_part(0x10000, 0x100, 1)]);
        // Claim more payload than the file holds.
        let at = FirmwareHeader::SIZE + 28;
        file[at..at + 4].copy_from_slice(&0x8000u32.to_le_bytes());
        assert_eq!(parse_bytes(&file, 0x3000).unwrap_err(), ParseError::PartitionInvalid);
    }

    #[test]
    fn truncated_descriptor_rejected() {
        let mut file = build_container("Game", &[app_part(0x10000, 0x10, 1)]);
        let trailer = file.split_off(file.len() - 4);
        file.extend_from_slice(&[0; 16]);
        file.extend_from_slice(&trailer);
        assert_eq!(parse_bytes(&file, 0x3000).unwrap_err(), ParseError::PartitionInvalid);
    }

    #[test]
    fn empty_container_rejected() {
        let file = build_container("Game", &[]);
        assert_eq!(parse_bytes(&file, 0x3000).unwrap_err(), ParseError::PartitionInvalid);
    }

    #[test]
    fn too_many_partitions() {
        let parts: Vec<TestPart> = (0..=PARTS_MAX)
            .map(|_| data_part(0x81, "d", 0x1000, 4))
            .collect();
        let file = build_container("Game", &parts);
        assert_eq!(parse_bytes(&file, 0x3000).unwrap_err(), ParseError::PartitionLimitExceeded);

        // Exactly the limit parses, but leaves no slot for settings.
        let file = build_container("Game", &parts[..PARTS_MAX]);
        let info = parse_bytes(&file, 0x3000).unwrap();
        assert_eq!(info.partitions.len(), PARTS_MAX);
        assert!(!info.partitions.iter().any(|p| p.descriptor.is_nvs()));
    }

    #[test]
    fn missing_file() {
        let mut fs = FakeFs::default();
        assert_eq!(
            parse(&mut fs, "/sd/fw/none.fw", 0x3000).unwrap_err(),
            ParseError::Io(FileError::NotFound),
        );
    }
}
