// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The boot selector: the `otadata` record telling the bootloader which OTA
//! slot to start.
//!
//! The region holds two sectors, each starting with an `OtaSelectEntry`. The
//! bootloader takes the valid entry with the higher sequence number, or the
//! factory application (the launcher) when neither is valid.

use log::info;
use zerocopy::{AsBytes, FromBytes};

use crate::config::Region;
use crate::error::{Area, Error};
use crate::low_level::{self, *};

/// CRC the bootloader checks over `ota_seq`.
const OTA_SELECT_CRC: crc::Algorithm<u32> = crc::Algorithm {
    width: 32,
    poly: 0x04c1_1db7,
    init: 0,
    refin: true,
    refout: true,
    xorout: 0xffff_ffff,
    check: 0xd202_d277,
    residue: 0xdebb_20e3,
};

static CRC: crc::Crc<u32> = crc::Crc::<u32>::new(&OTA_SELECT_CRC);

pub fn select_crc(seq: u32) -> u32 {
    CRC.checksum(&seq.to_le_bytes())
}

/// The record that makes the bootloader start OTA slot `slot`.
pub fn select_entry(slot: u32) -> OtaSelectEntry {
    let seq = slot + 1;
    OtaSelectEntry {
        ota_seq: seq.into(),
        seq_label: [ERASED_BYTE; 20],
        ota_state: u32::MAX.into(),
        crc: select_crc(seq).into(),
    }
}

/// The OTA slot to start for `app`: that of its first OTA application
/// partition, or slot 0.
pub fn boot_slot(app: &AppRecord) -> u32 {
    app.partitions().iter().find_map(PartitionDescriptor::ota_slot).unwrap_or(0)
}

/// Points the boot selector at `slot`.
pub fn select_ota<F: Flash>(flash: &mut F, region: Region, slot: u32) -> Result<(), Error<F::Error>> {
    info!("boot selector -> ota slot {}", slot);
    low_level::erase(flash, Area::BootSelector, region.offset, region.size)?;
    low_level::write(flash, Area::BootSelector, region.offset, select_entry(slot).as_bytes())
}

/// Erases the boot selector, so the bootloader falls back to the launcher.
pub fn clear<F: Flash>(flash: &mut F, region: Region) -> Result<(), Error<F::Error>> {
    info!("boot selector cleared");
    low_level::erase(flash, Area::BootSelector, region.offset, region.size)
}

/// The slot the bootloader would currently pick, if any.
pub fn selected<F: Flash>(flash: &mut F, region: Region) -> Result<Option<u32>, Error<F::Error>> {
    let mut best: Option<u32> = None;
    let mut offset = region.offset;
    while offset < region.end() {
        let mut entry = OtaSelectEntry::new_zeroed();
        low_level::read(flash, Area::BootSelector, offset, entry.as_bytes_mut())?;
        // 0 and all-ones both mean unset.
        let seq = entry.ota_seq.get();
        if seq != 0 && seq != u32::MAX && entry.crc.get() == select_crc(seq) {
            best = Some(best.map_or(seq, |b| b.max(seq)));
        }
        offset += ERASE_BLOCK_SIZE;
    }
    Ok(best.map(|seq| seq - 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    const OTADATA: Region = Region::new(0xD000, 0x2000);

    #[test]
    fn crc_matches_bootloader() {
        assert_eq!(select_crc(1), 0x4743_989a);
        assert_eq!(CRC.checksum(b"123456789"), OTA_SELECT_CRC.check);
    }

    #[test]
    fn select_then_read_back() {
        let mut flash = FakeFlash::new(TEST_CAPACITY);
        assert_eq!(selected(&mut flash, OTADATA).unwrap(), None);

        select_ota(&mut flash, OTADATA, 0).unwrap();
        let raw = flash.bytes(0xD000, 32);
        assert_eq!(&raw[..4], &1u32.to_le_bytes());
        assert!(raw[4..28].iter().all(|&b| b == 0xFF));
        assert_eq!(&raw[28..], &0x4743_989au32.to_le_bytes());
        assert_eq!(selected(&mut flash, OTADATA).unwrap(), Some(0));

        select_ota(&mut flash, OTADATA, 3).unwrap();
        assert_eq!(selected(&mut flash, OTADATA).unwrap(), Some(3));

        clear(&mut flash, OTADATA).unwrap();
        assert_eq!(selected(&mut flash, OTADATA).unwrap(), None);
    }

    #[test]
    fn bad_crc_is_ignored() {
        let mut flash = FakeFlash::new(TEST_CAPACITY);
        let mut entry = select_entry(2);
        entry.crc = 0.into();
        flash.poke(0xE000, entry.as_bytes());
        assert_eq!(selected(&mut flash, OTADATA).unwrap(), None);
    }

    #[test]
    fn zero_sequence_is_unset() {
        let mut flash = FakeFlash::new(TEST_CAPACITY);
        let mut entry = select_entry(0);
        entry.ota_seq = 0.into();
        entry.crc = select_crc(0).into();
        flash.poke(0xD000, entry.as_bytes());
        assert_eq!(selected(&mut flash, OTADATA).unwrap(), None);

        flash.poke(0xE000, select_entry(1).as_bytes());
        assert_eq!(selected(&mut flash, OTADATA).unwrap(), Some(1));
    }

    #[test]
    fn slot_from_partitions() {
        let mut rec = record(0x30000, 0x10000, "A", 0);
        assert_eq!(boot_slot(&rec), 0);

        let mut app = PartitionDescriptor::nvs(0x1000);
        app.kind = PartitionType::App as u8;
        app.subtype = 0x00;
        rec.parts[0] = PartitionDescriptor::nvs(0x1000);
        rec.parts[1] = app;
        app.subtype = 0x13;
        rec.parts[2] = app;
        rec.parts_count = 3;
        assert_eq!(boot_slot(&rec), 3);
    }

    #[test]
    fn flash_error_names_boot_stage() {
        let mut flash = FakeFlash::new(TEST_CAPACITY);
        flash.fail = Some((crate::error::FlashOp::Erase, 0xD000));
        let err = select_ota(&mut flash, OTADATA, 0).unwrap_err();
        assert_eq!(err.message(), "BOOT SET ERROR");
        assert!(err.is_fatal());
    }
}
