// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fakes shared by the unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::string::{String, ToString};
use std::vec::Vec;

use zerocopy::AsBytes;

use crate::config::{Layout, Region};
use crate::error::{FileError, FlashOp};
use crate::hal::*;
use crate::low_level::*;

//////////////////////////////////////////////////////////////////////////////
// Flash.

pub const TEST_CAPACITY: u32 = 0x20_0000;
pub const TEST_APP_TABLE: Region = Region::new(0x20000, 0x10000);
pub const TEST_FIRST_APP: u32 = 0x30000;

pub fn test_layout() -> Layout {
    Layout {
        flash_capacity: TEST_CAPACITY,
        app_table: Some(TEST_APP_TABLE),
        firmware_dir: "/sd/fw",
        ..Layout::default()
    }
}

/// In-memory NOR flash. Programming may only clear bits of erased bytes;
/// anything else panics, like a double-programmed sector would corrupt real
/// hardware.
pub struct FakeFlash {
    pub data: Vec<u8>,
    pub ops: Vec<(FlashOp, u32, u32)>,
    /// Fails the first access of this kind touching this offset.
    pub fail: Option<(FlashOp, u32)>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FakeFlashError;

impl FakeFlash {
    pub fn new(capacity: u32) -> Self {
        Self {
            data: vec![ERASED_BYTE; capacity as usize],
            ops: Vec::new(),
            fail: None,
        }
    }

    pub fn bytes(&self, offset: u32, len: u32) -> &[u8] {
        &self.data[offset as usize..(offset + len) as usize]
    }

    /// Writes without NOR rules, for setting up a scenario.
    pub fn poke(&mut self, offset: u32, data: &[u8]) {
        self.data[offset as usize..offset as usize + data.len()].copy_from_slice(data);
    }

    /// Number of erase and write calls seen so far.
    pub fn mutations(&self) -> usize {
        self.ops.iter().filter(|(op, _, _)| *op != FlashOp::Read).count()
    }

    fn check(&mut self, op: FlashOp, offset: u32, len: u32) -> Result<(), FakeFlashError> {
        assert!(
            offset as usize + len as usize <= self.data.len(),
            "{op:?} out of range: {offset:#x}+{len:#x}",
        );
        self.ops.push((op, offset, len));
        if let Some((fop, foff)) = self.fail {
            if fop == op && foff >= offset && foff < offset + len.max(1) {
                self.fail = None;
                return Err(FakeFlashError);
            }
        }
        Ok(())
    }
}

impl Flash for FakeFlash {
    type Error = FakeFlashError;

    fn capacity(&self) -> u32 {
        self.data.len() as u32
    }

    fn read(&mut self, offset: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
        self.check(FlashOp::Read, offset, dest.len() as u32)?;
        dest.copy_from_slice(self.bytes(offset, dest.len() as u32));
        Ok(())
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), Self::Error> {
        self.check(FlashOp::Write, offset, data.len() as u32)?;
        for (i, &b) in data.iter().enumerate() {
            let cell = &mut self.data[offset as usize + i];
            if *cell & b != b {
                panic!("write to unerased byte at {:#x}", offset as usize + i);
            }
            *cell &= b;
        }
        Ok(())
    }

    fn erase(&mut self, offset: u32, length: u32) -> Result<(), Self::Error> {
        assert!(is_aligned(offset, ERASE_BLOCK_SIZE), "unaligned erase {offset:#x}");
        assert!(is_aligned(length, ERASE_BLOCK_SIZE), "unaligned erase length {length:#x}");
        self.check(FlashOp::Erase, offset, length)?;
        self.data[offset as usize..(offset + length) as usize].fill(ERASED_BYTE);
        Ok(())
    }
}

fn entry(kind: u8, subtype: u8, offset: u32, size: u32, label: &str) -> PartitionEntry {
    let mut e = PartitionEntry {
        magic: PartitionEntry::EXPECTED_MAGIC.into(),
        kind,
        subtype,
        offset: offset.into(),
        size: size.into(),
        label: [0; 16],
        flags: 0.into(),
    };
    set_c_str(&mut e.label, label);
    e
}

/// The system part of the device partition table, in order.
pub fn system_entries() -> Vec<PartitionEntry> {
    vec![
        entry(1, DataSubtype::Nvs as u8, 0x9000, 0x4000, "nvs"),
        entry(1, DataSubtype::Ota as u8, 0xD000, 0x2000, "otadata"),
        entry(1, DataSubtype::Phy as u8, 0xF000, 0x1000, "phy_init"),
        entry(0, 0x00, 0x10000, 0x10000, "factory"),
        entry(1, DataSubtype::AppTable as u8, TEST_APP_TABLE.offset, TEST_APP_TABLE.size, "apptable"),
    ]
}

/// Writes a realistic device partition table: the system partitions, a
/// stale application partition left from a previous boot, and the MD5 entry
/// that partition tools append.
pub fn write_system_partition_table(flash: &mut FakeFlash) {
    let mut entries = system_entries();
    entries.push(entry(0, 0x10, TEST_FIRST_APP, 0x40000, "stale"));
    let mut bytes = Vec::new();
    for e in &entries {
        bytes.extend_from_slice(e.as_bytes());
    }
    let mut md5 = [0xFFu8; 32];
    md5[0] = 0xEB;
    md5[1] = 0xEB;
    md5[16..].fill(0x5A);
    bytes.extend_from_slice(&md5);
    flash.poke(0x8000, &bytes);
}

//////////////////////////////////////////////////////////////////////////////
// Records and containers.

/// A valid record occupying `[start, start + size)`.
pub fn record(start: u32, size: u32, description: &str, seq: u32) -> AppRecord {
    let mut r: AppRecord = erased();
    r.magic = AppRecord::EXPECTED_MAGIC.into();
    r.flags = 0.into();
    r.start_offset = start.into();
    r.end_offset = (start + size - 1).into();
    set_c_str(&mut r.description, description);
    set_c_str(&mut r.filename, "test.fw");
    r.parts_count = 0;
    r.install_seq = seq.into();
    r
}

pub struct TestPart {
    pub kind: u8,
    pub subtype: u8,
    pub label: &'static str,
    pub length: u32,
    pub data: Vec<u8>,
}

/// Deterministic payload so copies can be checked byte for byte.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

pub fn app_part(length: u32, data_length: usize, seed: u8) -> TestPart {
    TestPart {
        kind: PartitionType::App as u8,
        subtype: APP_SUBTYPE_OTA_MIN,
        label: "app",
        length,
        data: pattern(data_length, seed),
    }
}

pub fn data_part(subtype: u8, label: &'static str, length: u32, data_length: usize) -> TestPart {
    TestPart {
        kind: PartitionType::Data as u8,
        subtype,
        label,
        length,
        data: pattern(data_length, 0x11),
    }
}

pub fn header_bytes(description: &str) -> Vec<u8> {
    let mut header = vec![0u8; FirmwareHeader::SIZE];
    header[..SIGNATURE_SIZE].copy_from_slice(crate::container::SIGNATURE);
    set_c_str(&mut header[SIGNATURE_SIZE..SIGNATURE_SIZE + DESCRIPTION_SIZE], description);
    header[SIGNATURE_SIZE + DESCRIPTION_SIZE..].fill(0x42);
    header
}

pub fn descriptor_bytes(p: &TestPart) -> Vec<u8> {
    let mut d = PartitionDescriptor::nvs(0);
    d.kind = p.kind;
    d.subtype = p.subtype;
    set_c_str(&mut d.label, p.label);
    d.length = p.length.into();
    d.data_length = (p.data.len() as u32).into();
    d.as_bytes().to_vec()
}

/// Builds a container file with a correct trailing checksum.
pub fn build_container(description: &str, parts: &[TestPart]) -> Vec<u8> {
    let mut file = header_bytes(description);
    for p in parts {
        file.extend_from_slice(&descriptor_bytes(p));
        file.extend_from_slice(&p.data);
    }
    let crc = crate::container::checksum(&file);
    file.extend_from_slice(&crc.to_le_bytes());
    file
}

//////////////////////////////////////////////////////////////////////////////
// Board.

#[derive(Default)]
pub struct FakeFs {
    pub files: BTreeMap<String, Vec<u8>>,
    pub no_media: bool,
}

pub struct MemFile(pub Vec<u8>);

impl FirmwareFile for MemFile {
    fn size(&mut self) -> Result<u32, FileError> {
        (&self.0[..]).size()
    }

    fn read_at(&mut self, offset: u32, buf: &mut [u8]) -> Result<usize, FileError> {
        (&self.0[..]).read_at(offset, buf)
    }
}

impl FileSystem for FakeFs {
    type File = MemFile;

    fn open(&mut self, path: &str) -> Result<MemFile, FileError> {
        if self.no_media {
            return Err(FileError::NoMedia);
        }
        self.files.get(path).cloned().map(MemFile).ok_or(FileError::NotFound)
    }

    fn list(&mut self, dir: &str, extension: &str) -> Result<Vec<String>, FileError> {
        if self.no_media {
            return Err(FileError::NoMedia);
        }
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        Ok(self.files.keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|name| !name.contains('/') && has_extension(name, extension))
            .map(|name| name.to_string())
            .collect())
    }
}

/// Board with scripted buttons that records everything drawn.
#[derive(Default)]
pub struct FakeHal {
    pub fs: FakeFs,
    pub buttons: VecDeque<Button>,
    pub titles: Vec<String>,
    pub headers: Vec<String>,
    pub messages: Vec<String>,
    pub errors: Vec<String>,
    pub progress: Vec<u8>,
    pub rows: Vec<String>,
    pub dialogs: Vec<usize>,
    pub tiles: usize,
    pub led: bool,
}

impl FakeHal {
    pub fn with_buttons(buttons: &[Button]) -> Self {
        Self { buttons: buttons.iter().copied().collect(), ..Self::default() }
    }

    pub fn add_file(&mut self, path: &str, data: Vec<u8>) {
        self.fs.files.insert(path.to_string(), data);
    }
}

impl Display for FakeHal {
    fn title(&mut self, title: &str, footer: &str) {
        self.titles.push(format!("{title} | {footer}"));
    }

    fn header(&mut self, text: &str) {
        self.headers.push(text.to_string());
    }

    fn footer(&mut self, _text: &str) {}

    fn message(&mut self, text: &str) {
        self.messages.push(text.to_string());
    }

    fn progress(&mut self, percent: u8) {
        assert!(percent <= 100);
        self.progress.push(percent);
    }

    fn tile(&mut self, tile: &[u8]) {
        assert_eq!(tile.len(), TILE_LENGTH);
        self.tiles += 1;
    }

    fn row(&mut self, line: usize, selected: bool, row: &Row<'_>) {
        let mark = if selected { ">" } else { " " };
        self.rows.push(format!("{line}{mark}{} / {}", row.title, row.detail));
    }

    fn dialog(&mut self, _options: &[&str], selected: usize) {
        self.dialogs.push(selected);
    }

    fn error(&mut self, text: &str) {
        self.errors.push(text.to_string());
    }

    fn present(&mut self) {}
}

impl Input for FakeHal {
    fn state(&mut self) -> ButtonState {
        ButtonState(0)
    }

    fn sleep_tick(&mut self) {}

    /// Never times out, so a loop polling with a timeout still ends when
    /// the script does.
    fn wait_for_press(&mut self, _timeout_ticks: Option<u32>) -> Option<Button> {
        match self.buttons.pop_front() {
            Some(b) => Some(b),
            None => panic!("scripted buttons exhausted"),
        }
    }
}

impl FileSystem for FakeHal {
    type File = MemFile;

    fn open(&mut self, path: &str) -> Result<MemFile, FileError> {
        self.fs.open(path)
    }

    fn list(&mut self, dir: &str, extension: &str) -> Result<Vec<String>, FileError> {
        self.fs.list(dir, extension)
    }
}

impl Platform for FakeHal {
    fn restart(&mut self) -> ! {
        panic!("restart");
    }

    fn halt(&mut self) -> ! {
        panic!("halt: {}", self.errors.last().map(String::as_str).unwrap_or(""));
    }

    fn set_led(&mut self, on: bool) {
        self.led = on;
    }
}
