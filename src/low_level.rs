// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! At-rest byte layouts and raw flash access.
//!
//! Everything that lands on flash or comes out of a firmware container is
//! described here as a `#[repr(C)]` zerocopy struct built only from
//! unaligned little-endian fields, so the layout is byte-exact no matter what
//! the host's native struct layout would be.

use core::mem::size_of;
use log::{debug, trace};
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::error::{Area, Error, FlashOp};

//////////////////////////////////////////////////////////////////////////////
// Convenience wrappers for zerocopy.

/// Views the front of `bytes` as a `T`, returning the rest.
///
/// Panics if `bytes` is shorter than `T`; callers size their buffers from
/// `size_of::<T>()` so this only fires on a programming error.
pub fn cast_prefix<T>(bytes: &[u8]) -> (&T, &[u8])
    where T: FromBytes + Unaligned,
{
    let (lv, rest) = zerocopy::LayoutVerified::<_, T>::new_unaligned_from_prefix(bytes)
        .expect("type does not fit in buffer");
    (lv.into_ref(), rest)
}

/// Mutable version of `cast_prefix`.
pub fn cast_prefix_mut<T>(bytes: &mut [u8]) -> (&mut T, &mut [u8])
    where T: AsBytes + FromBytes + Unaligned,
{
    let (lv, rest) = zerocopy::LayoutVerified::<_, T>::new_unaligned_from_prefix(bytes)
        .expect("type does not fit in buffer");
    (lv.into_mut(), rest)
}

/// Returns a `T` with every byte set to the erased-flash value.
pub fn erased<T>() -> T
    where T: AsBytes + FromBytes,
{
    let mut v = T::new_zeroed();
    v.as_bytes_mut().fill(ERASED_BYTE);
    v
}

/// Checks whether every byte of `v` holds the erased-flash value.
pub fn is_erased<T: AsBytes>(v: &T) -> bool {
    v.as_bytes().iter().all(|&b| b == ERASED_BYTE)
}

/// Reads a NUL-terminated string out of a fixed-size field. Invalid UTF-8 is
/// cut at the first bad byte rather than rejected.
pub fn c_str(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let field = &field[..end];
    match core::str::from_utf8(field) {
        Ok(s) => s,
        Err(e) => core::str::from_utf8(&field[..e.valid_up_to()]).unwrap_or(""),
    }
}

/// Stores `s` into a fixed-size field, truncating so that at least one NUL
/// terminator always fits, and zero-filling the rest.
pub fn set_c_str(field: &mut [u8], s: &str) {
    field.fill(0);
    let n = usize::min(s.len(), field.len().saturating_sub(1));
    field[..n].copy_from_slice(&s.as_bytes()[..n]);
}

//////////////////////////////////////////////////////////////////////////////
// Geometry.

/// Value of a byte of NOR flash after erase.
pub const ERASED_BYTE: u8 = 0xFF;

/// Alignment required of application extents and of the first application
/// offset. Also the chunk size used for streaming and block moves.
pub const FLASH_BLOCK_SIZE: u32 = 64 * 1024;

/// Smallest erasable unit. Partition lengths are rounded up to this.
pub const ERASE_BLOCK_SIZE: u32 = 4 * 1024;

/// Rounds `x` up to a multiple of `align`, which must be a power of two.
/// Returns `None` on overflow.
pub fn align_up(x: u32, align: u32) -> Option<u32> {
    debug_assert!(align.is_power_of_two());
    Some(x.checked_add(align - 1)? & !(align - 1))
}

/// Checks that `x` is a multiple of `align` (a power of two).
pub fn is_aligned(x: u32, align: u32) -> bool {
    x & (align - 1) == 0
}

//////////////////////////////////////////////////////////////////////////////
// At-rest layout.

/// Shorthand for a `u16` in little-endian representation.
pub type U16LE = zerocopy::U16<byteorder::LittleEndian>;
/// Shorthand for a `u32` in little-endian representation.
pub type U32LE = zerocopy::U32<byteorder::LittleEndian>;

/// Maximum number of partitions one application may carry.
pub const PARTS_MAX: usize = 20;

/// Tile dimensions, in pixels. Tiles are RGB565, two bytes per pixel.
pub const TILE_WIDTH: usize = 86;
pub const TILE_HEIGHT: usize = 48;
pub const TILE_LENGTH: usize = TILE_WIDTH * TILE_HEIGHT * 2;

/// Size of the description field, including its NUL terminator.
pub const DESCRIPTION_SIZE: usize = 40;
/// Size of the stored filename field, including its NUL terminator.
pub const FILENAME_SIZE: usize = 128;
/// Length of the container signature field.
pub const SIGNATURE_SIZE: usize = 24;

/// Top-level partition types understood by the bootloader.
#[derive(Copy, Clone, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
pub enum PartitionType {
    App = 0x00,
    Data = 0x01,
    // Note: 0xFF is erased flash, never a valid type.
}

/// Type byte that marks an erased (or otherwise invalid) descriptor.
pub const PARTITION_TYPE_ERASED: u8 = 0xFF;

/// Subtypes of `PartitionType::Data` that we care about.
#[derive(Copy, Clone, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
pub enum DataSubtype {
    Ota = 0x00,
    Phy = 0x01,
    Nvs = 0x02,
    CoreDump = 0x03,
    /// The region holding the application table.
    AppTable = 0xFE,
}

/// Range of `PartitionType::App` subtypes designating OTA slots 0 through 15.
pub const APP_SUBTYPE_OTA_MIN: u8 = 0x10;
pub const APP_SUBTYPE_OTA_MAX: u8 = 0x1F;

/// One logical region belonging to an application.
///
/// The same 32 bytes appear in a firmware container (followed there by
/// `data_length` bytes of payload) and in the partition list of an
/// `AppRecord`.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct PartitionDescriptor {
    /// Partition type; see `PartitionType`.
    pub kind: u8,
    pub subtype: u8,
    /// Reserved padding bytes.
    pub reserved: [u8; 2],
    /// NUL-padded label.
    pub label: [u8; 16],
    pub flags: U32LE,
    /// Flash space reserved for this partition. After parsing, always a
    /// multiple of `ERASE_BLOCK_SIZE`.
    pub length: U32LE,
    /// Number of payload bytes the container carries for this partition.
    /// Never larger than `length`.
    pub data_length: U32LE,
}

impl PartitionDescriptor {
    /// Builds the private settings partition every installed application
    /// receives. It has no payload; freshly erased flash is an empty store.
    pub fn nvs(length: u32) -> Self {
        let mut label = [0; 16];
        set_c_str(&mut label, "nvs");
        Self {
            kind: PartitionType::Data as u8,
            subtype: DataSubtype::Nvs as u8,
            reserved: [0; 2],
            label,
            flags: 0.into(),
            length: length.into(),
            data_length: 0.into(),
        }
    }

    pub fn partition_type(&self) -> Option<PartitionType> {
        num_traits::FromPrimitive::from_u8(self.kind)
    }

    pub fn is_app(&self) -> bool {
        self.partition_type() == Some(PartitionType::App)
    }

    pub fn is_nvs(&self) -> bool {
        self.partition_type() == Some(PartitionType::Data)
            && self.subtype == DataSubtype::Nvs as u8
    }

    /// If this is an OTA-slot application partition, returns the slot
    /// number.
    pub fn ota_slot(&self) -> Option<u32> {
        if self.is_app()
            && (APP_SUBTYPE_OTA_MIN..=APP_SUBTYPE_OTA_MAX).contains(&self.subtype)
        {
            Some(u32::from(self.subtype - APP_SUBTYPE_OTA_MIN))
        } else {
            None
        }
    }

    pub fn label(&self) -> &str {
        c_str(&self.label)
    }
}

/// Assigns each partition its flash offset: partitions are laid out back to
/// back starting at `start`, in order.
///
/// Both the installer (when writing payload) and the partition-table writer
/// (when exposing an application at boot) go through this, so the two can
/// never disagree.
pub fn partition_offsets(
    start: u32,
    parts: &[PartitionDescriptor],
) -> impl Iterator<Item = (u32, &PartitionDescriptor)> + '_ {
    parts.iter().scan(start, |next, p| {
        let offset = *next;
        *next = next.wrapping_add(p.length.get());
        Some((offset, p))
    })
}

/// Header at the start of a firmware container file.
#[derive(Clone, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct FirmwareHeader {
    /// Must match `container::SIGNATURE` exactly.
    pub signature: [u8; SIGNATURE_SIZE],
    /// NUL-terminated human-readable name.
    pub description: [u8; DESCRIPTION_SIZE],
    /// Menu tile, RGB565.
    pub tile: [u8; TILE_LENGTH],
}

impl FirmwareHeader {
    pub const SIZE: usize = size_of::<Self>();

    pub fn description(&self) -> &str {
        c_str(&self.description)
    }
}

impl core::fmt::Debug for FirmwareHeader {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FirmwareHeader")
            .field("signature", &c_str(&self.signature))
            .field("description", &self.description())
            .finish_non_exhaustive()
    }
}

/// One slot of the persisted application table.
///
/// A slot whose `magic` is not `EXPECTED_MAGIC` is empty. Empty slots are
/// written as all-`0xFF` and only ever appear after the last valid slot.
#[derive(Clone, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct AppRecord {
    /// Marks the slot as holding an application (`EXPECTED_MAGIC`).
    pub magic: U16LE,
    pub flags: U16LE,
    /// First byte of the application's flash extent.
    pub start_offset: U32LE,
    /// Last byte (inclusive) of the extent. `end_offset + 1` is always a
    /// multiple of `FLASH_BLOCK_SIZE`.
    pub end_offset: U32LE,
    pub description: [u8; DESCRIPTION_SIZE],
    /// Name of the container file this was installed from, without its
    /// directory.
    pub filename: [u8; FILENAME_SIZE],
    pub tile: [u8; TILE_LENGTH],
    pub parts: [PartitionDescriptor; PARTS_MAX],
    /// Number of meaningful entries in `parts`.
    pub parts_count: u8,
    pub reserved0: [u8; 3],
    /// Monotonic install counter, used for "newest first" ordering.
    pub install_seq: U32LE,
    pub reserved: [u8; 132],
}

impl AppRecord {
    /// Bits we expect to find in the `magic` field of a valid slot.
    pub const EXPECTED_MAGIC: u16 = 0x1207;

    pub const SIZE: usize = size_of::<Self>();

    pub fn is_valid(&self) -> bool {
        self.magic.get() == Self::EXPECTED_MAGIC
    }

    pub fn start(&self) -> u32 {
        self.start_offset.get()
    }

    /// Inclusive end of the extent.
    pub fn end(&self) -> u32 {
        self.end_offset.get()
    }

    /// Number of bytes covered by the extent.
    pub fn extent_len(&self) -> u32 {
        self.end().wrapping_sub(self.start()).wrapping_add(1)
    }

    pub fn description(&self) -> &str {
        c_str(&self.description)
    }

    pub fn filename(&self) -> &str {
        c_str(&self.filename)
    }

    /// The partitions this application carries, in layout order.
    pub fn partitions(&self) -> &[PartitionDescriptor] {
        let n = usize::min(usize::from(self.parts_count), PARTS_MAX);
        &self.parts[..n]
    }

    /// Checks whether this record's extent intersects `other`'s.
    pub fn overlaps(&self, other: &AppRecord) -> bool {
        self.start() <= other.end() && other.start() <= self.end()
    }
}

impl core::fmt::Debug for AppRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AppRecord")
            .field("magic", &format_args!("{:#06x}", self.magic.get()))
            .field("start_offset", &format_args!("{:#x}", self.start()))
            .field("end_offset", &format_args!("{:#x}", self.end()))
            .field("description", &self.description())
            .field("filename", &self.filename())
            .field("parts", &self.partitions())
            .field("install_seq", &self.install_seq.get())
            .finish_non_exhaustive()
    }
}

// The table layout is shared with every launcher build that ever wrote it.
const _: () = assert!(size_of::<PartitionDescriptor>() == 32);
const _: () = assert!(size_of::<FirmwareHeader>() == 8320);
const _: () = assert!(size_of::<AppRecord>() == 9216);

/// One entry of the device partition table read by the bootloader.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct PartitionEntry {
    /// `EXPECTED_MAGIC` for a partition; other values (such as the MD5
    /// checksum entry some tools append) are not partitions.
    pub magic: U16LE,
    pub kind: u8,
    pub subtype: u8,
    pub offset: U32LE,
    pub size: U32LE,
    pub label: [u8; 16],
    pub flags: U32LE,
}

impl PartitionEntry {
    pub const EXPECTED_MAGIC: u16 = 0x50AA;
    /// Magic of an unprogrammed entry, which terminates the table.
    pub const END_MAGIC: u16 = 0xFFFF;

    pub fn is_partition(&self) -> bool {
        self.magic.get() == Self::EXPECTED_MAGIC
    }

    pub fn label(&self) -> &str {
        c_str(&self.label)
    }

    pub fn is_data(&self, subtype: DataSubtype) -> bool {
        self.kind == PartitionType::Data as u8 && self.subtype == subtype as u8
    }

    /// Builds the entry exposing `part` at `offset`.
    pub fn from_descriptor(offset: u32, part: &PartitionDescriptor) -> Self {
        Self {
            magic: Self::EXPECTED_MAGIC.into(),
            kind: part.kind,
            subtype: part.subtype,
            offset: offset.into(),
            size: part.length,
            label: part.label,
            flags: part.flags,
        }
    }
}

/// Boot-selector record in the `otadata` sectors.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct OtaSelectEntry {
    /// Sequence number; the bootloader starts OTA slot
    /// `(ota_seq - 1) % slot_count`.
    pub ota_seq: U32LE,
    pub seq_label: [u8; 20],
    pub ota_state: U32LE,
    /// CRC of `ota_seq`; see `boot::select_crc`.
    pub crc: U32LE,
}

const _: () = assert!(size_of::<PartitionEntry>() == 32);
const _: () = assert!(size_of::<OtaSelectEntry>() == 32);

//////////////////////////////////////////////////////////////////////////////
// Flash device interface.

/// Trait describing the raw NOR flash device for the purposes of the
/// launcher.
///
/// Offsets are absolute byte addresses on the device. Implementations are
/// expected to be blocking and to either complete each call or report an
/// error; the launcher has no model of a partially applied call and treats
/// every error as fatal.
pub trait Flash {
    /// Error type that can be produced during flash accesses.
    type Error;

    /// Returns the size of the device in bytes. This cannot fail and must
    /// always return the same result.
    fn capacity(&self) -> u32;

    /// Reads `dest.len()` bytes starting at `offset`.
    fn read(&mut self, offset: u32, dest: &mut [u8]) -> Result<(), Self::Error>;

    /// Programs `data` at `offset`. The range must have been erased since it
    /// was last programmed; NOR programming can only clear bits.
    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Erases `length` bytes starting at `offset`. Both must be multiples of
    /// `ERASE_BLOCK_SIZE`.
    fn erase(&mut self, offset: u32, length: u32) -> Result<(), Self::Error>;
}

impl<F: Flash + ?Sized> Flash for &mut F {
    type Error = F::Error;

    fn capacity(&self) -> u32 {
        (**self).capacity()
    }

    fn read(&mut self, offset: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
        (**self).read(offset, dest)
    }

    fn write(&mut self, offset: u32, data: &[u8]) -> Result<(), Self::Error> {
        (**self).write(offset, data)
    }

    fn erase(&mut self, offset: u32, length: u32) -> Result<(), Self::Error> {
        (**self).erase(offset, length)
    }
}

// The helpers below are the only way the rest of the crate touches the
// device: each tags failures with the area being accessed so the top level
// can say what broke.

pub(crate) fn read<F: Flash>(
    flash: &mut F,
    area: Area,
    offset: u32,
    dest: &mut [u8],
) -> Result<(), Error<F::Error>> {
    trace!("read {:?} {:#x}+{:#x}", area, offset, dest.len());
    flash.read(offset, dest)
        .map_err(|cause| Error::Flash { area, op: FlashOp::Read, offset, cause })
}

pub(crate) fn write<F: Flash>(
    flash: &mut F,
    area: Area,
    offset: u32,
    data: &[u8],
) -> Result<(), Error<F::Error>> {
    trace!("write {:?} {:#x}+{:#x}", area, offset, data.len());
    flash.write(offset, data)
        .map_err(|cause| Error::Flash { area, op: FlashOp::Write, offset, cause })
}

pub(crate) fn erase<F: Flash>(
    flash: &mut F,
    area: Area,
    offset: u32,
    length: u32,
) -> Result<(), Error<F::Error>> {
    debug!("erase {:?} {:#x}+{:#x}", area, offset, length);
    flash.erase(offset, length)
        .map_err(|cause| Error::Flash { area, op: FlashOp::Erase, offset, cause })
}
