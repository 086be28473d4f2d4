//! The signed update blob: headers, entry table and entry classification.
//!
//! A blob is laid out as:
//!
//! ```text
//! [BlobHeader][UpdateHeader ... ImageEntry table ... payloads][signature]
//!             ^-- every offset in the blob is relative to this point
//! ```
//!
//! The signed region is everything between the BlobHeader and the signature, `ActualBlobSize`
//! bytes long.

use std::io::{Read, Seek};

use deku::prelude::*;

use crate::bootloader::BootloaderSlot;
use crate::error::{self, ensure_format, try_alloc};
use crate::util::SeekReadExt;

pub const SIGNED_MAGIC: &[u8; 20] = b"-SIGNED-BY-SIGNBLOB-";
pub const UPDATE_MAGIC: &[u8; 16] = b"MSM-RADIO-UPDATE";
pub const UPDATE_VERSION: u32 = 0x0001_0000;

pub const BLOB_HEADER_LEN: usize = 28;
pub const UPDATE_HEADER_LEN: usize = 60;
pub const IMAGE_ENTRY_LEN: usize = 16;

const ENCRYPTED_FLAG: u32 = 0x8000_0000;

#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct BlobHeader {
    pub magic: [u8; 20],
    pub actual_blob_size: u32,
    pub signature_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct UpdateHeader {
    pub magic: [u8; 16],
    pub version: u32,
    pub size: u32,
    pub entries_offset: u32,
    pub num_entries: u32,
    // The progress bitmaps are carried along but never used
    pub bitmap_width: u32,
    pub bitmap_height: u32,
    pub bitmap_bpp: u32,
    pub busy_bitmap_offset: u32,
    pub busy_bitmap_length: u32,
    pub fail_bitmap_offset: u32,
    pub fail_bitmap_length: u32,
}

/// The on-disk entry record
#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct ImageEntry {
    pub name: [u8; 4],
    pub offset: u32,
    pub length: u32,
    /// Bit 31 flags an encrypted payload, the rest is the version
    pub version: u32,
}

impl BlobHeader {
    pub fn new(actual_blob_size: u32, signature_size: u32) -> Self {
        Self {
            magic: *SIGNED_MAGIC,
            actual_blob_size,
            signature_size,
        }
    }

    /// Parse a header, checking its magic
    pub fn parse(bytes: &[u8]) -> error::Result<Self> {
        let (_, header) = Self::from_bytes((bytes, 0))?;
        ensure_format!(&header.magic == SIGNED_MAGIC, "not a signed blob");
        Ok(header)
    }
}

impl UpdateHeader {
    pub fn new(entries_offset: u32, num_entries: u32, size: u32) -> Self {
        Self {
            magic: *UPDATE_MAGIC,
            version: UPDATE_VERSION,
            size,
            entries_offset,
            num_entries,
            bitmap_width: 0,
            bitmap_height: 0,
            bitmap_bpp: 0,
            busy_bitmap_offset: 0,
            busy_bitmap_length: 0,
            fail_bitmap_offset: 0,
            fail_bitmap_length: 0,
        }
    }
}

impl ImageEntry {
    pub fn new(name: &str, offset: u32, length: u32, version: u32, encrypted: bool) -> Self {
        let mut raw_name = [0u8; 4];
        let len = name.len().min(raw_name.len());
        raw_name[..len].copy_from_slice(&name.as_bytes()[..len]);

        Self {
            name: raw_name,
            offset,
            length,
            version: if encrypted {
                version | ENCRYPTED_FLAG
            } else {
                version & !ENCRYPTED_FLAG
            },
        }
    }
}

/// One payload of the blob, in a friendlier form than [ImageEntry]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Position in the entry table
    pub index: usize,
    /// Destination partition name
    pub name: String,
    /// Payload offset, relative to the end of the BlobHeader
    pub offset: u32,
    pub length: u32,
    pub version: u32,
    pub encrypted: bool,
}

impl Entry {
    fn from_raw(index: usize, raw: &ImageEntry) -> Self {
        // Names fill all four bytes, or stop at a NUL
        let name_len = raw.name.iter().position(|&b| b == 0).unwrap_or(raw.name.len());

        Self {
            index,
            name: String::from_utf8_lossy(&raw.name[..name_len]).into_owned(),
            offset: raw.offset,
            length: raw.length,
            version: raw.version & !ENCRYPTED_FLAG,
            encrypted: raw.version & ENCRYPTED_FLAG != 0,
        }
    }

    /// Absolute position of the payload within the staging partition
    pub fn blob_offset(&self) -> u64 {
        u64::from(self.offset) + BLOB_HEADER_LEN as u64
    }
}

/// What kind of update an entry is, relative to the boot ROM's view of the device
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EntryClass {
    /// Names one of the redundant bootloader partitions; `slot` indexes the bootloader order
    Bootloader { slot: usize },
    /// Names the boot configuration table partition
    Bct,
    Ordinary,
}

/// Classify an entry by its destination partition id
pub fn classify(
    partition_id: u32,
    order: &[BootloaderSlot],
    bct_partition_id: u32,
) -> EntryClass {
    if let Some(slot) = order.iter().position(|bl| bl.partition_id == partition_id) {
        EntryClass::Bootloader { slot }
    } else if partition_id == bct_partition_id {
        EntryClass::Bct
    } else {
        EntryClass::Ordinary
    }
}

/// The parsed headers and entry table of a blob
#[derive(Debug, Clone)]
pub struct Catalog {
    pub header: BlobHeader,
    pub update: UpdateHeader,
    pub entries: Vec<Entry>,
}

impl Catalog {
    /// Read and validate the headers and entry table from the start of a staging partition
    pub fn read<R: Read + Seek>(blob: &mut R) -> error::Result<Self> {
        let mut buf = [0u8; BLOB_HEADER_LEN];
        blob.read_exact_at(0, &mut buf)?;
        let header = BlobHeader::parse(&buf)?;
        let blob_size = u64::from(header.actual_blob_size);

        let mut buf = [0u8; UPDATE_HEADER_LEN];
        blob.read_exact_at(BLOB_HEADER_LEN as u64, &mut buf)?;
        let (_, update) = UpdateHeader::from_bytes((&buf[..], 0))?;
        ensure_format!(&update.magic == UPDATE_MAGIC, "bad update header magic");
        ensure_format!(
            update.version == UPDATE_VERSION,
            "unsupported update header version {:#x}",
            update.version
        );

        // Make sure the table lies within the blob before allocating anything for it
        let table_len = u64::from(update.num_entries) * IMAGE_ENTRY_LEN as u64;
        ensure_format!(
            u64::from(update.entries_offset) + table_len <= blob_size,
            "{} entries at offset {} exceed the blob size {}",
            update.num_entries,
            update.entries_offset,
            blob_size
        );

        let mut table = try_alloc(table_len as usize)?;
        blob.read_exact_at(
            u64::from(update.entries_offset) + BLOB_HEADER_LEN as u64,
            &mut table,
        )?;

        let mut entries = Vec::with_capacity(update.num_entries as usize);
        for (index, record) in table.chunks_exact(IMAGE_ENTRY_LEN).enumerate() {
            let (_, raw) = ImageEntry::from_bytes((record, 0))?;
            let entry = Entry::from_raw(index, &raw);
            ensure_format!(
                u64::from(entry.offset) + u64::from(entry.length) <= blob_size,
                "entry {} ({}) lies outside the blob",
                index,
                entry.name
            );
            entries.push(entry);
        }

        Ok(Self {
            header,
            update,
            entries,
        })
    }

    /// All entries destined for the named partition, in table order
    pub fn entries_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Entry> + 'a {
        self.entries.iter().filter(move |entry| entry.name == name)
    }
}
