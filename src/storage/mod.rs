//! Abstractions and code to access named storage partitions
//!
//! The installer never talks to a block device directly. Everything goes through [Storage],
//! which resolves partition names and ids and hands out [PartitionFile] handles. A handle is
//! closed by dropping it.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use anyhow::{anyhow, ensure};

pub mod dir;

/// How a partition is opened
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// A pub-fields struct describing where a partition lives on the boot device
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PartitionInfo {
    /// First physical sector of the partition
    pub start_sector: u64,
    pub bytes_per_sector: u32,
    /// Size of the partition in bytes
    pub size: u64,
}

impl PartitionInfo {
    /// Byte address of the partition's first sector on the device
    pub fn start_byte(&self) -> u64 {
        self.start_sector * u64::from(self.bytes_per_sector)
    }
}

/// An open partition
pub trait PartitionFile: Read + Write + Seek {
    /// When enabled, every write is read back and compared before it is reported successful.
    fn set_write_verify(&mut self, enable: bool) -> anyhow::Result<()>;
}

/// Represents the partition table of a boot device
pub trait Storage {
    type File: PartitionFile;

    /// Open the partition called `name`
    fn open(&self, name: &str, mode: OpenMode) -> anyhow::Result<Self::File>;

    /// Look up a partition id by name. Returns None if there is no such partition.
    fn partition_id(&self, name: &str) -> Option<u32>;

    /// Look up a partition name by id
    fn partition_name(&self, id: u32) -> Option<String>;

    /// Get the physical location of a partition
    fn partition_info(&self, id: u32) -> anyhow::Result<PartitionInfo>;

    /// Erase a partition's contents (fill it with zeros)
    fn format(&self, name: &str) -> anyhow::Result<()>;
}

/// A simulated in-memory partition table, for testing purposes
///
/// Cloning a SimStorage yields another handle to the same partitions.
#[derive(Debug, Clone, Default)]
pub struct SimStorage {
    partitions: Rc<RefCell<BTreeMap<u32, SimPartition>>>,
}

/// A partition of SimStorage
#[derive(Debug)]
struct SimPartition {
    name: String,
    info: PartitionInfo,
    data: Vec<u8>,

    /// How many times this partition has been opened for writing
    write_opens: usize,

    /// How many bytes were written while write-verify was enabled/disabled
    verified_bytes: u64,
    unverified_bytes: u64,

    /// Is the write-verify mode currently on for some handle?
    verify_enabled: bool,
}

/// An open partition of SimStorage
#[derive(Debug)]
pub struct SimFile {
    storage: SimStorage,
    id: u32,
    pos: u64,
    mode: OpenMode,
    verify: bool,
}

impl SimStorage {
    pub const SECTOR_SIZE: u32 = 512;

    pub fn new() -> Self {
        Self::default()
    }

    /// Append a zero-filled partition, laid out right after the previous one.
    ///
    /// Returns the new partition's id. Ids start at 1, in the order partitions are added.
    pub fn add_partition(&self, name: &str, size: u64) -> u32 {
        let mut partitions = self.partitions.borrow_mut();
        let (id, start_sector) = match partitions.iter().next_back() {
            None => (1, 0),
            Some((id, last)) => {
                let sectors = last.info.size.div_ceil(u64::from(Self::SECTOR_SIZE));
                (id + 1, last.info.start_sector + sectors)
            }
        };

        partitions.insert(
            id,
            SimPartition {
                name: name.to_owned(),
                info: PartitionInfo {
                    start_sector,
                    bytes_per_sector: Self::SECTOR_SIZE,
                    size,
                },
                data: vec![0; size as usize],
                write_opens: 0,
                verified_bytes: 0,
                unverified_bytes: 0,
                verify_enabled: false,
            },
        );

        id
    }

    /// Replace the beginning of a partition's contents, bypassing all bookkeeping
    pub fn load(&self, name: &str, content: &[u8]) -> anyhow::Result<()> {
        self.with_named(name, |part| {
            ensure!(content.len() <= part.data.len(), "content larger than partition");
            part.data[..content.len()].copy_from_slice(content);
            Ok(())
        })
    }

    /// A copy of a partition's full contents
    pub fn contents(&self, name: &str) -> anyhow::Result<Vec<u8>> {
        self.with_named(name, |part| Ok(part.data.clone()))
    }

    /// How many times the partition has been opened for writing
    pub fn write_opens(&self, name: &str) -> anyhow::Result<usize> {
        self.with_named(name, |part| Ok(part.write_opens))
    }

    /// Bytes written to the partition with write-verify on, and with it off
    pub fn written_bytes(&self, name: &str) -> anyhow::Result<(u64, u64)> {
        self.with_named(name, |part| Ok((part.verified_bytes, part.unverified_bytes)))
    }

    /// Is write-verify still switched on for the partition?
    pub fn verify_enabled(&self, name: &str) -> anyhow::Result<bool> {
        self.with_named(name, |part| Ok(part.verify_enabled))
    }

    fn with_named<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut SimPartition) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let id = self
            .partition_id(name)
            .ok_or_else(|| anyhow!("no partition named {name}"))?;
        self.with_id(id, f)
    }

    fn with_id<T>(
        &self,
        id: u32,
        f: impl FnOnce(&mut SimPartition) -> anyhow::Result<T>,
    ) -> anyhow::Result<T> {
        let mut partitions = self.partitions.borrow_mut();
        let part = partitions
            .get_mut(&id)
            .ok_or_else(|| anyhow!("no partition with id {id}"))?;
        f(part)
    }
}

impl Storage for SimStorage {
    type File = SimFile;

    fn open(&self, name: &str, mode: OpenMode) -> anyhow::Result<SimFile> {
        let id = self
            .partition_id(name)
            .ok_or_else(|| anyhow!("no partition named {name}"))?;
        if mode == OpenMode::Write {
            self.with_id(id, |part| {
                part.write_opens += 1;
                Ok(())
            })?;
        }

        Ok(SimFile {
            storage: self.clone(),
            id,
            pos: 0,
            mode,
            verify: false,
        })
    }

    fn partition_id(&self, name: &str) -> Option<u32> {
        self.partitions
            .borrow()
            .iter()
            .find(|(_, part)| part.name == name)
            .map(|(&id, _)| id)
    }

    fn partition_name(&self, id: u32) -> Option<String> {
        self.partitions.borrow().get(&id).map(|part| part.name.clone())
    }

    fn partition_info(&self, id: u32) -> anyhow::Result<PartitionInfo> {
        self.with_id(id, |part| Ok(part.info))
    }

    fn format(&self, name: &str) -> anyhow::Result<()> {
        self.with_named(name, |part| {
            part.data.fill(0);
            Ok(())
        })
    }
}

fn to_io(error: anyhow::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, error)
}

impl Read for SimFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let pos = self.pos;
        let n = self
            .storage
            .with_id(self.id, |part| {
                let start = (pos as usize).min(part.data.len());
                let n = buf.len().min(part.data.len() - start);
                buf[..n].copy_from_slice(&part.data[start..start + n]);
                Ok(n)
            })
            .map_err(to_io)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for SimFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (pos, mode, verify) = (self.pos, self.mode, self.verify);
        self.storage
            .with_id(self.id, |part| {
                ensure!(mode == OpenMode::Write, "partition {} not open for writing", part.name);
                let end = pos + buf.len() as u64;
                ensure!(end <= part.info.size, "write past end of partition {}", part.name);
                part.data[pos as usize..end as usize].copy_from_slice(buf);
                if verify {
                    part.verified_bytes += buf.len() as u64;
                } else {
                    part.unverified_bytes += buf.len() as u64;
                }
                Ok(())
            })
            .map_err(to_io)?;
        self.pos += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for SimFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.storage.partition_info(self.id).map_err(to_io)?.size;
        let new_pos = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(n) => size.checked_add_signed(n),
            SeekFrom::Current(n) => self.pos.checked_add_signed(n),
        };

        match new_pos {
            Some(new_pos) if new_pos <= size => {
                self.pos = new_pos;
                Ok(new_pos)
            }
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek outside of partition",
            )),
        }
    }
}

impl PartitionFile for SimFile {
    fn set_write_verify(&mut self, enable: bool) -> anyhow::Result<()> {
        self.verify = enable;
        self.storage.with_id(self.id, |part| {
            part.verify_enabled = enable;
            Ok(())
        })
    }
}

#[test]
fn test_sim_storage() -> anyhow::Result<()> {
    let storage = SimStorage::new();
    let app = storage.add_partition("APP", 1000);
    let dtb = storage.add_partition("DTB", 64);

    assert_eq!(storage.partition_id("APP"), Some(app));
    assert_eq!(storage.partition_id("nope"), None);
    assert_eq!(storage.partition_name(dtb).as_deref(), Some("DTB"));

    // Partitions are laid out back to back, in whole sectors
    assert_eq!(storage.partition_info(app)?.start_sector, 0);
    assert_eq!(storage.partition_info(dtb)?.start_sector, 2);
    assert_eq!(storage.partition_info(dtb)?.start_byte(), 1024);

    let mut file = storage.open("APP", OpenMode::Write)?;
    file.set_write_verify(true)?;
    file.write_all(b"hello")?;
    file.set_write_verify(false)?;
    file.seek(SeekFrom::Current(5))?;
    file.write_all(b"world")?;
    drop(file);

    let contents = storage.contents("APP")?;
    assert_eq!(&contents[..15], b"hello\0\0\0\0\0world");
    assert_eq!(storage.write_opens("APP")?, 1);
    assert_eq!(storage.written_bytes("APP")?, (5, 5));

    // Reading stops at the end of the partition, writing past it fails
    let mut file = storage.open("DTB", OpenMode::Read)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    assert_eq!(buf.len(), 64);
    assert!(file.write_all(b"x").is_err());

    let mut file = storage.open("DTB", OpenMode::Write)?;
    file.seek(SeekFrom::Start(60))?;
    assert!(file.write_all(b"too long").is_err());
    assert!(file.seek(SeekFrom::Start(65)).is_err());

    Ok(())
}
