//! A [Storage] backed by a directory on the host, where every regular file is one partition.
//!
//! This lets the whole install pipeline run against a dumped device image set. Partitions are
//! numbered in file-name order and are treated as laid out back to back on a device with
//! 512-byte sectors. Partitions never grow: writes past the end of a file fail.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};

use super::{OpenMode, PartitionFile, PartitionInfo, Storage};

const SECTOR_SIZE: u32 = 512;

#[derive(Debug)]
pub struct DirStorage {
    root: PathBuf,
    /// (name, size), sorted by name; the id of a partition is its index + 1
    partitions: Vec<(String, u64)>,
}

#[derive(Debug)]
pub struct DirFile {
    file: File,
    size: u64,
    verify: bool,
}

impl DirStorage {
    /// Scan `root` for partition files
    pub fn open(root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = root.as_ref().to_owned();
        let mut partitions = Vec::new();
        for entry in fs::read_dir(&root).with_context(|| format!("reading {}", root.display()))? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry
                .file_name()
                .into_string()
                .map_err(|name| anyhow!("non-UTF-8 partition name {name:?}"))?;
            partitions.push((name, entry.metadata()?.len()));
        }
        partitions.sort();

        log::debug!("{} partitions in {}", partitions.len(), root.display());
        Ok(Self { root, partitions })
    }

    fn index_of(&self, id: u32) -> anyhow::Result<usize> {
        let index = (id as usize)
            .checked_sub(1)
            .filter(|&index| index < self.partitions.len())
            .ok_or_else(|| anyhow!("no partition with id {id}"))?;
        Ok(index)
    }
}

impl Storage for DirStorage {
    type File = DirFile;

    fn open(&self, name: &str, mode: OpenMode) -> anyhow::Result<DirFile> {
        let &(_, size) = self
            .partitions
            .iter()
            .find(|(part, _)| part == name)
            .ok_or_else(|| anyhow!("no partition named {name}"))?;

        let path = self.root.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(mode == OpenMode::Write)
            .open(&path)
            .with_context(|| format!("opening {}", path.display()))?;

        Ok(DirFile {
            file,
            size,
            verify: false,
        })
    }

    fn partition_id(&self, name: &str) -> Option<u32> {
        self.partitions
            .iter()
            .position(|(part, _)| part == name)
            .map(|index| index as u32 + 1)
    }

    fn partition_name(&self, id: u32) -> Option<String> {
        let index = self.index_of(id).ok()?;
        Some(self.partitions[index].0.clone())
    }

    fn partition_info(&self, id: u32) -> anyhow::Result<PartitionInfo> {
        let index = self.index_of(id)?;
        let start_sector = self.partitions[..index]
            .iter()
            .map(|(_, size)| size.div_ceil(u64::from(SECTOR_SIZE)))
            .sum();

        Ok(PartitionInfo {
            start_sector,
            bytes_per_sector: SECTOR_SIZE,
            size: self.partitions[index].1,
        })
    }

    fn format(&self, name: &str) -> anyhow::Result<()> {
        let mut file = self.open(name, OpenMode::Write)?;
        io::copy(&mut io::repeat(0).take(file.size), &mut file)?;
        Ok(())
    }
}

impl Read for DirFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for DirFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let pos = self.file.stream_position()?;
        if pos + buf.len() as u64 > self.size {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "write past end of partition",
            ));
        }

        self.file.write_all(buf)?;

        if self.verify {
            let mut readback = vec![0; buf.len()];
            self.file.seek(SeekFrom::Start(pos))?;
            self.file.read_exact(&mut readback)?;
            if readback != buf {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("write verification failed at offset {pos}"),
                ));
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for DirFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl PartitionFile for DirFile {
    fn set_write_verify(&mut self, enable: bool) -> anyhow::Result<()> {
        if !enable {
            self.file.flush()?;
        }
        self.verify = enable;
        Ok(())
    }
}

#[test]
fn test_dir_storage() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("APP"), vec![0u8; 1000])?;
    fs::write(dir.path().join("BCT"), vec![0u8; 100])?;
    fs::create_dir(dir.path().join("subdir"))?;

    let storage = DirStorage::open(dir.path())?;
    assert_eq!(storage.partition_id("APP"), Some(1));
    assert_eq!(storage.partition_id("BCT"), Some(2));
    assert_eq!(storage.partition_id("subdir"), None);
    assert_eq!(storage.partition_name(2).as_deref(), Some("BCT"));
    assert_eq!(storage.partition_name(3), None);
    assert_eq!(storage.partition_info(2)?.start_sector, 2);

    let mut file = storage.open("BCT", OpenMode::Write)?;
    file.set_write_verify(true)?;
    file.seek(SeekFrom::Start(10))?;
    file.write_all(b"table")?;
    assert!(file.write_all(&[0u8; 100]).is_err());
    drop(file);

    let contents = fs::read(dir.path().join("BCT"))?;
    assert_eq!(contents.len(), 100);
    assert_eq!(&contents[10..15], b"table");

    storage.format("BCT")?;
    assert!(fs::read(dir.path().join("BCT"))?.iter().all(|&b| b == 0));

    Ok(())
}
