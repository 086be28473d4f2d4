//! Picking the right device tree when a blob carries several.
//!
//! A blob built for a family of boards ships one DTB entry per board. Exactly one of them is
//! installed: the one whose root node describes the same board as the DTB currently flashed,
//! judged first by the `nvidia,dtsfilename` property and then by `nvidia,boardids`. Board ids
//! the flashed tree doesn't mention are checked against the boards actually present.

use std::fmt;
use std::io::{Read, Seek};
use std::str::FromStr;

use anyhow::{anyhow, Context};
use deku::prelude::*;

use crate::blob::Entry;
use crate::error::{self, ensure_format, try_alloc, Error};
use crate::storage::{OpenMode, Storage};
use crate::util::SeekReadExt;

pub const FDT_MAGIC: u32 = 0xd00dfeed;
pub const FDT_HEADER_LEN: usize = 40;

const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_NOP: u32 = 4;
const FDT_END: u32 = 9;

pub const PROP_DTS_FILENAME: &str = "nvidia,dtsfilename";
pub const PROP_BOARD_IDS: &str = "nvidia,boardids";

#[derive(Debug, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "big")]
pub struct FdtHeader {
    pub magic: u32,
    pub totalsize: u32,
    pub off_dt_struct: u32,
    pub off_dt_strings: u32,
    pub off_mem_rsvmap: u32,
    pub version: u32,
    pub last_comp_version: u32,
    pub boot_cpuid_phys: u32,
    pub size_dt_strings: u32,
    pub size_dt_struct: u32,
}

/// A read-only view of a flattened device tree
#[derive(Debug)]
pub struct Fdt<'a> {
    header: FdtHeader,
    bytes: &'a [u8],
}

impl<'a> Fdt<'a> {
    pub fn new(bytes: &'a [u8]) -> error::Result<Self> {
        let (_, header) = FdtHeader::from_bytes((bytes, 0))?;
        ensure_format!(header.magic == FDT_MAGIC, "not a device tree");
        ensure_format!(
            header.totalsize as usize <= bytes.len(),
            "device tree truncated"
        );

        let struct_end = u64::from(header.off_dt_struct) + u64::from(header.size_dt_struct);
        let strings_end = u64::from(header.off_dt_strings) + u64::from(header.size_dt_strings);
        ensure_format!(
            struct_end <= u64::from(header.totalsize) && strings_end <= u64::from(header.totalsize),
            "device tree blocks exceed its size"
        );

        Ok(Self { header, bytes })
    }

    fn structure(&self) -> &'a [u8] {
        let start = self.header.off_dt_struct as usize;
        &self.bytes[start..start + self.header.size_dt_struct as usize]
    }

    fn string(&self, offset: u32) -> error::Result<&'a [u8]> {
        let start = self.header.off_dt_strings as usize;
        let strings = &self.bytes[start..start + self.header.size_dt_strings as usize];
        let name = strings
            .get(offset as usize..)
            .ok_or_else(|| Error::format("property name outside the strings block"))?;
        let len = name
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::format("unterminated property name"))?;
        Ok(&name[..len])
    }

    /// The value of a property of the root node, if it has one
    pub fn root_property(&self, name: &str) -> error::Result<Option<&'a [u8]>> {
        let structure = self.structure();
        let word = |pos: usize| -> error::Result<u32> {
            let bytes = structure
                .get(pos..pos + 4)
                .ok_or_else(|| Error::format("device tree structure truncated"))?;
            Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        };
        let align = |pos: usize| (pos + 3) & !3;

        let mut pos = 0;
        let mut depth = 0usize;
        loop {
            let token = word(pos)?;
            pos += 4;
            match token {
                FDT_BEGIN_NODE => {
                    let len = structure[pos.min(structure.len())..]
                        .iter()
                        .position(|&b| b == 0)
                        .ok_or_else(|| Error::format("unterminated node name"))?;
                    pos = align(pos + len + 1);
                    depth += 1;
                }
                FDT_END_NODE => {
                    ensure_format!(depth > 0, "unbalanced device tree nodes");
                    depth -= 1;
                    if depth == 0 {
                        // Done with the root node
                        return Ok(None);
                    }
                }
                FDT_PROP => {
                    let len = word(pos)? as usize;
                    let nameoff = word(pos + 4)?;
                    pos += 8;
                    let value = structure
                        .get(pos..pos + len)
                        .ok_or_else(|| Error::format("property value truncated"))?;
                    pos = align(pos + len);

                    if depth == 1 && self.string(nameoff)? == name.as_bytes() {
                        return Ok(Some(value));
                    }
                }
                FDT_NOP => (),
                FDT_END => return Ok(None),
                _ => return Err(Error::format(format!("bad device tree token {token:#x}"))),
            }
        }
    }
}

/// Read a whole device tree starting at `offset`, refusing trees larger than `limit` bytes
pub fn read_fdt<R: Read + Seek>(
    file: &mut R,
    offset: u64,
    limit: u64,
) -> error::Result<Vec<u8>> {
    let mut buf = [0u8; FDT_HEADER_LEN];
    file.read_exact_at(offset, &mut buf)?;
    let (_, header) = FdtHeader::from_bytes((&buf[..], 0))?;
    ensure_format!(header.magic == FDT_MAGIC, "not a device tree");
    ensure_format!(
        u64::from(header.totalsize) <= limit && header.totalsize as usize >= FDT_HEADER_LEN,
        "device tree size {} is out of range",
        header.totalsize
    );

    let mut tree = try_alloc(header.totalsize as usize)?;
    file.read_exact_at(offset, &mut tree)?;
    Ok(tree)
}

/// Identifies one module (processor, PMU, display...) of a board
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BoardId {
    pub board_id: u16,
    pub sku: u16,
    pub fab: u8,
}

impl FromStr for BoardId {
    type Err = anyhow::Error;

    /// Parse a board id in the form `ID:SKU:FAB`, all decimal
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let (Some(board_id), Some(sku), Some(fab), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(anyhow!("board id {s:?} is not ID:SKU:FAB"));
        };

        Ok(Self {
            board_id: board_id.parse().context("bad board id")?,
            sku: sku.parse().context("bad SKU")?,
            fab: fab.parse().context("bad fab")?,
        })
    }
}

impl fmt::Display for BoardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.board_id, self.sku, self.fab)
    }
}

/// Reports the board modules actually present
pub trait BoardQuery {
    fn board_modules(&self) -> anyhow::Result<Vec<BoardId>>;
}

impl BoardQuery for Vec<BoardId> {
    fn board_modules(&self) -> anyhow::Result<Vec<BoardId>> {
        Ok(self.clone())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Pass {
    FileName,
    BoardIds,
}

impl Pass {
    fn property(self) -> &'static str {
        match self {
            Self::FileName => PROP_DTS_FILENAME,
            Self::BoardIds => PROP_BOARD_IDS,
        }
    }
}

/// The file name part of a `nvidia,dtsfilename` value
fn basename(value: &[u8]) -> &[u8] {
    let value = value.split(|&b| b == 0).next().unwrap_or(value);
    match value.iter().rposition(|&b| b == b'/') {
        Some(slash) => &value[slash + 1..],
        None => value,
    }
}

/// The NUL-terminated strings of a string list value
fn substrings(value: &[u8]) -> Vec<&[u8]> {
    let count = value.iter().filter(|&&b| b == 0).count();
    value.split(|&b| b == 0).take(count).collect()
}

/// Lazily-queried list of the boards present
struct LiveBoards<'a> {
    query: &'a dyn BoardQuery,
    modules: Option<Vec<BoardId>>,
}

impl LiveBoards<'_> {
    fn contains(&mut self, id: &BoardId) -> error::Result<bool> {
        if self.modules.is_none() {
            self.modules = Some(self.query.board_modules()?);
        }
        Ok(self.modules.iter().flatten().any(|module| module == id))
    }
}

fn board_ids_match(
    flashed: &[u8],
    candidate: &[u8],
    live: &mut LiveBoards,
) -> error::Result<bool> {
    let flashed = substrings(flashed);
    let candidate = substrings(candidate);

    // Every id of the flashed tree has to be claimed by a distinct id of the candidate
    let mut claimed = vec![false; candidate.len()];
    for id in &flashed {
        let slot = candidate
            .iter()
            .zip(claimed.iter())
            .position(|(other, &taken)| !taken && other == id);
        match slot {
            Some(slot) => claimed[slot] = true,
            None => return Ok(false),
        }
    }

    if flashed.len() == candidate.len() {
        return Ok(true);
    }

    // The candidate names more modules than the flashed tree: they all have to be present
    for (id, _) in candidate.iter().zip(claimed).filter(|&(_, taken)| !taken) {
        let Some(board) = std::str::from_utf8(id)
            .ok()
            .and_then(|id| id.parse::<BoardId>().ok())
        else {
            return Ok(false);
        };
        if !live.contains(&board)? {
            return Ok(false);
        }
    }

    Ok(true)
}

/// Choose which of the DTB `candidates` in the blob matches this board.
///
/// Returns the catalog index of the chosen entry, or None when nothing matches.
pub fn select_dtb<S: Storage, R: Read + Seek>(
    storage: &S,
    dtb_partition: &str,
    blob: &mut R,
    candidates: &[&Entry],
    board: &dyn BoardQuery,
) -> error::Result<Option<usize>> {
    let id = storage
        .partition_id(dtb_partition)
        .ok_or_else(|| anyhow!("no partition named {dtb_partition}"))?;
    let size = storage.partition_info(id)?.size;
    let mut file = storage.open(dtb_partition, OpenMode::Read)?;
    let flashed_tree = read_fdt(&mut file, 0, size)?;
    drop(file);
    let flashed = Fdt::new(&flashed_tree)?;

    let mut live = LiveBoards {
        query: board,
        modules: None,
    };

    for pass in [Pass::FileName, Pass::BoardIds] {
        let Some(flashed_value) = flashed.root_property(pass.property())? else {
            log::debug!("Flashed DTB has no {} property", pass.property());
            continue;
        };

        for entry in candidates {
            let tree = read_fdt(blob, entry.blob_offset(), u64::from(entry.length))?;
            let fdt = Fdt::new(&tree)?;
            let Some(value) = fdt.root_property(pass.property())? else {
                continue;
            };

            let matched = match pass {
                Pass::FileName => basename(value) == basename(flashed_value),
                Pass::BoardIds => board_ids_match(flashed_value, value, &mut live)?,
            };
            if matched {
                log::info!("Selected DTB entry {} by {}", entry.index, pass.property());
                return Ok(Some(entry.index));
            }
        }
    }

    Ok(None)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Result;
    use crate::blob::Catalog;
    use crate::storage::SimStorage;
    use crate::testutil::{fdt, string_list, BlobBuilder};
    use std::io::Cursor;

    #[test]
    fn test_root_property() -> Result<()> {
        let tree = fdt(&[("model", b"board\0"), (PROP_BOARD_IDS, b"1:2:3\0")]);
        let fdt = Fdt::new(&tree)?;
        assert_eq!(fdt.root_property("model")?, Some(&b"board\0"[..]));
        assert_eq!(fdt.root_property(PROP_BOARD_IDS)?, Some(&b"1:2:3\0"[..]));
        assert_eq!(fdt.root_property("compatible")?, None);

        let mut bad = tree.clone();
        bad[0] = 0;
        assert!(matches!(Fdt::new(&bad), Err(Error::Format(_))));
        Ok(())
    }

    #[test]
    fn test_read_fdt() -> Result<()> {
        let tree = fdt(&[("model", b"x\0")]);
        let mut padded = vec![0xff; 8];
        padded.extend_from_slice(&tree);
        padded.extend_from_slice(&[0xff; 8]);

        assert_eq!(read_fdt(&mut Cursor::new(&padded), 8, 4096)?, tree);
        assert!(read_fdt(&mut Cursor::new(&padded), 8, 16).is_err());
        assert!(read_fdt(&mut Cursor::new(&padded), 0, 4096).is_err());
        Ok(())
    }

    #[test]
    fn test_board_id() -> anyhow::Result<()> {
        let id: BoardId = "1761:1100:4".parse()?;
        assert_eq!(
            id,
            BoardId {
                board_id: 1761,
                sku: 1100,
                fab: 4
            }
        );
        assert_eq!(id.to_string(), "1761:1100:4");
        assert!("1761:1100".parse::<BoardId>().is_err());
        assert!("1761:1100:4:0".parse::<BoardId>().is_err());
        assert!("1761:1100:300".parse::<BoardId>().is_err());
        Ok(())
    }

    #[test]
    fn test_helpers() {
        assert_eq!(basename(b"/path/to/board.dts\0"), b"board.dts");
        assert_eq!(basename(b"board.dts"), b"board.dts");
        assert_eq!(substrings(b"a\0bb\0c"), [&b"a"[..], &b"bb"[..]]);
    }

    #[test]
    fn test_board_ids_match() -> Result<()> {
        let present: Vec<BoardId> = vec!["10:0:1".parse()?, "20:0:2".parse()?];
        let mut live = LiveBoards {
            query: &present,
            modules: None,
        };

        let flashed = string_list(&["10:0:1"]);
        assert!(board_ids_match(&flashed, &string_list(&["10:0:1"]), &mut live)?);
        assert!(board_ids_match(
            &flashed,
            &string_list(&["20:0:2", "10:0:1"]),
            &mut live
        )?);
        assert!(!board_ids_match(
            &flashed,
            &string_list(&["10:0:1", "30:0:1"]),
            &mut live
        )?);
        assert!(!board_ids_match(&flashed, &string_list(&["20:0:2"]), &mut live)?);
        assert!(!board_ids_match(
            &flashed,
            &string_list(&["10:0:1", "junk"]),
            &mut live
        )?);
        Ok(())
    }

    fn setup(flashed: &[u8], candidates: &[Vec<u8>]) -> (SimStorage, Vec<u8>) {
        let storage = SimStorage::new();
        storage.add_partition("DTB", 4096);
        storage.load("DTB", flashed).unwrap();

        let mut builder = BlobBuilder::new().entry("APP", &[0; 16], 0);
        for candidate in candidates {
            builder = builder.entry("DTB", candidate, 0);
        }
        (storage, builder.build())
    }

    fn select(storage: &SimStorage, blob: &[u8], board: Vec<BoardId>) -> Result<Option<usize>> {
        let catalog = Catalog::read(&mut Cursor::new(blob))?;
        let candidates: Vec<&Entry> = catalog.entries_named("DTB").collect();
        select_dtb(storage, "DTB", &mut Cursor::new(blob), &candidates, &board)
    }

    #[test]
    fn test_select_by_filename() -> Result<()> {
        let flashed = fdt(&[(PROP_DTS_FILENAME, b"/src/board-b.dts\0")]);
        let (storage, blob) = setup(
            &flashed,
            &[
                fdt(&[(PROP_DTS_FILENAME, b"/build/board-a.dts\0")]),
                fdt(&[(PROP_DTS_FILENAME, b"/build/board-b.dts\0")]),
            ],
        );
        assert_eq!(select(&storage, &blob, vec![])?, Some(2));
        Ok(())
    }

    #[test]
    fn test_select_by_live_board() -> Result<()> {
        // The flashed tree has no file name, so board ids decide
        let flashed = fdt(&[(PROP_BOARD_IDS, &string_list(&["1761:1100:4"]))]);
        let (storage, blob) = setup(
            &flashed,
            &[
                fdt(&[(PROP_BOARD_IDS, &string_list(&["1761:1100:4", "2000:0:1"]))]),
                fdt(&[(PROP_BOARD_IDS, &string_list(&["1761:1100:4", "2001:0:1"]))]),
            ],
        );
        assert_eq!(
            select(&storage, &blob, vec!["2001:0:1".parse()?])?,
            Some(2)
        );
        assert_eq!(select(&storage, &blob, vec![])?, None);
        Ok(())
    }

    #[test]
    fn test_select_nothing() -> Result<()> {
        // Candidates without the property never match
        let flashed = fdt(&[(PROP_DTS_FILENAME, b"a.dts\0")]);
        let (storage, blob) = setup(&flashed, &[fdt(&[]), fdt(&[("model", b"x\0")])]);
        assert_eq!(select(&storage, &blob, vec![])?, None);

        // No flashed DTB at all
        let (storage, blob) = setup(&[], &[fdt(&[])]);
        assert!(select(&storage, &blob, vec![]).is_err());
        Ok(())
    }
}
