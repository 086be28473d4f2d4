//! Streaming decoder for the chunked "sparse" image container.
//!
//! A sparse image is a file header followed by chunks, each describing a run of output blocks:
//! literal data (RAW), a repeated 4-byte pattern (FILL), a hole that is skipped over
//! (DONT_CARE), or a CRC32 checkpoint over everything produced so far.
//!
//! Images arrive from the staging partition one window at a time, and a window boundary can
//! land anywhere, including in the middle of a header. [SparseDecoder] therefore keeps a small
//! amount of state between calls: which record it is in the middle of, the bytes of a partial
//! header, and any padding still owed by headers that are larger than this decoder knows about.

use std::io::{Read, Seek, SeekFrom, Write};

use deku::prelude::*;

use crate::checksum::Crc32;
use crate::crypto::HashStream;
use crate::error::{self, ensure_format, try_alloc, Error};
use crate::util::ReadExt;

pub const SPARSE_MAGIC: u32 = 0xed26ff3a;
pub const SPARSE_MAJOR_VERSION: u16 = 1;
pub const SPARSE_HEADER_LEN: usize = 28;
pub const CHUNK_HEADER_LEN: usize = 12;

pub const CHUNK_TYPE_RAW: u16 = 0xcac1;
pub const CHUNK_TYPE_FILL: u16 = 0xcac2;
pub const CHUNK_TYPE_DONT_CARE: u16 = 0xcac3;
pub const CHUNK_TYPE_CRC32: u16 = 0xcac4;

/// FILL chunks are expanded and written at most this many blocks at a time
const FILL_BATCH_BLOCKS: u32 = 256;

/// DONT_CARE regions are fed to an attached digest in windows of at most this many zero bytes
const ZERO_WINDOW: usize = 64 * 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct SparseHeader {
    pub magic: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub file_hdr_sz: u16,
    pub chunk_hdr_sz: u16,
    pub blk_sz: u32,
    pub total_blks: u32,
    pub total_chunks: u32,
    pub image_checksum: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct ChunkHeader {
    pub chunk_type: u16,
    pub reserved: u16,
    /// Size of the chunk's output, in blocks
    pub chunk_sz: u32,
    /// Size of the chunk in the input, in bytes, including the chunk header
    pub total_sz: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChunkKind {
    Raw,
    Fill,
    DontCare,
    Crc32,
}

impl TryFrom<u16> for ChunkKind {
    type Error = Error;

    fn try_from(chunk_type: u16) -> error::Result<Self> {
        Ok(match chunk_type {
            CHUNK_TYPE_RAW => Self::Raw,
            CHUNK_TYPE_FILL => Self::Fill,
            CHUNK_TYPE_DONT_CARE => Self::DontCare,
            CHUNK_TYPE_CRC32 => Self::Crc32,
            other => return Err(Error::UnsupportedChunkType(other)),
        })
    }
}

impl SparseHeader {
    /// Parse and sanity-check a file header
    fn parse(bytes: &[u8]) -> error::Result<Self> {
        let (_, header) = Self::from_bytes((bytes, 0))?;

        ensure_format!(
            header.magic == SPARSE_MAGIC,
            "bad sparse magic {:#010x}",
            header.magic
        );
        ensure_format!(
            header.major_version == SPARSE_MAJOR_VERSION,
            "unsupported sparse major version {}",
            header.major_version
        );
        ensure_format!(
            usize::from(header.file_hdr_sz) >= SPARSE_HEADER_LEN,
            "sparse file header size {} too small",
            header.file_hdr_sz
        );
        ensure_format!(
            usize::from(header.chunk_hdr_sz) >= CHUNK_HEADER_LEN,
            "sparse chunk header size {} too small",
            header.chunk_hdr_sz
        );
        ensure_format!(
            header.blk_sz != 0 && header.blk_sz % 4 == 0,
            "invalid sparse block size {}",
            header.blk_sz
        );

        Ok(header)
    }
}

/// Does this buffer begin with a sparse image header?
pub fn is_sparse(buf: &[u8]) -> bool {
    buf.len() >= SPARSE_HEADER_LEN && buf[..4] == SPARSE_MAGIC.to_le_bytes()
}

/// The record the decoder is in the middle of
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Unit {
    FileHeader,
    ChunkHeader,
    Raw { remaining: u64 },
    /// Waiting on the fill pattern for a FILL chunk of this many blocks
    Fill { blocks: u32 },
    /// Waiting on the value of a CRC32 chunk
    Crc32,
}

impl Unit {
    /// Length of the fixed-size record this unit accumulates
    fn record_len(self) -> usize {
        match self {
            Unit::FileHeader => SPARSE_HEADER_LEN,
            Unit::ChunkHeader => CHUNK_HEADER_LEN,
            Unit::Fill { .. } | Unit::Crc32 => 4,
            Unit::Raw { .. } => 0,
        }
    }
}

/// Per-image decoding state, created by the first buffer of an image
#[derive(Debug)]
struct DecoderState {
    header: Option<SparseHeader>,
    unit: Unit,
    /// Partial record bytes carried over from the previous buffer
    scratch: Vec<u8>,
    /// Padding still to be discarded after an oversized header
    skip: u64,
    crc: Crc32,
    /// Output blocks produced (or skipped) so far
    blocks: u64,
}

/// A re-entrant sparse image decoder.
///
/// Feed it an image with any number of [decode](SparseDecoder::decode) calls, the first one
/// flagged `is_first` and the last one flagged `is_last`. All per-image state is dropped after
/// the last buffer, or as soon as an error is returned.
pub struct SparseDecoder {
    verify_crc: bool,
    digest: Option<Box<dyn HashStream>>,
    state: Option<DecoderState>,
}

impl SparseDecoder {
    /// Create a decoder. With `verify_crc`, CRC32 chunks and a nonzero `image_checksum` are
    /// checked against the decoded data; without it, CRC32 chunks are rejected.
    pub fn new(verify_crc: bool) -> Self {
        Self {
            verify_crc,
            digest: None,
            state: None,
        }
    }

    /// Also feed the decoded image (holes included, as zeros) into `digest`
    pub fn with_digest(mut self, digest: Box<dyn HashStream>) -> Self {
        self.digest = Some(digest);
        self
    }

    /// Detach the digest, if one was attached
    pub fn take_digest(&mut self) -> Option<Box<dyn HashStream>> {
        self.digest.take()
    }

    /// Is the decoder partway through an image?
    pub fn in_progress(&self) -> bool {
        self.state.is_some()
    }

    /// Decode the next buffer of an image into `out`.
    ///
    /// Writes go to the current position of `out`; holes are skipped with a relative seek.
    pub fn decode<W: Write + Seek>(
        &mut self,
        out: &mut W,
        buf: &[u8],
        is_first: bool,
        is_last: bool,
    ) -> error::Result<()> {
        if is_first {
            self.state = Some(DecoderState::new());
        }

        let verify_crc = self.verify_crc;
        let result = match self.state.as_mut() {
            None => Err(Error::format("sparse data without an image header")),
            Some(state) => state
                .feed(out, buf, verify_crc, &mut self.digest)
                .and_then(|()| {
                    if is_last {
                        state.finish(verify_crc)
                    } else {
                        Ok(())
                    }
                }),
        };

        if is_last || result.is_err() {
            self.state = None;
        }

        result
    }

    /// Decode an entire image from `input`, reading it `window` bytes at a time.
    pub fn decode_all<R: Read, W: Write + Seek>(
        &mut self,
        input: &mut R,
        out: &mut W,
        window: usize,
    ) -> error::Result<()> {
        let mut current = Vec::new();
        input.read_to_vec(&mut current, window)?;

        let mut is_first = true;
        loop {
            // Read ahead, so that the last window can be flagged as such
            let mut next = Vec::new();
            if current.len() == window {
                input.read_to_vec(&mut next, window)?;
            }

            let is_last = next.is_empty();
            self.decode(out, &current, is_first, is_last)?;
            if is_last {
                return Ok(());
            }

            is_first = false;
            current = next;
        }
    }
}

impl DecoderState {
    fn new() -> Self {
        Self {
            header: None,
            unit: Unit::FileHeader,
            scratch: Vec::with_capacity(SPARSE_HEADER_LEN),
            skip: 0,
            crc: Crc32::new(),
            blocks: 0,
        }
    }

    fn header(&self) -> error::Result<SparseHeader> {
        self.header
            .ok_or_else(|| Error::format("sparse chunk before the file header"))
    }

    /// Write decoded bytes, accounting for them in the CRC and digest
    fn emit<W: Write>(
        &mut self,
        out: &mut W,
        data: &[u8],
        digest: &mut Option<Box<dyn HashStream>>,
    ) -> error::Result<()> {
        out.write_all(data)?;
        self.crc.update(data);
        if let Some(digest) = digest {
            digest.update(data);
        }
        Ok(())
    }

    fn feed<W: Write + Seek>(
        &mut self,
        out: &mut W,
        mut buf: &[u8],
        verify_crc: bool,
        digest: &mut Option<Box<dyn HashStream>>,
    ) -> error::Result<()> {
        while !buf.is_empty() {
            if self.skip > 0 {
                let n = self.skip.min(buf.len() as u64) as usize;
                buf = &buf[n..];
                self.skip -= n as u64;
                continue;
            }

            if let Unit::Raw { remaining } = self.unit {
                let n = remaining.min(buf.len() as u64) as usize;
                let (data, rest) = buf.split_at(n);
                buf = rest;
                self.emit(out, data, digest)?;

                let remaining = remaining - n as u64;
                self.unit = if remaining == 0 {
                    Unit::ChunkHeader
                } else {
                    Unit::Raw { remaining }
                };
                continue;
            }

            // Everything else is a fixed-size record, possibly split across buffers
            let want = self.unit.record_len() - self.scratch.len();
            let n = want.min(buf.len());
            self.scratch.extend_from_slice(&buf[..n]);
            buf = &buf[n..];

            if self.scratch.len() == self.unit.record_len() {
                let record = std::mem::take(&mut self.scratch);
                self.complete(out, &record, verify_crc, digest)?;
                self.scratch = record;
                self.scratch.clear();
            }
        }

        Ok(())
    }

    /// Act on a fully-received record
    fn complete<W: Write + Seek>(
        &mut self,
        out: &mut W,
        record: &[u8],
        verify_crc: bool,
        digest: &mut Option<Box<dyn HashStream>>,
    ) -> error::Result<()> {
        match self.unit {
            Unit::FileHeader => {
                let header = SparseHeader::parse(record)?;
                self.skip = u64::from(header.file_hdr_sz) - SPARSE_HEADER_LEN as u64;
                self.header = Some(header);
                self.unit = Unit::ChunkHeader;
            }

            Unit::ChunkHeader => {
                let header = self.header()?;
                let (_, chunk) = ChunkHeader::from_bytes((record, 0))?;
                self.skip = u64::from(header.chunk_hdr_sz) - CHUNK_HEADER_LEN as u64;
                self.unit = self.start_chunk(out, &header, &chunk, verify_crc, digest)?;
            }

            Unit::Fill { blocks } => {
                let header = self.header()?;
                let pattern = [record[0], record[1], record[2], record[3]];
                self.fill(out, &header, blocks, pattern, digest)?;
                self.unit = Unit::ChunkHeader;
            }

            Unit::Crc32 => {
                let expected = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
                let actual = self.crc.value();
                if expected != actual {
                    return Err(Error::checksum(format!(
                        "CRC32 chunk expects {expected:#010x}, image so far is {actual:#010x}"
                    )));
                }
                self.unit = Unit::ChunkHeader;
            }

            Unit::Raw { .. } => {}
        }

        Ok(())
    }

    /// Validate a chunk header and determine what comes after it
    fn start_chunk<W: Write + Seek>(
        &mut self,
        out: &mut W,
        header: &SparseHeader,
        chunk: &ChunkHeader,
        verify_crc: bool,
        digest: &mut Option<Box<dyn HashStream>>,
    ) -> error::Result<Unit> {
        let kind = ChunkKind::try_from(chunk.chunk_type)?;
        let hdr_sz = u64::from(header.chunk_hdr_sz);
        let data_bytes = u64::from(chunk.chunk_sz) * u64::from(header.blk_sz);
        let total_sz = u64::from(chunk.total_sz);

        let next = match kind {
            ChunkKind::Raw => {
                ensure_format!(
                    total_sz == hdr_sz + data_bytes,
                    "RAW chunk of {} blocks has total_sz {total_sz}",
                    chunk.chunk_sz
                );
                if data_bytes == 0 {
                    Unit::ChunkHeader
                } else {
                    Unit::Raw {
                        remaining: data_bytes,
                    }
                }
            }

            ChunkKind::Fill => {
                ensure_format!(
                    total_sz == hdr_sz + 4,
                    "FILL chunk has total_sz {total_sz}"
                );
                Unit::Fill {
                    blocks: chunk.chunk_sz,
                }
            }

            ChunkKind::DontCare => {
                ensure_format!(
                    total_sz == hdr_sz,
                    "DONT_CARE chunk has total_sz {total_sz}"
                );
                let offset = i64::try_from(data_bytes)
                    .map_err(|_| Error::format("DONT_CARE chunk too large"))?;
                out.seek(SeekFrom::Current(offset))?;

                self.crc.update_zeros(data_bytes);
                if let Some(digest) = digest {
                    let zeros = try_alloc(ZERO_WINDOW.min(data_bytes as usize))?;
                    let mut left = data_bytes;
                    while left > 0 {
                        let n = left.min(zeros.len() as u64) as usize;
                        digest.update(&zeros[..n]);
                        left -= n as u64;
                    }
                }

                Unit::ChunkHeader
            }

            ChunkKind::Crc32 => {
                ensure_format!(
                    verify_crc,
                    "CRC32 chunk in an image decoded without checksum verification"
                );
                ensure_format!(
                    total_sz == hdr_sz + 4,
                    "CRC32 chunk has total_sz {total_sz}"
                );
                Unit::Crc32
            }
        };

        self.blocks += u64::from(chunk.chunk_sz);
        Ok(next)
    }

    /// Write `blocks` blocks of a repeated 4-byte pattern
    fn fill<W: Write>(
        &mut self,
        out: &mut W,
        header: &SparseHeader,
        blocks: u32,
        pattern: [u8; 4],
        digest: &mut Option<Box<dyn HashStream>>,
    ) -> error::Result<()> {
        let block_len = header.blk_sz as usize;
        let mut batch = try_alloc(block_len * blocks.min(FILL_BATCH_BLOCKS) as usize)?;
        for word in batch.chunks_exact_mut(4) {
            word.copy_from_slice(&pattern);
        }

        let mut left = blocks;
        while left > 0 {
            let n = left.min(FILL_BATCH_BLOCKS);
            self.emit(out, &batch[..n as usize * block_len], digest)?;
            left -= n;
        }

        Ok(())
    }

    /// Checks run once the last buffer of an image has been consumed
    fn finish(&self, verify_crc: bool) -> error::Result<()> {
        let header = self.header()?;
        ensure_format!(
            self.unit == Unit::ChunkHeader && self.scratch.is_empty() && self.skip == 0,
            "sparse image ends in the middle of a chunk"
        );
        ensure_format!(
            self.blocks == u64::from(header.total_blks),
            "sparse image describes {} blocks, header says {}",
            self.blocks,
            header.total_blks
        );

        if verify_crc && header.image_checksum != 0 {
            let actual = self.crc.value();
            if actual != header.image_checksum {
                return Err(Error::checksum(format!(
                    "image checksum is {:#010x}, expected {:#010x}",
                    actual, header.image_checksum
                )));
            }
        }

        Ok(())
    }
}
