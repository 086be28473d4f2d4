//! Builders for the binary formats the installer consumes, shared by the unit tests.

use std::sync::OnceLock;

use bytes::BufMut;
use deku::DekuContainerWrite;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha1::{Digest, Sha1};

use crate::blob::{BlobHeader, ImageEntry, UpdateHeader, IMAGE_ENTRY_LEN, UPDATE_HEADER_LEN};
use crate::checksum::Crc32;
use crate::sparse::{
    ChunkHeader, SparseHeader, CHUNK_HEADER_LEN, CHUNK_TYPE_CRC32, CHUNK_TYPE_DONT_CARE,
    CHUNK_TYPE_FILL, CHUNK_TYPE_RAW, SPARSE_HEADER_LEN, SPARSE_MAGIC,
};

fn key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| {
        RsaPrivateKey::from_pkcs1_pem(include_str!("testdata/blob_key.pem"))
            .expect("test key should parse")
    })
}

/// Big-endian modulus of the test signing key
pub fn modulus() -> Vec<u8> {
    key().n().to_bytes_be()
}

/// Sign `message` with the test key, returning (modulus, signature)
pub fn sign(message: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let digest = Sha1::digest(message);
    let signature = key()
        .sign(Pkcs1v15Sign::new::<Sha1>(), &digest)
        .expect("signing should succeed");
    (modulus(), signature)
}

/// Wrap an update payload (UpdateHeader onwards) into a signed blob
pub fn sign_blob(payload: &[u8]) -> Vec<u8> {
    let (_, signature) = sign(payload);
    let header = BlobHeader::new(payload.len() as u32, signature.len() as u32);

    let mut blob = header.to_bytes().unwrap();
    blob.extend_from_slice(payload);
    blob.extend_from_slice(&signature);
    blob
}

/// Assembles signed blobs from a list of entries
#[derive(Debug, Default)]
pub struct BlobBuilder {
    entries: Vec<(String, Vec<u8>, u32, bool)>,
}

impl BlobBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(mut self, name: &str, data: &[u8], version: u32) -> Self {
        self.entries
            .push((name.to_owned(), data.to_owned(), version, false));
        self
    }

    pub fn encrypted_entry(mut self, name: &str, data: &[u8], version: u32) -> Self {
        self.entries
            .push((name.to_owned(), data.to_owned(), version, true));
        self
    }

    /// The payload: update header, entry table right after it, then the entries' data
    pub fn payload(&self) -> Vec<u8> {
        let table_len = self.entries.len() * IMAGE_ENTRY_LEN;
        let mut offset = UPDATE_HEADER_LEN + table_len;

        let mut table = Vec::new();
        let mut data = Vec::new();
        for (name, content, version, encrypted) in &self.entries {
            let entry = ImageEntry::new(
                name,
                offset as u32,
                content.len() as u32,
                *version,
                *encrypted,
            );
            table.extend(entry.to_bytes().unwrap());
            data.extend_from_slice(content);
            offset += content.len();
        }

        let update = UpdateHeader::new(
            UPDATE_HEADER_LEN as u32,
            self.entries.len() as u32,
            offset as u32,
        );
        let mut payload = update.to_bytes().unwrap();
        payload.extend(table);
        payload.extend(data);
        payload
    }

    pub fn build(&self) -> Vec<u8> {
        sign_blob(&self.payload())
    }
}

/// Assembles sparse images, keeping track of what they should decode to
#[derive(Debug, Clone)]
pub struct SparseBuilder {
    blk_sz: u32,
    file_hdr_sz: u16,
    chunk_hdr_sz: u16,
    body: Vec<u8>,
    expanded: Vec<u8>,
    total_blks: u32,
    total_chunks: u32,
}

impl SparseBuilder {
    pub fn new(blk_sz: u32) -> Self {
        Self {
            blk_sz,
            file_hdr_sz: SPARSE_HEADER_LEN as u16,
            chunk_hdr_sz: CHUNK_HEADER_LEN as u16,
            body: Vec::new(),
            expanded: Vec::new(),
            total_blks: 0,
            total_chunks: 0,
        }
    }

    /// Use larger-than-standard headers, as a newer format revision might
    ///
    /// Must be called before any chunks are added.
    pub fn header_sizes(mut self, file_hdr_sz: u16, chunk_hdr_sz: u16) -> Self {
        assert!(self.body.is_empty());
        self.file_hdr_sz = file_hdr_sz;
        self.chunk_hdr_sz = chunk_hdr_sz;
        self
    }

    fn chunk(&mut self, chunk_type: u16, chunk_sz: u32, total_sz: u32) {
        let header = ChunkHeader {
            chunk_type,
            reserved: 0,
            chunk_sz,
            total_sz,
        };
        self.body.extend(header.to_bytes().unwrap());
        let padding = usize::from(self.chunk_hdr_sz) - CHUNK_HEADER_LEN;
        self.body.resize(self.body.len() + padding, 0);
        self.total_chunks += 1;
        self.total_blks += chunk_sz;
    }

    pub fn raw(self, data: &[u8]) -> Self {
        let total_sz = u32::from(self.chunk_hdr_sz) + data.len() as u32;
        self.raw_with_total_sz(data, total_sz)
    }

    /// A RAW chunk that lies about its size
    pub fn raw_with_total_sz(mut self, data: &[u8], total_sz: u32) -> Self {
        assert_eq!(data.len() % self.blk_sz as usize, 0);
        self.chunk(CHUNK_TYPE_RAW, data.len() as u32 / self.blk_sz, total_sz);
        self.body.extend_from_slice(data);
        self.expanded.extend_from_slice(data);
        self
    }

    pub fn fill(mut self, pattern: [u8; 4], blocks: u32) -> Self {
        self.chunk(CHUNK_TYPE_FILL, blocks, u32::from(self.chunk_hdr_sz) + 4);
        self.body.extend_from_slice(&pattern);
        for _ in 0..(blocks * self.blk_sz / 4) {
            self.expanded.extend_from_slice(&pattern);
        }
        self
    }

    pub fn dont_care(mut self, blocks: u32) -> Self {
        self.chunk(CHUNK_TYPE_DONT_CARE, blocks, u32::from(self.chunk_hdr_sz));
        let len = self.expanded.len() + (blocks * self.blk_sz) as usize;
        self.expanded.resize(len, 0);
        self
    }

    /// A CRC32 checkpoint; `None` means the correct value
    pub fn crc32(mut self, value: Option<u32>) -> Self {
        let value = value.unwrap_or_else(|| self.crc());
        self.chunk(CHUNK_TYPE_CRC32, 0, u32::from(self.chunk_hdr_sz) + 4);
        self.body.extend_from_slice(&value.to_le_bytes());
        self
    }

    fn crc(&self) -> u32 {
        let mut crc = Crc32::new();
        crc.update(&self.expanded);
        crc.value()
    }

    /// What the image decodes to, with holes as zeros
    pub fn expanded(&self) -> Vec<u8> {
        self.expanded.clone()
    }

    pub fn build(&self) -> Vec<u8> {
        self.build_with_checksum(self.crc())
    }

    pub fn build_with_checksum(&self, image_checksum: u32) -> Vec<u8> {
        let header = SparseHeader {
            magic: SPARSE_MAGIC,
            major_version: 1,
            minor_version: 0,
            file_hdr_sz: self.file_hdr_sz,
            chunk_hdr_sz: self.chunk_hdr_sz,
            blk_sz: self.blk_sz,
            total_blks: self.total_blks,
            total_chunks: self.total_chunks,
            image_checksum,
        };

        let mut image = header.to_bytes().unwrap();
        image.resize(usize::from(self.file_hdr_sz), 0);
        image.extend_from_slice(&self.body);
        image
    }
}

const FDT_MAGIC: u32 = 0xd00dfeed;
const FDT_BEGIN_NODE: u32 = 1;
const FDT_END_NODE: u32 = 2;
const FDT_PROP: u32 = 3;
const FDT_END: u32 = 9;

fn put_padded(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.put_slice(bytes);
    while buf.len() % 4 != 0 {
        buf.put_u8(0);
    }
}

/// Build a flattened device tree whose root node carries `props`, plus one empty child node
pub fn fdt(props: &[(&str, &[u8])]) -> Vec<u8> {
    let mut strings = Vec::new();
    let mut structure = Vec::new();

    structure.put_u32(FDT_BEGIN_NODE);
    put_padded(&mut structure, b"\0");
    for (name, value) in props {
        let nameoff = strings.len() as u32;
        strings.put_slice(name.as_bytes());
        strings.put_u8(0);

        structure.put_u32(FDT_PROP);
        structure.put_u32(value.len() as u32);
        structure.put_u32(nameoff);
        put_padded(&mut structure, value);
    }
    structure.put_u32(FDT_BEGIN_NODE);
    put_padded(&mut structure, b"chosen\0");
    structure.put_u32(FDT_END_NODE);
    structure.put_u32(FDT_END_NODE);
    structure.put_u32(FDT_END);

    let rsvmap_off = 40u32;
    let struct_off = rsvmap_off + 16;
    let strings_off = struct_off + structure.len() as u32;
    let total = strings_off + strings.len() as u32;

    let mut blob = Vec::new();
    blob.put_u32(FDT_MAGIC);
    blob.put_u32(total);
    blob.put_u32(struct_off);
    blob.put_u32(strings_off);
    blob.put_u32(rsvmap_off);
    blob.put_u32(17);
    blob.put_u32(16);
    blob.put_u32(0);
    blob.put_u32(strings.len() as u32);
    blob.put_u32(structure.len() as u32);
    blob.put_bytes(0, 16);
    blob.extend(structure);
    blob.extend(strings);
    blob
}

/// A NUL-separated string list property value
pub fn string_list(items: &[&str]) -> Vec<u8> {
    let mut value = Vec::new();
    for item in items {
        value.extend_from_slice(item.as_bytes());
        value.push(0);
    }
    value
}
