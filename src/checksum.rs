//! Rolling CRC32 over the expanded contents of a sparse image.
//!
//! Sparse images use the plain IEEE 802.3 CRC32. The accumulator can be inspected at any point
//! without disturbing it, since CRC32 chunks compare against the running value mid-stream.

use crc::{Crc, Digest, CRC_32_ISO_HDLC};

pub static SPARSE_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// An incremental CRC32 accumulator
#[derive(Clone)]
pub struct Crc32 {
    digest: Digest<'static, u32>,
}

impl Crc32 {
    pub fn new() -> Self {
        Self {
            digest: SPARSE_CRC.digest(),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.digest.update(bytes);
    }

    /// Feed `count` zero bytes, as produced by a DONT_CARE region
    pub fn update_zeros(&mut self, mut count: u64) {
        const ZEROS: [u8; 4096] = [0; 4096];
        while count > 0 {
            let n = count.min(ZEROS.len() as u64) as usize;
            self.digest.update(&ZEROS[..n]);
            count -= n as u64;
        }
    }

    /// The CRC of everything fed so far
    pub fn value(&self) -> u32 {
        self.digest.clone().finalize()
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Crc32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Crc32({:#010x})", self.value())
    }
}

#[test]
fn test_crc32() {
    // The standard check value for CRC-32/ISO-HDLC
    let mut crc = Crc32::new();
    crc.update(b"123456789");
    assert_eq!(crc.value(), 0xCBF43926);

    // Peeking doesn't disturb the accumulator, and feeding in pieces is the same as feeding once
    let mut split = Crc32::new();
    split.update(b"1234");
    assert_eq!(split.value(), SPARSE_CRC.checksum(b"1234"));
    split.update(b"56789");
    assert_eq!(split.value(), crc.value());
}

#[test]
fn test_crc32_zeros() {
    let mut zeros = Crc32::new();
    zeros.update_zeros(10000);
    assert_eq!(zeros.value(), SPARSE_CRC.checksum(&[0u8; 10000]));
}
