//! Whole-blob signature verification.
//!
//! The signature covers the `ActualBlobSize` bytes following the [BlobHeader], and is stored
//! right after them. The blob is hashed in windows so that even very large blobs never need
//! to fit in memory.

use std::io::{Read, Seek};

use crate::blob::{BlobHeader, BLOB_HEADER_LEN};
use crate::crypto::CryptoService;
use crate::error::{ensure_format, try_alloc, Error, Result};
use crate::util::SeekReadExt;

/// Largest amount of blob hashed per read
pub const VERIFY_WINDOW: usize = 1024 * 1024;

pub struct SignatureVerifier<'a> {
    crypto: &'a dyn CryptoService,
    modulus: &'a [u8],
    exponent: u32,
    window: usize,
}

impl<'a> SignatureVerifier<'a> {
    pub fn new(crypto: &'a dyn CryptoService, modulus: &'a [u8], exponent: u32) -> Self {
        Self {
            crypto,
            modulus,
            exponent,
            window: VERIFY_WINDOW,
        }
    }

    /// Use a smaller read window
    pub fn window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    /// Authenticate the blob at the start of `blob`, returning its header.
    ///
    /// Nothing is written.
    pub fn verify<R: Read + Seek>(&self, blob: &mut R) -> Result<BlobHeader> {
        let mut buf = [0u8; BLOB_HEADER_LEN];
        blob.read_exact_at(0, &mut buf)?;
        let header = BlobHeader::parse(&buf)?;
        ensure_format!(
            header.signature_size as usize == self.modulus.len(),
            "signature is {} bytes, expected {}",
            header.signature_size,
            self.modulus.len()
        );

        let total = u64::from(header.actual_blob_size);
        let rpt = howudoin::new().label("Verifying blob signature");
        rpt.set_len(Some(total.div_ceil(self.window as u64)));

        let mut hasher = self.crypto.sha1();
        let mut window = try_alloc(self.window.min(total as usize))?;
        let mut remaining = total;
        blob.seek(std::io::SeekFrom::Start(BLOB_HEADER_LEN as u64))?;
        while remaining > 0 {
            let n = remaining.min(window.len() as u64) as usize;
            blob.read_exact(&mut window[..n])?;
            hasher.update(&window[..n]);
            remaining -= n as u64;
            rpt.inc();
        }
        let digest = hasher.finalize();

        let mut signature = try_alloc(header.signature_size as usize)?;
        blob.read_exact(&mut signature)?;

        let valid =
            self.crypto
                .rsa_verify_sha1(&digest, self.modulus, self.exponent, &signature)?;
        rpt.close();

        if !valid {
            log::warn!("Blob signature verification failed");
            return Err(Error::checksum("blob signature does not match"));
        }

        log::debug!("Blob signature verified ({total} bytes)");
        Ok(header)
    }
}
