//! The hash/cipher service used for signature checks and bootloader signing.
//!
//! On a device these primitives are usually backed by a security engine holding keys the CPU
//! never sees, so callers only ever name a [KeySlot]. [SoftCrypto] is the software rendition
//! used on the host and in tests.

use aes::Aes128;
use anyhow::{anyhow, ensure};
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cmac::{Cmac, Mac};
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha1::{Digest, Sha1};

pub const AES_BLOCK_SIZE: usize = 16;

/// Which key an AES operation runs with
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KeySlot {
    /// The fused secure boot key
    SecureBootKey,
    /// The caller-specified key, all zeros on parts that are not secured
    User,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CipherDirection {
    Encrypt,
    Decrypt,
}

/// An in-progress hash or MAC computation
pub trait HashStream {
    fn update(&mut self, data: &[u8]);

    /// Consume the stream, producing the digest
    fn finalize(self: Box<Self>) -> Vec<u8>;
}

pub trait CryptoService {
    /// Begin a SHA-1 digest
    fn sha1(&self) -> Box<dyn HashStream>;

    /// Begin an AES-128-CMAC under the given key
    fn cmac(&self, key: KeySlot) -> anyhow::Result<Box<dyn HashStream>>;

    /// AES-128-CBC with a zero IV, in place. `data` must be a whole number of AES blocks.
    fn aes_cbc(
        &self,
        key: KeySlot,
        direction: CipherDirection,
        data: &mut [u8],
    ) -> anyhow::Result<()>;

    /// Check an RSA PKCS#1 v1.5 signature over a SHA-1 digest.
    ///
    /// `modulus` and `signature` are big-endian. Returns Ok(false) on a well-formed signature
    /// that doesn't match; errors are reserved for unusable keys.
    fn rsa_verify_sha1(
        &self,
        digest: &[u8],
        modulus: &[u8],
        exponent: u32,
        signature: &[u8],
    ) -> anyhow::Result<bool>;
}

impl HashStream for Sha1 {
    fn update(&mut self, data: &[u8]) {
        Digest::update(self, data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        Digest::finalize(*self).to_vec()
    }
}

impl HashStream for Cmac<Aes128> {
    fn update(&mut self, data: &[u8]) {
        Mac::update(self, data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        Mac::finalize(*self).into_bytes().to_vec()
    }
}

/// Software crypto on top of the RustCrypto crates
#[derive(Clone)]
pub struct SoftCrypto {
    sbk: [u8; AES_BLOCK_SIZE],
    user_key: [u8; AES_BLOCK_SIZE],
}

impl SoftCrypto {
    /// Create a service with the given secure boot key, and an all-zero user key
    pub fn new(sbk: [u8; AES_BLOCK_SIZE]) -> Self {
        Self {
            sbk,
            user_key: [0; AES_BLOCK_SIZE],
        }
    }

    /// Replace the user key
    pub fn user_key(mut self, key: [u8; AES_BLOCK_SIZE]) -> Self {
        self.user_key = key;
        self
    }

    fn key(&self, slot: KeySlot) -> &[u8; AES_BLOCK_SIZE] {
        match slot {
            KeySlot::SecureBootKey => &self.sbk,
            KeySlot::User => &self.user_key,
        }
    }
}

impl Default for SoftCrypto {
    fn default() -> Self {
        Self::new([0; AES_BLOCK_SIZE])
    }
}

impl std::fmt::Debug for SoftCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Keys stay out of logs
        f.debug_struct("SoftCrypto").finish_non_exhaustive()
    }
}

impl CryptoService for SoftCrypto {
    fn sha1(&self) -> Box<dyn HashStream> {
        Box::new(Sha1::new())
    }

    fn cmac(&self, key: KeySlot) -> anyhow::Result<Box<dyn HashStream>> {
        let mac = <Cmac<Aes128> as Mac>::new_from_slice(self.key(key))
            .map_err(|e| anyhow!("bad CMAC key: {e}"))?;
        Ok(Box::new(mac))
    }

    fn aes_cbc(
        &self,
        key: KeySlot,
        direction: CipherDirection,
        data: &mut [u8],
    ) -> anyhow::Result<()> {
        ensure!(
            data.len() % AES_BLOCK_SIZE == 0,
            "AES-CBC data is not a whole number of blocks ({} bytes)",
            data.len()
        );

        let iv = [0u8; AES_BLOCK_SIZE];
        let len = data.len();
        match direction {
            CipherDirection::Encrypt => {
                cbc::Encryptor::<Aes128>::new(self.key(key).into(), (&iv).into())
                    .encrypt_padded_mut::<NoPadding>(data, len)
                    .map_err(|e| anyhow!("AES-CBC encryption failed: {e:?}"))?;
            }
            CipherDirection::Decrypt => {
                cbc::Decryptor::<Aes128>::new(self.key(key).into(), (&iv).into())
                    .decrypt_padded_mut::<NoPadding>(data)
                    .map_err(|e| anyhow!("AES-CBC decryption failed: {e:?}"))?;
            }
        }

        Ok(())
    }

    fn rsa_verify_sha1(
        &self,
        digest: &[u8],
        modulus: &[u8],
        exponent: u32,
        signature: &[u8],
    ) -> anyhow::Result<bool> {
        let key = RsaPublicKey::new(
            BigUint::from_bytes_be(modulus),
            BigUint::from(exponent),
        )?;

        Ok(key
            .verify(Pkcs1v15Sign::new::<Sha1>(), digest, signature)
            .is_ok())
    }
}
