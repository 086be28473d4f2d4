//! The boot configuration table (BCT): what the boot ROM reads to find the bootloaders.
//!
//! The installer only ever touches a handful of BCT fields: the per-slot bootloader records,
//! the device parameter tables, and the signature. [BootConfigTable] exposes exactly those,
//! so that the chip-specific layout stays behind the trait. [SimBct] is a simple layout of
//! our own, used on the host and in tests.

use anyhow::{bail, ensure};
use bytes::{Buf, BufMut, BytesMut};

use crate::config::FuseMode;
use crate::crypto::{CipherDirection, CryptoService, AES_BLOCK_SIZE};
use crate::util::align_up;

/// The BCT record describing one redundant bootloader copy
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BctFieldSet {
    pub version: u32,
    /// Length of the padded bootloader image, in bytes
    pub length: u32,
    pub start_block: u32,
    /// Page within `start_block`
    pub start_page: u32,
    /// CMAC of the bootloader image as written
    pub hash: Vec<u8>,
}

pub trait BootConfigTable {
    /// log2 of the boot device's erase block size
    fn block_size_log2(&self) -> u32;

    /// log2 of the boot device's page size
    fn page_size_log2(&self) -> u32;

    fn bootloader_slot(&self, slot: usize) -> anyhow::Result<BctFieldSet>;

    fn set_bootloader_slot(&mut self, slot: usize, fields: &BctFieldSet) -> anyhow::Result<()>;

    /// Take over the SDRAM, boot device and device type parameters of a received (plaintext)
    /// table, keeping everything else.
    fn absorb_device_params(&mut self, received: &[u8]) -> anyhow::Result<()>;

    /// Replace the whole table with a received one
    fn replace(&mut self, received: &[u8]) -> anyhow::Result<()>;

    /// Produce the table as stored: encrypted and/or signed as the fuse mode requires
    fn seal(&self, mode: FuseMode, crypto: &dyn CryptoService) -> anyhow::Result<Vec<u8>>;
}

pub const SIM_BCT_MAGIC: &[u8; 4] = b"SBCT";
pub const BCT_HASH_LEN: usize = 16;
pub const BOOTLOADER_SLOTS: usize = 4;
pub const PARAM_INSTANCES: usize = 4;
pub const PARAM_LEN: usize = 16;

const SLOT_LEN: usize = 16 + BCT_HASH_LEN;
const PARAM_TABLE_LEN: usize = 4 + PARAM_INSTANCES * PARAM_LEN;
const BODY_LEN: usize = 12 + BOOTLOADER_SLOTS * SLOT_LEN + 3 * PARAM_TABLE_LEN;

/// Length of a sealed [SimBct]
pub const SIM_BCT_LEN: usize = BCT_HASH_LEN + padded_body_len();

const fn padded_body_len() -> usize {
    BODY_LEN.div_ceil(AES_BLOCK_SIZE) * AES_BLOCK_SIZE
}

/// A list of device parameter sets, only the first `num_valid` of which are in use
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamTable {
    pub num_valid: u32,
    pub instances: [[u8; PARAM_LEN]; PARAM_INSTANCES],
}

impl ParamTable {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.num_valid);
        for instance in &self.instances {
            buf.put_slice(instance);
        }
    }

    fn get(buf: &mut &[u8]) -> Self {
        let num_valid = buf.get_u32_le();
        let mut instances = [[0u8; PARAM_LEN]; PARAM_INSTANCES];
        for instance in instances.iter_mut() {
            buf.copy_to_slice(instance);
        }
        Self {
            num_valid,
            instances,
        }
    }
}

/// Host-side BCT
///
/// Sealed layout: `[hash: 16][body, padded to the AES block size]`, where the hash is the
/// CMAC of the (possibly encrypted) body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimBct {
    pub block_size_log2: u32,
    pub page_size_log2: u32,
    pub slots: Vec<BctFieldSet>,
    pub sdram: ParamTable,
    pub boot_device: ParamTable,
    pub dev_type: ParamTable,
}

impl SimBct {
    pub fn new(block_size_log2: u32, page_size_log2: u32) -> Self {
        Self {
            block_size_log2,
            page_size_log2,
            slots: vec![
                BctFieldSet {
                    hash: vec![0; BCT_HASH_LEN],
                    ..Default::default()
                };
                BOOTLOADER_SLOTS
            ],
            sdram: ParamTable::default(),
            boot_device: ParamTable::default(),
            dev_type: ParamTable::default(),
        }
    }

    fn body(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(padded_body_len());
        buf.put_slice(SIM_BCT_MAGIC);
        buf.put_u32_le(self.block_size_log2);
        buf.put_u32_le(self.page_size_log2);
        for slot in &self.slots {
            buf.put_u32_le(slot.version);
            buf.put_u32_le(slot.length);
            buf.put_u32_le(slot.start_block);
            buf.put_u32_le(slot.start_page);
            let mut hash = [0u8; BCT_HASH_LEN];
            hash[..slot.hash.len()].copy_from_slice(&slot.hash);
            buf.put_slice(&hash);
        }
        self.sdram.put(&mut buf);
        self.boot_device.put(&mut buf);
        self.dev_type.put(&mut buf);
        buf.resize(padded_body_len(), 0);
        buf
    }

    /// The table with a blank hash, as a BCT entry of a blob would carry it
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; BCT_HASH_LEN];
        bytes.extend_from_slice(&self.body());
        bytes
    }

    /// Parse a plaintext table, ignoring its hash
    pub fn parse(bytes: &[u8]) -> anyhow::Result<Self> {
        ensure!(
            bytes.len() >= SIM_BCT_LEN,
            "BCT is {} bytes, expected {SIM_BCT_LEN}",
            bytes.len()
        );
        let mut body = &bytes[BCT_HASH_LEN..SIM_BCT_LEN];

        let mut magic = [0u8; 4];
        body.copy_to_slice(&mut magic);
        if &magic != SIM_BCT_MAGIC {
            bail!("bad BCT magic");
        }

        let block_size_log2 = body.get_u32_le();
        let page_size_log2 = body.get_u32_le();
        let mut slots = Vec::with_capacity(BOOTLOADER_SLOTS);
        for _ in 0..BOOTLOADER_SLOTS {
            let version = body.get_u32_le();
            let length = body.get_u32_le();
            let start_block = body.get_u32_le();
            let start_page = body.get_u32_le();
            let mut hash = vec![0u8; BCT_HASH_LEN];
            body.copy_to_slice(&mut hash);
            slots.push(BctFieldSet {
                version,
                length,
                start_block,
                start_page,
                hash,
            });
        }

        Ok(Self {
            block_size_log2,
            page_size_log2,
            slots,
            sdram: ParamTable::get(&mut body),
            boot_device: ParamTable::get(&mut body),
            dev_type: ParamTable::get(&mut body),
        })
    }

    /// Check and decode a sealed table, as read back from the BCT partition
    pub fn unseal(
        sealed: &[u8],
        mode: FuseMode,
        crypto: &dyn CryptoService,
    ) -> anyhow::Result<Self> {
        ensure!(sealed.len() >= SIM_BCT_LEN, "BCT truncated");
        let mut body = sealed[BCT_HASH_LEN..SIM_BCT_LEN].to_vec();

        let mut mac = crypto.cmac(mode.key_slot())?;
        mac.update(&body);
        ensure!(
            mac.finalize() == sealed[..BCT_HASH_LEN],
            "BCT hash does not match"
        );

        if mode.encrypts() {
            crypto.aes_cbc(
                mode.key_slot(),
                CipherDirection::Decrypt,
                &mut body,
            )?;
        }

        let mut plain = vec![0u8; BCT_HASH_LEN];
        plain.extend(body);
        Self::parse(&plain)
    }

    fn slot_mut(&mut self, slot: usize) -> anyhow::Result<&mut BctFieldSet> {
        self.slots
            .get_mut(slot)
            .ok_or_else(|| anyhow::anyhow!("BCT has no bootloader slot {slot}"))
    }
}

impl BootConfigTable for SimBct {
    fn block_size_log2(&self) -> u32 {
        self.block_size_log2
    }

    fn page_size_log2(&self) -> u32 {
        self.page_size_log2
    }

    fn bootloader_slot(&self, slot: usize) -> anyhow::Result<BctFieldSet> {
        self.slots
            .get(slot)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("BCT has no bootloader slot {slot}"))
    }

    fn set_bootloader_slot(&mut self, slot: usize, fields: &BctFieldSet) -> anyhow::Result<()> {
        ensure!(
            fields.hash.len() <= BCT_HASH_LEN,
            "bootloader hash too long ({} bytes)",
            fields.hash.len()
        );
        let stored = self.slot_mut(slot)?;
        *stored = fields.clone();
        stored.hash.resize(BCT_HASH_LEN, 0);
        Ok(())
    }

    fn absorb_device_params(&mut self, received: &[u8]) -> anyhow::Result<()> {
        let received = Self::parse(received)?;

        // A table without SDRAM parameters keeps none
        self.sdram.instances = received.sdram.instances;
        if self.sdram.num_valid != 0 {
            self.sdram.num_valid = received.sdram.num_valid;
        }
        self.boot_device = received.boot_device;
        self.dev_type = received.dev_type;
        Ok(())
    }

    fn replace(&mut self, received: &[u8]) -> anyhow::Result<()> {
        *self = Self::parse(received)?;
        Ok(())
    }

    fn seal(&self, mode: FuseMode, crypto: &dyn CryptoService) -> anyhow::Result<Vec<u8>> {
        let mut body = self.body().to_vec();
        if mode.encrypts() {
            crypto.aes_cbc(mode.key_slot(), CipherDirection::Encrypt, &mut body)?;
        }

        let mut mac = crypto.cmac(mode.key_slot())?;
        mac.update(&body);
        let mut sealed = mac.finalize();
        sealed.extend(body);
        debug_assert_eq!(sealed.len(), SIM_BCT_LEN);
        Ok(sealed)
    }
}

/// Stride between BCT copies in the BCT partition
pub fn copy_stride(sealed_len: usize, page_size_log2: u32) -> u64 {
    align_up(sealed_len as u64, 1 << page_size_log2)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::SoftCrypto;

    fn sample() -> SimBct {
        let mut bct = SimBct::new(14, 11);
        bct.slots[1] = BctFieldSet {
            version: 3,
            length: 4096,
            start_block: 2,
            start_page: 5,
            hash: vec![0xaa; 16],
        };
        bct.sdram.num_valid = 2;
        bct.sdram.instances[0] = [1; PARAM_LEN];
        bct
    }

    #[test]
    fn test_layout() -> anyhow::Result<()> {
        let bct = sample();
        let bytes = bct.to_bytes();
        assert_eq!(bytes.len(), SIM_BCT_LEN);
        assert_eq!(SIM_BCT_LEN % AES_BLOCK_SIZE, 0);
        assert_eq!(SimBct::parse(&bytes)?, bct);

        assert!(SimBct::parse(&bytes[..100]).is_err());
        let mut bad = bytes.clone();
        bad[BCT_HASH_LEN] = b'X';
        assert!(SimBct::parse(&bad).is_err());
        Ok(())
    }

    #[test]
    fn test_seal() -> anyhow::Result<()> {
        let crypto = SoftCrypto::new([7; 16]);
        let bct = sample();

        for mode in [FuseMode::Preproduction, FuseMode::OdmOpen, FuseMode::OdmSecure] {
            let sealed = bct.seal(mode, &crypto)?;
            assert_eq!(SimBct::unseal(&sealed, mode, &crypto)?, bct);

            let mut tampered = sealed.clone();
            tampered[SIM_BCT_LEN - 1] ^= 1;
            assert!(SimBct::unseal(&tampered, mode, &crypto).is_err());
        }

        // Only the secure mode hides the table
        let open = bct.seal(FuseMode::OdmOpen, &crypto)?;
        assert_eq!(&open[BCT_HASH_LEN..BCT_HASH_LEN + 4], SIM_BCT_MAGIC);
        let secure = bct.seal(FuseMode::OdmSecure, &crypto)?;
        assert_ne!(&secure[BCT_HASH_LEN..BCT_HASH_LEN + 4], SIM_BCT_MAGIC);
        Ok(())
    }

    #[test]
    fn test_absorb() -> anyhow::Result<()> {
        let mut received = SimBct::new(15, 12);
        received.sdram.num_valid = 3;
        received.sdram.instances[2] = [9; PARAM_LEN];
        received.boot_device.num_valid = 1;
        received.dev_type.num_valid = 1;
        received.slots[0].version = 99;

        let mut live = sample();
        live.absorb_device_params(&received.to_bytes())?;
        assert_eq!(live.sdram, received.sdram);
        assert_eq!(live.boot_device.num_valid, 1);
        // Everything else is kept
        assert_eq!(live.block_size_log2, 14);
        assert_eq!(live.slots[0].version, 0);
        assert_eq!(live.slots[1].version, 3);

        let mut unused = SimBct::new(14, 11);
        unused.absorb_device_params(&received.to_bytes())?;
        assert_eq!(unused.sdram.num_valid, 0);
        assert_eq!(unused.sdram.instances[2], [9; PARAM_LEN]);

        live.replace(&received.to_bytes())?;
        assert_eq!(live, received);
        Ok(())
    }

    #[test]
    fn test_slots() -> anyhow::Result<()> {
        let mut bct = SimBct::new(14, 11);
        let fields = BctFieldSet {
            version: 1,
            hash: vec![1; 16],
            ..Default::default()
        };
        bct.set_bootloader_slot(3, &fields)?;
        assert_eq!(bct.bootloader_slot(3)?, fields);
        assert!(bct.set_bootloader_slot(4, &fields).is_err());
        assert!(bct
            .set_bootloader_slot(
                0,
                &BctFieldSet {
                    hash: vec![0; 17],
                    ..Default::default()
                }
            )
            .is_err());
        Ok(())
    }

    #[test]
    fn test_copy_stride() {
        assert_eq!(copy_stride(SIM_BCT_LEN, 11), 2048);
        assert_eq!(copy_stride(4096, 11), 4096);
    }
}
