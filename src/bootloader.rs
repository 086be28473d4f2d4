//! Updating the redundant bootloader copies and the BCT that points at them.
//!
//! The boot ROM tries the bootloader slots in the order the BCT lists them, so a slot is only
//! ever replaced by a newer version, and the BCT record of a slot is updated right after the
//! slot itself has been written.

use std::io::{Read, Seek, SeekFrom, Write};

use anyhow::anyhow;

use crate::bct::{copy_stride, BctFieldSet, BootConfigTable};
use crate::blob::Entry;
use crate::config::{FuseMode, InstallerConfig};
use crate::crypto::{CipherDirection, CryptoService, KeySlot, AES_BLOCK_SIZE};
use crate::error::{try_alloc, Error, Result};
use crate::storage::{OpenMode, PartitionFile, PartitionInfo, Storage};
use crate::util::{align_up, SeekReadExt};

/// One redundant bootloader copy, as the boot ROM sees it
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BootloaderSlot {
    pub partition_id: u32,
    /// Version of the bootloader currently in the slot
    pub version: u32,
}

/// What the boot ROM left behind: the bootloader order and the live BCT
pub struct BootContext {
    /// Bootloader slots, in the order the boot ROM tries them
    pub order: Vec<BootloaderSlot>,
    pub bct_partition_id: u32,
    pub bct: Box<dyn BootConfigTable>,
}

impl BootContext {
    pub fn new(
        order: Vec<BootloaderSlot>,
        bct_partition_id: u32,
        bct: Box<dyn BootConfigTable>,
    ) -> Self {
        Self {
            order,
            bct_partition_id,
            bct,
        }
    }

    /// Refuse an entry unless it is newer than what `slot` currently holds
    pub fn check_version(&self, slot: usize, entry: &Entry) -> Result<()> {
        let current = self
            .order
            .get(slot)
            .ok_or_else(|| anyhow!("no bootloader slot {slot}"))?;

        if entry.version <= current.version {
            return Err(Error::PolicyRejection {
                partition: entry.name.clone(),
                current: current.version,
                offered: entry.version,
            });
        }
        Ok(())
    }

    /// Remember that `slot` now holds `version`
    pub fn record_version(&mut self, slot: usize, version: u32) {
        if let Some(current) = self.order.get_mut(slot) {
            current.version = version;
        }
    }
}

impl std::fmt::Debug for BootContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootContext")
            .field("order", &self.order)
            .field("bct_partition_id", &self.bct_partition_id)
            .finish_non_exhaustive()
    }
}

/// Where a partition starts, as the boot ROM addresses it: (erase block, page within block)
pub fn storage_geometry(
    info: &PartitionInfo,
    block_size_log2: u32,
    page_size_log2: u32,
) -> (u32, u32) {
    let addr = info.start_byte();
    let block_size = 1u64 << block_size_log2;
    let start_block = addr >> block_size_log2;
    let start_page = (addr % block_size) >> page_size_log2;
    (start_block as u32, start_page as u32)
}

/// Turn a bootloader payload into the image the boot ROM expects, and hash it.
///
/// The image is padded to the AES block size. The first padding byte is 0x80. When
/// `pad_page_aligned` is set and the padded length would be a multiple of the page size, one
/// more block of padding is added. Returns (image, hash).
pub fn prepare_bootloader(
    payload: &[u8],
    mode: FuseMode,
    already_encrypted: bool,
    page_size: u64,
    pad_page_aligned: bool,
    crypto: &dyn CryptoService,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let len = payload.len();
    let bulk = len / AES_BLOCK_SIZE * AES_BLOCK_SIZE;
    let mut padded = align_up(len as u64, AES_BLOCK_SIZE as u64) as usize;

    let mut tail = [0u8; 2 * AES_BLOCK_SIZE];
    let mut tail_len = len - bulk;
    tail[..tail_len].copy_from_slice(&payload[bulk..]);
    if pad_page_aligned && padded as u64 % page_size == 0 {
        tail_len += AES_BLOCK_SIZE;
        padded += AES_BLOCK_SIZE;
    }
    tail[tail_len] = 0x80;

    let mut image = try_alloc(padded)?;
    image[..bulk].copy_from_slice(&payload[..bulk]);
    image[bulk..].copy_from_slice(&tail[..padded - bulk]);

    if mode.encrypts() && !already_encrypted {
        crypto.aes_cbc(KeySlot::SecureBootKey, CipherDirection::Encrypt, &mut image)?;
    }

    let mut mac = crypto.cmac(mode.key_slot())?;
    mac.update(&image);
    Ok((image, mac.finalize()))
}

/// Writes bootloaders and BCT updates through to storage
pub struct BootloaderUpdater<'a, S: Storage> {
    storage: &'a S,
    crypto: &'a dyn CryptoService,
    config: &'a InstallerConfig,
}

impl<'a, S: Storage> BootloaderUpdater<'a, S> {
    pub fn new(
        storage: &'a S,
        crypto: &'a dyn CryptoService,
        config: &'a InstallerConfig,
    ) -> Self {
        Self {
            storage,
            crypto,
            config,
        }
    }

    fn read_payload<R: Read + Seek>(&self, blob: &mut R, entry: &Entry) -> Result<Vec<u8>> {
        let mut payload = try_alloc(entry.length as usize)?;
        blob.read_exact_at(entry.blob_offset(), &mut payload)?;
        Ok(payload)
    }

    /// Sign and write a bootloader into `slot`, then record it in the BCT and commit that.
    ///
    /// The caller is responsible for the version check.
    pub fn install_bootloader<R: Read + Seek>(
        &self,
        ctx: &mut BootContext,
        slot: usize,
        entry: &Entry,
        blob: &mut R,
    ) -> Result<()> {
        let target = *ctx
            .order
            .get(slot)
            .ok_or_else(|| anyhow!("no bootloader slot {slot}"))?;
        let name = self
            .storage
            .partition_name(target.partition_id)
            .ok_or_else(|| anyhow!("no partition with id {}", target.partition_id))?;
        log::info!("Updating bootloader slot {slot} ({name}) to version {}", entry.version);

        let payload = self.read_payload(blob, entry)?;
        let (image, hash) = prepare_bootloader(
            &payload,
            self.config.fuse_mode,
            entry.encrypted,
            1 << ctx.bct.page_size_log2(),
            self.config.pad_page_aligned_bootloader,
            self.crypto,
        )?;

        let mut file = self.storage.open(&name, OpenMode::Write)?;
        file.set_write_verify(true)?;
        let written = file.write_all(&image);
        let disabled = file.set_write_verify(false);
        written?;
        disabled?;
        drop(file);

        let info = self.storage.partition_info(target.partition_id)?;
        let (start_block, start_page) =
            storage_geometry(&info, ctx.bct.block_size_log2(), ctx.bct.page_size_log2());
        ctx.bct.set_bootloader_slot(
            slot,
            &BctFieldSet {
                version: entry.version,
                length: image.len() as u32,
                start_block,
                start_page,
                hash,
            },
        )?;

        self.commit_bct(ctx)
    }

    /// Merge a BCT entry into the live table and commit it.
    ///
    /// Secured parts (PKC) take the new table as is; others only take its device parameters.
    pub fn install_bct<R: Read + Seek>(
        &self,
        ctx: &mut BootContext,
        entry: &Entry,
        blob: &mut R,
    ) -> Result<()> {
        let mut received = self.read_payload(blob, entry)?;

        if self.config.fuse_mode.is_pkc() {
            log::info!("Replacing BCT");
            ctx.bct.replace(&received)?;
        } else {
            if entry.encrypted {
                let len = received.len() / AES_BLOCK_SIZE * AES_BLOCK_SIZE;
                self.crypto.aes_cbc(
                    KeySlot::SecureBootKey,
                    CipherDirection::Decrypt,
                    &mut received[..len],
                )?;
            }
            log::info!("Updating BCT device parameters");
            ctx.bct.absorb_device_params(&received)?;
        }

        self.commit_bct(ctx)
    }

    /// Seal the live BCT and write every copy of it to the BCT partition
    pub fn commit_bct(&self, ctx: &BootContext) -> Result<()> {
        let sealed = ctx.bct.seal(self.config.fuse_mode, self.crypto)?;
        let stride = copy_stride(sealed.len(), ctx.bct.page_size_log2());
        let name = self
            .storage
            .partition_name(ctx.bct_partition_id)
            .ok_or_else(|| anyhow!("no partition with id {}", ctx.bct_partition_id))?;

        let mut file = self.storage.open(&name, OpenMode::Write)?;
        file.set_write_verify(true)?;
        let written = (|| -> std::io::Result<()> {
            for copy in 0..u64::from(self.config.bct_copies) {
                file.seek(SeekFrom::Start(copy * stride))?;
                file.write_all(&sealed)?;
            }
            Ok(())
        })();
        let disabled = file.set_write_verify(false);
        written?;
        disabled?;

        log::debug!("Committed {} BCT copies to {name}", self.config.bct_copies);
        Ok(())
    }
}
